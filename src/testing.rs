//! In-memory fakes for the cluster seams
//!
//! `InMemoryStore` behaves like the API server where it matters here:
//! resourceVersion checks on update, uid and clusterIP assignment on create,
//! a little server-side defaulting, and clusterIP immutability.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::ResourceExt;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::client::{CollectorClient, ResourceStore};
use crate::crd::{FlowCollector, FlowCollectorSpec, FlowCollectorStatus};
use crate::error::api_error;
use crate::resource::ResourceKind;
use crate::Result;

type Key = (ResourceKind, Option<String>, String);

#[derive(Default)]
pub(crate) struct InMemoryStore {
    objects: Mutex<BTreeMap<Key, DynamicObject>>,
    version: AtomicU64,
    gets: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    get_failures: Mutex<VecDeque<u16>>,
    update_failures: Mutex<VecDeque<u16>>,
    racing_updates: AtomicUsize,
}

impl InMemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn key(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Key {
        let ns = if kind.is_namespaced() {
            namespace.map(str::to_string)
        } else {
            None
        };
        (kind, ns, name.to_string())
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Seed a live object as if another actor created it
    pub(crate) fn insert(&self, kind: ResourceKind, mut obj: DynamicObject) {
        let name = obj.name_any();
        obj.metadata.resource_version = Some(self.next_version());
        obj.metadata.uid.get_or_insert_with(|| format!("uid-{name}"));
        let key = Self::key(kind, obj.metadata.namespace.as_deref(), &name);
        self.objects.lock().insert(key, obj);
    }

    pub(crate) fn object(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        self.objects
            .lock()
            .get(&Self::key(kind, namespace, name))
            .cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub(crate) fn writes(&self) -> usize {
        self.creates() + self.updates()
    }

    pub(crate) fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub(crate) fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub(crate) fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Make the next gets fail with the given status codes
    pub(crate) fn fail_gets(&self, codes: &[u16]) {
        self.get_failures.lock().extend(codes);
    }

    /// Make the next updates fail with the given status codes
    pub(crate) fn fail_updates(&self, codes: &[u16]) {
        self.update_failures.lock().extend(codes);
    }

    /// Another writer modifies the object right before each of the next `n`
    /// updates, so they lose the resourceVersion race
    pub(crate) fn race_next_updates(&self, n: usize) {
        self.racing_updates.store(n, Ordering::SeqCst);
    }

    fn take_racing_update(&self) -> bool {
        self.racing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Defaults the API server adds on write
fn apply_server_defaults(kind: ResourceKind, obj: &mut DynamicObject, cluster_ip: &str) {
    let data = &mut obj.data;
    match kind {
        ResourceKind::Service => {
            if let Some(spec) = data.get_mut("spec").and_then(Value::as_object_mut) {
                spec.entry("type").or_insert_with(|| json!("ClusterIP"));
                spec.entry("clusterIP").or_insert_with(|| json!(cluster_ip));
                let ip = spec["clusterIP"].clone();
                spec.entry("clusterIPs").or_insert_with(|| json!([ip]));
                if let Some(ports) = spec.get_mut("ports").and_then(Value::as_array_mut) {
                    for port in ports.iter_mut().filter_map(Value::as_object_mut) {
                        let target = port.get("port").cloned().unwrap_or(Value::Null);
                        port.entry("targetPort").or_insert(target);
                    }
                }
            }
        }
        ResourceKind::Deployment | ResourceKind::DaemonSet => {
            if let Some(spec) = data.get_mut("spec").and_then(Value::as_object_mut) {
                spec.entry("revisionHistoryLimit").or_insert_with(|| json!(10));
            }
            if let Some(containers) = data
                .pointer_mut("/spec/template/spec/containers")
                .and_then(Value::as_array_mut)
            {
                for c in containers.iter_mut().filter_map(Value::as_object_mut) {
                    c.entry("terminationMessagePath")
                        .or_insert_with(|| json!("/dev/termination-log"));
                }
            }
        }
        _ => {}
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = self.get_failures.lock().pop_front() {
            return Err(api_error(code));
        }
        Ok(self.object(kind, namespace, name))
    }

    async fn create(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = Self::key(kind, obj.metadata.namespace.as_deref(), &obj.name_any());
        let mut objects = self.objects.lock();
        if objects.contains_key(&key) {
            return Err(api_error(409));
        }
        self.creates.fetch_add(1, Ordering::SeqCst);

        let mut created = obj.clone();
        created.metadata.resource_version = Some(self.next_version());
        created.metadata.uid = Some(format!("uid-{}", created.name_any()));
        let ip = format!("10.96.0.{}", objects.len() + 1);
        apply_server_defaults(kind, &mut created, &ip);
        objects.insert(key, created.clone());
        Ok(created)
    }

    async fn update(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        if let Some(code) = self.update_failures.lock().pop_front() {
            return Err(api_error(code));
        }
        let key = Self::key(kind, obj.metadata.namespace.as_deref(), &obj.name_any());
        let racing = self.take_racing_update();
        let mut objects = self.objects.lock();
        let Some(stored) = objects.get_mut(&key) else {
            return Err(api_error(404));
        };

        if racing {
            stored
                .annotations_mut()
                .insert("other-actor/touched".to_string(), "true".to_string());
            stored.metadata.resource_version = Some(self.next_version());
        }
        if stored.metadata.resource_version != obj.metadata.resource_version {
            return Err(api_error(409));
        }
        if kind == ResourceKind::Service {
            let before = stored.data.pointer("/spec/clusterIP");
            let after = obj.data.pointer("/spec/clusterIP");
            if before.is_some() && before != after {
                return Err(api_error(422));
            }
        }
        self.updates.fetch_add(1, Ordering::SeqCst);

        let mut updated = obj.clone();
        updated.metadata.uid = stored.metadata.uid.clone();
        updated.metadata.resource_version = Some(self.next_version());
        apply_server_defaults(kind, &mut updated, "");
        *stored = updated.clone();
        Ok(updated)
    }
}

/// FlowCollector store counting status writes
#[derive(Default)]
pub(crate) struct InMemoryCollectors {
    collectors: Mutex<BTreeMap<String, FlowCollector>>,
    status_writes: AtomicUsize,
}

impl InMemoryCollectors {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn put(&self, collector: FlowCollector) {
        self.collectors
            .lock()
            .insert(collector.name_any(), collector);
    }

    pub(crate) fn remove(&self, name: &str) {
        self.collectors.lock().remove(name);
    }

    pub(crate) fn status(&self, name: &str) -> Option<FlowCollectorStatus> {
        self.collectors
            .lock()
            .get(name)
            .and_then(|c| c.status.clone())
    }

    pub(crate) fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CollectorClient for InMemoryCollectors {
    async fn get(&self, name: &str) -> Result<Option<FlowCollector>> {
        Ok(self.collectors.lock().get(name).cloned())
    }

    async fn patch_status(&self, name: &str, status: &FlowCollectorStatus) -> Result<()> {
        let mut collectors = self.collectors.lock();
        let Some(collector) = collectors.get_mut(name) else {
            return Err(api_error(404));
        };
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        collector.status = Some(status.clone());
        Ok(())
    }
}

/// A FlowCollector as the API server would return it
pub(crate) fn collector(name: &str, spec: FlowCollectorSpec) -> FlowCollector {
    let mut fc = FlowCollector::new(name, spec);
    fc.metadata = ObjectMeta {
        name: Some(name.to_string()),
        uid: Some(format!("uid-{name}")),
        resource_version: Some("1".to_string()),
        generation: Some(1),
        ..Default::default()
    };
    fc
}
