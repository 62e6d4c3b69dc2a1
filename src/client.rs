//! Cluster access used by the reconciliation core
//!
//! Both traits are thin so tests can swap in fakes: [`ResourceStore`] is the
//! generic keyed store of managed resources, [`CollectorClient`] reads
//! FlowCollectors and writes their status sub-resource.

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::crd::{FlowCollector, FlowCollectorStatus};
use crate::resource::ResourceKind;
use crate::{Error, Result};

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "flowmesh-controller";

/// Keyed store of managed resources.
///
/// `update` is optimistic: the object must carry the resourceVersion it was
/// read at, and a concurrent change makes it fail with a 409.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch by kind, namespace and name; `Ok(None)` when absent
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Create a new object
    async fn create(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an existing object
    async fn update(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject>;
}

/// [`ResourceStore`] over the Kubernetes API
#[derive(Clone)]
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) if kind.is_namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
        }
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.api(kind, namespace).get_opt(name).await?)
    }

    async fn create(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let api = self.api(kind, obj.metadata.namespace.as_deref());
        let created = api.create(&Self::post_params(), obj).await?;
        debug!(kind = %kind, name = %created.name_any(), "created");
        Ok(created)
    }

    async fn update(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let api = self.api(kind, obj.metadata.namespace.as_deref());
        let name = obj.name_any();
        let updated = api.replace(&name, &Self::post_params(), obj).await?;
        debug!(
            kind = %kind,
            name = %name,
            resource_version = ?updated.metadata.resource_version,
            "updated"
        );
        Ok(updated)
    }
}

/// Access to FlowCollector objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CollectorClient: Send + Sync {
    /// Fetch a FlowCollector; `Ok(None)` once it is deleted
    async fn get(&self, name: &str) -> Result<Option<FlowCollector>>;

    /// Write the status sub-resource
    async fn patch_status(&self, name: &str, status: &FlowCollectorStatus) -> Result<()>;
}

/// [`CollectorClient`] over the Kubernetes API
#[derive(Clone)]
pub struct KubeCollectorClient {
    client: Client,
}

impl KubeCollectorClient {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CollectorClient for KubeCollectorClient {
    async fn get(&self, name: &str) -> Result<Option<FlowCollector>> {
        let api: Api<FlowCollector> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn patch_status(&self, name: &str, status: &FlowCollectorStatus) -> Result<()> {
        let api: Api<FlowCollector> = Api::all(self.client.clone());
        let status_patch = serde_json::json!({ "status": status });
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.patch_status(name, &params, &Patch::Merge(&status_patch))
            .await
            .map_err(Error::from)?;
        Ok(())
    }
}
