//! Resource kinds managed by the operator and the descriptors builders emit
//!
//! Everything is carried as a `DynamicObject` once built. The typed
//! `k8s-openapi` structs are only used by builders to get field names right.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ApiResource, DynamicObject};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::Value;

use crate::{Error, Result};

/// Closed set of kinds the operator writes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// core/v1 Namespace
    Namespace,
    /// core/v1 ServiceAccount
    ServiceAccount,
    /// rbac/v1 ClusterRole
    ClusterRole,
    /// rbac/v1 ClusterRoleBinding
    ClusterRoleBinding,
    /// core/v1 ConfigMap
    ConfigMap,
    /// core/v1 Service
    Service,
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 DaemonSet
    DaemonSet,
    /// autoscaling/v2 HorizontalPodAutoscaler
    HorizontalPodAutoscaler,
    /// networking/v1 NetworkPolicy
    NetworkPolicy,
}

impl ResourceKind {
    /// Every kind, in apply order
    pub const ALL: [ResourceKind; 10] = [
        ResourceKind::Namespace,
        ResourceKind::ServiceAccount,
        ResourceKind::ClusterRole,
        ResourceKind::ClusterRoleBinding,
        ResourceKind::ConfigMap,
        ResourceKind::Service,
        ResourceKind::Deployment,
        ResourceKind::DaemonSet,
        ResourceKind::HorizontalPodAutoscaler,
        ResourceKind::NetworkPolicy,
    ];

    /// API coordinates for dynamic access
    pub fn api_resource(&self) -> ApiResource {
        match self {
            Self::Namespace => ApiResource::erase::<Namespace>(&()),
            Self::ServiceAccount => ApiResource::erase::<ServiceAccount>(&()),
            Self::ClusterRole => ApiResource::erase::<ClusterRole>(&()),
            Self::ClusterRoleBinding => ApiResource::erase::<ClusterRoleBinding>(&()),
            Self::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            Self::Service => ApiResource::erase::<Service>(&()),
            Self::Deployment => ApiResource::erase::<Deployment>(&()),
            Self::DaemonSet => ApiResource::erase::<DaemonSet>(&()),
            Self::HorizontalPodAutoscaler => ApiResource::erase::<HorizontalPodAutoscaler>(&()),
            Self::NetworkPolicy => ApiResource::erase::<NetworkPolicy>(&()),
        }
    }

    /// Kind name as the API server spells it
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Namespace => "Namespace",
            Self::ServiceAccount => "ServiceAccount",
            Self::ClusterRole => "ClusterRole",
            Self::ClusterRoleBinding => "ClusterRoleBinding",
            Self::ConfigMap => "ConfigMap",
            Self::Service => "Service",
            Self::Deployment => "Deployment",
            Self::DaemonSet => "DaemonSet",
            Self::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
            Self::NetworkPolicy => "NetworkPolicy",
        }
    }

    /// Whether objects of this kind live in a namespace
    pub fn is_namespaced(&self) -> bool {
        !matches!(
            self,
            Self::Namespace | Self::ClusterRole | Self::ClusterRoleBinding
        )
    }

    /// Apply priority; lower goes first.
    ///
    /// Namespaces before anything in them, identities and RBAC before the
    /// pods that use them, config before workloads that mount it, and
    /// autoscalers after the Deployment they target.
    pub fn apply_order(&self) -> u8 {
        match self {
            Self::Namespace => 0,
            Self::ServiceAccount => 1,
            Self::ClusterRole => 2,
            Self::ClusterRoleBinding => 3,
            Self::ConfigMap => 4,
            Self::Service => 5,
            Self::Deployment | Self::DaemonSet => 6,
            Self::HorizontalPodAutoscaler => 7,
            Self::NetworkPolicy => 8,
        }
    }

    /// Find the kind matching an apiVersion and kind pair
    pub fn from_type(api_version: &str, kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| {
            let ar = k.api_resource();
            ar.api_version == api_version && ar.kind == kind
        })
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One target resource produced by a builder for the current pass
#[derive(Clone, Debug)]
pub struct Desired {
    /// Kind of the resource
    pub kind: ResourceKind,
    /// Full target object; `data` holds everything but metadata
    pub object: DynamicObject,
    /// ConfigMap (same namespace) whose content is stamped on this
    /// resource's pod template
    pub config_source: Option<String>,
}

impl Desired {
    /// Convert a typed object into a descriptor
    pub fn new<K>(obj: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let kind = ResourceKind::from_type(&K::api_version(&()), &K::kind(&())).ok_or_else(
            || Error::build("descriptor", format!("{} is not a managed kind", K::kind(&()))),
        )?;

        let mut value = serde_json::to_value(obj)
            .map_err(|e| Error::serialization_for_kind(kind.as_str(), e.to_string()))?;
        // typed structs leave these unset
        if let Some(map) = value.as_object_mut() {
            map.insert("apiVersion".to_string(), Value::String(K::api_version(&()).into()));
            map.insert("kind".to_string(), Value::String(K::kind(&()).into()));
        }
        let object: DynamicObject = serde_json::from_value(value)
            .map_err(|e| Error::serialization_for_kind(kind.as_str(), e.to_string()))?;

        if object.metadata.name.as_deref().unwrap_or_default().is_empty() {
            return Err(Error::build(
                "descriptor",
                format!("{} descriptor has no name", kind),
            ));
        }
        if kind.is_namespaced() && object.metadata.namespace.is_none() {
            return Err(Error::build(
                "descriptor",
                format!("{} {} has no namespace", kind, object.name_any()),
            ));
        }

        Ok(Self {
            kind,
            object,
            config_source: None,
        })
    }

    /// Mark this workload as consuming the named ConfigMap
    pub fn consuming_config(mut self, config_map: impl Into<String>) -> Self {
        self.config_source = Some(config_map.into());
        self
    }

    /// Object name
    pub fn name(&self) -> String {
        self.object.name_any()
    }

    /// Object namespace, `None` for cluster-scoped kinds
    pub fn namespace(&self) -> Option<&str> {
        self.object.metadata.namespace.as_deref()
    }

    /// `namespace/name` or `name`, for logs and errors
    pub fn key(&self) -> String {
        match self.namespace() {
            Some(ns) => format!("{}/{}", ns, self.name()),
            None => self.name(),
        }
    }

    /// Add an owner reference unless one with the same uid is present
    pub fn set_owner(&mut self, owner: OwnerReference) {
        let refs = self
            .object
            .metadata
            .owner_references
            .get_or_insert_with(Vec::new);
        if !refs.iter().any(|r| r.uid == owner.uid) {
            refs.push(owner);
        }
    }

    /// `data` map of a ConfigMap descriptor
    pub fn config_data(&self) -> Option<&Value> {
        match self.kind {
            ResourceKind::ConfigMap => self.object.data.get("data"),
            _ => None,
        }
    }
}

/// Sort descriptors into apply order, keeping builder order within a kind
pub fn sort_for_apply(desired: &mut [Desired]) {
    desired.sort_by_key(|d| d.kind.apply_order());
}
