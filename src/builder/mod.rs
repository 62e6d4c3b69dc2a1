//! Resource builders for the pipeline components
//!
//! A builder is a pure function from a [`FlowCollectorSpec`] to the
//! descriptors of one component. Builders never read the FlowCollector
//! status and never talk to the cluster; the only outside input they get is
//! an [`AssetSource`] for static files.
//!
//! Typed `k8s-openapi` structs are used for every object so field names are
//! checked at compile time, then converted with [`Desired::new`].

mod agent;
mod console;
mod monitoring;
mod network_policy;
mod processor;

use std::borrow::Cow;
use std::collections::BTreeMap;

use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    MetricSpec, MetricTarget, ResourceMetricSource,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, EnvVar, EnvVarSource, Namespace, ObjectFieldSelector,
    ResourceRequirements as ContainerResources, ServiceAccount, Volume,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde_json::json;

use crate::crd::{AutoscalerSpec, FlowCollectorSpec, ResourceRequirements};
use crate::resource::{Desired, ResourceKind};
use crate::status::Component;
use crate::Result;

pub use agent::AgentBuilder;
pub use console::ConsolePluginBuilder;
pub use monitoring::MonitoringBuilder;
pub use network_policy::NetworkPolicyBuilder;
pub use processor::ProcessorBuilder;

/// Label every managed object carries
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY: &str = "flowmesh";
/// Label naming the pipeline component of an object
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
/// Pod selector label
pub const APP_LABEL: &str = "app";

/// Key of the JSON document in generated config ConfigMaps
pub const CONFIG_KEY: &str = "config.json";

/// Maps a FlowCollector spec to the descriptors of one component
pub trait ResourceBuilder: Send + Sync {
    /// Component whose condition reports this builder's outcome
    fn component(&self) -> Component;

    /// Every kind `build` may emit; the controller watches these
    fn owned_kinds(&self) -> &'static [ResourceKind];

    /// Build every descriptor the component needs for `spec`.
    ///
    /// An empty result is valid (component disabled).
    fn build(&self, spec: &FlowCollectorSpec, assets: &dyn AssetSource) -> Result<Vec<Desired>>;
}

/// Builder for a component
pub fn builder_for(component: Component) -> Box<dyn ResourceBuilder> {
    match component {
        Component::Monitoring => Box::new(MonitoringBuilder),
        Component::Agent => Box::new(AgentBuilder),
        Component::Processor => Box::new(ProcessorBuilder),
        Component::ConsolePlugin => Box::new(ConsolePluginBuilder),
        Component::NetworkPolicy => Box::new(NetworkPolicyBuilder),
    }
}

/// Read-only static files available to builders
pub trait AssetSource: Send + Sync {
    /// Content of the asset at `path`, if it exists
    fn load(&self, path: &str) -> Option<Cow<'static, str>>;
}

/// Health dashboard served to Grafana
pub const HEALTH_DASHBOARD_ASSET: &str = "dashboards/health.json";

/// Assets compiled into the binary
#[derive(Clone, Copy, Debug, Default)]
pub struct EmbeddedAssets;

impl AssetSource for EmbeddedAssets {
    fn load(&self, path: &str) -> Option<Cow<'static, str>> {
        match path {
            HEALTH_DASHBOARD_ASSET => Some(Cow::Borrowed(include_str!(
                "../../assets/dashboards/health.json"
            ))),
            _ => None,
        }
    }
}

// =============================================================================
// Shared object helpers
// =============================================================================

/// Labels shared by an object and the pods it selects
pub(crate) fn app_labels(app: &str, component: Component) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), app.to_string()),
        (COMPONENT_LABEL.to_string(), component.name().to_lowercase()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
    ])
}

pub(crate) fn object_meta(
    name: &str,
    namespace: Option<&str>,
    component: Component,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(app_labels(name, component)),
        ..Default::default()
    }
}

pub(crate) fn selector(app: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(APP_LABEL.to_string(), app.to_string())])),
        ..Default::default()
    }
}

/// Namespace for pipeline pods; privileged ones relax pod security.
///
/// Several components emit the same namespace, so it carries no component label.
pub(crate) fn namespace(name: &str, privileged: bool) -> Result<Desired> {
    let mut labels = BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string())]);
    if privileged {
        for mode in ["enforce", "audit", "warn"] {
            labels.insert(
                format!("pod-security.kubernetes.io/{}", mode),
                "privileged".to_string(),
            );
        }
    }
    Desired::new(&Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    })
}

pub(crate) fn service_account(name: &str, namespace: &str, component: Component) -> Result<Desired> {
    Desired::new(&ServiceAccount {
        metadata: object_meta(name, Some(namespace), component),
        ..Default::default()
    })
}

pub(crate) fn config_map(
    name: &str,
    namespace: &str,
    component: Component,
    data: BTreeMap<String, String>,
) -> Result<Desired> {
    Desired::new(&ConfigMap {
        metadata: object_meta(name, Some(namespace), component),
        data: Some(data),
        ..Default::default()
    })
}

/// Volume mounting a ConfigMap of the same namespace
pub(crate) fn config_volume(volume: &str, config_map: &str) -> Result<Volume> {
    Ok(serde_json::from_value(json!({
        "name": volume,
        "configMap": { "name": config_map },
    }))?)
}

pub(crate) fn container_resources(resources: &ResourceRequirements) -> Option<ContainerResources> {
    let quantities = |m: &BTreeMap<String, String>| {
        (!m.is_empty()).then(|| {
            m.iter()
                .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                .collect()
        })
    };
    let requests = quantities(&resources.requests);
    let limits = quantities(&resources.limits);
    if requests.is_none() && limits.is_none() {
        return None;
    }
    Some(ContainerResources {
        requests,
        limits,
        ..Default::default()
    })
}

pub(crate) fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Env var filled from a pod field, e.g. `status.hostIP`
pub(crate) fn env_from_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// User-supplied env vars, appended after the generated ones
pub(crate) fn extra_env(env: &BTreeMap<String, String>) -> impl Iterator<Item = EnvVar> + '_ {
    env.iter().map(|(k, v)| env_var(k, v.clone()))
}

/// CPU-based autoscaler for a Deployment
pub(crate) fn autoscaler(
    name: &str,
    namespace: &str,
    component: Component,
    spec: &AutoscalerSpec,
) -> Result<Desired> {
    Desired::new(&HorizontalPodAutoscaler {
        metadata: object_meta(name, Some(namespace), component),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: name.to_string(),
            },
            min_replicas: Some(spec.min_replicas),
            max_replicas: spec.max_replicas,
            metrics: Some(vec![MetricSpec {
                type_: "Resource".to_string(),
                resource: Some(ResourceMetricSource {
                    name: "cpu".to_string(),
                    target: MetricTarget {
                        type_: "Utilization".to_string(),
                        average_utilization: Some(spec.target_cpu_utilization),
                        ..Default::default()
                    },
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AgentType, AutoscalerStatus, DeploymentModel};
    use super::test_support::NoAssets;

    #[test]
    fn test_embedded_dashboard_is_valid_json() {
        let raw = EmbeddedAssets.load(HEALTH_DASHBOARD_ASSET).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(parsed["panels"].is_array());
        assert!(EmbeddedAssets.load("missing.json").is_none());
    }

    #[test]
    fn test_builder_for_matches_component() {
        for component in Component::ALL {
            assert_eq!(builder_for(component).component(), component);
        }
    }

    #[test]
    fn test_built_kinds_are_declared() {
        let mut kafka = FlowCollectorSpec::default();
        kafka.deployment_model = DeploymentModel::Kafka;
        kafka.kafka.address = "kafka:9092".to_string();
        kafka.kafka.topic = "flows".to_string();
        kafka.processor.kafka_consumer_autoscaler.status = AutoscalerStatus::Enabled;
        kafka.console_plugin.autoscaler.status = AutoscalerStatus::Enabled;
        kafka.network_policy.enable = true;
        let mut ipfix = FlowCollectorSpec::default();
        ipfix.agent.type_ = AgentType::Ipfix;

        for spec in [FlowCollectorSpec::default(), kafka, ipfix] {
            for component in Component::ALL {
                let builder = builder_for(component);
                for d in builder.build(&spec, &EmbeddedAssets).unwrap() {
                    assert!(
                        builder.owned_kinds().contains(&d.kind),
                        "{} builds undeclared {}",
                        component,
                        d.kind
                    );
                }
            }
        }
        assert!(builder_for(Component::Monitoring)
            .build(&FlowCollectorSpec::default(), &NoAssets)
            .is_err());
    }

    #[test]
    fn test_privileged_namespace_relaxes_pod_security() {
        let ns = namespace("flowmesh-privileged", true).unwrap();
        let labels = ns.object.metadata.labels.unwrap();
        assert_eq!(labels["pod-security.kubernetes.io/enforce"], "privileged");
        assert_eq!(labels[MANAGED_BY_LABEL], MANAGED_BY);

        let plain = namespace("flowmesh", false).unwrap();
        assert_eq!(plain.kind, ResourceKind::Namespace);
        assert!(!plain
            .object
            .metadata
            .labels
            .as_ref()
            .unwrap()
            .contains_key(COMPONENT_LABEL));
        assert!(!plain
            .object
            .metadata
            .labels
            .unwrap()
            .contains_key("pod-security.kubernetes.io/enforce"));
    }

    #[test]
    fn test_empty_resources_are_omitted() {
        assert!(container_resources(&ResourceRequirements::default()).is_none());
        let r = container_resources(&ResourceRequirements::with(&[("cpu", "100m")], &[])).unwrap();
        assert_eq!(r.requests.unwrap()["cpu"], Quantity("100m".to_string()));
        assert!(r.limits.is_none());
    }

    #[test]
    fn test_config_volume_points_at_config_map() {
        let v = config_volume("config", "flowmesh-processor-config").unwrap();
        let value = serde_json::to_value(&v).unwrap();
        assert_eq!(value["configMap"]["name"], "flowmesh-processor-config");
    }
}
