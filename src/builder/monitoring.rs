//! Metrics access and the health dashboard

use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};

use super::{
    config_map, namespace, object_meta, AssetSource, ResourceBuilder, HEALTH_DASHBOARD_ASSET,
};
use crate::crd::FlowCollectorSpec;
use crate::resource::{Desired, ResourceKind};
use crate::status::Component;
use crate::{Error, Result};

/// ClusterRole granting read access to pipeline metrics
pub const METRICS_READER_NAME: &str = "flowmesh-metrics-reader";
/// ConfigMap picked up by the Grafana dashboard sidecar
pub const HEALTH_DASHBOARD_NAME: &str = "flowmesh-health-dashboard";

const DASHBOARD_LABEL: &str = "grafana_dashboard";
const PROMETHEUS_SERVICE_ACCOUNT: &str = "prometheus-k8s";
const PROMETHEUS_NAMESPACE: &str = "monitoring";

/// Builds monitoring resources; nothing when disabled
pub struct MonitoringBuilder;

impl ResourceBuilder for MonitoringBuilder {
    fn component(&self) -> Component {
        Component::Monitoring
    }

    fn owned_kinds(&self) -> &'static [ResourceKind] {
        &[
            ResourceKind::Namespace,
            ResourceKind::ClusterRole,
            ResourceKind::ClusterRoleBinding,
            ResourceKind::ConfigMap,
        ]
    }

    fn build(&self, spec: &FlowCollectorSpec, assets: &dyn AssetSource) -> Result<Vec<Desired>> {
        if !spec.monitoring.enable {
            return Ok(Vec::new());
        }
        let c = Component::Monitoring;

        let dashboard = assets.load(HEALTH_DASHBOARD_ASSET).ok_or_else(|| {
            Error::build(
                c.name(),
                format!("asset {} is missing", HEALTH_DASHBOARD_ASSET),
            )
        })?;
        let dashboard_ns = spec
            .monitoring
            .dashboard_namespace
            .as_deref()
            .unwrap_or(&spec.namespace);

        let mut dashboard = config_map(
            HEALTH_DASHBOARD_NAME,
            dashboard_ns,
            c,
            BTreeMap::from([("flowmesh-health.json".to_string(), dashboard.into_owned())]),
        )?;
        dashboard
            .object
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(DASHBOARD_LABEL.to_string(), "1".to_string());

        Ok(vec![
            namespace(&spec.namespace, false)?,
            Desired::new(&ClusterRole {
                metadata: object_meta(METRICS_READER_NAME, None, c),
                rules: Some(vec![PolicyRule {
                    non_resource_urls: Some(vec!["/metrics".to_string()]),
                    verbs: vec!["get".to_string()],
                    ..Default::default()
                }]),
                ..Default::default()
            })?,
            Desired::new(&ClusterRoleBinding {
                metadata: object_meta(METRICS_READER_NAME, None, c),
                role_ref: RoleRef {
                    api_group: "rbac.authorization.k8s.io".to_string(),
                    kind: "ClusterRole".to_string(),
                    name: METRICS_READER_NAME.to_string(),
                },
                subjects: Some(vec![Subject {
                    kind: "ServiceAccount".to_string(),
                    name: PROMETHEUS_SERVICE_ACCOUNT.to_string(),
                    namespace: Some(PROMETHEUS_NAMESPACE.to_string()),
                    ..Default::default()
                }]),
            })?,
            dashboard,
        ])
    }
}
