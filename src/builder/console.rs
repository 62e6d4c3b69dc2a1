//! Console plugin serving the flow UI

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::json;

use super::{
    app_labels, autoscaler, config_map, config_volume, container_resources, namespace,
    object_meta, selector, service_account, AssetSource, ResourceBuilder, APP_LABEL, CONFIG_KEY,
};
use crate::crd::FlowCollectorSpec;
use crate::fingerprint::canonical_document;
use crate::resource::{Desired, ResourceKind};
use crate::status::Component;
use crate::Result;

/// Name of the plugin Deployment, ServiceAccount and Service
pub const CONSOLE_PLUGIN_NAME: &str = "flowmesh-console-plugin";
/// ConfigMap holding the plugin configuration document
pub const CONSOLE_PLUGIN_CONFIG_NAME: &str = "flowmesh-console-plugin-config";

const CONFIG_MOUNT_PATH: &str = "/etc/flowmesh/plugin";

/// Builds the console plugin; nothing when disabled
pub struct ConsolePluginBuilder;

impl ResourceBuilder for ConsolePluginBuilder {
    fn component(&self) -> Component {
        Component::ConsolePlugin
    }

    fn owned_kinds(&self) -> &'static [ResourceKind] {
        &[
            ResourceKind::Namespace,
            ResourceKind::ServiceAccount,
            ResourceKind::ConfigMap,
            ResourceKind::Service,
            ResourceKind::Deployment,
            ResourceKind::HorizontalPodAutoscaler,
        ]
    }

    fn build(&self, spec: &FlowCollectorSpec, _assets: &dyn AssetSource) -> Result<Vec<Desired>> {
        let plugin = &spec.console_plugin;
        if !plugin.enable {
            return Ok(Vec::new());
        }
        let ns = spec.namespace.as_str();
        let c = Component::ConsolePlugin;

        let config = canonical_document(&json!({
            "port": plugin.port,
            "logLevel": plugin.log_level.to_string(),
            "loki": {
                "url": spec.loki.querier(),
                "tenantId": spec.loki.tenant_id,
                "timeout": spec.loki.timeout,
            },
            "portNaming": {
                "enable": plugin.port_naming.enable,
                "portNames": plugin.port_naming.port_names,
            },
        }))?;

        let mut out = vec![
            namespace(ns, false)?,
            service_account(CONSOLE_PLUGIN_NAME, ns, c)?,
            config_map(
                CONSOLE_PLUGIN_CONFIG_NAME,
                ns,
                c,
                BTreeMap::from([(CONFIG_KEY.to_string(), config)]),
            )?,
            Self::deployment(spec)?.consuming_config(CONSOLE_PLUGIN_CONFIG_NAME),
            Self::service(spec)?,
        ];
        if plugin.autoscaler.enabled() {
            out.push(autoscaler(CONSOLE_PLUGIN_NAME, ns, c, &plugin.autoscaler)?);
        }
        Ok(out)
    }
}

impl ConsolePluginBuilder {
    fn deployment(spec: &FlowCollectorSpec) -> Result<Desired> {
        let plugin = &spec.console_plugin;
        let replicas = (!plugin.autoscaler.enabled()).then_some(plugin.replicas);

        Desired::new(&Deployment {
            metadata: object_meta(
                CONSOLE_PLUGIN_NAME,
                Some(&spec.namespace),
                Component::ConsolePlugin,
            ),
            spec: Some(DeploymentSpec {
                replicas,
                selector: selector(CONSOLE_PLUGIN_NAME),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(app_labels(CONSOLE_PLUGIN_NAME, Component::ConsolePlugin)),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(CONSOLE_PLUGIN_NAME.to_string()),
                        containers: vec![Container {
                            name: CONSOLE_PLUGIN_NAME.to_string(),
                            image: Some(plugin.image.clone()),
                            image_pull_policy: Some(plugin.image_pull_policy.as_str().to_string()),
                            args: Some(vec![format!(
                                "-config={}/{}",
                                CONFIG_MOUNT_PATH, CONFIG_KEY
                            )]),
                            ports: Some(vec![ContainerPort {
                                name: Some("http".to_string()),
                                container_port: plugin.port,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            }]),
                            resources: container_resources(&plugin.resources),
                            volume_mounts: Some(vec![VolumeMount {
                                name: "config".to_string(),
                                mount_path: CONFIG_MOUNT_PATH.to_string(),
                                read_only: Some(true),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        volumes: Some(vec![config_volume("config", CONSOLE_PLUGIN_CONFIG_NAME)?]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn service(spec: &FlowCollectorSpec) -> Result<Desired> {
        let port = spec.console_plugin.port;
        Desired::new(&Service {
            metadata: object_meta(
                CONSOLE_PLUGIN_NAME,
                Some(&spec.namespace),
                Component::ConsolePlugin,
            ),
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([(
                    APP_LABEL.to_string(),
                    CONSOLE_PLUGIN_NAME.to_string(),
                )])),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}
