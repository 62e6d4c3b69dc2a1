//! Flow processor
//!
//! In the DIRECT model the processor runs next to every agent as a
//! host-network DaemonSet. In the KAFKA model it is a Deployment consuming
//! the topic, optionally autoscaled. Both mount the same fingerprinted
//! config ConfigMap.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, Service,
    ServicePort, ServiceSpec, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::{json, Value};

use super::{
    app_labels, autoscaler, config_map, config_volume, container_resources, env_var, extra_env,
    namespace, object_meta, selector, service_account, AssetSource, ResourceBuilder, APP_LABEL,
    CONFIG_KEY,
};
use crate::crd::FlowCollectorSpec;
use crate::fingerprint::canonical_document;
use crate::resource::{Desired, ResourceKind};
use crate::status::Component;
use crate::Result;

/// Name of the processor workload, ServiceAccount and Service
pub const PROCESSOR_NAME: &str = "flowmesh-processor";
/// ConfigMap holding the processor configuration document
pub const PROCESSOR_CONFIG_NAME: &str = "flowmesh-processor-config";

const CONFIG_VOLUME: &str = "config";
const CONFIG_MOUNT_PATH: &str = "/etc/flowmesh/config";

/// Builds the processor side of the pipeline
pub struct ProcessorBuilder;

impl ResourceBuilder for ProcessorBuilder {
    fn component(&self) -> Component {
        Component::Processor
    }

    fn owned_kinds(&self) -> &'static [ResourceKind] {
        &[
            ResourceKind::Namespace,
            ResourceKind::ServiceAccount,
            ResourceKind::ClusterRole,
            ResourceKind::ClusterRoleBinding,
            ResourceKind::ConfigMap,
            ResourceKind::Service,
            ResourceKind::Deployment,
            ResourceKind::DaemonSet,
            ResourceKind::HorizontalPodAutoscaler,
        ]
    }

    fn build(&self, spec: &FlowCollectorSpec, _assets: &dyn AssetSource) -> Result<Vec<Desired>> {
        let ns = spec.namespace.as_str();
        let c = Component::Processor;

        let config = canonical_document(&Self::config_document(spec))?;
        let mut out = vec![
            namespace(ns, false)?,
            service_account(PROCESSOR_NAME, ns, c)?,
            Self::cluster_role()?,
            Self::cluster_role_binding(ns)?,
            config_map(
                PROCESSOR_CONFIG_NAME,
                ns,
                c,
                BTreeMap::from([(CONFIG_KEY.to_string(), config)]),
            )?,
        ];

        let workload = if spec.use_kafka() {
            Self::deployment(spec)?
        } else {
            Self::daemon_set(spec)?
        };
        out.push(workload.consuming_config(PROCESSOR_CONFIG_NAME));
        out.push(Self::metrics_service(spec)?);

        let hpa = &spec.processor.kafka_consumer_autoscaler;
        if spec.use_kafka() && hpa.enabled() {
            out.push(autoscaler(PROCESSOR_NAME, ns, c, hpa)?);
        }
        Ok(out)
    }
}

impl ProcessorBuilder {
    /// Document the processor reads from its config volume
    fn config_document(spec: &FlowCollectorSpec) -> Value {
        let p = &spec.processor;
        let ingest = if spec.use_kafka() {
            json!({
                "type": "kafka",
                "brokers": [spec.kafka.address],
                "topic": spec.kafka.topic,
                "groupId": PROCESSOR_NAME,
            })
        } else if spec.use_ebpf() {
            json!({ "type": "grpc", "port": p.port })
        } else {
            json!({ "type": "ipfix", "port": p.port })
        };
        let loki = &spec.loki;
        json!({
            "logLevel": p.log_level.to_string(),
            "health": { "port": p.health_port },
            "ingest": ingest,
            "transform": {
                "kubernetesEnrichment": true,
                "dropUnusedFields": p.drop_unused_fields,
            },
            "write": {
                "type": "loki",
                "url": loki.url,
                "tenantId": loki.tenant_id,
                "batchWait": loki.batch_wait,
                "batchSize": loki.batch_size,
                "timeout": loki.timeout,
                "minBackoff": loki.min_backoff,
                "maxBackoff": loki.max_backoff,
                "maxRetries": loki.max_retries,
                "staticLabels": loki.static_labels,
            },
            "metrics": {
                "port": p.metrics.port,
                "ignoreTags": p.metrics.ignore_tags,
            },
        })
    }

    fn cluster_role() -> Result<Desired> {
        let read = |api_group: &str, resources: &[&str]| PolicyRule {
            api_groups: Some(vec![api_group.to_string()]),
            resources: Some(resources.iter().map(|r| r.to_string()).collect()),
            verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
            ..Default::default()
        };
        Desired::new(&ClusterRole {
            metadata: object_meta(PROCESSOR_NAME, None, Component::Processor),
            rules: Some(vec![
                read("", &["pods", "services", "nodes"]),
                read("apps", &["replicasets"]),
            ]),
            ..Default::default()
        })
    }

    fn cluster_role_binding(ns: &str) -> Result<Desired> {
        Desired::new(&ClusterRoleBinding {
            metadata: object_meta(PROCESSOR_NAME, None, Component::Processor),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: PROCESSOR_NAME.to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: PROCESSOR_NAME.to_string(),
                namespace: Some(ns.to_string()),
                ..Default::default()
            }]),
        })
    }

    fn pod_template(spec: &FlowCollectorSpec, host_network: bool) -> Result<PodTemplateSpec> {
        let p = &spec.processor;

        let mut ports = vec![
            ContainerPort {
                name: Some("metrics".to_string()),
                container_port: p.metrics.port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                name: Some("health".to_string()),
                container_port: p.health_port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ];
        if host_network {
            // agents on the node send here
            ports.push(ContainerPort {
                name: Some("flows".to_string()),
                container_port: p.port,
                host_port: Some(p.port),
                protocol: Some(if spec.use_ebpf() { "TCP" } else { "UDP" }.to_string()),
                ..Default::default()
            });
        }

        let probe = |path: &str| Probe {
            http_get: Some(HTTPGetAction {
                path: Some(path.to_string()),
                port: IntOrString::Int(p.health_port),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut env = vec![env_var(
            "CONFIG_PATH",
            format!("{}/{}", CONFIG_MOUNT_PATH, CONFIG_KEY),
        )];
        env.extend(extra_env(&p.env));

        Ok(PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(app_labels(PROCESSOR_NAME, Component::Processor)),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                service_account_name: Some(PROCESSOR_NAME.to_string()),
                host_network: host_network.then_some(true),
                dns_policy: host_network.then(|| "ClusterFirstWithHostNet".to_string()),
                containers: vec![Container {
                    name: PROCESSOR_NAME.to_string(),
                    image: Some(p.image.clone()),
                    image_pull_policy: Some(p.image_pull_policy.as_str().to_string()),
                    env: Some(env),
                    ports: Some(ports),
                    resources: container_resources(&p.resources),
                    liveness_probe: p.enable_kube_probes.then(|| probe("/live")),
                    readiness_probe: p.enable_kube_probes.then(|| probe("/ready")),
                    volume_mounts: Some(vec![VolumeMount {
                        name: CONFIG_VOLUME.to_string(),
                        mount_path: CONFIG_MOUNT_PATH.to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                volumes: Some(vec![config_volume(CONFIG_VOLUME, PROCESSOR_CONFIG_NAME)?]),
                ..Default::default()
            }),
        })
    }

    fn daemon_set(spec: &FlowCollectorSpec) -> Result<Desired> {
        Desired::new(&DaemonSet {
            metadata: object_meta(
                PROCESSOR_NAME,
                Some(&spec.namespace),
                Component::Processor,
            ),
            spec: Some(DaemonSetSpec {
                selector: selector(PROCESSOR_NAME),
                template: Self::pod_template(spec, true)?,
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn deployment(spec: &FlowCollectorSpec) -> Result<Desired> {
        let p = &spec.processor;
        // the autoscaler owns replicas when enabled
        let replicas =
            (!p.kafka_consumer_autoscaler.enabled()).then_some(p.kafka_consumer_replicas);
        Desired::new(&Deployment {
            metadata: object_meta(
                PROCESSOR_NAME,
                Some(&spec.namespace),
                Component::Processor,
            ),
            spec: Some(DeploymentSpec {
                replicas,
                selector: selector(PROCESSOR_NAME),
                template: Self::pod_template(spec, false)?,
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn metrics_service(spec: &FlowCollectorSpec) -> Result<Desired> {
        let port = spec.processor.metrics.port;
        let mut ports = vec![ServicePort {
            name: Some("metrics".to_string()),
            port,
            target_port: Some(IntOrString::Int(port)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }];
        if !spec.use_ebpf() && !spec.use_kafka() {
            // IPFIX exporters reach the processor through the Service
            ports.push(ServicePort {
                name: Some("ipfix".to_string()),
                port: spec.processor.port,
                target_port: Some(IntOrString::Int(spec.processor.port)),
                protocol: Some("UDP".to_string()),
                ..Default::default()
            });
        }
        Desired::new(&Service {
            metadata: object_meta(
                PROCESSOR_NAME,
                Some(&spec.namespace),
                Component::Processor,
            ),
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([(
                    APP_LABEL.to_string(),
                    PROCESSOR_NAME.to_string(),
                )])),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::test_support::{env, find, kinds, NoAssets};
    use crate::crd::{AgentType, AutoscalerStatus, DeploymentModel};

    fn kafka_spec() -> FlowCollectorSpec {
        let mut spec = FlowCollectorSpec::default();
        spec.deployment_model = DeploymentModel::Kafka;
        spec.kafka.address = "kafka:9092".to_string();
        spec.kafka.topic = "flows".to_string();
        spec
    }

    fn config(out: &[Desired]) -> Value {
        let cm = find(out, ResourceKind::ConfigMap, PROCESSOR_CONFIG_NAME);
        let raw = cm.config_data().unwrap()[CONFIG_KEY].as_str().unwrap();
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_direct_model_uses_host_network_daemon_set() {
        let out = ProcessorBuilder
            .build(&FlowCollectorSpec::default(), &NoAssets)
            .unwrap();
        assert_eq!(
            kinds(&out),
            vec![
                ResourceKind::Namespace,
                ResourceKind::ServiceAccount,
                ResourceKind::ClusterRole,
                ResourceKind::ClusterRoleBinding,
                ResourceKind::ConfigMap,
                ResourceKind::DaemonSet,
                ResourceKind::Service,
            ]
        );

        let ds = find(&out, ResourceKind::DaemonSet, PROCESSOR_NAME);
        assert_eq!(ds.config_source.as_deref(), Some(PROCESSOR_CONFIG_NAME));
        let pod = &ds.object.data["spec"]["template"]["spec"];
        assert_eq!(pod["hostNetwork"], true);
        assert_eq!(pod["containers"][0]["ports"][2]["hostPort"], 2055);
        assert_eq!(pod["volumes"][0]["configMap"]["name"], PROCESSOR_CONFIG_NAME);
        assert_eq!(
            env(ds, 0)["CONFIG_PATH"],
            "/etc/flowmesh/config/config.json"
        );

        assert_eq!(config(&out)["ingest"]["type"], "grpc");
    }

    #[test]
    fn test_kafka_model_uses_deployment_and_autoscaler() {
        let mut spec = kafka_spec();
        let out = ProcessorBuilder.build(&spec, &NoAssets).unwrap();
        let deploy = find(&out, ResourceKind::Deployment, PROCESSOR_NAME);
        assert_eq!(deploy.object.data["spec"]["replicas"], 3);
        assert!(!kinds(&out).contains(&ResourceKind::HorizontalPodAutoscaler));
        assert_eq!(config(&out)["ingest"]["topic"], "flows");

        spec.processor.kafka_consumer_autoscaler.status = AutoscalerStatus::Enabled;
        let out = ProcessorBuilder.build(&spec, &NoAssets).unwrap();
        let deploy = find(&out, ResourceKind::Deployment, PROCESSOR_NAME);
        assert!(deploy.object.data["spec"].get("replicas").is_none());
        let hpa = find(&out, ResourceKind::HorizontalPodAutoscaler, PROCESSOR_NAME);
        assert_eq!(hpa.object.data["spec"]["maxReplicas"], 3);
        assert_eq!(
            hpa.object.data["spec"]["scaleTargetRef"]["kind"],
            "Deployment"
        );
    }

    #[test]
    fn test_config_is_canonical_and_tracks_spec() {
        let spec = FlowCollectorSpec::default();
        let a = ProcessorBuilder.build(&spec, &NoAssets).unwrap();
        let b = ProcessorBuilder.build(&spec, &NoAssets).unwrap();
        let blob = |out: &[Desired]| {
            find(out, ResourceKind::ConfigMap, PROCESSOR_CONFIG_NAME)
                .config_data()
                .unwrap()[CONFIG_KEY]
                .clone()
        };
        assert_eq!(blob(&a), blob(&b));

        let mut changed = spec.clone();
        changed.loki.url = "http://loki.other:3100/".to_string();
        let c = ProcessorBuilder.build(&changed, &NoAssets).unwrap();
        assert_ne!(blob(&a), blob(&c));
        assert_eq!(config(&c)["write"]["url"], "http://loki.other:3100/");
    }

    #[test]
    fn test_probes_follow_spec() {
        let mut spec = FlowCollectorSpec::default();
        spec.processor.enable_kube_probes = false;
        let out = ProcessorBuilder.build(&spec, &NoAssets).unwrap();
        let container = &find(&out, ResourceKind::DaemonSet, PROCESSOR_NAME).object.data
            ["spec"]["template"]["spec"]["containers"][0];
        assert!(container.get("livenessProbe").is_none());
    }

    #[test]
    fn test_ipfix_exposes_collector_port_on_service() {
        let mut spec = FlowCollectorSpec::default();
        spec.agent.type_ = AgentType::Ipfix;
        let out = ProcessorBuilder.build(&spec, &NoAssets).unwrap();
        let svc = find(&out, ResourceKind::Service, PROCESSOR_NAME);
        assert_eq!(svc.object.data["spec"]["ports"][1]["protocol"], "UDP");
        assert_eq!(config(&out)["ingest"]["type"], "ipfix");
    }
}
