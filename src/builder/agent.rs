//! Node agents
//!
//! With the eBPF agent the operator runs a DaemonSet in the privileged
//! namespace. With IPFIX the CNI exports flows itself and only needs an
//! exporter ConfigMap in its own namespace.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, PodSpec, PodTemplateSpec, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::warn;

use super::{
    app_labels, config_map, container_resources, env_from_field, env_var, extra_env, namespace,
    object_meta, selector, service_account, AssetSource, ResourceBuilder,
};
use crate::crd::FlowCollectorSpec;
use crate::resource::{Desired, ResourceKind};
use crate::status::Component;
use crate::Result;

/// eBPF agent DaemonSet and ServiceAccount name
pub const EBPF_AGENT_NAME: &str = "flowmesh-ebpf-agent";
/// ConfigMap read by the CNI to configure IPFIX export
pub const IPFIX_EXPORTER_NAME: &str = "flowmesh-ipfix-exporter";

/// Lowest sampling the CNI is allowed to use without `forceSampleAll`
const MIN_IPFIX_SAMPLING: i32 = 2;

/// Capabilities the agent needs when not fully privileged
const AGENT_CAPABILITIES: [&str; 4] = ["BPF", "PERFMON", "NET_ADMIN", "SYS_RESOURCE"];

/// Builds the agent side of the pipeline
pub struct AgentBuilder;

impl ResourceBuilder for AgentBuilder {
    fn component(&self) -> Component {
        Component::Agent
    }

    fn owned_kinds(&self) -> &'static [ResourceKind] {
        &[
            ResourceKind::Namespace,
            ResourceKind::ServiceAccount,
            ResourceKind::ConfigMap,
            ResourceKind::DaemonSet,
        ]
    }

    fn build(&self, spec: &FlowCollectorSpec, _assets: &dyn AssetSource) -> Result<Vec<Desired>> {
        if !spec.use_ebpf() {
            return Ok(vec![Self::ipfix_exporter(spec)?]);
        }

        let ns = spec.privileged_namespace();
        Ok(vec![
            namespace(&ns, true)?,
            service_account(EBPF_AGENT_NAME, &ns, Component::Agent)?,
            Self::daemon_set(spec, &ns)?,
        ])
    }
}

impl AgentBuilder {
    fn daemon_set(spec: &FlowCollectorSpec, ns: &str) -> Result<Desired> {
        let ebpf = &spec.agent.ebpf;

        let mut env = vec![
            env_var("SAMPLING", ebpf.sampling.to_string()),
            env_var("CACHE_ACTIVE_TIMEOUT", ebpf.cache_active_timeout.clone()),
            env_var("CACHE_MAX_FLOWS", ebpf.cache_max_flows.to_string()),
            env_var("LOG_LEVEL", ebpf.log_level.to_string()),
        ];
        if !ebpf.interfaces.is_empty() {
            env.push(env_var("INTERFACES", ebpf.interfaces.join(",")));
        }
        if !ebpf.exclude_interfaces.is_empty() {
            env.push(env_var(
                "EXCLUDE_INTERFACES",
                ebpf.exclude_interfaces.join(","),
            ));
        }
        if spec.use_kafka() {
            env.push(env_var("EXPORT", "kafka"));
            env.push(env_var("KAFKA_BROKERS", spec.kafka.address.clone()));
            env.push(env_var("KAFKA_TOPIC", spec.kafka.topic.clone()));
            env.push(env_var("KAFKA_BATCH_SIZE", ebpf.kafka_batch_size.to_string()));
        } else {
            // processor DaemonSet listens on the node
            env.push(env_var("EXPORT", "grpc"));
            env.push(env_from_field("FLOWS_TARGET_HOST", "status.hostIP"));
            env.push(env_var("FLOWS_TARGET_PORT", spec.processor.port.to_string()));
        }
        env.extend(extra_env(&ebpf.env));

        let security_context = if ebpf.privileged {
            SecurityContext {
                privileged: Some(true),
                run_as_user: Some(0),
                ..Default::default()
            }
        } else {
            SecurityContext {
                run_as_user: Some(0),
                capabilities: Some(Capabilities {
                    add: Some(AGENT_CAPABILITIES.iter().map(|c| c.to_string()).collect()),
                    ..Default::default()
                }),
                ..Default::default()
            }
        };

        Desired::new(&DaemonSet {
            metadata: object_meta(EBPF_AGENT_NAME, Some(ns), Component::Agent),
            spec: Some(DaemonSetSpec {
                selector: selector(EBPF_AGENT_NAME),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(app_labels(EBPF_AGENT_NAME, Component::Agent)),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(EBPF_AGENT_NAME.to_string()),
                        host_network: Some(true),
                        dns_policy: Some("ClusterFirstWithHostNet".to_string()),
                        containers: vec![Container {
                            name: EBPF_AGENT_NAME.to_string(),
                            image: Some(ebpf.image.clone()),
                            image_pull_policy: Some(ebpf.image_pull_policy.as_str().to_string()),
                            env: Some(env),
                            resources: container_resources(&ebpf.resources),
                            security_context: Some(security_context),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn ipfix_exporter(spec: &FlowCollectorSpec) -> Result<Desired> {
        let ipfix = &spec.agent.ipfix;

        let mut sampling = ipfix.sampling;
        if sampling < MIN_IPFIX_SAMPLING && !ipfix.force_sample_all {
            warn!(
                sampling,
                "IPFIX sampling below {} is too expensive, using {}; set forceSampleAll to override",
                MIN_IPFIX_SAMPLING,
                MIN_IPFIX_SAMPLING
            );
            sampling = MIN_IPFIX_SAMPLING;
        }

        let data = BTreeMap::from([
            ("sampling".to_string(), sampling.to_string()),
            (
                "cacheActiveTimeout".to_string(),
                ipfix.cache_active_timeout.clone(),
            ),
            ("cacheMaxFlows".to_string(), ipfix.cache_max_flows.to_string()),
            (
                "collector".to_string(),
                format!("{}:{}", processor_host(spec), spec.processor.port),
            ),
        ]);
        config_map(
            IPFIX_EXPORTER_NAME,
            &ipfix.cni_namespace,
            Component::Agent,
            data,
        )
    }
}

/// Where IPFIX exporters send to
fn processor_host(spec: &FlowCollectorSpec) -> String {
    format!(
        "{}.{}.svc",
        super::processor::PROCESSOR_NAME,
        spec.namespace
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::test_support::{env, find, kinds, NoAssets};
    use crate::crd::{AgentType, DeploymentModel};

    #[test]
    fn test_ebpf_mode_builds_privileged_daemon_set() {
        let spec = FlowCollectorSpec::default();
        let out = AgentBuilder.build(&spec, &NoAssets).unwrap();

        assert_eq!(
            kinds(&out),
            vec![
                ResourceKind::Namespace,
                ResourceKind::ServiceAccount,
                ResourceKind::DaemonSet
            ]
        );
        let ds = find(&out, ResourceKind::DaemonSet, EBPF_AGENT_NAME);
        assert_eq!(ds.namespace(), Some("flowmesh-privileged"));
        assert_eq!(ds.object.data["spec"]["template"]["spec"]["hostNetwork"], true);

        let vars = env(ds, 0);
        assert_eq!(vars["SAMPLING"], "50");
        assert_eq!(vars["EXPORT"], "grpc");
        assert_eq!(vars["FLOWS_TARGET_PORT"], "2055");
        assert_eq!(vars["EXCLUDE_INTERFACES"], "lo");
        assert!(!vars.contains_key("INTERFACES"));
    }

    #[test]
    fn test_kafka_model_points_agent_at_broker() {
        let mut spec = FlowCollectorSpec::default();
        spec.deployment_model = DeploymentModel::Kafka;
        spec.kafka.address = "kafka:9092".to_string();
        spec.kafka.topic = "flows".to_string();

        let out = AgentBuilder.build(&spec, &NoAssets).unwrap();
        let vars = env(find(&out, ResourceKind::DaemonSet, EBPF_AGENT_NAME), 0);
        assert_eq!(vars["EXPORT"], "kafka");
        assert_eq!(vars["KAFKA_BROKERS"], "kafka:9092");
        assert!(!vars.contains_key("FLOWS_TARGET_HOST"));
    }

    #[test]
    fn test_capabilities_unless_privileged() {
        let mut spec = FlowCollectorSpec::default();
        let out = AgentBuilder.build(&spec, &NoAssets).unwrap();
        let sc = &find(&out, ResourceKind::DaemonSet, EBPF_AGENT_NAME).object.data["spec"]
            ["template"]["spec"]["containers"][0]["securityContext"];
        assert_eq!(sc["capabilities"]["add"][0], "BPF");
        assert!(sc.get("privileged").is_none());

        spec.agent.ebpf.privileged = true;
        let out = AgentBuilder.build(&spec, &NoAssets).unwrap();
        let sc = &find(&out, ResourceKind::DaemonSet, EBPF_AGENT_NAME).object.data["spec"]
            ["template"]["spec"]["containers"][0]["securityContext"];
        assert_eq!(sc["privileged"], true);
    }

    #[test]
    fn test_ipfix_mode_only_writes_exporter_config() {
        let mut spec = FlowCollectorSpec::default();
        spec.agent.type_ = AgentType::Ipfix;
        spec.agent.ipfix.sampling = 1;

        let out = AgentBuilder.build(&spec, &NoAssets).unwrap();
        assert_eq!(kinds(&out), vec![ResourceKind::ConfigMap]);
        let cm = &out[0];
        assert_eq!(cm.namespace(), Some("kube-system"));
        let data = cm.config_data().unwrap();
        assert_eq!(data["sampling"], "2");
        assert_eq!(data["collector"], "flowmesh-processor.flowmesh.svc:2055");

        spec.agent.ipfix.force_sample_all = true;
        let out = AgentBuilder.build(&spec, &NoAssets).unwrap();
        assert_eq!(out[0].config_data().unwrap()["sampling"], "1");
    }
}
