//! FlowCollector Custom Resource Definition
//!
//! A FlowCollector is the single cluster-scoped object piloting the flow
//! collection pipeline: the node agents, the flow processor, the console
//! plugin, network policies and monitoring. Every section has defaults so
//! `spec: {}` deploys a working pipeline.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AutoscalerSpec, Condition, LogLevel, PullPolicy, ResourceRequirements};
use crate::Error;

/// Ports the processor may not listen on (overlay tunnels and IPsec)
const RESERVED_PORTS: [i32; 4] = [4789, 6081, 500, 4500];

/// Specification for a FlowCollector
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "flowmesh.dev",
    version = "v1alpha1",
    kind = "FlowCollector",
    plural = "flowcollectors",
    shortname = "fc",
    status = "FlowCollectorStatus",
    printcolumn = r#"{"name":"Agent","type":"string","jsonPath":".spec.agent.type"}"#,
    printcolumn = r#"{"name":"Sampling (EBPF)","type":"string","jsonPath":".spec.agent.ebpf.sampling"}"#,
    printcolumn = r#"{"name":"Deployment Model","type":"string","jsonPath":".spec.deploymentModel"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#
)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowCollectorSpec {
    /// Namespace where the pipeline is deployed
    pub namespace: String,

    /// Flow export agent running on every node
    pub agent: AgentSpec,

    /// Flow processor (enrichment and export to Loki)
    pub processor: ProcessorSpec,

    /// Loki client settings used by the processor
    pub loki: LokiSpec,

    /// Console plugin serving the flow UI
    pub console_plugin: ConsolePluginSpec,

    /// How flows travel from agents to the processor
    pub deployment_model: DeploymentModel,

    /// Kafka settings, used when `deploymentModel` is KAFKA
    pub kafka: KafkaSpec,

    /// Network isolation of the pipeline namespaces
    pub network_policy: NetworkPolicySpec,

    /// Metrics access and health dashboard
    pub monitoring: MonitoringSpec,
}

impl Default for FlowCollectorSpec {
    fn default() -> Self {
        Self {
            namespace: "flowmesh".to_string(),
            agent: AgentSpec::default(),
            processor: ProcessorSpec::default(),
            loki: LokiSpec::default(),
            console_plugin: ConsolePluginSpec::default(),
            deployment_model: DeploymentModel::default(),
            kafka: KafkaSpec::default(),
            network_policy: NetworkPolicySpec::default(),
            monitoring: MonitoringSpec::default(),
        }
    }
}

impl FlowCollectorSpec {
    /// Namespace holding the privileged node agents
    pub fn privileged_namespace(&self) -> String {
        format!("{}-privileged", self.namespace)
    }

    /// True when the eBPF agent is used
    pub fn use_ebpf(&self) -> bool {
        self.agent.type_ == AgentType::Ebpf
    }

    /// True when flows go through Kafka
    pub fn use_kafka(&self) -> bool {
        self.deployment_model == DeploymentModel::Kafka
    }

    /// Validate the collector specification
    ///
    /// Schema-level checks belong to the CRD; these are the cross-field rules
    /// the schema cannot express.
    pub fn validate(&self, collector: &str) -> Result<(), Error> {
        if self.namespace.is_empty() {
            return Err(Error::validation_for_field(
                collector,
                "spec.namespace",
                "namespace must not be empty",
            ));
        }

        let port = self.processor.port;
        if !(1025..=65535).contains(&port) {
            return Err(Error::validation_for_field(
                collector,
                "spec.processor.port",
                format!("port {} is outside 1025-65535", port),
            ));
        }
        if RESERVED_PORTS.contains(&port) {
            return Err(Error::validation_for_field(
                collector,
                "spec.processor.port",
                format!("port {} is reserved for overlay or IPsec traffic", port),
            ));
        }

        if self.agent.ebpf.sampling < 0 {
            return Err(Error::validation_for_field(
                collector,
                "spec.agent.ebpf.sampling",
                "sampling must be >= 0",
            ));
        }

        if self.use_kafka() && (self.kafka.address.is_empty() || self.kafka.topic.is_empty()) {
            return Err(Error::validation_for_field(
                collector,
                "spec.kafka",
                "KAFKA deployment model requires kafka.address and kafka.topic",
            ));
        }

        validate_autoscaler(
            collector,
            "spec.processor.kafkaConsumerAutoscaler",
            &self.processor.kafka_consumer_autoscaler,
        )?;
        validate_autoscaler(
            collector,
            "spec.consolePlugin.autoscaler",
            &self.console_plugin.autoscaler,
        )?;

        Ok(())
    }
}

fn validate_autoscaler(collector: &str, field: &str, hpa: &AutoscalerSpec) -> Result<(), Error> {
    if !hpa.enabled() {
        return Ok(());
    }
    if hpa.min_replicas < 1 || hpa.max_replicas < hpa.min_replicas {
        return Err(Error::validation_for_field(
            collector,
            field,
            format!(
                "autoscaler needs 1 <= minReplicas <= maxReplicas, got {}..{}",
                hpa.min_replicas, hpa.max_replicas
            ),
        ));
    }
    Ok(())
}

/// Which agent exports flows
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AgentType {
    /// eBPF agent DaemonSet managed by the operator
    #[default]
    #[serde(rename = "EBPF")]
    Ebpf,
    /// IPFIX export configured on the CNI
    #[serde(rename = "IPFIX")]
    Ipfix,
}

/// Transport between agents and processor
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeploymentModel {
    /// Agents send to a processor on the same node
    #[default]
    Direct,
    /// Agents write to Kafka, a processor Deployment consumes
    Kafka,
}

/// Agent selection
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSpec {
    /// EBPF or IPFIX
    #[serde(rename = "type")]
    pub type_: AgentType,
    /// Settings for the eBPF agent
    pub ebpf: EbpfAgentSpec,
    /// Settings for IPFIX export
    pub ipfix: IpfixAgentSpec,
}

/// eBPF agent settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EbpfAgentSpec {
    /// Agent image
    pub image: String,
    /// Pull policy for the image
    pub image_pull_policy: PullPolicy,
    /// One packet in `sampling` is reported; 0 or 1 reports everything
    pub sampling: i32,
    /// Max time a flow is aggregated before export
    pub cache_active_timeout: String,
    /// Max number of flows aggregated before export
    pub cache_max_flows: i32,
    /// Interfaces to monitor; empty means all
    pub interfaces: Vec<String>,
    /// Interfaces never monitored
    pub exclude_interfaces: Vec<String>,
    /// Agent log level
    pub log_level: LogLevel,
    /// Run the agent container privileged
    pub privileged: bool,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
    /// Container resources
    pub resources: ResourceRequirements,
    /// Max Kafka batch size in bytes
    pub kafka_batch_size: i64,
}

impl Default for EbpfAgentSpec {
    fn default() -> Self {
        Self {
            image: "quay.io/flowmesh/ebpf-agent:v0.1.0".to_string(),
            image_pull_policy: PullPolicy::IfNotPresent,
            sampling: 50,
            cache_active_timeout: "5s".to_string(),
            cache_max_flows: 100_000,
            interfaces: Vec::new(),
            exclude_interfaces: vec!["lo".to_string()],
            log_level: LogLevel::Info,
            privileged: false,
            env: BTreeMap::new(),
            resources: ResourceRequirements::with(
                &[("memory", "50Mi"), ("cpu", "100m")],
                &[("memory", "800Mi")],
            ),
            kafka_batch_size: 10_485_760,
        }
    }
}

/// IPFIX export settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct IpfixAgentSpec {
    /// Max time a flow is aggregated before export
    pub cache_active_timeout: String,
    /// Max number of flows aggregated before export
    pub cache_max_flows: i32,
    /// Sampling rate applied by the CNI
    pub sampling: i32,
    /// Allow sampling below 2 (expensive)
    pub force_sample_all: bool,
    /// Namespace of the CNI reading the exporter ConfigMap
    pub cni_namespace: String,
}

impl Default for IpfixAgentSpec {
    fn default() -> Self {
        Self {
            cache_active_timeout: "20s".to_string(),
            cache_max_flows: 400,
            sampling: 400,
            force_sample_all: false,
            cni_namespace: "kube-system".to_string(),
        }
    }
}

/// Processor metrics endpoint
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessorMetricsSpec {
    /// Prometheus scrape port
    pub port: i32,
    /// Metric tags not exported
    pub ignore_tags: Vec<String>,
}

impl Default for ProcessorMetricsSpec {
    fn default() -> Self {
        Self {
            port: 9102,
            ignore_tags: vec!["egress".to_string(), "packets".to_string()],
        }
    }
}

/// Flow processor settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessorSpec {
    /// Port flows are received on
    pub port: i32,
    /// Health probe port
    pub health_port: i32,
    /// Metrics endpoint
    pub metrics: ProcessorMetricsSpec,
    /// Processor image
    pub image: String,
    /// Pull policy for the image
    pub image_pull_policy: PullPolicy,
    /// Processor log level
    pub log_level: LogLevel,
    /// Container resources
    pub resources: ResourceRequirements,
    /// Add liveness and readiness probes
    pub enable_kube_probes: bool,
    /// Drop fields the console never shows
    pub drop_unused_fields: bool,
    /// Replicas of the Kafka consumer Deployment
    pub kafka_consumer_replicas: i32,
    /// Autoscaler for the Kafka consumer Deployment
    pub kafka_consumer_autoscaler: AutoscalerSpec,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
}

impl Default for ProcessorSpec {
    fn default() -> Self {
        Self {
            port: 2055,
            health_port: 8080,
            metrics: ProcessorMetricsSpec::default(),
            image: "quay.io/flowmesh/processor:v0.1.0".to_string(),
            image_pull_policy: PullPolicy::IfNotPresent,
            log_level: LogLevel::Info,
            resources: ResourceRequirements::with(
                &[("memory", "100Mi"), ("cpu", "100m")],
                &[("memory", "800Mi")],
            ),
            enable_kube_probes: true,
            drop_unused_fields: true,
            kafka_consumer_replicas: 3,
            kafka_consumer_autoscaler: AutoscalerSpec::default(),
            env: BTreeMap::new(),
        }
    }
}

/// Loki client settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LokiSpec {
    /// Push endpoint
    pub url: String,
    /// Query endpoint, defaults to `url`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub querier_url: Option<String>,
    /// Tenant sent in X-Scope-OrgID
    pub tenant_id: String,
    /// Max time to wait before sending a batch
    pub batch_wait: String,
    /// Max batch size in bytes
    pub batch_size: i64,
    /// Request timeout
    pub timeout: String,
    /// Initial retry backoff
    pub min_backoff: String,
    /// Max retry backoff
    pub max_backoff: String,
    /// Max retries per batch
    pub max_retries: i32,
    /// Labels added to every stream
    pub static_labels: BTreeMap<String, String>,
}

impl Default for LokiSpec {
    fn default() -> Self {
        Self {
            url: "http://loki:3100/".to_string(),
            querier_url: None,
            tenant_id: "flowmesh".to_string(),
            batch_wait: "1s".to_string(),
            batch_size: 102_400,
            timeout: "10s".to_string(),
            min_backoff: "1s".to_string(),
            max_backoff: "5s".to_string(),
            max_retries: 2,
            static_labels: BTreeMap::from([("app".to_string(), "flowmesh-collector".to_string())]),
        }
    }
}

impl LokiSpec {
    /// Endpoint used for queries
    pub fn querier(&self) -> &str {
        self.querier_url.as_deref().unwrap_or(&self.url)
    }
}

/// Port-to-service-name translation in the console
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PortNamingSpec {
    /// Translate well-known ports to service names
    pub enable: bool,
    /// Extra port names, e.g. {"3100": "loki"}
    pub port_names: BTreeMap<String, String>,
}

impl Default for PortNamingSpec {
    fn default() -> Self {
        Self {
            enable: true,
            port_names: BTreeMap::new(),
        }
    }
}

/// Console plugin settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsolePluginSpec {
    /// Deploy the plugin
    pub enable: bool,
    /// Replica count, ignored when the autoscaler is enabled
    pub replicas: i32,
    /// Plugin service port
    pub port: i32,
    /// Plugin image
    pub image: String,
    /// Pull policy for the image
    pub image_pull_policy: PullPolicy,
    /// Container resources
    pub resources: ResourceRequirements,
    /// Plugin backend log level
    pub log_level: LogLevel,
    /// Autoscaler for the plugin Deployment
    pub autoscaler: AutoscalerSpec,
    /// Port naming
    pub port_naming: PortNamingSpec,
}

impl Default for ConsolePluginSpec {
    fn default() -> Self {
        Self {
            enable: true,
            replicas: 1,
            port: 9001,
            image: "quay.io/flowmesh/console-plugin:v0.1.0".to_string(),
            image_pull_policy: PullPolicy::IfNotPresent,
            resources: ResourceRequirements::with(
                &[("memory", "50Mi"), ("cpu", "100m")],
                &[("memory", "100Mi")],
            ),
            log_level: LogLevel::Info,
            autoscaler: AutoscalerSpec::default(),
            port_naming: PortNamingSpec::default(),
        }
    }
}

/// Kafka connection
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KafkaSpec {
    /// Bootstrap server address
    pub address: String,
    /// Topic flows are written to
    pub topic: String,
}

/// Network policy settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkPolicySpec {
    /// Isolate the pipeline namespaces
    pub enable: bool,
    /// Namespaces allowed to reach the pipeline besides its own
    pub additional_namespaces: Vec<String>,
}

/// Monitoring settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringSpec {
    /// Install metrics RBAC and the health dashboard
    pub enable: bool,
    /// Namespace of the dashboard ConfigMap, defaults to the pipeline namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard_namespace: Option<String>,
}

impl Default for MonitoringSpec {
    fn default() -> Self {
        Self {
            enable: true,
            dashboard_namespace: None,
        }
    }
}

/// Status of a FlowCollector, written only by the operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowCollectorStatus {
    /// Rolled-up Ready condition followed by one condition per component
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Namespace where the pipeline is deployed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl FlowCollectorStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}
