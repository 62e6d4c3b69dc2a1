//! Custom Resource Definitions for flowmesh
//!
//! This module contains the FlowCollector CRD and the types it shares with
//! the status machinery.

mod flow_collector;
mod types;

pub use flow_collector::{
    AgentSpec, AgentType, ConsolePluginSpec, DeploymentModel, EbpfAgentSpec, FlowCollector,
    FlowCollectorSpec, FlowCollectorStatus, IpfixAgentSpec, KafkaSpec, LokiSpec, MonitoringSpec,
    NetworkPolicySpec, PortNamingSpec, ProcessorMetricsSpec, ProcessorSpec,
};
pub use types::{
    AutoscalerSpec, AutoscalerStatus, Condition, ConditionStatus, LogLevel, PullPolicy,
    ResourceRequirements,
};
