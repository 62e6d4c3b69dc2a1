//! Ingress isolation of the pipeline namespaces

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use super::{object_meta, AssetSource, ResourceBuilder};
use crate::crd::FlowCollectorSpec;
use crate::resource::{Desired, ResourceKind};
use crate::status::Component;
use crate::Result;

/// Name of both NetworkPolicies
pub const NETWORK_POLICY_NAME: &str = "flowmesh";

const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

/// Builds one policy per pipeline namespace; nothing when disabled
pub struct NetworkPolicyBuilder;

impl ResourceBuilder for NetworkPolicyBuilder {
    fn component(&self) -> Component {
        Component::NetworkPolicy
    }

    fn owned_kinds(&self) -> &'static [ResourceKind] {
        &[
            ResourceKind::NetworkPolicy,
        ]
    }

    fn build(&self, spec: &FlowCollectorSpec, _assets: &dyn AssetSource) -> Result<Vec<Desired>> {
        if !spec.network_policy.enable {
            return Ok(Vec::new());
        }

        let privileged = spec.privileged_namespace();
        let mut allowed = vec![spec.namespace.clone(), privileged.clone()];
        for ns in &spec.network_policy.additional_namespaces {
            if !allowed.contains(ns) {
                allowed.push(ns.clone());
            }
        }

        Ok(vec![
            Self::policy(&spec.namespace, &allowed)?,
            Self::policy(&privileged, &allowed)?,
        ])
    }
}

impl NetworkPolicyBuilder {
    /// Allow ingress only from `allowed` namespaces to every pod of `namespace`
    fn policy(namespace: &str, allowed: &[String]) -> Result<Desired> {
        let from = allowed
            .iter()
            .map(|ns| NetworkPolicyPeer {
                namespace_selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        NAMESPACE_NAME_LABEL.to_string(),
                        ns.clone(),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect();

        Desired::new(&NetworkPolicy {
            metadata: object_meta(
                NETWORK_POLICY_NAME,
                Some(namespace),
                Component::NetworkPolicy,
            ),
            spec: Some(NetworkPolicySpec {
                ingress: Some(vec![NetworkPolicyIngressRule {
                    from: Some(from),
                    ..Default::default()
                }]),
                policy_types: Some(vec!["Ingress".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}
