use super::super::{
    annotations::{Action, GroupLabel, LogFrequency, PolicyAnnotations},
    labels::Selector,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The namespace a policy applies to when it names none.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Describes which deployments get the monitoring sidecar and what happens to
/// their group when one of their pods is reported.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "k8s.crd.io",
    version = "v1alpha1",
    kind = "PolicyDefinition",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDefinitionSpec {
    /// Namespaces in which deployments are selected.
    #[serde(default, alias = "Namespace")]
    pub namespace: Vec<String>,

    #[serde(default)]
    pub action: String,

    #[serde(default)]
    pub label_selector: Selector,

    /// Label keys whose values identify a pod's group for quarantine.
    #[serde(default)]
    pub group_label: Vec<String>,

    #[serde(default)]
    pub log_spec: LogSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogSpec {
    /// Seconds between liveness log entries. Zero selects the default.
    #[serde(default)]
    pub log_frequency: u32,

    #[serde(default)]
    pub destination: Vec<Destination>,
}

/// An external log receiver. Only the log forwarder reads these.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Destination {
    #[serde(default)]
    pub ipaddress: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub endpoint: String,
}

// === impl PolicyDefinitionSpec ===

impl PolicyDefinitionSpec {
    pub fn namespaces(&self) -> Vec<&str> {
        let namespaces = self
            .namespace
            .iter()
            .map(String::as_str)
            .filter(|ns| !ns.is_empty())
            .collect::<Vec<_>>();
        if namespaces.is_empty() {
            return vec![DEFAULT_NAMESPACE];
        }
        namespaces
    }

    pub fn selector(&self) -> &Selector {
        &self.label_selector
    }

    /// The annotations written onto every deployment this policy selects.
    pub fn annotations(&self) -> PolicyAnnotations {
        PolicyAnnotations {
            action: Action::from(self.action.as_str()),
            group_label: self.group_label.iter().cloned().collect::<GroupLabel>(),
            log_frequency: LogFrequency::from_seconds(self.log_spec.log_frequency),
        }
    }
}
