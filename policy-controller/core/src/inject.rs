//! Decides whether a pod receives the sidecar, and builds the patch that adds
//! it.

use crate::{
    k8s::{annotations, labels::Map, Pod},
    patch::PatchBuilder,
    sidecar::SidecarConfig,
};
use json_patch::Patch;
use std::fmt;

/// Pods in these namespaces are never mutated.
pub const RESERVED_NAMESPACES: [&str; 2] = ["kube-system", "kube-public"];

/// The outcome of the checks that need nothing beyond the pod itself.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Precheck {
    Skip(Skip),
    Inject,
    /// The pod does not decide for itself; its owning deployment does.
    ResolveOwner,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Skip {
    ReservedNamespace,
    AlreadyInjected,
    /// A pod without labels cannot be selected by a deployment.
    Unlabeled,
}

pub fn precheck(namespace: &str, pod: &Pod) -> Precheck {
    if RESERVED_NAMESPACES.contains(&namespace) {
        return Precheck::Skip(Skip::ReservedNamespace);
    }

    let empty = Map::new();
    let annotations = pod.metadata.annotations.as_ref().unwrap_or(&empty);
    if annotations::is_injected(annotations) {
        return Precheck::Skip(Skip::AlreadyInjected);
    }

    if annotations::requests_injection(annotations) {
        return Precheck::Inject;
    }

    if pod.metadata.labels.as_ref().map_or(true, |l| l.is_empty()) {
        return Precheck::Skip(Skip::Unlabeled);
    }

    Precheck::ResolveOwner
}

/// Builds the single patch that installs the sidecar and marks the pod as
/// injected.
pub fn patch(pod: &Pod, sidecar: &SidecarConfig) -> serde_json::Result<Patch> {
    let (containers, volumes) = pod
        .spec
        .as_ref()
        .map(|spec| {
            (
                spec.containers.len(),
                spec.volumes.as_ref().map_or(0, Vec::len),
            )
        })
        .unwrap_or_default();

    let status = [(
        annotations::STATUS.to_string(),
        annotations::STATUS_INJECTED.to_string(),
    )]
    .into_iter()
    .collect::<Map>();

    Ok(PatchBuilder::new()
        .append(&["spec", "containers"], containers, &sidecar.containers)?
        .append(&["spec", "volumes"], volumes, &sidecar.volumes)?
        .set_annotations(pod.metadata.annotations.as_ref(), &status)
        .build())
}

impl fmt::Display for Skip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReservedNamespace => f.write_str("reserved namespace"),
            Self::AlreadyInjected => f.write_str("already injected"),
            Self::Unlabeled => f.write_str("pod has no labels"),
        }
    }
}
