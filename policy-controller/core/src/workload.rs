//! Annotation patches for workloads selected by a policy.

use crate::{
    k8s::{
        annotations::{self, PolicyAnnotations},
        ObjectMeta,
    },
    patch::PatchBuilder,
};
use json_patch::Patch;

/// Returns true if a policy has already annotated the workload.
pub fn is_annotated(meta: &ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .map(|a| {
            annotations::is_injected(a)
                || a.get(annotations::INJECT).map(String::as_str)
                    == Some(annotations::INJECT_ENABLED)
        })
        .unwrap_or(false)
}

/// Builds the patch that writes a policy's annotations onto a workload, or
/// `None` if the workload is already annotated.
pub fn annotate(meta: &ObjectMeta, policy: &PolicyAnnotations) -> Option<Patch> {
    if is_annotated(meta) {
        return None;
    }
    let patch = PatchBuilder::new().set_annotations(meta.annotations.as_ref(), &policy.to_map());
    if patch.is_empty() {
        return None;
    }
    Some(patch.build())
}

/// Builds the patch that removes every policy annotation from a workload, or
/// `None` if the workload was never annotated.
pub fn strip(meta: &ObjectMeta) -> Option<Patch> {
    let current = meta.annotations.as_ref()?;
    if !current.contains_key(annotations::INJECT) {
        return None;
    }
    Some(
        PatchBuilder::new()
            .remove_annotations(Some(current), annotations::POLICY_KEYS)
            .build(),
    )
}
