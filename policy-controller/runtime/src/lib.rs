pub use cluster_monitor_core as core;
pub use cluster_monitor_k8s_api as k8s;

pub mod action;
pub mod admission;
mod args;
pub mod index;
pub mod quarantine;
pub mod queue;
pub mod reconcile;
pub mod repository;
mod response;

#[cfg(test)]
mod tests;

pub use self::{
    action::ActionService,
    admission::Admission,
    args::Args,
    index::{Index, ObjectKey, PolicyEvent, SharedIndex},
    quarantine::Quarantine,
    queue::Queue,
    reconcile::Reconciler,
    repository::{KubeRepository, Repository},
};
