#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod inject;
pub mod patch;
pub mod sidecar;
pub mod workload;

pub use self::{patch::PatchBuilder, sidecar::SidecarConfig};
pub use cluster_monitor_k8s_api as k8s;
