#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod annotations;
pub mod labels;
pub mod policy;

pub use self::labels::{Labels, Selector};
pub use k8s_openapi::{
    api::{
        self,
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, Pod, PodSpec, Volume},
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    runtime::watcher,
    Client, Error, Resource,
};
