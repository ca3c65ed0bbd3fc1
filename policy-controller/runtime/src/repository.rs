use crate::k8s::{
    Api, Client, DeleteParams, Deployment, ListParams, Patch, PatchParams, Pod, PostParams,
    ResourceExt, Selector,
};
use anyhow::{anyhow, Result};
use std::future::Future;
use tokio::time;

/// The cluster operations needed by the reconciler, the admission webhook and
/// the quarantine action.
#[async_trait::async_trait]
pub trait Repository: Clone + Send + Sync + 'static {
    /// Lists deployments matching `selector`, in `namespace` or cluster-wide.
    async fn list_deployments(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<Deployment>>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment>;

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> Result<()>;

    /// Replaces the deployment. Fails if it was modified since it was read.
    async fn update_deployment(&self, deployment: &Deployment) -> Result<()>;

    async fn list_pods(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<Pod>>;

    /// Deletes the pod. A pod that is already gone is not an error.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct KubeRepository {
    client: Client,
    timeout: time::Duration,
}

const FIELD_MANAGER: &str = "cluster-monitor";

// === impl KubeRepository ===

impl KubeRepository {
    pub fn new(client: Client, timeout: time::Duration) -> Self {
        Self { client, timeout }
    }

    fn deployments(&self, namespace: Option<&str>) -> Api<Deployment> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn pods(&self, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    async fn bounded<T>(
        &self,
        request: impl Future<Output = kube::Result<T>> + Send,
    ) -> Result<T> {
        time::timeout(self.timeout, request)
            .await
            .map_err(|_| anyhow!("request timed out after {:?}", self.timeout))?
            .map_err(Into::into)
    }
}

fn list_params(selector: &Selector) -> ListParams {
    if selector.is_empty() {
        return ListParams::default();
    }
    ListParams::default().labels(&selector.to_query())
}

#[async_trait::async_trait]
impl Repository for KubeRepository {
    async fn list_deployments(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<Deployment>> {
        let api = self.deployments(namespace);
        let list = self.bounded(api.list(&list_params(selector))).await?;
        Ok(list.items)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        let api = self.deployments(Some(namespace));
        self.bounded(api.get(name)).await
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> Result<()> {
        let api = self.deployments(Some(namespace));
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.bounded(api.patch(name, &params, &Patch::Json::<()>(patch)))
            .await?;
        Ok(())
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<()> {
        let api = self.deployments(deployment.namespace().as_deref());
        let name = deployment.name_unchecked();
        self.bounded(api.replace(&name, &PostParams::default(), deployment))
            .await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<Pod>> {
        let api = self.pods(namespace);
        let list = self.bounded(api.list(&list_params(selector))).await?;
        Ok(list.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api = self.pods(Some(namespace));
        match time::timeout(self.timeout, api.delete(name, &DeleteParams::default())).await {
            Err(_) => Err(anyhow!("request timed out after {:?}", self.timeout)),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(kube::Error::Api(e))) if e.code == 404 => Ok(()),
            Ok(Err(error)) => Err(error.into()),
        }
    }
}
