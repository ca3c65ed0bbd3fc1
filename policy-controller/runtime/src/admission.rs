//! The mutating admission webhook that adds the monitoring sidecar to pods.
//!
//! Every failure after the request has been decoded results in an allowed,
//! unmodified pod: the webhook never blocks pod creation. The reason is
//! carried in the response's status message.

use crate::{
    core::{
        inject::{self, Precheck, Skip},
        SidecarConfig,
    },
    k8s::{annotations, Pod, ResourceExt, Selector},
    repository::Repository,
    response::{self, Body, BoxError},
};
use anyhow::{anyhow, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::DynamicObject;
use std::{collections::HashSet, fmt, sync::Arc};
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, trace, warn};

pub const MUTATE_PATH: &str = "/mutate";

#[derive(Clone)]
pub struct Admission<R> {
    repo: R,
    sidecar: Arc<SidecarConfig>,
    timeout: time::Duration,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[source] BoxError),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

/// What happens to an admitted pod.
#[derive(Debug)]
pub enum Decision {
    Skip(Skip),
    /// The pod's deployment was not annotated by any policy.
    NotSelected,
    Inject(json_patch::Patch),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;

// === impl Admission ===

impl<R, B> tower::Service<Request<B>> for Admission<R>
where
    R: Repository,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        trace!(method = %req.method(), uri = %req.uri());
        if req.method() != http::Method::POST || req.uri().path() != MUTATE_PATH {
            return Box::pin(future::ok(response::status(
                http::StatusCode::NOT_FOUND,
                "not found",
            )));
        }
        if !response::has_content_type(&req, "application/json") {
            return Box::pin(future::ok(response::status(
                http::StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "expected content type application/json",
            )));
        }

        let admission = self.clone();
        Box::pin(async move {
            let bytes = req
                .into_body()
                .collect()
                .await
                .map_err(|e| Error::Request(e.into()))?
                .to_bytes();
            if bytes.is_empty() {
                return Ok(response::status(http::StatusCode::BAD_REQUEST, "empty body"));
            }

            let review: Review = match serde_json::from_slice(&bytes) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    let review = allowed(AdmissionResponse::invalid(error)).into_review();
                    return Ok(response::json(http::StatusCode::OK, &review)?);
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => admission.admit(req).await,
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    allowed(AdmissionResponse::invalid(error))
                }
            };
            debug!(?rsp);
            Ok(response::json(http::StatusCode::OK, &rsp.into_review())?)
        })
    }
}

impl<R: Repository> Admission<R> {
    pub fn new(repo: R, sidecar: Arc<SidecarConfig>, timeout: time::Duration) -> Self {
        Self {
            repo,
            sidecar,
            timeout,
        }
    }

    async fn admit(&self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);

        let pod = match parse_pod(&req) {
            Ok(pod) => pod,
            Err(error) => {
                info!(%error, "Failed to decode pod");
                return allow_with(rsp, error);
            }
        };
        let ns = req
            .namespace
            .clone()
            .or_else(|| pod.namespace())
            .unwrap_or_default();
        let name = pod
            .metadata
            .name
            .clone()
            .or_else(|| pod.metadata.generate_name.clone())
            .unwrap_or_default();

        match self.decide(&ns, &pod).await {
            Ok(Decision::Inject(patch)) => match rsp.clone().with_patch(patch) {
                Ok(rsp) => {
                    info!(%ns, pod = %name, "Injecting sidecar");
                    rsp
                }
                Err(error) => {
                    warn!(%error, %ns, pod = %name, "Failed to encode patch");
                    allow_with(rsp, error)
                }
            },
            Ok(decision) => {
                debug!(%ns, pod = %name, ?decision, "Not injecting");
                rsp
            }
            Err(error) => {
                warn!(%error, %ns, pod = %name, "Admitting pod without sidecar");
                allow_with(rsp, error)
            }
        }
    }

    /// Decides whether the pod gets the sidecar.
    pub async fn decide(&self, ns: &str, pod: &Pod) -> Result<Decision> {
        match inject::precheck(ns, pod) {
            Precheck::Skip(skip) => Ok(Decision::Skip(skip)),
            Precheck::Inject => Ok(Decision::Inject(inject::patch(pod, &self.sidecar)?)),
            Precheck::ResolveOwner => {
                let selected = time::timeout(self.timeout, self.owner_requests_injection(ns, pod))
                    .await
                    .map_err(|_| anyhow!("timed out resolving the pod's deployment"))??;
                if !selected {
                    return Ok(Decision::NotSelected);
                }
                Ok(Decision::Inject(inject::patch(pod, &self.sidecar)?))
            }
        }
    }

    /// Returns true if an annotated deployment in the namespace owns pods
    /// that share the new pod's labels.
    async fn owner_requests_injection(&self, ns: &str, pod: &Pod) -> Result<bool> {
        let labels = Selector::from_map(pod.labels().clone());
        let siblings = self
            .repo
            .list_pods(Some(ns), &labels)
            .await?
            .into_iter()
            .map(|p| p.name_any())
            .collect::<HashSet<_>>();
        if siblings.is_empty() {
            return Ok(false);
        }

        let deployments = self.repo.list_deployments(Some(ns), &Selector::default()).await?;
        for deployment in deployments
            .iter()
            .filter(|d| d.annotations().contains_key(annotations::INJECT))
        {
            let Some(spec) = deployment.spec.as_ref() else {
                continue;
            };
            let selector = Selector::from(&spec.selector);
            if selector.is_empty() {
                continue;
            }
            let owned = self.repo.list_pods(Some(ns), &selector).await?;
            if owned.iter().any(|p| siblings.contains(&p.name_any())) {
                debug!(
                    deployment = %deployment.name_any(),
                    "Pod belongs to an annotated deployment"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn parse_pod(req: &AdmissionRequest) -> Result<Pod> {
    let obj = req
        .object
        .as_ref()
        .ok_or_else(|| anyhow!("admission request missing 'object'"))?;
    let pod = serde_json::from_value(serde_json::to_value(obj)?)?;
    Ok(pod)
}

/// Admits the object while reporting `reason` to the API server.
fn allow_with(rsp: AdmissionResponse, reason: impl fmt::Display) -> AdmissionResponse {
    allowed(rsp.deny(reason))
}

/// Admits the object, keeping any status message already set.
fn allowed(mut rsp: AdmissionResponse) -> AdmissionResponse {
    rsp.allowed = true;
    rsp
}
