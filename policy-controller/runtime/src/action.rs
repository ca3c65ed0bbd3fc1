//! The HTTP endpoint through which monitoring sidecars report failing pods.

use crate::{
    quarantine::Quarantine,
    repository::Repository,
    response::{self, Body, BoxError},
};
use anyhow::Result;
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, info_span, warn, Instrument};

pub const ACTION_PATH: &str = "/action";

const POD_NAME_PARAM: &str = "podname";

#[derive(Clone)]
pub struct ActionService<R> {
    quarantine: Quarantine<R>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[source] BoxError),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

// === impl ActionService ===

impl<R: Repository> ActionService<R> {
    pub fn new(quarantine: Quarantine<R>) -> Self {
        Self { quarantine }
    }
}

impl<R, B> tower::Service<Request<B>> for ActionService<R>
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
        if req.method() != http::Method::POST || req.uri().path() != ACTION_PATH {
            return Box::pin(future::ok(response::status(
                http::StatusCode::NOT_FOUND,
                "not found",
            )));
        }

        let quarantine = self.quarantine.clone();
        Box::pin(async move {
            let query = req.uri().query().map(str::to_string);
            let is_form = response::has_content_type(&req, "application/x-www-form-urlencoded");
            let body = req
                .into_body()
                .collect()
                .await
                .map_err(|e| Error::Request(e.into()))?
                .to_bytes();

            // The form body takes precedence over the query string.
            let pod_name = is_form
                .then(|| form_value(&body, POD_NAME_PARAM))
                .flatten()
                .or_else(|| query.and_then(|q| form_value(q.as_bytes(), POD_NAME_PARAM)));
            let Some(pod_name) = pod_name else {
                return Ok(response::status(
                    http::StatusCode::BAD_REQUEST,
                    "missing podname",
                ));
            };

            match quarantine.act(&pod_name).await {
                Ok(quarantined) => {
                    debug!(pod = %pod_name, ?quarantined);
                    Ok(response::json(http::StatusCode::CREATED, &quarantined)?)
                }
                Err(error) => {
                    warn!(%error, pod = %pod_name, "Failed to quarantine");
                    Ok(response::status(
                        http::StatusCode::INTERNAL_SERVER_ERROR,
                        &error.to_string(),
                    ))
                }
            }
        })
    }
}

fn form_value(input: &[u8], key: &str) -> Option<String> {
    url::form_urlencoded::parse(input)
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

/// Serves the action endpoint until the drain signal fires. Connections that
/// are in flight are completed first.
pub async fn serve<R: Repository>(
    addr: SocketAddr,
    svc: ActionService<R>,
    drain: drain::Watch,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "action server listening");

    let signaled = drain.clone().signaled();
    tokio::pin!(signaled);
    loop {
        let (stream, client) = tokio::select! {
            accept = listener.accept() => accept?,
            _ = &mut signaled => break,
        };

        let svc = svc.clone();
        let drain = drain.clone();
        tokio::spawn(
            async move {
                let io = TokioIo::new(stream);
                let service =
                    hyper::service::service_fn(move |req: Request<hyper::body::Incoming>| {
                        let mut svc = svc.clone();
                        tower::Service::call(&mut svc, req)
                    });
                let conn =
                    hyper::server::conn::http1::Builder::new().serve_connection(io, service);
                tokio::pin!(conn);
                let res = tokio::select! {
                    res = conn.as_mut() => res,
                    handle = drain.signaled() => {
                        conn.as_mut().graceful_shutdown();
                        handle.release_after(conn).await
                    }
                };
                if let Err(error) = res {
                    debug!(%error, "Connection closed");
                }
            }
            .instrument(info_span!("conn", %client)),
        );
    }

    info!("action server stopped");
    Ok(())
}
