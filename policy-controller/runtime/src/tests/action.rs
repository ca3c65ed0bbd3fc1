use super::*;
use crate::{action::ActionService, quarantine::Quarantine};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{http, Request};
use tower::Service;

fn service(cluster: &FakeCluster) -> ActionService<FakeCluster> {
    ActionService::new(Quarantine::new(cluster.clone()))
}

fn cluster() -> FakeCluster {
    let cluster = FakeCluster::default();
    let pod_labels = labels([("app", "web")]);
    let mut web = mk_deployment("default", "web", pod_labels.clone());
    web.metadata.annotations = Some(labels([(annotations::ACTION, "quarantine")]));
    cluster.add_deployment(web);
    cluster.add_pod(mk_injected_pod("default", "web-1", pod_labels));
    cluster
}

async fn send(
    svc: &mut ActionService<FakeCluster>,
    req: Request<Full<Bytes>>,
) -> (http::StatusCode, Bytes) {
    let rsp = svc.call(req).await.expect("request must succeed");
    let status = rsp.status();
    (status, rsp.into_body().collect().await.unwrap().to_bytes())
}

fn form(uri: &str, body: &'static str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(http::Method::POST)
        .uri(uri)
        .header(
            http::header::CONTENT_TYPE,
            "application/x-www-form-urlencoded",
        )
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap()
}

#[tokio::test]
async fn quarantines_reported_pod() {
    let _tracing = init_tracing();
    let cluster = cluster();
    let (status, body) = send(&mut service(&cluster), form("/action", "podname=web-1")).await;
    assert_eq!(status, http::StatusCode::CREATED);
    let scaled: Vec<String> = serde_json::from_slice(&body).unwrap();
    assert_eq!(scaled, vec!["web"]);
    assert_eq!(
        cluster.deployment("default", "web").spec.unwrap().replicas,
        Some(0)
    );
}

#[tokio::test]
async fn pod_name_from_query() {
    let _tracing = init_tracing();
    let cluster = cluster();
    let (status, body) = send(&mut service(&cluster), form("/action?podname=web-1", "")).await;
    assert_eq!(status, http::StatusCode::CREATED);
    assert_eq!(&body[..], b"[\"web\"]");
}

#[tokio::test]
async fn unknown_pod_returns_empty_list() {
    let _tracing = init_tracing();
    let (status, body) = send(&mut service(&cluster()), form("/action", "podname=nope")).await;
    assert_eq!(status, http::StatusCode::CREATED);
    assert_eq!(&body[..], b"[]");
}

#[tokio::test]
async fn rejects_bad_requests() {
    let _tracing = init_tracing();
    let mut svc = service(&cluster());

    let (status, _) = send(&mut svc, form("/action", "other=1")).await;
    assert_eq!(status, http::StatusCode::BAD_REQUEST);

    let (status, _) = send(&mut svc, form("/elsewhere", "podname=web-1")).await;
    assert_eq!(status, http::StatusCode::NOT_FOUND);

    let get = Request::builder()
        .method(http::Method::GET)
        .uri("/action?podname=web-1")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _) = send(&mut svc, get).await;
    assert_eq!(status, http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failure_is_a_server_error() {
    let _tracing = init_tracing();
    let cluster = cluster();
    cluster.fail_next(1);
    let (status, _) = send(&mut service(&cluster), form("/action", "podname=web-1")).await;
    assert_eq!(status, http::StatusCode::INTERNAL_SERVER_ERROR);
}
