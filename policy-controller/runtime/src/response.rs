use hyper::{http, Response};
use serde::Serialize;

pub type Body = http_body_util::Full<bytes::Bytes>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) fn status(status: http::StatusCode, msg: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(Body::from(msg.to_string()))
        .expect("status response must be valid")
}

pub(crate) fn json<T: Serialize>(
    status: http::StatusCode,
    value: &T,
) -> serde_json::Result<Response<Body>> {
    let bytes = serde_json::to_vec(value)?;
    Ok(Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("json response must be valid"))
}

/// Returns true if the request declares a content type with the given
/// essence, ignoring parameters such as `charset`.
pub(crate) fn has_content_type<B>(req: &http::Request<B>, essence: &str) -> bool {
    req.headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().eq_ignore_ascii_case(essence))
        .unwrap_or(false)
}
