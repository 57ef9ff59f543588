use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{Instrument, info_span};

use ctbackup_core::CorrelationId;

use crate::context::{REQUEST_ID_HEADER, RequestContext};

/// Injects a [`RequestContext`], runs the request inside a `request` span and
/// echoes the id in the `Request-ID` response header.
pub async fn request_context_middleware(mut req: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers(req.headers()).unwrap_or_else(CorrelationId::new);

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
    );

    req.extensions_mut()
        .insert(RequestContext::new(request_id.clone()));

    let mut response = next.run(req).instrument(span).await;
    add_request_id_header(&mut response, &request_id);
    response
}

/// A well-formed caller-supplied id, if any.
pub fn request_id_from_headers(headers: &HeaderMap) -> Option<CorrelationId> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn add_request_id_header(response: &mut Response, request_id: &CorrelationId) {
    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
}
