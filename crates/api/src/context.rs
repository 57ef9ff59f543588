use ctbackup_core::CorrelationId;

/// Header carrying the correlation id, in both directions.
pub const REQUEST_ID_HEADER: &str = "request-id";

/// Per-request context.
///
/// The id is either the caller's well-formed `Request-Id` or a fresh one. On
/// `POST /backup` it becomes the job's correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    request_id: CorrelationId,
}

impl RequestContext {
    pub fn new(request_id: CorrelationId) -> Self {
        Self { request_id }
    }

    pub fn request_id(&self) -> &CorrelationId {
        &self.request_id
    }
}
