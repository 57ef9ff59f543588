use axum::{routing::get, Router};

pub mod backup;
pub mod system;

/// Router for the backup endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/backup", get(backup::poll).post(backup::submit))
        .route("/backup/list", get(backup::list))
}
