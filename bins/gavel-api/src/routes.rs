use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/languages", get(handlers::list_languages))
        .route(
            "/submissions",
            post(handlers::submit).get(handlers::list_submissions),
        )
        .route("/jobs", post(handlers::submit_job))
        .route("/admin/submissions", get(handlers::list_all_submissions))
        .route("/submissions/:id", get(handlers::get_submission))
        .route("/submissions/:id/cancel", post(handlers::cancel_submission))
        .route("/submissions/:id/events", get(handlers::submission_events))
        .route("/exercises", get(handlers::list_exercises))
        .route(
            "/exercises/:id",
            get(handlers::get_exercise).put(handlers::put_exercise),
        )
}
