// HTTP route handlers for the Gavel API

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use gavel_common::error::JudgeError;
use gavel_common::types::{Difficulty, Exercise, StatusEvent, SubmissionStatus};
use gavel_engine::store::{DEFAULT_PAGE_LIMIT, MAX_PAGE, MAX_PAGE_LIMIT};
use gavel_engine::{ExerciseCatalog, JobSpec, ListFilter, SubmitRequest};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info};
use uuid::Uuid;

use crate::AppState;

pub const SUBMITTER_HEADER: &str = "x-submitter-id";
/// Role asserted by the upstream gateway; `admin` unlocks cross-owner listings
pub const ROLE_HEADER: &str = "x-submitter-role";

const ADMIN_PAGE_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub exercise_id: String,
    pub source_code: String,
    pub language: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub owner: Option<String>,
    pub exercise_id: Option<String>,
    pub status: Option<String>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExerciseQuery {
    pub difficulty: Option<String>,
}

fn error_body(status: StatusCode, message: &str, details: Vec<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": message,
            "details": details,
        })),
    )
        .into_response()
}

/// Map judge errors onto HTTP responses without leaking host details
fn judge_error(err: JudgeError) -> Response {
    match err {
        JudgeError::Validation(details) => {
            error_body(StatusCode::BAD_REQUEST, "Validation failed", details)
        }
        JudgeError::Capacity => error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "Judge is at capacity, retry later",
            vec![],
        ),
        JudgeError::NotFound(id) => error_body(
            StatusCode::NOT_FOUND,
            "Submission not found",
            vec![id.to_string()],
        ),
        JudgeError::Internal(_) | JudgeError::Store(_) => {
            error!(error = %err, "Request failed");
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal judge error",
                vec![],
            )
        }
    }
}

fn parse_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| {
        error_body(
            StatusCode::BAD_REQUEST,
            "Invalid submission ID format",
            vec![raw.to_string()],
        )
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn submitter(headers: &HeaderMap) -> Option<String> {
    header_value(headers, SUBMITTER_HEADER)
}

fn is_admin(headers: &HeaderMap) -> bool {
    header_value(headers, ROLE_HEADER).as_deref() == Some("admin")
}

/// Build a listing filter from query parameters, rejecting unknown statuses
fn list_filter(
    owner: Option<String>,
    query: ListQuery,
    default_limit: usize,
) -> Result<ListFilter, Response> {
    let status = match query.status.as_deref().map(str::parse::<SubmissionStatus>) {
        None => None,
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => {
            return Err(error_body(
                StatusCode::BAD_REQUEST,
                "Invalid status filter",
                vec![e],
            ))
        }
    };

    Ok(ListFilter {
        owner,
        exercise_id: query.exercise_id,
        status,
        page: query.page.unwrap_or(1).clamp(1, MAX_PAGE),
        limit: query.limit.unwrap_or(default_limit).clamp(1, MAX_PAGE_LIMIT),
    })
}

async fn listing_response(state: &AppState, filter: ListFilter) -> Response {
    match state.judge.list(&filter).await {
        Ok(submissions) => Json(serde_json::json!({
            "submissions": submissions,
            "page": filter.page,
            "limit": filter.limit,
        }))
        .into_response(),
        Err(e) => judge_error(e),
    }
}

/// GET /health - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /languages - Supported language tags
pub async fn list_languages(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({ "languages": state.judge.languages() })).into_response()
}

/// POST /submissions - Submit code against an exercise
pub async fn submit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SubmitBody>,
) -> Response {
    let request = SubmitRequest {
        exercise_id: payload.exercise_id,
        source_code: payload.source_code,
        language: payload.language,
        owner: submitter(&headers),
    };

    match state.judge.submit(request).await {
        Ok(submitted) => {
            info!(submission_id = %submitted.submission_id, "Submission accepted");
            (StatusCode::ACCEPTED, Json(submitted)).into_response()
        }
        Err(e) => judge_error(e),
    }
}

/// POST /jobs - Submit code with inline test cases
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut payload): Json<JobSpec>,
) -> Response {
    if let Some(owner) = submitter(&headers) {
        payload.owner = Some(owner);
    }

    match state.judge.submit_job(payload).await {
        Ok(submitted) => {
            info!(submission_id = %submitted.submission_id, "Job accepted");
            (StatusCode::ACCEPTED, Json(submitted)).into_response()
        }
        Err(e) => judge_error(e),
    }
}

/// GET /submissions/:id - Latest status snapshot
pub async fn get_submission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.judge.status(id).await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => judge_error(e),
    }
}

/// POST /submissions/:id/cancel - Cancel and report the final status
pub async fn cancel_submission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.judge.cancel(id).await {
        Ok(snapshot) => {
            info!(submission_id = %id, status = %snapshot.status, "Cancel acknowledged");
            Json(serde_json::json!({
                "submission_id": id,
                "status": snapshot.status,
            }))
            .into_response()
        }
        Err(e) => judge_error(e),
    }
}

/// GET /submissions - A submitter's submissions, newest first
pub async fn list_submissions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(mut query): Query<ListQuery>,
) -> Response {
    let Some(owner) = submitter(&headers).or(query.owner.take()) else {
        return error_body(
            StatusCode::BAD_REQUEST,
            "Submitter identity required",
            vec![format!("set the {} header or the owner query parameter", SUBMITTER_HEADER)],
        );
    };

    match list_filter(Some(owner), query, DEFAULT_PAGE_LIMIT) {
        Ok(filter) => listing_response(&state, filter).await,
        Err(response) => response,
    }
}

/// GET /admin/submissions - Every submitter's submissions, admins only
pub async fn list_all_submissions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(mut query): Query<ListQuery>,
) -> Response {
    if !is_admin(&headers) {
        return error_body(
            StatusCode::FORBIDDEN,
            "Administrator role required",
            vec![format!("set {}: admin", ROLE_HEADER)],
        );
    }

    let owner = query.owner.take();
    match list_filter(owner, query, ADMIN_PAGE_LIMIT) {
        Ok(filter) => listing_response(&state, filter).await,
        Err(response) => response,
    }
}

/// GET /exercises - Public view of every exercise, optionally by difficulty
pub async fn list_exercises(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExerciseQuery>,
) -> Response {
    let difficulty = match query.difficulty.as_deref().map(str::parse::<Difficulty>) {
        None => None,
        Some(Ok(difficulty)) => Some(difficulty),
        Some(Err(e)) => {
            return error_body(StatusCode::BAD_REQUEST, "Invalid difficulty filter", vec![e])
        }
    };

    let mut exercises: Vec<_> = state
        .judge
        .catalog()
        .list()
        .iter()
        .filter(|e| difficulty.map_or(true, |d| e.difficulty == d))
        .map(Exercise::public_view)
        .collect();
    exercises.sort_by(|a, b| a.id.cmp(&b.id));
    Json(serde_json::json!({ "exercises": exercises })).into_response()
}

/// GET /exercises/:id - Public view, expected outputs never included
pub async fn get_exercise(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.judge.catalog().lookup(&id) {
        Some(exercise) => Json(exercise.public_view()).into_response(),
        None => error_body(StatusCode::NOT_FOUND, "Exercise not found", vec![id]),
    }
}

/// PUT /exercises/:id - Create or replace an exercise
pub async fn put_exercise(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut exercise): Json<Exercise>,
) -> Response {
    exercise.id = id;
    let view = exercise.public_view();

    match state.judge.catalog().upsert(exercise) {
        Ok(()) => {
            info!(exercise_id = %view.id, "Exercise stored");
            (StatusCode::OK, Json(view)).into_response()
        }
        Err(e) => judge_error(e),
    }
}

fn to_sse(event: &StatusEvent) -> Result<Event, Infallible> {
    Ok(Event::default()
        .event("status")
        .data(serde_json::to_string(event).unwrap_or_default()))
}

struct EventCursor {
    state: Arc<AppState>,
    receiver: broadcast::Receiver<StatusEvent>,
    pending: Option<StatusEvent>,
    id: Uuid,
}

impl EventCursor {
    async fn next_event(&mut self) -> Option<StatusEvent> {
        if let Some(event) = self.pending.take() {
            return Some(event);
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.submission_id == self.id => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => {
                    // Missed events; the stored status is authoritative
                    let snapshot = self.state.judge.status(self.id).await.ok()?;
                    return Some(StatusEvent {
                        submission_id: self.id,
                        status: snapshot.status,
                        current_test: snapshot.current_test,
                    });
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// GET /submissions/:id/events - Server-sent status events until terminal
pub async fn submission_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    // Subscribe before reading so nothing falls between the two
    let receiver = state.judge.subscribe();
    let current = match state.judge.status(id).await {
        Ok(snapshot) => snapshot,
        Err(e) => return judge_error(e),
    };

    let cursor = EventCursor {
        state: state.clone(),
        receiver,
        pending: Some(StatusEvent {
            submission_id: id,
            status: current.status,
            current_test: current.current_test,
        }),
        id,
    };

    let stream = futures_util::stream::unfold(Some(cursor), |cursor| async move {
        let mut cursor = cursor?;
        let event = cursor.next_event().await?;
        let next = if event.status.is_terminal() {
            None
        } else {
            Some(cursor)
        };
        Some((to_sse(&event), next))
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use gavel_common::config::JudgeConfig;
    use gavel_common::types::TestCase;
    use gavel_engine::languages::{CommandSpec, LanguageConfig};
    use gavel_engine::{Judge, LanguageRegistry, MemoryStore, StaticCatalog, TestCaseSpec};
    use std::time::Duration;

    fn app_state(workspaces: &std::path::Path) -> Arc<AppState> {
        let mut config = JudgeConfig::default();
        config.scheduler.workers = 1;
        config.scheduler.queue_capacity = 4;
        config.sandbox.workspace_root = workspaces.to_path_buf();
        config.sandbox.isolate_network = false;

        let mut registry = LanguageRegistry::builtin();
        registry
            .insert(LanguageConfig {
                name: "sh".to_string(),
                aliases: vec![],
                version: String::new(),
                source_file: "solution.sh".to_string(),
                binary: None,
                compile: None,
                run: CommandSpec {
                    program: "sh".to_string(),
                    args: vec!["{source}".to_string()],
                },
                address_space_limit: true,
                runtime_overhead_mb: 0,
            })
            .unwrap();

        let catalog = StaticCatalog::empty(config.limits.clone());
        catalog
            .upsert(Exercise {
                id: "hello".to_string(),
                title: "Hello".to_string(),
                description: String::new(),
                starter_code: "echo".to_string(),
                test_cases: vec![TestCase {
                    input: String::new(),
                    expected_output: "Hello World".to_string(),
                    description: Some("greets".to_string()),
                }],
                time_limit_secs: 2,
                memory_limit_mb: 64,
                difficulty: Difficulty::Easy,
            })
            .unwrap();

        Arc::new(AppState {
            judge: Judge::new(
                config,
                registry,
                Arc::new(catalog),
                Arc::new(MemoryStore::new()),
            ),
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn headers(owner: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SUBMITTER_HEADER, HeaderValue::from_str(owner).unwrap());
        headers
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = health_check().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submit_and_poll_until_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path());

        let response = submit(
            State(state.clone()),
            headers("alice"),
            Json(SubmitBody {
                exercise_id: "hello".to_string(),
                source_code: "echo Hello World".to_string(),
                language: "sh".to_string(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "pending");
        let id = body["submission_id"].as_str().unwrap().to_string();

        let mut status = String::new();
        for _ in 0..200 {
            let response = get_submission(State(state.clone()), Path(id.clone())).await;
            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            status = body["status"].as_str().unwrap().to_string();
            if status != "pending" && status != "compiling" && status != "running" {
                assert_eq!(body["summary"]["percentage"], 100);
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(status, "accepted");

        let listed = list_submissions(
            State(state.clone()),
            headers("alice"),
            Query(ListQuery::default()),
        )
        .await;
        let body = body_json(listed).await;
        assert_eq!(body["submissions"].as_array().unwrap().len(), 1);
        assert_eq!(body["limit"], 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_validation_errors_are_400_with_details() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path());

        let response = submit_job(
            State(state.clone()),
            HeaderMap::new(),
            Json(JobSpec {
                source_code: String::new(),
                language: "cobol".to_string(),
                test_cases: vec![TestCaseSpec {
                    input: String::new(),
                    expected_output: None,
                    description: None,
                }],
                time_limit_secs: Some(99),
                memory_limit_mb: None,
                owner: None,
                exercise_id: None,
            }),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Validation failed");
        assert_eq!(body["details"].as_array().unwrap().len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_and_malformed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path());

        let response = get_submission(State(state.clone()), Path("not-a-uuid".to_string())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response =
            get_submission(State(state.clone()), Path(Uuid::new_v4().to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response =
            cancel_submission(State(state.clone()), Path(Uuid::new_v4().to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exercise_view_hides_expected_output() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path());

        let response = get_exercise(State(state.clone()), Path("hello".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["test_cases"][0]["description"], "greets");
        assert!(body["test_cases"][0].get("expected_output").is_none());
        assert_eq!(body["starter_code"], "echo");

        let response = get_exercise(State(state.clone()), Path("nope".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_put_exercise_validates_limits() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path());

        let mut exercise = state.judge.catalog().lookup("hello").unwrap();
        exercise.memory_limit_mb = 4096;
        let response = put_exercise(
            State(state.clone()),
            Path("big".to_string()),
            Json(exercise.clone()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        exercise.memory_limit_mb = 256;
        let response =
            put_exercise(State(state.clone()), Path("big".to_string()), Json(exercise)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.judge.catalog().lookup("big").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_list_requires_owner_and_valid_status() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path());

        let response = list_submissions(
            State(state.clone()),
            HeaderMap::new(),
            Query(ListQuery::default()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = list_submissions(
            State(state.clone()),
            HeaderMap::new(),
            Query(ListQuery {
                owner: Some("bob".to_string()),
                status: Some("finished".to_string()),
                ..ListQuery::default()
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    fn echo_job(owner: &str) -> JobSpec {
        JobSpec {
            source_code: "echo hi".to_string(),
            language: "sh".to_string(),
            test_cases: vec![TestCaseSpec {
                input: String::new(),
                expected_output: Some("hi".to_string()),
                description: None,
            }],
            time_limit_secs: None,
            memory_limit_mb: None,
            owner: Some(owner.to_string()),
            exercise_id: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_admin_listing_spans_owners() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path());
        for owner in ["alice", "bob"] {
            let response = submit_job(State(state.clone()), headers(owner), Json(echo_job(owner))).await;
            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }

        let response = list_all_submissions(
            State(state.clone()),
            headers("alice"),
            Query(ListQuery::default()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let mut admin = headers("root");
        admin.insert(ROLE_HEADER, HeaderValue::from_static("admin"));
        let body = body_json(
            list_all_submissions(State(state.clone()), admin.clone(), Query(ListQuery::default()))
                .await,
        )
        .await;
        assert_eq!(body["submissions"].as_array().unwrap().len(), 2);
        assert_eq!(body["limit"], 50);

        let body = body_json(
            list_all_submissions(
                State(state.clone()),
                admin,
                Query(ListQuery {
                    owner: Some("bob".to_string()),
                    ..ListQuery::default()
                }),
            )
            .await,
        )
        .await;
        let submissions = body["submissions"].as_array().unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0]["owner"], "bob");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_out_of_range_page_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path());
        let response = submit_job(State(state.clone()), headers("alice"), Json(echo_job("alice"))).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = list_submissions(
            State(state.clone()),
            headers("alice"),
            Query(ListQuery {
                page: Some(usize::MAX),
                ..ListQuery::default()
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["submissions"].as_array().unwrap().is_empty());
        assert_eq!(body["page"], MAX_PAGE);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exercises_filter_by_difficulty() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path());
        let mut hard = state.judge.catalog().lookup("hello").unwrap();
        hard.id = "hard-one".to_string();
        hard.difficulty = Difficulty::Hard;
        state.judge.catalog().upsert(hard).unwrap();

        let query = |difficulty: Option<&str>| {
            Query(ExerciseQuery {
                difficulty: difficulty.map(str::to_string),
            })
        };

        let body = body_json(list_exercises(State(state.clone()), query(None)).await).await;
        assert_eq!(body["exercises"].as_array().unwrap().len(), 2);

        let body = body_json(list_exercises(State(state.clone()), query(Some("hard"))).await).await;
        let exercises = body["exercises"].as_array().unwrap();
        assert_eq!(exercises.len(), 1);
        assert_eq!(exercises[0]["id"], "hard-one");

        let response = list_exercises(State(state.clone()), query(Some("brutal"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_languages_listed() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path());
        let body = body_json(list_languages(State(state)).await).await;
        let languages = body["languages"].as_array().unwrap();
        assert!(languages.iter().any(|l| l == "sh"));
        assert!(languages.iter().any(|l| l == "cpp"));
    }
}
