use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::MonitorError;
use crate::monitor::Monitor;

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<Monitor>,
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub id: i64,
}

#[derive(Deserialize)]
pub struct ExtendRequest {
    pub days: u32,
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub owner_id: i64,
    pub name: String,
    pub url: String,
    pub cadence_minutes: u32,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/users", post(register_user))
        .route("/users/:id", get(get_user))
        .route("/users/:id/extend", post(extend_subscription))
        .route("/users/:id/tasks", get(list_tasks))
        .route("/tasks", post(create_task))
        .route("/tasks/:id", get(get_task).delete(remove_task))
        .with_state(state)
}

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        let status = match &self {
            MonitorError::InvalidSource(_)
            | MonitorError::InvalidCadence
            | MonitorError::InvalidDays => StatusCode::BAD_REQUEST,
            MonitorError::NotFound(_) => StatusCode::NOT_FOUND,
            MonitorError::AlreadyExists(_) => StatusCode::CONFLICT,
            MonitorError::NoListingsFound(_) => StatusCode::UNPROCESSABLE_ENTITY,
            MonitorError::FetchFailed(_) => StatusCode::BAD_GATEWAY,
            MonitorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("API error: {self}");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn register_user(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, MonitorError> {
    let user = state.monitor.register_user(req.id).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, MonitorError> {
    Ok(Json(state.monitor.get_user(id).await?))
}

async fn extend_subscription(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ExtendRequest>,
) -> Result<impl IntoResponse, MonitorError> {
    let expiry = state.monitor.extend_subscription(id, req.days).await?;
    Ok(Json(serde_json::json!({ "id": id, "subscription_expiry": expiry })))
}

async fn list_tasks(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, MonitorError> {
    Ok(Json(state.monitor.list_tasks(id).await?))
}

async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, MonitorError> {
    let task = state
        .monitor
        .create_task(req.owner_id, &req.name, &req.url, req.cadence_minutes)
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, MonitorError> {
    Ok(Json(state.monitor.get_task(id).await?))
}

async fn remove_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, MonitorError> {
    match state.monitor.remove_task(id).await {
        Ok(()) | Err(MonitorError::NotFound(_)) => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::listing::ListingFetcher;
    use crate::monitor::MonitorSettings;
    use crate::notify::LogNotifier;
    use crate::store::Db;

    fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("api.sqlite")).unwrap();
        let cfg = Config::default();
        let monitor = Monitor::new(
            Arc::new(db.tasks()),
            Arc::new(db.users()),
            Arc::new(ListingFetcher::new(&cfg.fetcher).unwrap()),
            Arc::new(LogNotifier),
            MonitorSettings::from_config(&cfg),
        );
        (dir, AppState { monitor })
    }

    fn status_of(e: MonitorError) -> StatusCode {
        e.into_response().status()
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_of(MonitorError::InvalidSource("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(MonitorError::InvalidCadence), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(MonitorError::NotFound("task 1".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(MonitorError::AlreadyExists("user 1".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_of(MonitorError::NoListingsFound("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_of(MonitorError::FetchFailed("503".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_of(MonitorError::Store(anyhow::anyhow!("locked"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_delete_absent_task_is_no_content() {
        let (_dir, state) = test_state();
        let resp = remove_task(State(state.clone()), Path(99)).await.into_response();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = get_task(State(state), Path(99)).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
