use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use vds_common::{Approval, AutonomyLevel, SessionStatus};

use crate::errors::OrchestratorError;
use crate::supervisor::{Orchestrator, SessionRequest};
use crate::ws;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Orchestrator,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub question: String,
    pub domain: Option<String>,
    pub autonomy_level: Option<String>,
    #[serde(default)]
    pub data_source_ids: Vec<String>,
}

#[derive(Deserialize)]
pub struct ApproveRequest {
    pub approved: bool,
    pub note: Option<String>,
}

#[derive(Deserialize)]
pub struct ListSessionsQuery {
    pub status: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::SessionNotFound { .. } => ApiError::NotFound(err.to_string()),
            OrchestratorError::NotAwaitingApproval { .. }
            | OrchestratorError::ApprovalAlreadyRecorded { .. }
            | OrchestratorError::SessionTerminal { .. } => ApiError::Conflict(err.to_string()),
            other => {
                tracing::error!(error = %other, "request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/messages", get(list_messages))
        .route("/api/sessions/{id}/artifacts", get(list_artifacts))
        .route("/api/sessions/{id}/audit", get(list_audit_events))
        .route("/api/sessions/{id}/approve", post(approve_session))
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_session(
    State(state): State<SharedState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.question.trim().is_empty() {
        return Err(ApiError::BadRequest("question is required".into()));
    }
    let autonomy = req
        .autonomy_level
        .as_deref()
        .map(AutonomyLevel::from_str)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let session = state
        .orchestrator
        .submit(SessionRequest {
            question: req.question,
            domain: req.domain,
            autonomy,
            data_source_ids: req.data_source_ids,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn list_sessions(
    State(state): State<SharedState>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(SessionStatus::from_str)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let sessions = state.orchestrator.store().list_sessions(status).await?;
    Ok(Json(sessions))
}

async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.orchestrator.store().require_session(&id).await?;
    Ok(Json(session))
}

async fn list_messages(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.orchestrator.store();
    store.require_session(&id).await?;
    Ok(Json(store.list_messages(&id).await?))
}

async fn list_artifacts(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.orchestrator.store();
    store.require_session(&id).await?;
    Ok(Json(store.list_artifacts(&id).await?))
}

async fn list_audit_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.orchestrator.store();
    store.require_session(&id).await?;
    Ok(Json(store.list_audit_events(&id).await?))
}

async fn approve_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ApproveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let approval = Approval {
        approved: req.approved,
        note: req.note,
    };
    let session = state.orchestrator.approve(&id, approval).await?;
    Ok(Json(session))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Capability, CapabilityRegistry};
    use crate::plan::{StepDef, build_plan};
    use crate::store::{DbHandle, ProgressUpdate, SessionStore};
    use crate::supervisor::SupervisorSettings;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Map, Value, json};
    use tower::ServiceExt;

    struct Summary;

    #[async_trait]
    impl Capability for Summary {
        async fn run(
            &self,
            _q: &str,
            _d: &str,
            _c: &Map<String, Value>,
            _ids: &[String],
        ) -> anyhow::Result<Map<String, Value>> {
            let mut out = Map::new();
            out.insert("executive_summary".into(), json!("All good."));
            Ok(out)
        }
    }

    fn steps() -> Vec<StepDef> {
        vec![StepDef::new("frame", "Problem Framer"), StepDef::new("narrate", "Insight Narrator")]
    }

    fn test_state() -> (SharedState, DbHandle) {
        let store = DbHandle::in_memory().unwrap();
        let registry = CapabilityRegistry::new()
            .with("frame", Arc::new(Summary))
            .with("narrate", Arc::new(Summary));
        let settings = SupervisorSettings {
            default_autonomy: AutonomyLevel::Autonomous,
            ..SupervisorSettings::default()
        }
        .with_steps(steps());
        let orchestrator = Orchestrator::new(Arc::new(store.clone()), registry, settings).unwrap();
        (Arc::new(AppState { orchestrator }), store)
    }

    fn test_app(state: SharedState) -> Router {
        api_router().with_state(state)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    /// A session parked at a checkpoint, with no supervisor running.
    async fn checkpoint_session(state: &SharedState, store: &DbHandle) -> String {
        let session = state
            .orchestrator
            .create_session(SessionRequest {
                question: "Why?".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .update_progress(
                &session.id,
                ProgressUpdate {
                    status: Some(SessionStatus::Planned),
                    plan: Some(build_plan(&steps())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update_progress(&session.id, ProgressUpdate::status(SessionStatus::Checkpoint))
            .await
            .unwrap();
        session.id
    }

    #[tokio::test]
    async fn test_health_check() {
        let (state, _) = test_state();
        let response = test_app(state).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_create_session_returns_created() {
        let (state, store) = test_state();
        let response = test_app(state)
            .oneshot(post_json(
                "/api/sessions",
                json!({"question": "Why did churn rise?", "domain": "telecom"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let session: Value = body_json(response.into_body()).await;
        assert_eq!(session["title"], "Why did churn rise?");
        assert_eq!(session["domain"], "telecom");
        assert_eq!(session["autonomy"], "autonomous");
        let id = session["id"].as_str().unwrap().to_string();
        assert!(store.get_session(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_session_rejects_blank_question() {
        let (state, _) = test_state();
        let response = test_app(state)
            .oneshot(post_json("/api/sessions", json!({"question": "  "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_session_rejects_unknown_autonomy() {
        let (state, _) = test_state();
        let response = test_app(state)
            .oneshot(post_json(
                "/api/sessions",
                json!({"question": "q", "autonomy_level": "reckless"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_session_not_found() {
        let (state, _) = test_state();
        let response = test_app(state)
            .oneshot(get("/api/sessions/nope"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_messages_in_creation_order() {
        let (state, store) = test_state();
        let id = checkpoint_session(&state, &store).await;
        let response = test_app(state)
            .oneshot(get(&format!("/api/sessions/{}/messages", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let messages: Vec<Value> = body_json(response.into_body()).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "Why?");
    }

    #[tokio::test]
    async fn test_list_sessions_filters_by_status() {
        let (state, store) = test_state();
        let id = checkpoint_session(&state, &store).await;
        let app = test_app(state);

        let response = app
            .clone()
            .oneshot(get("/api/sessions?status=checkpoint"))
            .await
            .unwrap();
        let sessions: Vec<Value> = body_json(response.into_body()).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["id"], id.as_str());

        let response = app.oneshot(get("/api/sessions?status=done")).await.unwrap();
        let sessions: Vec<Value> = body_json(response.into_body()).await;
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_approve_records_decision_once() {
        let (state, store) = test_state();
        let id = checkpoint_session(&state, &store).await;
        let app = test_app(state);
        let uri = format!("/api/sessions/{}/approve", id);

        let response = app
            .clone()
            .oneshot(post_json(&uri, json!({"approved": true})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let session: Value = body_json(response.into_body()).await;
        assert_eq!(session["approval"]["approved"], true);

        let response = app
            .oneshot(post_json(&uri, json!({"approved": false, "note": "late"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_approve_unknown_session_is_404() {
        let (state, _) = test_state();
        let response = test_app(state)
            .oneshot(post_json("/api/sessions/missing/approve", json!({"approved": true})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_approve_when_not_at_checkpoint_is_409() {
        let (state, _) = test_state();
        let session = state
            .orchestrator
            .create_session(SessionRequest {
                question: "q".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let response = test_app(state)
            .oneshot(post_json(
                &format!("/api/sessions/{}/approve", session.id),
                json!({"approved": true}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
