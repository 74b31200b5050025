// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

mod config;
mod gateway;
mod orchestrator;
mod prompts;
mod simulated;
mod store;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use lambda_http::run as lambda_run;
use lifesim_common::{
    DbHealthResponse, ErrorBody, GenerateBackgroundRequest, GenerateBackgroundResponse,
    GenerateResultRequest, GenerateResultResponse, GenerateStoryRequest, GenerateStoryResponse,
    LambdaHealthResponse, ResolveEventRequest, ResolveEventResponse, SessionSnapshotResponse,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::{GenerationMode, ServiceConfig};
use crate::gateway::{
    DisabledImages, Gateway, HttpRetriever, ImageClient, ModelClient, NoRetriever,
    OpenAiImageClient, OpenAiModelClient, Retriever,
};
use crate::orchestrator::{TurnError, TurnOrchestrator};
use crate::simulated::SimulatedModelClient;
use crate::store::{DynamoSessionStore, InMemorySessionStore, SessionStore};

#[derive(Clone)]
struct AppState {
    orchestrator: TurnOrchestrator,
    store: Arc<dyn SessionStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "story_service=debug,tower_http=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env()?;

    let store: Arc<dyn SessionStore> = match DynamoSessionStore::from_env().await {
        Some(store) => Arc::new(store),
        None => {
            warn!("no DynamoDB configuration found; sessions are kept in memory");
            Arc::new(InMemorySessionStore::default())
        }
    };

    let orchestrator = TurnOrchestrator::new(
        store.clone(),
        build_gateway(&config),
        config.phases.clone(),
    );
    info!(
        generation_mode = config.generation_mode.as_str(),
        total_turns = orchestrator.phases().total_turns(),
        phases = orchestrator.phases().phases().len(),
        "turn engine configured"
    );

    let app = build_router(AppState {
        orchestrator,
        store,
    });

    if std::env::var("AWS_LAMBDA_RUNTIME_API").is_ok() {
        info!("AWS Lambda runtime detected; running story-service in lambda mode");
        lambda_run(app)
            .await
            .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
        return Ok(());
    }

    info!(bind_addr = %config.bind_addr, "story-service listening");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_gateway(config: &ServiceConfig) -> Gateway {
    let llm = &config.llm;
    let model: Arc<dyn ModelClient> = match config.generation_mode {
        GenerationMode::Live => Arc::new(OpenAiModelClient::new(
            llm.base_url.clone(),
            llm.api_key.clone().unwrap_or_default(),
            llm.model.clone(),
            llm.timeout,
        )),
        GenerationMode::Simulated => Arc::new(SimulatedModelClient::new()),
    };

    let images: Arc<dyn ImageClient> = match (config.generation_mode, &llm.image_model) {
        (GenerationMode::Live, Some(image_model)) => {
            info!(image_model = %image_model, "image generation enabled");
            Arc::new(OpenAiImageClient::new(
                llm.base_url.clone(),
                llm.api_key.clone().unwrap_or_default(),
                image_model.clone(),
                llm.timeout,
            ))
        }
        _ => Arc::new(DisabledImages),
    };

    let retriever: Arc<dyn Retriever> = match &config.retrieval.url {
        Some(url) => Arc::new(HttpRetriever::new(url.clone(), config.retrieval.top_k)),
        None => Arc::new(NoRetriever),
    };

    Gateway::new(model, retriever, images)
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/lambda-health", get(lambda_health_handler))
        .route("/db-health", get(db_health_handler))
        .route("/generate-background", post(generate_background_handler))
        .route("/generate-story", post(generate_story_handler))
        .route("/resolve-event", post(resolve_event_handler))
        .route("/generate-result", post(generate_result_handler))
        .route("/sessions/{session_id}", get(get_session_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "story-service"}))
}

async fn lambda_health_handler() -> Json<LambdaHealthResponse> {
    Json(LambdaHealthResponse {
        ok: true,
        timestamp: Utc::now(),
    })
}

async fn db_health_handler(
    State(state): State<AppState>,
) -> Result<Json<DbHealthResponse>, ApiError> {
    let health = state
        .store
        .health()
        .await
        .map_err(|error| ApiError::storage_unavailable(error.to_string()))?;
    Ok(Json(DbHealthResponse {
        ok: true,
        table: health.table,
        item_exists: health.item_exists,
    }))
}

async fn generate_background_handler(
    State(state): State<AppState>,
    payload: Result<Json<GenerateBackgroundRequest>, JsonRejection>,
) -> Result<Json<GenerateBackgroundResponse>, ApiError> {
    let Json(request) = payload.map_err(ApiError::from)?;
    let response = state
        .orchestrator
        .start(request.knowledge_base_id.as_deref())
        .await?;
    Ok(Json(response))
}

async fn generate_story_handler(
    State(state): State<AppState>,
    payload: Result<Json<GenerateStoryRequest>, JsonRejection>,
) -> Result<Json<GenerateStoryResponse>, ApiError> {
    let Json(request) = payload.map_err(ApiError::from)?;
    let response = state
        .orchestrator
        .next_event(request.session_id.as_deref())
        .await?;
    Ok(Json(response))
}

async fn resolve_event_handler(
    State(state): State<AppState>,
    payload: Result<Json<ResolveEventRequest>, JsonRejection>,
) -> Result<Json<ResolveEventResponse>, ApiError> {
    let Json(request) = payload.map_err(ApiError::from)?;
    let response = state
        .orchestrator
        .resolve_choice(
            request.session_id.as_deref(),
            request.event,
            request.selected_option.as_deref(),
        )
        .await?;
    Ok(Json(response))
}

async fn generate_result_handler(
    State(state): State<AppState>,
    payload: Result<Json<GenerateResultRequest>, JsonRejection>,
) -> Result<Json<GenerateResultResponse>, ApiError> {
    let Json(request) = payload.map_err(ApiError::from)?;
    let response = state
        .orchestrator
        .finalize(request.session_id.as_deref())
        .await?;
    Ok(Json(response))
}

async fn get_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshotResponse>, ApiError> {
    let snapshot = state.orchestrator.session(&session_id).await?;
    Ok(Json(snapshot))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_INPUT",
            message: message.into(),
        }
    }

    fn storage_unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "STORAGE_UNAVAILABLE",
            message: message.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<TurnError> for ApiError {
    fn from(error: TurnError) -> Self {
        let (status, code) = match &error {
            TurnError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
            TurnError::NotFound(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
            TurnError::SessionEnded(_) => (StatusCode::CONFLICT, "SESSION_ENDED"),
            TurnError::GameComplete { .. } => (StatusCode::CONFLICT, "GAME_COMPLETE"),
            TurnError::EventAlreadyResolved { .. } => {
                (StatusCode::CONFLICT, "EVENT_ALREADY_RESOLVED")
            }
            TurnError::Conflict(_) => (StatusCode::CONFLICT, "WRITE_CONFLICT"),
            TurnError::GenerationFailed(_) => (StatusCode::BAD_GATEWAY, "GENERATION_FAILED"),
            TurnError::GenerationInvalid(_) => (StatusCode::BAD_GATEWAY, "GENERATION_INVALID"),
            TurnError::StorageUnavailable(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_UNAVAILABLE")
            }
        };
        Self {
            status,
            code,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, code = self.code, message = %self.message, "request failed");
        (
            self.status,
            Json(ErrorBody {
                message: self.message,
                error: Some(self.code.to_string()),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StoreError, StoreHealth};
    use axum::body::Body;
    use axum::extract::{FromRequest, Request};
    use axum::http::header::CONTENT_TYPE;
    use lifesim_common::{PhaseTable, Session};
    use serde_json::Value;

    struct UnreachableStore;

    #[async_trait::async_trait]
    impl SessionStore for UnreachableStore {
        async fn create(&self, _session: &Session) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn get(&self, _session_id: &str) -> Result<Session, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn put(&self, _session: Session) -> Result<Session, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn health(&self) -> Result<StoreHealth, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    fn test_state_with(store: Arc<dyn SessionStore>) -> AppState {
        let gateway = Gateway::new(
            Arc::new(SimulatedModelClient::new()),
            Arc::new(NoRetriever),
            Arc::new(DisabledImages),
        );
        AppState {
            orchestrator: TurnOrchestrator::new(store.clone(), gateway, PhaseTable::default()),
            store,
        }
    }

    fn test_state() -> AppState {
        test_state_with(Arc::new(InMemorySessionStore::default()))
    }

    async fn error_body(error: ApiError) -> (StatusCode, Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn start(state: &AppState) -> GenerateBackgroundResponse {
        let Json(started) = generate_background_handler(
            State(state.clone()),
            Ok(Json(GenerateBackgroundRequest {
                knowledge_base_id: Some("kb-harbor".to_string()),
            })),
        )
        .await
        .unwrap();
        started
    }

    #[tokio::test]
    async fn background_handler_creates_session() {
        let state = test_state();
        let started = start(&state).await;

        assert!(started.session_id.starts_with("session_"));
        let Json(snapshot) = get_session_handler(State(state), Path(started.session_id.clone()))
            .await
            .unwrap();
        assert_eq!(snapshot.turn, 0);
        assert_eq!(snapshot.life_goal, started.life_goal);
    }

    #[tokio::test]
    async fn background_image_serializes_as_null() {
        let state = test_state();
        let started = start(&state).await;
        let body = serde_json::to_value(&started).unwrap();
        assert_eq!(body["image"], Value::Null);
        assert!(body.as_object().unwrap().contains_key("image"));
    }

    #[tokio::test]
    async fn missing_session_id_is_bad_request() {
        let error = generate_story_handler(
            State(test_state()),
            Ok(Json(GenerateStoryRequest::default())),
        )
        .await
        .unwrap_err();

        let (status, body) = error_body(error).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "INVALID_INPUT");
        assert_eq!(body["message"], "session_id is required");
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let error = generate_story_handler(
            State(test_state()),
            Ok(Json(GenerateStoryRequest {
                session_id: Some("session_1_00000000".to_string()),
            })),
        )
        .await
        .unwrap_err();

        let (status, body) = error_body(error).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn story_then_resolve_advances_progress() {
        let state = test_state();
        let started = start(&state).await;

        let Json(event) = generate_story_handler(
            State(state.clone()),
            Ok(Json(GenerateStoryRequest {
                session_id: Some(started.session_id.clone()),
            })),
        )
        .await
        .unwrap();
        assert_eq!(event.game_progress.turn, 0);
        assert_eq!(event.game_progress.phase, "Childhood");
        let body = serde_json::to_value(&event).unwrap();
        assert!(!body.as_object().unwrap().contains_key("should_generate_result"));

        let Json(resolved) = resolve_event_handler(
            State(state),
            Ok(Json(ResolveEventRequest {
                session_id: Some(started.session_id),
                event: Some(event.event()),
                selected_option: Some(event.options[1].option_id.clone()),
            })),
        )
        .await
        .unwrap();
        assert_eq!(resolved.game_progress.turn, 1);
        assert_eq!(resolved.game_progress.turns_left, 8);
    }

    #[tokio::test]
    async fn body_that_is_not_json_is_bad_request() {
        let request = Request::builder()
            .method("POST")
            .uri("/generate-story")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from("session_id=abc"))
            .unwrap();
        let payload = Json::<GenerateStoryRequest>::from_request(request, &()).await;
        assert!(payload.is_err());

        let error = generate_story_handler(State(test_state()), payload)
            .await
            .unwrap_err();

        let (status, body) = error_body(error).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "INVALID_INPUT");
    }

    #[tokio::test]
    async fn resolving_an_event_twice_is_a_conflict() {
        let state = test_state();
        let started = start(&state).await;
        let Json(event) = generate_story_handler(
            State(state.clone()),
            Ok(Json(GenerateStoryRequest {
                session_id: Some(started.session_id.clone()),
            })),
        )
        .await
        .unwrap();
        let request = ResolveEventRequest {
            session_id: Some(started.session_id.clone()),
            event: Some(event.event()),
            selected_option: Some("A".to_string()),
        };
        resolve_event_handler(State(state.clone()), Ok(Json(request.clone())))
            .await
            .unwrap();

        let error = resolve_event_handler(State(state.clone()), Ok(Json(request)))
            .await
            .unwrap_err();

        let (status, body) = error_body(error).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "EVENT_ALREADY_RESOLVED");
        let Json(snapshot) = get_session_handler(State(state), Path(started.session_id))
            .await
            .unwrap();
        assert_eq!(snapshot.turn, 1);
        assert_eq!(snapshot.history.len(), 1);
    }

    #[tokio::test]
    async fn resolve_without_event_is_bad_request() {
        let state = test_state();
        let started = start(&state).await;

        let error = resolve_event_handler(
            State(state),
            Ok(Json(ResolveEventRequest {
                session_id: Some(started.session_id),
                event: None,
                selected_option: Some("A".to_string()),
            })),
        )
        .await
        .unwrap_err();

        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.code, "INVALID_INPUT");
    }

    #[tokio::test]
    async fn finished_session_rejects_story_with_conflict() {
        let state = test_state();
        let started = start(&state).await;
        let Json(result) = generate_result_handler(
            State(state.clone()),
            Ok(Json(GenerateResultRequest {
                session_id: Some(started.session_id.clone()),
            })),
        )
        .await
        .unwrap();
        assert_eq!(result.key_decisions.len(), 3);

        let error = generate_story_handler(
            State(state),
            Ok(Json(GenerateStoryRequest {
                session_id: Some(started.session_id),
            })),
        )
        .await
        .unwrap_err();

        let (status, body) = error_body(error).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "SESSION_ENDED");
    }

    #[tokio::test]
    async fn storage_outage_maps_to_internal_error() {
        let state = test_state_with(Arc::new(UnreachableStore));

        let error = generate_background_handler(
            State(state.clone()),
            Ok(Json(GenerateBackgroundRequest {
                knowledge_base_id: Some("kb-1".to_string()),
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.code, "STORAGE_UNAVAILABLE");

        let error = db_health_handler(State(state)).await.unwrap_err();
        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn db_health_reports_table() {
        let Json(health) = db_health_handler(State(test_state())).await.unwrap();
        assert!(health.ok);
        assert_eq!(health.table, "in-memory");
        assert!(!health.item_exists);
        let body = serde_json::to_value(&health).unwrap();
        assert_eq!(body["itemExists"], Value::Bool(false));
    }

    #[tokio::test]
    async fn every_turn_error_has_a_stable_code() {
        let cases = [
            (TurnError::Conflict("s".into()), StatusCode::CONFLICT, "WRITE_CONFLICT"),
            (
                TurnError::GameComplete {
                    session_id: "s".into(),
                    total_turns: 10,
                },
                StatusCode::CONFLICT,
                "GAME_COMPLETE",
            ),
            (
                TurnError::EventAlreadyResolved {
                    session_id: "s".into(),
                    event_id: "t0:e".into(),
                },
                StatusCode::CONFLICT,
                "EVENT_ALREADY_RESOLVED",
            ),
            (
                TurnError::GenerationFailed("timeout".into()),
                StatusCode::BAD_GATEWAY,
                "GENERATION_FAILED",
            ),
            (
                TurnError::GenerationInvalid("missing options".into()),
                StatusCode::BAD_GATEWAY,
                "GENERATION_INVALID",
            ),
        ];

        for (error, status, code) in cases {
            let (actual_status, body) = error_body(ApiError::from(error)).await;
            assert_eq!(actual_status, status);
            assert_eq!(body["error"], code);
            assert!(body["message"].as_str().is_some_and(|message| !message.is_empty()));
        }
    }
}
