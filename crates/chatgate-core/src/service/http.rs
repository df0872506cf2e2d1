use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{self, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{AuthError, ChatgateError};
use crate::identity::{self, TokenVerifier};
use crate::limit::LimitService;
use crate::provider::GenerativeModel;
use crate::service::chat::{ChatError, ChatService, ChatTurnRequest};
use crate::service::reply::ReplyService;
use crate::session::ConversationService;
use crate::store::{ConversationStore, QuotaStore};

/// Shared application state for the HTTP API.
pub struct AppState {
    pub config: Config,
    pub chat: ChatService,
    pub verifier: Arc<dyn TokenVerifier>,
    pub quotas: Arc<dyn QuotaStore>,
    pub conversations: Arc<ConversationService>,
}

impl AppState {
    pub fn new(
        config: Config,
        quotas: Arc<dyn QuotaStore>,
        conversation_store: Arc<dyn ConversationStore>,
        verifier: Arc<dyn TokenVerifier>,
        model: Arc<dyn GenerativeModel>,
    ) -> Self {
        let conversations = Arc::new(ConversationService::new(conversation_store));
        let replies = ReplyService::new(
            conversations.clone(),
            model,
            config.model.history_window,
            config.model.system_instruction.clone(),
        );
        let chat = ChatService::new(
            verifier.clone(),
            LimitService::new(quotas.clone(), config.limits.clone()),
            conversations.clone(),
            replies,
        );
        Self {
            config,
            chat,
            verifier,
            quotas,
            conversations,
        }
    }
}

/// Request body for the chat endpoint.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub session_id: String,
    pub fingerprint: String,
}

/// Response body for the chat endpoint.
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub reply: String,
    pub prompt_count: u32,
    pub is_guest: bool,
}

/// Response body for the stats endpoint.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub is_premium: bool,
    pub prompt_count: u32,
}

/// One history entry as served to the frontend.
#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

fn detail(status: StatusCode, detail: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "detail": detail.into() }))).into_response()
}

/// Stable error shape for unexpected failures. Upstream dependencies
/// (store, auth provider, model API) map to 502, everything else to 500;
/// the cause is logged, never sent to the client.
fn internal_error(e: &ChatgateError) -> Response {
    error!("Request failed: {}", e);
    match e {
        ChatgateError::Store(_) | ChatgateError::Provider(_) => {
            detail(StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR")
        }
        ChatgateError::Auth(AuthError::Upstream(_)) => {
            detail(StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR")
        }
        _ => detail(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    }
}

/// Create the axum Router with all API routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    let origins: Vec<http::HeaderValue> = state
        .config
        .gateway
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    Router::new()
        .route("/api/chat", post(handle_chat))
        .route("/api/user/stats", get(handle_user_stats))
        .route("/api/chat/history/{session_id}", get(handle_chat_history))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
                .allow_headers([
                    http::header::CONTENT_TYPE,
                    http::header::AUTHORIZATION,
                ])
                .allow_credentials(true),
        )
        .with_state(state)
}

/// POST /api/chat — one conversation turn
async fn handle_chat(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Response {
    let address = identity::client_addr(&headers, Some(peer));
    let bearer = identity::bearer_token(&headers).map(|t| t.to_string());

    let turn = ChatTurnRequest {
        message: req.message,
        session_id: req.session_id,
        fingerprint: req.fingerprint,
        bearer,
        address,
    };

    match state.chat.chat_turn(turn).await {
        Ok(outcome) => Json(ChatResponse {
            reply: outcome.reply,
            prompt_count: outcome.prompt_count,
            is_guest: outcome.is_guest,
        })
        .into_response(),
        Err(ChatError::Denied(reason)) => {
            info!("Admission denied: {}", reason);
            detail(StatusCode::FORBIDDEN, reason.code())
        }
        Err(ChatError::Internal(e)) => internal_error(&e),
    }
}

/// GET /api/user/stats — premium flag and prompt count for the signed-in
/// user. Unlike the chat endpoint this one requires a valid credential.
async fn handle_user_stats(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let bearer = identity::bearer_token(&headers);
    let user = match identity::require_user(state.verifier.as_ref(), bearer).await {
        Ok(user) => user,
        Err(AuthError::MissingCredential) => {
            return detail(StatusCode::UNAUTHORIZED, "Not authenticated")
        }
        Err(AuthError::InvalidToken) => return detail(StatusCode::UNAUTHORIZED, "Invalid token"),
        Err(e @ AuthError::Upstream(_)) => return internal_error(&e.into()),
    };

    match state.quotas.user(&user.id).await {
        // No stats row yet: brand-new account defaults.
        Ok(None) => Json(StatsResponse {
            is_premium: false,
            prompt_count: 0,
        })
        .into_response(),
        Ok(Some(row)) => Json(StatsResponse {
            is_premium: row.is_premium,
            prompt_count: row.prompt_count,
        })
        .into_response(),
        Err(e) => internal_error(&e.into()),
    }
}

/// GET /api/chat/history/{session_id} — full chronological transcript
async fn handle_chat_history(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    match state.conversations.history(&session_id, None).await {
        Ok(messages) => {
            let entries: Vec<HistoryEntry> = messages
                .into_iter()
                .map(|m| HistoryEntry {
                    role: m.role.as_str().to_string(),
                    content: m.content,
                })
                .collect();
            Json(entries).into_response()
        }
        Err(e) => internal_error(&e.into()),
    }
}

/// GET /health
async fn handle_health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
    })
}

/// Start the HTTP server.
pub async fn serve(addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("chatgate API listening on {}", addr);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
