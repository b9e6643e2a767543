//! Parlance server library logic.

pub mod api;
pub mod api_media;
pub mod config;
pub mod session;

use axum::{routing::get, Extension, Json, Router};
use config::{ServiceConfig, SessionConfig};
use parlance_db::DbPool;
use parlance_voice::{DeepgramStt, DeepgramTts, OpenAiChat, VoiceServices};
use serde_json::{json, Value};
use session::SessionRegistry;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Speech and model services used by every session.
    pub services: VoiceServices,
    /// Recognizer tuning shared by every session.
    pub services_config: ServiceConfig,
    /// Per-session limits.
    pub session: SessionConfig,
    /// Live media sessions by session key.
    pub sessions: SessionRegistry,
}

/// Builds the production service adapters from configuration.
pub fn build_services(config: &ServiceConfig) -> VoiceServices {
    VoiceServices {
        stt: Arc::new(DeepgramStt::new(&config.stt_url, &config.speech_api_key)),
        tts: Arc::new(DeepgramTts::new(&config.tts_url, &config.speech_api_key)),
        model: Arc::new(OpenAiChat::new(
            &config.llm_base_url,
            &config.llm_model,
            &config.llm_api_key,
        )),
    }
}

/// Health check handler.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "activeSessions": state.sessions.len(),
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/conversations/{conversationId}/events",
            get(api::list_conversation_events_handler),
        )
        .route("/api/calls/{callId}/usage", get(api::get_call_usage_handler))
        .route("/media/telephony", get(api_media::telephony_handler))
        .route("/media/browser", get(api_media::browser_handler))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
