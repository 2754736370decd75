use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info};

use crate::{
    config::{AllowedOrigins, AppConfig, CorsPolicy},
    error::ServiceError,
    model::{
        GenerationParams, GenerationRequest, GenerationResult, ModelMetadata, ModelRegistry, Phase,
    },
    quantization::QuantizationSummary,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ModelRegistry>,
}

#[derive(Serialize)]
struct MetadataResponse {
    status: Phase,
    template: String,
    generation: GenerationParams,
    model: Option<ModelMetadata>,
    quantization: Option<QuantizationSummary>,
}

pub fn build_router(config: Arc<AppConfig>, registry: Arc<ModelRegistry>) -> Router {
    let cors = cors_layer(&config.cors);
    let state = AppState { config, registry };

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metadata", get(metadata))
        .route("/generate", post(generate))
        .fallback(not_found)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(policy: &CorsPolicy) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods([Method::GET, Method::POST, Method::OPTIONS]);
    match &policy.origins {
        AllowedOrigins::Any => layer
            .allow_origin(AllowOrigin::any())
            .allow_headers(AllowHeaders::any()),
        // Credentials forbid wildcard headers, so echo what the browser asks for.
        AllowedOrigins::List(origins) => layer
            .allow_origin(AllowOrigin::list(origins.clone()))
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(policy.allow_credentials),
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let (code, label) = match state.registry.phase() {
        Phase::Ready => (StatusCode::OK, "ready"),
        Phase::Uninitialized => (StatusCode::SERVICE_UNAVAILABLE, "loading"),
        Phase::Failed => (StatusCode::SERVICE_UNAVAILABLE, "failed"),
    };
    (code, Json(serde_json::json!({ "status": label })))
}

async fn metadata(State(state): State<AppState>) -> Json<MetadataResponse> {
    Json(MetadataResponse {
        status: state.registry.phase(),
        template: state.config.template.to_string(),
        generation: state.config.generation.clone(),
        model: state.registry.metadata(),
        quantization: state.registry.quantization(),
    })
}

async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResult>, ServiceError> {
    let started = Instant::now();

    let Json(request) = payload.map_err(reject_body)?;
    let text = request.text.trim();
    if text.is_empty() {
        return Err(ServiceError::Validation(
            "field `text` must be a non-empty string".into(),
        ));
    }
    info!(message = %text, "received message");

    let prompt = state.config.template.format(text);
    debug!(%prompt, "formatted prompt");

    let completion = match state
        .registry
        .generate(&prompt, &state.config.generation)
        .await
    {
        Ok(completion) => completion,
        Err(ServiceError::UpstreamUnavailable) => {
            info!("upstream model is still loading");
            return Err(ServiceError::UpstreamUnavailable);
        }
        Err(err) => {
            error!(error = %err, "generation failed");
            return Err(err);
        }
    };

    let response = state.config.template.extract(&completion.text).to_string();
    let result = GenerationResult::new(response, started.elapsed(), completion.inference_time);
    info!(
        total_time = ?result.timing.total_time,
        tokens = ?completion.tokens_generated,
        "generation complete"
    );

    Ok(Json(result))
}

fn reject_body(rejection: JsonRejection) -> ServiceError {
    match rejection {
        JsonRejection::JsonDataError(err) => ServiceError::Validation(err.body_text()),
        other => ServiceError::MalformedBody(other.body_text()),
    }
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "detail": "Not Found" })),
    )
}
