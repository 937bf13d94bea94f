use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::{get, post},
};
use tokio::task;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{
        GenerateRequest, GenerateResponse, ModelInfo, ModelManager, ModelSummary, ModelsResponse,
        ReloadResponse, TokenizeQuery, TokenizeResponse, registry, round_to, throughput,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub manager: Arc<ModelManager>,
}

pub fn build_router(config: Arc<AppConfig>, manager: Arc<ModelManager>) -> Router {
    let state = AppState { config, manager };

    Router::new()
        .route("/health", get(health))
        .route("/reload-model", post(reload_model))
        .route("/api/generate", post(generate_text))
        .route("/generate", post(generate_text))
        .route("/api/tokenize", get(encode_text))
        .route("/api/model_info", get(model_info))
        .route("/api/models", get(list_models))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn reload_model(State(state): State<AppState>) -> Result<Json<ReloadResponse>, ServiceError> {
    state.manager.reload().await?;
    info!(model = state.manager.model_name_short(), "model reloaded");
    Ok(Json(ReloadResponse {
        status: "Model reloaded".into(),
    }))
}

async fn generate_text(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ServiceError> {
    if request.prompt.trim().is_empty() {
        return Err(ServiceError::BadRequest("prompt must not be empty".into()));
    }

    let lease = state.manager.lease().await?;
    let formatted_prompt = state
        .manager
        .format_prompt(&request.prompt, request.system_prompt.as_deref());
    let max_new_tokens = request.max_new_tokens.unwrap_or(state.config.max_new_tokens);
    let settings = request.settings;
    debug!(max_new_tokens, ?settings, "generation requested");

    let prompt = formatted_prompt.clone();
    let (output, elapsed, output_tokens) = task::spawn_blocking(move || {
        let started = Instant::now();
        let output = lease.generate(&prompt, &settings, max_new_tokens)?;
        let elapsed = started.elapsed().as_secs_f64();
        let output_ids = lease.encode(&output)?;
        Ok::<_, ServiceError>((output, elapsed, output_ids.len()))
    })
    .await
    .map_err(|err| ServiceError::Generation(format!("generation task failed: {err}")))?
    .map_err(|err| {
        warn!(error = %err, "generation failed");
        match err {
            ServiceError::Generation(_) => err,
            other => ServiceError::Generation(other.to_string()),
        }
    })?;

    Ok(Json(GenerateResponse {
        output,
        formatted_prompt,
        tok_per_sec: throughput(output_tokens, elapsed),
        model: state.manager.model_name_short().to_string(),
        generation_time: round_to(elapsed, 2),
    }))
}

async fn encode_text(
    State(state): State<AppState>,
    Query(query): Query<TokenizeQuery>,
) -> Result<Json<TokenizeResponse>, ServiceError> {
    let encoded_text = state.manager.encode(query.text).await?;
    Ok(Json(TokenizeResponse {
        encoded_text,
        model: state.manager.model_name_short().to_string(),
    }))
}

async fn model_info(State(state): State<AppState>) -> Result<Json<ModelInfo>, ServiceError> {
    let manager = &state.manager;
    drop(manager.lease().await?);
    Ok(Json(ModelInfo {
        model: manager.model_name().to_string(),
        model_name_short: manager.model_name_short().to_string(),
        max_context_length: manager.config().max_context_length,
        prompt_format: manager.prompt_format().id.to_string(),
    }))
}

async fn list_models(State(state): State<AppState>) -> Result<Json<ModelsResponse>, ServiceError> {
    let source = state.config.model_source.clone();
    let configs = task::spawn_blocking(move || registry::resolve_all(Some(&source)))
        .await
        .map_err(|err| ServiceError::Generation(format!("registry task failed: {err}")))??;
    Ok(Json(ModelsResponse {
        models: configs.iter().map(ModelSummary::from).collect(),
    }))
}
