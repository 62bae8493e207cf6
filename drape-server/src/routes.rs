use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Json, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use drape_core::{
    png_to_base64, GenerateError, GenerationDefaults, GenerationParams, GenerationRequest, Generator,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub generator: Arc<Generator>,
    pub defaults: GenerationDefaults,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing 'prompt' in request body")]
    MissingPrompt,
    #[error("{0}")]
    BadRequest(String),
    #[error("Image not found")]
    NotFound,
    #[error("{0}")]
    Internal(String),
}

impl From<GenerateError> for ApiError {
    fn from(err: GenerateError) -> Self {
        match err {
            GenerateError::Invalid(msg) => ApiError::BadRequest(msg),
            GenerateError::Failed(err) => {
                tracing::error!("Error generating image: {err:#}");
                ApiError::Internal(format!("{err:#}"))
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::MissingPrompt | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match self {
            ApiError::NotFound => json!({ "error": self.to_string() }),
            _ => json!({ "success": false, "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/generate/stream", post(generate_stream))
        .route("/generated/{filename}", get(get_image))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

/// A body without a usable prompt is rejected before any other field is looked at.
fn parse_request(body: Result<Json<Value>, JsonRejection>) -> Result<GenerationRequest, ApiError> {
    let Ok(Json(body)) = body else {
        return Err(ApiError::MissingPrompt);
    };
    match body.get("prompt").and_then(Value::as_str) {
        Some(prompt) if !prompt.trim().is_empty() => {}
        _ => return Err(ApiError::MissingPrompt),
    }
    serde_json::from_value(body).map_err(|err| ApiError::BadRequest(err.to_string()))
}

/// Resolves the request and runs `job` off the async runtime.
async fn run_generation<T, F>(
    state: &AppState,
    request: GenerationRequest,
    job: F,
) -> Result<(GenerationParams, T), ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Generator, &GenerationParams) -> Result<T, GenerateError> + Send + 'static,
{
    let params = request.resolve(&state.defaults)?;
    let generator = state.generator.clone();
    let job_params = params.clone();
    let output = tokio::task::spawn_blocking(move || job(&generator, &job_params))
        .await
        .map_err(|err| ApiError::Internal(format!("generation task failed: {err}")))??;
    Ok((params, output))
}

async fn generate(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let request = parse_request(body)?;
    let (params, image) = run_generation(&state, request, Generator::generate).await?;
    Ok(Json(json!({
        "success": true,
        "image_url": format!("/generated/{}", image.filename),
        "filename": image.filename,
        "prompt": params.prompt,
    })))
}

async fn generate_stream(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let request = parse_request(body)?;
    let (params, (_, png)) = run_generation(&state, request, Generator::generate_png).await?;
    Ok(Json(json!({
        "success": true,
        "image_base64": png_to_base64(&png),
        "prompt": params.prompt,
    })))
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && FsPath::new(name).file_name().and_then(|n| n.to_str()) == Some(name)
}

async fn get_image(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    if !is_plain_file_name(&filename) {
        return Err(ApiError::NotFound);
    }
    let path = state.generator.output_dir().join(&filename);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response()),
        Err(err) => {
            tracing::debug!("{}: {err}", path.display());
            Err(ApiError::NotFound)
        }
    }
}
