//! dots.ocr API - upload a PDF or image, get Markdown back.

mod config;
mod dispatch;
mod error;
mod ocr;
mod prompt;
mod vllm;
mod workspace;

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::header,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use config::ServerConfig;
use error::ApiError;
use ocr::{dots::DotsOcrParser, DocumentParser};
use prompt::PromptMode;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workspace::Workspace;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    parser: Arc<dyn DocumentParser>,
    workspace_root: PathBuf,
    hide_error_details: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "dots_ocr_api=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;
    let parser = DotsOcrParser::new(config.parser.clone())?;

    let state = AppState {
        parser: Arc::new(parser),
        workspace_root: config.workspace_root.clone(),
        hide_error_details: config.hide_error_details,
    };
    let app = build_router(state, config.max_upload_bytes);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/parse", post(parse_file))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "dots.ocr API Server": "POST /parse with a PDF or image file"
    }))
}

/// Fields read from the `/parse` multipart form.
struct ParseForm {
    filename: String,
    data: Option<Vec<u8>>,
    prompt_mode: Option<String>,
}

async fn read_form(multipart: &mut Multipart) -> Result<ParseForm, ApiError> {
    let mut form = ParseForm {
        filename: String::new(),
        data: None,
        prompt_mode: None,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Multipart(e.to_string()))?
    {
        match field.name() {
            Some("file") => {
                form.filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::Multipart(format!("Failed to read file: {}", e)))?;
                form.data = Some(bytes.to_vec());
            }
            Some("prompt_mode") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::Multipart(e.to_string()))?;
                form.prompt_mode = Some(text);
            }
            _ => {}
        }
    }

    Ok(form)
}

/// Receive a PDF or image and return its Markdown.
async fn parse_file(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let hide = state.hide_error_details;
    match handle_parse(&state, &mut multipart).await {
        Ok(markdown) => (
            [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
            markdown,
        )
            .into_response(),
        Err(e) => {
            if e.status().is_server_error() {
                error!("Parse failed: {}", e);
            } else {
                info!("Rejected parse request: {}", e);
            }
            e.into_response_with(hide)
        }
    }
}

async fn handle_parse(state: &AppState, multipart: &mut Multipart) -> Result<String, ApiError> {
    let form = read_form(multipart).await?;

    let mode = match form.prompt_mode.as_deref() {
        None => PromptMode::default(),
        Some(raw) => PromptMode::parse(raw).ok_or_else(|| ApiError::InvalidPromptMode {
            given: raw.to_string(),
        })?,
    };
    let data = form.data.ok_or(ApiError::MissingFile)?;

    info!(
        "Received file: {} ({} bytes) with mode: {}",
        form.filename,
        data.len(),
        mode
    );

    // Dropped on every return path below, removing the directory.
    let workspace = Workspace::create(&state.workspace_root)?;
    let markdown = dispatch::parse_upload(
        state.parser.as_ref(),
        &workspace,
        &form.filename,
        &data,
        mode,
    )
    .await?;

    info!(
        "Parse complete for session {}: {} chars via {}",
        workspace.session_id(),
        markdown.len(),
        state.parser.name()
    );
    Ok(markdown)
}
