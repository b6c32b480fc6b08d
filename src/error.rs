//! HTTP-facing error taxonomy for `/parse`.
//!
//! Client mistakes map to 400, everything the server or the model server got
//! wrong maps to 500. The body is always `{"detail": "..."}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::prompt::PromptMode;

pub const SUPPORTED_EXTENSIONS_MESSAGE: &str =
    "Only supports .pdf .jpg .jpeg .png .gif .bmp files";

const HIDDEN_DETAIL: &str = "Internal server error";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid prompt_mode {given:?}, must be one of: {}", PromptMode::valid_values())]
    InvalidPromptMode { given: String },

    #[error("{}", SUPPORTED_EXTENSIONS_MESSAGE)]
    UnsupportedExtension,

    #[error("No file uploaded")]
    MissingFile,

    #[error("Multipart error: {0}")]
    Multipart(String),

    /// The parser ran but produced no result records.
    #[error("{0} parsing failed")]
    ParsingFailed(&'static str),

    /// Model server, rendering or post-processing failure.
    #[error("{0:#}")]
    Parser(anyhow::Error),

    #[error("Failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidPromptMode { .. }
            | Self::UnsupportedExtension
            | Self::MissingFile
            | Self::Multipart(_)
            | Self::ParsingFailed(_) => StatusCode::BAD_REQUEST,
            Self::Parser(_) | Self::ImageDecode(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Build the response, optionally masking server-side error text.
    pub fn into_response_with(self, hide_details: bool) -> Response {
        let status = self.status();
        let detail = if hide_details && status.is_server_error() {
            HIDDEN_DETAIL.to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.into_response_with(false)
    }
}
