//! Document parser abstraction.
//!
//! Defines the [`DocumentParser`] trait the HTTP layer talks to, so the
//! dots.ocr backend can be swapped for a fake in tests.

pub mod dots;
pub mod layout;
pub mod render;
pub mod resize;

use image::DynamicImage;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::prompt::PromptMode;

/// Output record for one processed page or image.
///
/// Paths point at files the parser wrote under its save directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PageResult {
    /// 0-based page index (always 0 for single images).
    pub page_no: usize,
    pub input_width: u32,
    pub input_height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md_content_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md_content_nohf_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout_info_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout_image_path: Option<PathBuf>,
    /// Model output could not be parsed as layout JSON; files hold raw text.
    pub filtered: bool,
}

/// Async trait implemented by each parsing backend.
#[async_trait::async_trait]
pub trait DocumentParser: Send + Sync {
    fn name(&self) -> &str;

    /// Parse every page of the PDF at `input`, results ordered by page.
    async fn parse_pdf(
        &self,
        input: &Path,
        filename: &str,
        mode: PromptMode,
        save_dir: &Path,
    ) -> anyhow::Result<Vec<PageResult>>;

    /// Parse a single decoded image.
    async fn parse_image(
        &self,
        image: DynamicImage,
        filename: &str,
        mode: PromptMode,
        save_dir: &Path,
    ) -> anyhow::Result<Vec<PageResult>>;
}
