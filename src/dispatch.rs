//! Route an upload to the right parser entry point and assemble the Markdown.

use image::{DynamicImage, ImageReader};
use std::path::Path;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::ocr::{DocumentParser, PageResult};
use crate::prompt::PromptMode;
use crate::workspace::Workspace;

/// Separator placed between pages of a multi-page document.
pub const PAGE_SEPARATOR: &str = "\n\n---\n\n";

const IMAGE_EXTENSIONS: [&str; 5] = [".jpg", ".jpeg", ".png", ".gif", ".bmp"];

/// How an upload is handled, decided by its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Pdf,
    Image,
}

/// Lower-cased extension of `filename` including the dot, or `""`.
pub fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_default()
}

impl UploadKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            ".pdf" => Some(Self::Pdf),
            e if IMAGE_EXTENSIONS.contains(&e) => Some(Self::Image),
            _ => None,
        }
    }
}

/// Persist the upload into `workspace`, run the parser and return Markdown.
pub async fn parse_upload(
    parser: &dyn DocumentParser,
    workspace: &Workspace,
    filename: &str,
    data: &[u8],
    mode: PromptMode,
) -> Result<String, ApiError> {
    let ext = extension_of(filename);
    let file_path = workspace.persist_upload(&ext, data).await?;
    let kind = UploadKind::from_extension(&ext).ok_or(ApiError::UnsupportedExtension)?;

    let stem = format!("doc_{}", workspace.session_id());
    let save_dir = workspace.dir();

    match kind {
        UploadKind::Pdf => {
            let results = parser
                .parse_pdf(&file_path, &stem, mode, save_dir)
                .await
                .map_err(ApiError::Parser)?;
            if results.is_empty() {
                return Err(ApiError::ParsingFailed("PDF"));
            }

            let mut pages = Vec::with_capacity(results.len());
            for result in &results {
                if let Some(md) = read_markdown(result).await {
                    pages.push(md);
                }
            }
            info!(
                "PDF parsed: {} results, {} with markdown",
                results.len(),
                pages.len()
            );
            Ok(pages.join(PAGE_SEPARATOR))
        }
        UploadKind::Image => {
            let image = decode_image(&file_path).await?;
            let results = parser
                .parse_image(image, &stem, mode, save_dir)
                .await
                .map_err(ApiError::Parser)?;
            let first = results.first().ok_or(ApiError::ParsingFailed("Image"))?;
            Ok(read_markdown(first).await.unwrap_or_default())
        }
    }
}

/// Decode an uploaded image, sniffing the format from its content rather than
/// trusting the extension.
async fn decode_image(path: &Path) -> Result<DynamicImage, ApiError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<DynamicImage, ApiError> {
        Ok(ImageReader::open(&path)?.with_guessed_format()?.decode()?)
    })
    .await
    .map_err(|e| ApiError::Parser(anyhow::anyhow!("Image decode task failed: {}", e)))?
}

/// Read a result's Markdown file. Missing or unreadable files yield `None`.
async fn read_markdown(result: &PageResult) -> Option<String> {
    let path = result.md_content_path.as_ref()?;
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Some(content),
        Err(e) => {
            debug!("Skipping page {} markdown {:?}: {}", result.page_no, path, e);
            None
        }
    }
}
