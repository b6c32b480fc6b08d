//! dots.ocr parser: renders pages, asks the model for layout or text, and
//! writes Markdown / JSON / preview files for each page.

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use image::DynamicImage;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::layout::{self, LayoutCell};
use super::render::render_pdf;
use super::resize::fit_to_grid;
use super::{DocumentParser, PageResult};
use crate::config::ParserConfig;
use crate::prompt::PromptMode;
use crate::vllm::VllmClient;

pub struct DotsOcrParser {
    client: VllmClient,
    config: ParserConfig,
}

impl DotsOcrParser {
    pub fn new(config: ParserConfig) -> Result<Self> {
        let client = VllmClient::new(&config)?;
        info!(
            "dots.ocr parser using model {} at {}",
            config.model_name,
            client.endpoint()
        );
        Ok(Self { client, config })
    }

    /// Run the model on one page and write its outputs under `out_dir`.
    async fn parse_page(
        &self,
        origin: DynamicImage,
        mode: PromptMode,
        out_dir: &Path,
        save_name: &str,
        page_no: usize,
    ) -> Result<PageResult> {
        let input = fit_to_grid(&origin, self.config.min_pixels, self.config.max_pixels)?;
        let response = self
            .client
            .infer(&input, mode.instruction())
            .await
            .with_context(|| format!("Inference failed for page {}", page_no))?;

        let mut result = PageResult {
            page_no,
            input_width: input.width(),
            input_height: input.height(),
            ..PageResult::default()
        };
        let files = PageFiles::new(out_dir, save_name);

        if !mode.is_layout() {
            save_image(&origin, &files.preview).await?;
            write_text(&files.md, &response).await?;
            write_text(&files.md_nohf, &response).await?;
            result.layout_image_path = Some(files.preview);
            result.md_content_path = Some(files.md);
            result.md_content_nohf_path = Some(files.md_nohf);
            return Ok(result);
        }

        let cells = match layout::parse_cells(&response) {
            Ok(mut cells) => {
                layout::rescale_cells(
                    &mut cells,
                    (input.width(), input.height()),
                    (origin.width(), origin.height()),
                );
                cells
            }
            Err(e) => {
                warn!("Page {}: keeping raw model output ({:#})", page_no, e);
                write_text(&files.json, &response).await?;
                save_image(&origin, &files.preview).await?;
                result.layout_info_path = Some(files.json);
                result.layout_image_path = Some(files.preview);
                result.filtered = true;
                if mode == PromptMode::LayoutAllEn {
                    write_text(&files.md, &response).await?;
                    write_text(&files.md_nohf, &response).await?;
                    result.md_content_path = Some(files.md);
                    result.md_content_nohf_path = Some(files.md_nohf);
                }
                return Ok(result);
            }
        };

        write_cells(&files.json, &cells).await?;
        save_image(&layout::draw_layout(&origin, &cells), &files.preview).await?;
        result.layout_info_path = Some(files.json);
        result.layout_image_path = Some(files.preview);

        if mode == PromptMode::LayoutAllEn {
            write_text(&files.md, &layout::cells_to_markdown(&origin, &cells, false)).await?;
            write_text(&files.md_nohf, &layout::cells_to_markdown(&origin, &cells, true)).await?;
            result.md_content_path = Some(files.md);
            result.md_content_nohf_path = Some(files.md_nohf);
        }

        Ok(result)
    }
}

#[async_trait::async_trait]
impl DocumentParser for DotsOcrParser {
    fn name(&self) -> &str {
        "dots_ocr"
    }

    async fn parse_pdf(
        &self,
        input: &Path,
        filename: &str,
        mode: PromptMode,
        save_dir: &Path,
    ) -> Result<Vec<PageResult>> {
        let out_dir = prepare_out_dir(save_dir, filename).await?;
        let pages = render_pdf(input, self.config.dpi, self.config.pdfium_lib_path.clone()).await?;
        let total = pages.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let workers = self.config.num_threads.min(total);
        info!("Parsing {} PDF pages with {} workers, mode={}", total, workers, mode);

        // `buffered` keeps results in page order while running `workers` at once.
        let out_dir = &out_dir;
        stream::iter(pages.into_iter().enumerate())
            .map(|(page_no, image)| async move {
                let save_name = format!("{}_page_{}", filename, page_no);
                self.parse_page(image, mode, out_dir, &save_name, page_no).await
            })
            .buffered(workers)
            .try_collect()
            .await
    }

    async fn parse_image(
        &self,
        image: DynamicImage,
        filename: &str,
        mode: PromptMode,
        save_dir: &Path,
    ) -> Result<Vec<PageResult>> {
        let out_dir = prepare_out_dir(save_dir, filename).await?;
        let result = self.parse_page(image, mode, &out_dir, filename, 0).await?;
        Ok(vec![result])
    }
}

/// Output file locations for one page.
struct PageFiles {
    json: PathBuf,
    preview: PathBuf,
    md: PathBuf,
    md_nohf: PathBuf,
}

impl PageFiles {
    fn new(dir: &Path, name: &str) -> Self {
        Self {
            json: dir.join(format!("{}.json", name)),
            preview: dir.join(format!("{}.jpg", name)),
            md: dir.join(format!("{}.md", name)),
            md_nohf: dir.join(format!("{}_nohf.md", name)),
        }
    }
}

async fn prepare_out_dir(save_dir: &Path, filename: &str) -> Result<PathBuf> {
    let dir = save_dir.join(filename);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create output directory {:?}", dir))?;
    Ok(dir)
}

async fn write_text(path: &Path, content: &str) -> Result<()> {
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {:?}", path))
}

async fn write_cells(path: &Path, cells: &[LayoutCell]) -> Result<()> {
    let json = serde_json::to_string_pretty(cells)?;
    write_text(path, &json).await
}

async fn save_image(image: &DynamicImage, path: &Path) -> Result<()> {
    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let path_buf = path.to_path_buf();
    tokio::task::spawn_blocking(move || rgb.save(&path_buf))
        .await
        .context("Image save task panicked")?
        .with_context(|| format!("Failed to save image {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    /// Stand-in for the vLLM server: answers every completion with `reply`.
    #[derive(Clone)]
    struct StubModel {
        reply: String,
        requests: Arc<Mutex<Vec<Value>>>,
    }

    async fn completions(State(stub): State<StubModel>, Json(body): Json<Value>) -> Json<Value> {
        stub.requests.lock().unwrap().push(body);
        Json(json!({
            "choices": [{ "message": { "content": stub.reply } }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
        }))
    }

    async fn start_stub(reply: &str) -> (DotsOcrParser, Arc<Mutex<Vec<Value>>>) {
        let stub = StubModel {
            reply: reply.to_string(),
            requests: Arc::new(Mutex::new(Vec::new())),
        };
        let requests = stub.requests.clone();
        let app = Router::new()
            .route("/v1/chat/completions", post(completions))
            .with_state(stub);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = ParserConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..ParserConfig::default()
        };
        (DotsOcrParser::new(config).unwrap(), requests)
    }

    fn read(path: &Option<PathBuf>) -> String {
        std::fs::read_to_string(path.as_ref().expect("path recorded")).unwrap()
    }

    /// 64x64 pages are sent to the model as 56x56, so bboxes here are in that frame.
    fn page() -> DynamicImage {
        DynamicImage::new_rgb8(64, 64)
    }

    const LAYOUT_REPLY: &str = r#"[
        {"bbox": [0, 0, 56, 8], "category": "Page-header", "text": "HDR"},
        {"bbox": [0, 10, 56, 30], "category": "Text", "text": "Body"},
        {"bbox": [0, 32, 56, 40], "category": "Formula", "text": "x"},
        {"bbox": [0, 48, 56, 56], "category": "Page-footer", "text": "7"}
    ]"#;

    #[tokio::test]
    async fn test_ocr_mode_writes_raw_response() {
        let (parser, requests) = start_stub("# Title\n\nPlain text.").await;
        let dir = tempfile::tempdir().unwrap();

        let results = parser
            .parse_image(page(), "doc_ocr", PromptMode::Ocr, dir.path())
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.page_no, 0);
        assert_eq!((result.input_width, result.input_height), (56, 56));
        assert!(!result.filtered);
        assert!(result.layout_info_path.is_none());
        assert_eq!(read(&result.md_content_path), "# Title\n\nPlain text.");
        assert_eq!(read(&result.md_content_nohf_path), "# Title\n\nPlain text.");
        assert_eq!(
            result.md_content_path.as_deref(),
            Some(dir.path().join("doc_ocr/doc_ocr.md").as_path())
        );
        assert!(result.layout_image_path.as_ref().unwrap().exists());

        let sent = requests.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["model"], "dotsocr-model");
        let text = sent[0]["messages"][0]["content"][1]["text"].as_str().unwrap();
        assert_eq!(text, format!("{}{}", crate::prompt::IMAGE_PLACEHOLDER, PromptMode::Ocr.instruction()));
    }

    #[tokio::test]
    async fn test_layout_all_writes_markdown_with_and_without_page_furniture() {
        let (parser, _) = start_stub(LAYOUT_REPLY).await;
        let dir = tempfile::tempdir().unwrap();

        let results = parser
            .parse_image(page(), "doc_all", PromptMode::LayoutAllEn, dir.path())
            .await
            .unwrap();
        let result = &results[0];

        assert!(!result.filtered);
        assert_eq!(read(&result.md_content_path), "HDR\n\nBody\n\n$$\nx\n$$\n\n7");
        assert_eq!(read(&result.md_content_nohf_path), "Body\n\n$$\nx\n$$");

        let cells: Vec<LayoutCell> =
            serde_json::from_str(&read(&result.layout_info_path)).unwrap();
        assert_eq!(cells.len(), 4);
        // Rescaled from the 56 px input frame back onto the 64 px original.
        assert_eq!(cells[3].bbox, [0.0, 55.0, 64.0, 64.0]);
        assert!(result.layout_image_path.as_ref().unwrap().exists());
    }

    #[tokio::test]
    async fn test_layout_only_records_no_markdown() {
        let (parser, _) = start_stub(r#"[{"bbox": [0, 0, 28, 28], "category": "Text"}]"#).await;
        let dir = tempfile::tempdir().unwrap();

        let results = parser
            .parse_image(page(), "doc_only", PromptMode::LayoutOnlyEn, dir.path())
            .await
            .unwrap();
        let result = &results[0];

        assert!(!result.filtered);
        assert!(result.md_content_path.is_none());
        assert!(result.md_content_nohf_path.is_none());
        assert!(read(&result.layout_info_path).contains("\"Text\""));
        assert!(!dir.path().join("doc_only/doc_only.md").exists());
    }

    #[tokio::test]
    async fn test_invalid_layout_json_keeps_raw_text() {
        let raw = "[{\"bbox\": [0, 0, 10, 10], \"category\": \"Te";
        let (parser, _) = start_stub(raw).await;
        let dir = tempfile::tempdir().unwrap();

        let results = parser
            .parse_image(page(), "doc_bad", PromptMode::LayoutAllEn, dir.path())
            .await
            .unwrap();
        let result = &results[0];

        assert!(result.filtered);
        assert_eq!(read(&result.layout_info_path), raw);
        assert_eq!(read(&result.md_content_path), raw);
        assert_eq!(read(&result.md_content_nohf_path), raw);
        assert!(result.layout_image_path.as_ref().unwrap().exists());
    }

    #[tokio::test]
    async fn test_invalid_layout_json_in_layout_only_mode() {
        let (parser, _) = start_stub("not json at all").await;
        let dir = tempfile::tempdir().unwrap();

        let results = parser
            .parse_image(page(), "doc_bad", PromptMode::LayoutOnlyEn, dir.path())
            .await
            .unwrap();
        let result = &results[0];

        assert!(result.filtered);
        assert!(result.md_content_path.is_none());
        assert_eq!(read(&result.layout_info_path), "not json at all");
    }

    #[test]
    fn test_page_file_names() {
        let files = PageFiles::new(Path::new("/tmp/ws/doc_ab12"), "doc_ab12_page_3");
        assert_eq!(files.md, Path::new("/tmp/ws/doc_ab12/doc_ab12_page_3.md"));
        assert_eq!(files.md_nohf, Path::new("/tmp/ws/doc_ab12/doc_ab12_page_3_nohf.md"));
        assert_eq!(files.json, Path::new("/tmp/ws/doc_ab12/doc_ab12_page_3.json"));
        assert_eq!(files.preview, Path::new("/tmp/ws/doc_ab12/doc_ab12_page_3.jpg"));
    }

    #[tokio::test]
    async fn test_unreachable_model_server_is_an_error() {
        let config = ParserConfig {
            host: "127.0.0.1".to_string(),
            port: 9,
            ..ParserConfig::default()
        };
        let parser = DotsOcrParser::new(config).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let result = parser
            .parse_image(DynamicImage::new_rgb8(64, 64), "doc_x", PromptMode::Ocr, dir.path())
            .await;
        assert!(result.is_err());
        assert!(dir.path().join("doc_x").is_dir());
    }
}
