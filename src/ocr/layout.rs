//! Layout cells returned by the model and their conversion to Markdown.

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImage, GenericImageView, Rgba};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// One detected layout element, bbox in pixel coordinates `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutCell {
    pub bbox: [f64; 4],
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Parse the model's response as a list of layout cells.
///
/// The model usually answers with a bare JSON array; a wrapping object with a
/// single array field is accepted too.
pub fn parse_cells(response: &str) -> Result<Vec<LayoutCell>> {
    let trimmed = strip_code_fence(response.trim());
    let value: serde_json::Value =
        serde_json::from_str(trimmed).context("Model output is not valid JSON")?;

    let array = match value {
        serde_json::Value::Array(_) => value,
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(_, v)| v)
            .find(|v| v.is_array())
            .context("Layout JSON object holds no cell array")?,
        other => anyhow::bail!("Unexpected layout JSON: {}", other),
    };

    serde_json::from_value(array).context("Layout JSON does not match the cell schema")
}

fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Map bboxes from the resized model input back onto the original image and
/// clamp them to its bounds.
pub fn rescale_cells(
    cells: &mut [LayoutCell],
    input_size: (u32, u32),
    original_size: (u32, u32),
) {
    let (in_w, in_h) = (input_size.0.max(1) as f64, input_size.1.max(1) as f64);
    let (orig_w, orig_h) = (original_size.0 as f64, original_size.1 as f64);
    let sx = orig_w / in_w;
    let sy = orig_h / in_h;

    for cell in cells.iter_mut() {
        let [x1, y1, x2, y2] = cell.bbox;
        cell.bbox = [
            (x1 * sx).round().clamp(0.0, orig_w),
            (y1 * sy).round().clamp(0.0, orig_h),
            (x2 * sx).round().clamp(0.0, orig_w),
            (y2 * sy).round().clamp(0.0, orig_h),
        ];
    }
}

/// Render layout cells as Markdown.
///
/// `Picture` cells are cropped from `image` and inlined as data URLs,
/// `Formula` cells become display math. With `skip_page_hf`, page headers and
/// footers are dropped.
pub fn cells_to_markdown(image: &DynamicImage, cells: &[LayoutCell], skip_page_hf: bool) -> String {
    let mut items = Vec::with_capacity(cells.len());

    for cell in cells {
        match cell.category.as_str() {
            "Picture" => {
                if let Some(url) = crop_data_url(image, &cell.bbox) {
                    items.push(format!("![]({})", url));
                }
            }
            "Formula" => {
                if let Some(text) = cell.text.as_deref().filter(|t| !t.trim().is_empty()) {
                    items.push(formula_to_markdown(text));
                }
            }
            "Page-header" | "Page-footer" if skip_page_hf => {}
            _ => {
                if let Some(text) = cell.text.as_deref() {
                    let text = clean_text(text);
                    if !text.is_empty() {
                        items.push(text);
                    }
                }
            }
        }
    }

    items.join("\n\n")
}

fn clean_text(text: &str) -> String {
    text.trim().to_string()
}

/// Normalise LaTeX delimiters into a `$$` display block.
///
/// Only a single enclosing pair is stripped; text such as `$a$ + $b$` holds
/// several inline formulas and is wrapped as-is.
pub fn formula_to_markdown(text: &str) -> String {
    static WRAPPERS: OnceLock<Regex> = OnceLock::new();
    let wrappers = WRAPPERS.get_or_init(|| {
        Regex::new(r"(?s)^(?:\$\$([^$]*)\$\$|\\\[(.*)\\\]|\$([^$]*)\$)$").expect("static regex")
    });

    let trimmed = text.trim();
    let inner = wrappers
        .captures(trimmed)
        .and_then(|c| {
            c.get(1)
                .or_else(|| c.get(2).filter(|m| !m.as_str().contains("\\]")))
                .or_else(|| c.get(3))
        })
        .map(|m| m.as_str().trim())
        .unwrap_or(trimmed);

    format!("$$\n{}\n$$", inner)
}

fn pixel_box(image: &DynamicImage, bbox: &[f64; 4]) -> Option<(u32, u32, u32, u32)> {
    let (w, h) = image.dimensions();
    let x1 = (bbox[0].max(0.0) as u32).min(w);
    let y1 = (bbox[1].max(0.0) as u32).min(h);
    let x2 = (bbox[2].max(0.0) as u32).min(w);
    let y2 = (bbox[3].max(0.0) as u32).min(h);
    (x2 > x1 && y2 > y1).then_some((x1, y1, x2 - x1, y2 - y1))
}

fn crop_data_url(image: &DynamicImage, bbox: &[f64; 4]) -> Option<String> {
    let (x, y, w, h) = pixel_box(image, bbox)?;
    let crop = image.crop_imm(x, y, w, h);
    crate::vllm::image_to_data_url(&crop).ok()
}

fn category_color(category: &str) -> Rgba<u8> {
    match category {
        "Title" => Rgba([220, 38, 38, 255]),
        "Section-header" => Rgba([234, 88, 12, 255]),
        "Text" | "List-item" => Rgba([37, 99, 235, 255]),
        "Table" => Rgba([22, 163, 74, 255]),
        "Picture" => Rgba([147, 51, 234, 255]),
        "Formula" => Rgba([202, 138, 4, 255]),
        "Page-header" | "Page-footer" => Rgba([107, 114, 128, 255]),
        _ => Rgba([8, 145, 178, 255]),
    }
}

/// Copy of `image` with every cell outlined in a per-category color.
pub fn draw_layout(image: &DynamicImage, cells: &[LayoutCell]) -> DynamicImage {
    const THICKNESS: u32 = 2;
    let mut canvas = DynamicImage::ImageRgba8(image.to_rgba8());

    for cell in cells {
        let Some((x, y, w, h)) = pixel_box(&canvas, &cell.bbox) else {
            continue;
        };
        let color = category_color(&cell.category);
        for t in 0..THICKNESS.min(w).min(h) {
            for dx in x..x + w {
                canvas.put_pixel(dx, y + t, color);
                canvas.put_pixel(dx, y + h - 1 - t, color);
            }
            for dy in y..y + h {
                canvas.put_pixel(x + t, dy, color);
                canvas.put_pixel(x + w - 1 - t, dy, color);
            }
        }
    }

    canvas
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(category: &str, text: Option<&str>) -> LayoutCell {
        LayoutCell {
            bbox: [0.0, 0.0, 10.0, 10.0],
            category: category.to_string(),
            text: text.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_cells_array() {
        let raw = r##"[{"bbox":[1,2,3,4],"category":"Title","text":"# Hello"},{"bbox":[5,6,7,8],"category":"Picture"}]"##;
        let cells = parse_cells(raw).unwrap();
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].bbox, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(cells[0].text.as_deref(), Some("# Hello"));
        assert!(cells[1].text.is_none());
    }

    #[test]
    fn test_parse_cells_fenced_and_wrapped() {
        let raw = "```json\n{\"layout\": [{\"bbox\":[0,0,1,1],\"category\":\"Text\",\"text\":\"a\"}]}\n```";
        let cells = parse_cells(raw).unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].category, "Text");
    }

    #[test]
    fn test_parse_cells_rejects_truncated_output() {
        assert!(parse_cells(r#"[{"bbox":[1,2,3,4],"category":"Te"#).is_err());
        assert!(parse_cells("Just some plain text").is_err());
    }

    #[test]
    fn test_rescale_cells() {
        let mut cells = vec![LayoutCell {
            bbox: [10.0, 20.0, 50.0, 300.0],
            category: "Text".to_string(),
            text: None,
        }];
        rescale_cells(&mut cells, (100, 200), (200, 100));
        assert_eq!(cells[0].bbox, [20.0, 10.0, 100.0, 100.0]);
    }

    #[test]
    fn test_markdown_skips_page_header_footer_when_requested() {
        let image = DynamicImage::new_rgb8(20, 20);
        let cells = vec![
            cell("Page-header", Some("Running title")),
            cell("Title", Some("# Report ")),
            cell("Text", Some("Body text.")),
            cell("Page-footer", Some("3")),
        ];

        assert_eq!(
            cells_to_markdown(&image, &cells, false),
            "Running title\n\n# Report\n\nBody text.\n\n3"
        );
        assert_eq!(
            cells_to_markdown(&image, &cells, true),
            "# Report\n\nBody text."
        );
    }

    #[test]
    fn test_markdown_inlines_pictures() {
        let image = DynamicImage::new_rgb8(20, 20);
        let md = cells_to_markdown(&image, &[cell("Picture", None)], false);
        assert!(md.starts_with("![](data:image/png;base64,"));
    }

    #[test]
    fn test_degenerate_picture_is_skipped() {
        let image = DynamicImage::new_rgb8(20, 20);
        let mut picture = cell("Picture", None);
        picture.bbox = [5.0, 5.0, 5.0, 9.0];
        assert_eq!(cells_to_markdown(&image, &[picture], false), "");
    }

    #[test]
    fn test_formula_normalisation() {
        assert_eq!(formula_to_markdown("E=mc^2"), "$$\nE=mc^2\n$$");
        assert_eq!(formula_to_markdown("$$ a+b $$"), "$$\na+b\n$$");
        assert_eq!(formula_to_markdown("\\[x^2\\]"), "$$\nx^2\n$$");
        assert_eq!(formula_to_markdown("$y$"), "$$\ny\n$$");
    }

    #[test]
    fn test_formula_with_several_delimited_parts_is_kept_whole() {
        assert_eq!(formula_to_markdown("$a$ + $b$"), "$$\n$a$ + $b$\n$$");
        assert_eq!(formula_to_markdown("$$a$$ = $$b$$"), "$$\n$$a$$ = $$b$$\n$$");
        assert_eq!(formula_to_markdown("\\[a\\] \\[b\\]"), "$$\n\\[a\\] \\[b\\]\n$$");
    }

    #[test]
    fn test_draw_layout_outlines_box() {
        let image = DynamicImage::new_rgb8(20, 20);
        let drawn = draw_layout(&image, &[cell("Title", Some("x"))]);
        assert_eq!(drawn.get_pixel(0, 0), Rgba([220, 38, 38, 255]));
        assert_eq!(drawn.get_pixel(5, 5), Rgba([0, 0, 0, 255]));
    }
}
