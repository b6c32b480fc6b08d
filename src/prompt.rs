//! Prompt modes accepted by `/parse` and the instructions sent to the model.

use std::fmt;

/// Special tokens the dots.ocr chat template expects in front of the instruction.
pub const IMAGE_PLACEHOLDER: &str = "<|img|><|imgpad|><|endofimg|>";

const LAYOUT_ALL_EN: &str = r#"Please output the layout information from the PDF image, including each layout element's bbox, its category, and the corresponding text content within the bbox.

1. Bbox format: [x1, y1, x2, y2]

2. Layout Categories: The possible categories are ['Caption', 'Footnote', 'Formula', 'List-item', 'Page-footer', 'Page-header', 'Picture', 'Section-header', 'Table', 'Text', 'Title'].

3. Text Extraction & Formatting Rules:
    - Picture: For the 'Picture' category, the text field should be omitted.
    - Formula: Format its text as LaTeX.
    - Table: Format its text as HTML.
    - All Others (Text, Title, etc.): Format their text as Markdown.

4. Constraints:
    - The output text must be the original text from the image, with no translation.
    - All layout elements must be sorted according to human reading order.

5. Final Output: The entire output must be a single JSON object.
"#;

const LAYOUT_ONLY_EN: &str = "Please output the layout information from this PDF image, including each layout's bbox and its category. The bbox should be in the format [x1, y1, x2, y2]. The layout categories for the PDF document include ['Caption', 'Footnote', 'Formula', 'List-item', 'Page-footer', 'Page-header', 'Picture', 'Section-header', 'Table', 'Text', 'Title']. Do not output the corresponding text. The layout result should be in JSON format.";

const OCR: &str = "Extract the text content from this image.";

/// Extraction behaviour requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PromptMode {
    /// Layout boxes, categories and text for every element.
    #[default]
    LayoutAllEn,
    /// Layout boxes and categories only.
    LayoutOnlyEn,
    /// Plain text, no layout.
    Ocr,
}

impl PromptMode {
    pub const ALL: [PromptMode; 3] = [Self::LayoutAllEn, Self::LayoutOnlyEn, Self::Ocr];

    /// Parse a form value into a prompt mode. Exact, case-sensitive match.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prompt_layout_all_en" => Some(Self::LayoutAllEn),
            "prompt_layout_only_en" => Some(Self::LayoutOnlyEn),
            "prompt_ocr" => Some(Self::Ocr),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LayoutAllEn => "prompt_layout_all_en",
            Self::LayoutOnlyEn => "prompt_layout_only_en",
            Self::Ocr => "prompt_ocr",
        }
    }

    /// Instruction text for the model, without the image placeholder.
    pub fn instruction(&self) -> &'static str {
        match self {
            Self::LayoutAllEn => LAYOUT_ALL_EN,
            Self::LayoutOnlyEn => LAYOUT_ONLY_EN,
            Self::Ocr => OCR,
        }
    }

    /// Whether the model answers with layout JSON rather than plain text.
    pub fn is_layout(&self) -> bool {
        matches!(self, Self::LayoutAllEn | Self::LayoutOnlyEn)
    }

    /// Comma separated list of accepted values, for error messages.
    pub fn valid_values() -> String {
        Self::ALL
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for PromptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
