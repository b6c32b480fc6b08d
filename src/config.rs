//! Server and model-client configuration.
//!
//! Everything is read once at start-up from the environment (after `.env` has
//! been loaded by `dotenvy`). Values that are present but unparseable abort
//! start-up instead of silently falling back to defaults.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Smallest pixel budget the model accepts (56 * 56).
pub const MIN_PIXELS: u32 = 3136;
/// Largest pixel budget the model accepts.
pub const MAX_PIXELS: u32 = 11_289_600;

/// Top-level configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Parent directory for per-request workspaces.
    pub workspace_root: PathBuf,
    pub max_upload_bytes: usize,
    /// Replace the detail of 500 responses with a generic message.
    pub hide_error_details: bool,
    pub parser: ParserConfig,
}

/// Settings for the dots.ocr parser and the vLLM server behind it.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub host: String,
    pub port: u16,
    pub model_name: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_completion_tokens: u32,
    pub timeout: Option<Duration>,
    pub min_pixels: u32,
    pub max_pixels: u32,
    pub dpi: u32,
    pub num_threads: usize,
    /// Explicit pdfium library location; falls back to the system library.
    pub pdfium_lib_path: Option<PathBuf>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3003,
            model_name: "dotsocr-model".to_string(),
            temperature: 0.1,
            top_p: 1.0,
            max_completion_tokens: 16384,
            timeout: None,
            min_pixels: MIN_PIXELS,
            max_pixels: MAX_PIXELS,
            dpi: 200,
            num_threads: 64,
            pdfium_lib_path: None,
        }
    }
}

impl ParserConfig {
    /// Base URL of the OpenAI-compatible API, e.g. `http://localhost:3003/v1`.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/v1", self.host, self.port)
    }
}

impl ServerConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ParserConfig::default();

        let parser = ParserConfig {
            host: lookup("DOTSOCR_IP").unwrap_or(defaults.host),
            port: parse_or(&lookup, "DOTSOCR_PORT", defaults.port)?,
            model_name: lookup("DOTSOCR_MODEL").unwrap_or(defaults.model_name),
            temperature: parse_or(&lookup, "DOTSOCR_TEMPERATURE", defaults.temperature)?,
            top_p: parse_or(&lookup, "DOTSOCR_TOP_P", defaults.top_p)?,
            max_completion_tokens: parse_or(
                &lookup,
                "DOTSOCR_MAX_COMPLETION_TOKENS",
                defaults.max_completion_tokens,
            )?,
            timeout: parse_opt::<u64, _>(&lookup, "DOTSOCR_TIMEOUT_SECS")?
                .map(Duration::from_secs),
            min_pixels: parse_or(&lookup, "DOTSOCR_MIN_PIXELS", defaults.min_pixels)?,
            max_pixels: parse_or(&lookup, "DOTSOCR_MAX_PIXELS", defaults.max_pixels)?,
            dpi: parse_or(&lookup, "DOTSOCR_DPI", defaults.dpi)?,
            num_threads: parse_or(&lookup, "DOTSOCR_NUM_THREADS", defaults.num_threads)?,
            pdfium_lib_path: lookup("PDFIUM_LIB_PATH").map(PathBuf::from),
        };

        if parser.min_pixels > parser.max_pixels {
            anyhow::bail!(
                "DOTSOCR_MIN_PIXELS ({}) must not exceed DOTSOCR_MAX_PIXELS ({})",
                parser.min_pixels,
                parser.max_pixels
            );
        }
        if parser.num_threads == 0 {
            anyhow::bail!("DOTSOCR_NUM_THREADS must be at least 1");
        }

        let max_upload_mb: usize = parse_or(&lookup, "MAX_UPLOAD_MB", 100)?;

        Ok(Self {
            port: parse_or(&lookup, "PORT", 8491)?,
            workspace_root: lookup("DOTSOCR_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            max_upload_bytes: max_upload_mb * 1024 * 1024,
            hide_error_details: parse_or(&lookup, "DOTSOCR_HIDE_ERROR_DETAILS", false)?,
            parser,
        })
    }
}

fn parse_opt<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        _ => Ok(None),
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.port, 8491);
        assert_eq!(config.parser.host, "localhost");
        assert_eq!(config.parser.port, 3003);
        assert_eq!(config.parser.model_name, "dotsocr-model");
        assert_eq!(config.parser.min_pixels, MIN_PIXELS);
        assert_eq!(config.parser.max_pixels, MAX_PIXELS);
        assert_eq!(config.parser.dpi, 200);
        assert!(config.parser.timeout.is_none());
        assert_eq!(config.max_upload_bytes, 100 * 1024 * 1024);
        assert!(!config.hide_error_details);
        assert_eq!(config.workspace_root, std::env::temp_dir());
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("DOTSOCR_IP", "10.0.0.7"),
            ("DOTSOCR_PORT", "8000"),
            ("DOTSOCR_MODEL", "rednote-hilab/dots.ocr"),
            ("DOTSOCR_TIMEOUT_SECS", "30"),
            ("DOTSOCR_HIDE_ERROR_DETAILS", "true"),
            ("PORT", "9000"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.parser.base_url(), "http://10.0.0.7:8000/v1");
        assert_eq!(config.parser.model_name, "rednote-hilab/dots.ocr");
        assert_eq!(config.parser.timeout, Some(Duration::from_secs(30)));
        assert!(config.hide_error_details);
    }

    #[test]
    fn test_invalid_number_is_error() {
        let result = ServerConfig::from_lookup(lookup_from(&[("DOTSOCR_PORT", "not-a-port")]));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("DOTSOCR_PORT"));
    }

    #[test]
    fn test_pixel_bounds_checked() {
        let result = ServerConfig::from_lookup(lookup_from(&[
            ("DOTSOCR_MIN_PIXELS", "5000"),
            ("DOTSOCR_MAX_PIXELS", "4000"),
        ]));
        assert!(result.is_err());
    }
}
