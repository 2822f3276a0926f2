//! Configuration types for document extraction.
//!
//! All pipeline behaviour is controlled through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`]. Keeping every knob in one struct makes
//! it trivial to share configs across concurrent document runs and to diff
//! two runs to understand why their outputs differ.

use crate::error::PipelineError;
use crate::pipeline::llm::{ModelService, RetryPolicy};
use crate::pipeline::merge::{PreferNonEmptyLonger, SharedConflictPolicy};
use crate::progress::ProgressCallback;
use crate::rules::RuleTables;
use std::fmt;
use std::sync::Arc;

/// Default model for per-page classification and extraction.
pub const DEFAULT_VISION_MODEL: &str = "gpt-4.1-nano";

/// Default model for the canonical transformation.
pub const DEFAULT_TEXT_MODEL: &str = "gpt-4.1-mini";

/// Upper bound for [`ExtractionConfigBuilder::max_retries`].
pub const MAX_RETRIES: u32 = 10;

/// Configuration for one document extraction.
///
/// Built via [`ExtractionConfig::builder()`] or using
/// [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_invoice::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .max_pages(3)
///     .vision_model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// assert_eq!(config.max_pages, 3);
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Maximum number of pages rasterised and extracted. Default: 5.
    ///
    /// Pages past the cap are never rendered, so a 40-page scan costs the
    /// same as a 5-page one.
    pub max_pages: usize,

    /// Rendering DPI. Range: 72–400. Default: 150.
    pub dpi: u32,

    /// Maximum rendered image dimension (width or height) in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Number of concurrent page extraction calls. Default: 5.
    ///
    /// Lower it when the vision service answers with `429`.
    pub concurrency: usize,

    /// Vision model identifier. If None, uses [`DEFAULT_VISION_MODEL`].
    pub vision_model: Option<String>,

    /// Vision provider name (e.g. "openai", "anthropic", "ollama").
    pub vision_provider_name: Option<String>,

    /// Pre-constructed vision service. Takes precedence over the name.
    pub vision_service: Option<Arc<dyn ModelService>>,

    /// Text model identifier. If None, uses [`DEFAULT_TEXT_MODEL`].
    pub text_model: Option<String>,

    /// Text provider name.
    pub text_provider_name: Option<String>,

    /// Pre-constructed text service. Takes precedence over the name.
    pub text_service: Option<Arc<dyn ModelService>>,

    /// Sampling temperature for both calls. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens each call may generate. Default: 4096.
    pub max_tokens: usize,

    /// Retry attempts on a transient model failure. Default: 3, at most
    /// [`MAX_RETRIES`] through the builder.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    pub retry_backoff_ms: u64,

    /// Bounded wait per model call attempt, in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Custom per-page prompt. If None, uses the built-in default.
    pub extraction_prompt: Option<String>,

    /// Custom transformation prompt template. If None, uses the built-in default.
    pub transform_prompt: Option<String>,

    /// Lookup tables for classification, merging and canonical rules.
    pub rules: Arc<RuleTables>,

    /// Scalar conflict resolution used by the merger.
    pub conflict_policy: SharedConflictPolicy,

    /// Optional per-page / per-stage event sink.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_pages: 5,
            dpi: 150,
            max_rendered_pixels: 2000,
            concurrency: 5,
            vision_model: None,
            vision_provider_name: None,
            vision_service: None,
            text_model: None,
            text_provider_name: None,
            text_service: None,
            temperature: 0.1,
            max_tokens: 4096,
            max_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 60,
            download_timeout_secs: 120,
            password: None,
            extraction_prompt: None,
            transform_prompt: None,
            rules: Arc::new(RuleTables::default()),
            conflict_policy: Arc::new(PreferNonEmptyLonger),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("max_pages", &self.max_pages)
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("concurrency", &self.concurrency)
            .field("vision_model", &self.vision_model)
            .field("vision_provider_name", &self.vision_provider_name)
            .field(
                "vision_service",
                &self.vision_service.as_ref().map(|s| s.name()),
            )
            .field("text_model", &self.text_model)
            .field("text_provider_name", &self.text_provider_name)
            .field("text_service", &self.text_service.as_ref().map(|s| s.name()))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("rules_version", &self.rules.version)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Retry and bounded-wait settings shared by both model calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_ms: self.retry_backoff_ms,
            timeout_secs: self.api_timeout_secs,
        }
    }
}

/// Builder for [`ExtractionConfig`].
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl fmt::Debug for ExtractionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ExtractionConfigBuilder {
    pub fn max_pages(mut self, n: usize) -> Self {
        self.config.max_pages = n;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn vision_model(mut self, model: impl Into<String>) -> Self {
        self.config.vision_model = Some(model.into());
        self
    }

    pub fn vision_provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.vision_provider_name = Some(name.into());
        self
    }

    pub fn vision_service(mut self, service: Arc<dyn ModelService>) -> Self {
        self.config.vision_service = Some(service);
        self
    }

    pub fn text_model(mut self, model: impl Into<String>) -> Self {
        self.config.text_model = Some(model.into());
        self
    }

    pub fn text_provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.text_provider_name = Some(name.into());
        self
    }

    pub fn text_service(mut self, service: Arc<dyn ModelService>) -> Self {
        self.config.text_service = Some(service);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n.min(MAX_RETRIES);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn extraction_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.extraction_prompt = Some(prompt.into());
        self
    }

    pub fn transform_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.transform_prompt = Some(prompt.into());
        self
    }

    pub fn rules(mut self, rules: RuleTables) -> Self {
        self.config.rules = Arc::new(rules);
        self
    }

    pub fn conflict_policy(mut self, policy: SharedConflictPolicy) -> Self {
        self.config.conflict_policy = policy;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, PipelineError> {
        let c = &self.config;
        if c.max_pages == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_pages must be ≥ 1".into(),
            ));
        }
        if c.api_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "api_timeout_secs must be ≥ 1; model calls need a bounded wait".into(),
            ));
        }
        if c.rules.company_code.trim().is_empty() || c.rules.currency.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "rule tables must define company_code and currency".into(),
            ));
        }
        if c.rules.sheet_no_digits == 0 {
            return Err(PipelineError::InvalidConfig(
                "sheet_no_digits must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}
