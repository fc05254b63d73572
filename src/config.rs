//! Configuration types for pipeline runs.
//!
//! Two layers:
//!
//! * [`PipelineConfig`]: everything the orchestrator and the runner need:
//!   retry budget, stage timeout, chapter fan-out, the LLM provider handle
//!   and the progress callback. Built via [`PipelineConfig::builder()`].
//! * [`StageSettings`]: the part a stage itself reads. Plain serde data, so
//!   [`crate::runner::CommandStageRunner`] can ship it to an isolated worker
//!   as JSON (`SCAN2MD_STAGE_SETTINGS`).
//!
//! The chapter folder is not configuration; it travels with each
//! [`crate::run::JobDescriptor`].

use crate::error::PipelineError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound accepted for [`PipelineConfig::retry_budget`] and
/// [`LlmSettings::max_retries`].
pub const MAX_RETRY_BUDGET: u32 = 10;

/// Longest single wait between two attempts.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Delay before retry number `attempt` (1-based): `backoff_ms * 2^(attempt-1)`,
/// capped at [`MAX_RETRY_DELAY`].
pub fn retry_delay(backoff_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64
        .checked_pow(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    Duration::from_millis(backoff_ms.saturating_mul(factor)).min(MAX_RETRY_DELAY)
}

/// Configuration for pipeline runs.
///
/// # Example
/// ```rust
/// use scan2md::{LowConfidencePolicy, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .retry_budget(1)
///     .stage_timeout_secs(600)
///     .min_confidence(0.75)
///     .low_confidence(LowConfidencePolicy::FlagAndContinue)
///     .build()
///     .unwrap();
/// assert_eq!(config.stage.min_confidence, 0.75);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Extra attempts for a chapter whose stage failed with a transient
    /// error. Deterministic failures are never retried. Default: 2.
    pub retry_budget: u32,

    /// Delay before the first retry; doubles after each attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Wall-clock budget of one stage invocation in seconds. Default: 1800.
    pub stage_timeout_secs: u64,

    /// Chapters processed concurrently inside one stage invocation. Default: 4.
    pub chapter_concurrency: usize,

    /// Extra environment handed to every stage invocation.
    pub environment: BTreeMap<String, String>,

    /// Settings read by the stages themselves.
    pub stage: StageSettings,

    /// Pre-constructed LLM provider. Takes precedence over
    /// `stage.llm.provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Receives run, stage and chapter events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_budget: 2,
            retry_backoff_ms: 500,
            stage_timeout_secs: 1800,
            chapter_concurrency: 4,
            environment: BTreeMap::new(),
            stage: StageSettings::default(),
            provider: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("retry_budget", &self.retry_budget)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("stage_timeout_secs", &self.stage_timeout_secs)
            .field("chapter_concurrency", &self.chapter_concurrency)
            .field("environment", &self.environment.keys().collect::<Vec<_>>())
            .field("stage", &self.stage)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl fmt::Debug for PipelineConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl PipelineConfigBuilder {
    pub fn retry_budget(mut self, n: u32) -> Self {
        self.config.retry_budget = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn stage_timeout_secs(mut self, secs: u64) -> Self {
        self.config.stage_timeout_secs = secs;
        self
    }

    pub fn chapter_concurrency(mut self, n: usize) -> Self {
        self.config.chapter_concurrency = n.max(1);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.environment.insert(key.into(), value.into());
        self
    }

    /// Replace all stage settings at once.
    pub fn stage_settings(mut self, settings: StageSettings) -> Self {
        self.config.stage = settings;
        self
    }

    pub fn min_confidence(mut self, threshold: f32) -> Self {
        self.config.stage.min_confidence = threshold;
        self
    }

    pub fn low_confidence(mut self, policy: LowConfidencePolicy) -> Self {
        self.config.stage.low_confidence = policy;
        self
    }

    pub fn page_concurrency(mut self, n: usize) -> Self {
        self.config.stage.page_concurrency = n.max(1);
        self
    }

    pub fn page_separator(mut self, sep: Separator) -> Self {
        self.config.stage.page_separator = sep;
        self
    }

    pub fn chapter_separator(mut self, sep: Separator) -> Self {
        self.config.stage.chapter_separator = sep;
        self
    }

    pub fn number_chapters(mut self, v: bool) -> Self {
        self.config.stage.number_chapters = v;
        self
    }

    pub fn table_of_contents(mut self, v: bool) -> Self {
        self.config.stage.table_of_contents = v;
        self
    }

    pub fn detector(mut self, kind: DetectorKind) -> Self {
        self.config.stage.detector = kind;
        self
    }

    pub fn ocr_engine(mut self, kind: OcrEngineKind) -> Self {
        self.config.stage.ocr_engine = kind;
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.stage.llm.provider_name = Some(name.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.stage.llm.model = Some(model.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.stage.llm.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.stage.llm.max_tokens = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.stage.llm.api_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.stage_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "Stage timeout must be ≥ 1 second".into(),
            ));
        }
        if c.chapter_concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "Chapter concurrency must be ≥ 1".into(),
            ));
        }
        if c.retry_budget > MAX_RETRY_BUDGET {
            return Err(PipelineError::InvalidConfig(format!(
                "Retry budget must be ≤ {MAX_RETRY_BUDGET}, got {}",
                c.retry_budget
            )));
        }
        c.stage.validate()?;
        Ok(self.config)
    }
}

// ── Stage settings ───────────────────────────────────────────────────────

/// Settings read by the stages. Serialisable so isolated workers receive
/// exactly what an in-process stage would.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    /// Pages whose OCR confidence is below this are low-confidence.
    /// Range: 0.0–1.0. Default: 0.6.
    pub min_confidence: f32,

    /// What to do with a low-confidence page. Default: fail the chapter.
    pub low_confidence: LowConfidencePolicy,

    /// Pages recognised concurrently within one chapter. Default: 4.
    pub page_concurrency: usize,

    /// Between pages inside a chapter fragment. Default: none.
    pub page_separator: Separator,

    /// Between chapters in the final document. Default: horizontal rule.
    pub chapter_separator: Separator,

    /// Prefix chapter titles with their position (`# 2. Title`). Default: false.
    pub number_chapters: bool,

    /// Emit a linked table of contents above the first chapter. Default: false.
    pub table_of_contents: bool,

    /// Structure detector used by the Markdown stage. Default: heuristic.
    pub detector: DetectorKind,

    /// OCR engine used by isolated workers. Default: vision LLM.
    pub ocr_engine: OcrEngineKind,

    /// LLM backend settings, used by the vision OCR engine and the LLM
    /// detector.
    pub llm: LlmSettings,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            low_confidence: LowConfidencePolicy::default(),
            page_concurrency: 4,
            page_separator: Separator::None,
            chapter_separator: Separator::HorizontalRule,
            number_chapters: false,
            table_of_contents: false,
            detector: DetectorKind::default(),
            ocr_engine: OcrEngineKind::default(),
            llm: LlmSettings::default(),
        }
    }
}

impl StageSettings {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(PipelineError::InvalidConfig(format!(
                "Minimum confidence must be 0.0–1.0, got {}",
                self.min_confidence
            )));
        }
        if self.page_concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "Page concurrency must be ≥ 1".into(),
            ));
        }
        if self.llm.max_retries > MAX_RETRY_BUDGET {
            return Err(PipelineError::InvalidConfig(format!(
                "LLM retries must be ≤ {MAX_RETRY_BUDGET}, got {}",
                self.llm.max_retries
            )));
        }
        for sep in [&self.page_separator, &self.chapter_separator] {
            if let Separator::Custom(s) = sep {
                if s.trim().is_empty() {
                    return Err(PipelineError::InvalidConfig(
                        "Custom separator must not be blank".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Encode for the `SCAN2MD_STAGE_SETTINGS` variable.
    pub fn to_env_value(&self) -> Result<String, PipelineError> {
        serde_json::to_string(self)
            .map_err(|e| PipelineError::Internal(format!("stage settings encoding: {e}")))
    }

    /// Decode from the `SCAN2MD_STAGE_SETTINGS` variable and validate.
    pub fn from_env_value(raw: &str) -> Result<Self, PipelineError> {
        let settings: Self = serde_json::from_str(raw).map_err(|e| {
            PipelineError::InvalidConfig(format!("SCAN2MD_STAGE_SETTINGS is not valid: {e}"))
        })?;
        settings.validate()?;
        Ok(settings)
    }
}

/// LLM backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Provider name (e.g. "openai", "anthropic", "ollama"). If None, the
    /// provider is auto-detected from the environment.
    pub provider_name: Option<String>,

    /// Model identifier. If None, uses the provider default.
    pub model: Option<String>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens generated per page. Default: 4096.
    pub max_tokens: usize,

    /// Retries of a single failed call before the page fails. Default: 3.
    pub max_retries: u32,

    /// Initial delay between call retries (exponential). Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Override of the OCR transcription prompt.
    pub ocr_prompt: Option<String>,

    /// Override of the structuring prompt.
    pub structure_prompt: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider_name: None,
            model: None,
            temperature: 0.1,
            max_tokens: 4096,
            max_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 60,
            ocr_prompt: None,
            structure_prompt: None,
        }
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Handling of pages whose OCR confidence is below the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LowConfidencePolicy {
    /// The chapter fails with an extraction error. (default)
    #[default]
    FailChapter,
    /// The page is kept, its index recorded in `flagged_pages`, and a
    /// warning logged.
    FlagAndContinue,
}

/// Which structure detector the Markdown stage uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Rule-based, offline. (default)
    #[default]
    Heuristic,
    /// Language-model rewrite through the configured provider.
    Llm,
}

/// Which OCR engine an isolated worker builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrEngineKind {
    /// Vision LLM transcription through the configured provider. (default)
    #[default]
    Vision,
}

/// How to separate pages (inside a chapter) or chapters (in the document).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Separator {
    /// Blank line only: "\n\n". (default for pages)
    #[default]
    None,
    /// Horizontal rule: "\n\n---\n\n"
    HorizontalRule,
    /// HTML comment with the position: "<!-- page N -->"
    Comment,
    /// Custom string inserted between items.
    Custom(String),
}

impl Separator {
    /// Render the separator placed before item `n` (1-indexed); `label`
    /// names the item in the comment form.
    pub fn render(&self, label: &str, n: usize) -> String {
        match self {
            Separator::None => "\n\n".to_string(),
            Separator::HorizontalRule => "\n\n---\n\n".to_string(),
            Separator::Comment => format!("\n\n<!-- {label} {n} -->\n\n"),
            Separator::Custom(s) => format!("\n\n{s}\n\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = PipelineConfig::default();
        assert_eq!(c.retry_budget, 2);
        assert_eq!(c.stage_timeout(), Duration::from_secs(1800));
        assert_eq!(c.stage.min_confidence, 0.6);
        assert_eq!(c.stage.low_confidence, LowConfidencePolicy::FailChapter);
        assert_eq!(c.stage.chapter_separator, Separator::HorizontalRule);
        assert_eq!(c.stage.detector, DetectorKind::Heuristic);
    }

    #[test]
    fn builder_rejects_out_of_range_values() {
        assert!(PipelineConfig::builder().min_confidence(1.5).build().is_err());
        assert!(PipelineConfig::builder().min_confidence(f32::NAN).build().is_err());
        assert!(PipelineConfig::builder().stage_timeout_secs(0).build().is_err());
        assert!(PipelineConfig::builder()
            .page_separator(Separator::Custom("  ".into()))
            .build()
            .is_err());
    }

    #[test]
    fn builder_clamps_concurrency() {
        let c = PipelineConfig::builder()
            .chapter_concurrency(0)
            .page_concurrency(0)
            .build()
            .unwrap();
        assert_eq!(c.chapter_concurrency, 1);
        assert_eq!(c.stage.page_concurrency, 1);
    }

    #[test]
    fn retry_delay_doubles_then_caps() {
        assert_eq!(retry_delay(100, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(100, 2), Duration::from_millis(200));
        assert_eq!(retry_delay(100, 3), Duration::from_millis(400));
        assert_eq!(retry_delay(500, 12), MAX_RETRY_DELAY);
        assert_eq!(retry_delay(500, 80), MAX_RETRY_DELAY);
        assert_eq!(retry_delay(0, u32::MAX), Duration::ZERO);
    }

    #[test]
    fn retry_budget_is_bounded() {
        let err = PipelineConfig::builder().retry_budget(80).build().unwrap_err();
        assert!(err.to_string().contains("Retry budget"), "got: {err}");
        assert!(PipelineConfig::builder()
            .retry_budget(MAX_RETRY_BUDGET)
            .build()
            .is_ok());
    }

    #[test]
    fn separators_render() {
        assert_eq!(Separator::None.render("page", 2), "\n\n");
        assert_eq!(Separator::HorizontalRule.render("chapter", 2), "\n\n---\n\n");
        assert_eq!(Separator::Comment.render("page", 3), "\n\n<!-- page 3 -->\n\n");
        assert_eq!(Separator::Custom("***".into()).render("page", 1), "\n\n***\n\n");
    }

    #[test]
    fn stage_settings_travel_as_json() {
        let settings = StageSettings {
            low_confidence: LowConfidencePolicy::FlagAndContinue,
            page_separator: Separator::Custom("~~".into()),
            number_chapters: true,
            ..StageSettings::default()
        };
        let raw = settings.to_env_value().unwrap();
        assert!(raw.contains("flag_and_continue"), "got: {raw}");
        assert_eq!(StageSettings::from_env_value(&raw).unwrap(), settings);

        // Missing fields fall back to defaults.
        let partial = StageSettings::from_env_value(r#"{"table_of_contents":true}"#).unwrap();
        assert!(partial.table_of_contents);
        assert_eq!(partial.page_concurrency, 4);

        assert!(StageSettings::from_env_value(r#"{"min_confidence":7.0}"#).is_err());
    }

    #[test]
    fn debug_hides_provider() {
        let c = PipelineConfig::default();
        let dbg = format!("{c:?}");
        assert!(dbg.contains("retry_budget"));
    }
}
