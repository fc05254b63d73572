//! LLM interaction shared by the vision OCR engine and the LLM detector.
//!
//! ## Retry Strategy
//!
//! Each call is retried up to `max_retries` times with exponential backoff
//! (`retry_backoff_ms * 2^(attempt-1)`): 500 ms → 1 s → 2 s with the
//! defaults. When every attempt fails the caller reports a transient stage
//! error, so the runner's own chapter-level retry budget still applies.

use crate::config::{retry_delay, LlmSettings};
use crate::error::PipelineError;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// A call that failed on every attempt.
#[derive(Debug, Clone)]
pub(crate) struct CallFailure {
    pub attempts: u32,
    pub detail: String,
}

/// Send `messages` and return the response text, retrying failed calls.
///
/// `label` identifies the unit of work in log lines (e.g. `"01 p3"`).
pub(crate) async fn complete(
    provider: &Arc<dyn LLMProvider>,
    messages: &[ChatMessage],
    settings: &LlmSettings,
    label: &str,
) -> Result<String, CallFailure> {
    let start = Instant::now();
    let options = build_options(settings);
    let call_timeout = Duration::from_secs(settings.api_timeout_secs.max(1));
    let mut last_err: Option<String> = None;

    for attempt in 0..=settings.max_retries {
        if attempt > 0 {
            let backoff = retry_delay(settings.retry_backoff_ms, attempt);
            warn!(
                "{}: retry {}/{} after {}ms",
                label,
                attempt,
                settings.max_retries,
                backoff.as_millis()
            );
            sleep(backoff).await;
        }

        match timeout(call_timeout, provider.chat(messages, Some(&options))).await {
            Ok(Ok(response)) => {
                debug!(
                    "{}: {} input tokens, {} output tokens, {:?}",
                    label,
                    response.prompt_tokens,
                    response.completion_tokens,
                    start.elapsed()
                );
                return Ok(response.content);
            }
            Ok(Err(e)) => {
                let msg = e.to_string();
                warn!("{}: attempt {} failed: {}", label, attempt + 1, msg);
                last_err = Some(msg);
            }
            Err(_) => {
                let msg = format!("no response within {}s", call_timeout.as_secs());
                warn!("{}: attempt {} failed: {}", label, attempt + 1, msg);
                last_err = Some(msg);
            }
        }
    }

    Err(CallFailure {
        attempts: settings.max_retries + 1,
        detail: last_err.unwrap_or_else(|| "Unknown error".to_string()),
    })
}

/// Build `CompletionOptions` from the LLM settings.
fn build_options(settings: &LlmSettings) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(settings.temperature),
        max_tokens: Some(settings.max_tokens),
        ..Default::default()
    }
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. a pre-built provider handed to the config;
/// 2. `provider_name` (+ `model`) from the settings;
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` when both are set;
/// 4. OpenAI when `OPENAI_API_KEY` is set;
/// 5. [`ProviderFactory::from_env`] auto-detection.
pub fn resolve_provider(
    prebuilt: Option<&Arc<dyn LLMProvider>>,
    settings: &LlmSettings,
) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(provider) = prebuilt {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = settings.provider_name {
        let model = settings.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = settings.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or pass --provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_options_defaults() {
        let opts = build_options(&LlmSettings::default());
        assert_eq!(opts.temperature, Some(0.1));
        assert_eq!(opts.max_tokens, Some(4096));
    }

    #[test]
    fn build_options_follow_settings() {
        let settings = LlmSettings {
            temperature: 0.0,
            max_tokens: 512,
            ..LlmSettings::default()
        };
        let opts = build_options(&settings);
        assert_eq!(opts.temperature, Some(0.0));
        assert_eq!(opts.max_tokens, Some(512));
    }
}
