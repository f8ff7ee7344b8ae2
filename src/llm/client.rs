// =============================================================================
// LLM Client — tier routing, retries, fallback, structured output
// =============================================================================
//
// `generate` is the single entry point:
//   - routes to the primary or fallback model per the request tier
//   - enforces the per-model input budget (sections dropped by priority;
//     preamble and anchor are untouchable)
//   - retries transient failures (network, 5xx, rate limit) with
//     exponential backoff + jitter, up to the configured attempts
//   - falls back to the secondary tier after the primary is exhausted
//   - validates structured output against the expected schema, with exactly
//     one repair re-prompt carrying the parser error
//   - surfaces explicit refusals immediately, without retry or fallback
//
// The transport is a trait so the whole pipeline can be driven by a scripted
// double in tests.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::llm::prompt::{extract_json, PromptParts, SchemaSpec};
use crate::runtime_config::LlmConfig;

// =============================================================================
// Model tiers
// =============================================================================

/// Which model tier a request wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Primary,
    Fallback,
    #[default]
    Auto,
}

// =============================================================================
// Transport
// =============================================================================

/// One raw completion from a model.
#[derive(Debug, Clone)]
pub struct LlmCallOutput {
    pub content: String,
    pub model: String,
    pub latency_ms: u64,
}

/// Chat-completion transport seam.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<LlmCallOutput>;
}

/// OpenRouter-compatible chat-completions transport.
pub struct OpenRouterTransport {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenRouterTransport {
    pub fn new(
        http: reqwest::Client,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    pub fn from_env(http: reqwest::Client, base_url: impl Into<String>) -> Result<Self> {
        let api_key =
            std::env::var("OPENROUTER_API_KEY").context("OPENROUTER_API_KEY missing")?;
        if api_key.trim().is_empty() {
            return Err(anyhow!("OPENROUTER_API_KEY empty"));
        }
        Ok(Self::new(http, api_key, base_url))
    }
}

#[async_trait]
impl LlmTransport for OpenRouterTransport {
    async fn complete(
        &self,
        model: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<LlmCallOutput> {
        let start = Instant::now();

        let req = ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: Some(0.2),
            max_tokens: Some(max_tokens),
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(timeout)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&req)
            .send()
            .await
            .context("llm request")?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let snippet: String = body.chars().take(800).collect();
            return Err(anyhow!("llm {}: {}", status.as_u16(), snippet));
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&body).context("llm response json parse")?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        Ok(LlmCallOutput {
            content,
            model: model.to_string(),
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

// =============================================================================
// Requests / responses / errors
// =============================================================================

/// One structured-output generation request.
pub struct LlmRequest {
    pub parts: PromptParts,
    pub system: String,
    pub schema: SchemaSpec,
    pub tier: ModelTier,
}

/// A validated structured response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub value: serde_json::Value,
    pub model: String,
    pub tier_used: ModelTier,
    pub latency_ms: u64,
    pub attempts: u32,
    pub dropped_sections: Vec<&'static str>,
}

#[derive(Debug, Error)]
pub enum LlmError {
    /// The irreducible prompt exceeds the model budget.
    #[error("prompt exceeds model budget: needs {needed} tokens, budget {budget}")]
    Budget { needed: usize, budget: usize },

    /// All retries and the fallback tier were exhausted on transient
    /// failures.
    #[error("all model tiers exhausted: {0}")]
    Exhausted(String),

    /// The model explicitly refused; surfaced immediately.
    #[error("model refused the request: {0}")]
    Refused(String),

    /// Structured output still invalid after the single repair attempt.
    #[error("structured output invalid after repair: {0}")]
    Schema(String),

    #[error("request cancelled")]
    Cancelled,
}

// =============================================================================
// Client
// =============================================================================

pub struct LlmClient {
    transport: Arc<dyn LlmTransport>,
    cfg: LlmConfig,
}

impl LlmClient {
    pub fn new(transport: Arc<dyn LlmTransport>, cfg: LlmConfig) -> Self {
        Self { transport, cfg }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.cfg
    }

    /// Generate a schema-validated structured response. See the module
    /// header for the routing and retry semantics.
    pub async fn generate(
        &self,
        req: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        let tiers: &[ModelTier] = match req.tier {
            ModelTier::Primary => &[ModelTier::Primary],
            ModelTier::Fallback => &[ModelTier::Fallback],
            ModelTier::Auto => &[ModelTier::Primary, ModelTier::Fallback],
        };

        let mut last_error = String::new();

        for &tier in tiers {
            match self.try_tier(req, tier, cancel).await {
                Ok(resp) => return Ok(resp),
                // Refusal and schema failures are non-retriable and do not
                // engage the fallback tier.
                Err(e @ (LlmError::Refused(_) | LlmError::Schema(_) | LlmError::Cancelled)) => {
                    return Err(e)
                }
                Err(LlmError::Budget { needed, budget }) => {
                    // A smaller fallback budget cannot help; stop here.
                    return Err(LlmError::Budget { needed, budget });
                }
                Err(LlmError::Exhausted(msg)) => {
                    warn!(tier = ?tier, error = %msg, "model tier exhausted");
                    last_error = msg;
                }
            }
        }

        Err(LlmError::Exhausted(last_error))
    }

    /// Run the full attempt/repair cycle against one tier.
    async fn try_tier(
        &self,
        req: &LlmRequest,
        tier: ModelTier,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        let (model, budget) = match tier {
            ModelTier::Primary | ModelTier::Auto => {
                (self.cfg.primary_model.as_str(), self.cfg.primary_input_budget)
            }
            ModelTier::Fallback => (
                self.cfg.fallback_model.as_str(),
                self.cfg.fallback_input_budget,
            ),
        };

        let effective = budget.saturating_sub(self.cfg.headroom_tokens);
        let (prompt, dropped) = req
            .parts
            .render_within(effective)
            .map_err(|needed| LlmError::Budget {
                needed,
                budget: effective,
            })?;

        if !dropped.is_empty() {
            debug!(model, ?dropped, "prompt sections dropped to fit budget");
        }

        let output = self
            .call_with_retries(model, &req.system, &prompt, cancel)
            .await?;

        if let Some(refusal) = detect_refusal(&output.0.content) {
            return Err(LlmError::Refused(refusal));
        }

        let attempts = output.1;
        match self.validate(&output.0, &req.schema) {
            Ok(value) => Ok(LlmResponse {
                value,
                model: output.0.model,
                tier_used: tier,
                latency_ms: output.0.latency_ms,
                attempts,
                dropped_sections: dropped,
            }),
            Err(parse_err) => {
                // One self-repair pass: original prompt plus the parser
                // error.
                info!(model, error = %parse_err, "structured output invalid — repairing");
                let repair_prompt = format!(
                    "{prompt}\n\nYour previous response failed validation: {parse_err}\n\
                     Respond again with ONLY a valid JSON object matching the required schema."
                );
                let repaired = self
                    .call_with_retries(model, &req.system, &repair_prompt, cancel)
                    .await?;

                if let Some(refusal) = detect_refusal(&repaired.0.content) {
                    return Err(LlmError::Refused(refusal));
                }

                match self.validate(&repaired.0, &req.schema) {
                    Ok(value) => Ok(LlmResponse {
                        value,
                        model: repaired.0.model,
                        tier_used: tier,
                        latency_ms: repaired.0.latency_ms,
                        attempts: attempts + repaired.1,
                        dropped_sections: dropped,
                    }),
                    Err(e) => Err(LlmError::Schema(e)),
                }
            }
        }
    }

    /// Retry transient transport failures with exponential backoff + jitter.
    /// Returns the raw output and the attempt count.
    async fn call_with_retries(
        &self,
        model: &str,
        system: &str,
        user: &str,
        cancel: &CancellationToken,
    ) -> Result<(LlmCallOutput, u32), LlmError> {
        let timeout = Duration::from_millis(self.cfg.attempt_timeout_ms);
        let mut last_error = String::new();

        for attempt in 1..=self.cfg.max_attempts {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }

            let call = self.transport.complete(model, system, user, self.cfg.max_output_tokens, timeout);
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                r = call => r,
            };

            match result {
                Ok(output) => {
                    debug!(model, attempt, latency_ms = output.latency_ms, "llm call ok");
                    return Ok((output, attempt));
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(model, attempt, error = %last_error, "llm call failed");
                    if attempt < self.cfg.max_attempts {
                        let backoff_ms = 500_u64 * 2_u64.pow(attempt - 1);
                        let jitter_ms = rand::thread_rng().gen_range(0..250);
                        tokio::time::sleep(Duration::from_millis(backoff_ms + jitter_ms)).await;
                    }
                }
            }
        }

        Err(LlmError::Exhausted(last_error))
    }

    fn validate(
        &self,
        output: &LlmCallOutput,
        schema: &SchemaSpec,
    ) -> Result<serde_json::Value, String> {
        let value = extract_json(&output.content)?;
        schema.validate(&value)?;
        Ok(value)
    }
}

/// Detect an explicit refusal in the first line of model output.
fn detect_refusal(content: &str) -> Option<String> {
    let head = content.trim().lines().next().unwrap_or("").to_ascii_lowercase();
    const MARKERS: [&str; 4] = [
        "i cannot",
        "i can't",
        "i won't",
        "i'm not able to",
    ];
    if MARKERS.iter().any(|m| head.starts_with(m)) {
        Some(content.trim().chars().take(200).collect())
    } else {
        None
    }
}

// =============================================================================
// Wire shapes (OpenRouter chat completions)
// =============================================================================

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    pub message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    pub content: String,
}

// =============================================================================
// Test transport
// =============================================================================

/// Scripted transport for tests: pops one canned outcome per call.
#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    pub enum Script {
        Ok(&'static str),
        Err(&'static str),
    }

    pub struct ScriptedTransport {
        script: Mutex<Vec<Script>>,
        pub calls: std::sync::atomic::AtomicU32,
    }

    impl ScriptedTransport {
        pub fn new(mut script: Vec<Script>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: std::sync::atomic::AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmTransport for ScriptedTransport {
        async fn complete(
            &self,
            model: &str,
            _system: &str,
            _user: &str,
            _max_tokens: u32,
            _timeout: Duration,
        ) -> Result<LlmCallOutput> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            match self.script.lock().pop() {
                Some(Script::Ok(content)) => Ok(LlmCallOutput {
                    content: content.to_string(),
                    model: model.to_string(),
                    latency_ms: 1,
                }),
                Some(Script::Err(msg)) => Err(anyhow!("{msg}")),
                None => Err(anyhow!("script exhausted")),
            }
        }
    }
}
