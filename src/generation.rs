//! Generation provider abstraction and response parsing.
//!
//! The engine owns the prompt contract and is the sole consumer-side
//! validator of response shape. Providers return raw model text; this
//! module renders prompts from the registry, extracts the JSON payload,
//! and validates it against the operation's output schema, failing closed
//! on any deviation.
//!
//! A response that cannot be parsed is retried a bounded number of times
//! with a stricter formatting instruction appended to the prompt;
//! exhausting those retries is a terminal [`EngineError::MalformedResponse`].
//!
//! Transport-level retries (429/5xx/network, exponential backoff) live in
//! the providers, mirroring the embedding client.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use crate::config::GenerationConfig;
use crate::error::{EngineError, EngineResult};
use crate::prompts::{OperationKind, OutputSchema, PromptRegistry};

/// Structured response for cluster and document summarization.
#[derive(Debug, Clone, Deserialize)]
pub struct SummaryResponse {
    pub title: String,
    pub summary: String,
    pub relevant: bool,
}

/// Structured response for impact assessment.
#[derive(Debug, Clone, Deserialize)]
pub struct ImpactResponse {
    pub score: f64,
    pub justification: String,
}

/// Trait for text-generation providers. Implementations return the raw
/// model output for a rendered prompt.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(&self, prompt: &str) -> EngineResult<String>;
}

/// Create the appropriate [`GenerationProvider`] based on configuration.
pub fn create_provider(config: &GenerationConfig) -> EngineResult<Box<dyn GenerationProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledGeneration)),
        "openai" => Ok(Box::new(OpenAiGeneration::new(config)?)),
        "ollama" => Ok(Box::new(OllamaGeneration::new(config)?)),
        other => Err(unavailable(format!("unknown generation provider: {}", other))),
    }
}

fn unavailable(detail: String) -> EngineError {
    EngineError::CollaboratorUnavailable {
        collaborator: "generation",
        detail,
    }
}

const REINFORCED_INSTRUCTION: &str = "\n\nThe previous reply was not valid. Reply with ONLY the JSON object described above — no prose, no code fences, no additional keys.";

/// Request a summary for a cluster or document operation.
///
/// Renders the prompt, calls the provider, and validates the response
/// shape, retrying with a reinforced instruction on malformed output.
pub async fn request_summary(
    provider: &dyn GenerationProvider,
    registry: &PromptRegistry,
    kind: OperationKind,
    fields: &HashMap<&str, String>,
    malformed_retries: u32,
) -> EngineResult<SummaryResponse> {
    debug_assert!(matches!(
        registry.spec(kind).output_schema,
        OutputSchema::Summary
    ));
    let prompt = registry.render(kind, fields)?;
    invoke_with_reinforcement(provider, &prompt, malformed_retries, parse_summary)
        .await
        .map_err(|e| e.into_engine_error("summary", malformed_retries + 1))
}

/// Request an impact score for one (change, document) pair.
pub async fn request_impact(
    provider: &dyn GenerationProvider,
    registry: &PromptRegistry,
    fields: &HashMap<&str, String>,
    malformed_retries: u32,
) -> EngineResult<ImpactResponse> {
    let prompt = registry.render(OperationKind::ImpactAssessment, fields)?;
    invoke_with_reinforcement(provider, &prompt, malformed_retries, parse_impact)
        .await
        .map_err(|e| e.into_engine_error("impact", malformed_retries + 1))
}

enum InvokeError {
    /// The provider itself failed; surfaced unchanged.
    Transport(EngineError),
    /// Every attempt parsed to garbage.
    Malformed(String),
}

impl InvokeError {
    fn into_engine_error(self, kind: &'static str, attempts: u32) -> EngineError {
        match self {
            InvokeError::Transport(e) => e,
            InvokeError::Malformed(detail) => EngineError::MalformedResponse {
                kind,
                attempts,
                detail,
            },
        }
    }
}

/// Call the provider, re-prompting with the reinforced instruction when
/// the parser rejects the output.
async fn invoke_with_reinforcement<T, F>(
    provider: &dyn GenerationProvider,
    prompt: &str,
    malformed_retries: u32,
    parse: F,
) -> Result<T, InvokeError>
where
    F: Fn(&str) -> Result<T, String>,
{
    let mut last_detail = String::new();
    for attempt in 0..=malformed_retries {
        let effective_prompt = if attempt == 0 {
            prompt.to_string()
        } else {
            format!("{}{}", prompt, REINFORCED_INSTRUCTION)
        };

        let raw = provider
            .complete(&effective_prompt)
            .await
            .map_err(InvokeError::Transport)?;

        match parse(&raw) {
            Ok(value) => return Ok(value),
            Err(detail) => {
                warn!(attempt, %detail, "generation response failed schema validation");
                last_detail = detail;
            }
        }
    }
    Err(InvokeError::Malformed(last_detail))
}

/// Extract the first JSON object from raw model output.
///
/// Tolerates code fences and prose around the object but nothing inside
/// it; the object itself must parse.
fn extract_json(raw: &str) -> Result<serde_json::Value, String> {
    let trimmed = raw.trim();

    let start = trimmed
        .find('{')
        .ok_or_else(|| "no JSON object in response".to_string())?;

    // Walk to the matching close brace, respecting strings
    let bytes = trimmed.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut end = None;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }

    let end = end.ok_or_else(|| "unbalanced JSON object in response".to_string())?;
    serde_json::from_str(&trimmed[start..=end]).map_err(|e| format!("invalid JSON: {}", e))
}

fn parse_summary(raw: &str) -> Result<SummaryResponse, String> {
    let value = extract_json(raw)?;
    let response: SummaryResponse =
        serde_json::from_value(value).map_err(|e| format!("summary schema violation: {}", e))?;
    if response.summary.trim().is_empty() {
        return Err("summary schema violation: empty summary".to_string());
    }
    Ok(response)
}

fn parse_impact(raw: &str) -> Result<ImpactResponse, String> {
    let value = extract_json(raw)?;
    let response: ImpactResponse =
        serde_json::from_value(value).map_err(|e| format!("impact schema violation: {}", e))?;
    if !(0.0..=1.0).contains(&response.score) {
        return Err(format!(
            "impact schema violation: score {} outside [0.00, 1.00]",
            response.score
        ));
    }
    Ok(response)
}

// ============ Disabled Provider ============

/// A no-op generation provider that always returns errors.
pub struct DisabledGeneration;

#[async_trait]
impl GenerationProvider for DisabledGeneration {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn complete(&self, _prompt: &str) -> EngineResult<String> {
        Err(unavailable("generation provider is disabled".to_string()))
    }
}

// ============ OpenAI Provider ============

/// Generation provider using the OpenAI chat completions API.
///
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAiGeneration {
    model: String,
    max_retries: u32,
    timeout_secs: u64,
}

impl OpenAiGeneration {
    pub fn new(config: &GenerationConfig) -> EngineResult<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| unavailable("generation.model required for OpenAI provider".into()))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(unavailable("OPENAI_API_KEY environment variable not set".into()));
        }

        Ok(Self {
            model,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAiGeneration {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> EngineResult<String> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| unavailable("OPENAI_API_KEY not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| unavailable(e.to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.0,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post("https://api.openai.com/v1/chat/completions")
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value =
                            response.json().await.map_err(|e| unavailable(e.to_string()))?;
                        let content = json
                            .get("choices")
                            .and_then(|c| c.get(0))
                            .and_then(|c| c.get("message"))
                            .and_then(|m| m.get("content"))
                            .and_then(|c| c.as_str())
                            .ok_or_else(|| {
                                unavailable("invalid OpenAI response: missing message content".into())
                            })?;
                        return Ok(content.to_string());
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(unavailable(format!(
                            "OpenAI API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(unavailable(format!("OpenAI API error {}: {}", status, body_text)));
                }
                Err(e) => {
                    last_err = Some(unavailable(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| unavailable("generation failed after retries".into())))
    }
}

// ============ Ollama Provider ============

/// Generation provider using a local Ollama instance's `/api/generate`.
pub struct OllamaGeneration {
    model: String,
    url: String,
    max_retries: u32,
    timeout_secs: u64,
}

impl OllamaGeneration {
    pub fn new(config: &GenerationConfig) -> EngineResult<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| unavailable("generation.model required for Ollama provider".into()))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            url,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl GenerationProvider for OllamaGeneration {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> EngineResult<String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| unavailable(e.to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post(format!("{}/api/generate", self.url))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value =
                            response.json().await.map_err(|e| unavailable(e.to_string()))?;
                        let content = json
                            .get("response")
                            .and_then(|r| r.as_str())
                            .ok_or_else(|| {
                                unavailable("invalid Ollama response: missing response field".into())
                            })?;
                        return Ok(content.to_string());
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(unavailable(format!(
                            "Ollama API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(unavailable(format!("Ollama API error {}: {}", status, body_text)));
                }
                Err(e) => {
                    last_err = Some(unavailable(format!(
                        "Ollama connection error (is Ollama running at {}?): {}",
                        self.url, e
                    )));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| unavailable("Ollama generation failed after retries".into())))
    }
}
