//! Optional LLM refinement of a deterministic baseline.
//!
//! Every call site goes through [`refine`]: build a prompt from the baseline,
//! ask the provider, pull the first balanced JSON object out of the reply,
//! decode it into a candidate whose fields are all optional, then validate and
//! merge it. Any failure along the way yields the untouched baseline unless the
//! caller asked for strict mode.

pub mod config;
pub mod install;
pub mod run;

use crate::error::PlanError;
use las_providers::{GenerateRequest, LLMProvider};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Per-call planner switches, resolved once from flags and environment.
#[derive(Debug, Clone, Default)]
pub struct PlannerOptions {
    pub enabled: bool,
    pub debug: bool,
    pub strict: bool,
    pub timeout_seconds: u64,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanSource {
    Static,
    Llm,
}

impl fmt::Display for PlanSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanSource::Static => write!(f, "static"),
            PlanSource::Llm => write!(f, "llm"),
        }
    }
}

/// A plan together with where it came from. For a static result `reason`
/// carries the fallback cause.
#[derive(Debug, Clone)]
pub struct Refined<T> {
    pub value: T,
    pub source: PlanSource,
    pub reason: String,
}

/// Decoded provider suggestion.
pub trait Candidate: DeserializeOwned {
    fn reason(&self) -> &str;
}

/// One refinement call site.
pub trait Refinement {
    type Plan: Clone;
    type Candidate: Candidate;

    /// Name used in log lines and the strict-mode error prefix.
    const PLANNER: &'static str;

    fn prompt(&self, baseline: &Self::Plan) -> Result<String, PlanError>;

    /// Validates the candidate against the baseline. Must not partially apply:
    /// either the whole candidate merges or an error is returned.
    fn merge(&self, baseline: &Self::Plan, candidate: Self::Candidate) -> Result<Self::Plan, PlanError>;
}

pub async fn refine<R>(
    refinement: &R,
    baseline: R::Plan,
    provider: Option<&dyn LLMProvider>,
    opts: &PlannerOptions,
) -> Result<Refined<R::Plan>, PlanError>
where
    R: Refinement + Sync,
    R::Plan: Send + Sync,
{
    if !opts.enabled {
        return Ok(Refined {
            value: baseline,
            source: PlanSource::Static,
            reason: format!("{} disabled", R::PLANNER),
        });
    }

    match attempt(refinement, &baseline, provider, opts).await {
        Ok((value, reason)) => {
            tracing::info!("{} applied LLM refinement", R::PLANNER);
            Ok(Refined {
                value,
                source: PlanSource::Llm,
                reason,
            })
        }
        Err(err) if opts.strict => Err(PlanError::Strict {
            planner: R::PLANNER,
            source: Box::new(err),
        }),
        Err(err) => {
            tracing::warn!("{} falling back to baseline: {}", R::PLANNER, err);
            Ok(Refined {
                value: baseline,
                source: PlanSource::Static,
                reason: err.to_string(),
            })
        }
    }
}

async fn attempt<R>(
    refinement: &R,
    baseline: &R::Plan,
    provider: Option<&dyn LLMProvider>,
    opts: &PlannerOptions,
) -> Result<(R::Plan, String), PlanError>
where
    R: Refinement + Sync,
    R::Plan: Send + Sync,
{
    let provider = provider.ok_or(PlanError::NoProvider)?;
    let prompt = refinement.prompt(baseline)?;
    let request = GenerateRequest::new(prompt, opts.model.clone(), opts.timeout_seconds);

    tracing::debug!("{} asking provider {}", R::PLANNER, provider.name());
    let response = if opts.timeout_seconds > 0 {
        tokio::time::timeout(Duration::from_secs(opts.timeout_seconds), provider.generate(&request))
            .await
            .map_err(|_| PlanError::Timeout(opts.timeout_seconds))??
    } else {
        provider.generate(&request).await?
    };

    let candidate: R::Candidate = parse_candidate(&response.text)?;
    let reason = match candidate.reason().trim() {
        "" => "LLM advice applied".to_string(),
        r => r.to_string(),
    };
    let merged = refinement.merge(baseline, candidate)?;
    Ok((merged, reason))
}

pub fn parse_candidate<T: DeserializeOwned>(text: &str) -> Result<T, PlanError> {
    let payload = extract_first_json_object(text).ok_or(PlanError::NoJson)?;
    serde_json::from_str(payload).map_err(|e| PlanError::Decode(e.to_string()))
}

/// Returns the first balanced `{...}` in `text`, ignoring braces inside
/// double-quoted strings. A `}` seen before any `{` is skipped.
pub fn extract_first_json_object(text: &str) -> Option<&str> {
    let mut start = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, byte) in text.bytes().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    return start.map(|s| &text[s..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// JSON payload embedded in prompts.
pub(crate) fn to_prompt_json<T: Serialize>(value: &T) -> Result<String, PlanError> {
    serde_json::to_string(value).map_err(|e| PlanError::invalid("prompt", e.to_string()))
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use las_providers::{GenerateRequest, GenerateResponse, LLMProvider, ProviderError};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Provider returning a fixed reply, optionally after a delay.
    pub struct ScriptedProvider {
        reply: Mutex<Option<Result<String, ProviderError>>>,
        delay: Duration,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        pub fn reply(text: &str) -> Self {
            Self {
                reply: Mutex::new(Some(Ok(text.to_string()))),
                delay: Duration::ZERO,
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(err: ProviderError) -> Self {
            Self {
                reply: Mutex::new(Some(Err(err))),
                delay: Duration::ZERO,
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn slow(text: &str, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::reply(text)
            }
        }

        pub fn last_prompt(&self) -> String {
            self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, ProviderError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let reply = self
                .reply
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(ProviderError::Http("no scripted reply left".to_string())));
            reply.map(|text| GenerateResponse { text })
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }
}
