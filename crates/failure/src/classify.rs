use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static STATUS_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"status\s+(\d{3})").expect("static regex"));
static EXIT_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"exit status\s+(\d+)").expect("static regex"));

const TIMEOUT_TERMS: &[&str] = &["deadline exceeded", "timeout", "timed out"];
const NETWORK_TERMS: &[&str] = &[
    "connection refused",
    "no such host",
    "temporary failure in name resolution",
    "tls handshake timeout",
    "network is unreachable",
];
const INVALID_OUTPUT_TERMS: &[&str] = &[
    "did not include json",
    "invalid character",
    "cannot unmarshal",
    "unsupported key",
    "invalid plan",
];
const NOT_FOUND_TERMS: &[&str] = &["not found", "no such file"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Auth,
    RateLimit,
    #[serde(rename = "provider_unavailable")]
    Provider,
    Timeout,
    Network,
    CommandExit,
    InvalidOutput,
    NotFound,
    Unknown,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Auth => "auth",
            Category::RateLimit => "rate_limit",
            Category::Provider => "provider_unavailable",
            Category::Timeout => "timeout",
            Category::Network => "network",
            Category::CommandExit => "command_exit",
            Category::InvalidOutput => "invalid_output",
            Category::NotFound => "not_found",
            Category::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: Category,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl Classification {
    fn new(category: Category, retryable: bool, reason: &str) -> Self {
        Self {
            category,
            retryable,
            status_code: None,
            exit_code: None,
            reason: reason.to_string(),
        }
    }
}

fn contains_any(text: &str, terms: &[&str]) -> bool {
    terms.iter().any(|t| text.contains(t))
}

/// Buckets an error message. Checks run in a fixed order and the first hit
/// wins: HTTP status, process exit code, then keyword groups.
pub fn classify(message: &str) -> Classification {
    let message = message.trim().to_lowercase();
    if message.is_empty() {
        return Classification::new(Category::Unknown, false, "empty error");
    }

    let status = STATUS_PATTERN
        .captures(&message)
        .and_then(|caps| caps[1].parse::<u16>().ok());
    if let Some(status) = status {
        let hit = match status {
            401 | 403 => Some((Category::Auth, false, "provider authentication/authorization failed")),
            429 => Some((Category::RateLimit, true, "provider rate limit")),
            s if s >= 500 => Some((Category::Provider, true, "provider service unavailable")),
            _ => None,
        };
        if let Some((category, retryable, reason)) = hit {
            return Classification {
                status_code: Some(status),
                ..Classification::new(category, retryable, reason)
            };
        }
    }

    let exit_code = EXIT_PATTERN
        .captures(&message)
        .and_then(|caps| caps[1].parse::<i32>().ok())
        .filter(|code| *code > 0);
    if let Some(code) = exit_code {
        return Classification {
            exit_code: Some(code),
            ..Classification::new(Category::CommandExit, false, "command returned non-zero exit code")
        };
    }

    if contains_any(&message, TIMEOUT_TERMS) {
        Classification::new(Category::Timeout, true, "request timeout")
    } else if contains_any(&message, NETWORK_TERMS) {
        Classification::new(Category::Network, true, "network failure")
    } else if contains_any(&message, INVALID_OUTPUT_TERMS) {
        Classification::new(Category::InvalidOutput, false, "invalid planner output")
    } else if contains_any(&message, NOT_FOUND_TERMS) {
        Classification::new(Category::NotFound, false, "resource not found")
    } else {
        Classification::new(Category::Unknown, false, "unclassified")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advice {
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_delays: Vec<u64>,
    pub suggestion: String,
}

/// Operator guidance for a classification. Any category with retry delays is
/// retryable regardless of the input flag.
pub fn advise(classification: &Classification) -> Advice {
    let (delays, suggestion): (&[u64], &str) = match classification.category {
        Category::Auth => (&[], "Check provider API key, base URL, and model permission."),
        Category::RateLimit => (
            &[2, 5, 10],
            "Rate limited by provider. Retry later or reduce request frequency.",
        ),
        Category::Provider => (
            &[2, 5, 10],
            "Provider unavailable. Retry with backoff or switch provider.",
        ),
        Category::Timeout => (
            &[1, 3, 5],
            "Request timed out. Retry and consider increasing timeout.",
        ),
        Category::Network => (
            &[1, 3, 5],
            "Network error. Check connectivity and DNS, then retry.",
        ),
        Category::CommandExit => (
            &[],
            "Underlying command failed. Check module/runtime logs and dependencies.",
        ),
        Category::InvalidOutput => (
            &[],
            "Planner output invalid. Enable planner debug and verify prompt/schema.",
        ),
        Category::NotFound => (
            &[],
            "Target not found. Verify module/model id and local install state.",
        ),
        Category::Unknown => (&[], "Unknown failure. Enable debug flags and inspect logs."),
    };

    Advice {
        retryable: classification.retryable || !delays.is_empty(),
        retry_delays: delays.to_vec(),
        suggestion: suggestion.to_string(),
    }
}
