use las_providers::ProviderError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while building or refining a plan.
///
/// Display strings are relied upon by the failure classifier, so phrases like
/// `did not include JSON`, `cannot unmarshal`, `unsupported key` and
/// `timed out` must survive any rewording.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("provider call failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("provider request timed out after {0}s")]
    Timeout(u64),
    #[error("planner response did not include JSON")]
    NoJson,
    #[error("cannot unmarshal planner response: {0}")]
    Decode(String),
    #[error("invalid plan: unsupported mode {0:?}")]
    UnsupportedMode(String),
    #[error("invalid plan: LLM returned unknown step IDs: {}", .0.join(", "))]
    UnknownSteps(Vec<String>),
    #[error("llm returned unsupported key {0:?}")]
    UnsupportedKey(String),
    #[error("invalid plan: {field}: {message}")]
    InvalidValue { field: String, message: String },
    #[error("no static config planner available for module {0:?}")]
    UnknownModule(String),
    #[error("no LLM provider configured")]
    NoProvider,
    #[error("{planner} strict mode: {source}")]
    Strict {
        planner: &'static str,
        source: Box<PlanError>,
    },
}

impl PlanError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        PlanError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors loading an `INSTALL.yaml` document.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("install plan not found for module {0:?}")]
    NotFound(String),
    #[error("failed to read install plan {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse install plan {}: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("install plan for module {module:?} has no steps for mode {mode:?}")]
    EmptyMode { module: String, mode: String },
}

/// Errors writing a persisted config plan.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to write config plan {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode config plan: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors inspecting a local model directory.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("local model not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("no supported model files found for {0}")]
    NoModelFiles(String),
    #[error("GGUF file not found: {}", .0.display())]
    GgufNotFound(PathBuf),
    #[error("selected file is not a GGUF model: {}", .0.display())]
    NotGguf(PathBuf),
    #[error("no GGUF files available to run")]
    NoGguf,
    #[error("vLLM requires a local config.json/params.json or a known repo id: {0}")]
    Metadata(String),
    #[error("metadata.json missing model id")]
    MissingModelId,
    #[error("failed to read model directory {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
