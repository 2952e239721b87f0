use anyhow::{Context, Result};
use las_core::PlannerOptions;
use las_providers::{LLMProvider, OpenAICompatibleProvider};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CONFIG_ENV: &str = "LAS_CONFIG";
pub const API_KEY_ENV: &str = "LAS_LLM_API_KEY";

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// `~/.localaistack`, where every default path lives.
pub fn state_dir() -> PathBuf {
    home().join(".localaistack")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAI,
    SiliconFlow,
    Local { base_url: String },
}

impl ProviderKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::SiliconFlow => "siliconflow",
            ProviderKind::Local { .. } => "local",
        }
    }

    pub fn base_url(&self) -> &str {
        match self {
            ProviderKind::OpenAI => "https://api.openai.com/v1",
            ProviderKind::SiliconFlow => "https://api.siliconflow.cn/v1",
            ProviderKind::Local { base_url } => base_url,
        }
    }

    pub fn requires_api_key(&self) -> bool {
        !matches!(self, ProviderKind::Local { .. })
    }
}

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub provider: ProviderKind,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_modules_dir() -> PathBuf {
    PathBuf::from("modules")
}

fn default_models_dir() -> PathBuf {
    state_dir().join("models")
}

fn default_failure_dir() -> PathBuf {
    state_dir().join("failures")
}

fn default_config_plan_dir() -> PathBuf {
    state_dir().join("config-plans")
}

fn default_base_info_path() -> PathBuf {
    state_dir().join("base_info.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmSettings>,
    #[serde(default = "default_modules_dir")]
    pub modules_dir: PathBuf,
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    #[serde(default = "default_failure_dir")]
    pub failure_dir: PathBuf,
    #[serde(default = "default_config_plan_dir")]
    pub config_plan_dir: PathBuf,
    #[serde(default = "default_base_info_path")]
    pub base_info_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm: None,
            modules_dir: default_modules_dir(),
            models_dir: default_models_dir(),
            failure_dir: default_failure_dir(),
            config_plan_dir: default_config_plan_dir(),
            base_info_path: default_base_info_path(),
        }
    }
}

impl Settings {
    pub fn path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir().join("config.yaml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path())
    }

    /// A missing file yields defaults; a malformed one is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn provider_name(&self) -> &str {
        self.llm.as_ref().map(|l| l.provider.name()).unwrap_or("")
    }

    pub fn llm_model(&self) -> &str {
        self.llm.as_ref().map(|l| l.model.trim()).unwrap_or("")
    }

    /// The configured provider. `LAS_LLM_API_KEY` wins over the file. A hosted
    /// provider without a key is treated as unconfigured.
    pub fn provider(&self) -> Option<Arc<dyn LLMProvider>> {
        let llm = self.llm.as_ref()?;
        let api_key = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| llm.api_key.clone());
        if llm.provider.requires_api_key() && api_key.trim().is_empty() {
            tracing::warn!("{} provider configured without an API key; planners stay static", llm.provider.name());
            return None;
        }
        Some(Arc::new(OpenAICompatibleProvider::new(
            llm.provider.name(),
            llm.provider.base_url(),
            Some(api_key),
        )))
    }

    pub fn planner_options(&self, enabled: bool, debug: bool, strict: bool) -> PlannerOptions {
        PlannerOptions {
            enabled,
            debug,
            strict,
            timeout_seconds: self.llm.as_ref().map(|l| l.timeout_seconds).unwrap_or_else(default_timeout),
            model: self.llm_model().to_string(),
        }
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on" | "y")
}

/// Debug and strict switches from the environment, read once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Toggles {
    pub install_debug: bool,
    pub install_strict: bool,
    pub config_debug: bool,
    pub config_strict: bool,
    pub smart_run_debug: bool,
    pub smart_run_strict: bool,
    pub failure_debug: bool,
}

impl Toggles {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let on = |key: &str| lookup(key).map(|v| is_truthy(&v)).unwrap_or(false);
        Self {
            install_debug: on("LAS_INSTALL_PLANNER_DEBUG"),
            install_strict: on("LAS_INSTALL_PLANNER_STRICT"),
            config_debug: on("LAS_CONFIG_PLANNER_DEBUG"),
            config_strict: on("LAS_CONFIG_PLANNER_STRICT"),
            smart_run_debug: on("LAS_SMART_RUN_DEBUG"),
            smart_run_strict: on("LAS_SMART_RUN_STRICT"),
            failure_debug: on("LAS_FAILURE_DEBUG"),
        }
    }
}
