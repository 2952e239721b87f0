use crate::classify::{advise, classify, Advice, Classification};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    InstallPlanner,
    ConfigPlanner,
    SmartRun,
    ModuleInstall,
    ModuleUpdate,
    ModuleUninstall,
    ModelRun,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::InstallPlanner => "install_planner",
            Phase::ConfigPlanner => "config_planner",
            Phase::SmartRun => "smart_run",
            Phase::ModuleInstall => "module_install",
            Phase::ModuleUpdate => "module_update",
            Phase::ModuleUninstall => "module_uninstall",
            Phase::ModelRun => "model_run",
        }
    }

    /// Narrows `fallback` to a planner phase when the message names that
    /// planner, e.g. a strict-mode failure surfaced from an install.
    pub fn infer(fallback: Phase, message: &str) -> Phase {
        let message = message.to_lowercase();
        if message.contains("install planner") {
            Phase::InstallPlanner
        } else if message.contains("config planner") {
            Phase::ConfigPlanner
        } else if message.contains("smart-run") {
            Phase::SmartRun
        } else {
            fallback
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.trim().to_lowercase()))
            .map_err(|_| format!("unknown failure phase {:?}", s))
    }
}

/// One recorded failure, a single JSON line in the day file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: String,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub module: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub error: String,
    #[serde(default, deserialize_with = "lenient_classification")]
    pub classification: Option<Classification>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, Value>,
}

/// Lines written by older tools may carry an empty or unknown category; treat
/// those as unclassified so they are classified again on read.
fn lenient_classification<'de, D>(deserializer: D) -> Result<Option<Classification>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| serde_json::from_value(value).ok()))
}

impl FailureEvent {
    pub fn new(phase: Phase, error: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            timestamp: String::new(),
            phase,
            module: String::new(),
            model: String::new(),
            provider: String::new(),
            message: String::new(),
            error: error.into(),
            classification: None,
            context: BTreeMap::new(),
        }
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    /// Fills in the classification from the error text if missing.
    pub fn ensure_classified(&mut self) -> &Classification {
        let error = &self.error;
        self.classification.get_or_insert_with(|| classify(error))
    }

    pub fn advice(&mut self) -> Advice {
        advise(self.ensure_classified())
    }
}
