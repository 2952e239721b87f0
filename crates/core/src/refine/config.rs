//! Persisted per-module configuration plans.

use super::{to_prompt_json, Candidate, PlanSource, Refinement};
use crate::baseline::gpu_layers_for_vram;
use crate::error::{PersistError, PlanError};
use crate::hardware::HardwareSummary;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const CONFIG_PLAN_SCHEMA: &str = "las.configplan/v0.1.0";
pub const CONFIG_PLANNER_NAME: &str = "module-config-planner";
const STATIC_VERSION: &str = "p3-a";
const LLM_VERSION: &str = "p3-b";

const GIB_KB: u64 = 1024 * 1024;

const LLAMA_SCOPE: &str = "model.run.llama.cpp";
const VLLM_SCOPE: &str = "model.run.vllm";
const OLLAMA_SCOPE: &str = "module.runtime.ollama";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerMeta {
    pub name: String,
    pub version: String,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanContext {
    pub cpu_cores: u32,
    pub memory_kb: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gpu_name: String,
    pub gpu_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub scope: String,
    pub key: String,
    pub value: Value,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigPlan {
    pub schema_version: String,
    pub planner: PlannerMeta,
    pub module: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    pub source: PlanSource,
    pub reason: String,
    pub generated_at: String,
    pub context: PlanContext,
    pub changes: Vec<Change>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ConfigPlan {
    pub fn change(&self, key: &str) -> Option<&Change> {
        self.changes.iter().find(|c| c.key == key)
    }

    fn change_mut(&mut self, key: &str) -> Option<&mut Change> {
        self.changes.iter_mut().find(|c| c.key == key)
    }
}

/// Keys an LLM (or operator) may touch for `module`.
pub fn allowed_keys(module: &str) -> &'static [&'static str] {
    match module.trim().to_lowercase().as_str() {
        "llama.cpp" => &["threads", "ctx_size", "n_gpu_layers"],
        "vllm" => &["max_model_len", "gpu_memory_utilization"],
        "ollama" => &["num_parallel", "keep_alive"],
        _ => &[],
    }
}

fn change(scope: &str, key: &str, value: Value, reason: &str) -> Change {
    Change {
        scope: scope.to_string(),
        key: key.to_string(),
        value,
        reason: reason.to_string(),
    }
}

/// Deterministic plan for `module` on this host.
pub fn build_static_plan(module: &str, model: &str, hw: &HardwareSummary) -> Result<ConfigPlan, PlanError> {
    let name = module.trim().to_lowercase();
    if name.is_empty() {
        return Err(PlanError::invalid("module", "module name is required"));
    }

    let vram = hw.vram_gb();
    let mut warnings = Vec::new();
    let changes = match name.as_str() {
        "llama.cpp" => {
            let threads = if hw.cpu_cores > 0 { hw.cpu_cores } else { 4 };
            let ctx_size = match hw.memory_kb {
                kb if kb >= 64 * GIB_KB => 8192,
                kb if kb >= 32 * GIB_KB => 4096,
                _ => 2048,
            };
            if hw.cpu_cores == 0 {
                warnings.push("CPU core count unknown; assuming 4 threads".to_string());
            }
            vec![
                change(LLAMA_SCOPE, "threads", json!(threads), "match available CPU cores"),
                change(LLAMA_SCOPE, "ctx_size", json!(ctx_size), "fit system memory tier"),
                change(
                    LLAMA_SCOPE,
                    "n_gpu_layers",
                    json!(gpu_layers_for_vram(vram)),
                    "fit detected GPU memory",
                ),
            ]
        }
        "vllm" => {
            let max_model_len = match vram {
                v if v >= 80 => 32768,
                v if v >= 48 => 24576,
                v if v >= 24 => 16384,
                v if v >= 16 => 8192,
                v if v >= 12 => 6144,
                v if v > 0 => 4096,
                _ => 2048,
            };
            let gpu_memory_utilization: f64 = match vram {
                v if v >= 80 => 0.92,
                v if v >= 48 => 0.90,
                v if v >= 24 => 0.88,
                v if v >= 16 => 0.86,
                v if v > 0 => 0.82,
                _ => 0.0,
            };
            if vram == 0 {
                warnings.push("no GPU memory detected; vLLM needs a supported accelerator".to_string());
            }
            vec![
                change(VLLM_SCOPE, "max_model_len", json!(max_model_len), "fit detected GPU/host memory"),
                change(
                    VLLM_SCOPE,
                    "gpu_memory_utilization",
                    json!(gpu_memory_utilization),
                    "keep memory pressure stable",
                ),
            ]
        }
        "ollama" => {
            let parallel = if hw.cpu_cores >= 16 { 2 } else { 1 };
            vec![
                change(OLLAMA_SCOPE, "num_parallel", json!(parallel), "avoid oversubscription on host CPU"),
                change(OLLAMA_SCOPE, "keep_alive", json!("10m"), "reduce model reload overhead"),
            ]
        }
        _ => return Err(PlanError::UnknownModule(name)),
    };

    Ok(ConfigPlan {
        schema_version: CONFIG_PLAN_SCHEMA.to_string(),
        planner: PlannerMeta {
            name: CONFIG_PLANNER_NAME.to_string(),
            version: STATIC_VERSION.to_string(),
            mode: "static".to_string(),
        },
        module: name,
        model: model.trim().to_string(),
        source: PlanSource::Static,
        reason: "hardware-aware static planner".to_string(),
        generated_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        context: PlanContext {
            cpu_cores: hw.cpu_cores,
            memory_kb: hw.memory_kb,
            gpu_name: hw.gpu_name.trim().to_string(),
            gpu_count: hw.gpu_count,
        },
        changes,
        warnings,
    })
}

enum Bounds {
    Int(i64, i64),
    Float(f64, f64),
    Text,
}

fn bounds_for(key: &str) -> Bounds {
    match key {
        "threads" => Bounds::Int(1, 256),
        "ctx_size" => Bounds::Int(512, 262_144),
        "n_gpu_layers" => Bounds::Int(0, 999),
        "max_model_len" => Bounds::Int(256, 131_072),
        "num_parallel" => Bounds::Int(1, 16),
        "gpu_memory_utilization" => Bounds::Float(0.30, 0.98),
        _ => Bounds::Text,
    }
}

fn as_int(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

fn as_float(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Coerces `raw` to the JSON type of `baseline` and clamps it to the key's
/// safe range.
pub fn normalize_value(key: &str, baseline: &Value, raw: &Value) -> Result<Value, PlanError> {
    let invalid = |what: &str| PlanError::invalid(key, format!("expected {}, got {}", what, raw));
    match baseline {
        Value::Number(n) if n.is_f64() => {
            let mut value = as_float(raw)
                .filter(|f| f.is_finite())
                .ok_or_else(|| invalid("a number"))?;
            if let Bounds::Float(lo, hi) = bounds_for(key) {
                value = value.clamp(lo, hi);
            }
            Ok(json!(value))
        }
        Value::Number(_) => {
            let mut value = as_int(raw).ok_or_else(|| invalid("an integer"))?;
            if let Bounds::Int(lo, hi) = bounds_for(key) {
                value = value.clamp(lo, hi);
            }
            Ok(json!(value))
        }
        Value::String(_) => {
            let text = match raw {
                Value::String(s) => s.trim().to_string(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            if text.is_empty() {
                return Err(PlanError::invalid(key, "value must not be empty"));
            }
            Ok(Value::String(text))
        }
        _ => Ok(raw.clone()),
    }
}

/// Operator `--set key=value` overrides. Returns the pinned keys so
/// refinement leaves them alone.
pub fn apply_overrides(plan: &mut ConfigPlan, overrides: &[(String, String)]) -> Result<BTreeSet<String>, PlanError> {
    let allowed = allowed_keys(&plan.module);
    let mut pinned = BTreeSet::new();
    for (key, raw) in overrides {
        let key = key.trim();
        if !allowed.contains(&key) {
            return Err(PlanError::UnsupportedKey(key.to_string()));
        }
        let slot = plan
            .change_mut(key)
            .ok_or_else(|| PlanError::invalid(key, "not found in baseline plan"))?;
        slot.value = normalize_value(key, &slot.value, &Value::String(raw.clone()))?;
        slot.reason = "set by operator".to_string();
        pinned.insert(key.to_string());
    }
    Ok(pinned)
}

/// Splits `key=value`.
pub fn parse_override(raw: &str) -> Result<(String, String), PlanError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.trim().to_string())),
        _ => Err(PlanError::invalid("set", format!("expected key=value, got {:?}", raw))),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CandidateChange {
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigCandidate {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub changes: Vec<CandidateChange>,
}

impl Candidate for ConfigCandidate {
    fn reason(&self) -> &str {
        &self.reason
    }
}

#[derive(Serialize)]
struct PromptInput<'a> {
    module: &'a str,
    model: &'a str,
    hardware: &'a HardwareSummary,
    baseline: &'a ConfigPlan,
    allowed: &'static [&'static str],
}

pub struct ConfigRefinement<'a> {
    pub hardware: &'a HardwareSummary,
    pub pinned: BTreeSet<String>,
}

impl<'a> ConfigRefinement<'a> {
    pub fn new(hardware: &'a HardwareSummary) -> Self {
        Self {
            hardware,
            pinned: BTreeSet::new(),
        }
    }

    pub fn with_pinned(mut self, pinned: BTreeSet<String>) -> Self {
        self.pinned = pinned;
        self
    }
}

impl Refinement for ConfigRefinement<'_> {
    type Plan = ConfigPlan;
    type Candidate = ConfigCandidate;
    const PLANNER: &'static str = "config planner";

    fn prompt(&self, baseline: &ConfigPlan) -> Result<String, PlanError> {
        let input = to_prompt_json(&PromptInput {
            module: &baseline.module,
            model: &baseline.model,
            hardware: self.hardware,
            baseline,
            allowed: allowed_keys(&baseline.module),
        })?;
        Ok(format!(
            r#"You are a configuration planner for LocalAIStack.
Return valid JSON only.
Schema:
{{"reason":"<short reason>","changes":[{{"scope":"<scope>","key":"<key>","value":<value>,"reason":"<short reason>"}}]}}
Rules:
- only return keys listed in allowed.
- keep values conservative and stable.
- avoid adding unknown scopes.
Input:
{}"#,
            input
        ))
    }

    fn merge(&self, baseline: &ConfigPlan, candidate: ConfigCandidate) -> Result<ConfigPlan, PlanError> {
        if candidate.changes.is_empty() {
            return Ok(baseline.clone());
        }
        let allowed = allowed_keys(&baseline.module);
        let mut merged = baseline.clone();

        for proposed in candidate.changes {
            let key = proposed.key.trim();
            if key.is_empty() || !allowed.contains(&key) {
                return Err(PlanError::UnsupportedKey(key.to_string()));
            }
            let slot = merged
                .change_mut(key)
                .ok_or_else(|| PlanError::invalid(key, "llm returned key not found in baseline plan"))?;
            let value = normalize_value(key, &slot.value, &proposed.value)?;
            if self.pinned.contains(key) {
                tracing::debug!("config planner keeps operator value for {}", key);
                continue;
            }
            slot.value = value;
            if !proposed.reason.trim().is_empty() {
                slot.reason = proposed.reason.trim().to_string();
            }
        }

        merged.source = PlanSource::Llm;
        merged.planner.mode = "llm+static".to_string();
        merged.planner.version = LLM_VERSION.to_string();
        if !candidate.reason.trim().is_empty() {
            merged.reason = candidate.reason.trim().to_string();
        }
        Ok(merged)
    }
}

/// `<dir>/<module>.json`, with `/` in the module name replaced.
pub fn plan_path(dir: &Path, module: &str) -> PathBuf {
    dir.join(format!("{}.json", module.replace('/', "_")))
}

/// Writes the plan pretty-printed, owner-readable only.
pub fn save_plan(dir: &Path, plan: &ConfigPlan) -> Result<PathBuf, PersistError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| PersistError::Io { path, source }
    };

    std::fs::create_dir_all(dir).map_err(io_err(dir))?;
    let target = plan_path(dir, &plan.module);
    let payload = serde_json::to_vec_pretty(plan)?;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&target).map_err(io_err(&target))?;
    std::io::Write::write_all(&mut file, &payload).map_err(io_err(&target))?;

    tracing::info!("config plan for {} written to {}", plan.module, target.display());
    Ok(target)
}

pub fn load_plan(path: &Path) -> Result<ConfigPlan, PersistError> {
    let raw = std::fs::read(path).map_err(|source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&raw)?)
}
