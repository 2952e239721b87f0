//! Local model directories and the command lines that serve them.

use crate::baseline::{LlamaRunParams, VllmRunParams};
use crate::error::ModelError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Quantisation tags tried in order when no GGUF file was named.
const GGUF_PREFERENCE: &[&str] = &[
    "q4_k_m", "q4_k_s", "q5_k_m", "q5_k_s", "q5", "q6_k", "q6", "q8_0", "q8",
];

const AUTO_MAP_FILES: &[&str] = &[
    "config.json",
    "tokenizer_config.json",
    "preprocessor_config.json",
    "processor_config.json",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    LlamaCpp,
    Vllm,
}

impl RuntimeKind {
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeKind::LlamaCpp => "llama.cpp",
            RuntimeKind::Vllm => "vllm",
        }
    }

    pub fn binary(&self) -> &'static str {
        match self {
            RuntimeKind::LlamaCpp => "llama-server",
            RuntimeKind::Vllm => "vllm",
        }
    }

    /// Environment variable that overrides the PATH lookup.
    pub fn binary_env(&self) -> &'static str {
        match self {
            RuntimeKind::LlamaCpp => "LAS_LLAMA_SERVER_BIN",
            RuntimeKind::Vllm => "LAS_VLLM_BIN",
        }
    }
}

/// Weight files found under a model directory.
#[derive(Debug, Clone, Default)]
pub struct ModelFiles {
    pub dir: PathBuf,
    pub safetensors: Vec<PathBuf>,
    pub gguf: Vec<PathBuf>,
}

impl ModelFiles {
    pub fn scan(dir: &Path) -> Result<Self, ModelError> {
        if !dir.is_dir() {
            return Err(ModelError::NotFound(dir.to_path_buf()));
        }
        let mut files = ModelFiles {
            dir: dir.to_path_buf(),
            ..Default::default()
        };
        walk(dir, &mut files)?;
        files.safetensors.sort();
        files.gguf.sort();
        Ok(files)
    }

    /// safetensors weights win over GGUF.
    pub fn runtime(&self, model_id: &str) -> Result<RuntimeKind, ModelError> {
        if !self.safetensors.is_empty() {
            Ok(RuntimeKind::Vllm)
        } else if !self.gguf.is_empty() {
            Ok(RuntimeKind::LlamaCpp)
        } else {
            Err(ModelError::NoModelFiles(model_id.to_string()))
        }
    }
}

fn walk(dir: &Path, files: &mut ModelFiles) -> Result<(), ModelError> {
    let io_err = |source| ModelError::Io {
        path: dir.to_path_buf(),
        source,
    };
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let hidden = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(false);
        if hidden {
            continue;
        }
        if path.is_dir() {
            walk(&path, files)?;
        } else if has_extension(&path, "safetensors") {
            files.safetensors.push(path);
        } else if has_extension(&path, "gguf") {
            files.gguf.push(path);
        }
    }
    Ok(())
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

/// Resolves the GGUF file to serve. An explicit selection (relative to the
/// model directory unless absolute) must exist and be a `.gguf`. Returns the
/// path and whether it was picked automatically.
pub fn resolve_gguf(files: &ModelFiles, selected: Option<&str>) -> Result<(PathBuf, bool), ModelError> {
    if let Some(selected) = selected.map(str::trim).filter(|s| !s.is_empty()) {
        let path = Path::new(selected);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            files.dir.join(path)
        };
        if !path.exists() {
            return Err(ModelError::GgufNotFound(path));
        }
        if !has_extension(&path, "gguf") {
            return Err(ModelError::NotGguf(path));
        }
        return Ok((path, false));
    }
    Ok((select_preferred_gguf(&files.gguf)?, true))
}

pub fn select_preferred_gguf(files: &[PathBuf]) -> Result<PathBuf, ModelError> {
    for tag in GGUF_PREFERENCE {
        let matching: Vec<&PathBuf> = files
            .iter()
            .filter(|f| {
                f.file_name()
                    .map(|n| n.to_string_lossy().to_lowercase().contains(tag))
                    .unwrap_or(false)
            })
            .collect();
        if !matching.is_empty() {
            return smallest(matching);
        }
    }
    smallest(files.iter().collect())
}

fn smallest(files: Vec<&PathBuf>) -> Result<PathBuf, ModelError> {
    files
        .into_iter()
        .filter_map(|f| std::fs::metadata(f).ok().map(|m| (m.len(), f)))
        .min_by_key(|(len, _)| *len)
        .map(|(_, f)| f.clone())
        .ok_or(ModelError::NoGguf)
}

#[derive(Debug, Default, Deserialize)]
struct ModelMetadata {
    #[serde(default)]
    id: String,
}

/// What vLLM is told to serve: the directory itself when it carries a model
/// config, otherwise the repo id recorded at download time.
pub fn vllm_model_ref(dir: &Path) -> Result<String, ModelError> {
    if dir.join("config.json").exists() || dir.join("params.json").exists() {
        return Ok(dir.display().to_string());
    }
    let path = dir.join("metadata.json");
    let raw = std::fs::read(&path)
        .map_err(|_| ModelError::Metadata(format!("missing metadata.json at {}", path.display())))?;
    let meta: ModelMetadata = serde_json::from_slice(&raw)
        .map_err(|e| ModelError::Metadata(format!("failed to parse metadata.json: {}", e)))?;
    let id = meta.id.trim();
    if id.is_empty() {
        return Err(ModelError::MissingModelId);
    }
    Ok(id.to_string())
}

/// Custom-code markers: a non-empty `auto_map` in a model config, or any
/// python source beside the weights.
pub fn needs_trust_remote_code(dir: &Path) -> bool {
    if AUTO_MAP_FILES.iter().any(|name| has_auto_map(&dir.join(name))) {
        return true;
    }
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .any(|e| has_extension(&e.path(), "py") && e.path().is_file())
        })
        .unwrap_or(false)
}

fn has_auto_map(path: &Path) -> bool {
    let Ok(raw) = std::fs::read(path) else {
        return false;
    };
    let Ok(serde_json::Value::Object(payload)) = serde_json::from_slice::<serde_json::Value>(&raw) else {
        return false;
    };
    match payload.get("auto_map") {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::Object(map)) => !map.is_empty(),
        Some(serde_json::Value::Array(items)) => !items.is_empty(),
        Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

/// Formats like C's `%.4g`: four significant digits, trailing zeros dropped.
pub fn format_sig4(value: f64) -> String {
    if value == 0.0 || !value.is_finite() {
        return if value.is_finite() { "0".to_string() } else { value.to_string() };
    }
    let exp = value.abs().log10().floor() as i32;
    if !(-4..4).contains(&exp) {
        let formatted = format!("{:.3e}", value);
        let (mantissa, exponent) = formatted.split_once('e').unwrap_or((formatted.as_str(), "0"));
        let exponent: i32 = exponent.parse().unwrap_or(0);
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!("{}e{}{:02}", trim_zeros(mantissa), sign, exponent.abs());
    }
    let decimals = (3 - exp).max(0) as usize;
    trim_zeros(&format!("{:.*}", decimals, value)).to_string()
}

fn trim_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// `llama-server` arguments. Batch sizes and tensor split are omitted when
/// unset.
pub fn llama_server_args(model_path: &Path, params: &LlamaRunParams, host: &str, port: u16) -> Vec<String> {
    let s = &params.sampling;
    let mut args: Vec<String> = vec![
        "--model".into(),
        model_path.display().to_string(),
        "--threads".into(),
        params.threads.to_string(),
        "--ctx-size".into(),
        params.ctx_size.to_string(),
        "--n-gpu-layers".into(),
        params.n_gpu_layers.to_string(),
        "--host".into(),
        host.to_string(),
        "--port".into(),
        port.to_string(),
        "--temp".into(),
        format_sig4(s.temperature),
        "--top-p".into(),
        format_sig4(s.top_p),
        "--top-k".into(),
        s.top_k.to_string(),
        "--min-p".into(),
        format_sig4(s.min_p),
        "--presence-penalty".into(),
        format_sig4(s.presence_penalty),
        "--repeat-penalty".into(),
        format_sig4(s.repeat_penalty),
    ];
    if !params.tensor_split.is_empty() {
        args.extend(["--tensor-split".into(), params.tensor_split.clone()]);
    }
    if params.batch_size > 0 {
        args.extend(["--batch-size".into(), params.batch_size.to_string()]);
    }
    if params.ubatch_size > 0 {
        args.extend(["--ubatch-size".into(), params.ubatch_size.to_string()]);
    }
    if !params.chat_template_kwargs.trim().is_empty() {
        args.extend(["--chat-template-kwargs".into(), params.chat_template_kwargs.clone()]);
    }
    args
}

/// `vllm serve` arguments.
pub fn vllm_serve_args(model_ref: &str, params: &VllmRunParams, host: &str, port: u16) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "serve".into(),
        model_ref.to_string(),
        "--host".into(),
        host.to_string(),
        "--port".into(),
        port.to_string(),
    ];
    if !params.dtype.is_empty() {
        args.extend(["--dtype".into(), params.dtype.clone()]);
    }
    if params.max_model_len > 0 {
        args.extend(["--max-model-len".into(), params.max_model_len.to_string()]);
    }
    if params.gpu_memory_utilization > 0.0 {
        args.extend([
            "--gpu-memory-utilization".into(),
            format!("{:.2}", params.gpu_memory_utilization),
        ]);
    }
    if params.tensor_parallel_size > 1 {
        args.extend(["--tensor-parallel-size".into(), params.tensor_parallel_size.to_string()]);
    }
    if params.enforce_eager {
        args.push("--enforce-eager".into());
    }
    args.extend(["--optimization-level".into(), params.optimization_level.to_string()]);
    if params.disable_custom_all_reduce {
        args.push("--disable-custom-all-reduce".into());
    }
    if params.max_num_seqs > 0 {
        args.extend(["--max-num-seqs".into(), params.max_num_seqs.to_string()]);
    }
    if params.trust_remote_code {
        args.push("--trust-remote-code".into());
    }
    args
}

/// The lines printed instead of launching: every token double-quoted, then
/// the extra environment if any.
pub fn dry_run_lines(binary: &Path, args: &[String], env: &[String]) -> Vec<String> {
    let command = std::iter::once(binary.display().to_string())
        .chain(args.iter().cloned())
        .map(|part| format!("{:?}", part))
        .collect::<Vec<_>>()
        .join(" ");
    let mut lines = vec![format!("Dry run command: {}", command)];
    if !env.is_empty() {
        lines.push(format!("Dry run env: {}", env.join(" ")));
    }
    lines
}
