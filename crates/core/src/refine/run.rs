//! Smart-run: LLM tuning of launch parameters for a single process start.

use super::{to_prompt_json, Candidate, Refinement};
use crate::baseline::{LlamaRunParams, VllmRunParams, ALLOWED_DTYPES};
use crate::error::PlanError;
use crate::hardware::HardwareSummary;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::Path;

/// Upper bound for documents appended to a smart-run prompt.
pub const PROMPT_DOCUMENT_MAX_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlamaAdvice {
    pub threads: Option<i64>,
    pub ctx_size: Option<i64>,
    pub n_gpu_layers: Option<i64>,
    pub tensor_split: Option<String>,
    pub batch_size: Option<i64>,
    pub ubatch_size: Option<i64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<i64>,
    pub min_p: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub repeat_penalty: Option<f64>,
    pub chat_template_kwargs: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VllmAdvice {
    pub max_model_len: Option<i64>,
    pub gpu_memory_utilization: Option<f64>,
    pub dtype: Option<String>,
    pub tensor_parallel_size: Option<i64>,
    pub enforce_eager: Option<bool>,
    pub optimization_level: Option<i64>,
    pub max_num_seqs: Option<i64>,
    pub disable_custom_all_reduce: Option<bool>,
    pub trust_remote_code: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SmartRunAdvice {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub llama: Option<LlamaAdvice>,
    #[serde(default)]
    pub vllm: Option<VllmAdvice>,
}

impl Candidate for SmartRunAdvice {
    fn reason(&self) -> &str {
        &self.reason
    }
}

fn clamp_u32(value: i64, lo: u32, hi: u32) -> u32 {
    value.clamp(i64::from(lo), i64::from(hi)) as u32
}

/// Reads a prompt attachment, trimmed and cut at `PROMPT_DOCUMENT_MAX_BYTES`.
/// Missing or empty files yield `None`.
pub fn load_prompt_document(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let content = raw.trim();
    if content.is_empty() {
        return None;
    }
    if content.len() <= PROMPT_DOCUMENT_MAX_BYTES {
        return Some(content.to_string());
    }
    let mut cut = PROMPT_DOCUMENT_MAX_BYTES;
    while !content.is_char_boundary(cut) {
        cut -= 1;
    }
    Some(format!("{}\n\n[truncated]", content[..cut].trim()))
}

fn append_base_info(prompt: &mut String, base_info: Option<&str>) {
    if let Some(info) = base_info {
        prompt.push_str(&format!("\nCollected base hardware info (json):\n```json\n{}\n```", info));
    }
}

/// Shared inputs for both runtimes.
#[derive(Debug, Clone, Default)]
pub struct RunContext<'a> {
    pub model_id: &'a str,
    pub hardware: HardwareSummary,
    /// Fields the operator set on the command line.
    pub pinned: BTreeSet<String>,
    pub base_info: Option<String>,
}

impl RunContext<'_> {
    fn keeps(&self, field: &str) -> bool {
        self.pinned.contains(field)
    }
}

pub struct LlamaRefinement<'a> {
    pub context: RunContext<'a>,
    pub model_path: &'a Path,
    /// Optional markdown tuning guide shipped with the llama.cpp module.
    pub guide: Option<String>,
}

impl Refinement for LlamaRefinement<'_> {
    type Plan = LlamaRunParams;
    type Candidate = SmartRunAdvice;
    const PLANNER: &'static str = "smart-run";

    fn prompt(&self, baseline: &LlamaRunParams) -> Result<String, PlanError> {
        let input = to_prompt_json(&json!({
            "runtime": "llama.cpp",
            "model": {
                "id": self.context.model_id,
                "path": self.model_path.display().to_string(),
            },
            "hardware": self.context.hardware,
            "baseline": {
                "threads": baseline.threads,
                "ctx_size": baseline.ctx_size,
                "n_gpu_layers": baseline.n_gpu_layers,
                "tensor_split": baseline.tensor_split,
                "batch_size": baseline.batch_size,
                "ubatch_size": baseline.ubatch_size,
                "temperature": baseline.sampling.temperature,
                "top_p": baseline.sampling.top_p,
                "top_k": baseline.sampling.top_k,
                "min_p": baseline.sampling.min_p,
                "presence_penalty": baseline.sampling.presence_penalty,
                "repeat_penalty": baseline.sampling.repeat_penalty,
                "chat_template_kwargs": baseline.chat_template_kwargs,
            },
        }))?;

        let mut prompt = format!(
            r#"You are a runtime tuning assistant for LocalAIStack.
Return JSON only.
Schema:
{{"llama":{{"threads":int,"ctx_size":int,"n_gpu_layers":int,"tensor_split":string,"batch_size":int,"ubatch_size":int,"temperature":number,"top_p":number,"top_k":int,"min_p":number,"presence_penalty":number,"repeat_penalty":number,"chat_template_kwargs":string}},"reason":string}}
Rules:
- only suggest safe values for local inference stability.
- do not add new fields.
Input:
{}"#,
            input
        );
        if let Some(guide) = &self.guide {
            prompt.push_str(&format!(
                "\nReference tuning guide for llama.cpp (markdown):\n```markdown\n{}\n```",
                guide
            ));
        }
        append_base_info(&mut prompt, self.context.base_info.as_deref());
        Ok(prompt)
    }

    fn merge(&self, baseline: &LlamaRunParams, candidate: SmartRunAdvice) -> Result<LlamaRunParams, PlanError> {
        let mut params = baseline.clone();
        let Some(advice) = candidate.llama else {
            return Ok(params);
        };
        let ctx = &self.context;

        if let Some(v) = advice.threads.filter(|_| !ctx.keeps("threads")) {
            params.threads = clamp_u32(v, 1, 256);
        }
        if let Some(v) = advice.ctx_size.filter(|_| !ctx.keeps("ctx_size")) {
            params.ctx_size = clamp_u32(v, 512, 262_144);
        }
        if let Some(v) = advice.n_gpu_layers.filter(|_| !ctx.keeps("n_gpu_layers")) {
            params.n_gpu_layers = clamp_u32(v, 0, 999);
        }
        if let Some(v) = advice.tensor_split.filter(|_| !ctx.keeps("tensor_split")) {
            params.tensor_split = v.trim().to_string();
        }
        if let Some(v) = advice.batch_size.filter(|_| !ctx.keeps("batch_size")) {
            params.batch_size = clamp_u32(v, 16, 4096);
        }
        if let Some(v) = advice.ubatch_size.filter(|_| !ctx.keeps("ubatch_size")) {
            params.ubatch_size = clamp_u32(v, 16, 2048);
        }

        let sampling = &mut params.sampling;
        if let Some(v) = advice.temperature.filter(|_| !ctx.keeps("temperature")) {
            sampling.temperature = v.clamp(0.0, 2.0);
        }
        if let Some(v) = advice.top_p.filter(|_| !ctx.keeps("top_p")) {
            sampling.top_p = v.clamp(0.0, 1.0);
        }
        if let Some(v) = advice.top_k.filter(|_| !ctx.keeps("top_k")) {
            sampling.top_k = clamp_u32(v, 0, 1000);
        }
        if let Some(v) = advice.min_p.filter(|_| !ctx.keeps("min_p")) {
            sampling.min_p = v.clamp(0.0, 1.0);
        }
        if let Some(v) = advice.presence_penalty.filter(|_| !ctx.keeps("presence_penalty")) {
            sampling.presence_penalty = v.clamp(0.0, 2.0);
        }
        if let Some(v) = advice.repeat_penalty.filter(|_| !ctx.keeps("repeat_penalty")) {
            sampling.repeat_penalty = v.clamp(0.0, 2.0);
        }
        if let Some(v) = advice.chat_template_kwargs.filter(|_| !ctx.keeps("chat_template_kwargs")) {
            params.chat_template_kwargs = v.trim().to_string();
        }

        if params.batch_size > 0 && params.ubatch_size > params.batch_size {
            params.ubatch_size = params.batch_size;
        }
        Ok(params)
    }
}

pub struct VllmRefinement<'a> {
    pub context: RunContext<'a>,
    pub model_ref: &'a str,
}

impl Refinement for VllmRefinement<'_> {
    type Plan = VllmRunParams;
    type Candidate = SmartRunAdvice;
    const PLANNER: &'static str = "smart-run";

    fn prompt(&self, baseline: &VllmRunParams) -> Result<String, PlanError> {
        let input = to_prompt_json(&json!({
            "runtime": "vllm",
            "model": {
                "id": self.context.model_id,
                "ref": self.model_ref,
            },
            "hardware": self.context.hardware,
            "baseline": {
                "max_model_len": baseline.max_model_len,
                "gpu_memory_utilization": baseline.gpu_memory_utilization,
                "dtype": baseline.dtype,
                "tensor_parallel_size": baseline.tensor_parallel_size,
                "enforce_eager": baseline.enforce_eager,
                "optimization_level": baseline.optimization_level,
                "max_num_seqs": baseline.max_num_seqs,
                "disable_custom_all_reduce": baseline.disable_custom_all_reduce,
                "trust_remote_code": baseline.trust_remote_code,
            },
        }))?;

        let mut prompt = format!(
            r#"You are a runtime tuning assistant for LocalAIStack.
Return JSON only.
Schema:
{{"vllm":{{"max_model_len":int,"gpu_memory_utilization":number,"dtype":string,"tensor_parallel_size":int,"enforce_eager":bool,"optimization_level":int,"max_num_seqs":int,"disable_custom_all_reduce":bool,"trust_remote_code":bool}},"reason":string}}
Rules:
- only suggest safe values for local inference stability.
- do not add new fields.
Input:
{}"#,
            input
        );
        append_base_info(&mut prompt, self.context.base_info.as_deref());
        Ok(prompt)
    }

    fn merge(&self, baseline: &VllmRunParams, candidate: SmartRunAdvice) -> Result<VllmRunParams, PlanError> {
        let mut params = baseline.clone();
        let Some(advice) = candidate.vllm else {
            return Ok(params);
        };
        let ctx = &self.context;

        if let Some(dtype) = advice.dtype.filter(|_| !ctx.keeps("dtype")) {
            let dtype = dtype.trim().to_lowercase();
            if !dtype.is_empty() {
                if !ALLOWED_DTYPES.contains(&dtype.as_str()) {
                    return Err(PlanError::invalid(
                        "dtype",
                        format!("unsupported dtype {:?} (allowed: {})", dtype, ALLOWED_DTYPES.join(", ")),
                    ));
                }
                params.dtype = dtype;
            }
        }
        if let Some(v) = advice.max_model_len.filter(|_| !ctx.keeps("max_model_len")) {
            params.max_model_len = clamp_u32(v, 256, 131_072);
        }
        if let Some(v) = advice
            .gpu_memory_utilization
            .filter(|_| !ctx.keeps("gpu_memory_utilization"))
        {
            params.gpu_memory_utilization = v.clamp(0.30, 0.98);
        }
        if let Some(v) = advice
            .tensor_parallel_size
            .filter(|_| !ctx.keeps("tensor_parallel_size"))
        {
            params.tensor_parallel_size = clamp_u32(v, 1, 16);
        }
        if let Some(v) = advice.enforce_eager.filter(|_| !ctx.keeps("enforce_eager")) {
            params.enforce_eager = v;
        }
        if let Some(v) = advice.optimization_level.filter(|_| !ctx.keeps("optimization_level")) {
            params.optimization_level = clamp_u32(v, 0, 3);
        }
        if let Some(v) = advice.max_num_seqs.filter(|_| !ctx.keeps("max_num_seqs")) {
            params.max_num_seqs = clamp_u32(v, 1, 256);
        }
        if let Some(v) = advice
            .disable_custom_all_reduce
            .filter(|_| !ctx.keeps("disable_custom_all_reduce"))
        {
            params.disable_custom_all_reduce = v;
        }
        if let Some(v) = advice.trust_remote_code.filter(|_| !ctx.keeps("trust_remote_code")) {
            params.trust_remote_code = v;
        }
        Ok(params)
    }
}
