use crate::hardware::HardwareSummary;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Layer count llama.cpp reads as "offload every layer".
pub const FULL_OFFLOAD_LAYERS: u32 = 999;

const GIB_KB: u64 = 1024 * 1024;

static MODEL_SIZE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)b").expect("static regex"));

const QUANT_TAGS: &[&str] = &[
    "q2_k", "q3_k", "q4_k_m", "q4_k_s", "q4", "q5_k_m", "q5_k_s", "q5", "q6_k", "q6", "q8_0", "q8",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sampling {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub min_p: f64,
    pub presence_penalty: f64,
    pub repeat_penalty: f64,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.8,
            top_k: 20,
            min_p: 0.0,
            presence_penalty: 1.5,
            repeat_penalty: 1.0,
        }
    }
}

impl Sampling {
    /// Rejects operator-supplied values llama.cpp would misbehave on.
    pub fn validate(&self) -> Result<(), String> {
        if self.temperature < 0.0 {
            return Err("temperature must be >= 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err("top-p must be in [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_p) {
            return Err("min-p must be in [0, 1]".to_string());
        }
        if self.repeat_penalty < 0.0 {
            return Err("repeat-penalty must be >= 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlamaRunParams {
    pub threads: u32,
    pub ctx_size: u32,
    pub n_gpu_layers: u32,
    pub tensor_split: String,
    pub batch_size: u32,
    pub ubatch_size: u32,
    pub sampling: Sampling,
    pub chat_template_kwargs: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchParams {
    pub batch_size: u32,
    pub ubatch_size: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    /// Parameter count in billions, 0 when the filename does not say.
    pub size_b: f64,
    pub quant: String,
}

pub fn infer_model_info(path: &Path) -> ModelInfo {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let size_b = MODEL_SIZE_PATTERN
        .captures_iter(&base)
        .filter_map(|caps| caps[1].parse::<f64>().ok())
        .fold(0.0, f64::max);

    let quant = QUANT_TAGS
        .iter()
        .find(|tag| base.contains(*tag))
        .map(|tag| tag.to_string())
        .unwrap_or_default();

    ModelInfo { size_b, quant }
}

fn ctx_for_memory(memory_kb: u64) -> Option<u32> {
    match memory_kb {
        kb if kb >= 64 * GIB_KB => Some(8192),
        kb if kb >= 32 * GIB_KB => Some(4096),
        kb if kb >= 16 * GIB_KB => Some(2048),
        _ => None,
    }
}

pub fn gpu_layers_for_vram(vram_gb: u32) -> u32 {
    match vram_gb {
        v if v >= 80 => 80,
        v if v >= 48 => 60,
        v if v >= 24 => 40,
        v if v >= 16 => 20,
        v if v >= 12 => 12,
        v if v > 0 => 8,
        _ => 0,
    }
}

/// Hardware-only defaults, before the model file is considered.
pub fn default_llama_params(hw: &HardwareSummary) -> LlamaRunParams {
    let threads = if hw.cpu_cores > 0 {
        hw.cpu_cores
    } else {
        match num_cpus::get() {
            0 => 4,
            n => n as u32,
        }
    };

    LlamaRunParams {
        threads,
        ctx_size: ctx_for_memory(hw.memory_kb).unwrap_or(1024),
        n_gpu_layers: gpu_layers_for_vram(hw.vram_gb()),
        tensor_split: String::new(),
        batch_size: 0,
        ubatch_size: 0,
        sampling: Sampling::default(),
        chat_template_kwargs: String::new(),
    }
}

fn offloadable_quant(quant: &str) -> bool {
    quant.is_empty() || ["q4", "q5", "q6", "q8"].iter().any(|p| quant.starts_with(p))
}

/// Adjusts the hardware defaults for a concrete GGUF file.
pub fn auto_tune(mut params: LlamaRunParams, hw: &HardwareSummary, model_path: &Path) -> LlamaRunParams {
    let info = infer_model_info(model_path);
    let vram = hw.vram_gb();
    let gpu_count = hw.effective_gpu_count();

    if hw.memory_kb >= 32 * GIB_KB {
        if let Some(ctx) = ctx_for_memory(hw.memory_kb) {
            params.ctx_size = params.ctx_size.max(ctx);
        }
    }

    if vram >= 16 && gpu_count >= 1 && info.size_b > 0.0 && info.size_b <= 30.0 && offloadable_quant(&info.quant)
    {
        params.n_gpu_layers = FULL_OFFLOAD_LAYERS;
    }

    if gpu_count > 1 && params.n_gpu_layers != 0 {
        params.tensor_split = make_tensor_split(gpu_count);
    }

    params
}

/// Equal percentage split, remainder going to the first cards.
pub fn make_tensor_split(count: u32) -> String {
    if count <= 1 {
        return String::new();
    }
    let base = 100 / count;
    let mut remaining = 100 - base * count;
    (0..count)
        .map(|_| {
            let mut value = base;
            if remaining > 0 {
                value += 1;
                remaining -= 1;
            }
            value.to_string()
        })
        .collect::<Vec<_>>()
        .join(",")
}

pub fn closest_power_of_two(v: u32) -> u32 {
    if v <= 1 {
        return 1;
    }
    let upper = v.next_power_of_two();
    let lower = upper >> 1;
    if upper - v < v - lower {
        upper
    } else {
        lower
    }
}

pub fn auto_tune_batch(hw: &HardwareSummary, model_path: &Path, ctx_size: u32, gpu_layers: u32) -> BatchParams {
    let info = infer_model_info(model_path);
    let vram = hw.vram_gb();
    let gpu_count = hw.effective_gpu_count();

    let mut ubatch: u32 = match vram {
        v if v >= 80 => 512,
        v if v >= 48 => 256,
        v if v >= 24 => 128,
        v if v >= 16 => 96,
        v if v >= 8 => 64,
        _ if hw.memory_kb >= 128 * GIB_KB => 128,
        _ if hw.memory_kb >= 64 * GIB_KB => 64,
        _ => 32,
    };

    if info.quant.starts_with("q8") {
        ubatch /= 2;
    } else if info.quant.starts_with("q2") || info.quant.starts_with("q3") {
        ubatch *= 2;
    }

    if info.size_b >= 70.0 {
        ubatch /= 2;
    } else if info.size_b >= 30.0 {
        ubatch = ubatch * 3 / 4;
    }

    if ctx_size > 16384 {
        ubatch /= 4;
    } else if ctx_size > 8192 {
        ubatch /= 2;
    }

    if gpu_layers == 0 {
        ubatch /= 2;
    }

    if gpu_count > 1 {
        ubatch *= gpu_count.min(2);
    }

    let ubatch = closest_power_of_two(ubatch).clamp(16, 1024);
    let batch = if vram >= 48 || (gpu_count > 1 && vram >= 24) {
        ubatch * 4
    } else {
        ubatch * 2
    };
    let batch = closest_power_of_two(batch).clamp(ubatch, 2048);

    BatchParams {
        batch_size: batch,
        ubatch_size: ubatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hw(memory_gib: u64, gpu: &str, count: u32) -> HardwareSummary {
        HardwareSummary {
            cpu_cores: 16,
            memory_kb: memory_gib * GIB_KB,
            gpu_name: gpu.to_string(),
            gpu_count: count,
        }
    }

    #[test]
    fn test_defaults_by_tier() {
        let params = default_llama_params(&hw(64, "NVIDIA A100-SXM4-80GB", 1));
        assert_eq!(params.threads, 16);
        assert_eq!(params.ctx_size, 8192);
        assert_eq!(params.n_gpu_layers, 80);

        let params = default_llama_params(&hw(8, "", 0));
        assert_eq!(params.ctx_size, 1024);
        assert_eq!(params.n_gpu_layers, 0);
    }

    #[test]
    fn test_threads_fall_back_to_host() {
        let params = default_llama_params(&HardwareSummary::default());
        assert!(params.threads >= 1);
    }

    #[test]
    fn test_infer_model_info() {
        let info = infer_model_info(Path::new("/models/Qwen2.5-7B-Instruct-Q4_K_M.gguf"));
        assert_eq!(info.size_b, 7.0);
        assert_eq!(info.quant, "q4_k_m");

        let info = infer_model_info(Path::new("mixtral-8x22b-1.5b-q8_0.gguf"));
        assert_eq!(info.size_b, 22.0);
        assert_eq!(info.quant, "q8_0");
    }

    #[test]
    fn test_full_offload_for_small_model() {
        let hw = hw(32, "RTX 4090 24GB", 1);
        let tuned = auto_tune(default_llama_params(&hw), &hw, Path::new("qwen-7b-q4_k_m.gguf"));
        assert_eq!(tuned.n_gpu_layers, FULL_OFFLOAD_LAYERS);
        assert_eq!(tuned.ctx_size, 4096);
        assert!(tuned.tensor_split.is_empty());
    }

    #[test]
    fn test_no_offload_for_large_model() {
        let hw = hw(32, "RTX 4090 24GB", 1);
        let tuned = auto_tune(default_llama_params(&hw), &hw, Path::new("llama-70b-q4_k_m.gguf"));
        assert_eq!(tuned.n_gpu_layers, 40);
    }

    #[test]
    fn test_tensor_split_multi_gpu() {
        assert_eq!(make_tensor_split(3), "34,33,33");
        assert_eq!(make_tensor_split(4), "25,25,25,25");
        assert_eq!(make_tensor_split(1), "");

        let hw = hw(128, "NVIDIA A100-SXM4-80GB", 3);
        let tuned = auto_tune(default_llama_params(&hw), &hw, Path::new("qwen-14b.gguf"));
        assert_eq!(tuned.tensor_split, "34,33,33");
    }

    #[test]
    fn test_closest_power_of_two() {
        assert_eq!(closest_power_of_two(0), 1);
        assert_eq!(closest_power_of_two(1), 1);
        assert_eq!(closest_power_of_two(3), 2);
        assert_eq!(closest_power_of_two(5), 4);
        assert_eq!(closest_power_of_two(6), 4);
        assert_eq!(closest_power_of_two(7), 8);
        assert_eq!(closest_power_of_two(96), 64);
        assert_eq!(closest_power_of_two(128), 128);
    }

    #[test]
    fn test_batch_for_a100() {
        let hw = hw(256, "NVIDIA A100-SXM4-80GB", 1);
        let batch = auto_tune_batch(&hw, Path::new("qwen-7b-q4_k_m.gguf"), 8192, 999);
        assert_eq!(batch.ubatch_size, 512);
        assert_eq!(batch.batch_size, 2048);
    }

    #[test]
    fn test_batch_cpu_only() {
        let hw = hw(16, "", 0);
        let batch = auto_tune_batch(&hw, Path::new("qwen-7b-q4_k_m.gguf"), 2048, 0);
        assert_eq!(batch.ubatch_size, 16);
        assert_eq!(batch.batch_size, 32);
    }

    proptest! {
        #[test]
        fn batch_derivation_is_bounded_and_stable(
            memory_gib in 0u64..512,
            vram in 0u32..128,
            count in 0u32..8,
            ctx in 0u32..300_000,
            layers in 0u32..1000,
            size in 0u32..200,
            quant in prop::sample::select(vec!["", "q2_k", "q3_k", "q4_k_m", "q5", "q6_k", "q8_0"]),
        ) {
            let hw = HardwareSummary {
                cpu_cores: 8,
                memory_kb: memory_gib * GIB_KB,
                gpu_name: if vram > 0 { format!("GPU {}GB", vram) } else { String::new() },
                gpu_count: count,
            };
            let name = format!("model-{}b-{}.gguf", size, quant);
            let first = auto_tune_batch(&hw, Path::new(&name), ctx, layers);
            let second = auto_tune_batch(&hw, Path::new(&name), ctx, layers);
            prop_assert_eq!(first, second);
            prop_assert!(first.ubatch_size >= 16 && first.ubatch_size <= 1024);
            prop_assert!(first.ubatch_size <= first.batch_size);
            prop_assert!(first.batch_size <= 2048);
            prop_assert!(first.ubatch_size.is_power_of_two());
        }
    }
}
