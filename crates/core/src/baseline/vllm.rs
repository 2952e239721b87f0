use crate::hardware::HardwareSummary;
use serde::{Deserialize, Serialize};

const GIB_KB: u64 = 1024 * 1024;

/// GPU generations where vLLM's fused kernels and bf16 are unreliable.
const LEGACY_GPU_MARKERS: &[&str] = &["v100", "p100", "p40", "p4", "k80", "k40", "m60"];

pub const ALLOWED_DTYPES: &[&str] = &["float16", "bfloat16", "float32"];

/// Environment overrides that keep NCCL off InfiniBand and peer-to-peer paths.
pub const FABRIC_DISABLE_ENV: &[&str] = &["NCCL_IB_DISABLE=1", "NCCL_P2P_DISABLE=1"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VllmRunParams {
    pub max_model_len: u32,
    pub gpu_memory_utilization: f64,
    pub dtype: String,
    pub tensor_parallel_size: u32,
    pub enforce_eager: bool,
    pub optimization_level: u32,
    pub max_num_seqs: u32,
    pub disable_custom_all_reduce: bool,
    pub trust_remote_code: bool,
    pub env: Vec<String>,
}

pub fn is_legacy_gpu(name: &str) -> bool {
    let lower = name.trim().to_lowercase();
    !lower.is_empty() && LEGACY_GPU_MARKERS.iter().any(|m| lower.contains(m))
}

pub fn default_vllm_params(hw: &HardwareSummary) -> VllmRunParams {
    let vram = hw.vram_gb();
    let gpu_count = hw.effective_gpu_count();
    let legacy = is_legacy_gpu(&hw.gpu_name);
    let small_card = vram > 0 && vram <= 16;

    let mut max_model_len = match vram {
        v if v >= 80 => 32768,
        v if v >= 48 => 24576,
        v if v >= 24 => 16384,
        v if v >= 16 => 8192,
        v if v >= 12 => 6144,
        v if v > 0 => 4096,
        _ if hw.memory_kb >= 128 * GIB_KB => 8192,
        _ if hw.memory_kb >= 64 * GIB_KB => 4096,
        _ => 2048,
    };

    let mut gpu_memory_utilization = if gpu_count > 0 && vram > 0 {
        match vram {
            v if v >= 80 => 0.92,
            v if v >= 48 => 0.90,
            v if v >= 24 => 0.88,
            v if v >= 16 => 0.86,
            _ => 0.82,
        }
    } else {
        0.0
    };

    // 16GB-class cards fail the KV-cache memory probe at higher pressure.
    if small_card {
        max_model_len = max_model_len.min(2048);
        gpu_memory_utilization = 0.88;
    }

    let tensor_parallel_size = if gpu_count >= 2 && vram > 0 && vram <= 24 {
        2
    } else {
        gpu_count.max(1)
    };

    let dtype = if gpu_count > 0 && legacy {
        "float16".to_string()
    } else {
        String::new()
    };

    let (enforce_eager, optimization_level) = if legacy || small_card { (true, 0) } else { (false, 2) };

    let max_num_seqs = match vram {
        v if v > 0 && v <= 16 => {
            if tensor_parallel_size > 1 {
                2
            } else {
                4
            }
        }
        v if v > 0 && v <= 24 => 8,
        v if v > 0 && v <= 48 => 12,
        _ => 16,
    };

    let disable_custom_all_reduce = tensor_parallel_size > 1 && (legacy || vram <= 16);
    let env = if disable_custom_all_reduce {
        FABRIC_DISABLE_ENV.iter().map(|s| s.to_string()).collect()
    } else {
        Vec::new()
    };

    VllmRunParams {
        max_model_len,
        gpu_memory_utilization,
        dtype,
        tensor_parallel_size,
        enforce_eager,
        optimization_level,
        max_num_seqs,
        disable_custom_all_reduce,
        trust_remote_code: false,
        env,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v100_pair_is_conservative() {
        let hw = HardwareSummary {
            cpu_cores: 40,
            memory_kb: 32_691_216,
            gpu_name: "Tesla V100-SXM2-16GB".to_string(),
            gpu_count: 2,
        };
        let params = default_vllm_params(&hw);
        assert_eq!(params.max_model_len, 2048);
        assert_eq!(params.gpu_memory_utilization, 0.88);
        assert_eq!(params.dtype, "float16");
        assert_eq!(params.tensor_parallel_size, 2);
        assert!(params.enforce_eager);
        assert_eq!(params.optimization_level, 0);
        assert_eq!(params.max_num_seqs, 2);
        assert!(params.disable_custom_all_reduce);
        assert!(params.env.contains(&"NCCL_IB_DISABLE=1".to_string()));
        assert!(params.env.contains(&"NCCL_P2P_DISABLE=1".to_string()));
    }

    #[test]
    fn test_a100_quad() {
        let hw = HardwareSummary {
            cpu_cores: 64,
            memory_kb: 262_144_000,
            gpu_name: "NVIDIA A100-SXM4-80GB".to_string(),
            gpu_count: 4,
        };
        let params = default_vllm_params(&hw);
        assert_eq!(params.max_model_len, 32768);
        assert_eq!(params.gpu_memory_utilization, 0.92);
        assert_eq!(params.dtype, "");
        assert_eq!(params.tensor_parallel_size, 4);
        assert!(!params.enforce_eager);
        assert_eq!(params.optimization_level, 2);
        assert_eq!(params.max_num_seqs, 16);
        assert!(!params.disable_custom_all_reduce);
        assert!(params.env.is_empty());
    }

    #[test]
    fn test_cpu_only_host() {
        let hw = HardwareSummary {
            cpu_cores: 8,
            memory_kb: 128 * GIB_KB,
            ..Default::default()
        };
        let params = default_vllm_params(&hw);
        assert_eq!(params.max_model_len, 8192);
        assert_eq!(params.gpu_memory_utilization, 0.0);
        assert_eq!(params.tensor_parallel_size, 1);
        assert_eq!(params.max_num_seqs, 16);
    }

    #[test]
    fn test_consumer_pair_uses_tp2() {
        let hw = HardwareSummary {
            cpu_cores: 16,
            memory_kb: 64 * GIB_KB,
            gpu_name: "NVIDIA GeForce RTX 3090 24GB".to_string(),
            gpu_count: 2,
        };
        let params = default_vllm_params(&hw);
        assert_eq!(params.tensor_parallel_size, 2);
        assert_eq!(params.max_num_seqs, 8);
        assert!(!params.disable_custom_all_reduce);
    }

    #[test]
    fn test_legacy_markers() {
        assert!(is_legacy_gpu("Tesla P40"));
        assert!(!is_legacy_gpu("NVIDIA H100 80GB"));
        assert!(!is_legacy_gpu(""));
    }
}
