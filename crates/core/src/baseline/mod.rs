//! Deterministic launch-parameter baselines.
//!
//! These are pure functions of the hardware summary (and the model filename
//! for llama.cpp). They are the answer whenever refinement is disabled or
//! rejected, so they never fail.

pub mod llama;
pub mod vllm;

pub use llama::{
    auto_tune, auto_tune_batch, closest_power_of_two, default_llama_params, gpu_layers_for_vram,
    infer_model_info, make_tensor_split, BatchParams, LlamaRunParams, ModelInfo, Sampling, FULL_OFFLOAD_LAYERS,
};
pub use vllm::{default_vllm_params, is_legacy_gpu, VllmRunParams, ALLOWED_DTYPES};
