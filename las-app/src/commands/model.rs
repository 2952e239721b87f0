use super::{or_na, App};
use crate::cli::RunArgs;
use anyhow::Result;
use las_core::baseline::{auto_tune, auto_tune_batch, default_llama_params, default_vllm_params, LlamaRunParams};
use las_core::refine::run::load_prompt_document;
use las_core::runtime::{
    dry_run_lines, llama_server_args, needs_trust_remote_code, resolve_gguf, vllm_model_ref, vllm_serve_args,
};
use las_core::{
    refine, HardwareSummary, LlamaRefinement, ModelFiles, PlannerOptions, Refined, RunContext, RuntimeKind,
    VllmRefinement,
};
use las_executor::{launch, resolve_runtime_binary};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const LLAMA_GUIDE_FILE: &str = "RUN_PARAMS_RECOMMENDATIONS.md";

/// A fully resolved server command, not yet bound to a binary.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub kind: RuntimeKind,
    pub args: Vec<String>,
    pub env: Vec<String>,
}

pub async fn run(app: &App, args: &RunArgs) -> Result<()> {
    let plan = plan_launch(app, args).await?;
    let binary = resolve_runtime_binary(plan.kind)?;
    if args.dry_run {
        for line in dry_run_lines(&binary, &plan.args, &plan.env) {
            println!("{}", line);
        }
        return Ok(());
    }
    launch(plan.kind, &binary, &plan.args, &plan.env).await?;
    Ok(())
}

/// A directory argument is used as is; anything else is a model id under
/// the models directory.
pub fn resolve_model_dir(models_dir: &Path, model: &str) -> PathBuf {
    let candidate = Path::new(model);
    if candidate.is_dir() {
        candidate.to_path_buf()
    } else {
        models_dir.join(model.trim())
    }
}

/// Fields given explicitly on the command line. Smart-run never touches them.
/// Values that mean "auto" (zero, a negative layer count, an empty split) do
/// not pin.
pub fn pinned_fields(args: &RunArgs) -> BTreeSet<String> {
    let flags = [
        ("threads", args.threads.is_some_and(|v| v > 0)),
        ("ctx_size", args.ctx_size.is_some_and(|v| v > 0)),
        ("n_gpu_layers", args.n_gpu_layers.is_some_and(|v| v >= 0)),
        ("tensor_split", args.tensor_split.as_deref().is_some_and(|v| !v.trim().is_empty())),
        ("batch_size", args.batch_size.is_some_and(|v| v > 0)),
        ("ubatch_size", args.ubatch_size.is_some_and(|v| v > 0)),
        ("temperature", args.temperature.is_some()),
        ("top_p", args.top_p.is_some()),
        ("top_k", args.top_k.is_some()),
        ("min_p", args.min_p.is_some()),
        ("presence_penalty", args.presence_penalty.is_some()),
        ("repeat_penalty", args.repeat_penalty.is_some()),
        ("chat_template_kwargs", args.chat_template_kwargs.is_some()),
        ("max_model_len", args.vllm_max_model_len.is_some()),
        ("gpu_memory_utilization", args.vllm_gpu_memory_utilization.is_some()),
        ("trust_remote_code", args.vllm_trust_remote_code.is_some()),
    ];
    flags
        .into_iter()
        .filter(|(_, set)| *set)
        .map(|(name, _)| name.to_string())
        .collect()
}

fn smart_run_options(app: &App, args: &RunArgs) -> PlannerOptions {
    app.settings.planner_options(
        args.smart_run,
        args.smart_run_debug || app.toggles.smart_run_debug,
        args.smart_run_strict || app.toggles.smart_run_strict,
    )
}

fn print_smart_run_debug<T>(options: &PlannerOptions, runtime: &str, refined: &Refined<T>) {
    if options.debug {
        println!(
            "Smart run planner ({}): source={} reason={}",
            runtime,
            refined.source,
            or_na(&refined.reason)
        );
    }
}

/// Baseline, operator flags, then smart-run refinement for whichever runtime
/// the model directory calls for.
pub async fn plan_launch(app: &App, args: &RunArgs) -> Result<LaunchPlan> {
    let dir = resolve_model_dir(&app.settings.models_dir, &args.model);
    let files = ModelFiles::scan(&dir)?;
    let kind = files.runtime(&args.model)?;
    let hw = app.hardware();
    let options = smart_run_options(app, args);

    let context = RunContext {
        model_id: &args.model,
        hardware: hw.clone(),
        pinned: pinned_fields(args),
        base_info: if args.smart_run {
            load_prompt_document(&app.settings.base_info_path)
        } else {
            None
        },
    };

    match kind {
        RuntimeKind::Vllm => plan_vllm(app, args, &files, context, &options).await,
        RuntimeKind::LlamaCpp => plan_llama(app, args, &files, &hw, context, &options).await,
    }
}

async fn plan_vllm(
    app: &App,
    args: &RunArgs,
    files: &ModelFiles,
    context: RunContext<'_>,
    options: &PlannerOptions,
) -> Result<LaunchPlan> {
    let model_ref = vllm_model_ref(&files.dir)?;
    let mut params = default_vllm_params(&context.hardware);
    if let Some(len) = args.vllm_max_model_len.filter(|v| *v > 0) {
        params.max_model_len = len;
    }
    if let Some(util) = args.vllm_gpu_memory_utilization.filter(|v| *v > 0.0) {
        params.gpu_memory_utilization = util;
    }
    params.trust_remote_code = args
        .vllm_trust_remote_code
        .unwrap_or_else(|| needs_trust_remote_code(&files.dir));

    let refinement = VllmRefinement {
        context,
        model_ref: &model_ref,
    };
    let refined = refine(&refinement, params, app.provider.as_deref(), options).await?;
    print_smart_run_debug(options, RuntimeKind::Vllm.name(), &refined);

    let params = refined.value;
    println!("Starting vLLM server for {}", args.model);
    Ok(LaunchPlan {
        kind: RuntimeKind::Vllm,
        args: vllm_serve_args(&model_ref, &params, &args.host, args.port),
        env: params.env,
    })
}

/// Applies explicit flags on top of the tuned baseline and validates the
/// sampling values.
pub fn apply_operator_llama(
    mut params: LlamaRunParams,
    args: &RunArgs,
    hw: &HardwareSummary,
    model_path: &Path,
) -> Result<LlamaRunParams> {
    if let Some(threads) = args.threads.filter(|v| *v > 0) {
        params.threads = threads;
    }
    if let Some(ctx) = args.ctx_size.filter(|v| *v > 0) {
        params.ctx_size = ctx;
    }
    if let Some(layers) = args.n_gpu_layers.filter(|v| *v >= 0) {
        params.n_gpu_layers = layers.min(i64::from(u32::MAX)) as u32;
    }
    if let Some(split) = args.tensor_split.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        params.tensor_split = split.to_string();
    }

    params.batch_size = args.batch_size.unwrap_or(0);
    params.ubatch_size = args.ubatch_size.unwrap_or(0);
    if args.auto_batch || params.batch_size == 0 || params.ubatch_size == 0 {
        let tuned = auto_tune_batch(hw, model_path, params.ctx_size, params.n_gpu_layers);
        if params.batch_size == 0 {
            params.batch_size = tuned.batch_size;
        }
        if params.ubatch_size == 0 {
            params.ubatch_size = tuned.ubatch_size;
        }
    }
    if params.batch_size > 0 && params.ubatch_size > params.batch_size {
        params.ubatch_size = params.batch_size;
    }

    let sampling = &mut params.sampling;
    if let Some(v) = args.temperature {
        sampling.temperature = v;
    }
    if let Some(v) = args.top_p {
        sampling.top_p = v;
    }
    if let Some(v) = args.top_k {
        sampling.top_k = v;
    }
    if let Some(v) = args.min_p {
        sampling.min_p = v;
    }
    if let Some(v) = args.presence_penalty {
        sampling.presence_penalty = v;
    }
    if let Some(v) = args.repeat_penalty {
        sampling.repeat_penalty = v;
    }
    sampling.validate().map_err(anyhow::Error::msg)?;

    if let Some(kwargs) = &args.chat_template_kwargs {
        params.chat_template_kwargs = kwargs.trim().to_string();
    }
    Ok(params)
}

async fn plan_llama(
    app: &App,
    args: &RunArgs,
    files: &ModelFiles,
    hw: &HardwareSummary,
    context: RunContext<'_>,
    options: &PlannerOptions,
) -> Result<LaunchPlan> {
    let (model_path, auto_selected) = resolve_gguf(files, args.file.as_deref())?;
    let file_name = model_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if auto_selected && files.gguf.len() > 1 {
        println!("Auto-selected GGUF file: {}", file_name);
    }

    let tuned = auto_tune(default_llama_params(hw), hw, &model_path);
    let params = apply_operator_llama(tuned, args, hw, &model_path)?;

    let guide = if options.enabled {
        load_prompt_document(&app.settings.modules_dir.join("llama.cpp").join(LLAMA_GUIDE_FILE))
    } else {
        None
    };
    let refinement = LlamaRefinement {
        context,
        model_path: &model_path,
        guide,
    };
    let refined = refine(&refinement, params, app.provider.as_deref(), options).await?;
    print_smart_run_debug(options, RuntimeKind::LlamaCpp.name(), &refined);

    let params = refined.value;
    if args.auto_batch {
        println!(
            "Auto batch tuned: --batch-size {} --ubatch-size {}",
            params.batch_size, params.ubatch_size
        );
    }
    println!("Starting llama.cpp server for {}", file_name);
    Ok(LaunchPlan {
        kind: RuntimeKind::LlamaCpp,
        args: llama_server_args(&model_path, &params, &args.host, args.port),
        env: Vec::new(),
    })
}
