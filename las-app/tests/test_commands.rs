use async_trait::async_trait;
use clap::Parser;
use las_app::cli::{Cli, Command, ModelCommand, OutputFormat, PlannerFlags, RunArgs};
use las_app::commands::{config_plan, failure, model, App};
use las_app::config::{Settings, Toggles};
use las_core::{PlanSource, RuntimeKind};
use las_providers::{GenerateRequest, GenerateResponse, LLMProvider, ProviderError};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

struct StubProvider {
    reply: Result<String, u16>,
    calls: AtomicUsize,
}

impl StubProvider {
    fn replying(text: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(text.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(status: u16) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(status),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl LLMProvider for StubProvider {
    async fn generate(&self, _request: &GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            Ok(text) => Ok(GenerateResponse { text: text.clone() }),
            Err(status) => Err(ProviderError::Api {
                status: *status,
                body: "unavailable".to_string(),
            }),
        }
    }

    fn name(&self) -> &str {
        "stub"
    }
}

struct Fixture {
    temp: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("base_info.json"),
            r#"{"cpu":{"model":"EPYC","cores":16},"memory":"64 GiB","gpu":"NVIDIA A10 24GB"}"#,
        )
        .unwrap();
        Self { temp }
    }

    fn models(&self) -> std::path::PathBuf {
        self.temp.path().join("models")
    }

    fn app(&self, provider: Option<Arc<dyn LLMProvider>>) -> App {
        let root = self.temp.path();
        let settings = Settings {
            llm: None,
            modules_dir: root.join("modules"),
            models_dir: self.models(),
            failure_dir: root.join("failures"),
            config_plan_dir: root.join("config-plans"),
            base_info_path: root.join("base_info.json"),
        };
        App::new(settings, Toggles::default()).with_provider(provider)
    }

    fn gguf_model(&self, id: &str, files: &[(&str, usize)]) {
        let dir = self.models().join(id);
        std::fs::create_dir_all(&dir).unwrap();
        for (name, size) in files {
            std::fs::write(dir.join(name), vec![0u8; *size]).unwrap();
        }
    }

    fn safetensors_model(&self, id: &str) -> std::path::PathBuf {
        let dir = self.models().join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.json"), r#"{"architectures":["Qwen2ForCausalLM"]}"#).unwrap();
        std::fs::write(dir.join("model.safetensors"), b"weights").unwrap();
        dir
    }
}

fn run_args(args: &[&str]) -> RunArgs {
    let argv = ["las", "model", "run"].iter().chain(args.iter()).copied();
    match Cli::try_parse_from(argv).unwrap().command {
        Command::Model {
            action: ModelCommand::Run(args),
        } => args,
        other => panic!("unexpected command {:?}", other),
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

#[tokio::test]
async fn test_llama_baseline_without_smart_run() {
    let fixture = Fixture::new();
    fixture.gguf_model("qwen", &[("qwen2.5-7b-q8_0.gguf", 64), ("qwen2.5-7b-q4_k_m.gguf", 32)]);
    let provider = StubProvider::replying(r#"{"llama":{"threads":2}}"#);
    let app = fixture.app(Some(provider.clone()));

    let plan = model::plan_launch(&app, &run_args(&["qwen", "--port", "9000"])).await.unwrap();
    assert_eq!(plan.kind, RuntimeKind::LlamaCpp);
    assert!(flag_value(&plan.args, "--model").unwrap().ends_with("qwen2.5-7b-q4_k_m.gguf"));
    assert_eq!(flag_value(&plan.args, "--threads"), Some("16"));
    assert_eq!(flag_value(&plan.args, "--port"), Some("9000"));
    assert_eq!(flag_value(&plan.args, "--n-gpu-layers"), Some("999"));
    assert!(flag_value(&plan.args, "--batch-size").is_some());
    assert!(plan.env.is_empty());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_smart_run_keeps_operator_flags() {
    let fixture = Fixture::new();
    fixture.gguf_model("qwen", &[("qwen2.5-7b-q4_k_m.gguf", 32)]);
    let provider = StubProvider::replying(
        r#"Tuned: {"llama":{"threads":32,"ctx_size":4096,"temperature":0.3},"reason":"tight memory"}"#,
    );
    let app = fixture.app(Some(provider.clone()));

    let args = run_args(&["qwen", "--threads", "6", "--smart-run"]);
    let plan = model::plan_launch(&app, &args).await.unwrap();
    assert_eq!(flag_value(&plan.args, "--threads"), Some("6"));
    assert_eq!(flag_value(&plan.args, "--ctx-size"), Some("4096"));
    assert_eq!(flag_value(&plan.args, "--temp"), Some("0.3"));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_smart_run_strict_failure_is_fatal() {
    let fixture = Fixture::new();
    fixture.gguf_model("qwen", &[("qwen2.5-7b-q4_k_m.gguf", 32)]);
    let app = fixture.app(Some(StubProvider::failing(503)));

    let err = model::plan_launch(&app, &run_args(&["qwen", "--smart-run", "--smart-run-strict"]))
        .await
        .unwrap_err();
    let message = format!("{:#}", err);
    assert!(message.starts_with("smart-run strict mode:"), "{}", message);
    assert!(message.contains("503"));

    let plan = model::plan_launch(&app, &run_args(&["qwen", "--smart-run"])).await.unwrap();
    assert_eq!(flag_value(&plan.args, "--threads"), Some("16"));
}

#[tokio::test]
async fn test_invalid_sampling_is_rejected() {
    let fixture = Fixture::new();
    fixture.gguf_model("qwen", &[("qwen2.5-7b-q4_k_m.gguf", 32)]);
    let app = fixture.app(None);

    let err = model::plan_launch(&app, &run_args(&["qwen", "--top-p", "1.5"])).await.unwrap_err();
    assert_eq!(err.to_string(), "top-p must be in [0, 1]");
}

#[tokio::test]
async fn test_vllm_plan_for_safetensors() {
    let fixture = Fixture::new();
    let dir = fixture.safetensors_model("Qwen2.5-7B");
    let provider = StubProvider::replying(r#"{"vllm":{"max_model_len":8192,"max_num_seqs":8},"reason":"ok"}"#);
    let app = fixture.app(Some(provider));

    let args = run_args(&["Qwen2.5-7B", "--smart-run", "--vllm-max-model-len", "2048"]);
    let plan = model::plan_launch(&app, &args).await.unwrap();
    assert_eq!(plan.kind, RuntimeKind::Vllm);
    assert_eq!(plan.args[0], "serve");
    assert_eq!(Path::new(&plan.args[1]), dir.as_path());
    assert_eq!(flag_value(&plan.args, "--max-model-len"), Some("2048"));
    assert_eq!(flag_value(&plan.args, "--max-num-seqs"), Some("8"));
    assert!(!plan.args.contains(&"--trust-remote-code".to_string()));
}

#[tokio::test]
async fn test_missing_model_directory() {
    let fixture = Fixture::new();
    let app = fixture.app(None);
    let err = model::plan_launch(&app, &run_args(&["ghost"])).await.unwrap_err();
    assert!(err.to_string().starts_with("local model not found"));
}

#[tokio::test]
async fn test_vllm_trust_remote_code_follows_markers_unless_set() {
    let fixture = Fixture::new();
    let dir = fixture.safetensors_model("custom");
    std::fs::write(
        dir.join("config.json"),
        r#"{"auto_map":{"AutoModelForCausalLM":"modeling_custom.Model"}}"#,
    )
    .unwrap();
    let app = fixture.app(None);
    let trust = "--trust-remote-code".to_string();

    let plan = model::plan_launch(&app, &run_args(&["custom"])).await.unwrap();
    assert!(plan.args.contains(&trust));

    let args = run_args(&["custom", "--vllm-trust-remote-code=false"]);
    assert_eq!(args.vllm_trust_remote_code, Some(false));
    let plan = model::plan_launch(&app, &args).await.unwrap();
    assert!(!plan.args.contains(&trust));

    fixture.safetensors_model("plain");
    let args = run_args(&["plain", "--vllm-trust-remote-code"]);
    assert_eq!(args.vllm_trust_remote_code, Some(true));
    let plan = model::plan_launch(&app, &args).await.unwrap();
    assert!(plan.args.contains(&trust));
}

#[test]
fn test_pinned_fields() {
    let pinned = model::pinned_fields(&run_args(&["qwen", "--ctx-size", "8192", "--top-k", "40"]));
    assert_eq!(pinned.into_iter().collect::<Vec<_>>(), vec!["ctx_size", "top_k"]);

    let pinned = model::pinned_fields(&run_args(&["qwen", "--vllm-trust-remote-code=false"]));
    assert_eq!(pinned.into_iter().collect::<Vec<_>>(), vec!["trust_remote_code"]);
}

#[test]
fn test_auto_values_do_not_pin() {
    let args = run_args(&[
        "qwen",
        "--n-gpu-layers",
        "-1",
        "--batch-size",
        "0",
        "--ubatch-size",
        "0",
        "--threads",
        "0",
        "--tensor-split",
        " ",
    ]);
    assert!(model::pinned_fields(&args).is_empty());

    let args = run_args(&["qwen", "--n-gpu-layers", "0", "--batch-size", "512"]);
    let pinned = model::pinned_fields(&args);
    assert_eq!(pinned.into_iter().collect::<Vec<_>>(), vec!["batch_size", "n_gpu_layers"]);
}

fn config_request(module: &str, overrides: &[&str]) -> config_plan::Request {
    config_plan::Request {
        module: module.to_string(),
        model: String::new(),
        output: OutputFormat::Text,
        overrides: overrides.iter().map(|s| s.to_string()).collect(),
        apply: false,
        dry_run: false,
        planner: PlannerFlags::default(),
    }
}

#[tokio::test]
async fn test_config_plan_static_without_provider() {
    let fixture = Fixture::new();
    let app = fixture.app(None);

    let plan = config_plan::build(&app, &config_request("llama.cpp", &[]), false, false)
        .await
        .unwrap();
    assert_eq!(plan.source, PlanSource::Static);
    assert_eq!(plan.reason, "no LLM provider configured");
    assert_eq!(plan.change("threads").unwrap().value, serde_json::json!(16));

    let text = config_plan::render_text(&plan);
    assert!(text.starts_with("Config Plan\n  Module: llama.cpp\n  Source: static\n"));
    assert!(text.contains("  Hardware: cpu=16, memory_kb=67108864, gpu=NVIDIA A10 24GB, gpu_count=1\n"));
    assert!(text.contains("  Changes: 3\nSCOPE"));
}

#[tokio::test]
async fn test_config_plan_refined_with_operator_override() {
    let fixture = Fixture::new();
    let provider = StubProvider::replying(
        r#"{"reason":"more context","changes":[{"scope":"model.run.llama.cpp","key":"threads","value":64},{"scope":"model.run.llama.cpp","key":"ctx_size","value":"16384"}]}"#,
    );
    let app = fixture.app(Some(provider));

    let plan = config_plan::build(&app, &config_request("llama.cpp", &["threads=8"]), false, false)
        .await
        .unwrap();
    assert_eq!(plan.source, PlanSource::Llm);
    assert_eq!(plan.reason, "more context");
    assert_eq!(plan.change("threads").unwrap().value, serde_json::json!(8));
    assert_eq!(plan.change("threads").unwrap().reason, "set by operator");
    assert_eq!(plan.change("ctx_size").unwrap().value, serde_json::json!(16384));

    let json = config_plan::render(&plan, OutputFormat::Json).unwrap();
    let decoded: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded["source"], "llm");
}

#[tokio::test]
async fn test_config_plan_strict_errors() {
    let fixture = Fixture::new();
    let app = fixture.app(Some(StubProvider::replying("no plan today")));

    let err = config_plan::build(&app, &config_request("llama.cpp", &[]), false, true)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "config planner strict mode: planner response did not include JSON"
    );

    let err = config_plan::build(&app, &config_request("comfyui", &[]), false, true)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "config planner strict mode: no static config planner available for module \"comfyui\""
    );

    let err = config_plan::build(&app, &config_request("vllm", &["threads=4"]), false, false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unsupported key"));
}

#[tokio::test]
async fn test_config_plan_apply_writes_file() {
    let fixture = Fixture::new();
    let app = fixture.app(None);
    let mut request = config_request("vllm", &[]);
    request.apply = true;

    config_plan::run(&app, &request).await.unwrap();
    let saved = las_core::refine::config::load_plan(&fixture.temp.path().join("config-plans/vllm.json")).unwrap();
    assert_eq!(saved.module, "vllm");

    request.module = "ollama".to_string();
    request.dry_run = true;
    config_plan::run(&app, &request).await.unwrap();
    assert!(!fixture.temp.path().join("config-plans/ollama.json").exists());
}

#[test]
fn test_failure_table_empty() {
    assert_eq!(failure::render_events(&[]), "No failure records found.\n");
}
