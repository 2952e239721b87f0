use clap::{Args, Parser, Subcommand, ValueEnum};
use las_failure::Phase;

#[derive(Debug, Parser)]
#[command(name = "las", version, about = "Install modules and run local models with hardware-aware plans")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Install, update, remove and configure modules
    Module {
        #[command(subcommand)]
        action: ModuleCommand,
    },
    /// Run downloaded models
    Model {
        #[command(subcommand)]
        action: ModelCommand,
    },
    /// Inspect recorded failures
    Failure {
        #[command(subcommand)]
        action: FailureCommand,
    },
    /// Host inspection
    System {
        #[command(subcommand)]
        action: SystemCommand,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Args)]
pub struct PlannerFlags {
    /// Print planner source and reason
    #[arg(long)]
    pub planner_debug: bool,
    /// Fail when the planner cannot produce a valid plan
    #[arg(long)]
    pub planner_strict: bool,
}

#[derive(Debug, Subcommand)]
pub enum ModuleCommand {
    Install {
        name: String,
        #[command(flatten)]
        planner: PlannerFlags,
        /// Print the resolved steps without running them
        #[arg(long)]
        dry_run: bool,
    },
    Update {
        name: String,
        #[command(flatten)]
        planner: PlannerFlags,
    },
    Uninstall {
        name: String,
    },
    /// Validate declared postconditions without running any step
    Check {
        name: String,
    },
    /// Generate a module configuration plan
    ConfigPlan {
        module: String,
        /// Model id to include in the planning context
        #[arg(long, default_value = "")]
        model: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
        /// Operator override, repeatable: --set key=value
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
        /// Persist the plan to the config plan directory
        #[arg(long)]
        apply: bool,
        /// Print the plan without saving, even with --apply
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        planner: PlannerFlags,
    },
}

#[derive(Debug, Subcommand)]
pub enum ModelCommand {
    Run(RunArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Model id under the models directory, or a model directory path
    pub model: String,
    /// Specific GGUF filename to run
    #[arg(short, long)]
    pub file: Option<String>,
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// CPU threads for llama.cpp (auto when omitted)
    #[arg(long)]
    pub threads: Option<u32>,
    /// Context size for llama.cpp (auto when omitted)
    #[arg(long)]
    pub ctx_size: Option<u32>,
    /// GPU layers for llama.cpp (-1 = auto)
    #[arg(long, allow_negative_numbers = true)]
    pub n_gpu_layers: Option<i64>,
    /// Tensor split for multi-GPU (comma-separated percentages)
    #[arg(long)]
    pub tensor_split: Option<String>,
    /// Batch size for llama.cpp (0 = auto)
    #[arg(long)]
    pub batch_size: Option<u32>,
    /// Micro batch size for llama.cpp (0 = auto)
    #[arg(long)]
    pub ubatch_size: Option<u32>,
    /// Auto-tune --batch-size/--ubatch-size from hardware and model
    #[arg(long)]
    pub auto_batch: bool,

    #[arg(long)]
    pub temperature: Option<f64>,
    #[arg(long)]
    pub top_p: Option<f64>,
    #[arg(long)]
    pub top_k: Option<u32>,
    #[arg(long)]
    pub min_p: Option<f64>,
    #[arg(long)]
    pub presence_penalty: Option<f64>,
    #[arg(long)]
    pub repeat_penalty: Option<f64>,
    /// JSON passed through to --chat-template-kwargs
    #[arg(long)]
    pub chat_template_kwargs: Option<String>,

    #[arg(long)]
    pub vllm_max_model_len: Option<u32>,
    #[arg(long)]
    pub vllm_gpu_memory_utilization: Option<f64>,
    /// Pass --trust-remote-code to vLLM; detected from custom-code markers when omitted
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub vllm_trust_remote_code: Option<bool>,

    /// Use the LLM to refine runtime parameters
    #[arg(long)]
    pub smart_run: bool,
    /// Print smart-run planner source and fallback reason
    #[arg(long)]
    pub smart_run_debug: bool,
    /// Fail the run if smart-run cannot obtain valid advice
    #[arg(long, requires = "smart_run")]
    pub smart_run_strict: bool,
    /// Print the final runtime command without launching the process
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Subcommand)]
pub enum FailureCommand {
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Filter by phase (install_planner, config_planner, smart_run, module_install, ...)
        #[arg(long)]
        phase: Option<Phase>,
        /// Filter by category (auth, rate_limit, timeout, network, command_exit, ...)
        #[arg(long)]
        category: Option<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },
    /// Show one failure event with suggested actions
    Show { id: String },
}

#[derive(Debug, Subcommand)]
pub enum SystemCommand {
    /// Collect CPU, memory and GPU facts and write the base info file
    Detect {
        /// Print only, do not write the base info file
        #[arg(long)]
        dry_run: bool,
    },
}

/// Where a failed command is recorded, if anywhere.
#[derive(Debug, Clone)]
pub struct FailureScope {
    pub phase: Phase,
    pub module: String,
    pub model: String,
    pub message: &'static str,
}

impl Command {
    pub fn failure_scope(&self) -> Option<FailureScope> {
        let scope = |phase, module: &str, model: &str, message| {
            Some(FailureScope {
                phase,
                module: module.to_string(),
                model: model.to_string(),
                message,
            })
        };
        match self {
            Command::Module { action } => match action {
                ModuleCommand::Install { name, .. } => scope(Phase::ModuleInstall, name, "", "module install failed"),
                ModuleCommand::Update { name, .. } => scope(Phase::ModuleUpdate, name, "", "module update failed"),
                ModuleCommand::Uninstall { name } => {
                    scope(Phase::ModuleUninstall, name, "", "module uninstall failed")
                }
                ModuleCommand::Check { name } => scope(Phase::ModuleInstall, name, "", "module check failed"),
                ModuleCommand::ConfigPlan { module, model, .. } => {
                    scope(Phase::ConfigPlanner, module, model, "module config-plan failed")
                }
            },
            Command::Model {
                action: ModelCommand::Run(args),
            } => scope(Phase::ModelRun, "", &args.model, "model run failed"),
            Command::Failure { .. } | Command::System { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_requires_smart_run() {
        assert!(Cli::try_parse_from(["las", "model", "run", "qwen", "--smart-run-strict"]).is_err());
        assert!(Cli::try_parse_from(["las", "model", "run", "qwen", "--smart-run", "--smart-run-strict"]).is_ok());
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::try_parse_from(["las", "model", "run", "qwen", "--n-gpu-layers", "-1"]).unwrap();
        let Command::Model {
            action: ModelCommand::Run(args),
        } = cli.command
        else {
            panic!("expected model run");
        };
        assert_eq!(args.host, "0.0.0.0");
        assert_eq!(args.port, 8080);
        assert_eq!(args.n_gpu_layers, Some(-1));
        assert!(args.temperature.is_none());
    }

    #[test]
    fn test_failure_scope() {
        let cli = Cli::try_parse_from(["las", "module", "update", "vllm"]).unwrap();
        let scope = cli.command.failure_scope().unwrap();
        assert_eq!(scope.phase, Phase::ModuleUpdate);
        assert_eq!(scope.module, "vllm");

        let cli = Cli::try_parse_from(["las", "failure", "list", "--phase", "smart_run"]).unwrap();
        assert!(cli.command.failure_scope().is_none());
    }

    #[test]
    fn test_config_plan_overrides() {
        let cli = Cli::try_parse_from([
            "las", "module", "config-plan", "llama.cpp", "--set", "threads=8", "--set", "ctx_size=4096", "--output",
            "json",
        ])
        .unwrap();
        let Command::Module {
            action: ModuleCommand::ConfigPlan { overrides, output, .. },
        } = cli.command
        else {
            panic!("expected config-plan");
        };
        assert_eq!(overrides, vec!["threads=8", "ctx_size=4096"]);
        assert_eq!(output, OutputFormat::Json);
    }
}
