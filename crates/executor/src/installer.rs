//! Install plan executor.
//!
//! `install` walks a fixed sequence: load the module's `INSTALL.yaml`, run its
//! preconditions, pick the mode, obtain the step list (baseline or refined),
//! then run every step in order, validating its postcondition before the next
//! one starts. The first failure aborts the run.

use crate::command_executor::{normalized_output, CommandExecutor, ShellOutput};
use crate::error::InstallError;
use crate::expect::validate_expected;
use crate::template::run_template_step;
use las_core::install_spec::{normalize_module_name, Expected, Precondition, ScriptHook};
use las_core::{
    refine, select_mode, HardwareSummary, InstallPlan, InstallRefinement, ModeSelection, ModuleSpec, PlanSource,
    PlannerOptions, Refined, Step,
};
use las_providers::LLMProvider;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The step list an install would execute, and how it was chosen.
#[derive(Debug, Clone)]
pub struct ResolvedInstall {
    pub module: ModuleSpec,
    pub selection: ModeSelection,
    pub plan: Refined<InstallPlan>,
}

impl ResolvedInstall {
    pub fn step_ids(&self) -> String {
        self.plan.value.step_ids().join(",")
    }
}

#[derive(Debug, Clone)]
pub struct InstallReport {
    pub module: String,
    pub mode: String,
    pub source: PlanSource,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CheckReport {
    pub module: String,
    pub mode: String,
    pub checked: Vec<String>,
}

pub struct Installer {
    modules_dir: PathBuf,
    hardware: HardwareSummary,
    provider: Option<Arc<dyn LLMProvider>>,
    options: PlannerOptions,
}

impl Installer {
    pub fn new(modules_dir: impl Into<PathBuf>, hardware: HardwareSummary) -> Self {
        Self {
            modules_dir: modules_dir.into(),
            hardware,
            provider: None,
            options: PlannerOptions::default(),
        }
    }

    pub fn with_planner(mut self, provider: Option<Arc<dyn LLMProvider>>, options: PlannerOptions) -> Self {
        self.provider = provider;
        self.options = options;
        self
    }

    fn load(&self, module: &str) -> Result<ModuleSpec, InstallError> {
        let name = normalize_module_name(module);
        if name.is_empty() {
            return Err(InstallError::EmptyName);
        }
        Ok(ModuleSpec::load(&self.modules_dir, &name)?)
    }

    /// Resolves the step list without running anything.
    pub async fn plan(&self, module: &str) -> Result<ResolvedInstall, InstallError> {
        let module = self.load(module)?;
        self.resolve(module).await
    }

    async fn resolve(&self, module: ModuleSpec) -> Result<ResolvedInstall, InstallError> {
        let selection = select_mode(&module.name, &module.spec, &self.hardware);
        let baseline = InstallPlan::baseline(&module.name, &module.spec, &selection)?;

        let refinement = InstallRefinement::new(&module.name, &module.spec, &selection);
        let plan = refine(&refinement, baseline, self.provider.as_deref(), &self.options).await?;

        let resolved = ResolvedInstall {
            module,
            selection,
            plan,
        };
        if self.options.debug {
            println!(
                "Install planner: source={} mode={} steps={}",
                resolved.plan.source,
                resolved.plan.value.mode,
                resolved.step_ids()
            );
            if resolved.plan.source == PlanSource::Static && !resolved.plan.reason.trim().is_empty() {
                println!("Install planner fallback reason: {}", resolved.plan.reason);
            }
        }
        Ok(resolved)
    }

    pub async fn install(&self, module: &str) -> Result<InstallReport, InstallError> {
        let module = self.load(module)?;
        run_preconditions(&module.spec.preconditions, &module.dir).await?;

        let resolved = self.resolve(module).await?;
        let ResolvedInstall {
            module,
            selection,
            plan,
        } = resolved;

        let vars = module.spec.template_vars();
        for step in &plan.value.steps {
            tracing::info!("{}: running step {} ({})", module.name, step.id, step.tool);
            run_step(&module.name, &module.dir, step, &vars, &selection.env).await?;
        }

        tracing::info!("{} installed via {} mode", module.name, plan.value.mode);
        Ok(InstallReport {
            steps: plan.value.step_ids().into_iter().map(str::to_string).collect(),
            module: module.name,
            mode: plan.value.mode,
            source: plan.source,
        })
    }

    /// Runs `update.script`, or a full install when the module declares none.
    pub async fn update(&self, module: &str) -> Result<(), InstallError> {
        let spec = self.load(module)?;
        if spec.spec.update.script.trim().is_empty() {
            tracing::info!("{} has no update script, reinstalling", spec.name);
            self.install(&spec.name).await?;
            return Ok(());
        }
        run_hook(&spec, &spec.spec.update, "update").await
    }

    pub async fn uninstall(&self, module: &str) -> Result<(), InstallError> {
        let spec = self.load(module)?;
        run_hook(&spec, &spec.spec.uninstall, "uninstall").await
    }

    /// Validates every declared postcondition of the selected mode without
    /// executing any step.
    pub async fn check(&self, module: &str) -> Result<CheckReport, InstallError> {
        let module = self.load(module)?;
        let selection = select_mode(&module.name, &module.spec, &self.hardware);
        let plan = InstallPlan::baseline(&module.name, &module.spec, &selection)?;

        let mut checked = Vec::new();
        for step in plan.steps.iter().filter(|s| s.expected.has_postcondition()) {
            validate_expected(&module.name, &module.dir, &step.expected)
                .await
                .map_err(|e| InstallError::Check {
                    module: module.name.clone(),
                    id: step.id.clone(),
                    reason: e.to_string(),
                })?;
            checked.push(step.id.clone());
        }
        Ok(CheckReport {
            module: module.name,
            mode: plan.mode,
            checked,
        })
    }
}

/// Compares a finished command against its declared exit code and output.
/// Without a declared exit code any non-zero exit fails.
fn check_output(result: &ShellOutput, expected: &Expected) -> Result<(), String> {
    match expected.exit_code {
        Some(code) if result.exit_code != code => {
            return Err(format!("expected exit code {} but got {}", code, result.exit_code));
        }
        None if !result.success() => return Err(result.failure_message()),
        _ => {}
    }
    if !expected.equals.is_empty() {
        let want = normalized_output(&expected.equals);
        let got = normalized_output(&result.output);
        if want != got {
            return Err(format!("expected {:?} but got {:?}", want, got));
        }
    }
    Ok(())
}

/// Fails fast on the first unmet precondition. Entries without a tool are
/// skipped.
pub async fn run_preconditions(preconditions: &[Precondition], module_dir: &Path) -> Result<(), InstallError> {
    let executor = CommandExecutor::new();
    for pre in preconditions {
        let tool = pre.tool.trim();
        if tool.is_empty() {
            continue;
        }
        if tool != "shell" {
            return Err(InstallError::PreconditionTool {
                id: pre.id.clone(),
                tool: tool.to_string(),
            });
        }
        let failed = |reason: String| InstallError::Precondition {
            id: pre.id.clone(),
            reason,
        };
        let result = executor
            .execute(&pre.command, module_dir)
            .await
            .map_err(|e| failed(e.to_string()))?;
        check_output(&result, &pre.expected).map_err(failed)?;
    }
    Ok(())
}

async fn run_step(
    module: &str,
    module_dir: &Path,
    step: &Step,
    vars: &BTreeMap<String, String>,
    env: &BTreeMap<String, String>,
) -> Result<(), InstallError> {
    let failed = |reason: String| InstallError::Step {
        id: step.id.clone(),
        reason,
    };

    match step.tool.trim() {
        "shell" => {
            let result = CommandExecutor::new()
                .streaming(true)
                .with_env(env)
                .execute(&step.command, module_dir)
                .await
                .map_err(|e| failed(e.to_string()))?;
            check_output(&result, &step.expected).map_err(failed)?;
        }
        "template" => {
            run_template_step(module_dir, &step.edit, vars)
                .await
                .map_err(|e| failed(e.to_string()))?;
        }
        other => {
            return Err(InstallError::StepTool {
                id: step.id.clone(),
                tool: other.to_string(),
            })
        }
    }

    validate_expected(module, module_dir, &step.expected)
        .await
        .map_err(|e| failed(e.to_string()))
}

async fn run_hook(module: &ModuleSpec, hook: &ScriptHook, action: &'static str) -> Result<(), InstallError> {
    let script = hook.script.trim();
    let missing = || InstallError::ScriptMissing {
        module: module.name.clone(),
        action,
    };
    if script.is_empty() {
        return Err(missing());
    }
    let path = Path::new(script);
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        module.dir.join(path)
    };
    if !path.is_file() {
        return Err(missing());
    }

    let result = CommandExecutor::new()
        .streaming(true)
        .execute_script(&path, &module.dir)
        .await
        .map_err(|e| InstallError::Script {
            module: module.name.clone(),
            action,
            reason: e.to_string(),
        })?;
    if !result.success() {
        return Err(InstallError::Script {
            module: module.name.clone(),
            action,
            reason: result.failure_message(),
        });
    }
    tracing::info!("{} {} finished", module.name, action);
    Ok(())
}
