use super::{or_na, render_table, App};
use crate::cli::{OutputFormat, PlannerFlags};
use anyhow::Result;
use las_core::refine::config::{apply_overrides, parse_override, save_plan};
use las_core::{build_static_plan, refine, ConfigPlan, ConfigRefinement, PlanError};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct Request {
    pub module: String,
    pub model: String,
    pub output: OutputFormat,
    pub overrides: Vec<String>,
    pub apply: bool,
    pub dry_run: bool,
    pub planner: PlannerFlags,
}

pub async fn run(app: &App, request: &Request) -> Result<()> {
    let debug = request.planner.planner_debug || app.toggles.config_debug;
    let strict = request.planner.planner_strict || app.toggles.config_strict;

    let plan = build(app, request, debug, strict).await?;
    print!("{}", render(&plan, request.output)?);

    if request.dry_run || !request.apply {
        return Ok(());
    }
    let path = save_plan(&app.settings.config_plan_dir, &plan)?;
    println!("Config plan saved to {}", path.display());
    Ok(())
}

/// Static plan, operator overrides, then optional refinement.
pub async fn build(app: &App, request: &Request, debug: bool, strict: bool) -> Result<ConfigPlan> {
    let hw = app.hardware();
    let mut plan = match build_static_plan(&request.module, &request.model, &hw) {
        Ok(plan) => plan,
        Err(err) => {
            if debug {
                println!("Config planner: source=static reason={}", err);
            }
            if strict {
                return Err(PlanError::Strict {
                    planner: "config planner",
                    source: Box::new(err),
                }
                .into());
            }
            return Err(err.into());
        }
    };

    let overrides = request
        .overrides
        .iter()
        .map(|raw| parse_override(raw))
        .collect::<Result<Vec<_>, _>>()?;
    let pinned = apply_overrides(&mut plan, &overrides)?;

    let refinement = ConfigRefinement::new(&hw).with_pinned(pinned);
    let options = app.settings.planner_options(true, debug, strict);
    let refined = refine(&refinement, plan, app.provider.as_deref(), &options).await?;

    let mut plan = refined.value;
    if refined.source == las_core::PlanSource::Static && !refined.reason.trim().is_empty() {
        plan.reason = refined.reason;
    }
    if debug {
        println!("Config planner: source={} reason={}", plan.source, plan.reason);
    }
    Ok(plan)
}

pub fn render(plan: &ConfigPlan, output: OutputFormat) -> Result<String> {
    match output {
        OutputFormat::Text => Ok(render_text(plan)),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(plan)? + "\n"),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn render_text(plan: &ConfigPlan) -> String {
    let mut out = String::from("Config Plan\n");
    out.push_str(&format!("  Module: {}\n", plan.module));
    if !plan.model.trim().is_empty() {
        out.push_str(&format!("  Model: {}\n", plan.model));
    }
    out.push_str(&format!("  Source: {}\n", plan.source));
    out.push_str(&format!("  Reason: {}\n", plan.reason));
    out.push_str(&format!(
        "  Planner: {}@{} ({})\n",
        plan.planner.name, plan.planner.version, plan.planner.mode
    ));
    out.push_str(&format!(
        "  Hardware: cpu={}, memory_kb={}, gpu={}, gpu_count={}\n",
        plan.context.cpu_cores,
        plan.context.memory_kb,
        or_na(&plan.context.gpu_name),
        plan.context.gpu_count
    ));
    out.push_str(&format!("  GeneratedAt: {}\n", plan.generated_at));
    out.push_str(&format!("  Changes: {}\n", plan.changes.len()));

    if plan.changes.is_empty() {
        return out;
    }
    let rows: Vec<Vec<String>> = plan
        .changes
        .iter()
        .map(|c| vec![c.scope.clone(), c.key.clone(), display_value(&c.value), c.reason.clone()])
        .collect();
    out.push_str(&render_table(&["SCOPE", "KEY", "VALUE", "REASON"], &rows));

    if !plan.warnings.is_empty() {
        out.push_str("Warnings:\n");
        for warning in &plan.warnings {
            out.push_str(&format!("- {}\n", warning));
        }
    }
    out
}
