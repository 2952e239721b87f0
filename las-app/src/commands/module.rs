use super::{config_plan, App};
use crate::cli::{ModuleCommand, PlannerFlags};
use anyhow::Result;
use las_executor::{Installer, ResolvedInstall};

fn installer(app: &App, flags: &PlannerFlags) -> Installer {
    let debug = flags.planner_debug || app.toggles.install_debug;
    let strict = flags.planner_strict || app.toggles.install_strict;
    Installer::new(&app.settings.modules_dir, app.hardware())
        .with_planner(app.provider.clone(), app.settings.planner_options(true, debug, strict))
}

pub async fn run(app: &App, action: ModuleCommand) -> Result<()> {
    match action {
        ModuleCommand::Install { name, planner, dry_run } => {
            let installer = installer(app, &planner);
            if dry_run {
                let resolved = installer.plan(&name).await?;
                print!("{}", render_install_plan(&resolved));
                return Ok(());
            }
            println!("Installing module: {}", name);
            let report = installer.install(&name).await?;
            tracing::info!(
                "installed {} with {} steps (mode={}, planner={})",
                report.module,
                report.steps.len(),
                report.mode,
                report.source
            );
            println!("Module {} installed successfully.", name);
        }
        ModuleCommand::Update { name, planner } => {
            println!("Updating module: {}", name);
            installer(app, &planner).update(&name).await?;
            println!("Module {} updated successfully.", name);
        }
        ModuleCommand::Uninstall { name } => {
            println!("Uninstalling module: {}", name);
            installer(app, &PlannerFlags::default()).uninstall(&name).await?;
            println!("Module {} uninstalled successfully.", name);
        }
        ModuleCommand::Check { name } => {
            let report = installer(app, &PlannerFlags::default()).check(&name).await?;
            tracing::debug!("checked {:?} for {} ({})", report.checked, report.module, report.mode);
            println!("Module {} is installed and healthy.", name);
        }
        ModuleCommand::ConfigPlan {
            module,
            model,
            output,
            overrides,
            apply,
            dry_run,
            planner,
        } => {
            let request = config_plan::Request {
                module,
                model,
                output,
                overrides,
                apply,
                dry_run,
                planner,
            };
            config_plan::run(app, &request).await?;
        }
    }
    Ok(())
}

/// What `install --dry-run` prints.
pub fn render_install_plan(resolved: &ResolvedInstall) -> String {
    let mut out = format!(
        "Install Plan\n  Module: {}\n  Mode: {}\n  Source: {}\n",
        resolved.module.name, resolved.plan.value.mode, resolved.plan.source
    );
    if !resolved.plan.reason.trim().is_empty() {
        out.push_str(&format!("  Reason: {}\n", resolved.plan.reason));
    }
    out.push_str(&format!("  Steps: {}\n", resolved.plan.value.steps.len()));
    for step in &resolved.plan.value.steps {
        let detail = if !step.intent.trim().is_empty() {
            step.intent.trim()
        } else {
            step.command.trim()
        };
        if detail.is_empty() {
            out.push_str(&format!("- {} [{}]\n", step.id, step.tool));
        } else {
            out.push_str(&format!("- {} [{}]: {}\n", step.id, step.tool, detail));
        }
    }
    out
}
