use clap::Parser;
use las_app::cli::Cli;
use las_app::commands::App;
use las_app::config::{Settings, Toggles};
use las_failure::{record_best_effort, FailureEvent, Phase};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("las=info,warn")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    let toggles = Toggles::from_env();
    let scope = cli.command.failure_scope();
    let app = App::new(settings, toggles);

    let result = tokio::select! {
        result = app.dispatch(cli.command) => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("operation cancelled by signal")),
    };

    let Err(err) = result else {
        return ExitCode::SUCCESS;
    };

    if let Some(scope) = scope {
        let message = format!("{:#}", err);
        let phase = Phase::infer(scope.phase, &message);
        let event = FailureEvent::new(phase, message)
            .with_module(scope.module)
            .with_model(scope.model)
            .with_provider(app.settings.provider_name())
            .with_message(scope.message)
            .with_context("planner_model", app.settings.llm_model());
        let recorded = record_best_effort(&app.settings.failure_dir, event);
        if app.toggles.failure_debug {
            println!("{}", recorded.debug_line());
        }
    }
    eprintln!("Error: {:#}", err);
    ExitCode::FAILURE
}
