pub mod config_plan;
pub mod failure;
pub mod model;
pub mod module;
pub mod system;

use crate::cli::{Command, FailureCommand, ModelCommand, SystemCommand};
use crate::config::{Settings, Toggles};
use anyhow::Result;
use las_core::HardwareSummary;
use las_providers::LLMProvider;
use std::sync::Arc;

/// Everything a command needs, resolved once at startup.
pub struct App {
    pub settings: Settings,
    pub toggles: Toggles,
    pub provider: Option<Arc<dyn LLMProvider>>,
}

impl App {
    pub fn new(settings: Settings, toggles: Toggles) -> Self {
        let provider = settings.provider();
        Self {
            settings,
            toggles,
            provider,
        }
    }

    pub fn with_provider(mut self, provider: Option<Arc<dyn LLMProvider>>) -> Self {
        self.provider = provider;
        self
    }

    pub fn hardware(&self) -> HardwareSummary {
        let hw = HardwareSummary::load(&self.settings.base_info_path);
        if hw == HardwareSummary::default() {
            tracing::warn!(
                "no usable base info at {} (run `las system detect`); using conservative defaults",
                self.settings.base_info_path.display()
            );
        }
        hw
    }

    pub async fn dispatch(&self, command: Command) -> Result<()> {
        match command {
            Command::Module { action } => module::run(self, action).await,
            Command::Model {
                action: ModelCommand::Run(args),
            } => model::run(self, &args).await,
            Command::Failure { action } => match action {
                FailureCommand::List {
                    limit,
                    phase,
                    category,
                    output,
                } => failure::list(self, limit, phase, category, output),
                FailureCommand::Show { id } => failure::show(self, &id),
            },
            Command::System {
                action: SystemCommand::Detect { dry_run },
            } => system::detect(self, dry_run).await,
        }
    }
}

/// Left-aligned columns separated by two spaces; the last column is not
/// padded.
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(i) {
                *width = (*width).max(cell.chars().count());
            }
        }
    }

    let mut lines = vec![table_line(headers, &widths)];
    for row in rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        lines.push(table_line(&cells, &widths));
    }
    lines.join("\n") + "\n"
}

fn table_line(cells: &[&str], widths: &[usize]) -> String {
    let last = cells.len().saturating_sub(1);
    let mut out = String::new();
    for (i, cell) in cells.iter().enumerate() {
        out.push_str(cell);
        if i < last {
            let width = widths.get(i).copied().unwrap_or(0);
            out.push_str(&" ".repeat(width.saturating_sub(cell.chars().count()) + 2));
        }
    }
    out.trim_end().to_string()
}

pub fn or_na(value: &str) -> &str {
    if value.trim().is_empty() {
        "n/a"
    } else {
        value
    }
}
