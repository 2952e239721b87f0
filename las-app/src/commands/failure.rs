use super::{render_table, App};
use crate::cli::OutputFormat;
use anyhow::Result;
use las_failure::{find_event, list_events, EventQuery, FailureEvent, Phase};
use serde_json::json;

pub fn list(
    app: &App,
    limit: usize,
    phase: Option<Phase>,
    category: Option<String>,
    output: OutputFormat,
) -> Result<()> {
    let query = EventQuery {
        limit,
        phase,
        category,
    };
    let events = list_events(&app.settings.failure_dir, &query)?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&events)?),
        OutputFormat::Text => print!("{}", render_events(&events)),
    }
    Ok(())
}

pub fn render_events(events: &[FailureEvent]) -> String {
    if events.is_empty() {
        return "No failure records found.\n".to_string();
    }
    let rows: Vec<Vec<String>> = events
        .iter()
        .map(|event| {
            let (category, retryable) = event
                .classification
                .as_ref()
                .map(|c| (c.category.as_str().to_string(), c.retryable.to_string()))
                .unwrap_or_default();
            vec![
                event.id.clone(),
                event.timestamp.clone(),
                event.phase.to_string(),
                category,
                retryable,
                event.module.clone(),
                event.model.clone(),
            ]
        })
        .collect();
    render_table(
        &["ID", "TIME", "PHASE", "CATEGORY", "RETRYABLE", "MODULE", "MODEL"],
        &rows,
    )
}

pub fn show(app: &App, id: &str) -> Result<()> {
    let mut event = find_event(&app.settings.failure_dir, id)?;
    let advice = event.advice();
    println!("{}", serde_json::to_string_pretty(&json!({ "event": event, "advice": advice }))?);
    Ok(())
}
