//! `template` install steps: render a file from the module's configuration
//! defaults and write it into place.

use las_core::install_spec::Edit;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

static DEFAULT_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\{\{\s*([a-zA-Z0-9_]+)\s*\|\s*default\("([^"]*)"\)\s*\}\}"#).expect("static regex")
});
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*([a-zA-Z0-9_]+)\s*\}\}").expect("static regex"));

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template path is required")]
    MissingTemplate,
    #[error("template destination is required")]
    MissingDestination,
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Substitutes `{{var}}` and `{{var|default("x")}}`. A default applies when
/// the variable is missing or blank; a plain placeholder for a missing
/// variable renders empty.
pub fn render(content: &str, vars: &BTreeMap<String, String>) -> String {
    let with_defaults = DEFAULT_PLACEHOLDER.replace_all(content, |caps: &Captures| match vars.get(&caps[1]) {
        Some(value) if !value.trim().is_empty() => value.clone(),
        _ => caps[2].to_string(),
    });
    PLACEHOLDER
        .replace_all(&with_defaults, |caps: &Captures| {
            vars.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

fn resolve(module_dir: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        module_dir.join(path)
    }
}

/// Renders `edit.template` into `edit.destination`, both relative to the
/// module directory unless absolute. Returns the written path.
pub async fn run_template_step(
    module_dir: &Path,
    edit: &Edit,
    vars: &BTreeMap<String, String>,
) -> Result<PathBuf, TemplateError> {
    let template = edit.template.trim();
    if template.is_empty() {
        return Err(TemplateError::MissingTemplate);
    }
    let source = resolve(module_dir, template);
    let content = tokio::fs::read_to_string(&source)
        .await
        .map_err(|e| TemplateError::Io { path: source.clone(), source: e })?;

    let destination = edit.destination.trim();
    if destination.is_empty() {
        return Err(TemplateError::MissingDestination);
    }
    let target = resolve(module_dir, destination);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TemplateError::Io { path: parent.to_path_buf(), source: e })?;
    }
    tokio::fs::write(&target, render(&content, vars))
        .await
        .map_err(|e| TemplateError::Io { path: target.clone(), source: e })?;

    tracing::debug!("rendered {} -> {}", source.display(), target.display());
    Ok(target)
}
