//! Postconditions declared under `expected:` on a step.

use las_core::install_spec::Expected;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExpectError {
    #[error("binary {0:?} not found")]
    BinaryNotFound(String),
    #[error("unit file {} not found", .0.display())]
    UnitMissing(PathBuf),
    #[error("failed to query service state: {0}")]
    ServiceQuery(std::io::Error),
    #[error("expected service state {expected:?} but got {actual:?}")]
    ServiceState { expected: String, actual: String },
}

/// An absolute path must exist, falling back to a PATH lookup of its base
/// name since some installers place binaries elsewhere. A bare name must be
/// on PATH.
pub fn resolve_binary(bin: &str) -> Option<PathBuf> {
    let path = Path::new(bin);
    if path.is_absolute() {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        return path.file_name().and_then(|name| which::which(name).ok());
    }
    which::which(bin).ok()
}

pub async fn validate_expected(module: &str, module_dir: &Path, expected: &Expected) -> Result<(), ExpectError> {
    let bin = expected.bin.trim();
    if !bin.is_empty() && resolve_binary(bin).is_none() {
        return Err(ExpectError::BinaryNotFound(bin.to_string()));
    }

    let unit = expected.unit.trim();
    if !unit.is_empty() {
        let path = Path::new(unit);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            module_dir.join(path)
        };
        if !path.exists() {
            return Err(ExpectError::UnitMissing(path));
        }
    }

    let service = expected.service.trim();
    if !service.is_empty() {
        let output = tokio::process::Command::new("systemctl")
            .args(["is-active", module])
            .output()
            .await
            .map_err(ExpectError::ServiceQuery)?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let actual = combined.trim();
        if actual != service {
            return Err(ExpectError::ServiceState {
                expected: service.to_string(),
                actual: actual.to_string(),
            });
        }
    }
    Ok(())
}
