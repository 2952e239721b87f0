use las_core::{PlanError, SpecError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("module name is required")]
    EmptyName,
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("precondition {id} failed: {reason}")]
    Precondition { id: String, reason: String },
    #[error("precondition {id} uses unsupported tool {tool:?}")]
    PreconditionTool { id: String, tool: String },
    #[error("install step {id} failed: {reason}")]
    Step { id: String, reason: String },
    #[error("install step {id} uses unsupported tool {tool:?}")]
    StepTool { id: String, tool: String },
    #[error("{action} script not found for module {module:?}")]
    ScriptMissing { module: String, action: &'static str },
    #[error("module {module:?} {action} failed: {reason}")]
    Script {
        module: String,
        action: &'static str,
        reason: String,
    },
    #[error("module {module:?} check failed at step {id}: {reason}")]
    Check { module: String, id: String, reason: String },
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{binary} not found in PATH (install the {module} module first)")]
    NotInPath { binary: &'static str, module: &'static str },
    #[error("{var} points to {}, which was not found", .path.display())]
    OverrideNotFound { var: &'static str, path: PathBuf },
    #[error("libmtmd.so.0 not found; reinstall the llama.cpp module or set LD_LIBRARY_PATH to the directory containing libmtmd.so.0 (searched: {searched})")]
    LibraryNotFound { searched: String },
    #[error("failed to start {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        source: std::io::Error,
    },
    #[error("{name} exited with exit status {code}")]
    Exited { name: &'static str, code: i32 },
    #[error("{name} was terminated by a signal")]
    Killed { name: &'static str },
}
