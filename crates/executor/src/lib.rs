//! Side-effecting half of the stack: runs install plans, renders templates,
//! checks postconditions, snapshots the host and launches serving runtimes.

pub mod command_executor;
pub mod environment;
pub mod error;
pub mod expect;
pub mod installer;
pub mod launcher;
pub mod template;

pub use command_executor::{CommandExecutor, ShellOutput};
pub use environment::HostSnapshot;
pub use error::{InstallError, LaunchError};
pub use installer::{CheckReport, InstallReport, Installer, ResolvedInstall};
pub use launcher::{launch, resolve_runtime_binary};
