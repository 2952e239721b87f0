//! Spawns a serving runtime in the foreground.

use crate::error::LaunchError;
use las_core::RuntimeKind;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;

const LIBMTMD_NAMES: &[&str] = &["libmtmd.so.0", "libmtmd.so"];

/// The runtime binary: the override variable when set, otherwise a PATH
/// lookup.
pub fn resolve_runtime_binary(kind: RuntimeKind) -> Result<PathBuf, LaunchError> {
    if let Some(raw) = std::env::var_os(kind.binary_env()).filter(|v| !v.is_empty()) {
        let path = PathBuf::from(raw);
        if path.is_file() {
            return Ok(path);
        }
        return Err(LaunchError::OverrideNotFound {
            var: kind.binary_env(),
            path,
        });
    }
    which::which(kind.binary()).map_err(|_| LaunchError::NotInPath {
        binary: kind.binary(),
        module: kind.name(),
    })
}

/// Install locations checked for llama.cpp's shared libraries.
pub fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = [
        "/usr/local/llama.cpp/build/bin",
        "/usr/local/llama.cpp/build/lib",
        "/usr/local/llama.cpp/bin",
        "/usr/local/llama.cpp/lib",
        "/usr/local/llama.cpp",
        "/usr/local/lib",
        "/usr/lib",
        "/usr/lib/x86_64-linux-gnu",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join("llama.cpp/build/bin"));
        candidates.push(home.join("llama.cpp/build/lib"));
    }
    candidates
}

pub fn find_library_dir(candidates: &[PathBuf]) -> Option<&Path> {
    candidates
        .iter()
        .find(|dir| LIBMTMD_NAMES.iter().any(|name| dir.join(name).is_file()))
        .map(PathBuf::as_path)
}

/// `dir` prepended to an existing search path unless already present.
pub fn prepend_library_path(current: Option<OsString>, dir: &Path) -> OsString {
    let mut paths: Vec<PathBuf> = current
        .as_deref()
        .map(|value| std::env::split_paths(value).filter(|p| !p.as_os_str().is_empty()).collect())
        .unwrap_or_default();
    if !paths.iter().any(|p| p == dir) {
        paths.insert(0, dir.to_path_buf());
    }
    std::env::join_paths(paths).unwrap_or_else(|_| dir.as_os_str().to_os_string())
}

/// Runs the server with inherited stdio until it exits. `env` entries are
/// `KEY=VALUE`. Dropping the future kills the child.
pub async fn launch(kind: RuntimeKind, binary: &Path, args: &[String], env: &[String]) -> Result<(), LaunchError> {
    let mut cmd = Command::new(binary);
    cmd.args(args).kill_on_drop(true);
    for entry in env {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }

    if kind == RuntimeKind::LlamaCpp {
        let candidates = candidate_lib_dirs();
        let dir = find_library_dir(&candidates).ok_or_else(|| LaunchError::LibraryNotFound {
            searched: candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })?;
        cmd.env("LD_LIBRARY_PATH", prepend_library_path(std::env::var_os("LD_LIBRARY_PATH"), dir));
    }

    tracing::info!("launching {} {}", binary.display(), args.join(" "));
    let status = cmd.status().await.map_err(|source| LaunchError::Spawn {
        binary: binary.to_path_buf(),
        source,
    })?;
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(LaunchError::Exited {
            name: kind.binary(),
            code,
        }),
        None => Err(LaunchError::Killed { name: kind.binary() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepend_library_path() {
        let dir = Path::new("/opt/llama/lib");
        assert_eq!(prepend_library_path(None, dir), OsString::from("/opt/llama/lib"));
        assert_eq!(
            prepend_library_path(Some(OsString::from("/usr/lib")), dir),
            OsString::from("/opt/llama/lib:/usr/lib")
        );
        assert_eq!(
            prepend_library_path(Some(OsString::from("/usr/lib:/opt/llama/lib")), dir),
            OsString::from("/usr/lib:/opt/llama/lib")
        );
    }

    #[test]
    fn test_find_library_dir() {
        let empty = tempfile::tempdir().unwrap();
        let with_lib = tempfile::tempdir().unwrap();
        std::fs::write(with_lib.path().join("libmtmd.so.0"), "").unwrap();
        let candidates = vec![empty.path().to_path_buf(), with_lib.path().to_path_buf()];
        assert_eq!(find_library_dir(&candidates), Some(with_lib.path()));
        assert_eq!(find_library_dir(&candidates[..1]), None);
    }

    #[tokio::test]
    async fn test_launch_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-vllm");
        std::fs::write(&script, "#!/bin/sh\n[ \"$FAKE\" = yes ] && exit 4\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        launch(RuntimeKind::Vllm, &script, &[], &[]).await.unwrap();
        let err = launch(RuntimeKind::Vllm, &script, &[], &["FAKE=yes".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "vllm exited with exit status 4");
    }

    #[test]
    fn test_missing_binary_message() {
        let err = LaunchError::NotInPath {
            binary: RuntimeKind::LlamaCpp.binary(),
            module: RuntimeKind::LlamaCpp.name(),
        };
        assert_eq!(
            err.to_string(),
            "llama-server not found in PATH (install the llama.cpp module first)"
        );
    }
}
