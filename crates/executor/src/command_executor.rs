use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x1b\x07]*(?:\x07|\x1b\\)|\x1b[@-_]").expect("static regex")
});

/// Set for every command unless the caller's environment already has them.
const NON_INTERACTIVE_ENV: &[(&str, &str)] = &[("NO_COLOR", "1"), ("CLICOLOR", "0"), ("CLICOLOR_FORCE", "0")];

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to start bash: {0}")]
    Spawn(std::io::Error),
    #[error("failed to read command output: {0}")]
    Output(std::io::Error),
}

/// Combined output and exit code of one finished command. A command killed by
/// a signal reports exit code -1.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub output: String,
    pub exit_code: i32,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Error text for a non-zero exit, keeping the `exit status N` phrase the
    /// failure classifier reads.
    pub fn failure_message(&self) -> String {
        let output = normalized_output(&self.output);
        if output.is_empty() {
            format!("exit status {}", self.exit_code)
        } else {
            format!("exit status {}: {}", self.exit_code, output)
        }
    }
}

/// Runs module commands through `bash` in the module directory.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    env: BTreeMap<String, String>,
    stream: bool,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo output to stdout while capturing it.
    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub async fn execute(&self, command: &str, dir: &Path) -> Result<ShellOutput, ExecutorError> {
        tracing::info!("Executing command in {}: {}", dir.display(), command);
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        self.run(cmd, dir).await
    }

    pub async fn execute_script(&self, script: &Path, dir: &Path) -> Result<ShellOutput, ExecutorError> {
        tracing::info!("Executing script {}", script.display());
        let mut cmd = Command::new("bash");
        cmd.arg(script);
        self.run(cmd, dir).await
    }

    async fn run(&self, mut cmd: Command, dir: &Path) -> Result<ShellOutput, ExecutorError> {
        cmd.current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in NON_INTERACTIVE_ENV {
            if std::env::var_os(key).is_none() {
                cmd.env(key, value);
            }
        }
        cmd.envs(&self.env);

        let mut child = cmd.spawn().map_err(ExecutorError::Spawn)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (out, err, status) = tokio::join!(pump(stdout, self.stream), pump(stderr, self.stream), child.wait());
        let status = status.map_err(ExecutorError::Output)?;
        let mut output = out.map_err(ExecutorError::Output)?;
        output.push_str(&err.map_err(ExecutorError::Output)?);

        Ok(ShellOutput {
            output,
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, echo: bool) -> std::io::Result<String> {
    let Some(reader) = reader else {
        return Ok(String::new());
    };
    let mut reader = BufReader::new(reader);
    let mut collected = String::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&line);
        if echo {
            print!("{}", text);
        }
        collected.push_str(&text);
    }
    Ok(collected)
}

/// ANSI escapes removed, line endings unified, surrounding whitespace trimmed.
pub fn normalized_output(output: &str) -> String {
    let cleaned = ANSI_ESCAPE.replace_all(output, "");
    cleaned.replace("\r\n", "\n").replace('\r', "\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let result = CommandExecutor::new()
            .execute("echo hello; echo oops >&2; exit 3", dir.path())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(result.output.contains("hello"));
        assert!(result.output.contains("oops"));
        assert!(result.failure_message().starts_with("exit status 3: "));
    }

    #[tokio::test]
    async fn test_runs_in_module_dir_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = BTreeMap::new();
        env.insert("LLAMA_CUDA".to_string(), "1".to_string());
        let result = CommandExecutor::new()
            .with_env(&env)
            .execute("pwd; echo cuda=$LLAMA_CUDA", dir.path())
            .await
            .unwrap();
        assert!(result.success());
        assert!(result.output.contains("cuda=1"));
        let canonical = dir.path().canonicalize().unwrap();
        assert!(result.output.contains(canonical.to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_no_color_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let result = CommandExecutor::new()
            .execute("echo ${CLICOLOR_FORCE:-unset}", dir.path())
            .await
            .unwrap();
        let expected = std::env::var("CLICOLOR_FORCE").unwrap_or_else(|_| "0".to_string());
        assert_eq!(normalized_output(&result.output), expected);
    }

    #[tokio::test]
    async fn test_silent_failure_message() {
        let dir = tempfile::tempdir().unwrap();
        let result = CommandExecutor::new().execute("exit 6", dir.path()).await.unwrap();
        assert_eq!(result.failure_message(), "exit status 6");
    }

    #[test]
    fn test_normalized_output() {
        assert_eq!(normalized_output("\x1b[32mok\x1b[0m\r\n"), "ok");
        assert_eq!(normalized_output("a\rb\n"), "a\nb");
    }
}
