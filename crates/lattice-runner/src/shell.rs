//! Shell-based command execution on the host.

use async_trait::async_trait;
use lattice_core::ports::{ExecOutput, ExecRequest, Executor};
use lattice_core::{Error, Result};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, trace, warn};

/// Executor that runs commands through a local shell (`<shell> -c`).
///
/// The child is killed when the returned future is dropped, which is how
/// cancellation reaches a running command.
pub struct ShellExecutor {
    inherit_env: bool,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self { inherit_env: true }
    }

    /// Start children with only the request's environment.
    pub fn isolated() -> Self {
        Self { inherit_env: false }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, request: &ExecRequest) -> Result<ExecOutput> {
        debug!(
            command = %request.command,
            cwd = %request.working_directory.display(),
            shell = %request.shell,
            "Executing shell command"
        );

        let mut command = Command::new(&request.shell);
        if !self.inherit_env {
            command.env_clear();
        }
        command
            .arg("-c")
            .arg(&request.command)
            .current_dir(&request.working_directory)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            Error::Infrastructure(format!("failed to spawn {}: {}", request.shell, e))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Infrastructure("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Infrastructure("stderr was not captured".to_string()))?;

        let (stdout, stderr, status) =
            tokio::join!(collect_lines(stdout, "stdout"), collect_lines(stderr, "stderr"), child.wait());

        let status = status
            .map_err(|e| Error::Infrastructure(format!("failed to wait for process: {}", e)))?;
        let exit_code = status.code().unwrap_or(-1);

        debug!(exit_code, "Command completed");

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

/// Reads the stream to its end. Bytes that are not UTF-8 are replaced, and
/// reading continues so the child never sees a closed pipe.
async fn collect_lines<R: AsyncRead + Unpin>(reader: R, stream: &'static str) -> String {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut out = String::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                trace!(stream, line = %line);
                out.push_str(line);
                out.push('\n');
            }
            Err(e) => {
                warn!(stream, error = %e, "Failed to read command output");
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn request(command: &str) -> ExecRequest {
        ExecRequest {
            command: command.to_string(),
            env: HashMap::from([("GREETING".to_string(), "hello".to_string())]),
            working_directory: std::env::temp_dir(),
            shell: "sh".to_string(),
        }
    }

    #[tokio::test]
    async fn test_shell_executor_success() {
        let output = ShellExecutor::new()
            .execute(&request("echo $GREETING; echo oops >&2"))
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_shell_executor_failure() {
        let output = ShellExecutor::new().execute(&request("exit 3")).await.unwrap();
        assert!(!output.success());
        assert_eq!(output.exit_code, 3);
    }

    #[tokio::test]
    async fn test_missing_directory_is_infrastructure() {
        let mut req = request("true");
        req.working_directory = PathBuf::from("/definitely/not/here");
        let err = ShellExecutor::new().execute(&req).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_binary_output_does_not_break_pipe() {
        let output = ShellExecutor::new()
            .execute(&request("printf '\\377\\n'; seq 1 200000; echo done"))
            .await
            .unwrap();

        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.starts_with("\u{FFFD}\n1\n"));
        assert!(output.stdout.ends_with("200000\ndone\n"));
    }

    #[tokio::test]
    async fn test_dropping_future_stops_command() {
        let executor = ShellExecutor::new();
        let req = request("sleep 30");
        let res = tokio::time::timeout(Duration::from_millis(100), executor.execute(&req)).await;
        assert!(res.is_err());
    }
}
