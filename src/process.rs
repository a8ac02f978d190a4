//! External Command Execution
//!
//! Runs the OS networking toolchain and captures its output. A
//! non-zero exit is never an error here; callers inspect the captured
//! status and decide severity. Only a failure to spawn (or a timer
//! expiry) surfaces through the output itself.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::Result;

/// Captured result of one external command invocation
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code; None when the process was killed by a signal or the
    /// invocation timed out
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    fn timed_out(limit: Duration) -> Self {
        Self {
            status: None,
            stdout: String::new(),
            stderr: format!("command timed out after {:?}", limit),
        }
    }
}

/// Abstraction over command execution so the controller can be tested
/// without touching the host network stack.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command, capturing output. Non-zero exit is reported in
    /// the output, not as an error.
    async fn run(&self, argv: &[&str]) -> Result<CommandOutput>;

    /// Run a command feeding `input` to its stdin.
    async fn run_with_input(&self, argv: &[&str], input: &str) -> Result<CommandOutput>;
}

/// Prepend a privilege-elevation prefix when the calling principal is
/// not root.
pub fn elevated_argv<'a>(elevate: bool, argv: &[&'a str]) -> Vec<&'a str> {
    if elevate {
        let mut full = Vec::with_capacity(argv.len() + 1);
        full.push("sudo");
        full.extend_from_slice(argv);
        full
    } else {
        argv.to_vec()
    }
}

/// Command runner invoking real host processes
pub struct SystemRunner {
    elevate: bool,
    limit: Duration,
}

impl SystemRunner {
    pub fn new(limit: Duration) -> Self {
        Self {
            elevate: !nix::unistd::Uid::effective().is_root(),
            limit,
        }
    }
}

#[async_trait::async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, argv: &[&str]) -> Result<CommandOutput> {
        let argv = elevated_argv(self.elevate, argv);
        tracing::debug!("exec: {}", argv.join(" "));

        let mut cmd = Command::new(argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out child must not keep running concurrently with
            // later invocations; dropping the future kills it.
            .kill_on_drop(true);

        match timeout(self.limit, cmd.output()).await {
            Ok(output) => {
                let output = output?;
                Ok(CommandOutput {
                    status: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            Err(_) => {
                tracing::warn!("command timed out: {}", argv.join(" "));
                Ok(CommandOutput::timed_out(self.limit))
            }
        }
    }

    async fn run_with_input(&self, argv: &[&str], input: &str) -> Result<CommandOutput> {
        let argv = elevated_argv(self.elevate, argv);
        tracing::debug!("exec (with stdin): {}", argv.join(" "));

        let mut cmd = Command::new(argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let run = async {
            let mut child = cmd.spawn()?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
            }
            child.wait_with_output().await
        };

        match timeout(self.limit, run).await {
            Ok(output) => {
                let output = output?;
                Ok(CommandOutput {
                    status: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            Err(_) => {
                tracing::warn!("command timed out: {}", argv.join(" "));
                Ok(CommandOutput::timed_out(self.limit))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elevation_prefix() {
        assert_eq!(
            elevated_argv(true, &["wg-quick", "up", "wg0"]),
            vec!["sudo", "wg-quick", "up", "wg0"]
        );
        assert_eq!(
            elevated_argv(false, &["wg-quick", "up", "wg0"]),
            vec!["wg-quick", "up", "wg0"]
        );
    }

    #[tokio::test]
    async fn test_timed_out_child_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("sleep 1; touch {}", marker.display());
        let runner = SystemRunner {
            elevate: false,
            limit: Duration::from_millis(100),
        };

        let out = runner.run(&["sh", "-c", &script]).await.unwrap();
        assert!(!out.success());
        assert!(out.status.is_none());

        // The child must die with the timed-out invocation, not finish
        // later and mutate state behind a subsequent one.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_timed_out_stdin_child_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("sleep 1; touch {}", marker.display());
        let runner = SystemRunner {
            elevate: false,
            limit: Duration::from_millis(100),
        };

        let out = runner
            .run_with_input(&["sh", "-c", &script], "ignored")
            .await
            .unwrap();
        assert!(!out.success());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!marker.exists());
    }

    #[test]
    fn test_success_classification() {
        let ok = CommandOutput {
            status: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        };
        let failed = CommandOutput {
            status: Some(1),
            stdout: String::new(),
            stderr: "boom".into(),
        };
        let killed = CommandOutput::timed_out(Duration::from_secs(1));
        assert!(ok.success());
        assert!(!failed.success());
        assert!(!killed.success());
    }
}
