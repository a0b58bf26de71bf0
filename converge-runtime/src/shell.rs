//! Subprocess adaptor used by guard commands and the exec resource kind.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use converge_core::error::{Error, Result};

/// One command invocation: either a direct argv, or a command line handed
/// to a shell with `-c`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdSpec {
    pub cmd: String,
    /// Explicit argv tail; only valid without `shell`.
    pub args: Vec<String>,
    /// Shell binary to interpret `cmd`, e.g. `/bin/bash`.
    pub shell: Option<String>,
    pub cwd: Option<PathBuf>,
}

impl CmdSpec {
    #[must_use]
    pub fn line(cmd: &str) -> Self {
        Self {
            cmd: cmd.to_owned(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn sh(cmd: &str, shell: &str) -> Self {
        Self {
            cmd: cmd.to_owned(),
            shell: Some(shell.to_owned()),
            ..Self::default()
        }
    }

    /// How the invocation reads in error messages.
    #[must_use]
    pub fn display(&self) -> String {
        match &self.shell {
            Some(shell) => format!("{shell} -c {:?}", self.cmd),
            None if self.args.is_empty() => self.cmd.clone(),
            None => format!("{} {}", self.cmd, self.args.join(" ")),
        }
    }

    /// Builds the ready-to-spawn command: piped stdout/stderr, no stdin,
    /// killed if the child handle drops. Callers that stream (watch loops)
    /// spawn this themselves instead of going through a [`ShellRunner`].
    pub fn command(&self) -> Result<Command> {
        let mut command = match &self.shell {
            Some(shell) => {
                let mut c = Command::new(shell);
                c.arg("-c").arg(&self.cmd);
                c
            }
            None if !self.args.is_empty() => {
                let mut c = Command::new(&self.cmd);
                c.args(&self.args);
                c
            }
            None => {
                let mut parts = self.cmd.split_whitespace();
                let program = parts
                    .next()
                    .ok_or_else(|| Error::validation("empty command"))?;
                let mut c = Command::new(program);
                c.args(parts);
                c
            }
        };
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(command)
    }
}

/// Captured output of a completed command.
#[derive(Debug)]
pub struct CmdOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Both streams in arrival order, the way a terminal would show them.
    pub combined: Vec<u8>,
}

impl CmdOutput {
    #[must_use]
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    #[must_use]
    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    #[must_use]
    pub fn combined_string(&self) -> String {
        String::from_utf8_lossy(&self.combined).into_owned()
    }
}

/// The shell adaptor seam; swapped out in tests that must not fork.
#[async_trait]
pub trait ShellRunner: Send + Sync {
    /// Runs the command to completion, killing it if `timeout` elapses or
    /// `token` fires first. The returned status still needs
    /// [`classify_status`] — completing with a non-zero exit is not an
    /// error at this layer.
    async fn run(
        &self,
        spec: &CmdSpec,
        timeout: Option<Duration>,
        token: &CancellationToken,
    ) -> Result<CmdOutput>;
}

/// Real subprocess execution via `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShell;

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut(Duration),
}

#[async_trait]
impl ShellRunner for SystemShell {
    async fn run(
        &self,
        spec: &CmdSpec,
        timeout: Option<Duration>,
        token: &CancellationToken,
    ) -> Result<CmdOutput> {
        let mut child = spec
            .command()?
            .spawn()
            .map_err(|err| Error::apply(format!("failed to spawn {}: {err}", spec.display())))?;
        let mut out_pipe = child.stdout.take().expect("stdout was piped");
        let mut err_pipe = child.stderr.take().expect("stderr was piped");

        let combined = Mutex::new(Vec::new());
        let read_out = async {
            let mut buf = Vec::new();
            let mut chunk = [0_u8; 4096];
            while let Ok(n) = out_pipe.read(&mut chunk).await {
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                combined.lock().extend_from_slice(&chunk[..n]);
            }
            buf
        };
        let read_err = async {
            let mut buf = Vec::new();
            let mut chunk = [0_u8; 4096];
            while let Ok(n) = err_pipe.read(&mut chunk).await {
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                combined.lock().extend_from_slice(&chunk[..n]);
            }
            buf
        };
        let waited = async {
            tokio::select! {
                status = child.wait() => Waited::Exited(status),
                () = token.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    Waited::Cancelled
                }
                () = deadline(timeout) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    Waited::TimedOut(timeout.expect("deadline only fires with a timeout"))
                }
            }
        };

        let (waited, stdout, stderr) = tokio::join!(waited, read_out, read_err);
        match waited {
            Waited::Exited(Ok(status)) => Ok(CmdOutput {
                status,
                stdout,
                stderr,
                combined: combined.into_inner(),
            }),
            // A wait that fails after a successful spawn has no sensible
            // status to report; treat it as an impossible state.
            Waited::Exited(Err(err)) => Err(Error::Programming(format!(
                "wait failed for {}: {err}",
                spec.display()
            ))),
            Waited::Cancelled => Err(Error::Cancelled),
            Waited::TimedOut(d) => Err(Error::Timeout(d)),
        }
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Maps a completed command's exit status onto the error taxonomy: success
/// is fine, a non-zero code is an apply failure, a bare signal is an apply
/// failure of unknown cause.
pub fn classify_status(spec: &CmdSpec, status: ExitStatus) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    if let Some(code) = status.code() {
        return Err(Error::apply(format!(
            "{} exited with status {code}",
            spec.display()
        )));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Err(Error::apply(format!(
                "{} killed by unknown signal {signal}",
                spec.display()
            )));
        }
    }
    Err(Error::Programming(format!(
        "{} finished with neither exit code nor signal",
        spec.display()
    )))
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tokio_util::sync::CancellationToken;

    use super::{classify_status, CmdSpec, ShellRunner, SystemShell};
    use converge_core::error::Error;

    #[tokio::test]
    async fn captures_stdout_stderr_and_combined() {
        let spec = CmdSpec::sh("echo out && echo err 1>&2", "/bin/sh");
        let out = SystemShell
            .run(&spec, None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.status.success());
        assert_eq!(out.stdout_string(), "out\n");
        assert_eq!(out.stderr_string(), "err\n");
        let combined = out.combined_string();
        assert!(combined.contains("out\n"));
        assert!(combined.contains("err\n"));
    }

    #[tokio::test]
    async fn nonzero_exit_classifies_as_apply() {
        let spec = CmdSpec::sh("exit 3", "/bin/sh");
        let out = SystemShell
            .run(&spec, None, &CancellationToken::new())
            .await
            .unwrap();
        let err = classify_status(&spec, out.status).unwrap_err();
        assert!(matches!(err, Error::Apply(msg) if msg.contains("status 3")));
    }

    #[tokio::test]
    async fn timeout_kills_and_reports() {
        let spec = CmdSpec::line("sleep 300");
        let begin = Instant::now();
        let err = SystemShell
            .run(&spec, Some(Duration::from_millis(200)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(begin.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_kills_and_reports() {
        let token = CancellationToken::new();
        let killer = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            killer.cancel();
        });
        let err = SystemShell
            .run(&CmdSpec::line("sleep 300"), None, &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn direct_argv_runs_without_a_shell() {
        let spec = CmdSpec {
            cmd: "echo".into(),
            args: vec!["hello".into(), "world".into()],
            ..CmdSpec::default()
        };
        let out = SystemShell
            .run(&spec, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout_string(), "hello world\n");
    }

    #[test]
    fn empty_command_is_a_validation_error() {
        let spec = CmdSpec::line("   ");
        assert!(matches!(spec.command(), Err(Error::Validation(_))));
    }
}
