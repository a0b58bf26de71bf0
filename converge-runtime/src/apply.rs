//! Pieces of the check-apply pipeline shared by resource kinds: guard
//! predicates, the last-ran marker, and deadline/interrupt bounding.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use converge_core::error::{Error, Result};

use crate::shell::{CmdSpec, ShellRunner};

const MARKER: &str = "last_ran";

/// Outcome of guard evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// A guard says the apply is not needed this call.
    Skip,
    /// No guard objects; normal observe/apply logic decides.
    Proceed,
    /// A force predicate fired; apply regardless of cached state.
    Forced,
}

/// The `if` / `not-if` / `creates` / `mtimes` predicates gating an apply.
#[derive(Debug, Clone, Default)]
pub struct Guards {
    /// Run before applying; a non-zero exit skips the apply.
    pub if_cmd: Option<String>,
    pub if_shell: Option<String>,
    /// When set, the `if` command's stdout must additionally match this
    /// string (trailing newline ignored) for the apply to run.
    pub if_equals: Option<String>,
    /// Mirror of `if`: a zero exit skips the apply.
    pub not_if_cmd: Option<String>,
    pub not_if_shell: Option<String>,
    /// Skip the apply when this path exists.
    pub creates: Option<PathBuf>,
    /// Force the apply when any of these paths is newer than the stored
    /// last-ran marker.
    pub mtimes: Vec<PathBuf>,
}

impl Guards {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.if_cmd.is_none()
            && self.not_if_cmd.is_none()
            && self.creates.is_none()
            && self.mtimes.is_empty()
    }

    /// Evaluates the predicates in pipeline order: the `mtimes` force check
    /// first (a hit overrides every later guard), then `if`, `not-if`,
    /// `creates`.
    pub async fn evaluate(
        &self,
        shell: &dyn ShellRunner,
        last_ran: Option<SystemTime>,
        token: &CancellationToken,
    ) -> Result<Gate> {
        if self.mtimes_force(last_ran) {
            return Ok(Gate::Forced);
        }

        if let Some(cmd) = &self.if_cmd {
            let spec = guard_spec(cmd, self.if_shell.as_deref());
            let out = shell.run(&spec, None, token).await?;
            if !out.status.success() {
                tracing::debug!(cmd = %spec.display(), "if guard declined, skipping apply");
                return Ok(Gate::Skip);
            }
            if let Some(expected) = &self.if_equals {
                let stdout = out.stdout_string();
                if stdout.trim_end_matches('\n') != expected {
                    tracing::debug!(cmd = %spec.display(), "if guard output mismatch, skipping apply");
                    return Ok(Gate::Skip);
                }
            }
        }

        if let Some(cmd) = &self.not_if_cmd {
            let spec = guard_spec(cmd, self.not_if_shell.as_deref());
            let out = shell.run(&spec, None, token).await?;
            if out.status.success() {
                tracing::debug!(cmd = %spec.display(), "not-if guard fired, skipping apply");
                return Ok(Gate::Skip);
            }
        }

        if let Some(path) = &self.creates {
            if path.exists() {
                tracing::debug!(path = %path.display(), "creates path present, skipping apply");
                return Ok(Gate::Skip);
            }
        }

        Ok(Gate::Proceed)
    }

    fn mtimes_force(&self, last_ran: Option<SystemTime>) -> bool {
        if self.mtimes.is_empty() {
            return false;
        }
        let Some(marker) = last_ran else {
            // Never ran with a force predicate configured.
            return true;
        };
        self.mtimes.iter().any(|path| {
            path.metadata()
                .and_then(|m| m.modified())
                .is_ok_and(|mtime| mtime > marker)
        })
    }
}

fn guard_spec(cmd: &str, shell: Option<&str>) -> CmdSpec {
    match shell {
        Some(shell) => CmdSpec::sh(cmd, shell),
        None => CmdSpec::line(cmd),
    }
}

/// Reads the last-ran marker beneath `dir`, if one was ever written.
pub fn read_marker(dir: &Path) -> Result<Option<SystemTime>> {
    match std::fs::metadata(dir.join(MARKER)) {
        Ok(meta) => Ok(Some(meta.modified()?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Stamps the last-ran marker for subsequent force-predicate comparison.
pub fn write_marker(dir: &Path) -> Result<()> {
    std::fs::write(dir.join(MARKER), b"")?;
    Ok(())
}

/// Bounds `work` by the per-call deadline and the merged cancellation
/// token. Expiry cancels in-flight work and reports [`Error::Timeout`];
/// the token reports [`Error::Cancelled`].
pub async fn bounded<T>(
    token: &CancellationToken,
    timeout: Option<Duration>,
    work: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    let guarded = async {
        tokio::select! {
            () = token.cancelled() => Err(Error::Cancelled),
            result = work => result,
        }
    };
    match timeout {
        Some(limit) => tokio::time::timeout(limit, guarded)
            .await
            .unwrap_or(Err(Error::Timeout(limit))),
        None => guarded.await,
    }
}

/// Applies the transient policy: a transient backend failure becomes
/// `Ok(false)` so the work is rescheduled on the next event.
pub fn absorb_transient(result: Result<bool>) -> Result<bool> {
    match result {
        Err(err) if err.is_transient() => {
            tracing::debug!(%err, "transient state absorbed, rescheduling");
            Ok(false)
        }
        other => other,
    }
}
