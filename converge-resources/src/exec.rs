//! The shell-command resource kind.
//!
//! Converges by running a command; the command's streams become the typed
//! outputs `{output, stdout, stderr}`. An optional watch command turns
//! lines on its stdout into change events. Guard predicates (`if_cmd`,
//! `not_if_cmd`, `creates`, `mtimes`) gate or force the apply.

use std::any::Any;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use converge_core::cmp::{self, CmpMismatch};
use converge_core::context::Context;
use converge_core::error::{Error, Result};
use converge_core::resource::{Interruptible, MetaParams, ResUid, Resource, Sendable};
use converge_core::send::SendBundle;
use converge_core::shared::NamedLock;
use converge_runtime::apply::{self, Gate, Guards};
use converge_runtime::shell::{classify_status, CmdSpec, ShellRunner, SystemShell};
use converge_runtime::watch::WatchStreamExt;

const KIND: &str = "exec";

/// A uniquely-named shell command to converge with.
#[derive(Default)]
pub struct ExecRes {
    pub name: String,
    pub meta: MetaParams,

    /// The command line. Interpreted by `shell` when set, split on
    /// whitespace otherwise (unless `args` carries an explicit argv tail).
    pub cmd: String,
    pub args: Vec<String>,
    pub shell: Option<String>,
    pub cwd: Option<PathBuf>,
    /// Per-apply deadline; expiry kills the process and reports a timeout.
    pub timeout: Option<Duration>,

    /// Watch loop process; every burst of stdout lines is one change event.
    pub watch_cmd: Option<String>,
    pub watch_shell: Option<String>,

    pub if_cmd: Option<String>,
    pub if_shell: Option<String>,
    /// Further gate `if_cmd` on its stdout matching this string.
    pub if_equals: Option<String>,
    pub not_if_cmd: Option<String>,
    pub not_if_shell: Option<String>,
    pub creates: Option<PathBuf>,
    /// Post-apply hook; a failure fails the whole apply.
    pub done_cmd: Option<String>,
    pub mtimes: Vec<PathBuf>,

    state: ExecState,
}

#[derive(Default)]
struct ExecState {
    converged: AtomicBool,
    interrupt: parking_lot::Mutex<Option<CancellationToken>>,
    block: tokio::sync::Mutex<Option<NamedLock>>,
    last: parking_lot::Mutex<Option<SendBundle>>,
}

impl ExecRes {
    fn guards(&self) -> Guards {
        Guards {
            if_cmd: self.if_cmd.clone(),
            if_shell: self.if_shell.clone().or_else(|| self.shell.clone()),
            if_equals: self.if_equals.clone(),
            not_if_cmd: self.not_if_cmd.clone(),
            not_if_shell: self.not_if_shell.clone().or_else(|| self.shell.clone()),
            creates: self.creates.clone(),
            mtimes: self.mtimes.clone(),
        }
    }

    fn spec(&self) -> CmdSpec {
        CmdSpec {
            cmd: self.cmd.clone(),
            args: self.args.clone(),
            shell: self.shell.clone(),
            cwd: self.cwd.clone(),
        }
    }

    async fn resend_cached(&self, ctx: &Context) -> Result<()> {
        let cached = self.state.last.lock().clone();
        if let Some(bundle) = cached {
            ctx.send(bundle).await?;
        }
        Ok(())
    }

    fn last_ran(&self, ctx: &Context) -> Result<Option<std::time::SystemTime>> {
        if self.mtimes.is_empty() {
            return Ok(None);
        }
        apply::read_marker(&ctx.var_dir("exec")?)
    }
}

fn stream_field(bytes: &[u8]) -> Option<serde_json::Value> {
    if bytes.is_empty() {
        None
    } else {
        Some(json!(String::from_utf8_lossy(bytes).into_owned()))
    }
}

#[async_trait]
impl Resource for ExecRes {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> &MetaParams {
        &self.meta
    }

    fn validate(&self) -> Result<()> {
        if self.cmd.trim().is_empty() && self.args.is_empty() {
            return Err(Error::validation("exec requires a command"));
        }
        if !self.args.is_empty() && self.shell.is_some() {
            return Err(Error::validation(
                "exec args cannot be combined with a shell",
            ));
        }
        if self.if_equals.is_some() && self.if_cmd.is_none() {
            return Err(Error::validation("if_equals requires if_cmd"));
        }
        if self.watch_shell.is_some() && self.watch_cmd.is_none() {
            return Err(Error::validation("watch_shell requires watch_cmd"));
        }
        Ok(())
    }

    async fn init(&self, ctx: &Context) -> Result<()> {
        if self.meta.refresh {
            self.state.converged.store(false, Ordering::SeqCst);
        }
        if let Some(block) = &self.meta.block {
            *self.state.block.lock().await = Some(ctx.named().reserve(block));
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        // Dropping the reservation releases the shared named state.
        self.state.block.lock().await.take();
        self.state.interrupt.lock().take();
        Ok(())
    }

    async fn watch(&self, ctx: &Context) -> Result<()> {
        let Some(watch_cmd) = &self.watch_cmd else {
            ctx.running();
            return match self.meta.poll {
                Some(interval) => loop {
                    tokio::select! {
                        () = ctx.cancelled() => return Ok(()),
                        () = tokio::time::sleep(interval) => {
                            self.state.converged.store(false, Ordering::SeqCst);
                            ctx.event().await?;
                        }
                    }
                },
                None => {
                    ctx.cancelled().await;
                    Ok(())
                }
            };
        };

        let spec = CmdSpec {
            cmd: watch_cmd.clone(),
            shell: self.watch_shell.clone().or_else(|| self.shell.clone()),
            cwd: self.cwd.clone(),
            ..CmdSpec::default()
        };
        let mut child = spec
            .command()?
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| Error::init(format!("failed to spawn {}: {err}", spec.display())))?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let mut reader = BufReader::new(stdout).lines();
        let lines = async_stream::stream! {
            while let Ok(Some(line)) = reader.next_line().await {
                yield line;
            }
        };
        let mut events = Box::pin(lines.coalesce());

        ctx.running();
        loop {
            tokio::select! {
                () = ctx.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Ok(());
                }
                burst = events.next() => match burst {
                    Some(()) => {
                        self.state.converged.store(false, Ordering::SeqCst);
                        ctx.event().await?;
                    }
                    // Stream end: the watch process exited.
                    None => break,
                }
            }
        }
        let status = child
            .wait()
            .await
            .map_err(|err| Error::Programming(format!("wait failed for {}: {err}", spec.display())))?;
        if status.success() {
            // A clean exit stops the watcher without being fatal.
            tracing::debug!(cmd = %spec.display(), "watch process ended cleanly");
            return Ok(());
        }
        classify_status(&spec, status)
    }

    async fn check_apply(&self, ctx: &Context, apply: bool) -> Result<bool> {
        if ctx.refresh() {
            tracing::debug!("refresh requested, invalidating cached state");
            self.state.converged.store(false, Ordering::SeqCst);
        }

        let gate = self
            .guards()
            .evaluate(&SystemShell, self.last_ran(ctx)?, ctx.token())
            .await?;
        if gate == Gate::Skip {
            self.resend_cached(ctx).await?;
            return Ok(true);
        }
        if gate != Gate::Forced && self.state.converged.load(Ordering::SeqCst) {
            self.resend_cached(ctx).await?;
            return Ok(true);
        }
        if !apply {
            return Ok(false);
        }

        // Serialize against other resources mutating the same external
        // object for the whole mutate + re-observe window.
        let block = self.state.block.lock().await;
        let _held = match block.as_ref() {
            Some(named) => Some(named.lock().await),
            None => None,
        };

        let interrupt = ctx.token().child_token();
        *self.state.interrupt.lock() = Some(interrupt.clone());
        let applied: Result<SendBundle> = async {
            let spec = self.spec();
            let output = SystemShell.run(&spec, self.timeout, &interrupt).await?;
            classify_status(&spec, output.status)?;

            if let Some(done) = &self.done_cmd {
                let done_spec = match &self.shell {
                    Some(shell) => CmdSpec::sh(done, shell),
                    None => CmdSpec::line(done),
                };
                let done_out = SystemShell.run(&done_spec, self.timeout, &interrupt).await?;
                classify_status(&done_spec, done_out.status)?;
            }

            if !self.mtimes.is_empty() {
                apply::write_marker(&ctx.var_dir("exec")?)?;
            }

            Ok(SendBundle::new()
                .with("output", stream_field(&output.combined))
                .with("stdout", stream_field(&output.stdout))
                .with("stderr", stream_field(&output.stderr)))
        }
        .await;
        self.state.interrupt.lock().take();
        let bundle = applied?;
        *self.state.last.lock() = Some(bundle.clone());
        ctx.send(bundle).await?;
        self.state.converged.store(true, Ordering::SeqCst);
        Ok(false)
    }

    fn cmp(&self, other: &dyn Resource) -> Result<(), CmpMismatch> {
        let Some(other) = other.as_any().downcast_ref::<ExecRes>() else {
            return Err(CmpMismatch::kind(KIND));
        };
        cmp::field(KIND, "name", &self.name, &other.name)?;
        cmp::field(KIND, "meta", &self.meta, &other.meta)?;
        cmp::field(KIND, "cmd", &self.cmd, &other.cmd)?;
        cmp::field(KIND, "args", &self.args, &other.args)?;
        cmp::field(KIND, "shell", &self.shell, &other.shell)?;
        cmp::field(KIND, "cwd", &self.cwd, &other.cwd)?;
        cmp::field(KIND, "timeout", &self.timeout, &other.timeout)?;
        cmp::field(KIND, "watch_cmd", &self.watch_cmd, &other.watch_cmd)?;
        cmp::field(KIND, "watch_shell", &self.watch_shell, &other.watch_shell)?;
        cmp::field(KIND, "if_cmd", &self.if_cmd, &other.if_cmd)?;
        cmp::field(KIND, "if_shell", &self.if_shell, &other.if_shell)?;
        cmp::field(KIND, "if_equals", &self.if_equals, &other.if_equals)?;
        cmp::field(KIND, "not_if_cmd", &self.not_if_cmd, &other.not_if_cmd)?;
        cmp::field(KIND, "not_if_shell", &self.not_if_shell, &other.not_if_shell)?;
        cmp::field(KIND, "creates", &self.creates, &other.creates)?;
        cmp::field(KIND, "done_cmd", &self.done_cmd, &other.done_cmd)?;
        cmp::field(KIND, "mtimes", &self.mtimes, &other.mtimes)?;
        Ok(())
    }

    fn uids(&self) -> Vec<ResUid> {
        let mut uids = vec![ResUid::new(KIND, &self.name)];
        // The command path doubles as a secondary identifier for auto-edges.
        if let Some(program) = self.cmd.split_whitespace().next() {
            uids.push(ResUid::qualified(KIND, &self.name, program));
        }
        uids
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn as_sendable(&self) -> Option<&dyn Sendable> {
        Some(self)
    }

    fn as_interruptible(&self) -> Option<&dyn Interruptible> {
        Some(self)
    }
}

impl Sendable for ExecRes {
    fn sends(&self) -> SendBundle {
        SendBundle::new()
            .with("output", None)
            .with("stdout", None)
            .with("stderr", None)
    }
}

impl Interruptible for ExecRes {
    fn interrupt(&self) {
        if let Some(token) = self.state.interrupt.lock().as_ref() {
            token.cancel();
        }
    }
}
