//! Recursive filesystem watcher, poll based.
//!
//! Produces one event per path whose mtime changed, appeared or vanished
//! between scans. Consumers typically pipe it through
//! [`coalesce`](crate::watch::coalesce) so a burst of file changes becomes
//! one resource event.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use futures::Stream;
use tokio_util::sync::CancellationToken;

use converge_core::error::Result;

/// One observed filesystem change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub path: PathBuf,
}

type Snapshot = BTreeMap<PathBuf, SystemTime>;

fn scan(root: &Path) -> std::io::Result<Snapshot> {
    let mut snapshot = Snapshot::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            // The tree (or a subtree racing a delete) may not exist yet.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            if meta.is_dir() {
                stack.push(path);
            } else if let Ok(mtime) = meta.modified() {
                snapshot.insert(path, mtime);
            }
        }
    }
    Ok(snapshot)
}

fn diff(before: &Snapshot, after: &Snapshot) -> Vec<FsEvent> {
    let mut events = Vec::new();
    for (path, mtime) in after {
        if before.get(path) != Some(mtime) {
            events.push(FsEvent { path: path.clone() });
        }
    }
    for path in before.keys() {
        if !after.contains_key(path) {
            events.push(FsEvent { path: path.clone() });
        }
    }
    events
}

/// Watches `root` recursively, rescanning every `interval` until `token`
/// fires. Scan failures are yielded as errors; the watch loop decides
/// whether they are fatal.
pub fn poll_watch(
    root: PathBuf,
    interval: Duration,
    token: CancellationToken,
) -> impl Stream<Item = Result<FsEvent>> + Send {
    async_stream::stream! {
        let mut snapshot = match scan(&root) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                yield Err(err.into());
                return;
            }
        };
        loop {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(interval) => {}
            }
            let next = match scan(&root) {
                Ok(next) => next,
                Err(err) => {
                    yield Err(err.into());
                    return;
                }
            };
            for event in diff(&snapshot, &next) {
                tracing::trace!(path = %event.path.display(), "filesystem change");
                yield Ok(event);
            }
            snapshot = next;
        }
    }
}
