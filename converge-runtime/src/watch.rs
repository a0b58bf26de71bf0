//! Building blocks for resource watch loops.
//!
//! Watch loops never apply anything; they only decide when a change is
//! worth reporting. The two primitives here cover the common shapes: a
//! stream adapter that collapses bursts of sub-signals into single events,
//! and a cancellable long-poll task for backends without push notification.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use futures::stream::Fuse;
use futures::{Stream, StreamExt};
use pin_project::pin_project;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use converge_core::error::Result;

/// Collapses bursts from the inner stream into one `()` per quiescent
/// interval.
///
/// The adapter drains every item the inner stream has ready and only then
/// emits a single unit — the pending-flag pattern: no timers, just the
/// loop-exit check. Terminates when the inner stream does, flushing a final
/// pending emission first.
#[pin_project]
pub struct Coalesce<S> {
    #[pin]
    inner: Fuse<S>,
    pending: bool,
}

impl<S: Stream> Stream for Coalesce<S> {
    type Item = ();

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(_)) => {
                    *this.pending = true;
                }
                Poll::Ready(None) => {
                    return if std::mem::take(this.pending) {
                        Poll::Ready(Some(()))
                    } else {
                        Poll::Ready(None)
                    };
                }
                Poll::Pending => {
                    return if std::mem::take(this.pending) {
                        Poll::Ready(Some(()))
                    } else {
                        Poll::Pending
                    };
                }
            }
        }
    }
}

/// See [`Coalesce`].
pub fn coalesce<S: Stream>(stream: S) -> Coalesce<S> {
    Coalesce {
        inner: stream.fuse(),
        pending: false,
    }
}

/// Extension methods for streams feeding watch loops.
pub trait WatchStreamExt: Stream {
    /// Collapse bursts into one emission per quiescent interval.
    fn coalesce(self) -> Coalesce<Self>
    where
        Self: Sized,
    {
        coalesce(self)
    }
}
impl<S: ?Sized + Stream> WatchStreamExt for S {}

/// Runs `wait` in a separate task until cancellation, forwarding produced
/// items over the returned channel.
///
/// For backends with no push notification: `wait` issues one long poll and
/// resolves with `Ok(Some(item))` on a real change, `Ok(None)` on a spurious
/// wake (which is swallowed and the wait re-issued), or `Err` which is
/// forwarded for the watch loop to classify. The waiter stops as soon as
/// `token` is cancelled or the receiver is dropped.
pub fn longpoll<T, F, Fut>(token: CancellationToken, mut wait: F) -> mpsc::Receiver<Result<T>>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<T>>> + Send,
{
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                () = token.cancelled() => return,
                polled = wait() => match polled {
                    Ok(Some(item)) => Ok(item),
                    Ok(None) => continue,
                    Err(err) => Err(err),
                },
            };
            if tx.send(item).await.is_err() {
                return;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use futures::{poll, stream, SinkExt, StreamExt};
    use tokio_util::sync::CancellationToken;

    use super::{longpoll, WatchStreamExt};
    use converge_core::error::Error;

    #[tokio::test]
    async fn coalesce_collapses_a_burst_into_one_event() {
        let mut events = stream::iter(vec![1, 2, 3]).coalesce();
        assert_eq!(events.next().await, Some(()));
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn coalesce_emits_once_per_quiescent_interval() {
        let (mut tx, rx) = futures::channel::mpsc::channel::<u8>(8);
        let mut events = rx.coalesce();

        assert!(poll!(events.next()).is_pending());
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        assert_eq!(events.next().await, Some(()));
        assert!(poll!(events.next()).is_pending());

        tx.send(3).await.unwrap();
        assert_eq!(events.next().await, Some(()));
        drop(tx);
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn coalesce_flushes_pending_on_stream_end() {
        let (mut tx, rx) = futures::channel::mpsc::channel::<u8>(8);
        tx.send(1).await.unwrap();
        drop(tx);
        let mut events = rx.coalesce();
        assert_eq!(events.next().await, Some(()));
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn longpoll_swallows_spurious_wakes_and_is_cancellable() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut rx = longpoll(token.clone(), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    // Two spurious wakes before a real item.
                    0 | 1 => Ok(None),
                    2 => Ok(Some("changed")),
                    _ => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(None)
                    }
                }
            }
        });

        assert_eq!(rx.recv().await.unwrap().unwrap(), "changed");
        assert!(calls.load(Ordering::SeqCst) >= 3);

        token.cancel();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn longpoll_forwards_errors() {
        let token = CancellationToken::new();
        let mut rx = longpoll::<&str, _, _>(token, || async {
            Err(Error::transient("backend flapping"))
        });
        assert!(rx.recv().await.unwrap().unwrap_err().is_transient());
    }
}
