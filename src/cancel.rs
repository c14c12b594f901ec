//! Cancellation and deadline bridging for connection I/O.
//!
//! Every protocol operation races its reads and writes against a shared,
//! mutable deadline carried in a [`watch`] channel. Binding an [`OpContext`]
//! installs the context's deadline and parks a watcher task on its
//! cancellation token; cancellation forces the deadline into the `Expired`
//! state, which fails any in-flight I/O immediately. Releasing the guard
//! stops the watcher and waits for it to exit, so no watcher outlives the
//! operation it guards.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::NntpError;

/// Current deadline for pending connection I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deadline {
    None,
    At(Instant),
    Expired,
}

/// Cancellation and deadline scope for a single protocol operation.
///
/// Clones share the same cancellation token, so a clone handed to another
/// task can [`cancel`](Self::cancel) an operation that is blocked on the
/// connection.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Scoped binding of an [`OpContext`] onto a connection's deadline.
///
/// Created at the start of an operation and [released](Self::release) on
/// every exit path before the connection is reused. Release is synchronous:
/// it joins the watcher task before returning.
#[derive(Debug)]
pub(crate) struct DeadlineGuard {
    stop: Option<oneshot::Sender<()>>,
    watcher: JoinHandle<()>,
}

impl DeadlineGuard {
    pub(crate) fn bind(deadline: watch::Sender<Deadline>, ctx: &OpContext) -> Self {
        let initial = match ctx.deadline {
            Some(at) => Deadline::At(at),
            None => Deadline::None,
        };
        let _ = deadline.send(initial);

        let token = ctx.cancel.clone();
        let (stop_tx, stop_rx) = oneshot::channel();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = deadline.send(Deadline::Expired);
                }
                _ = stop_rx => {}
            }
        });

        Self {
            stop: Some(stop_tx),
            watcher,
        }
    }

    pub(crate) async fn release(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = self.watcher.await;
    }
}

/// Drive an I/O future under the connection's current deadline.
///
/// Re-evaluates whenever the deadline changes, so a watcher forcing
/// `Expired` mid-read fails the read immediately rather than after it
/// would otherwise have completed.
pub(crate) async fn with_deadline<T, F>(
    deadline: &mut watch::Receiver<Deadline>,
    io: F,
) -> Result<T, NntpError>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::pin!(io);
    let mut watch_changes = true;
    loop {
        let current = *deadline.borrow_and_update();
        if current == Deadline::Expired {
            return Err(NntpError::Cancelled);
        }
        let expiry = async {
            match current {
                Deadline::At(at) => time::sleep_until(at).await,
                _ => std::future::pending().await,
            }
        };
        tokio::select! {
            result = &mut io => return result.map_err(NntpError::from),
            _ = expiry => return Err(NntpError::Timeout),
            changed = deadline.changed(), if watch_changes => {
                // A closed sender means the deadline can no longer change.
                if changed.is_err() {
                    watch_changes = false;
                }
            }
        }
    }
}
