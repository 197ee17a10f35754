//! Cancellation and deadline propagation.
//!
//! A [`CancelToken`] is threaded from the top-level caller through the
//! orchestrator, the worker pool and the transport. Every suspension point
//! (rate-limiter wait, queue slot wait, outbound call, backoff sleep) races
//! against [`CancelToken::cancelled`] so a fired token makes the pipeline
//! return promptly instead of hanging.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Why a token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `cancel()` was called on this token or an ancestor
    Cancelled,
    /// The token's (or an ancestor's) deadline passed
    DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Cancelled => write!(f, "operation cancelled"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

#[derive(Debug, Default)]
struct CancelInner {
    is_cancelled: AtomicBool,
    notify: Notify,
    deadline: Option<Instant>,
    parent: Option<CancelToken>,
}

/// Cheaply clonable cancellation handle with an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// Create a root token with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a root token that fires once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                deadline: Some(Instant::now() + timeout),
                ..CancelInner::default()
            }),
        }
    }

    /// Derive a child token that fires when this token fires or when
    /// `timeout` elapses, whichever comes first. Cancelling the child does
    /// not affect the parent.
    pub fn child_with_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                deadline: timeout.map(|t| Instant::now() + t),
                parent: Some(self.clone()),
                ..CancelInner::default()
            }),
        }
    }

    /// Fire the token. Wakes every waiter exactly once.
    pub fn cancel(&self) {
        if !self.inner.is_cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether the token (or an ancestor) has fired or its deadline passed.
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// The reason the token fired, if it has.
    pub fn reason(&self) -> Option<CancelReason> {
        if self.inner.is_cancelled.load(Ordering::SeqCst) {
            return Some(CancelReason::Cancelled);
        }
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() >= deadline {
                return Some(CancelReason::DeadlineExceeded);
            }
        }
        self.inner.parent.as_ref().and_then(CancelToken::reason)
    }

    /// Deadline of this token, ignoring ancestors.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Resolve once the token fires. Returns immediately if already fired.
    pub fn cancelled(&self) -> Pin<Box<dyn Future<Output = CancelReason> + Send + '_>> {
        Box::pin(async move {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel() is not missed.
            notified.as_mut().enable();

            if let Some(reason) = self.reason() {
                return reason;
            }

            let deadline = async {
                match self.inner.deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let parent = async {
                match &self.inner.parent {
                    Some(parent) => parent.cancelled().await,
                    None => std::future::pending::<CancelReason>().await,
                }
            };

            tokio::select! {
                _ = notified => CancelReason::Cancelled,
                _ = deadline => CancelReason::DeadlineExceeded,
                reason = parent => reason,
            }
        })
    }

    /// Sleep for `duration` unless the token fires first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), CancelReason> {
        tokio::select! {
            reason = self.cancelled() => Err(reason),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
