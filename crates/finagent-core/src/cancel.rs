//! Cooperative cancellation for in-flight agent work
//!
//! A [`CancelHandle`] is owned by whoever may abort a request; every task of
//! that request holds a [`CancelSignal`]. The first reason sent wins and is
//! never overwritten.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Why a request was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The caller cancelled the request
    Cancelled,
    /// The request's overall deadline elapsed
    DeadlineExceeded,
}

/// Sending half of a cancellation channel
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelHandle {
    /// Create a handle together with its first signal
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, CancelSignal { rx })
    }

    /// Request cancellation
    ///
    /// Returns `true` if this call set the reason, `false` if the request was
    /// already cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    /// Create another signal observing this handle
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// Receiving half of a cancellation channel
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<Option<CancelReason>>,
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }

    /// The cancellation reason, if cancelled
    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Wait until cancellation is requested
    ///
    /// Pends forever if the handle is dropped without cancelling.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.rx.clone();
        if let Ok(guard) = rx.wait_for(Option::is_some).await {
            if let Some(reason) = *guard {
                return reason;
            }
        }
        std::future::pending().await
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::never()
    }
}
