//! Cooperative cancellation.
//!
//! A [`CancelSource`] owns the cancel signal; any number of cloned
//! [`CancelToken`]s observe it. Cancellation is level-triggered and
//! idempotent: once cancelled, every current and future observer sees it.

use std::future::pending;
use std::time::Duration;

use tokio::sync::watch;

use crate::effect::{Failure, Program, await_future};

/// The owning side of a cancel signal.
#[derive(Debug)]
pub struct CancelSource {
    sender: watch::Sender<bool>,
}

impl CancelSource {
    /// Creates a fresh, uncancelled source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sender: watch::channel(false).0,
        }
    }

    /// Issues a token observing this source.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            receiver: self.sender.subscribe(),
        }
    }

    /// Requests cancellation. Calling more than once has no further
    /// effect.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// The observing side of a cancel signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that can never be cancelled.
    #[must_use]
    pub fn never() -> Self {
        let (sender, receiver) = watch::channel(false);
        drop(sender);
        Self { receiver }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancellation is requested; never resolves for a
    /// token whose source was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            pending::<()>().await;
        }
    }
}

/// A program that sleeps for `duration`, failing early with a cancelled
/// failure if the token fires first.
pub fn delay(duration: Duration, token: CancelToken) -> Program<()> {
    await_future(async move {
        tokio::select! {
            () = tokio::time::sleep(duration) => Ok(()),
            () = token.cancelled() => Err(Failure::cancelled()),
        }
    })
}
