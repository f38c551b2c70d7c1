//! Cooperative, write-once cancellation.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

type CancelCallback = Box<dyn FnOnce(&str) + Send>;

/// Cancellation flag shared by a task and every in-flight step.
///
/// The flag can be set exactly once. Cancellation never aborts work in
/// progress; holders observe it at their next suspension point.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    reason: OnceLock<String>,
    notify: tokio_util::sync::CancellationToken,
    callbacks: Mutex<Vec<CancelCallback>>,
}

impl CancellationToken {
    /// Create a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel with a reason.
    ///
    /// Returns `true` if this call set the flag, `false` if it was already set.
    /// Registered callbacks run synchronously, once, on the first call.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        if self.inner.reason.set(reason.clone()).is_err() {
            return false;
        }

        self.inner.notify.cancel();

        let callbacks = match self.inner.callbacks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for callback in callbacks {
            callback(&reason);
        }

        tracing::debug!(reason = %reason, "Cancellation requested");
        true
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.reason.get().is_some()
    }

    /// The cancellation reason, if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.inner.reason.get().map(String::as_str)
    }

    /// Register a callback invoked when the token is cancelled.
    ///
    /// Runs immediately if the token is already cancelled.
    pub fn on_cancelled(&self, callback: impl FnOnce(&str) + Send + 'static) {
        {
            let mut guard = match self.inner.callbacks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Checked under the lock so a concurrent cancel either sees the
            // callback or we see the reason.
            if self.inner.reason.get().is_none() {
                guard.push(Box::new(callback));
                return;
            }
        }

        if let Some(reason) = self.reason() {
            callback(reason);
        }
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        self.inner.notify.cancelled().await;
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
