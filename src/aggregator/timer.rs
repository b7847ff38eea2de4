//! Per-entry aggregation timer

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Cancellable handle to a scheduled timeout.
///
/// Dropping the handle cancels the timer as well, so an entry that is
/// discarded without going through a claim never fires late.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    /// Run `on_expire` after `window` unless cancelled first.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn schedule<F>(window: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancelled.cancelled() => {}
                () = tokio::time::sleep(window) => on_expire(),
            }
        });

        Self { token }
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    #[cfg(test)]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
