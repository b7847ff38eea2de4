//! Text/media message aggregation
//!
//! Users often send a short text ("check this image") immediately followed
//! by an upload. The aggregator buffers each text message for a short window
//! per (room, sender) so that an image or file arriving within the window is
//! delivered together with it, while a lone text is delivered on its own once
//! the window elapses.
//!
//! Finalization of a buffered text is decided by a claim protocol: a media
//! claim, the entry's own timer, a newer text from the same sender and
//! [`MessageAggregator::cleanup`] race for the entry, and exactly one of
//! them wins.

mod key;
mod state;
mod store;
mod timer;

#[cfg(test)]
mod tests;

pub use key::AggregationKey;
pub use state::AggregationState;

use crate::matrix::{EventId, MessageEvent, MessageKind};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use store::{PendingStore, Resolution, TextHandler};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Default aggregation window.
pub const DEFAULT_AGGREGATION_WINDOW: Duration = Duration::from_millis(3000);

/// How a `handle_text` call was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextOutcome {
    /// No media arrived in time; `on_text_only` was invoked
    DeliveredAlone,
    /// A media/file message took the text; `on_text_only` was not invoked
    CombinedWithMedia,
    /// A newer text from the same sender replaced this one; the text was
    /// delivered out of band
    Superseded,
    /// Released by [`MessageAggregator::cleanup`] without delivery
    Cancelled,
    /// The same event was already pending under this key; this call was
    /// ignored and `on_text_only` was not invoked
    Duplicate,
}

/// How a media/file message was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaOutcome {
    /// Delivered together with a buffered text
    Combined,
    /// Delivered without text
    Alone,
}

/// Per-(room, sender) text/media aggregation engine.
///
/// Cloning is cheap; clones share the same pending entries.
#[derive(Clone)]
pub struct MessageAggregator {
    store: Arc<PendingStore>,
    window: Duration,
}

impl Default for MessageAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_AGGREGATION_WINDOW)
    }
}

impl MessageAggregator {
    /// Create an aggregator buffering text for `window`.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            store: Arc::new(PendingStore::default()),
            window,
        }
    }

    /// The aggregation window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Buffer a text message and wait until its fate is decided.
    ///
    /// The entry is registered before this function returns, superseding any
    /// unresolved text under the same key. A repeat of the event already
    /// pending under `key` is ignored and resolves as [`TextOutcome::Duplicate`]. The superseded text is handed to
    /// its own `on_text_only` on a detached task. Callers that dispatch events
    /// in arrival order therefore register them in arrival order, even when
    /// the returned futures are spawned.
    ///
    /// The returned future resolves when the entry is finalized. Only on
    /// timeout does it invoke `on_text_only` itself.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the error of `on_text_only` when it fails on the timeout path.
    /// Aggregation races never produce errors.
    pub fn handle_text<F, Fut>(
        &self,
        key: AggregationKey,
        event: MessageEvent,
        on_text_only: F,
    ) -> impl Future<Output = anyhow::Result<TextOutcome>> + Send + 'static
    where
        F: FnOnce(MessageEvent) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handler: TextHandler = Box::new(move |event| Box::pin(on_text_only(event)));
        self.store.register(key, event, handler, tx, self.window);

        async move {
            match rx.await {
                Ok(Resolution::TimedOut {
                    event,
                    on_text_only,
                }) => {
                    on_text_only(event).await?;
                    Ok(TextOutcome::DeliveredAlone)
                }
                Ok(Resolution::Combined) => Ok(TextOutcome::CombinedWithMedia),
                Ok(Resolution::Superseded) => Ok(TextOutcome::Superseded),
                Ok(Resolution::Duplicate) => Ok(TextOutcome::Duplicate),
                Ok(Resolution::Cancelled) | Err(_) => Ok(TextOutcome::Cancelled),
            }
        }
    }

    /// Deliver an image, combined with the pending text for `key` if any.
    ///
    /// See [`MessageAggregator::handle_media`].
    pub fn handle_image<F, Fut>(
        &self,
        key: AggregationKey,
        event: MessageEvent,
        handler: F,
    ) -> impl Future<Output = MediaOutcome> + Send + 'static
    where
        F: FnOnce(MessageEvent, Option<MessageEvent>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handle_media(MessageKind::Image, key, event, handler)
    }

    /// Deliver a file, combined with the pending text for `key` if any.
    ///
    /// See [`MessageAggregator::handle_media`].
    pub fn handle_file<F, Fut>(
        &self,
        key: AggregationKey,
        event: MessageEvent,
        handler: F,
    ) -> impl Future<Output = MediaOutcome> + Send + 'static
    where
        F: FnOnce(MessageEvent, Option<MessageEvent>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handle_media(MessageKind::File, key, event, handler)
    }

    /// Claim the pending text for `key` and deliver the media through `handler`.
    ///
    /// The claim happens before this function returns and never waits on the
    /// aggregation window. The returned future calls
    /// `handler(media, Some(text))` when a text was claimed and
    /// `handler(media, None)` otherwise. Handler errors are logged and
    /// swallowed.
    pub fn handle_media<F, Fut>(
        &self,
        kind: MessageKind,
        key: AggregationKey,
        event: MessageEvent,
        handler: F,
    ) -> impl Future<Output = MediaOutcome> + Send + 'static
    where
        F: FnOnce(MessageEvent, Option<MessageEvent>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let text = self.store.claim_for_media(&key);
        let outcome = if text.is_some() {
            MediaOutcome::Combined
        } else {
            MediaOutcome::Alone
        };

        debug!(
            room_id = %key.room,
            sender = %key.sender,
            event_id = %event.event_id,
            kind = %kind,
            combined = text.is_some(),
            "Media received"
        );

        async move {
            let event_id = event.event_id.clone();
            if let Err(e) = handler(event, text).await {
                warn!(
                    room_id = %key.room,
                    sender = %key.sender,
                    event_id = %event_id,
                    kind = %kind,
                    error = %e,
                    "Media handler failed"
                );
            }
            outcome
        }
    }

    /// Take the pending text for `key` for combination with a media message.
    ///
    /// Single use: returns `None` when nothing is pending or the entry was
    /// already finalized. On success the timer is cancelled and the original
    /// `handle_text` caller resolves as [`TextOutcome::CombinedWithMedia`].
    pub fn claim_for_media(&self, key: &AggregationKey) -> Option<MessageEvent> {
        self.store.claim_for_media(key)
    }

    /// Finalize the pending text for `key` as text-only.
    ///
    /// Fails unless the pending entry still holds `message_id`; a timer
    /// scheduled for a superseded message can never finalize its successor.
    pub fn claim_for_timeout(&self, key: &AggregationKey, message_id: &EventId) -> bool {
        self.store.claim_for_timeout(key, message_id)
    }

    /// Cancel every timer and release every waiting `handle_text` caller
    /// without delivering its text.
    ///
    /// Returns the number of entries released.
    pub fn cleanup(&self) -> usize {
        let released = self.store.drain();
        if released > 0 {
            info!(released, "Released pending text messages");
        }
        released
    }

    /// Current state of the entry pending under `key`, if any.
    #[must_use]
    pub fn state(&self, key: &AggregationKey) -> Option<AggregationState> {
        self.store.state(key)
    }

    /// Number of pending entries.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.store.len()
    }
}
