//! Pending entry store and claim protocol
//!
//! Every transition out of `WaitingForMedia` is a compare-and-remove performed
//! under the store lock, so exactly one of {media claim, matching timeout
//! claim, supersession, cleanup} can win for any entry, even on a
//! multi-threaded runtime.

use super::key::AggregationKey;
use super::state::AggregationState;
use super::timer::TimerHandle;
use crate::matrix::{EventId, MessageEvent};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Boxed text-only delivery callback.
pub(crate) type TextHandler =
    Box<dyn FnOnce(MessageEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// How a pending entry was finalized, as seen by the original caller.
pub(crate) enum Resolution {
    /// The window elapsed; the caller must deliver the text itself.
    TimedOut {
        event: MessageEvent,
        on_text_only: TextHandler,
    },
    /// A media/file message took the text.
    Combined,
    /// A newer text replaced this one; delivery happened out of band.
    Superseded,
    /// Released by cleanup without delivery.
    Cancelled,
    /// The same event is already pending; this registration was ignored.
    Duplicate,
}

/// One buffered text message awaiting possible combination.
pub(crate) struct PendingEntry {
    event: MessageEvent,
    state: AggregationState,
    timer: TimerHandle,
    completion: oneshot::Sender<Resolution>,
    on_text_only: TextHandler,
}

impl PendingEntry {
    fn is_waiting(&self) -> bool {
        self.state == AggregationState::WaitingForMedia
    }
}

/// Map from key to the single in-flight text entry for that key.
#[derive(Default)]
pub(crate) struct PendingStore {
    entries: Mutex<HashMap<AggregationKey, PendingEntry>>,
}

impl PendingStore {
    fn lock(&self) -> MutexGuard<'_, HashMap<AggregationKey, PendingEntry>> {
        // Entries are only mutated by whole-value insert/remove, so a panic
        // elsewhere cannot leave one half-updated.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `event` under `key`, superseding any entry already there.
    ///
    /// A re-delivery of the event already pending under `key` is ignored and
    /// resolved as [`Resolution::Duplicate`]. The timeout timer is scheduled
    /// while the lock is held, so it cannot observe the store before its own
    /// entry is inserted.
    pub(crate) fn register(
        self: &Arc<Self>,
        key: AggregationKey,
        event: MessageEvent,
        on_text_only: TextHandler,
        completion: oneshot::Sender<Resolution>,
        window: Duration,
    ) {
        let superseded = {
            let mut entries = self.lock();
            if entries
                .get(&key)
                .is_some_and(|pending| pending.event.event_id == event.event_id)
            {
                drop(entries);
                warn!(
                    room_id = %key.room,
                    sender = %key.sender,
                    event_id = %event.event_id,
                    "Ignoring duplicate text event"
                );
                let _ = completion.send(Resolution::Duplicate);
                return;
            }
            let superseded = entries.remove(&key);

            let store = Arc::clone(self);
            let timer_key = key.clone();
            let message_id = event.event_id.clone();
            let timer = TimerHandle::schedule(window, move || {
                store.claim_for_timeout(&timer_key, &message_id);
            });

            debug!(
                room_id = %key.room,
                sender = %key.sender,
                event_id = %event.event_id,
                window_ms = window.as_millis(),
                "Text buffered, waiting for media"
            );

            entries.insert(
                key,
                PendingEntry {
                    event,
                    state: AggregationState::WaitingForMedia,
                    timer,
                    completion,
                    on_text_only,
                },
            );
            superseded
        };

        if let Some(old) = superseded {
            Self::finish_superseded(old);
        }
    }

    /// Remove the entry for `key` if it is waiting and satisfies `matches`.
    fn take_waiting<P>(&self, key: &AggregationKey, matches: P) -> Option<PendingEntry>
    where
        P: FnOnce(&PendingEntry) -> bool,
    {
        let mut entries = self.lock();
        let claimable = entries
            .get(key)
            .is_some_and(|entry| entry.is_waiting() && matches(entry));
        if claimable {
            entries.remove(key)
        } else {
            None
        }
    }

    /// Claim the text for combination with a media/file message.
    ///
    /// Returns the buffered text event on success. Absent and already-finalized
    /// entries both yield `None`.
    pub(crate) fn claim_for_media(&self, key: &AggregationKey) -> Option<MessageEvent> {
        let mut entry = self.take_waiting(key, |_| true)?;
        entry.timer.cancel();
        entry.state.advance(AggregationState::CombinedWithMedia);

        debug!(
            room_id = %key.room,
            sender = %key.sender,
            event_id = %entry.event.event_id,
            state = %entry.state,
            "Text claimed by media"
        );

        let PendingEntry {
            event, completion, ..
        } = entry;
        // The caller may have stopped waiting; the claim still stands.
        let _ = completion.send(Resolution::Combined);
        Some(event)
    }

    /// Claim the text for stand-alone delivery after the window elapsed.
    ///
    /// Fails unless the pending entry is still the one `message_id` was
    /// scheduled for.
    pub(crate) fn claim_for_timeout(&self, key: &AggregationKey, message_id: &EventId) -> bool {
        let Some(mut entry) = self.take_waiting(key, |entry| entry.event.event_id == *message_id)
        else {
            debug!(
                room_id = %key.room,
                sender = %key.sender,
                event_id = %message_id,
                "Stale timeout ignored"
            );
            return false;
        };
        entry.state.advance(AggregationState::ProcessedAsText);

        debug!(
            room_id = %key.room,
            sender = %key.sender,
            event_id = %message_id,
            state = %entry.state,
            "Aggregation window elapsed"
        );

        let PendingEntry {
            event,
            completion,
            on_text_only,
            ..
        } = entry;
        if let Err(unsent) = completion.send(Resolution::TimedOut {
            event,
            on_text_only,
        }) {
            // Nobody is awaiting the entry anymore; deliver it detached.
            if let Resolution::TimedOut {
                event,
                on_text_only,
            } = unsent
            {
                spawn_text_delivery(event, on_text_only, "orphaned");
            }
        }
        true
    }

    fn finish_superseded(mut old: PendingEntry) {
        old.timer.cancel();
        old.state.advance(AggregationState::ProcessedAsText);

        debug!(
            room_id = %old.event.room_id,
            sender = %old.event.sender,
            event_id = %old.event.event_id,
            "Pending text superseded by a newer message"
        );

        let PendingEntry {
            event,
            completion,
            on_text_only,
            ..
        } = old;
        let _ = completion.send(Resolution::Superseded);
        spawn_text_delivery(event, on_text_only, "superseded");
    }

    /// Release every waiting caller without delivering, and empty the store.
    pub(crate) fn drain(&self) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut entries = self.lock();
            entries.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        for mut entry in drained {
            entry.timer.cancel();
            entry.state.advance(AggregationState::ProcessedAsText);
            let _ = entry.completion.send(Resolution::Cancelled);
        }
        count
    }

    pub(crate) fn state(&self, key: &AggregationKey) -> Option<AggregationState> {
        self.lock().get(key).map(|entry| entry.state)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Run a text-only callback on its own task, logging and dropping failures.
fn spawn_text_delivery(event: MessageEvent, on_text_only: TextHandler, reason: &'static str) {
    tokio::spawn(async move {
        let room_id = event.room_id.clone();
        let event_id = event.event_id.clone();
        if let Err(e) = on_text_only(event).await {
            warn!(
                room_id = %room_id,
                event_id = %event_id,
                reason,
                error = %e,
                "Detached text delivery failed"
            );
        }
    });
}
