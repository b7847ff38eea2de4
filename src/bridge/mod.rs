//! Matrix ↔ agent bridge
//!
//! Routes incoming Matrix events through the [`MessageAggregator`], forwards
//! the resulting requests to the agent and relays the agent's answers back
//! to their rooms. The Matrix client and the agent connection are reached
//! through the [`ReplySink`] and [`AgentSink`] traits.

/// NDJSON event source and reply sink over stdio.
pub mod stdio;
/// Unauthorized access flood protection.
pub mod unauthorized_cache;

pub use unauthorized_cache::UnauthorizedCache;

use crate::aggregator::{AggregationKey, MessageAggregator, TextOutcome};
use crate::config::{get_unauthorized_cache_max_size, get_unauthorized_cooldown, Settings};
use crate::ipc::{AgentRequest, AgentResponse};
use crate::matrix::{EventId, MessageEvent, MessageKind, RoomId, UserId};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Notice sent to senders outside the allow-list
pub const ACCESS_DENIED_TEXT: &str = "⛔️ Access denied";

/// Destination for requests bound to the agent
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentSink: Send + Sync {
    /// Deliver one request to the agent
    async fn forward(&self, request: AgentRequest) -> anyhow::Result<()>;
}

/// Destination for text bound to a Matrix room
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Post `body` to `room_id`
    async fn send_text(&self, room_id: &RoomId, body: &str) -> anyhow::Result<()>;

    /// Post `body` to `room_id` as a reply to `reply_to`
    async fn send_reply(
        &self,
        room_id: &RoomId,
        reply_to: &EventId,
        body: &str,
    ) -> anyhow::Result<()>;
}

/// Bridge between Matrix events and the agent process
pub struct Bridge {
    aggregator: MessageAggregator,
    agent: Arc<dyn AgentSink>,
    replies: Arc<dyn ReplySink>,
    /// `None` lets everyone through
    allowed_users: Option<HashSet<UserId>>,
    bot_user: Option<UserId>,
    unauthorized: UnauthorizedCache,
}

impl Bridge {
    /// Create a bridge configured from `settings`.
    #[must_use]
    pub fn new(settings: &Settings, agent: Arc<dyn AgentSink>, replies: Arc<dyn ReplySink>) -> Self {
        let cooldown = get_unauthorized_cooldown();
        let max_size = get_unauthorized_cache_max_size();
        info!(
            "Initializing UnauthorizedCache (cooldown: {}s, max_size: {})",
            cooldown, max_size
        );

        Self {
            aggregator: MessageAggregator::new(settings.aggregation_window()),
            agent,
            replies,
            allowed_users: settings.allowed_users(),
            bot_user: settings.bot_user(),
            unauthorized: UnauthorizedCache::new(cooldown, max_size),
        }
    }

    /// The aggregator holding buffered text messages.
    #[must_use]
    pub const fn aggregator(&self) -> &MessageAggregator {
        &self.aggregator
    }

    fn is_allowed(&self, sender: &UserId) -> bool {
        self.allowed_users
            .as_ref()
            .map_or(true, |allowed| allowed.contains(sender))
    }

    /// Route one event.
    ///
    /// Aggregation bookkeeping (registering a text, claiming it for media)
    /// happens before this returns, so calling `dispatch` in arrival order
    /// preserves arrival order even when the returned futures run
    /// concurrently. The future completes once the event is fully handled.
    pub fn dispatch(&self, event: MessageEvent) -> BoxFuture<'static, ()> {
        if self.bot_user.as_ref() == Some(&event.sender) {
            debug!(event_id = %event.event_id, "Ignoring own message");
            return Box::pin(async {});
        }

        if !self.is_allowed(&event.sender) {
            return Box::pin(deny_access(
                self.unauthorized.clone(),
                Arc::clone(&self.replies),
                event,
            ));
        }

        let key = AggregationKey::for_event(&event);
        let agent = Arc::clone(&self.agent);

        match event.kind() {
            MessageKind::Text => {
                let pending = self.aggregator.handle_text(key, event, move |text| async move {
                    agent.forward(AgentRequest::from_event(text, None)).await
                });
                Box::pin(async move {
                    match pending.await {
                        Ok(TextOutcome::DeliveredAlone) => debug!("Text forwarded to agent"),
                        Ok(outcome) => debug!(?outcome, "Text finalized"),
                        Err(e) => error!("Failed to forward text to agent: {e}"),
                    }
                })
            }
            kind @ (MessageKind::Image | MessageKind::File) => {
                let pending = self.aggregator.handle_media(kind, key, event, move |media, text| {
                    async move { agent.forward(AgentRequest::combined(media, text)).await }
                });
                Box::pin(async move {
                    let outcome = pending.await;
                    debug!(?outcome, "Media forwarded to agent");
                })
            }
        }
    }

    /// Post each agent response to its room until the channel closes.
    ///
    /// Responses naming a `reply_to` event are sent as replies to it.
    pub async fn relay_responses(&self, mut responses: mpsc::Receiver<AgentResponse>) {
        while let Some(response) = responses.recv().await {
            let sent = match &response.reply_to {
                Some(reply_to) => {
                    self.replies
                        .send_reply(&response.room_id, reply_to, &response.body)
                        .await
                }
                None => {
                    self.replies
                        .send_text(&response.room_id, &response.body)
                        .await
                }
            };
            if let Err(e) = sent {
                warn!(
                    room_id = %response.room_id,
                    error = %e,
                    "Failed to relay agent response"
                );
            }
        }
        info!("Agent response stream ended");
    }

    /// Dispatch events until the source closes or `shutdown` fires.
    ///
    /// When the source closes, in-flight events finish normally (buffered
    /// text is delivered when its window elapses). On shutdown, buffered
    /// text is released without delivery.
    pub async fn run(&self, mut events: mpsc::Receiver<MessageEvent>, shutdown: CancellationToken) {
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    let released = self.aggregator.cleanup();
                    debug!(released, "Aggregator cleaned up");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Event source closed");
                        break;
                    };
                    in_flight.spawn(self.dispatch(event));
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!("Event handler task failed: {e}");
                    }
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Event handler task failed: {e}");
            }
        }
    }
}

async fn deny_access(cache: UnauthorizedCache, replies: Arc<dyn ReplySink>, event: MessageEvent) {
    if !cache.should_send(&event.sender).await {
        return;
    }

    info!(
        sender = %event.sender,
        room_id = %event.room_id,
        "Unauthorized sender, sending denial notice"
    );
    if let Err(e) = replies.send_text(&event.room_id, ACCESS_DENIED_TEXT).await {
        error!("Failed to send access denied notice to {}: {}", event.sender, e);
    } else {
        cache.mark_sent(event.sender).await;
    }
}
