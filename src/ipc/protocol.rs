use crate::matrix::{EventId, MediaInfo, MessageContent, MessageEvent, RoomId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload forwarded to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestContent {
    /// Text on its own
    Text {
        /// Message text
        body: String,
    },
    /// Image, optionally with the text that preceded it
    Image {
        /// Attachment metadata
        media: MediaInfo,
        /// Text combined with the image
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    /// File, optionally with the text that preceded it
    File {
        /// Attachment metadata
        media: MediaInfo,
        /// Text combined with the file
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

/// A user message forwarded to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Unique ID of this request
    pub request_id: Uuid,
    /// Room the message came from
    pub room_id: RoomId,
    /// Sender of the message
    pub sender: UserId,
    /// Event the request was built from (the media event when combined)
    pub event_id: EventId,
    /// Server timestamp of that event
    pub timestamp: DateTime<Utc>,
    /// Payload
    pub content: RequestContent,
}

impl AgentRequest {
    /// Build a request from a single event.
    ///
    /// For image and file payloads, `caption` is joined with the media's own
    /// caption (its `body`, unless that only repeats the file name). It is
    /// ignored for text.
    #[must_use]
    pub fn from_event(event: MessageEvent, caption: Option<String>) -> Self {
        let content = match event.content {
            MessageContent::Text { body } => RequestContent::Text { body },
            MessageContent::Image { body, info } => RequestContent::Image {
                caption: join_captions(caption, media_caption(&body, &info)),
                media: info,
            },
            MessageContent::File { body, info } => RequestContent::File {
                caption: join_captions(caption, media_caption(&body, &info)),
                media: info,
            },
        };

        Self {
            request_id: Uuid::new_v4(),
            room_id: event.room_id,
            sender: event.sender,
            event_id: event.event_id,
            timestamp: event.origin_server_ts,
            content,
        }
    }

    /// Build a request for a media event combined with a buffered text.
    #[must_use]
    pub fn combined(media: MessageEvent, text: Option<MessageEvent>) -> Self {
        let caption = text.and_then(|text| match text.content {
            MessageContent::Text { body } => Some(body),
            _ => None,
        });
        Self::from_event(media, caption)
    }
}

/// Caption carried by a media event itself.
fn media_caption(body: &str, info: &MediaInfo) -> Option<String> {
    let body = body.trim();
    if body.is_empty() || info.file_name.as_deref() == Some(body) {
        return None;
    }
    Some(body.to_string())
}

fn join_captions(text: Option<String>, own: Option<String>) -> Option<String> {
    match (text, own) {
        (Some(text), Some(own)) => Some(format!("{text}\n{own}")),
        (text, own) => text.or(own),
    }
}

/// An answer produced by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Room to reply in
    pub room_id: RoomId,
    /// Event the answer refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<EventId>,
    /// Answer text
    pub body: String,
}
