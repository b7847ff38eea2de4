//! Line-delimited JSON adapter for running the bridge behind a Matrix client
//! process.
//!
//! The client writes one [`MessageEvent`] per line to the bridge's stdin and
//! reads one `{"room_id", "reply_to", "body"}` object per line from its
//! stdout (`reply_to` only present on replies).

use super::ReplySink;
use crate::matrix::{EventId, MessageEvent, RoomId};
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Serialize)]
struct OutgoingText<'a> {
    room_id: &'a RoomId,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a EventId>,
    body: &'a str,
}

/// Parse events from `reader` and push them into `events`.
///
/// Blank and malformed lines are skipped. Returns the number of events
/// forwarded once the reader hits EOF or the receiver is dropped.
///
/// # Errors
///
/// Returns an error if reading from `reader` fails.
pub async fn read_events<R>(reader: R, events: mpsc::Sender<MessageEvent>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event: MessageEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Skipping malformed event line");
                continue;
            }
        };

        debug!(event_id = %event.event_id, kind = %event.kind(), "Event received");
        if events.send(event).await.is_err() {
            debug!("Event receiver dropped, stopping reader");
            break;
        }
        forwarded += 1;
    }

    Ok(forwarded)
}

/// Read events from the process stdin on a background task.
pub fn spawn_stdin_reader(events: mpsc::Sender<MessageEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match read_events(BufReader::new(tokio::io::stdin()), events).await {
            Ok(count) => info!(count, "Stdin closed"),
            Err(e) => warn!(error = %e, "Failed to read events from stdin"),
        }
    })
}

/// [`ReplySink`] writing one JSON object per line
pub struct LineReplySink<W> {
    writer: Mutex<W>,
}

/// Reply sink writing to the process stdout
pub type StdoutReplySink = LineReplySink<tokio::io::Stdout>;

impl<W> LineReplySink<W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn write_line(&self, message: &OutgoingText<'_>) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl<W> LineReplySink<W> {
    /// Wrap `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Unwrap the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl StdoutReplySink {
    /// Reply sink over the process stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W> ReplySink for LineReplySink<W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn send_text(&self, room_id: &RoomId, body: &str) -> anyhow::Result<()> {
        self.write_line(&OutgoingText {
            room_id,
            reply_to: None,
            body,
        })
        .await
    }

    async fn send_reply(
        &self,
        room_id: &RoomId,
        reply_to: &EventId,
        body: &str,
    ) -> anyhow::Result<()> {
        self.write_line(&OutgoingText {
            room_id,
            reply_to: Some(reply_to),
            body,
        })
        .await
    }
}
