use super::codec::{decode_payload, encode_payload, frame_codec};
use super::protocol::{AgentRequest, AgentResponse};
use super::IpcError;
use crate::bridge::AgentSink;
use crate::config::{
    AGENT_CONNECT_INITIAL_BACKOFF_MS, AGENT_CONNECT_MAX_BACKOFF_MS, AGENT_CONNECT_MAX_RETRIES,
    AGENT_RESPONSE_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

type FrameWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LengthDelimitedCodec>;

/// Connection to the agent process.
///
/// Requests are written through [`AgentClient::send`]. Responses arrive on
/// the receiver returned at construction, fed by a background reader task;
/// the receiver closes when the agent disconnects.
pub struct AgentClient {
    writer: Mutex<FrameWriter>,
}

impl AgentClient {
    /// Connect to the agent's Unix socket, retrying with exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::Io` if the socket is still unreachable after all retries.
    pub async fn connect(
        path: impl AsRef<Path>,
        max_frame_bytes: usize,
    ) -> Result<(Self, mpsc::Receiver<AgentResponse>), IpcError> {
        let path = path.as_ref();
        let retry_strategy = ExponentialBackoff::from_millis(AGENT_CONNECT_INITIAL_BACKOFF_MS)
            .max_delay(Duration::from_millis(AGENT_CONNECT_MAX_BACKOFF_MS))
            .map(jitter)
            .take(AGENT_CONNECT_MAX_RETRIES);

        let stream = Retry::spawn(retry_strategy, || async {
            UnixStream::connect(path).await.map_err(|e| {
                debug!(socket = %path.display(), error = %e, "Agent socket not ready");
                e
            })
        })
        .await
        .map_err(|e| {
            warn!(
                "Agent connection failed after {} attempts: {}",
                AGENT_CONNECT_MAX_RETRIES, e
            );
            e
        })?;

        info!(socket = %path.display(), "Connected to agent");
        Ok(Self::from_stream(stream, max_frame_bytes))
    }

    /// Wrap an already-connected byte stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S>(stream: S, max_frame_bytes: usize) -> (Self, mpsc::Receiver<AgentResponse>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(AGENT_RESPONSE_CHANNEL_CAPACITY);

        tokio::spawn(read_responses(
            FramedRead::new(read_half, frame_codec(max_frame_bytes)),
            tx,
        ));

        let write_half: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
        let client = Self {
            writer: Mutex::new(FramedWrite::new(write_half, frame_codec(max_frame_bytes))),
        };
        (client, rx)
    }

    /// Send one request frame.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::Json` if the request cannot be encoded and
    /// `IpcError::Io` if writing to the socket fails.
    pub async fn send(&self, request: &AgentRequest) -> Result<(), IpcError> {
        let payload = encode_payload(request)?;
        let size = payload.len();

        let mut writer = self.writer.lock().await;
        writer.send(payload).await?;

        debug!(
            request_id = %request.request_id,
            room_id = %request.room_id,
            size,
            "Request sent to agent"
        );
        Ok(())
    }
}

#[async_trait]
impl AgentSink for AgentClient {
    async fn forward(&self, request: AgentRequest) -> anyhow::Result<()> {
        self.send(&request).await.map_err(Into::into)
    }
}

async fn read_responses<R>(
    mut frames: FramedRead<R, LengthDelimitedCodec>,
    tx: mpsc::Sender<AgentResponse>,
) where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Agent connection read failed");
                break;
            }
        };

        match decode_payload::<AgentResponse>(&frame) {
            Ok(response) => {
                if tx.send(response).await.is_err() {
                    debug!("Response receiver dropped, stopping reader");
                    return;
                }
            }
            Err(e) => warn!(error = %e, size = frame.len(), "Skipping undecodable agent frame"),
        }
    }
    info!("Agent connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::codec::DEFAULT_MAX_FRAME_BYTES;
    use crate::matrix::{MessageEvent, RoomId};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_request_and_response_frames() -> anyhow::Result<()> {
        let (client_side, agent_side) = tokio::io::duplex(64 * 1024);
        let (client, mut responses) = AgentClient::from_stream(client_side, DEFAULT_MAX_FRAME_BYTES);
        let mut agent = tokio_util::codec::Framed::new(agent_side, frame_codec(DEFAULT_MAX_FRAME_BYTES));

        let request = AgentRequest::from_event(
            MessageEvent::text("$t1", "!room:example.org", "@alice:example.org", "ping"),
            None,
        );
        client.send(&request).await?;

        let frame = agent.next().await.ok_or(IpcError::Disconnected)??;
        let received: AgentRequest = decode_payload(&frame)?;
        assert_eq!(received, request);

        let response = AgentResponse {
            room_id: RoomId::new("!room:example.org"),
            reply_to: Some(request.event_id.clone()),
            body: "pong".to_string(),
        };
        agent.send(encode_payload(&response)?).await?;

        assert_eq!(responses.recv().await, Some(response));
        Ok(())
    }

    #[tokio::test]
    async fn test_reader_skips_garbage_and_closes_on_eof() -> anyhow::Result<()> {
        let (client_side, agent_side) = tokio::io::duplex(64 * 1024);
        let (_client, mut responses) = AgentClient::from_stream(client_side, DEFAULT_MAX_FRAME_BYTES);
        let mut agent = tokio_util::codec::Framed::new(agent_side, frame_codec(DEFAULT_MAX_FRAME_BYTES));

        agent.send(Bytes::from_static(b"{broken")).await?;
        agent
            .send(Bytes::from_static(br#"{"room_id":"!r:example.org","body":"ok"}"#))
            .await?;
        drop(agent);

        let response = responses.recv().await.ok_or(IpcError::Disconnected)?;
        assert_eq!(response.body, "ok");
        assert!(responses.recv().await.is_none());
        Ok(())
    }
}
