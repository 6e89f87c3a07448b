use crate::constants::{
    DECODE_ERROR_MESSAGE, PERSIST_FAILED_MESSAGE, PERSIST_TIMEOUT_MESSAGE,
    RELAY_CHANNEL_CAPACITY, RENDEZVOUS_TIMEOUT_SECS, TIMEOUT_ERROR_MESSAGE,
};
use crate::framing::{residue_text, BraceFrameCodec, FrameError};
use crate::logging::StreamMetric;
use crate::persist::{PersistJob, PersistSummary, ResponsePersister};
use crate::types::{AgentMode, RelayError};
use crate::upstream::UpstreamClient;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::Instrument;

/// How a parsed upstream frame is forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameContent {
    /// `data : <text>\n\n` per frame.
    #[default]
    Text,
    /// The frame's `data` value as a raw JSON object.
    Structured,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Data(String),
    Structured(Value),
    Summary(PersistSummary),
    Error(String),
}

impl OutboundFrame {
    pub fn to_bytes(&self) -> Bytes {
        match self {
            OutboundFrame::Data(text) => Bytes::from(format!("data : {}\n\n", text)),
            OutboundFrame::Structured(value) => Bytes::from(value.to_string()),
            OutboundFrame::Summary(summary) => match serde_json::to_string(summary) {
                Ok(s) => Bytes::from(s),
                Err(e) => {
                    tracing::error!("Failed to encode summary frame: {}", e);
                    error_body(PERSIST_FAILED_MESSAGE)
                }
            },
            OutboundFrame::Error(message) => error_body(message),
        }
    }
}

fn error_body(message: &str) -> Bytes {
    Bytes::from(serde_json::json!({ "error": message }).to_string())
}

/// Everything one relay needs: where to send, what to send and where the
/// answer will be saved.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub mode: AgentMode,
    pub endpoint: String,
    pub body: Value,
    pub content: FrameContent,
    pub job: PersistJob,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    /// Upstream finished and a summary frame went out (possibly a fallback).
    Completed(PersistSummary),
    /// The agent could not be reached, answered non-2xx or stalled.
    UpstreamFailed(String),
    /// The agent's bytes could not be decoded.
    DecodeFailed(String),
}

impl RelayOutcome {
    pub fn persistence_started(&self) -> bool {
        matches!(self, RelayOutcome::Completed(_))
    }
}

pub struct RelayHandle {
    pub frames: ReceiverStream<OutboundFrame>,
    pub task: JoinHandle<RelayOutcome>,
}

/// Forwards the agent's streamed answer to the client and, once the agent
/// is done, saves it and appends a summary frame.
#[derive(Clone)]
pub struct StreamRelay {
    upstream: UpstreamClient,
    persister: ResponsePersister,
    rendezvous_timeout: Duration,
    channel_capacity: usize,
}

impl StreamRelay {
    pub fn new(upstream: UpstreamClient, persister: ResponsePersister) -> Self {
        Self {
            upstream,
            persister,
            rendezvous_timeout: Duration::from_secs(RENDEZVOUS_TIMEOUT_SECS),
            channel_capacity: RELAY_CHANNEL_CAPACITY,
        }
    }

    pub fn with_rendezvous_timeout(mut self, timeout: Duration) -> Self {
        self.rendezvous_timeout = timeout;
        self
    }

    /// Starts the relay task. The task keeps reading the upstream and saving
    /// the answer even if `frames` is dropped by a departing client.
    pub fn relay(&self, request: RelayRequest) -> RelayHandle {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let stream_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "stream",
            cid = %crate::str_utils::prefix_chars(&request.job.conversation_id, 8),
            mode = %request.mode,
            stream_id = %crate::str_utils::prefix_chars(&stream_id, 8),
            user = request.user_id.as_deref().unwrap_or("-")
        );

        let relay = self.clone();
        let task = tokio::spawn(
            async move { relay.run(request, tx, stream_id).await }.instrument(span),
        );

        RelayHandle {
            frames: ReceiverStream::new(rx),
            task,
        }
    }

    async fn run(
        self,
        request: RelayRequest,
        tx: mpsc::Sender<OutboundFrame>,
        stream_id: String,
    ) -> RelayOutcome {
        let mut client = ClientSink::new(tx);
        let mut metric = StreamMetric::new(&stream_id);

        let response = match self
            .upstream
            .open_stream(&request.endpoint, request.mode, &request.body)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("[☁️  -> ⚙️ ] Relay aborted before streaming: {}", e.inner);
                let message = client_message(&e.inner);
                client.send(OutboundFrame::Error(message.clone())).await;
                return RelayOutcome::UpstreamFailed(message);
            }
        };

        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let mut frames = FramedRead::new(StreamReader::new(bytes_stream), BraceFrameCodec::new());
        let idle_timeout = self.upstream.stream_timeout();

        loop {
            let next = match tokio::time::timeout(idle_timeout, frames.next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::error!("[☁️  -> ⚙️ ] No data from agent for {:?}", idle_timeout);
                    metric.log_summary();
                    client
                        .send(OutboundFrame::Error(TIMEOUT_ERROR_MESSAGE.to_string()))
                        .await;
                    return RelayOutcome::UpstreamFailed(TIMEOUT_ERROR_MESSAGE.to_string());
                }
            };

            match next {
                None => break,
                Some(Ok(frame)) => match project_frame(frame, request.content) {
                    Some(out) => {
                        metric.record_frame(&out);
                        client.send(out).await;
                    }
                    None => {
                        metric.record_dropped();
                        tracing::warn!("[☁️  -> ⚙️ ] Dropping frame without data");
                    }
                },
                Some(Err(FrameError::Io(e))) => {
                    tracing::error!("[☁️  -> ⚙️ ] Agent stream broke: {}", e);
                    metric.log_summary();
                    let message = format!("Error: {}", e);
                    client.send(OutboundFrame::Error(message.clone())).await;
                    return RelayOutcome::UpstreamFailed(message);
                }
                Some(Err(e)) => {
                    tracing::error!("[☁️  -> ⚙️ ] Undecodable agent stream: {}", e);
                    metric.log_summary();
                    client
                        .send(OutboundFrame::Error(DECODE_ERROR_MESSAGE.to_string()))
                        .await;
                    return RelayOutcome::DecodeFailed(e.to_string());
                }
            }
        }

        metric.log_summary();

        let raw = match residue_text(frames.read_buffer()) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!("[☁️  -> ⚙️ ] Final payload is not UTF-8: {}", e);
                client
                    .send(OutboundFrame::Error(DECODE_ERROR_MESSAGE.to_string()))
                    .await;
                return RelayOutcome::DecodeFailed(e.to_string());
            }
        };

        let summary = self.persist_and_wait(raw, request.job).await;
        client.send(OutboundFrame::Summary(summary.clone())).await;
        RelayOutcome::Completed(summary)
    }

    /// Hands the raw answer to a persistence task and waits, bounded, for
    /// its summary on a channel owned by this request alone.
    async fn persist_and_wait(&self, raw: String, job: PersistJob) -> PersistSummary {
        let (done_tx, done_rx) = oneshot::channel();
        let handle = self.persister.spawn(raw, job, done_tx);

        match tokio::time::timeout(self.rendezvous_timeout, done_rx).await {
            Ok(Ok(summary)) => {
                join_persister(handle).await;
                summary
            }
            Ok(Err(_)) => {
                join_persister(handle).await;
                tracing::warn!("Persistence ended without a summary");
                PersistSummary::fallback(PERSIST_FAILED_MESSAGE)
            }
            Err(_) => {
                tracing::warn!(
                    "No persistence summary after {:?}; sending fallback",
                    self.rendezvous_timeout
                );
                tokio::spawn(join_persister(handle).in_current_span());
                PersistSummary::fallback(PERSIST_TIMEOUT_MESSAGE)
            }
        }
    }
}

async fn join_persister(handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        if e.is_panic() {
            tracing::error!(target: "panic", "Persistence task panicked: {}", e);
        } else {
            tracing::warn!("Persistence task cancelled: {}", e);
        }
    }
}

fn project_frame(frame: Value, content: FrameContent) -> Option<OutboundFrame> {
    let data = match frame {
        Value::Object(mut map) => map.remove("data")?,
        _ => return None,
    };
    match (content, data) {
        (_, Value::Null) => None,
        (FrameContent::Text, Value::String(text)) => Some(OutboundFrame::Data(text)),
        (FrameContent::Text, other) => Some(OutboundFrame::Data(other.to_string())),
        (FrameContent::Structured, value) => Some(OutboundFrame::Structured(value)),
    }
}

fn client_message(err: &RelayError) -> String {
    match err {
        RelayError::UpstreamTimeout(_) => TIMEOUT_ERROR_MESSAGE.to_string(),
        RelayError::Upstream(status, _) => format!("Error: {}", status.as_u16()),
        RelayError::Decode(_) | RelayError::Serialization(_) => DECODE_ERROR_MESSAGE.to_string(),
        other => format!("Error: {}", other),
    }
}

/// Delivery side of the relay. Once the client is gone, frames are
/// discarded and the relay carries on.
struct ClientSink {
    tx: mpsc::Sender<OutboundFrame>,
    connected: bool,
}

impl ClientSink {
    fn new(tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            tx,
            connected: true,
        }
    }

    async fn send(&mut self, frame: OutboundFrame) {
        if !self.connected {
            return;
        }
        if self.tx.send(frame).await.is_err() {
            tracing::trace!("[⚙️  -> 🖥️ ] Client disconnected, finishing relay in background");
            self.connected = false;
        }
    }
}
