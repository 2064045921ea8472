//! Realtime change-feed client.
//!
//! Speaks the Phoenix channel protocol used by the hosted backend's
//! Realtime service: join one channel subscribed to post updates and
//! comment inserts, keep it alive with heartbeats, and translate
//! `postgres_changes` frames into [`ChangeEvent`]s.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use crate::backend::{ChangeEvent, ChangeFeed, ChangeStream};
use crate::{BackendError, CommentId, PostId, PostPatch};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Channel topic joined on every connection.
const TOPIC: &str = "realtime:memeboard-feed";

/// Interval between heartbeats on the `phoenix` topic.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(25);

/// Buffered events per connection.
const EVENT_BUFFER: usize = 256;

/// Realtime WebSocket client.
pub struct RealtimeClient {
    /// WebSocket endpoint, without query parameters.
    endpoint: String,
    anon_key: String,
    access_token: Option<String>,
    heartbeat: Duration,
}

impl RealtimeClient {
    /// Create a client for the project at `base_url` (`https://...`).
    pub fn new(base_url: &str, anon_key: impl Into<String>) -> Self {
        let base = base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };

        Self {
            endpoint: format!("{}/realtime/v1/websocket", ws_base),
            anon_key: anon_key.into(),
            access_token: None,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    /// Use an explicit WebSocket endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Join with a user token instead of the anon key.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    fn socket_url(&self) -> String {
        format!("{}?apikey={}&vsn=1.0.0", self.endpoint, self.anon_key)
    }

    fn join_frame(&self) -> Value {
        json!({
            "topic": TOPIC,
            "event": "phx_join",
            "ref": "1",
            "join_ref": "1",
            "payload": {
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [
                        { "event": "UPDATE", "schema": "public", "table": "posts" },
                        { "event": "INSERT", "schema": "public", "table": "comments" }
                    ]
                },
                "access_token": self.access_token.as_deref().unwrap_or(&self.anon_key)
            }
        })
    }
}

#[async_trait]
impl ChangeFeed for RealtimeClient {
    async fn connect(&self) -> Result<ChangeStream, BackendError> {
        let (socket, _) = connect_async(self.socket_url())
            .await
            .map_err(|e| BackendError::WebSocket(format!("connection failed: {}", e)))?;
        let (mut write, read) = socket.split();

        write
            .send(Message::Text(self.join_frame().to_string()))
            .await
            .map_err(|e| BackendError::WebSocket(format!("join failed: {}", e)))?;
        info!(endpoint = %self.endpoint, topic = TOPIC, "realtime channel join sent");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let pump = tokio::spawn(pump(write, read, tx, self.heartbeat));
        Ok(ChangeStream::with_pump(rx, pump))
    }
}

/// Forward frames from the socket until it fails or the stream is dropped.
async fn pump(
    mut write: SplitSink<Socket, Message>,
    mut read: SplitStream<Socket>,
    tx: mpsc::Sender<Result<ChangeEvent, BackendError>>,
    heartbeat: Duration,
) {
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;
    let mut next_ref: u64 = 2;

    let failure = loop {
        tokio::select! {
            _ = tx.closed() => return,

            _ = ticker.tick() => {
                let frame = json!({
                    "topic": "phoenix",
                    "event": "heartbeat",
                    "payload": {},
                    "ref": next_ref.to_string(),
                });
                next_ref += 1;
                if let Err(e) = write.send(Message::Text(frame.to_string())).await {
                    break format!("heartbeat failed: {}", e);
                }
                trace!("realtime heartbeat sent");
            }

            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                    Ok(Frame::Change(event)) => {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    Ok(Frame::Joined) => debug!(topic = TOPIC, "realtime channel joined"),
                    Ok(Frame::Rejected(reason)) => break format!("channel rejected: {}", reason),
                    Ok(Frame::Closed) => break "channel closed by server".to_string(),
                    Ok(Frame::Ignored) => {}
                    Err(e) => warn!(error = %e, "failed to parse realtime frame"),
                },
                Some(Ok(Message::Close(_))) => break "connection closed".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("read error: {}", e),
                None => break "stream ended".to_string(),
            },
        }
    };

    let _ = tx.send(Err(BackendError::WebSocket(failure))).await;
}

/// Meaning of one incoming frame.
#[derive(Debug, PartialEq)]
pub(crate) enum Frame {
    Change(ChangeEvent),
    Joined,
    Rejected(String),
    Closed,
    Ignored,
}

#[derive(Debug, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    table: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    record: Value,
}

#[derive(Debug, Deserialize)]
struct InsertedComment {
    id: CommentId,
    #[serde(default)]
    post_id: Option<PostId>,
}

pub(crate) fn parse_frame(text: &str) -> Result<Frame, BackendError> {
    let message: PhoenixMessage = serde_json::from_str(text)?;

    match message.event.as_str() {
        "postgres_changes" => {
            let Some(data) = message.payload.get("data") else {
                return Err(BackendError::InvalidResponse(
                    "postgres_changes frame without data".to_string(),
                ));
            };
            let data: ChangeData = serde_json::from_value(data.clone())?;
            parse_change(data)
        }
        "phx_reply" if message.topic == TOPIC => {
            match message.payload.get("status").and_then(Value::as_str) {
                Some("ok") => Ok(Frame::Joined),
                Some(_) => Ok(Frame::Rejected(reply_reason(&message.payload))),
                None => Ok(Frame::Ignored),
            }
        }
        "system" if message.payload.get("status").and_then(Value::as_str) == Some("error") => {
            Ok(Frame::Rejected(reply_reason(&message.payload)))
        }
        "phx_error" | "phx_close" if message.topic == TOPIC => Ok(Frame::Closed),
        _ => {
            trace!(event = %message.event, topic = %message.topic, "ignoring realtime frame");
            Ok(Frame::Ignored)
        }
    }
}

fn parse_change(data: ChangeData) -> Result<Frame, BackendError> {
    match (data.table.as_str(), data.kind.as_str()) {
        ("posts", "UPDATE") => {
            let mut record = data.record;
            // Creation time never changes; timestamp formats vary.
            if let Some(fields) = record.as_object_mut() {
                fields.remove("created_at");
            }
            let patch: PostPatch = serde_json::from_value(record)?;
            Ok(Frame::Change(ChangeEvent::PostUpdated(patch)))
        }
        ("comments", "INSERT") => {
            let inserted: InsertedComment = serde_json::from_value(data.record)?;
            Ok(Frame::Change(ChangeEvent::CommentInserted {
                id: inserted.id,
                post_id: inserted.post_id,
            }))
        }
        (table, kind) => {
            trace!(table, kind, "ignoring change");
            Ok(Frame::Ignored)
        }
    }
}

fn reply_reason(payload: &Value) -> String {
    payload
        .pointer("/response/reason")
        .or_else(|| payload.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}
