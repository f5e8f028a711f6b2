//! Supabase Realtime change source.
//!
//! Speaks the Phoenix channel protocol (JSON serializer, `vsn=1.0.0`) used by
//! Supabase Realtime: join a `postgres_changes` channel for one filter, keep
//! the socket alive with heartbeats, and turn change broadcasts into
//! [`RawChange`]s.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use shared_config::AppConfig;

use crate::models::{ChangeKind, RawChange, SubscriptionFilter};
use crate::services::source::{ChangeEventSource, ChangeStream};
use crate::SyncError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const JOIN_REF: &str = "1";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    msg_ref: Option<String>,
}

/// What a single inbound frame means for a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeFrame {
    Change(RawChange),
    JoinAccepted,
    JoinRejected(String),
    Closed(String),
}

#[derive(Debug)]
pub struct SupabaseRealtimeSource {
    realtime_url: String,
    anon_key: String,
    heartbeat_interval: Duration,
    connect_timeout: Duration,
}

impl SupabaseRealtimeSource {
    pub fn new(config: &AppConfig) -> Result<Self, SyncError> {
        if !config.is_realtime_configured() {
            return Err(SyncError::Configuration(
                "SUPABASE_REALTIME_URL and SUPABASE_ANON_PUBLIC_KEY are required".to_string(),
            ));
        }

        Ok(Self {
            realtime_url: config.supabase_realtime_url.trim_end_matches('/').to_string(),
            anon_key: config.supabase_anon_key.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            connect_timeout: CONNECT_TIMEOUT,
        })
    }

    /// Bounds the websocket handshake and, separately, the wait for the join reply.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn websocket_url(&self) -> String {
        format!(
            "{}/websocket?apikey={}&vsn=1.0.0",
            self.realtime_url,
            urlencoding::encode(&self.anon_key)
        )
    }
}

#[async_trait]
impl ChangeEventSource for SupabaseRealtimeSource {
    async fn subscribe(
        &self,
        filter: &SubscriptionFilter,
        access_token: &str,
    ) -> Result<ChangeStream, SyncError> {
        let topic = filter.topic();
        debug!("Opening realtime socket for {}", topic);

        let (socket, _) = match timeout(self.connect_timeout, connect_async(self.websocket_url())).await {
            Ok(connected) => connected?,
            Err(_) => {
                return Err(SyncError::Subscription(format!(
                    "realtime handshake for {} timed out after {:?}",
                    topic, self.connect_timeout
                )))
            }
        };
        let (mut sink, mut stream) = socket.split();

        let join = join_message(filter, access_token);
        sink.send(Message::Text(join.to_string())).await?;

        match timeout(self.connect_timeout, await_join_reply(&mut stream, &topic)).await {
            Ok(Ok(())) => info!("Joined realtime channel {}", topic),
            Ok(Err(e)) => {
                let _ = sink.close().await;
                return Err(e);
            }
            Err(_) => {
                let _ = sink.close().await;
                return Err(SyncError::Subscription(format!(
                    "no join reply for {} within {:?}",
                    topic, self.connect_timeout
                )));
            }
        }

        let (tx, rx) = mpsc::unbounded();
        let task = tokio::spawn(pump(sink, stream, topic, self.heartbeat_interval, tx));

        Ok(RealtimeSubscription { rx, task }.boxed())
    }
}

/// Stream half of a joined channel. Dropping it stops the socket task.
struct RealtimeSubscription {
    rx: mpsc::UnboundedReceiver<Result<RawChange, SyncError>>,
    task: JoinHandle<()>,
}

impl Stream for RealtimeSubscription {
    type Item = Result<RawChange, SyncError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn await_join_reply(
    stream: &mut SplitStream<Socket>,
    topic: &str,
) -> Result<(), SyncError> {
    while let Some(message) = stream.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(frame) => {
                return Err(SyncError::Subscription(format!(
                    "socket closed during join: {:?}",
                    frame
                )))
            }
            _ => continue,
        };

        match decode_frame(&text, topic) {
            Ok(Some(RealtimeFrame::JoinAccepted)) => return Ok(()),
            Ok(Some(RealtimeFrame::JoinRejected(reason))) | Ok(Some(RealtimeFrame::Closed(reason))) => {
                return Err(SyncError::Subscription(format!("join rejected: {}", reason)))
            }
            Ok(_) => continue,
            Err(e) => warn!("Ignoring undecodable frame during join: {}", e),
        }
    }

    Err(SyncError::Subscription("socket closed before join reply".to_string()))
}

async fn pump(
    mut sink: SplitSink<Socket, Message>,
    mut stream: SplitStream<Socket>,
    topic: String,
    heartbeat_period: Duration,
    tx: mpsc::UnboundedSender<Result<RawChange, SyncError>>,
) {
    let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
    let mut heartbeat_ref: u64 = 1;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                heartbeat_ref += 1;
                let message = heartbeat_message(heartbeat_ref);
                if let Err(e) = sink.send(Message::Text(message.to_string())).await {
                    let _ = tx.unbounded_send(Err(SyncError::Subscription(format!("heartbeat failed: {}", e))));
                    break;
                }
            }
            message = stream.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let _ = tx.unbounded_send(Err(SyncError::Subscription(format!("socket closed: {:?}", frame))));
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!("Realtime socket error on {}: {}", topic, e);
                        let _ = tx.unbounded_send(Err(SyncError::from(e)));
                        break;
                    }
                    None => {
                        let _ = tx.unbounded_send(Err(SyncError::Subscription("socket closed".to_string())));
                        break;
                    }
                };

                let forwarded = match decode_frame(&text, &topic) {
                    Ok(Some(RealtimeFrame::Change(change))) => tx.unbounded_send(Ok(change)),
                    Ok(Some(RealtimeFrame::Closed(reason))) => {
                        let _ = tx.unbounded_send(Err(SyncError::Subscription(reason)));
                        break;
                    }
                    Ok(_) => Ok(()),
                    Err(e) => tx.unbounded_send(Err(e)),
                };

                if forwarded.is_err() {
                    break;
                }
            }
        }

        if tx.is_closed() {
            break;
        }
    }

    let _ = sink.send(Message::Text(leave_message(&topic).to_string())).await;
    let _ = sink.close().await;
    debug!("Realtime channel {} released", topic);
}

pub fn join_message(filter: &SubscriptionFilter, access_token: &str) -> Value {
    json!({
        "topic": filter.topic(),
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "ack": false, "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": "*",
                    "schema": filter.schema,
                    "table": filter.table,
                    "filter": filter.predicate()
                }],
                "private": false
            },
            "access_token": access_token
        },
        "ref": JOIN_REF,
        "join_ref": JOIN_REF
    })
}

pub fn heartbeat_message(msg_ref: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": msg_ref.to_string()
    })
}

pub fn leave_message(topic: &str) -> Value {
    json!({
        "topic": topic,
        "event": "phx_leave",
        "payload": {},
        "ref": "leave",
        "join_ref": JOIN_REF
    })
}

/// Decodes one inbound text frame for `topic`. Frames for other topics and
/// housekeeping replies decode to `None`.
pub fn decode_frame(text: &str, topic: &str) -> Result<Option<RealtimeFrame>, SyncError> {
    let message: PhoenixMessage = serde_json::from_str(text)
        .map_err(|e| SyncError::MalformedEvent(format!("invalid realtime frame: {}", e)))?;

    if message.topic != topic {
        return Ok(None);
    }

    match message.event.as_str() {
        "phx_reply" if message.msg_ref.as_deref() == Some(JOIN_REF) => {
            let status = message.payload["status"].as_str().unwrap_or_default();
            if status == "ok" {
                Ok(Some(RealtimeFrame::JoinAccepted))
            } else {
                Ok(Some(RealtimeFrame::JoinRejected(message.payload["response"].to_string())))
            }
        }
        "postgres_changes" => decode_change(&message.payload).map(|c| Some(RealtimeFrame::Change(c))),
        "phx_error" => Ok(Some(RealtimeFrame::Closed("channel error".to_string()))),
        "phx_close" => Ok(Some(RealtimeFrame::Closed("channel closed by server".to_string()))),
        "system" if message.payload["status"].as_str() == Some("error") => {
            let reason = message.payload["message"].as_str().unwrap_or("system error");
            Ok(Some(RealtimeFrame::Closed(reason.to_string())))
        }
        _ => Ok(None),
    }
}

fn decode_change(payload: &Value) -> Result<RawChange, SyncError> {
    let data = &payload["data"];

    let kind = data["type"]
        .as_str()
        .and_then(ChangeKind::parse)
        .ok_or_else(|| SyncError::MalformedEvent(format!("unknown change type {}", data["type"])))?;

    let record = match kind {
        ChangeKind::Delete => data["old_record"].clone(),
        ChangeKind::Insert | ChangeKind::Update => data["record"].clone(),
    };

    if !record.is_object() {
        return Err(SyncError::MalformedEvent(format!("{:?} change without a record", kind)));
    }

    Ok(RawChange::new(kind, record))
}
