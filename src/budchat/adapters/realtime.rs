//! Change stream and presence over the hosted backend's realtime socket.
//!
//! Each subscription opens its own socket and speaks the Phoenix channel
//! protocol on it: a `phx_join` confirmed by a `phx_reply`, a heartbeat on the
//! `phoenix` topic, and `phx_leave` when the consumer lets go.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::budchat::BackendConfig;
use crate::budchat::capabilities::{
    ChangeFeed, PresenceCommand, PresenceEndpoint, PresenceHandle, PresenceMeta, PresenceService,
    PresenceSignal, PresenceState, Subscription, SubscriptionFeed, presence_channel,
    subscription_channel,
};
use crate::budchat::error::{BudChatError, Result, SubscriptionError};
use crate::budchat::messages::{MessagePatch, MessageRow, RecordChange};
use crate::budchat::profiles::Profile;
use crate::types::{MessageId, UserId};

const CHANGES_TOPIC: &str = "realtime:public:messages";
const HEARTBEAT_TOPIC: &str = "phoenix";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const FEED_BUFFER: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One Phoenix channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JoinReply {
    status: String,
    #[serde(default)]
    response: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Deserialize)]
struct PostgresChange {
    table: String,
    #[serde(rename = "type")]
    kind: ChangeKind,
    #[serde(default)]
    record: Value,
    #[serde(default)]
    old_record: Value,
}

#[derive(Debug, Deserialize)]
struct PostgresChangesPayload {
    data: PostgresChange,
}

#[derive(Debug, Deserialize)]
struct DeletedRow {
    id: MessageId,
}

/// Translates a `postgres_changes` payload into a change event.
///
/// Returns `None` for tables and event kinds the feed does not carry.
pub fn decode_postgres_change(payload: &Value) -> std::result::Result<Option<RecordChange>, SubscriptionError> {
    let decoded: PostgresChangesPayload = serde_json::from_value(payload.clone())
        .map_err(|e| SubscriptionError::Protocol(format!("malformed change payload: {e}")))?;
    let change = decoded.data;
    let protocol = |e: serde_json::Error| {
        SubscriptionError::Protocol(format!("malformed {} record: {e}", change.table))
    };

    let event = match (change.table.as_str(), change.kind) {
        ("messages", ChangeKind::Insert) => Some(RecordChange::MessageInserted(
            serde_json::from_value::<MessageRow>(change.record.clone()).map_err(protocol)?,
        )),
        ("messages", ChangeKind::Update) => Some(RecordChange::MessageUpdated(
            serde_json::from_value::<MessagePatch>(change.record.clone()).map_err(protocol)?,
        )),
        ("messages", ChangeKind::Delete) => {
            let row: DeletedRow =
                serde_json::from_value(change.old_record.clone()).map_err(protocol)?;
            Some(RecordChange::MessageDeleted { id: row.id })
        }
        ("profiles", ChangeKind::Update) => Some(RecordChange::ProfileUpdated(
            serde_json::from_value::<Profile>(change.record.clone()).map_err(protocol)?,
        )),
        _ => None,
    };
    Ok(event)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct WireMeta {
    #[serde(default)]
    phx_ref: Option<String>,
    #[serde(default)]
    online_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct WireEntry {
    #[serde(default)]
    metas: Vec<WireMeta>,
}

#[derive(Debug, Default, Deserialize)]
struct PresenceDiff {
    #[serde(default)]
    joins: HashMap<UserId, WireEntry>,
    #[serde(default)]
    leaves: HashMap<UserId, WireEntry>,
}

/// Membership of a presence room as assembled from `presence_state` and `presence_diff`.
#[derive(Debug, Default, Clone)]
pub struct PresenceMembers {
    members: HashMap<UserId, Vec<WireMeta>>,
}

impl PresenceMembers {
    /// Replaces the whole membership with a `presence_state` payload.
    pub fn replace_state(&mut self, payload: &Value) -> std::result::Result<(), SubscriptionError> {
        let state: HashMap<UserId, WireEntry> = serde_json::from_value(payload.clone())
            .map_err(|e| SubscriptionError::Protocol(format!("malformed presence state: {e}")))?;
        self.members = state
            .into_iter()
            .filter(|(_, entry)| !entry.metas.is_empty())
            .map(|(user, entry)| (user, entry.metas))
            .collect();
        Ok(())
    }

    /// Applies a `presence_diff` payload. Leaves are applied after joins.
    pub fn apply_diff(&mut self, payload: &Value) -> std::result::Result<(), SubscriptionError> {
        let diff: PresenceDiff = serde_json::from_value(payload.clone())
            .map_err(|e| SubscriptionError::Protocol(format!("malformed presence diff: {e}")))?;

        for (user, entry) in diff.joins {
            let metas = self.members.entry(user).or_default();
            for meta in entry.metas {
                if !metas.contains(&meta) {
                    metas.push(meta);
                }
            }
        }

        for (user, entry) in diff.leaves {
            let Some(metas) = self.members.get_mut(&user) else {
                continue;
            };
            let left: Vec<Option<String>> = entry.metas.into_iter().map(|m| m.phx_ref).collect();
            // A leave without refs drops every connection of that member.
            if left.iter().all(Option::is_none) {
                metas.clear();
            } else {
                metas.retain(|meta| !left.contains(&meta.phx_ref));
            }
            if metas.is_empty() {
                self.members.remove(&user);
            }
        }
        Ok(())
    }

    pub fn state(&self) -> PresenceState {
        self.members
            .iter()
            .map(|(user, metas)| {
                let metas = metas
                    .iter()
                    .map(|meta| PresenceMeta {
                        online_at: meta.online_at,
                    })
                    .collect();
                (user.clone(), metas)
            })
            .collect()
    }
}

/// Builds `ws(s)://<host>/realtime/v1/websocket?apikey=...&vsn=1.0.0` from the REST base URL.
pub fn socket_url(config: &BackendConfig) -> Result<Url> {
    let mut url = config.base_url()?;
    let scheme = match url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| BudChatError::Configuration(format!("cannot derive socket url from {}", config.url)))?;
    url.set_path("/realtime/v1/websocket");
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", &config.anon_key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

/// An open socket joined to a single channel topic.
struct ChannelSocket {
    topic: String,
    sink: SplitSink<WsStream, WsMessage>,
    stream: SplitStream<WsStream>,
    next_ref: u64,
}

impl ChannelSocket {
    async fn open(
        url: &Url,
        topic: &str,
        join_payload: Value,
    ) -> std::result::Result<Self, SubscriptionError> {
        let (ws_stream, _) = tokio::time::timeout(JOIN_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| SubscriptionError::Connect("connection timed out".to_string()))?
            .map_err(|e| SubscriptionError::Connect(e.to_string()))?;
        let (sink, stream) = ws_stream.split();
        let mut socket = Self {
            topic: topic.to_string(),
            sink,
            stream,
            next_ref: 0,
        };

        let join_ref = socket.push("phx_join", join_payload).await?;
        tokio::time::timeout(JOIN_TIMEOUT, socket.await_reply(&join_ref))
            .await
            .map_err(|_| SubscriptionError::JoinRejected {
                topic: topic.to_string(),
                reason: "join timed out".to_string(),
            })??;

        tracing::debug!(
            target: "budchat::adapters::realtime::open",
            "Joined channel {}",
            topic
        );
        Ok(socket)
    }

    async fn await_reply(&mut self, join_ref: &str) -> std::result::Result<(), SubscriptionError> {
        while let Some(frame) = read_frame(&mut self.stream).await {
            let frame = frame?;
            if frame.event != "phx_reply" || frame.reference.as_deref() != Some(join_ref) {
                continue;
            }
            let reply: JoinReply = serde_json::from_value(frame.payload)
                .map_err(|e| SubscriptionError::Protocol(format!("malformed join reply: {e}")))?;
            if reply.status == "ok" {
                return Ok(());
            }
            return Err(SubscriptionError::JoinRejected {
                topic: self.topic.clone(),
                reason: reply
                    .response
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or(reply.status.as_str())
                    .to_string(),
            });
        }
        Err(SubscriptionError::Closed)
    }

    async fn push(&mut self, event: &str, payload: Value) -> std::result::Result<String, SubscriptionError> {
        let topic = self.topic.clone();
        self.push_to(&topic, event, payload).await
    }

    async fn push_to(
        &mut self,
        topic: &str,
        event: &str,
        payload: Value,
    ) -> std::result::Result<String, SubscriptionError> {
        self.next_ref += 1;
        let reference = self.next_ref.to_string();
        let frame = PhoenixFrame {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(reference.clone()),
        };
        let text = serde_json::to_string(&frame)
            .map_err(|e| SubscriptionError::Protocol(e.to_string()))?;
        self.sink
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| SubscriptionError::Connect(e.to_string()))?;
        Ok(reference)
    }

    async fn heartbeat(&mut self) -> std::result::Result<(), SubscriptionError> {
        self.push_to(HEARTBEAT_TOPIC, "heartbeat", json!({})).await?;
        Ok(())
    }

    async fn leave(mut self) {
        if let Err(e) = self.push("phx_leave", json!({})).await {
            tracing::debug!(
                target: "budchat::adapters::realtime::leave",
                "Failed to leave {}: {}",
                self.topic,
                e
            );
        }
        let _ = self.sink.close().await;
    }
}

/// Next Phoenix frame. `None` once the socket is closed.
async fn read_frame(
    stream: &mut SplitStream<WsStream>,
) -> Option<std::result::Result<PhoenixFrame, SubscriptionError>> {
    loop {
        match stream.next().await? {
            Ok(WsMessage::Text(text)) => {
                return Some(serde_json::from_str::<PhoenixFrame>(&text).map_err(|e| {
                    SubscriptionError::Protocol(format!("malformed frame: {e}"))
                }));
            }
            Ok(WsMessage::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => return Some(Err(SubscriptionError::Connect(e.to_string()))),
        }
    }
}

fn is_channel_closed(frame: &PhoenixFrame) -> bool {
    matches!(frame.event.as_str(), "phx_close" | "phx_error")
}

#[derive(Clone)]
pub struct RealtimeClient {
    socket_url: Url,
    access_token: String,
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("host", &self.socket_url.host_str())
            .field("path", &self.socket_url.path())
            .finish()
    }
}

impl RealtimeClient {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            socket_url: socket_url(config)?,
            access_token: config.bearer().to_string(),
        })
    }

    fn changes_join_payload(&self) -> Value {
        json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [
                    { "event": "*", "schema": "public", "table": "messages" },
                    { "event": "UPDATE", "schema": "public", "table": "profiles" }
                ]
            },
            "access_token": self.access_token,
        })
    }

    fn presence_join_payload(&self, local_identity: &UserId) -> Value {
        json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": local_identity.as_str() }
            },
            "access_token": self.access_token,
        })
    }
}

#[async_trait]
impl ChangeFeed for RealtimeClient {
    async fn subscribe_to_changes(
        &self,
    ) -> std::result::Result<Subscription<RecordChange>, SubscriptionError> {
        let socket =
            ChannelSocket::open(&self.socket_url, CHANGES_TOPIC, self.changes_join_payload())
                .await?;
        let (feed, subscription) = subscription_channel(FEED_BUFFER);
        tokio::spawn(run_change_feed(socket, feed));
        Ok(subscription)
    }
}

#[async_trait]
impl PresenceService for RealtimeClient {
    async fn join_presence_room(
        &self,
        room_key: &str,
        local_identity: &UserId,
    ) -> std::result::Result<PresenceHandle, SubscriptionError> {
        let topic = format!("realtime:{room_key}");
        let socket = ChannelSocket::open(
            &self.socket_url,
            &topic,
            self.presence_join_payload(local_identity),
        )
        .await?;
        let (endpoint, handle) = presence_channel(FEED_BUFFER);
        tokio::spawn(run_presence(socket, endpoint));
        Ok(handle)
    }
}

async fn run_change_feed(mut socket: ChannelSocket, feed: SubscriptionFeed<RecordChange>) {
    let SubscriptionFeed {
        sender,
        mut cancelled,
    } = feed;
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = &mut cancelled => {
                socket.leave().await;
                return;
            }
            _ = heartbeat.tick() => {
                if let Err(e) = socket.heartbeat().await {
                    tracing::warn!(
                        target: "budchat::adapters::realtime::run_change_feed",
                        "Heartbeat failed: {}",
                        e
                    );
                    return;
                }
            }
            frame = read_frame(&mut socket.stream) => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        tracing::warn!(
                            target: "budchat::adapters::realtime::run_change_feed",
                            "Change stream broke: {}",
                            e
                        );
                        return;
                    }
                    None => {
                        tracing::info!(
                            target: "budchat::adapters::realtime::run_change_feed",
                            "Change stream socket closed"
                        );
                        return;
                    }
                };

                if is_channel_closed(&frame) {
                    tracing::warn!(
                        target: "budchat::adapters::realtime::run_change_feed",
                        "Channel {} closed by server",
                        frame.topic
                    );
                    return;
                }
                if frame.event != "postgres_changes" {
                    continue;
                }

                match decode_postgres_change(&frame.payload) {
                    Ok(Some(change)) => {
                        if sender.send(change).await.is_err() {
                            socket.leave().await;
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(
                            target: "budchat::adapters::realtime::run_change_feed",
                            "Skipping undecodable change: {}",
                            e
                        );
                    }
                }
            }
        }
    }
}

async fn run_presence(mut socket: ChannelSocket, endpoint: PresenceEndpoint) {
    let PresenceEndpoint {
        signals,
        mut commands,
    } = endpoint;
    let mut members = PresenceMembers::default();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    if signals.send(PresenceSignal::Subscribed).await.is_err() {
        socket.leave().await;
        return;
    }

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PresenceCommand::Announce { online_at }) => {
                    let track = json!({
                        "type": "presence",
                        "event": "track",
                        "payload": { "online_at": online_at },
                    });
                    if let Err(e) = socket.push("presence", track).await {
                        let _ = signals.send(PresenceSignal::Closed(Some(e))).await;
                        return;
                    }
                }
                Some(PresenceCommand::Leave) | None => {
                    let untrack = json!({ "type": "presence", "event": "untrack" });
                    let _ = socket.push("presence", untrack).await;
                    socket.leave().await;
                    return;
                }
            },
            _ = heartbeat.tick() => {
                if let Err(e) = socket.heartbeat().await {
                    let _ = signals.send(PresenceSignal::Closed(Some(e))).await;
                    return;
                }
            }
            frame = read_frame(&mut socket.stream) => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        let _ = signals.send(PresenceSignal::Closed(Some(e))).await;
                        return;
                    }
                    None => {
                        let _ = signals.send(PresenceSignal::Closed(None)).await;
                        return;
                    }
                };

                let applied = match frame.event.as_str() {
                    "presence_state" => members.replace_state(&frame.payload),
                    "presence_diff" => members.apply_diff(&frame.payload),
                    _ if is_channel_closed(&frame) => {
                        let _ = signals
                            .send(PresenceSignal::Closed(Some(SubscriptionError::Closed)))
                            .await;
                        return;
                    }
                    _ => continue,
                };

                match applied {
                    Ok(()) => {
                        if signals.send(PresenceSignal::Sync(members.state())).await.is_err() {
                            socket.leave().await;
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            target: "budchat::adapters::realtime::run_presence",
                            "Skipping undecodable presence update: {}",
                            e
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;

    fn change_payload(table: &str, kind: &str, record: Value, old_record: Value) -> Value {
        json!({
            "ids": [1],
            "data": {
                "schema": "public",
                "table": table,
                "commit_timestamp": "2025-01-01T10:00:00Z",
                "type": kind,
                "columns": [],
                "record": record,
                "old_record": old_record,
                "errors": null
            }
        })
    }

    #[test]
    fn test_decode_insert() {
        let payload = change_payload(
            "messages",
            "INSERT",
            json!({"id":"m1","content":"hi","created_at":"2025-01-01T10:00:00Z","updated_at":null,"user_id":"u1","parent_message_id":null}),
            json!({}),
        );
        match decode_postgres_change(&payload).unwrap() {
            Some(RecordChange::MessageInserted(row)) => {
                assert_eq!(row.id, MessageId::new("m1"));
                assert_eq!(row.user_id, Some(UserId::new("u1")));
                assert!(row.profiles.is_none());
            }
            other => panic!("unexpected change: {:?}", other),
        }
    }

    #[test]
    fn test_decode_update_and_delete() {
        let update = change_payload(
            "messages",
            "UPDATE",
            json!({"id":"m1","content":"edited","updated_at":"2025-01-01T11:00:00Z"}),
            json!({"id":"m1"}),
        );
        match decode_postgres_change(&update).unwrap() {
            Some(RecordChange::MessageUpdated(patch)) => {
                assert_eq!(patch.content.as_deref(), Some("edited"));
                assert!(matches!(patch.updated_at, Some(Some(_))));
                assert!(patch.parent_message_id.is_none());
            }
            other => panic!("unexpected change: {:?}", other),
        }

        let delete = change_payload("messages", "DELETE", Value::Null, json!({"id":"m1"}));
        assert_eq!(
            decode_postgres_change(&delete).unwrap(),
            Some(RecordChange::MessageDeleted {
                id: MessageId::new("m1")
            })
        );
    }

    #[test]
    fn test_decode_profile_update_and_ignored_tables() {
        let profile = change_payload(
            "profiles",
            "UPDATE",
            json!({"id":"u1","username":"ada","avatar_url":null,"status":"online","personal_message":"brb"}),
            json!({}),
        );
        match decode_postgres_change(&profile).unwrap() {
            Some(RecordChange::ProfileUpdated(p)) => {
                assert_eq!(p.personal_message.as_deref(), Some("brb"))
            }
            other => panic!("unexpected change: {:?}", other),
        }

        let ignored = change_payload("reactions", "INSERT", json!({"id": 1}), json!({}));
        assert_eq!(decode_postgres_change(&ignored).unwrap(), None);

        let profile_insert = change_payload("profiles", "INSERT", json!({"id":"u2"}), json!({}));
        assert_eq!(decode_postgres_change(&profile_insert).unwrap(), None);
    }

    #[test]
    fn test_decode_malformed_record_is_protocol_error() {
        let payload = change_payload("messages", "INSERT", json!({"content": 3}), json!({}));
        assert!(matches!(
            decode_postgres_change(&payload),
            Err(SubscriptionError::Protocol(_))
        ));
    }

    #[test]
    fn test_presence_state_then_diff() {
        let mut members = PresenceMembers::default();
        members
            .replace_state(&json!({
                "a": {"metas": [{"phx_ref": "r1", "online_at": "2025-01-01T10:00:00Z"}]},
                "b": {"metas": [{"phx_ref": "r2"}]}
            }))
            .unwrap();
        let state = members.state();
        assert_eq!(state.len(), 2);
        assert!(state[&UserId::new("a")][0].online_at.is_some());

        members
            .apply_diff(&json!({
                "joins": {"c": {"metas": [{"phx_ref": "r3"}]}},
                "leaves": {"b": {"metas": [{"phx_ref": "r2"}]}}
            }))
            .unwrap();
        let mut online: Vec<String> = members
            .state()
            .keys()
            .map(|user| user.to_string())
            .collect();
        online.sort();
        assert_eq!(online, vec!["a", "c"]);
    }

    #[test]
    fn test_presence_leave_of_one_connection_keeps_member() {
        let mut members = PresenceMembers::default();
        members
            .apply_diff(&json!({
                "joins": {"a": {"metas": [{"phx_ref": "r1"}, {"phx_ref": "r2"}]}}
            }))
            .unwrap();
        members
            .apply_diff(&json!({"leaves": {"a": {"metas": [{"phx_ref": "r1"}]}}}))
            .unwrap();
        assert_eq!(members.state()[&UserId::new("a")].len(), 1);

        members
            .apply_diff(&json!({"leaves": {"a": {"metas": [{"phx_ref": "r2"}]}}}))
            .unwrap();
        assert!(members.state().is_empty());
    }

    #[test]
    fn test_socket_url_from_backend_url() {
        let config = BackendConfig::new("https://xyz.supabase.co/", "anon");
        let url = socket_url(&config).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://xyz.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );

        let local = BackendConfig::new("http://127.0.0.1:54321", "anon");
        assert_eq!(socket_url(&local).unwrap().scheme(), "ws");
    }

    #[test]
    fn test_frame_wire_names() {
        let frame = PhoenixFrame {
            topic: "phoenix".to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            reference: Some("7".to_string()),
        };
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["ref"], "7");

        let inbound: PhoenixFrame =
            serde_json::from_str(r#"{"topic":"t","event":"phx_close","payload":{},"ref":null}"#)
                .unwrap();
        assert!(is_channel_closed(&inbound));
    }

    #[test]
    fn test_debug_hides_api_key() {
        let client = RealtimeClient::new(&BackendConfig::new("https://x.supabase.co", "secret")).unwrap();
        assert!(!format!("{:?}", client).contains("secret"));
    }

    /// Accepts one socket, answers the join with `status`, then sends `frames`
    /// and forwards everything the client writes afterwards.
    async fn spawn_channel_server(
        status: &'static str,
        frames: Vec<Value>,
    ) -> (BackendConfig, tokio::sync::mpsc::UnboundedReceiver<PhoenixFrame>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client_frames, received) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            let (mut sink, mut stream) = ws.split();

            let join = loop {
                if let Some(Ok(WsMessage::Text(text))) = stream.next().await {
                    break serde_json::from_str::<PhoenixFrame>(&text).unwrap();
                }
            };
            let reply = json!({
                "topic": join.topic,
                "event": "phx_reply",
                "payload": {"status": status, "response": {"reason": "unauthorized"}},
                "ref": join.reference,
            });
            let _ = client_frames.send(join);
            sink.send(WsMessage::Text(reply.to_string())).await.unwrap();

            for frame in frames {
                sink.send(WsMessage::Text(frame.to_string())).await.unwrap();
            }
            while let Some(Ok(message)) = stream.next().await {
                if let WsMessage::Text(text) = message {
                    if let Ok(frame) = serde_json::from_str::<PhoenixFrame>(&text) {
                        let _ = client_frames.send(frame);
                    }
                }
            }
        });

        (BackendConfig::new(format!("http://{addr}"), "anon"), received)
    }

    #[tokio::test]
    async fn test_change_feed_delivers_changes_and_leaves_on_unsubscribe() {
        let insert = json!({
            "topic": CHANGES_TOPIC,
            "event": "postgres_changes",
            "payload": change_payload(
                "messages",
                "INSERT",
                json!({"id":"m9","content":"hello","created_at":"2025-01-01T10:00:00Z","user_id":"u1"}),
                json!({}),
            ),
            "ref": null,
        });
        let (config, mut received) = spawn_channel_server("ok", vec![insert]).await;
        let client = RealtimeClient::new(&config).unwrap();

        let mut subscription = client.subscribe_to_changes().await.unwrap();
        let join = received.recv().await.unwrap();
        assert_eq!(join.event, "phx_join");
        assert_eq!(join.topic, CHANGES_TOPIC);

        match subscription.events.recv().await {
            Some(RecordChange::MessageInserted(row)) => assert_eq!(row.content, "hello"),
            other => panic!("unexpected event: {:?}", other),
        }

        subscription.unsubscribe.unsubscribe();
        let leave = tokio::time::timeout(Duration::from_secs(2), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leave.event, "phx_leave");
    }

    #[tokio::test]
    async fn test_rejected_join_is_subscription_error() {
        let (config, _received) = spawn_channel_server("error", vec![]).await;
        let client = RealtimeClient::new(&config).unwrap();

        match client.subscribe_to_changes().await {
            Err(SubscriptionError::JoinRejected { topic, reason }) => {
                assert_eq!(topic, CHANGES_TOPIC);
                assert_eq!(reason, "unauthorized");
            }
            other => panic!("expected join rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_presence_room_syncs_and_tracks() {
        let state = json!({
            "topic": "realtime:online-users",
            "event": "presence_state",
            "payload": {"u2": {"metas": [{"phx_ref": "r1"}]}},
            "ref": null,
        });
        let (config, mut received) = spawn_channel_server("ok", vec![state]).await;
        let client = RealtimeClient::new(&config).unwrap();

        let mut handle = client
            .join_presence_room("online-users", &UserId::new("u1"))
            .await
            .unwrap();
        let join = received.recv().await.unwrap();
        assert_eq!(join.topic, "realtime:online-users");
        assert_eq!(join.payload["config"]["presence"]["key"], "u1");

        assert_eq!(handle.recv().await, Some(PresenceSignal::Subscribed));
        match handle.recv().await {
            Some(PresenceSignal::Sync(state)) => {
                assert!(state.contains_key(&UserId::new("u2")))
            }
            other => panic!("unexpected signal: {:?}", other),
        }

        handle.announce(Utc::now()).await.unwrap();
        let track = received.recv().await.unwrap();
        assert_eq!(track.event, "presence");
        assert_eq!(track.payload["event"], "track");

        handle.leave();
        let untrack = received.recv().await.unwrap();
        assert_eq!(untrack.payload["event"], "untrack");
        let leave = received.recv().await.unwrap();
        assert_eq!(leave.event, "phx_leave");
    }
}
