//! Matrix client-server API transport (v3 endpoints) over reqwest.
//!
//! Besides the `Transport` operations the scheduler needs, this client
//! carries the few calls the listener uses: `/sync`, joining invited rooms,
//! and reading a room's power levels.
//!
//! Throttled requests (HTTP 429 / `M_LIMIT_EXCEEDED`) are retried here,
//! honouring the server's `retry_after_ms`. Anything else comes back as a
//! `Transport` error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{DestroyerError, Result};
use crate::transport::events::Redaction;
use crate::transport::{ContextPage, Direction, MessagesPage, RoomEvent, Transport};

/// Retries allowed for a single throttled request.
const MAX_RATE_LIMIT_RETRIES: u32 = 5;

/// Fallback wait when the server throttles without a `retry_after_ms`.
const DEFAULT_RETRY_AFTER_MS: u64 = 1_000;

/// Timeline events requested per room in each sync response.
const SYNC_TIMELINE_LIMIT: u32 = 50;

pub struct MatrixClient {
    http: Client,
    homeserver: Url,
    user_id: String,
    access_token: String,
    txn_counter: AtomicU64,
}

/// A text message seen during sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub room_id: String,
    pub event_id: String,
    pub sender: String,
    pub body: String,
    pub timestamp: i64,
}

/// What one `/sync` round returned that the bot cares about.
#[derive(Debug, Clone, Default)]
pub struct SyncBatch {
    pub next_batch: String,
    pub messages: Vec<IncomingMessage>,
    /// Rooms the bot has been invited to.
    pub invites: Vec<String>,
}

#[derive(Deserialize)]
struct WireEvent {
    event_id: String,
    #[serde(rename = "type")]
    event_type: Option<String>,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    origin_server_ts: i64,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    redacted_because: Option<WireRedaction>,
    #[serde(default)]
    unsigned: Option<WireUnsigned>,
}

#[derive(Deserialize)]
struct WireUnsigned {
    #[serde(default)]
    redacted_because: Option<WireRedaction>,
}

#[derive(Deserialize)]
struct WireRedaction {
    #[serde(rename = "type")]
    event_type: Option<String>,
    #[serde(default)]
    sender: String,
}

impl WireEvent {
    fn into_room_event(self) -> RoomEvent {
        let redaction = self
            .unsigned
            .and_then(|u| u.redacted_because)
            .or(self.redacted_because)
            .map(|r| Redaction {
                event_type: r.event_type.unwrap_or_else(|| "default".to_string()),
                sender: r.sender,
            });
        RoomEvent {
            event_id: self.event_id,
            timestamp: self.origin_server_ts,
            event_type: self.event_type.unwrap_or_else(|| "default".to_string()),
            sender: self.sender,
            redacted_because: redaction,
        }
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    chunk: Vec<WireEvent>,
    start: String,
    #[serde(default)]
    end: Option<String>,
}

#[derive(Deserialize)]
struct ContextResponse {
    #[serde(default)]
    events_after: Vec<WireEvent>,
    #[serde(default)]
    start: Option<String>,
    #[serde(default)]
    end: Option<String>,
}

#[derive(Deserialize)]
struct EventIdResponse {
    event_id: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errcode: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    retry_after_ms: Option<u64>,
}

#[derive(Deserialize)]
struct PowerLevels {
    #[serde(default)]
    users: HashMap<String, i64>,
    #[serde(default)]
    users_default: i64,
}

#[derive(Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: SyncRooms,
}

#[derive(Deserialize, Default)]
struct SyncRooms {
    #[serde(default)]
    join: HashMap<String, JoinedRoom>,
    #[serde(default)]
    invite: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct JoinedRoom {
    #[serde(default)]
    timeline: SyncTimeline,
}

#[derive(Deserialize, Default)]
struct SyncTimeline {
    #[serde(default)]
    events: Vec<WireEvent>,
}

impl MatrixClient {
    pub fn new(
        homeserver_url: &str,
        user_id: impl Into<String>,
        access_token: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let homeserver = Url::parse(homeserver_url).map_err(|e| DestroyerError::Config {
            reason: format!("invalid homeserver_url '{homeserver_url}': {e}"),
        })?;
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            homeserver,
            user_id: user_id.into(),
            access_token: access_token.into(),
            txn_counter: AtomicU64::new(0),
        })
    }

    /// Build `<homeserver>/_matrix/client/v3/<segments..>`, percent-encoding each segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .map_err(|_| DestroyerError::Config {
                reason: format!("homeserver_url cannot be a base: {}", self.homeserver),
            })?
            .pop_if_empty()
            .extend(["_matrix", "client", "v3"])
            .extend(segments);
        Ok(url)
    }

    fn next_txn_id(&self) -> String {
        let n = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        format!("destroyer.{}.{}", Utc::now().timestamp_millis(), n)
    }

    /// Send a request, retrying while the server throttles us.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            let mut req = self
                .http
                .request(method.clone(), url.clone())
                .bearer_auth(&self.access_token)
                .query(query);
            if let Some(body) = body {
                req = req.json(body);
            }
            let resp = req.send().await?;
            let status = resp.status();

            if status.is_success() {
                return Ok(resp.json::<T>().await?);
            }

            let text = resp.text().await.unwrap_or_default();
            let err: Option<ErrorResponse> = serde_json::from_str(&text).ok();

            let throttled = status == StatusCode::TOO_MANY_REQUESTS
                || err
                    .as_ref()
                    .and_then(|e| e.errcode.as_deref())
                    .is_some_and(|c| c == "M_LIMIT_EXCEEDED");
            if throttled && attempt < MAX_RATE_LIMIT_RETRIES {
                attempt += 1;
                let wait = err
                    .as_ref()
                    .and_then(|e| e.retry_after_ms)
                    .unwrap_or(DEFAULT_RETRY_AFTER_MS);
                tracing::debug!(
                    path = %url.path(),
                    attempt,
                    retry_after_ms = wait,
                    "rate limited, retrying"
                );
                tokio::time::sleep(Duration::from_millis(wait)).await;
                continue;
            }

            let reason = match err {
                Some(ErrorResponse {
                    errcode: Some(code),
                    error,
                    ..
                }) => format!("{code}: {}", error.unwrap_or_default()),
                _ if !text.is_empty() => text,
                _ => status.canonical_reason().unwrap_or("request failed").to_string(),
            };
            return Err(DestroyerError::transport(Some(status.as_u16()), reason));
        }
    }

    /// Long-poll `/sync`. `since = None` performs the initial sync.
    pub async fn sync(&self, since: Option<&str>, timeout_ms: u64) -> Result<SyncBatch> {
        let url = self.endpoint(&["sync"])?;
        let filter = json!({ "room": { "timeline": { "limit": SYNC_TIMELINE_LIMIT } } });
        let mut query = vec![
            ("timeout", timeout_ms.to_string()),
            ("filter", filter.to_string()),
        ];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }
        let resp: SyncResponse = self.request(Method::GET, url, &query, None).await?;

        let mut messages = Vec::new();
        for (room_id, room) in resp.rooms.join {
            for ev in room.timeline.events {
                if ev.event_type.as_deref() != Some("m.room.message") {
                    continue;
                }
                let Some(body) = ev.content.get("body").and_then(Value::as_str) else {
                    continue;
                };
                messages.push(IncomingMessage {
                    room_id: room_id.clone(),
                    event_id: ev.event_id.clone(),
                    sender: ev.sender.clone(),
                    body: body.to_string(),
                    timestamp: ev.origin_server_ts,
                });
            }
        }

        Ok(SyncBatch {
            next_batch: resp.next_batch,
            messages,
            invites: resp.rooms.invite.into_keys().collect(),
        })
    }

    pub async fn join(&self, room_id: &str) -> Result<()> {
        let url = self.endpoint(&["join", room_id])?;
        let _: Value = self
            .request(Method::POST, url, &[], Some(&json!({})))
            .await?;
        Ok(())
    }

    /// Power level of `user_id` in a room, per its `m.room.power_levels` state.
    pub async fn user_power_level(&self, room_id: &str, user_id: &str) -> Result<i64> {
        let url = self.endpoint(&["rooms", room_id, "state", "m.room.power_levels"])?;
        let levels: PowerLevels = self.request(Method::GET, url, &[], None).await?;
        Ok(levels
            .users
            .get(user_id)
            .copied()
            .unwrap_or(levels.users_default))
    }
}

#[async_trait]
impl Transport for MatrixClient {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn list_messages(
        &self,
        room_id: &str,
        from: Option<&str>,
        direction: Direction,
        limit: u32,
    ) -> Result<MessagesPage> {
        let url = self.endpoint(&["rooms", room_id, "messages"])?;
        let mut query = vec![
            ("dir", direction.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(from) = from {
            query.push(("from", from.to_string()));
        }
        let resp: MessagesResponse = self.request(Method::GET, url, &query, None).await?;
        Ok(MessagesPage {
            events: resp.chunk.into_iter().map(WireEvent::into_room_event).collect(),
            start: resp.start,
            end: resp.end,
        })
    }

    async fn get_context(&self, room_id: &str, event_id: &str, limit: u32) -> Result<ContextPage> {
        let url = self.endpoint(&["rooms", room_id, "context", event_id])?;
        let query = [("limit", limit.to_string())];
        let resp: ContextResponse = self.request(Method::GET, url, &query, None).await?;
        Ok(ContextPage {
            events_after: resp
                .events_after
                .into_iter()
                .map(WireEvent::into_room_event)
                .collect(),
            start: resp.start,
            end: resp.end,
        })
    }

    async fn redact(&self, room_id: &str, event_id: &str) -> Result<()> {
        let txn = self.next_txn_id();
        let url = self.endpoint(&["rooms", room_id, "redact", event_id, &txn])?;
        let body = json!({ "reason": "message expired" });
        let _: EventIdResponse = self.request(Method::PUT, url, &[], Some(&body)).await?;
        Ok(())
    }

    async fn send_notice(
        &self,
        room_id: &str,
        body: &str,
        reply_to: Option<&str>,
    ) -> Result<String> {
        let txn = self.next_txn_id();
        let url = self.endpoint(&["rooms", room_id, "send", "m.room.message", &txn])?;
        let mut content = json!({ "msgtype": "m.notice", "body": body });
        if let Some(reply_to) = reply_to {
            content["m.relates_to"] = json!({ "m.in_reply_to": { "event_id": reply_to } });
        }
        let resp: EventIdResponse = self.request(Method::PUT, url, &[], Some(&content)).await?;
        Ok(resp.event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(hs: &str) -> MatrixClient {
        MatrixClient::new(hs, "@bot:example.org", "token", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn endpoint_encodes_room_and_event_ids() {
        let c = client("https://matrix.example.org");
        let url = c
            .endpoint(&["rooms", "!abc:example.org", "context", "$ev/1"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://matrix.example.org/_matrix/client/v3/rooms/!abc:example.org/context/$ev%2F1"
        );
    }

    #[test]
    fn endpoint_keeps_homeserver_path_prefix() {
        let c = client("https://example.org/matrix/");
        let url = c.endpoint(&["sync"]).unwrap();
        assert_eq!(url.path(), "/matrix/_matrix/client/v3/sync");
    }

    #[test]
    fn invalid_homeserver_is_config_error() {
        let err = MatrixClient::new("not a url", "@b:x", "t", Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("invalid homeserver_url"));
    }

    #[test]
    fn wire_event_reads_unsigned_redaction() {
        let raw = json!({
            "event_id": "$a",
            "type": "m.room.message",
            "sender": "@alice:x",
            "origin_server_ts": 42,
            "unsigned": { "redacted_because": { "type": "m.room.redaction", "sender": "@bot:x" } }
        });
        let ev: WireEvent = serde_json::from_value(raw).unwrap();
        let ev = ev.into_room_event();
        assert_eq!(ev.timestamp, 42);
        assert!(ev.is_redacted_by("@bot:x"));
    }

    #[test]
    fn wire_event_without_type_is_default_and_exempt() {
        let raw = json!({ "event_id": "$a", "origin_server_ts": 1 });
        let ev: WireEvent = serde_json::from_value(raw).unwrap();
        let ev = ev.into_room_event();
        assert_eq!(ev.event_type, "default");
        assert!(ev.is_exempt());
    }

    #[test]
    fn txn_ids_are_unique() {
        let c = client("https://matrix.example.org");
        assert_ne!(c.next_txn_id(), c.next_txn_id());
    }
}
