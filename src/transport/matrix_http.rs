// src/transport/matrix_http.rs

//! A `Transport` over the federation's client-server HTTP API. Deliberately
//! thin: no retries, rate-limiting, or sync-token persistence beyond what
//! makes each call functionally correct — those belong to a dedicated
//! transport client, not the engine core.

use crate::core::errors::{EngineError, EngineResult};
use crate::core::transport::{Membership, OutgoingMessage, PushEvent, RoomMember, Transport};
use crate::core::wire::StateEvent;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct MatrixHttpTransport {
    client: Client,
    homeserver_url: String,
    access_token: String,
    self_user_id: String,
    txn_seq: AtomicU64,
    push_tx: mpsc::Sender<PushEvent>,
    push_rx: StdMutex<Option<mpsc::Receiver<PushEvent>>>,
}

impl MatrixHttpTransport {
    pub fn new(homeserver_url: impl Into<String>, access_token: impl Into<String>, self_user_id: impl Into<String>) -> Self {
        let (push_tx, push_rx) = mpsc::channel(1024);
        Self {
            client: Client::new(),
            homeserver_url: homeserver_url.into(),
            access_token: access_token.into(),
            self_user_id: self_user_id.into(),
            txn_seq: AtomicU64::new(0),
            push_tx,
            push_rx: StdMutex::new(Some(push_rx)),
        }
    }

    fn next_txn_id(&self) -> String {
        format!("wardensync-{}", self.txn_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.homeserver_url.trim_end_matches('/'), path)
    }

    async fn get_json(&self, path: &str) -> EngineResult<Value> {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        check_status(&resp)?;
        Ok(resp.json().await?)
    }

    async fn put_json(&self, path: &str, body: Value) -> EngineResult<Value> {
        let resp = self
            .client
            .put(self.url(path))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        check_status(&resp)?;
        Ok(resp.json().await?)
    }

    async fn post_json(&self, path: &str, body: Value) -> EngineResult<Value> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        check_status(&resp)?;
        Ok(resp.json().await?)
    }

    /// Long-polls `/sync` and forwards timeline and state events for joined
    /// rooms into the push-event channel. Intended to run as a dedicated
    /// background task for the lifetime of the process.
    pub async fn run_sync_loop(&self) {
        let mut since: Option<String> = None;
        loop {
            let mut path = "/_matrix/client/v3/sync?timeout=30000".to_string();
            if let Some(token) = &since {
                path.push_str(&format!("&since={token}"));
            }
            let body = match self.get_json(&path).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(error = %e, "sync request failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };
            since = body.get("next_batch").and_then(|v| v.as_str()).map(str::to_string);

            if let Some(rooms) = body.get("rooms").and_then(|r| r.get("join")).and_then(|j| j.as_object()) {
                for (room_id, room_body) in rooms {
                    for key in ["state", "timeline"] {
                        let Some(events) = room_body.get(key).and_then(|s| s.get("events")).and_then(|e| e.as_array()) else {
                            continue;
                        };
                        for raw in events {
                            if let Ok(event) = serde_json::from_value::<StateEvent>(raw.clone()) {
                                let push = PushEvent { room_id: room_id.clone(), event };
                                if self.push_tx.send(push).await.is_err() {
                                    debug!("push-event channel closed, stopping sync loop");
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

fn check_status(resp: &reqwest::Response) -> EngineResult<()> {
    match resp.status() {
        StatusCode::FORBIDDEN => Err(EngineError::Permission(format!("{} {}", resp.status(), resp.url()))),
        status if status.is_client_error() || status.is_server_error() => {
            Err(EngineError::Fatal(format!("{} {}", status, resp.url())))
        }
        _ => Ok(()),
    }
}

#[derive(Deserialize)]
struct EventIdResponse {
    event_id: String,
}

#[derive(Deserialize)]
struct RoomIdResponse {
    room_id: String,
}

#[derive(Deserialize)]
struct JoinedRoomsResponse {
    joined_rooms: Vec<String>,
}

#[async_trait]
impl Transport for MatrixHttpTransport {
    async fn get_room_state(&self, room: &str) -> EngineResult<Vec<StateEvent>> {
        let value = self.get_json(&format!("/_matrix/client/v3/rooms/{room}/state")).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn get_room_state_event(
        &self,
        room: &str,
        event_type: &str,
        state_key: &str,
    ) -> EngineResult<Option<StateEvent>> {
        let path = format!("/_matrix/client/v3/rooms/{room}/state/{event_type}/{state_key}");
        let resp = self.client.get(self.url(&path)).bearer_auth(&self.access_token).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(&resp)?;
        let content: Value = resp.json().await?;
        Ok(Some(StateEvent {
            event_id: String::new(),
            room_id: room.to_string(),
            event_type: event_type.to_string(),
            state_key: state_key.to_string(),
            content,
            origin_server_ts: 0,
            sender: String::new(),
            unsigned: json!({}),
        }))
    }

    async fn send_state_event(
        &self,
        room: &str,
        event_type: &str,
        state_key: &str,
        content: Value,
    ) -> EngineResult<String> {
        let path = format!("/_matrix/client/v3/rooms/{room}/state/{event_type}/{state_key}");
        let value = self.put_json(&path, content).await?;
        Ok(serde_json::from_value::<EventIdResponse>(value)?.event_id)
    }

    async fn redact_event(&self, room: &str, event_id: &str, reason: Option<&str>) -> EngineResult<()> {
        let txn_id = self.next_txn_id();
        let path = format!("/_matrix/client/v3/rooms/{room}/redact/{event_id}/{txn_id}");
        let body = match reason {
            Some(reason) => json!({"reason": reason}),
            None => json!({}),
        };
        self.put_json(&path, body).await?;
        Ok(())
    }

    async fn ban_user(&self, user: &str, room: &str, reason: &str) -> EngineResult<()> {
        let path = format!("/_matrix/client/v3/rooms/{room}/ban");
        self.post_json(&path, json!({"user_id": user, "reason": reason})).await?;
        Ok(())
    }

    async fn kick_user(&self, user: &str, room: &str, reason: Option<&str>) -> EngineResult<()> {
        let path = format!("/_matrix/client/v3/rooms/{room}/kick");
        let mut body = json!({"user_id": user});
        if let Some(reason) = reason {
            body["reason"] = json!(reason);
        }
        self.post_json(&path, body).await?;
        Ok(())
    }

    async fn join_room(&self, room_or_alias: &str) -> EngineResult<String> {
        let path = format!("/_matrix/client/v3/join/{room_or_alias}");
        let value = self.post_json(&path, json!({})).await?;
        Ok(serde_json::from_value::<RoomIdResponse>(value)?.room_id)
    }

    async fn resolve_alias(&self, alias: &str) -> EngineResult<String> {
        let path = format!("/_matrix/client/v3/directory/room/{alias}");
        let value = self.get_json(&path).await?;
        Ok(serde_json::from_value::<RoomIdResponse>(value)?.room_id)
    }

    async fn get_joined_rooms(&self) -> EngineResult<Vec<String>> {
        let value = self.get_json("/_matrix/client/v3/joined_rooms").await?;
        Ok(serde_json::from_value::<JoinedRoomsResponse>(value)?.joined_rooms)
    }

    async fn get_joined_room_members(&self, room: &str) -> EngineResult<Vec<String>> {
        let path = format!("/_matrix/client/v3/rooms/{room}/joined_members");
        let value = self.get_json(&path).await?;
        let joined = value.get("joined").and_then(|v| v.as_object()).cloned().unwrap_or_default();
        Ok(joined.keys().cloned().collect())
    }

    async fn get_room_members(&self, room: &str, include_leaves: bool) -> EngineResult<Vec<RoomMember>> {
        let path = format!("/_matrix/client/v3/rooms/{room}/members");
        let value = self.get_json(&path).await?;
        let chunk = value.get("chunk").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let mut members = Vec::new();
        for event in chunk {
            let Some(user_id) = event.get("state_key").and_then(|v| v.as_str()) else { continue };
            let Some(membership_str) = event.get("content").and_then(|c| c.get("membership")).and_then(|v| v.as_str()) else {
                continue;
            };
            let membership = match membership_str {
                "join" => Membership::Join,
                "leave" => Membership::Leave,
                "ban" => Membership::Ban,
                "invite" => Membership::Invite,
                "knock" => Membership::Knock,
                _ => continue,
            };
            if !include_leaves && membership != Membership::Join {
                continue;
            }
            members.push(RoomMember { user_id: user_id.to_string(), membership });
        }
        Ok(members)
    }

    async fn send_message(&self, room: &str, message: OutgoingMessage) -> EngineResult<()> {
        let txn_id = self.next_txn_id();
        let path = format!("/_matrix/client/v3/rooms/{room}/send/m.room.message/{txn_id}");
        let mut content = json!({"msgtype": message.msgtype, "body": message.body});
        if let Some(format) = &message.format {
            content["format"] = json!(format);
        }
        if let Some(formatted_body) = &message.formatted_body {
            content["formatted_body"] = json!(formatted_body);
        }
        self.put_json(&path, content).await?;
        Ok(())
    }

    async fn get_account_data(&self, event_type: &str) -> EngineResult<Option<Value>> {
        let path = format!("/_matrix/client/v3/user/{}/account_data/{event_type}", self.self_user_id);
        let resp = self.client.get(self.url(&path)).bearer_auth(&self.access_token).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(&resp)?;
        Ok(Some(resp.json().await?))
    }

    async fn set_account_data(&self, event_type: &str, content: Value) -> EngineResult<()> {
        let path = format!("/_matrix/client/v3/user/{}/account_data/{event_type}", self.self_user_id);
        self.put_json(&path, content).await?;
        Ok(())
    }

    async fn messages_since_last_join(&self, room: &str, user: &str) -> EngineResult<Vec<String>> {
        let path = format!("/_matrix/client/v3/rooms/{room}/messages?dir=b&limit=100");
        let value = self.get_json(&path).await?;
        let chunk = value.get("chunk").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let mut event_ids = Vec::new();
        for event in chunk {
            let Some(sender) = event.get("sender").and_then(|v| v.as_str()) else { continue };
            if sender != user {
                continue;
            }
            if event.get("type").and_then(|v| v.as_str()) == Some("m.room.member") {
                break;
            }
            if let Some(event_id) = event.get("event_id").and_then(|v| v.as_str()) {
                event_ids.push(event_id.to_string());
            }
        }
        Ok(event_ids)
    }

    fn take_push_events(&self) -> Option<mpsc::Receiver<PushEvent>> {
        self.push_rx.lock().unwrap().take()
    }
}
