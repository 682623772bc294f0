//! An in-memory, fully in-process [`Transport`] used by unit and integration
//! tests so the engine's public contracts can be exercised without a real
//! federation client. Not part of the engine's runtime surface; gated
//! behind the `test-support` feature so integration tests in `tests/` can
//! depend on it without pulling it into release builds.

use crate::core::errors::{EngineError, EngineResult};
use crate::core::policy_list::PolicyList;
use crate::core::rule::EntityKind;
use crate::core::transport::{Membership, OutgoingMessage, PushEvent, RoomMember, Transport};
use crate::core::wire::{event_types_for_kind, StateEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

type RoomKey = (String, String);

#[derive(Default)]
struct State {
    /// `room -> (event_type, state_key) -> event`.
    rooms: HashMap<String, HashMap<RoomKey, StateEvent>>,
    account_data: HashMap<String, Value>,
    joined_rooms: Vec<String>,
    joined_members: HashMap<String, Vec<String>>,
    full_members: HashMap<String, Vec<RoomMember>>,
    messages_since_join: HashMap<(String, String), Vec<String>>,
    bans: Vec<(String, String, String)>,
    kicks: Vec<(String, String)>,
    redactions: Vec<(String, String)>,
    sent_messages: Vec<(String, OutgoingMessage)>,
    /// Rooms in which any state write or ban should fail with `Permission`.
    permission_denied_rooms: HashSet<String>,
}

pub struct FakeTransport {
    state: Mutex<State>,
    event_seq: AtomicU64,
    push_tx: mpsc::Sender<PushEvent>,
    push_rx: Mutex<Option<mpsc::Receiver<PushEvent>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        let (push_tx, push_rx) = mpsc::channel(256);
        Self {
            state: Mutex::new(State::default()),
            event_seq: AtomicU64::new(0),
            push_tx,
            push_rx: Mutex::new(Some(push_rx)),
        }
    }

    fn next_event_id(&self) -> String {
        format!("$evt{}", self.event_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn put_state(&self, room: &str, event_type: &str, state_key: &str, content: Value) -> StateEvent {
        let event = StateEvent {
            event_id: self.next_event_id(),
            room_id: room.to_string(),
            event_type: event_type.to_string(),
            state_key: state_key.to_string(),
            content,
            origin_server_ts: 0,
            sender: "@fixture-mod:example.org".to_string(),
            unsigned: json!({}),
        };
        self.state
            .lock()
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert((event_type.to_string(), state_key.to_string()), event.clone());
        event
    }

    /// Writes a ban rule directly into `list`'s room state, under the
    /// canonical event type for `kind`.
    pub async fn write_rule(&self, list: &PolicyList, kind: EntityKind, entity: &str, reason: &str) -> String {
        let event_type = event_types_for_kind(kind)[0];
        let state_key = format!("rule:{entity}");
        let content = json!({"entity": entity, "recommendation": "m.ban", "reason": reason});
        self.put_state(list.room_id(), event_type, &state_key, content).event_id
    }

    pub async fn write_allow_rule(&self, list: &PolicyList, kind: EntityKind, entity: &str, reason: &str) -> String {
        let event_type = event_types_for_kind(kind)[0];
        let state_key = format!("rule:{entity}");
        let content = json!({"entity": entity, "recommendation": "org.matrix.mjolnir.allow", "reason": reason});
        self.put_state(list.room_id(), event_type, &state_key, content).event_id
    }

    pub async fn write_server_rule(&self, list: &PolicyList, entity: &str, reason: &str) -> String {
        self.write_rule(list, EntityKind::Server, entity, reason).await
    }

    pub async fn write_legacy_rule(&self, list: &PolicyList, kind: EntityKind, legacy_rank: usize, entity: &str, reason: &str) -> String {
        let event_type = event_types_for_kind(kind)[legacy_rank];
        let state_key = format!("rule:{entity}");
        let content = json!({"entity": entity, "recommendation": "m.ban", "reason": reason});
        self.put_state(list.room_id(), event_type, &state_key, content).event_id
    }

    /// Soft-redacts (empties) a previously written event at `(event_type, state_key)`.
    pub async fn soft_redact(&self, room: &str, event_type: &str, state_key: &str) -> String {
        self.put_state(room, event_type, state_key, json!({})).event_id
    }

    /// Hard-redacts an event in place: marks `unsigned.redacted_because`
    /// without changing its `event_id`.
    pub fn hard_redact(&self, room: &str, event_type: &str, state_key: &str) {
        let mut state = self.state.lock();
        if let Some(event) = state
            .rooms
            .get_mut(room)
            .and_then(|r| r.get_mut(&(event_type.to_string(), state_key.to_string())))
        {
            event.unsigned = json!({"redacted_because": "$redaction"});
        }
    }

    pub fn set_joined_rooms(&self, rooms: Vec<String>) {
        self.state.lock().joined_rooms = rooms;
    }

    pub fn set_joined_members(&self, room: &str, members: Vec<String>) {
        self.state.lock().joined_members.insert(room.to_string(), members);
    }

    pub fn set_full_members(&self, room: &str, members: Vec<RoomMember>) {
        self.state.lock().full_members.insert(room.to_string(), members);
    }

    pub fn set_messages_since_join(&self, room: &str, user: &str, event_ids: Vec<String>) {
        self.state
            .lock()
            .messages_since_join
            .insert((room.to_string(), user.to_string()), event_ids);
    }

    pub fn deny_permission(&self, room: &str) {
        self.state.lock().permission_denied_rooms.insert(room.to_string());
    }

    pub fn allow_permission(&self, room: &str) {
        self.state.lock().permission_denied_rooms.remove(room);
    }

    pub fn bans(&self) -> Vec<(String, String, String)> {
        self.state.lock().bans.clone()
    }

    pub fn kicks(&self) -> Vec<(String, String)> {
        self.state.lock().kicks.clone()
    }

    pub fn redactions(&self) -> Vec<(String, String)> {
        self.state.lock().redactions.clone()
    }

    pub fn sent_messages(&self) -> Vec<(String, OutgoingMessage)> {
        self.state.lock().sent_messages.clone()
    }

    pub fn server_acl_content(&self, room: &str) -> Option<Value> {
        self.state
            .lock()
            .rooms
            .get(room)
            .and_then(|r| r.get(&("m.room.server_acl".to_string(), "".to_string())))
            .map(|e| e.content.clone())
    }

    pub async fn push(&self, event: PushEvent) {
        let _ = self.push_tx.send(event).await;
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get_room_state(&self, room: &str) -> EngineResult<Vec<StateEvent>> {
        Ok(self
            .state
            .lock()
            .rooms
            .get(room)
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_room_state_event(
        &self,
        room: &str,
        event_type: &str,
        state_key: &str,
    ) -> EngineResult<Option<StateEvent>> {
        Ok(self
            .state
            .lock()
            .rooms
            .get(room)
            .and_then(|r| r.get(&(event_type.to_string(), state_key.to_string())))
            .cloned())
    }

    async fn send_state_event(
        &self,
        room: &str,
        event_type: &str,
        state_key: &str,
        content: Value,
    ) -> EngineResult<String> {
        if self.state.lock().permission_denied_rooms.contains(room) {
            return Err(EngineError::Permission(format!("cannot write state in {room}")));
        }
        Ok(self.put_state(room, event_type, state_key, content).event_id)
    }

    async fn redact_event(&self, room: &str, event_id: &str, _reason: Option<&str>) -> EngineResult<()> {
        self.state.lock().redactions.push((room.to_string(), event_id.to_string()));
        Ok(())
    }

    async fn ban_user(&self, user: &str, room: &str, reason: &str) -> EngineResult<()> {
        if self.state.lock().permission_denied_rooms.contains(room) {
            return Err(EngineError::Permission(format!("cannot ban in {room}")));
        }
        self.state.lock().bans.push((user.to_string(), room.to_string(), reason.to_string()));
        Ok(())
    }

    async fn kick_user(&self, user: &str, room: &str, _reason: Option<&str>) -> EngineResult<()> {
        self.state.lock().kicks.push((user.to_string(), room.to_string()));
        Ok(())
    }

    async fn join_room(&self, room_or_alias: &str) -> EngineResult<String> {
        Ok(room_or_alias.to_string())
    }

    async fn resolve_alias(&self, alias: &str) -> EngineResult<String> {
        Ok(alias.to_string())
    }

    async fn get_joined_rooms(&self) -> EngineResult<Vec<String>> {
        Ok(self.state.lock().joined_rooms.clone())
    }

    async fn get_joined_room_members(&self, room: &str) -> EngineResult<Vec<String>> {
        Ok(self.state.lock().joined_members.get(room).cloned().unwrap_or_default())
    }

    async fn get_room_members(&self, room: &str, include_leaves: bool) -> EngineResult<Vec<RoomMember>> {
        let state = self.state.lock();
        if let Some(full) = state.full_members.get(room) {
            return Ok(if include_leaves {
                full.clone()
            } else {
                full.iter().filter(|m| m.membership == Membership::Join).cloned().collect()
            });
        }
        Ok(state
            .joined_members
            .get(room)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|user_id| RoomMember { user_id, membership: Membership::Join })
            .collect())
    }

    async fn send_message(&self, room: &str, message: OutgoingMessage) -> EngineResult<()> {
        self.state.lock().sent_messages.push((room.to_string(), message));
        Ok(())
    }

    async fn get_account_data(&self, event_type: &str) -> EngineResult<Option<Value>> {
        Ok(self.state.lock().account_data.get(event_type).cloned())
    }

    async fn set_account_data(&self, event_type: &str, content: Value) -> EngineResult<()> {
        self.state.lock().account_data.insert(event_type.to_string(), content);
        Ok(())
    }

    async fn messages_since_last_join(&self, room: &str, user: &str) -> EngineResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .messages_since_join
            .get(&(room.to_string(), user.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn take_push_events(&self) -> Option<mpsc::Receiver<PushEvent>> {
        self.push_rx.lock().take()
    }
}
