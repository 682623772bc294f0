//! The external transport contract. This is the one seam the
//! engine never reaches past: every network effect — reading state, writing
//! state, banning, kicking, redacting, joining, messaging — goes through a
//! `Transport` implementation. The engine itself never assumes anything
//! about how these operations are actually carried out.

use crate::core::errors::EngineResult;
use crate::core::wire::StateEvent;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// A room member's current membership state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Join,
    Leave,
    Ban,
    Invite,
    Knock,
}

#[derive(Debug, Clone)]
pub struct RoomMember {
    pub user_id: String,
    pub membership: Membership,
}

/// The content of an outgoing `m.room.message`, matching the transport's
/// `send_message` contract.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub msgtype: String,
    pub body: String,
    pub format: Option<String>,
    pub formatted_body: Option<String>,
}

impl OutgoingMessage {
    pub fn notice(plain: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            msgtype: "m.notice".to_string(),
            body: plain.into(),
            format: Some("org.matrix.custom.html".to_string()),
            formatted_body: Some(html.into()),
        }
    }
}

/// A push event delivered out of band to a room the engine is watching or
/// protecting. `event.state_key` is empty for non-state (timeline) events.
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub room_id: String,
    pub event: StateEvent,
}

/// The nine read/write primitives plus push subscription, account data, and
/// member listing the engine depends on. Implementations are
/// expected to be cheaply clonable (`Arc`-backed) so the engine can hold one
/// shared instance.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get_room_state(&self, room: &str) -> EngineResult<Vec<StateEvent>>;

    async fn get_room_state_event(
        &self,
        room: &str,
        event_type: &str,
        state_key: &str,
    ) -> EngineResult<Option<StateEvent>>;

    async fn send_state_event(
        &self,
        room: &str,
        event_type: &str,
        state_key: &str,
        content: Value,
    ) -> EngineResult<String>;

    async fn redact_event(&self, room: &str, event_id: &str, reason: Option<&str>) -> EngineResult<()>;

    async fn ban_user(&self, user: &str, room: &str, reason: &str) -> EngineResult<()>;

    async fn kick_user(&self, user: &str, room: &str, reason: Option<&str>) -> EngineResult<()>;

    async fn join_room(&self, room_or_alias: &str) -> EngineResult<String>;

    async fn resolve_alias(&self, alias: &str) -> EngineResult<String>;

    /// Every room the daemon's own account currently has joined, used to
    /// seed the protected set when `protect_all_joined_rooms` is enabled.
    async fn get_joined_rooms(&self) -> EngineResult<Vec<String>>;

    /// Fast path: currently-joined members only.
    async fn get_joined_room_members(&self, room: &str) -> EngineResult<Vec<String>>;

    /// Slow path: full membership state, including parts/leaves, used when
    /// `faster_membership_checks` is disabled.
    async fn get_room_members(&self, room: &str, include_leaves: bool) -> EngineResult<Vec<RoomMember>>;

    async fn send_message(&self, room: &str, message: OutgoingMessage) -> EngineResult<()>;

    async fn get_account_data(&self, event_type: &str) -> EngineResult<Option<Value>>;

    async fn set_account_data(&self, event_type: &str, content: Value) -> EngineResult<()>;

    /// Event ids sent by `user` in `room` since their most recent join, used
    /// by the redaction queue.
    async fn messages_since_last_join(&self, room: &str, user: &str) -> EngineResult<Vec<String>>;

    /// Hands out the receiving half of the push-event channel. Implementations
    /// back this with interior mutability and return `None` on a second call
    /// — there is exactly one consumer, the engine's runtime loop.
    fn take_push_events(&self) -> Option<mpsc::Receiver<PushEvent>>;
}
