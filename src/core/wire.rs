//! The policy-room and server-ACL wire formats, kept deliberately separate
//! from the in-memory [`crate::core::rule::Rule`] model: this module only
//! describes what comes over the transport, never how the engine interprets
//! it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single state event as delivered by the transport, covering both policy
/// rule events and the shortcode marker event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEvent {
    pub event_id: String,
    pub room_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub state_key: String,
    /// `null`/missing content means the event was soft-redacted (emptied in
    /// place rather than removed from the room's state map).
    #[serde(default)]
    pub content: Value,
    pub origin_server_ts: i64,
    pub sender: String,
    #[serde(default)]
    pub unsigned: Value,
}

impl StateEvent {
    /// True if `unsigned.redacted_because` is present, i.e. the homeserver
    /// marked this exact event as redacted.
    pub fn is_redacted(&self) -> bool {
        self.unsigned
            .get("redacted_because")
            .is_some_and(|v| !v.is_null())
    }

    /// True if the content is present but empty — the soft-redaction
    /// convention policy bots use instead of a real room redaction, so a
    /// single state-key slot can still record "this used to be a rule".
    pub fn has_empty_content(&self) -> bool {
        match &self.content {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }
}

/// The `content` of a policy rule event: `{ entity, recommendation, reason?,
/// opinion? }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRuleContent {
    pub entity: String,
    pub recommendation: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub opinion: Option<i64>,
}

/// The shortcode marker event's content: `org.matrix.mjolnir.shortcode`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortcodeContent {
    pub shortcode: String,
}

/// `m.room.server_acl` content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerAclContent {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub allow_ip_literals: bool,
}

impl ServerAclContent {
    /// Structural equality ignoring field order, which for a
    /// deserialized struct is just derived `PartialEq` on the parsed
    /// fields — order in the original JSON has already been thrown away.
    /// The allow/deny vectors are compared as sets: the wire format treats
    /// them as unordered lists of globs.
    pub fn structurally_equal(&self, other: &ServerAclContent) -> bool {
        self.allow_ip_literals == other.allow_ip_literals
            && same_elements(&self.allow, &other.allow)
            && same_elements(&self.deny, &other.deny)
    }
}

fn same_elements(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a_sorted = a.to_vec();
    let mut b_sorted = b.to_vec();
    a_sorted.sort();
    b_sorted.sort();
    a_sorted == b_sorted
}

/// Operator account-data: the persisted set of watched policy lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchedListsContent {
    #[serde(default)]
    pub references: Vec<String>,
}

/// The canonical event type and its legacy aliases for one rule kind, newest
/// first. Obsolescence order is defined by position in this list: an event
/// under an *older* (later-positioned) type never
/// overwrites a `(kind, state_key)` slot already occupied by a *newer*
/// (earlier-positioned) type.
pub fn event_types_for_kind(kind: crate::core::rule::EntityKind) -> &'static [&'static str] {
    use crate::core::rule::EntityKind::*;
    match kind {
        User => &[
            "m.policy.rule.user",
            "m.room.rule.user",
            "org.matrix.mjolnir.rule.user",
        ],
        Room => &[
            "m.policy.rule.room",
            "m.room.rule.room",
            "org.matrix.mjolnir.rule.room",
        ],
        Server => &[
            "m.policy.rule.server",
            "m.room.rule.server",
            "org.matrix.mjolnir.rule.server",
        ],
    }
}

pub const SHORTCODE_EVENT_TYPE: &str = "org.matrix.mjolnir.shortcode";
pub const SERVER_ACL_EVENT_TYPE: &str = "m.room.server_acl";
pub const WATCHED_LISTS_ACCOUNT_DATA_TYPE: &str = "org.matrix.mjolnir.watched_lists";

/// Resolve an event type to its `(kind, obsolescence rank)`, where rank 0 is
/// the canonical (newest) type and higher ranks are progressively more
/// legacy. Returns `None` for event types the engine does not recognize as
/// policy rules.
pub fn classify_event_type(event_type: &str) -> Option<(crate::core::rule::EntityKind, usize)> {
    use crate::core::rule::EntityKind::*;
    for kind in [User, Room, Server] {
        if let Some(rank) = event_types_for_kind(kind)
            .iter()
            .position(|t| *t == event_type)
        {
            return Some((kind, rank));
        }
    }
    None
}

pub fn unprotected_room_warning_flag_type(room_id: &str) -> String {
    format!("org.matrix.mjolnir.unprotected_room_warning.for.{room_id}")
}
