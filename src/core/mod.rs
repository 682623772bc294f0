//! The policy-synchronization engine: the in-memory model of a policy room,
//! multi-list aggregation and decision cache, ACL/ban projection, and the
//! redaction queue that follows it.

pub mod access_control_unit;
pub mod activity_tracker;
pub mod errors;
pub mod list_rule_cache;
pub mod policy_list;
pub mod protected_rooms;
pub mod redaction_queue;
pub mod revision;
pub mod rule;
pub mod server_acl;
pub mod transport;
pub mod wire;

pub use access_control_unit::{AccessControlUnit, AccessOutcome, UserPolicy};
pub use errors::{EngineError, EngineResult};
pub use policy_list::PolicyList;
pub use protected_rooms::ProtectedRoomsSet;
pub use rule::{EntityKind, Recommendation, Rule};
