//! The synchronization orchestrator: owns the watched lists, the
//! aggregated [`AccessControlUnit`], the activity tracker and redaction
//! queue, and drives ACL updates, member bans, and redactions across every
//! protected room.

use crate::core::access_control_unit::{AccessControlUnit, UserPolicy};
use crate::core::activity_tracker::ProtectedRoomActivityTracker;
use crate::core::errors::EngineError;
use crate::core::policy_list::{PolicyList, PolicyListListener, RuleChange};
use crate::core::redaction_queue::EventRedactionQueue;
use crate::core::revision::Revision;
use crate::core::server_acl::ServerAcl;
use crate::core::transport::{Membership, OutgoingMessage, Transport};
use crate::core::wire::{ServerAclContent, SERVER_ACL_EVENT_TYPE};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// The two error categories per-room operations are bucketed into for
/// reporting and deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Permission,
    Fatal,
}

impl From<&EngineError> for ErrorKind {
    fn from(e: &EngineError) -> Self {
        match e {
            EngineError::Permission(_) => ErrorKind::Permission,
            _ => ErrorKind::Fatal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncError {
    pub room: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Operator-controlled knobs the orchestrator consults.
#[derive(Debug, Clone)]
pub struct ProtectionConfig {
    pub self_server: String,
    pub self_user_id: String,
    pub management_room: String,
    pub automatically_redact_for_reasons: Vec<String>,
    pub faster_membership_checks: bool,
    pub no_op: bool,
    pub verbose_logging: bool,
    /// Require an explicit `--confirm` flag on `ban` commands whose entity
    /// contains `*` or `?`, consulted by the management-room command surface.
    pub confirm_wildcard_ban: bool,
}

struct ErrorCache {
    seen: HashSet<(String, ErrorKind)>,
}

pub struct ProtectedRoomsSet {
    transport: Arc<dyn Transport>,
    config: RwLock<ProtectionConfig>,
    protected_rooms: RwLock<HashSet<String>>,
    watched_lists: RwLock<Vec<PolicyList>>,
    applied_revision_per_list: RwLock<HashMap<String, Revision>>,
    pub acu: Arc<AccessControlUnit>,
    pub activity_tracker: ProtectedRoomActivityTracker,
    pub redaction_queue: EventRedactionQueue,
    acl_chain: AsyncMutex<()>,
    error_cache: Mutex<ErrorCache>,
    /// Checked at the top of every per-room iteration in the fanout loops, so
    /// a shutdown request can interrupt a long ban/ACL projection pass
    /// between rooms without corrupting in-flight state.
    shutdown: CancellationToken,
}

impl ProtectedRoomsSet {
    pub fn new(transport: Arc<dyn Transport>, config: ProtectionConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config: RwLock::new(config),
            protected_rooms: RwLock::new(HashSet::new()),
            watched_lists: RwLock::new(Vec::new()),
            applied_revision_per_list: RwLock::new(HashMap::new()),
            acu: Arc::new(AccessControlUnit::new()),
            activity_tracker: ProtectedRoomActivityTracker::new(),
            redaction_queue: EventRedactionQueue::new(),
            acl_chain: AsyncMutex::new(()),
            error_cache: Mutex::new(ErrorCache { seen: HashSet::new() }),
            shutdown: CancellationToken::new(),
        })
    }

    /// A token the runtime can cancel to request cooperative shutdown.
    /// In-flight state writes are allowed to finish or fail; queued
    /// redactions are dropped rather than drained.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn config(&self) -> ProtectionConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: ProtectionConfig) {
        *self.config.write() = config;
    }

    pub fn protected_rooms(&self) -> Vec<String> {
        self.protected_rooms.read().iter().cloned().collect()
    }

    pub fn is_protected(&self, room: &str) -> bool {
        self.protected_rooms.read().contains(room)
    }

    pub fn add_protected_room(&self, room: &str) {
        if self.protected_rooms.write().insert(room.to_string()) {
            self.activity_tracker.add_room(room);
        }
    }

    pub fn remove_protected_room(&self, room: &str) {
        if self.protected_rooms.write().remove(room) {
            self.activity_tracker.remove_room(room);
        }
    }

    /// Registers the ACU watcher and this set as the list's update listener.
    /// Idempotent in effect: watching an already-watched list re-interns its
    /// rules, which is harmless since interning is keyed by `source_event_id`.
    pub fn watch_list(self: &Arc<Self>, list: PolicyList) {
        self.acu.watch_list(&list);
        let listener: Arc<dyn PolicyListListener> = self.clone();
        list.register_listener(listener);
        self.watched_lists.write().push(list);
    }

    pub fn unwatch_list(&self, room_id: &str) {
        let mut lists = self.watched_lists.write();
        if let Some(pos) = lists.iter().position(|l| l.room_id() == room_id) {
            let list = lists.remove(pos);
            self.acu.unwatch_list(&list);
            self.applied_revision_per_list.write().remove(room_id);
        }
    }

    pub fn watched_lists(&self) -> Vec<PolicyList> {
        self.watched_lists.read().clone()
    }

    pub fn queue_redaction(&self, user: &str, room: &str) {
        self.redaction_queue.enqueue(user, room);
    }

    pub async fn process_redactions(&self, room: Option<&str>) {
        if self.shutdown.is_cancelled() {
            debug!("shutdown requested, dropping queued redactions instead of draining");
            return;
        }
        let no_op = self.config().no_op;
        let failures = self.redaction_queue.process(&self.transport, room, no_op).await;
        for failure in failures {
            warn!(user = %failure.task.user, room = %failure.task.room, error = %failure.error, "dropped failing redaction task");
        }
    }

    /// Entry point for all push events addressed to a protected room. Drops
    /// events sent by the daemon itself.
    pub async fn handle_event(&self, room: &str, event: &crate::core::wire::StateEvent) {
        if event.sender == self.config().self_user_id {
            return;
        }
        self.activity_tracker.record_event(room, event.origin_server_ts);

        match event.event_type.as_str() {
            "m.room.power_levels" => {
                self.clear_error(room, ErrorKind::Permission);
                debug!(room, "power levels changed, permission error cache cleared, re-verifying");
                let config = self.config();
                let acl = ServerAcl::compile(&self.acu, &config.self_server);
                let mut acl_errors = Vec::new();
                {
                    let _chain = self.acl_chain.lock().await;
                    self.project_acl_for_room(room, &acl, config.no_op, &mut acl_errors).await;
                }
                for e in &acl_errors {
                    error!(room = %e.room, error = %e.message, "permission verification: ACL write error");
                }
                if let Err(errors) = self.project_member_bans_for_room(room).await {
                    for e in &errors {
                        error!(room = %e.room, error = %e.message, "permission verification: member-ban projection error");
                    }
                }
            }
            "m.room.member" => {
                if let Err(errors) = self.project_member_bans_for_room(room).await {
                    for e in &errors {
                        error!(room = %e.room, error = %e.message, "member-ban projection error");
                    }
                }
                self.process_redactions(Some(room)).await;
            }
            _ => {}
        }
    }

    /// For each watched list, refresh it; if any list's revision supersedes
    /// the last applied one, run a full sync. `update_list`
    /// invokes this set's own `on_update` before returning, which already
    /// advances `applied_revision_per_list` and runs the sync — so the
    /// `supersedes` check below naturally becomes a no-op on that path, and
    /// this loop only triggers a second sync when a list changed without
    /// going through the listener (not possible for a watched list today,
    /// but kept symmetric with the per-list listener's own bookkeeping).
    pub async fn sync_lists(&self) -> Vec<SyncError> {
        let mut any_changed = false;
        for list in self.watched_lists() {
            match list.update_list().await {
                Ok((revision, _changes)) => {
                    let mut applied = self.applied_revision_per_list.write();
                    let supersedes = applied
                        .get(list.room_id())
                        .is_none_or(|prev| revision.supersedes(prev));
                    if supersedes {
                        applied.insert(list.room_id().to_string(), revision);
                        any_changed = true;
                    }
                }
                Err(e) => warn!(room = %list.room_id(), error = %e, "policy list refresh failed"),
            }
        }
        if any_changed {
            self.sync_rooms_with_policies().await
        } else {
            Vec::new()
        }
    }

    /// ACL compilation/projection and member-ban projection run in parallel;
    /// the redaction drain follows both.
    pub async fn sync_rooms_with_policies(&self) -> Vec<SyncError> {
        let config = self.config();
        let acl = ServerAcl::compile(&self.acu, &config.self_server);

        let (acl_errors, ban_errors) = tokio::join!(
            self.project_acl_to_protected_rooms(&acl, config.no_op),
            self.project_member_bans_to_protected_rooms()
        );

        self.process_redactions(None).await;

        let mut errors = acl_errors;
        errors.extend(ban_errors);
        self.report_summary(&errors).await;
        errors
    }

    async fn project_acl_to_protected_rooms(&self, acl: &ServerAcl, no_op: bool) -> Vec<SyncError> {
        // Serializes ACL writes for the entire pass: two overlapping syncs
        // must not interleave state writes to the same room.
        let _chain = self.acl_chain.lock().await;
        let mut errors = Vec::new();
        for room in self.rooms_in_activity_order() {
            if self.shutdown.is_cancelled() {
                debug!("shutdown requested, aborting ACL projection before remaining rooms");
                break;
            }
            self.project_acl_for_room(&room, acl, no_op, &mut errors).await;
        }
        errors
    }

    /// Compiles-and-writes the ACL for a single room if it's out of date.
    /// Shared by the full fanout pass and the single-room permission
    /// verification triggered off `m.room.power_levels`.
    async fn project_acl_for_room(&self, room: &str, acl: &ServerAcl, no_op: bool, errors: &mut Vec<SyncError>) {
        let current = match self.transport.get_room_state_event(room, SERVER_ACL_EVENT_TYPE, "").await {
            Ok(event) => event.and_then(|e| serde_json::from_value::<ServerAclContent>(e.content).ok()),
            Err(e) => {
                self.push_error(errors, room, &e);
                return;
            }
        };
        let up_to_date = current.as_ref().is_some_and(|c| acl.matches(c));
        if up_to_date {
            return;
        }
        if no_op {
            debug!(room, "no_op: would write server ACL");
            return;
        }
        let content = serde_json::to_value(acl.safe_acl_content()).expect("ServerAclContent always serializes");
        if let Err(e) = self.transport.send_state_event(room, SERVER_ACL_EVENT_TYPE, "", content).await {
            self.push_error(errors, room, &e);
        }
    }

    async fn project_member_bans_to_protected_rooms(self: &Self) -> Vec<SyncError> {
        let mut errors = Vec::new();
        for room in self.rooms_in_activity_order() {
            if self.shutdown.is_cancelled() {
                debug!("shutdown requested, aborting member-ban projection before remaining rooms");
                break;
            }
            match self.project_member_bans_for_room(&room).await {
                Ok(mut room_errors) => errors.append(&mut room_errors),
                Err(mut room_errors) => errors.append(&mut room_errors),
            }
        }
        errors
    }

    /// Re-runs member-ban projection against a single room.
    async fn project_member_bans_for_room(&self, room: &str) -> Result<Vec<SyncError>, Vec<SyncError>> {
        let config = self.config();
        let mut errors = Vec::new();

        let members = if config.faster_membership_checks {
            match self.transport.get_joined_room_members(room).await {
                Ok(ids) => ids
                    .into_iter()
                    .map(|user_id| crate::core::transport::RoomMember { user_id, membership: Membership::Join })
                    .collect(),
                Err(e) => {
                    self.push_error(&mut errors, room, &e);
                    return Err(errors);
                }
            }
        } else {
            match self.transport.get_room_members(room, true).await {
                Ok(members) => members,
                Err(e) => {
                    self.push_error(&mut errors, room, &e);
                    return Err(errors);
                }
            }
        };

        for member in members {
            if member.membership == Membership::Ban {
                continue;
            }
            let access = self.acu.get_access_for_user(&member.user_id, UserPolicy::IgnoreServer);
            if let crate::core::access_control_unit::AccessOutcome::Banned(rule) = access {
                let reason = rule.as_ref().map(|r| r.reason.clone()).unwrap_or_else(|| "banned by policy".to_string());
                if config.no_op {
                    debug!(room, user = %member.user_id, "no_op: would ban");
                } else if let Err(e) = self.transport.ban_user(&member.user_id, room, &reason).await {
                    self.push_error(&mut errors, room, &e);
                }
                if reason_triggers_auto_redact(&reason, &config.automatically_redact_for_reasons) {
                    self.redaction_queue.enqueue(&member.user_id, room);
                }
            }
        }

        Ok(errors)
    }

    fn rooms_in_activity_order(&self) -> Vec<String> {
        let protected = self.protected_rooms.read().clone();
        self.activity_tracker
            .rooms_by_activity()
            .into_iter()
            .filter(|r| protected.contains(r))
            .collect()
    }

    fn push_error(&self, errors: &mut Vec<SyncError>, room: &str, e: &EngineError) {
        let kind = ErrorKind::from(e);
        if self.record_error(room, kind) {
            errors.push(SyncError { room: room.to_string(), kind, message: e.to_string() });
        }
    }

    /// Returns true the first time `(room, kind)` is seen since the last
    /// reset, suppressing repeats.
    fn record_error(&self, room: &str, kind: ErrorKind) -> bool {
        self.error_cache.lock().seen.insert((room.to_string(), kind))
    }

    fn clear_error(&self, room: &str, kind: ErrorKind) {
        self.error_cache.lock().seen.remove(&(room.to_string(), kind));
    }

    async fn report_summary(&self, errors: &[SyncError]) {
        if errors.is_empty() {
            if self.config().verbose_logging {
                let message = OutgoingMessage::notice("Sync completed with no errors.", "<p>Sync completed with no errors.</p>");
                let room = self.config().management_room;
                if let Err(e) = self.transport.send_message(&room, message).await {
                    error!(error = %e, "failed to post verbose sync summary to management room");
                }
            }
            return;
        }
        let plain = errors
            .iter()
            .map(|e| format!("{:?} in {}: {}", e.kind, e.room, e.message))
            .collect::<Vec<_>>()
            .join("\n");
        let html = errors
            .iter()
            .map(|e| format!("<li>{:?} in <code>{}</code>: {}</li>", e.kind, e.room, e.message))
            .collect::<Vec<_>>()
            .join("");
        let message = OutgoingMessage::notice(
            format!("Sync completed with {} error(s):\n{plain}", errors.len()),
            format!("Sync completed with {} error(s):<ul>{html}</ul>", errors.len()),
        );
        let room = self.config().management_room;
        if let Err(e) = self.transport.send_message(&room, message).await {
            error!(error = %e, "failed to post sync summary to management room");
        }
    }

    /// Pretty-prints a diff of additions/modifications/removals to the
    /// management room.
    async fn report_diff(&self, list: &PolicyList, changes: &[RuleChange]) {
        if changes.is_empty() {
            return;
        }
        let mut added = 0;
        let mut modified = 0;
        let mut removed = 0;
        for change in changes {
            match change {
                RuleChange::Added(_) => added += 1,
                RuleChange::Modified { .. } => modified += 1,
                RuleChange::Removed(_) => removed += 1,
            }
        }
        let plain = format!(
            "List {} updated: +{added} added, ~{modified} modified, -{removed} removed",
            list.shortcode().unwrap_or_else(|| list.room_id().to_string())
        );
        let message = OutgoingMessage::notice(plain.clone(), format!("<p>{plain}</p>"));
        let room = self.config().management_room;
        if let Err(e) = self.transport.send_message(&room, message).await {
            error!(error = %e, "failed to post list diff to management room");
        }
    }
}

fn reason_triggers_auto_redact(reason: &str, patterns: &[String]) -> bool {
    let lowered = reason.to_lowercase();
    patterns
        .iter()
        .any(|p| crate::core::rule::EntityPattern::compile(p).matches(&lowered))
}

#[async_trait]
impl PolicyListListener for ProtectedRoomsSet {
    async fn on_update(&self, list: &PolicyList, changes: &[RuleChange], revision: Revision) {
        self.report_diff(list, changes).await;

        let supersedes = {
            let applied = self.applied_revision_per_list.read();
            applied.get(list.room_id()).is_none_or(|prev| revision.supersedes(prev))
        };
        if !supersedes {
            return;
        }
        self.applied_revision_per_list.write().insert(list.room_id().to_string(), revision);
        self.sync_rooms_with_policies().await;
    }
}
