//! Cached state of one policy room: diffs state updates into a stream of
//! rule changes and emits monotonically ordered revisions.

use crate::core::errors::{EngineError, EngineResult};
use crate::core::revision::{Revision, RevisionAllocator};
use crate::core::rule::{EntityKind, Recommendation, Rule};
use crate::core::transport::Transport;
use crate::core::wire::{
    PolicyRuleContent, ShortcodeContent, StateEvent, classify_event_type, event_types_for_kind,
    SHORTCODE_EVENT_TYPE,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

/// One diff entry produced by [`PolicyList::update_list`].
#[derive(Debug, Clone)]
pub enum RuleChange {
    Added(Rule),
    Modified { old: Rule, new: Rule },
    Removed(Rule),
}

impl RuleChange {
    pub fn rule(&self) -> &Rule {
        match self {
            RuleChange::Added(r) | RuleChange::Removed(r) => r,
            RuleChange::Modified { new, .. } => new,
        }
    }
}

/// Receives `(list, changes, revision)` whenever a `PolicyList` observes a
/// non-empty change-set. Implemented by [`crate::core::list_rule_cache::ListRuleCache`]
/// and [`crate::core::protected_rooms::ProtectedRoomsSet`]; this flat
/// subscription is how the cyclic `PolicyList -> AccessControlUnit ->
/// ListRuleCache -> PolicyList` relationship is broken — listeners hold no
/// back-pointer, rules carry only `source_event_id`.
#[async_trait]
pub trait PolicyListListener: Send + Sync {
    async fn on_update(&self, list: &PolicyList, changes: &[RuleChange], revision: Revision);
}

struct Slot {
    rank: usize,
    event: StateEvent,
}

struct Batcher {
    latest_event_id: RwLock<Option<String>>,
    is_waiting: AtomicBool,
}

struct Inner {
    room_id: String,
    transport: Arc<dyn Transport>,
    /// Normalized view: one representative raw event per `(kind, state_key)`.
    state: RwLock<HashMap<(EntityKind, String), Slot>>,
    state_by_event_id: RwLock<HashMap<String, StateEvent>>,
    /// Every currently-active raw event, including legacy types shadowed by
    /// a more canonical one at the same normalized slot. Needed so
    /// `unban_entity` can soft-redact every type that still names an entity.
    raw_state: RwLock<HashMap<(String, String), StateEvent>>,
    shortcode: RwLock<Option<String>>,
    revision: RwLock<Revision>,
    revision_alloc: RevisionAllocator,
    refresh_lock: AsyncMutex<()>,
    listeners: RwLock<Vec<Arc<dyn PolicyListListener>>>,
    batcher: Batcher,
}

/// Identified by a room id and a shareable reference; cheaply clonable, all
/// clones refer to the same underlying state.
#[derive(Clone)]
pub struct PolicyList {
    inner: Arc<Inner>,
}

const WAIT_PERIOD: Duration = Duration::from_millis(200);
const MAX_WAIT: Duration = Duration::from_secs(3);

impl PolicyList {
    pub fn new(room_id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                room_id: room_id.into(),
                transport,
                state: RwLock::new(HashMap::new()),
                state_by_event_id: RwLock::new(HashMap::new()),
                raw_state: RwLock::new(HashMap::new()),
                shortcode: RwLock::new(None),
                revision: RwLock::new(Revision::zero()),
                revision_alloc: RevisionAllocator::new(),
                refresh_lock: AsyncMutex::new(()),
                listeners: RwLock::new(Vec::new()),
                batcher: Batcher {
                    latest_event_id: RwLock::new(None),
                    is_waiting: AtomicBool::new(false),
                },
            }),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    pub fn revision(&self) -> Revision {
        *self.inner.revision.read()
    }

    pub fn shortcode(&self) -> Option<String> {
        self.inner.shortcode.read().clone()
    }

    pub fn register_listener(&self, listener: Arc<dyn PolicyListListener>) {
        self.inner.listeners.write().push(listener);
    }

    pub fn unregister_listener(&self, listener: &Arc<dyn PolicyListListener>) {
        self.inner
            .listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Informs the list that new state may exist. Non-blocking; deduped
    /// against `state_by_event_id`; hands off to the batcher.
    pub fn update_for_event(&self, event_id: &str) {
        if self.inner.state_by_event_id.read().contains_key(event_id) {
            return;
        }
        self.notify_batcher(event_id.to_string());
    }

    fn notify_batcher(&self, event_id: String) {
        *self.inner.batcher.latest_event_id.write() = Some(event_id);
        if self.inner.batcher.is_waiting.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut waited = Duration::ZERO;
            loop {
                let before = {
                    let Some(inner) = weak.upgrade() else { return };
                    inner.batcher.latest_event_id.read().clone()
                };
                tokio::time::sleep(WAIT_PERIOD).await;
                waited += WAIT_PERIOD;
                let Some(inner) = weak.upgrade() else { return };
                let after = inner.batcher.latest_event_id.read().clone();
                if before == after || waited >= MAX_WAIT {
                    inner.batcher.is_waiting.store(false, Ordering::SeqCst);
                    let list = PolicyList { inner };
                    if let Err(e) = list.update_list().await {
                        warn!(room = %list.room_id(), error = %e, "batched policy list refresh failed");
                    }
                    return;
                }
            }
        });
    }

    /// Refreshes by reading the full state of the room; returns the diff
    /// versus the previous snapshot and a new revision. Mutually exclusive
    /// with itself via `refresh_lock`.
    pub async fn update_list(&self) -> EngineResult<(Revision, Vec<RuleChange>)> {
        let _guard = self.inner.refresh_lock.lock().await;
        let events = self.inner.transport.get_room_state(&self.inner.room_id).await?;

        let mut representative: HashMap<(EntityKind, String), (usize, usize)> = HashMap::new();
        for (idx, event) in events.iter().enumerate() {
            if event.state_key.is_empty() {
                continue;
            }
            let Some((kind, rank)) = classify_event_type(&event.event_type) else {
                continue;
            };
            let key = (kind, event.state_key.clone());
            match representative.get(&key) {
                Some((best_rank, _)) if *best_rank <= rank => {}
                _ => {
                    representative.insert(key, (rank, idx));
                }
            }
        }

        let old_state = self.inner.state.read();
        let mut new_state: HashMap<(EntityKind, String), Slot> = HashMap::new();
        let mut new_raw: HashMap<(String, String), StateEvent> = HashMap::new();
        let mut new_state_by_event_id: HashMap<String, StateEvent> = HashMap::new();
        let mut new_shortcode = self.inner.shortcode.read().clone();
        let mut changes = Vec::new();

        for (idx, event) in events.iter().enumerate() {
            new_state_by_event_id.insert(event.event_id.clone(), event.clone());

            if event.event_type == SHORTCODE_EVENT_TYPE && event.state_key.is_empty() {
                if let Ok(sc) = serde_json::from_value::<ShortcodeContent>(event.content.clone()) {
                    new_shortcode = Some(sc.shortcode);
                }
                continue;
            }
            if event.state_key.is_empty() {
                continue;
            }
            let Some((kind, rank)) = classify_event_type(&event.event_type) else {
                continue;
            };

            new_raw.insert((event.event_type.clone(), event.state_key.clone()), event.clone());

            let key = (kind, event.state_key.clone());
            let is_representative = matches!(representative.get(&key), Some((_, rep_idx)) if *rep_idx == idx);
            if !is_representative {
                // Obsolescence: a newer canonical type already occupies this slot.
                continue;
            }

            let old_slot = old_state.get(&key);
            let old_event = old_slot.map(|s| &s.event);
            let old_rule = old_event.and_then(|e| Rule::from_event(e, kind));

            let change = if let Some(old_event) = old_event {
                if old_event.event_id == event.event_id {
                    if event.is_redacted() {
                        old_rule.map(RuleChange::Removed)
                    } else {
                        None
                    }
                } else if event.has_empty_content() {
                    old_rule.map(RuleChange::Removed)
                } else {
                    let new_rule = Rule::from_event(event, kind);
                    match (old_rule, new_rule) {
                        (Some(old), Some(new)) => Some(RuleChange::Modified { old, new }),
                        (None, Some(new)) => Some(RuleChange::Added(new)),
                        (Some(old), None) => Some(RuleChange::Removed(old)),
                        (None, None) => None,
                    }
                }
            } else {
                Rule::from_event(event, kind).map(RuleChange::Added)
            };

            new_state.insert(key, Slot { rank, event: event.clone() });
            if let Some(change) = change {
                changes.push(change);
            }
        }
        drop(old_state);

        *self.inner.state.write() = new_state;
        *self.inner.state_by_event_id.write() = new_state_by_event_id;
        *self.inner.raw_state.write() = new_raw;
        *self.inner.shortcode.write() = new_shortcode;

        if changes.is_empty() {
            return Ok((self.revision(), changes));
        }

        let revision = self.inner.revision_alloc.next();
        *self.inner.revision.write() = revision;

        let listeners = self.inner.listeners.read().clone();
        for listener in &listeners {
            listener.on_update(self, &changes, revision).await;
        }

        Ok((revision, changes))
    }

    /// Snapshot accessor.
    pub fn rules_of_kind(&self, kind: EntityKind, recommendation: Option<Recommendation>) -> Vec<Rule> {
        self.inner
            .state
            .read()
            .iter()
            .filter(|(key, _)| key.0 == kind)
            .filter_map(|(_, slot)| Rule::from_event(&slot.event, kind))
            .filter(|r| match recommendation {
                Some(rec) => r.recommendation == rec,
                None => true,
            })
            .collect()
    }

    /// For a user entity, also scans server rules against the domain part.
    pub fn rules_matching_entity(&self, entity: &str, kind: Option<EntityKind>) -> Vec<Rule> {
        let kinds: Vec<EntityKind> = match kind {
            Some(k) => vec![k],
            None => vec![EntityKind::User, EntityKind::Room, EntityKind::Server],
        };
        let mut out = Vec::new();
        for k in &kinds {
            for rule in self.rules_of_kind(*k, None) {
                if rule.matches_entity(entity) {
                    out.push(rule);
                }
            }
        }
        if kinds.contains(&EntityKind::User) {
            if let Some(domain) = entity.rsplit_once(':').map(|(_, d)| d) {
                for rule in self.rules_of_kind(EntityKind::Server, None) {
                    if rule.matches_entity(domain) {
                        out.push(rule);
                    }
                }
            }
        }
        out
    }

    fn canonical_event_type(kind: EntityKind) -> &'static str {
        event_types_for_kind(kind)[0]
    }

    /// Writes a new rule (state write), then informs the list.
    pub async fn ban_entity(&self, kind: EntityKind, entity: &str, reason: &str) -> EngineResult<()> {
        let content = serde_json::to_value(PolicyRuleContent {
            entity: entity.to_string(),
            recommendation: "m.ban".to_string(),
            reason: Some(reason.to_string()),
            opinion: None,
        })
        .map_err(EngineError::from)?;
        let state_key = format!("rule:{entity}");
        let event_id = self
            .inner
            .transport
            .send_state_event(&self.inner.room_id, Self::canonical_event_type(kind), &state_key, content)
            .await?;
        self.update_for_event(&event_id);
        Ok(())
    }

    /// Soft-redacts every active rule for `entity` across legacy types.
    /// Returns true iff at least one was present.
    pub async fn unban_entity(&self, kind: EntityKind, entity: &str) -> EngineResult<bool> {
        let candidates: Vec<(String, String)> = {
            let raw = self.inner.raw_state.read();
            raw.iter()
                .filter(|((event_type, _), event)| {
                    classify_event_type(event_type).is_some_and(|(k, _)| k == kind)
                        && Rule::from_event(event, kind).is_some_and(|r| r.entity == entity)
                })
                .map(|((t, sk), _)| (t.clone(), sk.clone()))
                .collect()
        };
        if candidates.is_empty() {
            return Ok(false);
        }
        for (event_type, state_key) in &candidates {
            let event_id = self
                .inner
                .transport
                .send_state_event(&self.inner.room_id, event_type, state_key, serde_json::json!({}))
                .await?;
            self.update_for_event(&event_id);
        }
        debug!(room = %self.inner.room_id, entity, count = candidates.len(), "soft-redacted rules for unban");
        Ok(true)
    }
}
