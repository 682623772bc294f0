//! Per-`(kind, recommendation)` index across multiple watched lists: O(1)
//! literal lookup plus sequential glob scan.

use crate::core::policy_list::{PolicyList, PolicyListListener, RuleChange};
use crate::core::revision::Revision;
use crate::core::rule::{EntityKind, Recommendation, Rule};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

/// Interned rules for one entity's literal or glob bucket, one entry per
/// contributing list — duplicates across lists are retained so that
/// unwatching one list does not remove another list's identical rule.
#[derive(Default)]
struct Bucket {
    rules: Vec<Rule>,
}

pub struct ListRuleCache {
    kind: EntityKind,
    recommendation: Recommendation,
    literals: DashMap<String, Bucket>,
    /// Insertion-ordered; scanned sequentially at query time.
    globs: Mutex<Vec<Rule>>,
}

impl ListRuleCache {
    pub fn new(kind: EntityKind, recommendation: Recommendation) -> Self {
        Self {
            kind,
            recommendation,
            literals: DashMap::new(),
            globs: Mutex::new(Vec::new()),
        }
    }

    fn intern(&self, rule: Rule) {
        if rule.pattern.is_glob() {
            self.globs.lock().push(rule);
        } else {
            self.literals.entry(rule.entity.clone()).or_default().rules.push(rule);
        }
    }

    fn unintern_by_event_id(&self, event_id: &str) {
        self.literals.retain(|_, bucket| {
            bucket.rules.retain(|r| r.source_event_id != event_id);
            !bucket.rules.is_empty()
        });
        self.globs.lock().retain(|r| r.source_event_id != event_id);
    }

    /// Interns every currently active rule of this cache's `(kind,
    /// recommendation)` from `list`'s present snapshot.
    pub fn intern_snapshot(&self, list: &PolicyList) {
        for rule in list.rules_of_kind(self.kind, Some(self.recommendation)) {
            self.intern(rule);
        }
    }

    /// Un-interns every rule whose `source_event_id` belongs to `list`'s
    /// current snapshot, i.e. everything this list had contributed.
    pub fn uninterm_snapshot(&self, list: &PolicyList) {
        for rule in list.rules_of_kind(self.kind, Some(self.recommendation)) {
            self.unintern_by_event_id(&rule.source_event_id);
        }
    }

    fn apply_change(&self, change: &RuleChange) {
        match change {
            RuleChange::Added(rule) => {
                if rule.kind == self.kind && rule.recommendation == self.recommendation {
                    self.intern(rule.clone());
                }
            }
            RuleChange::Modified { old, new } => {
                self.unintern_by_event_id(&old.source_event_id);
                if new.kind == self.kind && new.recommendation == self.recommendation {
                    self.intern(new.clone());
                }
            }
            RuleChange::Removed(rule) => {
                self.unintern_by_event_id(&rule.source_event_id);
            }
        }
    }

    /// Literal lookup first; on a hit, the first duplicate wins. Falls back
    /// to a sequential glob scan in insertion order. Server-kind caches key
    /// and look up literals in lowercase, matching `Rule::from_event`'s
    /// normalization, since server ACLs match hosts case-insensitively.
    pub fn get_any_rule_for_entity(&self, entity: &str) -> Option<Rule> {
        let key = if self.kind == EntityKind::Server {
            std::borrow::Cow::Owned(entity.to_lowercase())
        } else {
            std::borrow::Cow::Borrowed(entity)
        };
        if let Some(bucket) = self.literals.get(key.as_ref()) {
            if let Some(rule) = bucket.rules.first() {
                return Some(rule.clone());
            }
        }
        self.globs
            .lock()
            .iter()
            .find(|r| r.matches_entity(entity))
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.literals.is_empty() && self.globs.lock().is_empty()
    }

    /// De-duplicated view across lists: one rule per entity.
    pub fn all_rules(&self) -> Vec<Rule> {
        let mut out = Vec::new();
        for entry in self.literals.iter() {
            if let Some(rule) = entry.value().rules.first() {
                out.push(rule.clone());
            }
        }
        out.extend(self.globs.lock().iter().cloned());
        out
    }
}

#[async_trait]
impl PolicyListListener for ListRuleCache {
    async fn on_update(&self, _list: &PolicyList, changes: &[RuleChange], _revision: Revision) {
        for change in changes {
            self.apply_change(change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeTransport;
    use std::sync::Arc;

    #[tokio::test]
    async fn watch_interns_existing_rules_and_unwatch_removes_only_its_own() {
        let fake = Arc::new(FakeTransport::new());
        let list_a = PolicyList::new("!a:example.org", fake.clone());
        let list_b = PolicyList::new("!b:example.org", fake.clone());

        fake.write_rule(&list_a, EntityKind::User, "@spam:bad.example", "abuse").await;
        fake.write_rule(&list_b, EntityKind::User, "@spam:bad.example", "dup").await;
        list_a.update_list().await.unwrap();
        list_b.update_list().await.unwrap();

        let cache = ListRuleCache::new(EntityKind::User, Recommendation::Ban);
        cache.intern_snapshot(&list_a);
        cache.intern_snapshot(&list_b);
        assert!(cache.get_any_rule_for_entity("@spam:bad.example").is_some());

        cache.uninterm_snapshot(&list_a);
        // list_b's duplicate rule for the same entity must survive.
        assert!(cache.get_any_rule_for_entity("@spam:bad.example").is_some());

        cache.uninterm_snapshot(&list_b);
        assert!(cache.get_any_rule_for_entity("@spam:bad.example").is_none());
    }

    #[tokio::test]
    async fn server_literal_lookup_is_case_insensitive() {
        let fake = Arc::new(FakeTransport::new());
        let list = PolicyList::new("!a:example.org", fake.clone());
        fake.write_server_rule(&list, "Bad.Example", "net abuse").await;
        list.update_list().await.unwrap();

        let cache = ListRuleCache::new(EntityKind::Server, Recommendation::Ban);
        cache.intern_snapshot(&list);
        assert!(cache.get_any_rule_for_entity("bad.example").is_some());
        assert!(cache.get_any_rule_for_entity("BAD.EXAMPLE").is_some());
    }

    #[tokio::test]
    async fn glob_rules_are_scanned_in_insertion_order() {
        let fake = Arc::new(FakeTransport::new());
        let list = PolicyList::new("!a:example.org", fake.clone());
        fake.write_rule(&list, EntityKind::Server, "*.evil.example", "net").await;
        list.update_list().await.unwrap();

        let cache = ListRuleCache::new(EntityKind::Server, Recommendation::Ban);
        cache.intern_snapshot(&list);
        assert!(cache.get_any_rule_for_entity("a.evil.example").is_some());
        assert!(cache.get_any_rule_for_entity("evil.example").is_none());
    }
}
