//! Builds the wire-format `m.room.server_acl` payload from an
//! [`AccessControlUnit`]'s server caches, enforcing the self-protection
//! invariant that the daemon never bans its own server.

use crate::core::access_control_unit::AccessControlUnit;
use crate::core::wire::ServerAclContent;
use tracing::warn;

/// A compiled server ACL, available in two comparison modes: `literal`
/// includes every configured deny entry; `safe` is what is
/// actually written, with self-banning entries removed.
#[derive(Debug, Clone)]
pub struct ServerAcl {
    allow: Vec<String>,
    /// Deny entries that do not match the self server.
    safe_deny: Vec<String>,
    /// Every configured deny entry, including ones that would self-ban.
    literal_deny: Vec<String>,
}

impl ServerAcl {
    /// Compiles an ACL from the unit's server caches against `self_server`.
    pub fn compile(acu: &AccessControlUnit, self_server: &str) -> Self {
        let allow_rules = acu.server_allow.all_rules();
        let mut allow: Vec<String> = if allow_rules.is_empty() {
            vec!["*".to_string()]
        } else {
            allow_rules.iter().map(|r| r.entity.clone()).collect()
        };

        let self_server_lower = self_server.to_lowercase();
        if !allow
            .iter()
            .any(|pattern| crate::core::rule::EntityPattern::compile(&pattern.to_lowercase()).matches(&self_server_lower))
        {
            warn!(self_server, "self server not covered by compiled allow set, injecting it");
            allow.push(self_server.to_string());
        }

        let mut safe_deny = Vec::new();
        let mut literal_deny = Vec::new();
        for rule in acu.server_ban.all_rules() {
            literal_deny.push(rule.entity.clone());
            if rule.matches_entity(self_server) {
                warn!(entity = %rule.entity, self_server, "skipping server-ban rule that would self-ban");
                continue;
            }
            safe_deny.push(rule.entity);
        }

        Self { allow, safe_deny, literal_deny }
    }

    /// What is actually written to a protected room's state.
    pub fn safe_acl_content(&self) -> ServerAclContent {
        ServerAclContent {
            allow: self.allow.clone(),
            deny: self.safe_deny.clone(),
            allow_ip_literals: false,
        }
    }

    /// Every deny rule the watched lists produced, including ones that would
    /// self-ban. Exposed for tests that need to assert the self-protection
    /// filter actually removed something.
    pub fn literal_acl_content(&self) -> ServerAclContent {
        ServerAclContent {
            allow: self.allow.clone(),
            deny: self.literal_deny.clone(),
            allow_ip_literals: false,
        }
    }

    pub fn matches(&self, current: &ServerAclContent) -> bool {
        self.safe_acl_content().structurally_equal(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::EntityKind;
    use crate::core::policy_list::PolicyList;
    use crate::test_support::FakeTransport;
    use std::sync::Arc;

    #[tokio::test]
    async fn empty_allow_cache_allows_everything() {
        let acu = AccessControlUnit::new();
        let acl = ServerAcl::compile(&acu, "matrix.self");
        assert_eq!(acl.safe_acl_content().allow, vec!["*".to_string()]);
        assert!(!acl.safe_acl_content().allow_ip_literals);
    }

    #[tokio::test]
    async fn wildcard_deny_excludes_self_server() {
        let fake = Arc::new(FakeTransport::new());
        let list = PolicyList::new("!policy:example.org", fake.clone());
        fake.write_server_rule(&list, "*.evil.example", "net").await;
        fake.write_server_rule(&list, "matrix.self", "self ban attempt").await;
        list.update_list().await.unwrap();

        let acu = AccessControlUnit::new();
        acu.watch_list(&list);
        let acl = ServerAcl::compile(&acu, "matrix.self");
        let safe = acl.safe_acl_content();
        assert!(safe.deny.contains(&"*.evil.example".to_string()));
        assert!(!safe.deny.contains(&"matrix.self".to_string()));

        let literal = acl.literal_acl_content();
        assert!(literal.deny.contains(&"matrix.self".to_string()));
    }

    #[tokio::test]
    async fn differently_cased_self_ban_rule_is_still_filtered() {
        let fake = Arc::new(FakeTransport::new());
        let list = PolicyList::new("!policy:example.org", fake.clone());
        fake.write_server_rule(&list, "Matrix.Self", "self ban attempt").await;
        list.update_list().await.unwrap();

        let acu = AccessControlUnit::new();
        acu.watch_list(&list);
        let acl = ServerAcl::compile(&acu, "matrix.self");
        assert!(!acl.safe_acl_content().deny.contains(&"matrix.self".to_string()));
        assert!(acl.literal_acl_content().deny.contains(&"matrix.self".to_string()));
    }

    #[tokio::test]
    async fn self_server_injected_when_not_covered_by_allow_set() {
        let fake = Arc::new(FakeTransport::new());
        let list = PolicyList::new("!policy:example.org", fake.clone());
        fake.write_allow_rule(&list, EntityKind::Server, "trusted.example", "vouched").await;
        list.update_list().await.unwrap();

        let acu = AccessControlUnit::new();
        acu.watch_list(&list);
        let acl = ServerAcl::compile(&acu, "matrix.self");
        assert!(acl.safe_acl_content().allow.contains(&"matrix.self".to_string()));
    }

    #[tokio::test]
    async fn structural_equality_ignores_order() {
        let a = ServerAclContent {
            allow: vec!["*".into()],
            deny: vec!["a.example".into(), "b.example".into()],
            allow_ip_literals: false,
        };
        let b = ServerAclContent {
            allow: vec!["*".into()],
            deny: vec!["b.example".into(), "a.example".into()],
            allow_ip_literals: false,
        };
        assert!(a.structurally_equal(&b));
    }
}
