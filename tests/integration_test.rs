//! End-to-end scenarios exercised against the public engine contracts over
//! the in-memory `FakeTransport` rather than any mock of an individual
//! component.

use std::sync::Arc;
use wardensync::core::access_control_unit::UserPolicy;
use wardensync::core::protected_rooms::ProtectionConfig;
use wardensync::core::server_acl::ServerAcl;
use wardensync::core::transport::Transport;
use wardensync::test_support::FakeTransport;
use wardensync::{EntityKind, PolicyList, ProtectedRoomsSet};

fn protection_config(self_server: &str) -> ProtectionConfig {
    ProtectionConfig {
        self_server: self_server.to_string(),
        self_user_id: "@warden:matrix.self".to_string(),
        management_room: "!mgmt:matrix.self".to_string(),
        automatically_redact_for_reasons: vec!["*spam*".to_string()],
        faster_membership_checks: true,
        no_op: false,
        verbose_logging: false,
    }
}

#[tokio::test]
async fn scenario_single_user_ban_projects_onto_every_joined_room() {
    let fake = Arc::new(FakeTransport::new());
    let transport: Arc<dyn Transport> = fake.clone();
    let set = ProtectedRoomsSet::new(transport, protection_config("matrix.self"));

    let list = PolicyList::new("!policy:example.org", fake.clone());
    fake.write_rule(&list, EntityKind::User, "@spam:bad.example", "abuse").await;
    let (_, changes) = list.update_list().await.unwrap();
    assert_eq!(changes.len(), 1);
    set.watch_list(list);

    assert!(set
        .acu
        .get_access_for_user("@spam:bad.example", UserPolicy::IgnoreServer)
        .is_banned());

    set.add_protected_room("!r1:matrix.self");
    set.add_protected_room("!r2:matrix.self");
    fake.set_joined_members("!r1:matrix.self", vec!["@spam:bad.example".to_string(), "@good:matrix.self".to_string()]);
    fake.set_joined_members("!r2:matrix.self", vec!["@spam:bad.example".to_string()]);

    let errors = set.sync_rooms_with_policies().await;
    assert!(errors.is_empty());
    let bans = fake.bans();
    assert_eq!(bans.len(), 2);
    assert!(bans.iter().all(|(user, _, reason)| user == "@spam:bad.example" && reason == "abuse"));
}

#[tokio::test]
async fn scenario_wildcard_server_deny_excludes_self_and_defaults_allow_to_wildcard() {
    let fake = Arc::new(FakeTransport::new());
    let list = PolicyList::new("!policy:example.org", fake.clone());
    fake.write_server_rule(&list, "*.evil.example", "net abuse").await;
    fake.write_server_rule(&list, "matrix.self", "self ban attempt").await;
    list.update_list().await.unwrap();

    let acu = wardensync::AccessControlUnit::new();
    acu.watch_list(&list);
    let acl = ServerAcl::compile(&acu, "matrix.self");
    let safe = acl.safe_acl_content();

    assert_eq!(safe.allow, vec!["*".to_string()]);
    assert!(!safe.allow_ip_literals);
    assert_eq!(safe.deny, vec!["*.evil.example".to_string()]);
}

#[tokio::test]
async fn scenario_redaction_queue_drains_only_the_requested_room_after_the_ban_lands() {
    let fake = Arc::new(FakeTransport::new());
    let transport: Arc<dyn Transport> = fake.clone();
    let set = ProtectedRoomsSet::new(transport, protection_config("matrix.self"));

    let list = PolicyList::new("!policy:example.org", fake.clone());
    fake.write_rule(&list, EntityKind::User, "@spam:bad.example", "spam links").await;
    list.update_list().await.unwrap();
    set.watch_list(list);

    set.add_protected_room("!r1:matrix.self");
    fake.set_joined_members("!r1:matrix.self", vec!["@spam:bad.example".to_string()]);
    fake.set_messages_since_join("!r1:matrix.self", "@spam:bad.example", vec!["$m1".to_string(), "$m2".to_string()]);

    set.sync_rooms_with_policies().await;

    assert_eq!(fake.bans().len(), 1, "the ban must land before the redaction drain runs");
    assert_eq!(fake.redactions().len(), 2);
    assert!(fake.redactions().iter().all(|(room, _)| room == "!r1:matrix.self"));
}

#[tokio::test]
async fn scenario_newer_canonical_type_wins_and_legacy_redaction_is_a_no_op() {
    let fake = Arc::new(FakeTransport::new());
    let list = PolicyList::new("!policy:example.org", fake.clone());

    fake.write_legacy_rule(&list, EntityKind::User, 2, "@a:b.example", "legacy").await;
    list.update_list().await.unwrap();
    assert_eq!(list.rules_matching_entity("@a:b.example", Some(EntityKind::User)).len(), 1);

    fake.write_rule(&list, EntityKind::User, "@a:b.example", "canonical").await;
    list.update_list().await.unwrap();
    let rules = list.rules_matching_entity("@a:b.example", Some(EntityKind::User));
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].reason, "canonical");

    fake.soft_redact(list.room_id(), "org.matrix.mjolnir.rule.user", "rule:@a:b.example").await;
    list.update_list().await.unwrap();
    let rules = list.rules_matching_entity("@a:b.example", Some(EntityKind::User));
    assert_eq!(rules.len(), 1, "soft-redacting the shadowed legacy event must not touch the active rule");
    assert_eq!(rules[0].reason, "canonical");

    fake.soft_redact(list.room_id(), "m.policy.rule.user", "rule:@a:b.example").await;
    list.update_list().await.unwrap();
    assert!(list.rules_matching_entity("@a:b.example", Some(EntityKind::User)).is_empty());
}

#[tokio::test]
async fn scenario_revisions_form_a_strict_total_order_across_two_updates() {
    let fake = Arc::new(FakeTransport::new());
    let list = PolicyList::new("!policy:example.org", fake.clone());

    fake.write_rule(&list, EntityKind::User, "@a:example.org", "one").await;
    let (r1, _) = list.update_list().await.unwrap();

    fake.write_rule(&list, EntityKind::User, "@b:example.org", "two").await;
    let (r2, _) = list.update_list().await.unwrap();

    assert!(r2.supersedes(&r1));
    assert!(!r1.supersedes(&r2));
}

#[tokio::test]
async fn scenario_activity_tracker_orders_rooms_most_recent_first() {
    let set = ProtectedRoomsSet::new(
        Arc::new(FakeTransport::new()),
        protection_config("matrix.self"),
    );
    for room in ["!r5", "!r4", "!r3", "!r2", "!r1"] {
        set.add_protected_room(room);
    }
    for (i, room) in ["!r5", "!r4", "!r3", "!r2", "!r1"].iter().enumerate() {
        set.activity_tracker.record_event(room, i as i64);
    }
    assert_eq!(
        set.activity_tracker.rooms_by_activity(),
        vec!["!r1", "!r2", "!r3", "!r4", "!r5"]
    );
}
