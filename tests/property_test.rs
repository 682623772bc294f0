//! Property-based tests for the engine's core invariants and round-trip laws.

use proptest::prelude::*;
use std::sync::Arc;
use wardensync::core::access_control_unit::UserPolicy;
use wardensync::test_support::FakeTransport;
use wardensync::{AccessControlUnit, EntityKind, PolicyList};

fn arb_mxid() -> impl Strategy<Value = String> {
    "[a-z]{3,10}".prop_map(|local| format!("@{local}:example.org"))
}

fn arb_reason() -> impl Strategy<Value = String> {
    "[a-zA-Z ]{0,20}"
}

proptest! {
    /// An `AccessControlUnit` with empty caches and no ban rules allows
    /// every entity, no matter what it's named.
    #[test]
    fn empty_acu_always_allows(entity in arb_mxid()) {
        let acu = AccessControlUnit::new();
        prop_assert!(acu.get_access_for_user(&entity, UserPolicy::CheckServer).is_allowed());
    }

    /// `ban_entity` followed by `unban_entity` leaves no active rule for
    /// that entity, whatever the entity or reason text.
    #[test]
    fn ban_then_unban_clears_the_rule(entity in arb_mxid(), reason in arb_reason()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let fake = Arc::new(FakeTransport::new());
            let list = PolicyList::new("!policy:example.org", fake.clone());

            list.ban_entity(EntityKind::User, &entity, &reason).await.unwrap();
            list.update_list().await.unwrap();
            prop_assert_eq!(list.rules_matching_entity(&entity, Some(EntityKind::User)).len(), 1);

            let removed = list.unban_entity(EntityKind::User, &entity).await.unwrap();
            prop_assert!(removed);
            list.update_list().await.unwrap();
            prop_assert!(list.rules_matching_entity(&entity, Some(EntityKind::User)).is_empty());
            Ok(())
        })?;
    }

    /// Refreshing a list with unchanged source state yields an empty
    /// change-set and leaves the revision untouched.
    #[test]
    fn unchanged_state_yields_no_change_and_stable_revision(entity in arb_mxid(), reason in arb_reason()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let fake = Arc::new(FakeTransport::new());
            let list = PolicyList::new("!policy:example.org", fake.clone());
            fake.write_rule(&list, EntityKind::User, &entity, &reason).await;

            let (r1, first_changes) = list.update_list().await.unwrap();
            prop_assert_eq!(first_changes.len(), 1);

            let (r2, second_changes) = list.update_list().await.unwrap();
            prop_assert!(second_changes.is_empty());
            prop_assert_eq!(r1, r2);
            Ok(())
        })?;
    }
}
