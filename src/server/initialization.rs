// src/server/initialization.rs

//! Builds the transport, the orchestrator, and restores persisted watch
//! state before the runtime's event loops start, reading back any watched
//! lists an earlier run had persisted as operator account data.

use crate::config::Config;
use crate::core::policy_list::PolicyList;
use crate::core::protected_rooms::{ProtectedRoomsSet, ProtectionConfig};
use crate::core::transport::Transport;
use crate::core::wire::WatchedListsContent;
use crate::core::wire::WATCHED_LISTS_ACCOUNT_DATA_TYPE;
use crate::transport::MatrixHttpTransport;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ServerContext {
    pub transport: Arc<dyn Transport>,
    /// The concrete transport, kept alongside the trait object so the
    /// runtime can drive its `/sync` long-poll loop directly — a method the
    /// `Transport` trait itself has no reason to expose, since that trait
    /// only names the push-event *subscription*, not how it's populated.
    pub matrix_transport: Arc<MatrixHttpTransport>,
    pub protected_rooms: Arc<ProtectedRoomsSet>,
}

pub async fn setup(config: Config) -> Result<ServerContext> {
    let matrix_transport = Arc::new(MatrixHttpTransport::new(
        config.homeserver_url.clone(),
        config.access_token.clone(),
        config.self_user_id.clone(),
    ));
    let transport: Arc<dyn Transport> = matrix_transport.clone();

    let protection = ProtectionConfig {
        self_server: config.self_server.clone(),
        self_user_id: config.self_user_id.clone(),
        management_room: config.management_room.clone(),
        automatically_redact_for_reasons: config.protection.automatically_redact_for_reasons.clone(),
        faster_membership_checks: config.protection.faster_membership_checks,
        no_op: config.protection.no_op,
        verbose_logging: config.protection.verbose_logging,
        confirm_wildcard_ban: config.protection.confirm_wildcard_ban,
    };
    let protected_rooms = ProtectedRoomsSet::new(transport.clone(), protection);

    for room in &config.protected_rooms {
        protected_rooms.add_protected_room(room);
    }

    let mut watch_targets = config.policy_rooms.clone();
    match transport.get_account_data(WATCHED_LISTS_ACCOUNT_DATA_TYPE).await {
        Ok(Some(value)) => match serde_json::from_value::<WatchedListsContent>(value) {
            Ok(persisted) => {
                for room in persisted.references {
                    if !watch_targets.contains(&room) {
                        watch_targets.push(room);
                    }
                }
            }
            Err(e) => warn!(error = %e, "malformed persisted watched-lists account data, ignoring"),
        },
        Ok(None) => {}
        Err(e) => warn!(error = %e, "failed to load persisted watched lists, starting with config-only set"),
    }

    let policy_room_set: std::collections::HashSet<String> = watch_targets.iter().cloned().collect();

    for room in watch_targets {
        let list = PolicyList::new(room.clone(), transport.clone());
        match list.update_list().await {
            Ok(_) => {
                protected_rooms.watch_list(list);
                info!(room, "watching policy room");
            }
            Err(e) => warn!(room, error = %e, "failed to load initial state for policy room, skipping"),
        }
    }

    if config.protection.protect_all_joined_rooms {
        apply_protect_all_joined_rooms(&transport, &protected_rooms, &policy_room_set).await;
    }

    Ok(ServerContext { transport, matrix_transport, protected_rooms })
}

/// Adds every joined room not already a watched policy list to the
/// protected set. Split out from `setup` so it can be exercised directly
/// against a `FakeTransport` without a live homeserver.
async fn apply_protect_all_joined_rooms(
    transport: &Arc<dyn Transport>,
    protected_rooms: &Arc<ProtectedRoomsSet>,
    policy_room_set: &std::collections::HashSet<String>,
) {
    match transport.get_joined_rooms().await {
        Ok(joined) => {
            for room in joined.into_iter().filter(|r| !policy_room_set.contains(r)) {
                protected_rooms.add_protected_room(&room);
            }
        }
        Err(e) => warn!(error = %e, "failed to list joined rooms for protect_all_joined_rooms"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeTransport;

    fn protection_config() -> ProtectionConfig {
        ProtectionConfig {
            self_server: "matrix.self".to_string(),
            self_user_id: "@warden:matrix.self".to_string(),
            management_room: "!mgmt:matrix.self".to_string(),
            automatically_redact_for_reasons: vec![],
            faster_membership_checks: false,
            no_op: false,
            verbose_logging: false,
            confirm_wildcard_ban: true,
        }
    }

    #[tokio::test]
    async fn protect_all_joined_rooms_adds_joined_non_policy_rooms() {
        let fake = Arc::new(FakeTransport::new());
        fake.set_joined_rooms(vec!["!policy:example.org".to_string(), "!general:example.org".to_string()]);
        let transport: Arc<dyn Transport> = fake.clone();
        let protected_rooms = ProtectedRoomsSet::new(transport.clone(), protection_config());
        let policy_rooms: std::collections::HashSet<String> = ["!policy:example.org".to_string()].into_iter().collect();

        apply_protect_all_joined_rooms(&transport, &protected_rooms, &policy_rooms).await;

        assert!(protected_rooms.is_protected("!general:example.org"));
        assert!(!protected_rooms.is_protected("!policy:example.org"));
    }
}
