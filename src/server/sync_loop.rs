// src/server/sync_loop.rs

//! The runtime's three cooperating background tasks: the transport's own
//! `/sync` long-poll, a push-event consumer that feeds the engine, and a
//! periodic catch-up sync. All three stop when the orchestrator's shutdown
//! token is cancelled.

use super::ServerContext;
use crate::commands::{self, CommandContext};
use crate::core::transport::{OutgoingMessage, Transport};
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info, warn};

/// How often `sync_lists` runs as a catch-up behind the per-event update
/// path, in case a batcher's timed refresh was lost to a transient error.
const PERIODIC_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Parses and runs one line of the management-room command surface,
/// posting the textual reply (or error) back to the same room.
async fn handle_command(
    protected_rooms: &std::sync::Arc<crate::core::ProtectedRoomsSet>,
    transport: &std::sync::Arc<dyn Transport>,
    confirm_wildcard_ban: bool,
    management_room: &str,
    line: &str,
) {
    let ctx = CommandContext { protected_rooms: protected_rooms.clone(), transport: transport.clone() };
    let reply = match commands::dispatch(&ctx, confirm_wildcard_ban, line).await {
        Ok(reply) => reply,
        Err(e) => format!("Error: {e}"),
    };
    if let Err(e) = transport.send_message(management_room, OutgoingMessage::notice(reply.clone(), reply)).await {
        warn!(error = %e, "failed to post command reply to management room");
    }
}

pub async fn run(context: ServerContext) {
    let shutdown = context.protected_rooms.shutdown_token();

    let matrix_transport = context.matrix_transport.clone();
    let sync_shutdown = shutdown.clone();
    let sync_task = tokio::spawn(async move {
        tokio::select! {
            _ = matrix_transport.run_sync_loop() => {}
            _ = sync_shutdown.cancelled() => {}
        }
    });

    let Some(mut push_events) = context.transport.take_push_events() else {
        info!("push-event channel already taken, skipping push-event consumer");
        return;
    };
    let protected_rooms = context.protected_rooms.clone();
    let transport = context.transport.clone();
    let push_shutdown = shutdown.clone();
    let push_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = push_shutdown.cancelled() => break,
                event = push_events.recv() => {
                    let Some(push) = event else { break };
                    let config = protected_rooms.config();
                    if push.room_id == config.management_room
                        && push.event.event_type == "m.room.message"
                        && push.event.sender != config.self_user_id
                    {
                        if let Some(body) = push.event.content.get("body").and_then(|v| v.as_str()) {
                            handle_command(&protected_rooms, &transport, config.confirm_wildcard_ban, &config.management_room, body).await;
                        }
                    }
                    if protected_rooms.is_protected(&push.room_id) {
                        protected_rooms.handle_event(&push.room_id, &push.event).await;
                    }
                    if let Some(list) = protected_rooms
                        .watched_lists()
                        .into_iter()
                        .find(|l| l.room_id() == push.room_id)
                    {
                        list.update_for_event(&push.event.event_id);
                    }
                }
            }
        }
        debug!("push-event consumer stopped");
    });

    let protected_rooms = context.protected_rooms.clone();
    let periodic_shutdown = shutdown.clone();
    let periodic_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = periodic_shutdown.cancelled() => break,
                _ = tokio::time::sleep(PERIODIC_SYNC_INTERVAL) => {
                    let errors = protected_rooms.sync_lists().await;
                    if !errors.is_empty() {
                        debug!(count = errors.len(), "periodic sync reported errors");
                    }
                }
            }
        }
        debug!("periodic sync task stopped");
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("ctrl-c received, requesting shutdown");
            context.protected_rooms.request_shutdown();
        }
        _ = shutdown.cancelled() => {}
    }

    let _ = tokio::join!(sync_task, push_task, periodic_task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protected_rooms::ProtectionConfig;
    use crate::test_support::FakeTransport;
    use std::sync::Arc;

    fn protection_config() -> ProtectionConfig {
        ProtectionConfig {
            self_server: "matrix.self".to_string(),
            self_user_id: "@warden:matrix.self".to_string(),
            management_room: "!mgmt:matrix.self".to_string(),
            automatically_redact_for_reasons: vec![],
            faster_membership_checks: true,
            no_op: false,
            verbose_logging: false,
            confirm_wildcard_ban: true,
        }
    }

    #[tokio::test]
    async fn handle_command_posts_the_reply_to_the_management_room() {
        let fake = Arc::new(FakeTransport::new());
        let transport: Arc<dyn Transport> = fake.clone();
        let protected_rooms = crate::core::ProtectedRoomsSet::new(transport.clone(), protection_config());

        handle_command(&protected_rooms, &transport, true, "!mgmt:matrix.self", "watch !policy:example.org").await;

        assert!(protected_rooms.watched_lists().iter().any(|l| l.room_id() == "!policy:example.org"));
        let sent = fake.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "!mgmt:matrix.self");
        assert!(sent[0].1.body.contains("Now watching"));
    }

    #[tokio::test]
    async fn handle_command_reports_parse_errors_back_to_the_room() {
        let fake = Arc::new(FakeTransport::new());
        let transport: Arc<dyn Transport> = fake.clone();
        let protected_rooms = crate::core::ProtectedRoomsSet::new(transport.clone(), protection_config());

        handle_command(&protected_rooms, &transport, true, "!mgmt:matrix.self", "bogus").await;

        let sent = fake.sent_messages();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.body.starts_with("Error:"));
    }
}
