// src/commands/mod.rs

//! A thin textual command surface for the management room. Deliberately
//! minimal — this is not a general-purpose DSL, just enough literal syntax
//! to drive every public engine contract end to end.

use crate::core::errors::{EngineError, EngineResult};
use crate::core::policy_list::PolicyList;
use crate::core::protected_rooms::ProtectedRoomsSet;
use crate::core::rule::EntityKind;
use crate::core::transport::Transport;
use crate::core::wire::{WatchedListsContent, WATCHED_LISTS_ACCOUNT_DATA_TYPE};
use std::sync::Arc;
use tracing::info;

pub struct CommandContext {
    pub protected_rooms: Arc<ProtectedRoomsSet>,
    pub transport: Arc<dyn Transport>,
}

fn parse_kind(token: &str) -> EngineResult<EntityKind> {
    match token {
        "user" => Ok(EntityKind::User),
        "room" => Ok(EntityKind::Room),
        "server" => Ok(EntityKind::Server),
        other => Err(EngineError::Config(format!("unknown entity kind '{other}', expected user/room/server"))),
    }
}

fn find_list(ctx: &CommandContext, list_ref: &str) -> EngineResult<PolicyList> {
    ctx.protected_rooms
        .watched_lists()
        .into_iter()
        .find(|l| l.room_id() == list_ref || l.shortcode().as_deref() == Some(list_ref))
        .ok_or_else(|| EngineError::Config(format!("no such watched list: {list_ref}")))
}

fn is_wildcard(entity: &str) -> bool {
    entity.contains('*') || entity.contains('?')
}

async fn persist_watched_lists(ctx: &CommandContext) -> EngineResult<()> {
    let references: Vec<String> = ctx.protected_rooms.watched_lists().iter().map(|l| l.room_id().to_string()).collect();
    ctx.transport
        .set_account_data(WATCHED_LISTS_ACCOUNT_DATA_TYPE, serde_json::to_value(WatchedListsContent { references })?)
        .await
}

/// Parses and executes one command line, returning the plaintext reply to
/// post back to the management room.
pub async fn dispatch(ctx: &CommandContext, confirm_wildcard_ban: bool, line: &str) -> EngineResult<String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some((&head, rest)) = tokens.split_first() else {
        return Err(EngineError::Config("empty command".to_string()));
    };

    match head {
        "watch" => {
            let [room_ref, extra @ ..] = rest else {
                return Err(EngineError::Config("usage: watch <room> [as <shortcode>]".to_string()));
            };
            let room_id = ctx.transport.join_room(room_ref).await?;
            let list = PolicyList::new(room_id.clone(), ctx.transport.clone());
            list.update_list().await?;
            ctx.protected_rooms.watch_list(list);
            persist_watched_lists(ctx).await?;
            let shortcode_note = match extra {
                ["as", shortcode] => format!(" (as {shortcode})"),
                _ => String::new(),
            };
            info!(room = %room_id, "now watching policy room");
            Ok(format!("Now watching {room_id}{shortcode_note}"))
        }
        "unwatch" => {
            let [list_ref] = rest else {
                return Err(EngineError::Config("usage: unwatch <room|shortcode>".to_string()));
            };
            let list = find_list(ctx, list_ref)?;
            ctx.protected_rooms.unwatch_list(list.room_id());
            persist_watched_lists(ctx).await?;
            Ok(format!("Stopped watching {}", list.room_id()))
        }
        "rooms" => match rest {
            ["add", room_ref] => {
                let room_id = ctx.transport.join_room(room_ref).await?;
                ctx.protected_rooms.add_protected_room(&room_id);
                Ok(format!("Protecting {room_id}"))
            }
            ["remove", room_ref] => {
                ctx.protected_rooms.remove_protected_room(room_ref);
                Ok(format!("No longer protecting {room_ref}"))
            }
            _ => Err(EngineError::Config("usage: rooms add|remove <room>".to_string())),
        },
        "ban" => {
            let (list_ref, kind_token, entity, reason_tokens) = match rest {
                [list_ref, kind, entity, reason @ ..] => (*list_ref, *kind, *entity, reason),
                _ => return Err(EngineError::Config("usage: ban <list> <user|room|server> <entity> <reason...>".to_string())),
            };
            let kind = parse_kind(kind_token)?;
            if is_wildcard(entity) && confirm_wildcard_ban && !reason_tokens.contains(&"--confirm") {
                return Err(EngineError::Config(format!(
                    "'{entity}' looks like a wildcard ban; append --confirm to proceed"
                )));
            }
            let reason: String = reason_tokens.iter().filter(|t| **t != "--confirm").cloned().collect::<Vec<_>>().join(" ");
            let list = find_list(ctx, list_ref)?;
            list.ban_entity(kind, entity, &reason).await?;
            Ok(format!("Banned {entity} ({kind_token}) in {list_ref}: {reason}"))
        }
        "unban" => {
            let [list_ref, kind_token, entity] = rest else {
                return Err(EngineError::Config("usage: unban <list> <user|room|server> <entity>".to_string()));
            };
            let kind = parse_kind(kind_token)?;
            let list = find_list(ctx, list_ref)?;
            let removed = list.unban_entity(kind, entity).await?;
            if removed {
                Ok(format!("Unbanned {entity} ({kind_token}) in {list_ref}"))
            } else {
                Ok(format!("No active rule for {entity} ({kind_token}) in {list_ref}"))
            }
        }
        "status" => {
            let watched: Vec<String> = ctx.protected_rooms.watched_lists().iter().map(|l| l.room_id().to_string()).collect();
            let protected = ctx.protected_rooms.protected_rooms();
            Ok(format!(
                "Watching {} list(s): {}\nProtecting {} room(s): {}\nRedaction queue depth: {}",
                watched.len(),
                watched.join(", "),
                protected.len(),
                protected.join(", "),
                ctx.protected_rooms.redaction_queue.len(),
            ))
        }
        other => Err(EngineError::Config(format!("unrecognized command '{other}'"))),
    }
}
