// src/server/mod.rs

//! Wires the engine core to a live transport and drives its event loop: the
//! runtime a real deployment needs around `ProtectedRoomsSet`, kept out of
//! `src/core` so the engine itself never depends on a concrete `Transport`
//! or on `tokio::spawn`.

mod initialization;
mod sync_loop;

use crate::config::Config;
use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

/// Starts the engine against a live homeserver and runs until shutdown.
///
/// Three cooperating tasks share one `ProtectedRoomsSet`: the transport's
/// `/sync` long-poll loop, the push-event consumer that feeds `handle_event`
/// and `PolicyList::update_for_event`, and a periodic `sync_lists` timer that
/// catches watched lists whose refresh the batcher hasn't yet settled.
pub async fn run(
    config: Config,
    _log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    let context = initialization::setup(config).await?;
    info!(
        rooms = context.protected_rooms.protected_rooms().len(),
        lists = context.protected_rooms.watched_lists().len(),
        "wardensync engine initialized"
    );

    sync_loop::run(context).await;
    Ok(())
}

/// Requests cooperative shutdown of a running engine: in-flight state writes
/// finish or fail, queued redactions are dropped.
pub fn request_shutdown(protected_rooms: &crate::core::ProtectedRoomsSet) {
    protected_rooms.request_shutdown();
}

pub(crate) use initialization::ServerContext;
