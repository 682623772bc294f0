//! A deduped FIFO of per-(user, room) redaction tasks executed after bans
//! land.

use crate::core::errors::EngineError;
use crate::core::transport::Transport;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RedactUser {
    pub user: String,
    pub room: String,
}

/// One task's outcome after a drain, used to report failures without
/// retrying them.
#[derive(Debug, Clone)]
pub struct RedactionFailure {
    pub task: RedactUser,
    pub error: EngineError,
}

pub struct EventRedactionQueue {
    queued: Mutex<Vec<RedactUser>>,
    seen: Mutex<HashSet<RedactUser>>,
}

impl EventRedactionQueue {
    pub fn new() -> Self {
        Self {
            queued: Mutex::new(Vec::new()),
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// No-op if `(user, room)` is already queued.
    pub fn enqueue(&self, user: &str, room: &str) {
        let task = RedactUser { user: user.to_string(), room: room.to_string() };
        let mut seen = self.seen.lock();
        if seen.insert(task.clone()) {
            self.queued.lock().push(task);
        }
    }

    pub fn len(&self) -> usize {
        self.queued.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.lock().is_empty()
    }

    /// Redacts every message the user sent in the room since their most
    /// recent join. Failed tasks are dropped from the queue without retry
    /// and returned alongside the set of rooms actually drained — the queue
    /// never blocks on a single failing task. When `no_op` is set, tasks are
    /// drained and logged but `transport.redact_event` is never called.
    pub async fn process(&self, transport: &Arc<dyn Transport>, room_filter: Option<&str>, no_op: bool) -> Vec<RedactionFailure> {
        let (to_run, remaining): (Vec<RedactUser>, Vec<RedactUser>) = {
            let mut queued = self.queued.lock();
            let drained = std::mem::take(&mut *queued);
            match room_filter {
                Some(room) => drained.into_iter().partition(|t| t.room == room),
                None => (drained, Vec::new()),
            }
        };

        let mut failures = Vec::new();
        for task in to_run {
            if no_op {
                debug!(user = %task.user, room = %task.room, "no_op: would redact messages since last join");
                self.seen.lock().remove(&task);
                continue;
            }
            match redact_task(transport, &task).await {
                Ok(()) => {
                    self.seen.lock().remove(&task);
                }
                Err(error) => {
                    warn!(user = %task.user, room = %task.room, %error, "redaction task failed, dropping without retry");
                    self.seen.lock().remove(&task);
                    failures.push(RedactionFailure { task, error });
                }
            }
        }

        *self.queued.lock() = remaining;
        failures
    }
}

async fn redact_task(transport: &Arc<dyn Transport>, task: &RedactUser) -> Result<(), EngineError> {
    let event_ids = transport.messages_since_last_join(&task.room, &task.user).await?;
    for event_id in event_ids {
        transport.redact_event(&task.room, &event_id, Some("policy violation")).await?;
    }
    Ok(())
}

impl Default for EventRedactionQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeTransport;

    #[test]
    fn duplicate_enqueue_is_a_no_op() {
        let queue = EventRedactionQueue::new();
        queue.enqueue("@spam:bad.example", "!r1:example.org");
        queue.enqueue("@spam:bad.example", "!r1:example.org");
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn process_filters_to_a_single_room() {
        let fake: Arc<dyn Transport> = Arc::new(FakeTransport::new());
        let queue = EventRedactionQueue::new();
        queue.enqueue("@spam:bad.example", "!r1:example.org");
        queue.enqueue("@spam:bad.example", "!r2:example.org");

        let failures = queue.process(&fake, Some("!r1:example.org"), false).await;
        assert!(failures.is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn drain_redacts_every_message_since_last_join() {
        let concrete = Arc::new(FakeTransport::new());
        concrete.set_messages_since_join("!r1:example.org", "@spam:bad.example", vec!["$m1".into(), "$m2".into()]);
        let fake: Arc<dyn Transport> = concrete.clone();

        let queue = EventRedactionQueue::new();
        queue.enqueue("@spam:bad.example", "!r1:example.org");
        let failures = queue.process(&fake, None, false).await;
        assert!(failures.is_empty());
        assert_eq!(concrete.redactions().len(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn no_op_drains_queue_without_calling_transport() {
        let concrete = Arc::new(FakeTransport::new());
        concrete.set_messages_since_join("!r1:example.org", "@spam:bad.example", vec!["$m1".into()]);
        let fake: Arc<dyn Transport> = concrete.clone();

        let queue = EventRedactionQueue::new();
        queue.enqueue("@spam:bad.example", "!r1:example.org");
        let failures = queue.process(&fake, None, true).await;
        assert!(failures.is_empty());
        assert!(concrete.redactions().is_empty(), "no_op must not call transport.redact_event");
        assert!(queue.is_empty(), "task is still drained from the queue under no_op");
    }
}
