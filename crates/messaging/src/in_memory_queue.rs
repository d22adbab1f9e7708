use std::sync::Mutex;

use chrono::Utc;
use tracing::trace;

use crate::queue::{MessageQueue, OutgoingMessage, QueueError, QueuedMessage, ReceiveOutcome};

struct Row {
    id: u64,
    body: String,
    deliver_after: Option<chrono::DateTime<chrono::Utc>>,
    correlation_id: Option<String>,
    /// Held by an in-flight `receive`; skipped by concurrent receivers.
    claimed: bool,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    rows: Vec<Row>,
}

/// In-memory [`MessageQueue`] with the same claim/delete semantics as the
/// Postgres implementation. Used in tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryMessageQueue {
    inner: Mutex<Inner>,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently stored (claimed or not).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageQueue for InMemoryMessageQueue {
    fn send(&self, messages: Vec<OutgoingMessage>) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        for message in messages {
            inner.next_id += 1;
            let id = inner.next_id;
            inner.rows.push(Row {
                id,
                body: message.body,
                deliver_after: message.deliver_after,
                correlation_id: message.correlation_id,
                claimed: false,
            });
        }
        Ok(())
    }

    fn receive(
        &self,
        subscriber: &dyn Fn(&QueuedMessage) -> anyhow::Result<()>,
    ) -> Result<ReceiveOutcome, QueueError> {
        let now = Utc::now();

        // Claim the oldest eligible row, then run the subscriber without
        // holding the lock so handlers can send to this same queue.
        let claimed = {
            let mut inner = self.inner.lock().unwrap();
            let row = inner
                .rows
                .iter_mut()
                .filter(|row| !row.claimed)
                .filter(|row| row.deliver_after.is_none_or(|at| at <= now))
                .min_by_key(|row| row.id);

            match row {
                Some(row) => {
                    row.claimed = true;
                    QueuedMessage {
                        id: row.id,
                        body: row.body.clone(),
                        correlation_id: row.correlation_id.clone(),
                    }
                }
                None => return Ok(ReceiveOutcome::Empty),
            }
        };

        match subscriber(&claimed) {
            Ok(()) => {
                let mut inner = self.inner.lock().unwrap();
                inner.rows.retain(|row| row.id != claimed.id);
                trace!(message_id = claimed.id, "message handled and deleted");
                Ok(ReceiveOutcome::Handled)
            }
            Err(error) => {
                let mut inner = self.inner.lock().unwrap();
                if let Some(row) = inner.rows.iter_mut().find(|row| row.id == claimed.id) {
                    row.claimed = false;
                }
                trace!(
                    message_id = claimed.id,
                    %error,
                    "subscriber failed, message released"
                );
                Ok(ReceiveOutcome::Abandoned)
            }
        }
    }
}
