//! Message processors: long-running pump loops that drain a queue into a
//! dispatcher.
//!
//! One processor per queue (commands, events). Each runs on its own thread
//! and polls when the queue is empty. Dispatch failures are logged and the
//! message is consumed anyway; redelivering a message whose handler fails
//! deterministically would wedge the queue behind a poison message.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, warn};

use confreg_messaging::{MessageDispatch, MessageQueue, QueueError, ReceiveOutcome};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// How long to sleep when the queue is empty.
    pub poll_interval: Duration,
    /// Name used for the worker thread and log lines.
    pub name: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "message-processor".to_string(),
        }
    }
}

/// Pairs a queue with a dispatcher.
#[derive(Debug)]
pub struct MessageProcessor<Q, D> {
    queue: Q,
    dispatch: D,
}

impl<Q, D> MessageProcessor<Q, D>
where
    Q: MessageQueue,
    D: MessageDispatch,
{
    pub fn new(queue: Q, dispatch: D) -> Self {
        Self { queue, dispatch }
    }

    /// Receive and dispatch at most one message.
    ///
    /// The subscriber consumes the message even when dispatch fails: domain
    /// rejections and unknown types are deterministic, so retrying them can
    /// never succeed. The failure is logged with the message id instead.
    pub fn run_once(&self) -> Result<ReceiveOutcome, QueueError> {
        self.queue.receive(&|message| {
            if let Err(err) = self.dispatch.dispatch_message(message) {
                warn!(
                    message_id = message.id,
                    correlation_id = message.correlation_id.as_deref(),
                    error = %err,
                    "message dispatch failed, dropping message"
                );
            }
            Ok(())
        })
    }
}

impl<Q, D> MessageProcessor<Q, D>
where
    Q: MessageQueue + Send + 'static,
    D: MessageDispatch + Send + 'static,
{
    /// Spawn the pump loop on a dedicated thread.
    pub fn spawn(self, config: ProcessorConfig) -> ProcessorHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let name = config.name.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                info!(processor = %name, "message processor started");
                loop {
                    if shutdown_rx.try_recv().is_ok() {
                        info!(processor = %name, "message processor stopping");
                        break;
                    }
                    match self.run_once() {
                        Ok(ReceiveOutcome::Handled) | Ok(ReceiveOutcome::Abandoned) => {}
                        Ok(ReceiveOutcome::Empty) => thread::sleep(config.poll_interval),
                        Err(err) => {
                            error!(processor = %name, error = %err, "queue receive failed");
                            thread::sleep(config.poll_interval);
                        }
                    }
                }
            })
            .expect("failed to spawn message processor thread");

        ProcessorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

/// Handle to a running processor. Dropping it without calling `shutdown`
/// leaves the thread running for the life of the process.
#[derive(Debug)]
pub struct ProcessorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl ProcessorHandle {
    /// Signal the loop to stop and wait for the thread to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
