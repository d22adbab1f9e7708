use std::collections::HashMap;

use anyhow::Context;
use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

use crate::envelope::{CommandEnvelope, EventEnvelope};
use crate::queue::QueuedMessage;

/// Something that can consume a raw queued message. Implemented by the
/// handler registries and driven by a message processor.
pub trait MessageDispatch: Send + Sync {
    fn dispatch_message(&self, message: &QueuedMessage) -> anyhow::Result<()>;
}

impl<D> MessageDispatch for std::sync::Arc<D>
where
    D: MessageDispatch + ?Sized,
{
    fn dispatch_message(&self, message: &QueuedMessage) -> anyhow::Result<()> {
        (**self).dispatch_message(message)
    }
}

/// Returned when two handlers claim the same command type at wiring time.
#[derive(Debug, Error)]
#[error("a handler for command type {command_type:?} is already registered")]
pub struct DuplicateHandler {
    pub command_type: String,
}

type CommandHandler = Box<dyn Fn(&CommandEnvelope) -> anyhow::Result<()> + Send + Sync>;
type EventHandler = Box<dyn Fn(&EventEnvelope<JsonValue>) -> anyhow::Result<()> + Send + Sync>;

/// Routes each command to **exactly one** handler by its type tag.
///
/// Registration happens once at startup; a second handler for the same tag is
/// a wiring bug and is rejected.
#[derive(Default)]
pub struct CommandHandlerRegistry {
    handlers: HashMap<String, CommandHandler>,
}

impl CommandHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(
        &mut self,
        command_type: impl Into<String>,
        handler: F,
    ) -> Result<(), DuplicateHandler>
    where
        F: Fn(&CommandEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let command_type = command_type.into();
        if self.handlers.contains_key(&command_type) {
            return Err(DuplicateHandler { command_type });
        }
        self.handlers.insert(command_type, Box::new(handler));
        Ok(())
    }

    pub fn dispatch(&self, envelope: &CommandEnvelope) -> anyhow::Result<()> {
        if envelope.is_expired(Utc::now()) {
            info!(
                command_id = %envelope.id,
                command_type = %envelope.command_type,
                "dropping expired command"
            );
            return Ok(());
        }

        let handler = self
            .handlers
            .get(&envelope.command_type)
            .with_context(|| format!("no handler for command type {:?}", envelope.command_type))?;

        debug!(
            command_id = %envelope.id,
            command_type = %envelope.command_type,
            "dispatching command"
        );
        handler(envelope)
    }
}

impl MessageDispatch for CommandHandlerRegistry {
    fn dispatch_message(&self, message: &QueuedMessage) -> anyhow::Result<()> {
        let envelope: CommandEnvelope =
            serde_json::from_str(&message.body).context("malformed command envelope")?;
        self.dispatch(&envelope)
    }
}

/// Routes each event to **zero or more** handlers by its type tag, plus any
/// catch-all handlers that see every event.
#[derive(Default)]
pub struct EventHandlerRegistry {
    handlers: HashMap<String, Vec<EventHandler>>,
    catch_all: Vec<EventHandler>,
}

impl EventHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(&EventEnvelope<JsonValue>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .entry(event_type.into())
            .or_default()
            .push(Box::new(handler));
    }

    /// Register a handler that receives every event regardless of type.
    pub fn register_catch_all<F>(&mut self, handler: F)
    where
        F: Fn(&EventEnvelope<JsonValue>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.catch_all.push(Box::new(handler));
    }

    pub fn dispatch(&self, envelope: &EventEnvelope<JsonValue>) -> anyhow::Result<()> {
        debug!(
            event_id = %envelope.event_id(),
            event_type = %envelope.event_type(),
            "dispatching event"
        );

        if let Some(handlers) = self.handlers.get(envelope.event_type()) {
            for handler in handlers {
                handler(envelope)?;
            }
        }
        for handler in &self.catch_all {
            handler(envelope)?;
        }
        Ok(())
    }
}

impl MessageDispatch for EventHandlerRegistry {
    fn dispatch_message(&self, message: &QueuedMessage) -> anyhow::Result<()> {
        let envelope: EventEnvelope<JsonValue> =
            serde_json::from_str(&message.body).context("malformed event envelope")?;
        self.dispatch(&envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use confreg_core::AggregateId;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn command_envelope(command_type: &str) -> CommandEnvelope {
        CommandEnvelope {
            id: Uuid::now_v7(),
            command_type: command_type.to_string(),
            payload: json!({}),
            deliver_after: None,
            expires_at: None,
            correlation_id: None,
        }
    }

    fn event_envelope(event_type: &str) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            AggregateId::new(),
            "tests.aggregate",
            event_type,
            1,
            None,
            json!({}),
        )
    }

    #[test]
    fn command_dispatches_to_the_registered_handler() {
        let hits = std::sync::Arc::new(AtomicUsize::new(0));
        let mut registry = CommandHandlerRegistry::new();
        let counter = hits.clone();
        registry
            .register("tests.do_thing", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        registry.dispatch(&command_envelope("tests.do_thing")).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_command_handler_is_rejected() {
        let mut registry = CommandHandlerRegistry::new();
        registry.register("tests.do_thing", |_| Ok(())).unwrap();
        let err = registry.register("tests.do_thing", |_| Ok(())).unwrap_err();
        assert_eq!(err.command_type, "tests.do_thing");
    }

    #[test]
    fn unknown_command_type_is_an_error() {
        let registry = CommandHandlerRegistry::new();
        let result = registry.dispatch(&command_envelope("tests.unknown"));
        assert!(result.is_err());
    }

    #[test]
    fn expired_command_is_dropped_without_reaching_the_handler() {
        let mut registry = CommandHandlerRegistry::new();
        registry
            .register("tests.do_thing", |_| panic!("must not run"))
            .unwrap();

        let mut envelope = command_envelope("tests.do_thing");
        envelope.expires_at = Some(Utc::now() - Duration::minutes(1));
        registry.dispatch(&envelope).unwrap();
    }

    #[test]
    fn event_fans_out_to_all_matching_handlers_and_catch_all() {
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let mut registry = EventHandlerRegistry::new();
        for label in ["first", "second"] {
            let seen = seen.clone();
            registry.register("tests.happened", move |_| {
                seen.lock().unwrap().push(label);
                Ok(())
            });
        }
        {
            let seen = seen.clone();
            registry.register_catch_all(move |_| {
                seen.lock().unwrap().push("catch_all");
                Ok(())
            });
        }

        registry.dispatch(&event_envelope("tests.happened")).unwrap();
        registry.dispatch(&event_envelope("tests.other")).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first", "second", "catch_all", "catch_all"]
        );
    }

    #[test]
    fn event_with_no_handlers_is_not_an_error() {
        let registry = EventHandlerRegistry::new();
        registry.dispatch(&event_envelope("tests.ignored")).unwrap();
    }

    #[test]
    fn dispatch_message_decodes_a_queued_command() {
        let hits = std::sync::Arc::new(AtomicUsize::new(0));
        let mut registry = CommandHandlerRegistry::new();
        let counter = hits.clone();
        registry
            .register("tests.do_thing", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let body = serde_json::to_string(&command_envelope("tests.do_thing")).unwrap();
        let message = QueuedMessage {
            id: 1,
            body,
            correlation_id: None,
        };
        registry.dispatch_message(&message).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
