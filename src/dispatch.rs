use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ProcessingError, RejectionReason};
use crate::types::{EventType, HandlerOutcome};

/// Capability for handling one event type.
///
/// Handlers receive the validated payload's `data` object and report a
/// structured outcome. A handler decides for itself whether a failure is
/// transient (worth retrying) or permanent (straight to dead-letter).
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, data: &serde_json::Value) -> Result<HandlerOutcome, ProcessingError>;
}

/// Event-type-to-handler mapping, resolved once at startup.
///
/// Dispatch is a pure lookup; there is no runtime string branching
/// anywhere past this table. The registry is immutable once the pipeline
/// owns it, which is what makes dispatch lock-free.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event type, builder-style.
    pub fn with_handler(
        mut self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        self.handlers.insert(event_type, handler);
        self
    }

    pub fn register(&mut self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(event_type, handler);
    }

    pub fn resolve(&self, event_type: &EventType) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event_type).cloned()
    }

    pub fn is_registered(&self, event_type: &EventType) -> bool {
        self.handlers.contains_key(event_type)
    }
}

/// Maps a validated, deduplicated event to its typed handler.
pub struct EventDispatcher {
    registry: HandlerRegistry,
}

impl EventDispatcher {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    /// Check that a handler exists before any claim or retry machinery
    /// engages. Unknown types are a validation error, not a dispatch
    /// failure.
    pub fn ensure_registered(&self, event_type: &EventType) -> Result<(), RejectionReason> {
        if self.registry.is_registered(event_type) {
            Ok(())
        } else {
            Err(RejectionReason::UnsupportedEventType {
                event_type: event_type.as_str().to_string(),
            })
        }
    }

    /// Invoke the handler for `event_type` with the payload data.
    pub async fn dispatch(
        &self,
        event_type: &EventType,
        data: &serde_json::Value,
    ) -> Result<HandlerOutcome, ProcessingError> {
        let Some(handler) = self.registry.resolve(event_type) else {
            // ensure_registered runs first in the pipeline; reaching this
            // without a handler is a permanent condition, not a retryable
            // one.
            return Err(ProcessingError::Permanent(format!(
                "no handler for event type: {}",
                event_type
            )));
        };
        handler.handle(data).await
    }
}
