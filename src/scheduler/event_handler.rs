//! Event handler: subscription from an event name to a job-producing
//! action (spec.md §3 "Event Handler", §4.3 "Event triggering").

use crate::envelope::Priority;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happens when the event fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActionDescriptor {
    CreateJob {
        handler_name: String,
        payload: serde_json::Value,
    },
    TriggerWorkflow {
        workflow_type: String,
        payload: serde_json::Value,
    },
    DispatchAgent {
        agent_type: String,
        payload: serde_json::Value,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventHandlerCounters {
    pub invocations: u64,
    pub failures: u64,
}

/// In-process callback invoked directly instead of materializing a job,
/// for handlers registered via `onEvent(name, handler_function, ...)`.
#[async_trait]
pub trait InlineEventHandler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), String>;
}

#[derive(Clone, Serialize, Deserialize)]
pub struct EventHandler {
    pub event_name: String,
    pub handler_name: String,
    pub priority: Priority,
    pub enabled: bool,
    pub platform_scope: Option<String>,
    pub action: Option<ActionDescriptor>,
    pub counters: EventHandlerCounters,
    pub created_at: DateTime<Utc>,
    /// Present only for in-process handlers; never serialized — these
    /// live purely in memory for the process lifetime.
    #[serde(skip)]
    pub inline: Option<std::sync::Arc<dyn InlineEventHandler>>,
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandler")
            .field("event_name", &self.event_name)
            .field("handler_name", &self.handler_name)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("has_inline", &self.inline.is_some())
            .finish()
    }
}

impl EventHandler {
    pub fn new_action(
        event_name: impl Into<String>,
        handler_name: impl Into<String>,
        priority: Priority,
        action: ActionDescriptor,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            handler_name: handler_name.into(),
            priority,
            enabled: true,
            platform_scope: None,
            action: Some(action),
            counters: EventHandlerCounters::default(),
            created_at: Utc::now(),
            inline: None,
        }
    }

    pub fn new_inline(
        event_name: impl Into<String>,
        handler_name: impl Into<String>,
        priority: Priority,
        handler: std::sync::Arc<dyn InlineEventHandler>,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            handler_name: handler_name.into(),
            priority,
            enabled: true,
            platform_scope: None,
            action: None,
            counters: EventHandlerCounters::default(),
            created_at: Utc::now(),
            inline: Some(handler),
        }
    }
}

/// Sort enabled handlers by priority descending, stable on ties by
/// creation time (spec.md §4.3 "Event triggering").
pub fn dispatch_order(mut handlers: Vec<EventHandler>) -> Vec<EventHandler> {
    handlers.retain(|h| h.enabled);
    handlers.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
    });
    handlers
}
