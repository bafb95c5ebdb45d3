// Event Bus - synchronous pub/sub for governor events
//
// A single process-scoped instance is constructed at startup and handed by
// Arc to every component that publishes or observes. Handlers run inline on
// the publisher's task; a failing handler is logged and does not stop
// delivery to the remaining handlers unless the bus was built with
// fail-fast dispatch.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use crate::domain::events::{EventKind, GovernorEvent};

type Handler = Arc<dyn Fn(&GovernorEvent) -> anyhow::Result<()> + Send + Sync>;

pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<Handler>>>,
    fail_on_handler_error: bool,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_policy(false)
    }

    /// `fail_on_handler_error = true` makes `publish` return the first
    /// handler error instead of swallowing it. The error reaches direct
    /// `publish` callers; the orchestration pipeline's own telemetry
    /// publishers log it and continue.
    pub fn with_policy(fail_on_handler_error: bool) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            fail_on_handler_error,
        }
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&GovernorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write();
        handlers.entry(kind).or_default().push(Arc::new(handler));
        debug!(kind = ?kind, "handler subscribed");
    }

    /// Dispatch `event` to every handler registered for its kind.
    ///
    /// Handlers are cloned out before invocation so a handler may itself
    /// publish or subscribe without deadlocking the registry lock.
    pub fn publish(&self, event: GovernorEvent) -> anyhow::Result<()> {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let map = self.handlers.read();
            map.get(&kind).cloned().unwrap_or_default()
        };

        if handlers.is_empty() {
            debug!(kind = ?kind, "no handlers registered");
            return Ok(());
        }

        for handler in &handlers {
            if let Err(e) = handler(&event) {
                error!(kind = ?kind, error = %e, "event handler failed");
                if self.fail_on_handler_error {
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
