//! Tag-keyed listener registry.
//!
//! Inbound frames are routed by their `type` field to every listener
//! registered for that tag, in registration order.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tracing::{debug, warn};

const LOGGED_FRAME_SNIPPET_LEN: usize = 200;

/// Callback invoked with the decoded frame.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync + 'static>;

/// Result of routing one inbound frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchOutcome {
    /// Frame was handed to this many listeners.
    Delivered(usize),
    /// Frame was valid but nobody listens for its tag.
    NoListeners,
    /// Frame had no non-empty string `type`.
    MissingType,
    /// Frame was not valid JSON.
    Malformed,
}

/// Shared mapping from message tag to ordered listeners.
///
/// Clones share the same underlying table.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Arc<RwLock<HashMap<String, Vec<Listener>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for every future frame tagged `kind`.
    pub fn on<F>(&self, kind: impl Into<String>, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut guard = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .entry(kind.into())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Number of listeners currently registered for `kind`.
    pub fn listener_count(&self, kind: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .map_or(0, Vec::len)
    }

    /// Decodes a text frame and dispatches it.
    pub fn dispatch_text(&self, text: &str) -> DispatchOutcome {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => self.dispatch(&value),
            Err(err) => {
                warn!(
                    event = "ws_message_malformed",
                    error = %err,
                    frame = %snippet(text)
                );
                DispatchOutcome::Malformed
            }
        }
    }

    /// Routes an already decoded frame to the listeners of its tag.
    pub fn dispatch(&self, message: &Value) -> DispatchOutcome {
        let Some(kind) = message
            .get("type")
            .and_then(Value::as_str)
            .filter(|kind| !kind.is_empty())
        else {
            warn!(
                event = "ws_message_missing_type",
                frame = %snippet(&message.to_string())
            );
            return DispatchOutcome::MissingType;
        };

        // Snapshot so listeners may register more listeners without deadlocking.
        let listeners: Vec<Listener> = {
            let guard = self
                .listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match guard.get(kind) {
                Some(listeners) if !listeners.is_empty() => listeners.clone(),
                _ => {
                    debug!(event = "ws_message_unhandled", kind);
                    return DispatchOutcome::NoListeners;
                }
            }
        };

        for listener in &listeners {
            listener(message);
        }
        DispatchOutcome::Delivered(listeners.len())
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut map = f.debug_map();
        for (kind, listeners) in guard.iter() {
            map.entry(kind, &listeners.len());
        }
        map.finish()
    }
}

fn snippet(text: &str) -> String {
    text.chars().take(LOGGED_FRAME_SNIPPET_LEN).collect()
}
