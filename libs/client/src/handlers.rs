use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Returned by `on`/`once`; pass it to `off` to unsubscribe that one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Multi-subscriber table from event name to handlers, in registration order.
#[derive(Default)]
pub(crate) struct HandlerTable {
    next_id: u64,
    by_event: HashMap<String, Vec<(HandlerId, Handler)>>,
}

impl HandlerTable {
    pub(crate) fn reserve_id(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }

    pub(crate) fn insert(&mut self, event: &str, id: HandlerId, handler: Handler) {
        self.by_event
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
    }

    pub(crate) fn remove(&mut self, event: &str, id: HandlerId) -> bool {
        let Some(list) = self.by_event.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.by_event.remove(event);
        }
        removed
    }

    pub(crate) fn remove_event(&mut self, event: &str) -> bool {
        self.by_event.remove(event).is_some()
    }

    pub(crate) fn clear(&mut self) {
        self.by_event.clear();
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.by_event.keys().cloned().collect()
    }

    /// Copy of the handlers for `event`, so callers can invoke them unlocked.
    pub(crate) fn snapshot(&self, event: &str) -> Vec<Handler> {
        self.by_event
            .get(event)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }
}
