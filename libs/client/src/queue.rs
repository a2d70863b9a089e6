use std::collections::VecDeque;

use roomcast_common::Envelope;

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100;

/// Envelopes waiting for an open socket. Full queues drop their oldest entry.
#[derive(Debug)]
pub(crate) struct OutboundQueue {
    items: VecDeque<Envelope>,
    max: usize,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_QUEUE_SIZE)
    }
}

impl OutboundQueue {
    pub(crate) fn with_capacity(max: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn max(&self) -> usize {
        self.max
    }

    /// Append, evicting from the front until the new entry fits.
    pub(crate) fn push(&mut self, envelope: Envelope) {
        if self.max == 0 {
            tracing::debug!(event = %envelope.event, "queue disabled, dropping message");
            return;
        }
        while self.items.len() >= self.max {
            if let Some(evicted) = self.items.pop_front() {
                tracing::debug!(event = %evicted.event, "queue full, evicting oldest message");
            }
        }
        self.items.push_back(envelope);
    }

    /// Put envelopes that were accepted but never written back at the head, in order.
    pub(crate) fn requeue(&mut self, envelopes: Vec<Envelope>) {
        for envelope in envelopes.into_iter().rev() {
            self.items.push_front(envelope);
        }
        self.trim();
    }

    pub(crate) fn set_max(&mut self, max: usize) {
        self.max = max;
        self.trim();
    }

    pub(crate) fn drain(&mut self) -> Vec<Envelope> {
        self.items.drain(..).collect()
    }

    fn trim(&mut self) {
        while self.items.len() > self.max {
            self.items.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn events(queue: &mut OutboundQueue) -> Vec<String> {
        queue.drain().into_iter().map(|e| e.event).collect()
    }

    #[test]
    fn overflow_evicts_oldest() {
        let mut queue = OutboundQueue::with_capacity(2);
        for event in ["one", "two", "three"] {
            queue.push(Envelope::new(event, json!(null)));
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(events(&mut queue), ["two", "three"]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn requeue_goes_to_the_front_in_order() {
        let mut queue = OutboundQueue::default();
        queue.push(Envelope::new("later", json!(null)));
        queue.requeue(vec![
            Envelope::new("first", json!(null)),
            Envelope::new("second", json!(null)),
        ]);
        assert_eq!(events(&mut queue), ["first", "second", "later"]);
    }

    #[test]
    fn shrinking_drops_oldest() {
        let mut queue = OutboundQueue::default();
        for event in ["a", "b", "c", "d"] {
            queue.push(Envelope::new(event, json!(null)));
        }
        queue.set_max(1);
        assert_eq!(queue.max(), 1);
        assert_eq!(events(&mut queue), ["d"]);
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let mut queue = OutboundQueue::with_capacity(0);
        queue.push(Envelope::new("x", json!(null)));
        assert_eq!(queue.len(), 0);
    }
}
