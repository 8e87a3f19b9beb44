//! Per-channel delivery ordering.
//!
//! [`DeliveryGate`] enforces strictly increasing cursors per channel, which
//! both orders delivery and suppresses duplicates. [`LiveBuffer`] holds live
//! traffic back while a gap is open so it can be merged with recovered
//! history before anything reaches the application.

use std::collections::{BTreeMap, HashMap};

use crate::types::{Cursor, MessageEvent};

#[derive(Debug, Default)]
pub(crate) struct DeliveryGate {
    last_delivered: HashMap<String, Cursor>,
}

impl DeliveryGate {
    /// Record `cursor` for `channel` if it is newer than anything delivered so
    /// far. Returns `false` for duplicates and stale messages.
    pub fn admit(&mut self, channel: &str, cursor: Cursor) -> bool {
        match self.last_delivered.get_mut(channel) {
            Some(last) if cursor <= *last => false,
            Some(last) => {
                *last = cursor;
                true
            }
            None => {
                self.last_delivered.insert(channel.to_string(), cursor);
                true
            }
        }
    }

    pub fn would_admit(&self, channel: &str, cursor: Cursor) -> bool {
        self.last_delivered
            .get(channel)
            .is_none_or(|last| cursor > *last)
    }

    pub fn forget(&mut self, channel: &str) {
        self.last_delivered.remove(channel);
    }
}

/// Bounded per-channel holding area for live messages.
#[derive(Debug)]
pub(crate) struct LiveBuffer {
    by_channel: BTreeMap<String, Vec<MessageEvent>>,
    len: usize,
    capacity: usize,
}

impl LiveBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            by_channel: BTreeMap::new(),
            len: 0,
            capacity,
        }
    }

    /// Returns `false` without storing the message once the buffer is full.
    pub fn push(&mut self, event: MessageEvent) -> bool {
        if self.len >= self.capacity {
            return false;
        }
        self.len += 1;
        self.by_channel
            .entry(event.channel.clone())
            .or_default()
            .push(event);
        true
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn drain(&mut self) -> BTreeMap<String, Vec<MessageEvent>> {
        self.len = 0;
        std::mem::take(&mut self.by_channel)
    }

    pub fn clear(&mut self) {
        self.by_channel.clear();
        self.len = 0;
    }

    pub fn forget(&mut self, channel: &str) {
        if let Some(dropped) = self.by_channel.remove(channel) {
            self.len = self.len.saturating_sub(dropped.len());
        }
    }
}

/// Merge recovered history with buffered live messages for one channel:
/// ascending by cursor, one message per cursor.
pub(crate) fn merge_ordered(
    history: Vec<MessageEvent>,
    live: Vec<MessageEvent>,
) -> Vec<MessageEvent> {
    let mut merged = history;
    merged.extend(live);
    // Stable sort keeps the history copy first when both sides carry a cursor.
    merged.sort_by_key(|event| event.cursor);
    merged.dedup_by_key(|event| event.cursor);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(channel: &str, cursor: u64) -> MessageEvent {
        MessageEvent::new(channel, Cursor(cursor), serde_json::json!(cursor), None)
    }

    #[test]
    fn gate_admits_increasing_cursors_only() {
        let mut gate = DeliveryGate::default();
        assert!(gate.admit("a", Cursor(10)));
        assert!(gate.admit("a", Cursor(11)));
        assert!(!gate.admit("a", Cursor(11)));
        assert!(!gate.admit("a", Cursor(5)));
        assert!(gate.admit("b", Cursor(1)));
    }

    #[test]
    fn gate_forget_resets_channel() {
        let mut gate = DeliveryGate::default();
        assert!(gate.admit("a", Cursor(10)));
        gate.forget("a");
        assert!(gate.would_admit("a", Cursor(1)));
    }

    #[test]
    fn buffer_respects_capacity() {
        let mut buffer = LiveBuffer::new(2);
        assert!(buffer.push(event("a", 1)));
        assert!(buffer.push(event("b", 2)));
        assert!(!buffer.push(event("a", 3)));
        assert_eq!(buffer.len(), 2);

        buffer.forget("a");
        assert_eq!(buffer.len(), 1);

        let drained = buffer.drain();
        assert_eq!(drained.get("b").map(Vec::len), Some(1));
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn merge_orders_and_dedups_by_cursor() {
        let history = vec![event("a", 20), event("a", 10), event("a", 30)];
        let live = vec![event("a", 25), event("a", 30), event("a", 40)];
        let cursors: Vec<u64> = merge_ordered(history, live)
            .into_iter()
            .map(|e| e.cursor.0)
            .collect();
        assert_eq!(cursors, vec![10, 20, 25, 30, 40]);
    }
}
