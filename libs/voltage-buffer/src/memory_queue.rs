//! Bounded in-memory FIFO of pending messages
//!
//! The queue only tracks its byte size. It never evicts on its own: the
//! publisher decides between spilling to disk and dropping the oldest entry.

use std::collections::VecDeque;

use crate::message::OutboundMessage;

/// FIFO of pending messages with a running payload byte count.
///
/// Invariant: `size_bytes == sum(payload_len)` after every operation.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    messages: VecDeque<OutboundMessage>,
    size_bytes: u64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message at the tail.
    pub fn enqueue(&mut self, msg: OutboundMessage) {
        self.size_bytes += msg.payload_len();
        self.messages.push_back(msg);
    }

    /// Remove and return the oldest message.
    pub fn dequeue_oldest(&mut self) -> Option<OutboundMessage> {
        let msg = self.messages.pop_front()?;
        self.size_bytes -= msg.payload_len();
        Some(msg)
    }

    /// Put a message back at the head, ahead of everything else.
    ///
    /// Only valid for a message that was just taken with `dequeue_oldest`
    /// under the same lock, so the byte limit still holds.
    pub fn requeue_front(&mut self, msg: OutboundMessage) {
        self.size_bytes += msg.payload_len();
        self.messages.push_front(msg);
    }

    pub fn peek_oldest(&self) -> Option<&OutboundMessage> {
        self.messages.front()
    }

    /// Total payload bytes currently queued
    pub fn peek_size(&self) -> u64 {
        self.size_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Drop everything, returning the number of discarded messages.
    pub fn clear(&mut self) -> usize {
        let count = self.messages.len();
        self.messages.clear();
        self.size_bytes = 0;
        count
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutboundMessage> {
        self.messages.iter()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn msg(key: &str, size: usize) -> OutboundMessage {
        OutboundMessage::new(key, vec![b'x'; size])
    }

    #[test]
    fn test_enqueue_tracks_size() {
        let mut queue = MemoryQueue::new();
        queue.enqueue(msg("a", 10));
        queue.enqueue(msg("b", 25));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek_size(), 35);
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_dequeue_is_fifo() {
        let mut queue = MemoryQueue::new();
        queue.enqueue(msg("first", 1));
        queue.enqueue(msg("second", 2));
        queue.enqueue(msg("third", 3));

        assert_eq!(queue.dequeue_oldest().unwrap().routing_key(), "first");
        assert_eq!(queue.peek_size(), 5);
        assert_eq!(queue.dequeue_oldest().unwrap().routing_key(), "second");
        assert_eq!(queue.dequeue_oldest().unwrap().routing_key(), "third");
        assert!(queue.dequeue_oldest().is_none());
        assert_eq!(queue.peek_size(), 0);
    }

    #[test]
    fn test_requeue_front_restores_order() {
        let mut queue = MemoryQueue::new();
        queue.enqueue(msg("first", 4));
        queue.enqueue(msg("second", 4));

        let head = queue.dequeue_oldest().unwrap();
        queue.requeue_front(head);

        assert_eq!(queue.peek_oldest().unwrap().routing_key(), "first");
        assert_eq!(queue.peek_size(), 8);
    }

    #[test]
    fn test_clear_resets_size() {
        let mut queue = MemoryQueue::new();
        queue.enqueue(msg("a", 100));
        queue.enqueue(msg("b", 100));

        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.peek_size(), 0);
    }

    #[test]
    fn test_size_matches_sum_of_payloads() {
        let mut queue = MemoryQueue::new();
        for i in 0..50 {
            queue.enqueue(msg("k", i));
            if i % 3 == 0 {
                queue.dequeue_oldest();
            }
            let sum: u64 = queue.iter().map(OutboundMessage::payload_len).sum();
            assert_eq!(sum, queue.peek_size());
        }
    }
}
