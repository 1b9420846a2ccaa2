//! Bounded FIFO of outbound messages waiting for the writer.
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

use bytes::Bytes;

use crate::{frame::OpCode, Result, WebSocketError};

/// A fixed-capacity queue of `(opcode, payload)` pairs with an in-flight flag.
///
/// The flag records whether a drain job currently owns the queue. [`MessageQueue::push`]
/// raises it on the idle to in-flight transition and reports that the caller must schedule a
/// drain; [`MessageQueue::pop`] lowers it when it finds the queue empty. Both happen under
/// the same lock, so at most one drain job exists per queue at any time.
pub struct MessageQueue {
    capacity: usize,
    state: Mutex<State>,
}

struct State {
    data: VecDeque<(OpCode, Bytes)>,
    in_flight: bool,
}

impl MessageQueue {
    /// Creates an empty queue holding at most `capacity` messages (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(State {
                data: VecDeque::with_capacity(capacity),
                in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // the state is consistent after every statement, a panic can't leave it torn
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends a message.
    ///
    /// Returns `Ok(true)` when the queue just became in flight and a drain job has to be
    /// scheduled, `Ok(false)` when one is already running.
    ///
    /// # Errors
    /// [`WebSocketError::QueueFull`] if the queue already holds `capacity` messages.
    pub fn push(&self, opcode: OpCode, payload: Bytes) -> Result<bool> {
        let mut state = self.lock();
        if state.data.len() >= self.capacity {
            return Err(WebSocketError::QueueFull);
        }

        state.data.push_back((opcode, payload));
        let schedule = !state.in_flight;
        state.in_flight = true;
        Ok(schedule)
    }

    /// Removes the oldest message. When there's none left, the queue goes back to idle.
    pub fn pop(&self) -> Option<(OpCode, Bytes)> {
        let mut state = self.lock();
        let item = state.data.pop_front();
        if item.is_none() {
            state.in_flight = false;
        }
        item
    }

    /// Drops every pending message.
    pub fn clear(&self) {
        self.lock().data.clear();
    }

    /// Number of pending messages.
    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_is_enforced() {
        let queue = MessageQueue::new(16);
        for i in 0..16u8 {
            queue.push(OpCode::Text, Bytes::from(vec![i])).unwrap();
        }

        assert!(matches!(
            queue.push(OpCode::Text, Bytes::new()),
            Err(WebSocketError::QueueFull)
        ));
        assert_eq!(queue.len(), 16);
        assert_eq!(queue.capacity(), 16);
    }

    #[test]
    fn test_fifo_order() {
        let queue = MessageQueue::new(4);
        queue.push(OpCode::Text, Bytes::from_static(b"a")).unwrap();
        queue.push(OpCode::Binary, Bytes::from_static(b"b")).unwrap();

        assert_eq!(queue.pop(), Some((OpCode::Text, Bytes::from_static(b"a"))));
        assert_eq!(queue.pop(), Some((OpCode::Binary, Bytes::from_static(b"b"))));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_scheduled_once_per_transition() {
        let queue = MessageQueue::new(8);

        assert!(queue.push(OpCode::Text, Bytes::new()).unwrap());
        assert!(!queue.push(OpCode::Text, Bytes::new()).unwrap());

        // the drainer empties the queue and releases it
        while queue.pop().is_some() {}

        assert!(queue.push(OpCode::Text, Bytes::new()).unwrap());
    }

    #[test]
    fn test_clear_keeps_in_flight() {
        let queue = MessageQueue::new(8);
        assert!(queue.push(OpCode::Text, Bytes::new()).unwrap());
        queue.clear();

        // a drainer is still registered until it observes the empty queue
        assert!(!queue.push(OpCode::Text, Bytes::new()).unwrap());
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_none());
        assert!(queue.push(OpCode::Text, Bytes::new()).unwrap());
    }

    #[test]
    fn test_zero_capacity_is_normalized() {
        let queue = MessageQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.push(OpCode::Ping, Bytes::new()).unwrap();
        assert!(queue.push(OpCode::Ping, Bytes::new()).is_err());
    }
}
