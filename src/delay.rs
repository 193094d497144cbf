use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustc_hash::FxHashMap;

pub const DELAY_CAPACITY: usize = 128;
pub const DEFAULT_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayEntry {
    pub query_id: u16,
    pub scheduled_at: Instant,
    pub payload: Bytes,
    pub target: SocketAddr,
}

/// 延迟队列：暂存可疑响应，超时后仍未被替换则原样转发给客户端。
/// Responses held for a second opinion. FIFO ring; one live entry per query id.
pub struct DelayQueue {
    slots: Vec<Option<DelayEntry>>,
    head: usize,
    len: usize,
    // query_id -> slot
    index: FxHashMap<u16, usize>,
    threshold: Duration,
}

impl DelayQueue {
    pub fn new(capacity: usize, threshold: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            head: 0,
            len: 0,
            index: FxHashMap::default(),
            threshold,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Hold `payload` for `query_id`. A live entry with the same id is
    /// overwritten where it sits; otherwise the entry goes to the tail and,
    /// when the ring is full, the head is dropped unsent.
    ///
    /// Returns the entry evicted to make room, if any.
    pub fn schedule(
        &mut self,
        query_id: u16,
        payload: Bytes,
        target: SocketAddr,
        now: Instant,
    ) -> Option<DelayEntry> {
        let entry = DelayEntry {
            query_id,
            scheduled_at: now,
            payload,
            target,
        };

        if let Some(&slot) = self.index.get(&query_id) {
            self.slots[slot] = Some(entry);
            return None;
        }

        let evicted = if self.len == self.slots.len() {
            self.pop_head()
        } else {
            None
        };
        let tail = (self.head + self.len) % self.slots.len();
        self.slots[tail] = Some(entry);
        self.index.insert(query_id, tail);
        self.len += 1;
        evicted
    }

    /// Remove and return every entry from the head whose age exceeds the
    /// threshold, stopping at the first that has not. The queue is ordered by
    /// first insertion, so an entry refreshed in place can hold back younger
    /// ones behind it until it expires.
    pub fn tick(&mut self, now: Instant) -> Vec<DelayEntry> {
        let mut due = Vec::new();
        while let Some(head) = self.slots[self.head].as_ref() {
            if now.saturating_duration_since(head.scheduled_at) <= self.threshold {
                break;
            }
            if let Some(entry) = self.pop_head() {
                due.push(entry);
            }
        }
        due
    }

    fn pop_head(&mut self) -> Option<DelayEntry> {
        let entry = self.slots[self.head].take()?;
        self.index.remove(&entry.query_id);
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        Some(entry)
    }
}
