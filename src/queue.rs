use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;

use crate::models::{GuildId, QueueItem};

/// A soft cap on per-guild queue depth. The contract has no explicit bound;
/// this only guards against an unbounded backlog from a guild nobody is
/// listening to draining memory.
const SOFT_CAP: usize = 500;

/// Per-guild FIFO queues, one `Mutex<VecDeque<_>>` per guild behind a
/// `DashMap` for per-key exclusivity — the same sharded-lock shape the
/// presence tracker uses for its per-channel typing sets.
#[derive(Default)]
pub struct QueueCore {
    queues: DashMap<GuildId, std::sync::Mutex<VecDeque<QueueItem>>>,
}

impl QueueCore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enqueue(&self, guild_id: GuildId, item: QueueItem) {
        let mut queue = self
            .queues
            .entry(guild_id)
            .or_insert_with(|| std::sync::Mutex::new(VecDeque::new()))
            .lock()
            .unwrap();

        if queue.len() >= SOFT_CAP {
            tracing::warn!(guild_id, "queue soft cap reached, dropping oldest item");
            queue.pop_front();
        }
        queue.push_back(item);
    }

    /// Non-blocking pop. Never `.await`s while the lock is held.
    pub fn try_dequeue(&self, guild_id: GuildId) -> Option<QueueItem> {
        self.queues.get(&guild_id)?.lock().unwrap().pop_front()
    }

    pub fn clear(&self, guild_id: GuildId) {
        if let Some(queue) = self.queues.get(&guild_id) {
            queue.lock().unwrap().clear();
        }
    }

    pub fn length(&self, guild_id: GuildId) -> usize {
        self.queues
            .get(&guild_id)
            .map(|q| q.lock().unwrap().len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_per_guild() {
        let queue = QueueCore::new();
        queue.enqueue(1, QueueItem::new("hello", 1));
        queue.enqueue(1, QueueItem::new("world", 1));

        assert_eq!(queue.try_dequeue(1).unwrap().text, "hello");
        assert_eq!(queue.try_dequeue(1).unwrap().text, "world");
        assert!(queue.try_dequeue(1).is_none());
    }

    #[test]
    fn no_cross_guild_ordering_interference() {
        let queue = QueueCore::new();
        queue.enqueue(1, QueueItem::new("a", 1));
        queue.enqueue(2, QueueItem::new("b", 1));

        assert_eq!(queue.try_dequeue(2).unwrap().text, "b");
        assert_eq!(queue.try_dequeue(1).unwrap().text, "a");
    }

    #[test]
    fn clear_empties_only_that_guild() {
        let queue = QueueCore::new();
        queue.enqueue(1, QueueItem::new("a", 1));
        queue.enqueue(2, QueueItem::new("b", 1));

        queue.clear(1);
        assert_eq!(queue.length(1), 0);
        assert_eq!(queue.length(2), 1);
    }

    #[test]
    fn soft_cap_drops_oldest() {
        let queue = QueueCore::new();
        for i in 0..(SOFT_CAP + 10) {
            queue.enqueue(1, QueueItem::new(i.to_string(), 1));
        }
        assert_eq!(queue.length(1), SOFT_CAP);
        assert_eq!(queue.try_dequeue(1).unwrap().text, "10");
    }
}
