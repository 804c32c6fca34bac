//! Probe Request Queue - Bounded, priority-ordered, one entry per node
//!
//! Entries are ordered by `(priority, sequence)`: lower priority numbers are
//! more urgent and equal priorities leave in arrival order. An auxiliary
//! index keeps node lookups O(1) and guarantees a node is queued at most once.

use chrono::{DateTime, Utc};
use meshgate_core::{
    types::is_valid_priority, NodeId, OverflowStrategy, PRIORITY_DEFAULT,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// A queued request to trace one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracerouteRequest {
    /// Node to trace
    pub node_id: NodeId,
    /// Priority tier, 1 (most urgent) to 10
    pub priority: u8,
    /// Why the trace was requested
    pub reason: String,
    /// When the request first entered the queue
    pub enqueued_at: DateTime<Utc>,
    /// Retries already spent on this trace
    pub retry_count: u32,
}

impl TracerouteRequest {
    /// A fresh request with no retries spent.
    pub fn new(
        node_id: impl Into<NodeId>,
        priority: u8,
        reason: impl Into<String>,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            priority,
            reason: reason.into(),
            enqueued_at,
            retry_count: 0,
        }
    }
}

/// Result of offering a request to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Added as a new entry
    Inserted,
    /// Folded into the node's existing entry
    Merged {
        /// The existing entry's priority was raised
        upgraded: bool,
    },
    /// Added after evicting another node's entry
    Evicted {
        /// Node whose entry was dropped
        evicted: NodeId,
    },
    /// Dropped because the queue is full
    Rejected,
}

impl EnqueueOutcome {
    /// Whether the node has a live entry after the call.
    pub fn is_queued(&self) -> bool {
        !matches!(self, EnqueueOutcome::Rejected)
    }
}

/// Running queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// New entries inserted
    pub inserted: u64,
    /// Duplicate requests folded into an existing entry
    pub merged: u64,
    /// Entries evicted by the overflow strategy
    pub evicted: u64,
    /// Requests rejected by the overflow strategy
    pub rejected: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct QueueKey {
    priority: u8,
    sequence: u64,
}

/// Bounded priority queue of [`TracerouteRequest`]s.
///
/// Not synchronized; the engine owns it behind a mutex.
#[derive(Debug)]
pub struct PriorityQueue {
    entries: BTreeMap<QueueKey, TracerouteRequest>,
    index: HashMap<NodeId, QueueKey>,
    arrival: BTreeMap<u64, QueueKey>,
    next_sequence: u64,
    max_size: usize,
    strategy: OverflowStrategy,
    stats: QueueStats,
}

impl PriorityQueue {
    /// Create an empty queue holding at most `max_size` entries.
    pub fn new(max_size: usize, strategy: OverflowStrategy) -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            arrival: BTreeMap::new(),
            next_sequence: 0,
            max_size: max_size.max(1),
            strategy,
            stats: QueueStats::default(),
        }
    }

    /// Offer a trace request for `node_id`.
    ///
    /// Out-of-range priorities are replaced by the default tier. Never fails:
    /// a full queue resolves through the configured overflow strategy.
    pub fn enqueue(
        &mut self,
        node_id: &str,
        priority: u8,
        reason: &str,
        now: DateTime<Utc>,
    ) -> EnqueueOutcome {
        self.offer(TracerouteRequest::new(node_id, priority, reason, now))
    }

    /// Put a previously dequeued request back, keeping its retry counter.
    pub fn requeue(&mut self, request: TracerouteRequest) -> EnqueueOutcome {
        self.offer(request)
    }

    fn offer(&mut self, mut request: TracerouteRequest) -> EnqueueOutcome {
        if !is_valid_priority(request.priority) {
            warn!(
                node_id = %request.node_id,
                priority = request.priority,
                fallback = PRIORITY_DEFAULT,
                "Invalid traceroute priority, using default tier"
            );
            request.priority = PRIORITY_DEFAULT;
        }

        if let Some(&key) = self.index.get(&request.node_id) {
            return self.merge(key, request);
        }

        let mut outcome = EnqueueOutcome::Inserted;
        if self.entries.len() >= self.max_size {
            let candidate = QueueKey {
                priority: request.priority,
                sequence: self.next_sequence,
            };
            let victim = match self.strategy {
                OverflowStrategy::DropNew => None,
                OverflowStrategy::DropOldest => self.arrival.values().next().copied(),
                OverflowStrategy::DropLowestPriority => self
                    .entries
                    .keys()
                    .next_back()
                    .copied()
                    .filter(|worst| candidate < *worst),
            };

            let Some(victim) = victim else {
                self.stats.rejected += 1;
                warn!(
                    node_id = %request.node_id,
                    priority = request.priority,
                    strategy = ?self.strategy,
                    "Traceroute queue full, request dropped"
                );
                return EnqueueOutcome::Rejected;
            };

            if let Some(evicted) = self.remove_key(victim) {
                self.stats.evicted += 1;
                warn!(
                    evicted = %evicted.node_id,
                    evicted_priority = evicted.priority,
                    node_id = %request.node_id,
                    "Traceroute queue full, evicted entry"
                );
                outcome = EnqueueOutcome::Evicted {
                    evicted: evicted.node_id,
                };
            }
        }

        let key = QueueKey {
            priority: request.priority,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        debug!(
            node_id = %request.node_id,
            priority = request.priority,
            reason = %request.reason,
            "Traceroute request queued"
        );
        self.index.insert(request.node_id.clone(), key);
        self.arrival.insert(key.sequence, key);
        self.entries.insert(key, request);
        self.stats.inserted += 1;
        outcome
    }

    fn merge(&mut self, key: QueueKey, request: TracerouteRequest) -> EnqueueOutcome {
        self.stats.merged += 1;
        let Some(mut existing) = self.entries.remove(&key) else {
            return EnqueueOutcome::Merged { upgraded: false };
        };

        existing.reason = request.reason;
        existing.retry_count = existing.retry_count.max(request.retry_count);

        let upgraded = request.priority < existing.priority;
        let new_key = if upgraded {
            existing.priority = request.priority;
            let new_key = QueueKey {
                priority: request.priority,
                sequence: key.sequence,
            };
            self.index.insert(existing.node_id.clone(), new_key);
            self.arrival.insert(key.sequence, new_key);
            new_key
        } else {
            key
        };

        debug!(node_id = %existing.node_id, upgraded, "Duplicate traceroute request merged");
        self.entries.insert(new_key, existing);
        EnqueueOutcome::Merged { upgraded }
    }

    /// Pop the most urgent, earliest-queued request.
    pub fn dequeue(&mut self) -> Option<TracerouteRequest> {
        let (key, request) = self.entries.pop_first()?;
        self.index.remove(&request.node_id);
        self.arrival.remove(&key.sequence);
        Some(request)
    }

    /// Drop the live entry for a node, if any.
    pub fn remove(&mut self, node_id: &str) -> Option<TracerouteRequest> {
        let key = *self.index.get(node_id)?;
        self.remove_key(key)
    }

    fn remove_key(&mut self, key: QueueKey) -> Option<TracerouteRequest> {
        let request = self.entries.remove(&key)?;
        self.index.remove(&request.node_id);
        self.arrival.remove(&key.sequence);
        Some(request)
    }

    /// Whether a node has a live entry.
    pub fn contains(&self, node_id: &str) -> bool {
        self.index.contains_key(node_id)
    }

    /// Priority of a node's live entry.
    pub fn priority_of(&self, node_id: &str) -> Option<u8> {
        self.index.get(node_id).map(|key| key.priority)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.arrival.clear();
    }

    /// Live entries in dequeue order.
    pub fn snapshot(&self) -> Vec<TracerouteRequest> {
        self.entries.values().cloned().collect()
    }

    /// Running counters.
    pub fn stats(&self) -> QueueStats {
        self.stats
    }
}
