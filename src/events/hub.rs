//! Per-agent pub/sub bus with bounded fan-out, ring-buffer replay, and
//! slow-consumer eviction.
//!
//! Each agent gets an independent sequence counter, a ring of recent events
//! for reconnect replay, and a set of bounded subscriber queues. Publishing
//! never blocks on a consumer: a full queue drops the new event for that
//! subscriber only, and a subscriber that keeps dropping is evicted by
//! closing its channel. Sequencing, ring insertion, and fan-out all happen
//! under one lock per publish, so every observer of an agent sees the same
//! total order.

use super::{Event, EventKind};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Fan-out tuning knobs; see [`crate::config::SyncConfig`] for the
/// user-facing versions.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Bounded queue length for each subscriber.
    pub queue_capacity: usize,
    /// Events retained per agent for reconnect replay.
    pub ring_size: usize,
    /// Consecutive drops before a subscriber is evicted.
    pub eviction_threshold: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            ring_size: 100,
            eviction_threshold: 10,
        }
    }
}

/// One subscriber's receiving half.
///
/// Owned by the task that subscribed (typically an SSE handler). The hub
/// keeps only the sending half; when the hub evicts the subscriber it drops
/// that sender, so `recv` drains whatever was queued and then yields `None`.
pub struct Subscription {
    id: u64,
    agent_id: String,
    rx: mpsc::Receiver<Event>,
    evicted: Arc<AtomicBool>,
}

impl Subscription {
    /// Receive the next event; `None` once unsubscribed or evicted and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for draining in tests.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// True once the hub has kicked this subscriber for falling behind.
    pub fn was_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<Event>,
    consecutive_drops: u32,
    evicted: Arc<AtomicBool>,
}

/// Per-agent bus state. Kept alive even when the last subscriber leaves so
/// that the sequence counter stays monotonic and the replay ring survives
/// reconnect gaps; memory per agent is bounded by the ring size.
#[derive(Default)]
struct AgentBus {
    next_seq: u64,
    ring: VecDeque<Event>,
    subscribers: Vec<SubscriberSlot>,
}

/// Process-wide event hub, partitioned by agent ID.
pub struct EventHub {
    cfg: HubConfig,
    buses: Mutex<HashMap<String, AgentBus>>,
    total_subscribers: AtomicUsize,
    next_subscriber_id: AtomicU64,
}

impl EventHub {
    pub fn new(cfg: HubConfig) -> Self {
        Self {
            cfg,
            buses: Mutex::new(HashMap::new()),
            total_subscribers: AtomicUsize::new(0),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Register a new subscriber with the default queue capacity.
    ///
    /// Each call yields an independent queue; no replay happens here. Replay
    /// is a separate [`EventHub::replay_since`] call so the caller can
    /// subscribe first and replay second without losing events published in
    /// between.
    pub fn subscribe(&self, agent_id: &str) -> Subscription {
        self.subscribe_with_capacity(agent_id, self.cfg.queue_capacity)
    }

    /// Register a new subscriber with an explicit queue capacity, for
    /// embedded observers that want more headroom than the default.
    pub fn subscribe_with_capacity(&self, agent_id: &str, capacity: usize) -> Subscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let evicted = Arc::new(AtomicBool::new(false));

        let mut buses = self.buses.lock();
        let bus = buses.entry(agent_id.to_string()).or_default();
        bus.subscribers.push(SubscriberSlot {
            id,
            tx,
            consecutive_drops: 0,
            evicted: Arc::clone(&evicted),
        });
        drop(buses);

        self.total_subscribers.fetch_add(1, Ordering::SeqCst);
        debug!(agent_id, subscriber = id, "subscribed");

        Subscription {
            id,
            agent_id: agent_id.to_string(),
            rx,
            evicted,
        }
    }

    /// Remove a subscriber. Safe to call repeatedly; eviction may already
    /// have removed the slot.
    pub fn unsubscribe(&self, sub: &Subscription) {
        let mut buses = self.buses.lock();
        if let Some(bus) = buses.get_mut(&sub.agent_id) {
            let before = bus.subscribers.len();
            bus.subscribers.retain(|slot| slot.id != sub.id);
            if bus.subscribers.len() < before {
                self.total_subscribers.fetch_sub(1, Ordering::SeqCst);
                debug!(agent_id = %sub.agent_id, subscriber = sub.id, "unsubscribed");
            }
        }
    }

    /// Publish one event on an agent's bus.
    ///
    /// Assigns the next sequence number, stamps the authoritative
    /// `agent_id`, appends to the replay ring, and fans out to every current
    /// subscriber with a non-blocking enqueue. Returns the published event.
    pub fn publish(&self, agent_id: &str, request_id: Option<&str>, kind: EventKind) -> Event {
        let mut buses = self.buses.lock();
        let bus = buses.entry(agent_id.to_string()).or_default();

        let seq = bus.next_seq;
        bus.next_seq += 1;

        let event = Event {
            kind,
            agent_id: agent_id.to_string(),
            request_id: request_id.map(str::to_string),
            seq: Some(seq),
        };

        bus.ring.push_back(event.clone());
        while bus.ring.len() > self.cfg.ring_size {
            bus.ring.pop_front();
        }

        let threshold = self.cfg.eviction_threshold;
        let mut removed = 0usize;
        bus.subscribers.retain_mut(|slot| {
            match slot.tx.try_send(event.clone()) {
                Ok(()) => {
                    slot.consecutive_drops = 0;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    slot.consecutive_drops += 1;
                    if slot.consecutive_drops >= threshold {
                        // Dropping the sender closes the queue; the owning
                        // handler drains what it has, sees the close, and
                        // tears the connection down.
                        slot.evicted.store(true, Ordering::Release);
                        warn!(
                            agent_id,
                            subscriber = slot.id,
                            drops = slot.consecutive_drops,
                            "evicting slow subscriber"
                        );
                        removed += 1;
                        false
                    } else {
                        true
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Receiver already gone (handler exited without
                    // unsubscribing); reap the slot.
                    removed += 1;
                    false
                }
            }
        });
        drop(buses);

        if removed > 0 {
            self.total_subscribers.fetch_sub(removed, Ordering::SeqCst);
        }

        event
    }

    /// All ring events with `seq > since_seq`, oldest first.
    ///
    /// If the ring has already rotated past `since_seq + 1`, whatever is
    /// left is returned; detecting the gap is the caller's job.
    pub fn replay_since(&self, agent_id: &str, since_seq: u64) -> Vec<Event> {
        let buses = self.buses.lock();
        buses
            .get(agent_id)
            .map(|bus| {
                bus.ring
                    .iter()
                    .filter(|event| event.seq.is_some_and(|s| s > since_seq))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Aggregate live subscriber count across all agents; the idle-shutdown
    /// watchdog treats a non-zero count as activity.
    pub fn total_subscribers(&self) -> usize {
        self.total_subscribers.load(Ordering::SeqCst)
    }

    /// Subscriber count for one agent.
    pub fn agent_subscribers(&self, agent_id: &str) -> usize {
        let buses = self.buses.lock();
        buses.get(agent_id).map_or(0, |bus| bus.subscribers.len())
    }
}
