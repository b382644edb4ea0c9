//! Per-request fan-out with independent backpressure
//!
//! Each request owns one [`Broadcaster`]. Subscribers get a bounded ring each
//! and one of three overflow policies; a slow subscriber can only ever hurt
//! itself. Late joiners receive a snapshot of the recent-history window and
//! then the live stream, gated under the broadcaster lock so the transition
//! has no gaps and no duplicates.

use crate::metrics::{Counter, MetricsSink};
use parking_lot::Mutex;
use promptmux_engine::{Message, RequestId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// What to do when a subscriber's ring is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Evict the oldest buffered message and accept the new one
    #[default]
    DropOldest,
    /// Reject the incoming message
    DropNewest,
    /// Suspend the broadcast until space appears, bounded by the broadcast
    /// timeout; on timeout the subscriber is disconnected
    Block,
}

struct QueueState {
    buf: VecDeque<Message>,
    /// No further messages will arrive; drain and end
    closed: bool,
    /// The subscriber was dropped or timed out; delivery stops immediately
    disconnected: bool,
}

/// Bounded per-subscriber ring with wait/notify on both ends.
pub struct SubscriberQueue {
    capacity: usize,
    policy: BackpressurePolicy,
    state: Mutex<QueueState>,
    data: Notify,
    space: Notify,
    dropped_oldest: AtomicU64,
    dropped_newest: AtomicU64,
}

enum PushNow {
    Delivered,
    Dropped,
    WouldBlock,
}

impl SubscriberQueue {
    fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            state: Mutex::new(QueueState {
                buf: VecDeque::new(),
                closed: false,
                disconnected: false,
            }),
            data: Notify::new(),
            space: Notify::new(),
            dropped_oldest: AtomicU64::new(0),
            dropped_newest: AtomicU64::new(0),
        }
    }

    /// Messages evicted from the head under `DropOldest`
    pub fn dropped_oldest(&self) -> u64 {
        self.dropped_oldest.load(Ordering::Relaxed)
    }

    /// Messages rejected under `DropNewest`
    pub fn dropped_newest(&self) -> u64 {
        self.dropped_newest.load(Ordering::Relaxed)
    }

    /// Apply the policy synchronously. `Block` reports `WouldBlock` on a full
    /// ring instead of suspending.
    fn push_now(&self, msg: &Message) -> PushNow {
        let mut st = self.state.lock();
        if st.disconnected || st.closed {
            return PushNow::Delivered;
        }
        if st.buf.len() < self.capacity {
            st.buf.push_back(msg.clone());
            self.data.notify_one();
            return PushNow::Delivered;
        }
        match self.policy {
            BackpressurePolicy::DropOldest => {
                st.buf.pop_front();
                st.buf.push_back(msg.clone());
                self.dropped_oldest.fetch_add(1, Ordering::Relaxed);
                self.data.notify_one();
                PushNow::Dropped
            },
            BackpressurePolicy::DropNewest => {
                self.dropped_newest.fetch_add(1, Ordering::Relaxed);
                PushNow::Dropped
            },
            BackpressurePolicy::Block => PushNow::WouldBlock,
        }
    }

    /// Suspend until space appears or the timeout elapses. Returns `false` on
    /// timeout, in which case the subscriber must be disconnected.
    async fn push_blocking(&self, msg: &Message, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.space.notified();
            {
                let mut st = self.state.lock();
                if st.disconnected || st.closed {
                    return true;
                }
                if st.buf.len() < self.capacity {
                    st.buf.push_back(msg.clone());
                    self.data.notify_one();
                    return true;
                }
            }
            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep_until(deadline) => return false,
            }
        }
    }

    /// Insert without applying any policy (snapshot fill, terminal delivery).
    fn push_unchecked(&self, msg: Message) {
        let mut st = self.state.lock();
        if st.disconnected || st.closed {
            return;
        }
        st.buf.push_back(msg);
        self.data.notify_one();
    }

    fn note_skipped(&self, n: u64) {
        self.dropped_oldest.fetch_add(n, Ordering::Relaxed);
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.data.notify_waiters();
    }

    fn disconnect(&self) {
        let mut st = self.state.lock();
        st.disconnected = true;
        st.buf.clear();
        drop(st);
        self.data.notify_waiters();
        self.space.notify_waiters();
    }

    async fn recv(&self) -> Option<Message> {
        loop {
            let notified = self.data.notified();
            {
                let mut st = self.state.lock();
                if st.disconnected {
                    return None;
                }
                if let Some(msg) = st.buf.pop_front() {
                    self.space.notify_one();
                    return Some(msg);
                }
                if st.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

/// Receiving end handed to a subscriber.
///
/// The handle owns the queue; the broadcaster only holds a weak reference, so
/// dropping the handle stops delivery.
pub struct SubscriberHandle {
    id: u64,
    queue: Arc<SubscriberQueue>,
    broadcaster: Weak<Broadcaster>,
}

impl std::fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberHandle").field("id", &self.id).finish()
    }
}

impl SubscriberHandle {
    /// Next message, or `None` once the stream is over or the subscriber was
    /// disconnected
    pub async fn recv(&mut self) -> Option<Message> {
        self.queue.recv().await
    }

    /// Collect every remaining message through the terminal
    pub async fn collect(mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(msg) = self.recv().await {
            out.push(msg);
        }
        out
    }

    /// Adapt the handle into a `futures::Stream`
    pub fn into_stream(self) -> impl futures::Stream<Item = Message> + Send {
        futures::stream::unfold(self, |mut handle| async move {
            handle.recv().await.map(|msg| (msg, handle))
        })
    }

    /// Stop receiving. Idempotent; also implied by dropping the handle.
    pub fn unsubscribe(&self) {
        if let Some(b) = self.broadcaster.upgrade() {
            b.unsubscribe(self.id);
        } else {
            self.queue.disconnect();
        }
    }

    /// Messages evicted from this subscriber's ring head
    pub fn dropped_oldest(&self) -> u64 {
        self.queue.dropped_oldest()
    }

    /// Messages rejected at this subscriber's ring tail
    pub fn dropped_newest(&self) -> u64 {
        self.queue.dropped_newest()
    }
}

struct Slot {
    id: u64,
    queue: Weak<SubscriberQueue>,
}

struct BroadcastState {
    window: VecDeque<Message>,
    subscribers: Vec<Slot>,
    next_id: u64,
    sealed: bool,
}

/// Fans one request's message stream out to N subscribers.
pub struct Broadcaster {
    request_id: RequestId,
    window_cap: usize,
    block_timeout: Duration,
    metrics: Arc<dyn MetricsSink>,
    state: Mutex<BroadcastState>,
}

impl Broadcaster {
    /// Create a broadcaster retaining `window_cap` recent messages for late
    /// joiners
    pub fn new(
        request_id: RequestId,
        window_cap: usize,
        block_timeout: Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            request_id,
            window_cap: window_cap.max(1),
            block_timeout,
            metrics,
            state: Mutex::new(BroadcastState {
                window: VecDeque::new(),
                subscribers: Vec::new(),
                next_id: 0,
                sealed: false,
            }),
        })
    }

    /// The request this broadcaster belongs to
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Register a subscriber: snapshot of the retained window first, then the
    /// live stream. The snapshot cursor is taken under the state lock, so no
    /// message is duplicated or skipped across the transition.
    pub fn subscribe(
        self: &Arc<Self>,
        policy: BackpressurePolicy,
        capacity: usize,
    ) -> SubscriberHandle {
        let queue = Arc::new(SubscriberQueue::new(capacity, policy));
        let mut st = self.state.lock();
        let id = st.next_id;
        st.next_id += 1;

        // A ring smaller than the window can only hold the newest entries;
        // the skipped prefix counts as dropped_oldest whatever the policy,
        // because nothing may suspend inside this critical section.
        let skip = st.window.len().saturating_sub(queue.capacity);
        if skip > 0 {
            queue.note_skipped(skip as u64);
            self.metrics.incr(Counter::MessagesDroppedTotal, skip as u64);
        }
        for msg in st.window.iter().skip(skip) {
            queue.push_unchecked(msg.clone());
        }

        if st.sealed {
            queue.close();
        } else {
            st.subscribers.push(Slot {
                id,
                queue: Arc::downgrade(&queue),
            });
        }
        SubscriberHandle {
            id,
            queue,
            broadcaster: Arc::downgrade(self),
        }
    }

    /// Remove a subscriber. Idempotent.
    pub fn unsubscribe(&self, id: u64) {
        let queue = {
            let mut st = self.state.lock();
            let Some(pos) = st.subscribers.iter().position(|s| s.id == id) else {
                return;
            };
            st.subscribers.swap_remove(pos).queue
        };
        if let Some(q) = queue.upgrade() {
            q.disconnect();
        }
    }

    /// Deliver one message to the window and every live subscriber, applying
    /// each subscriber's policy independently. The terminal message bypasses
    /// ring capacity: every subscriber must learn the request ended, and a
    /// full `Block` ring must not be able to deadlock teardown. It also seals
    /// the broadcaster: subscriber queues are closed and later broadcasts are
    /// ignored.
    pub async fn broadcast(&self, msg: Message) {
        let terminal = msg.is_terminal();
        let targets: Vec<Arc<SubscriberQueue>> = {
            let mut st = self.state.lock();
            if st.sealed {
                debug!(request_id = %self.request_id, "dropping broadcast after terminal");
                return;
            }
            if st.window.len() == self.window_cap {
                st.window.pop_front();
            }
            st.window.push_back(msg.clone());
            if terminal {
                st.sealed = true;
            }
            // Prune subscribers whose handles were dropped.
            st.subscribers.retain(|s| s.queue.strong_count() > 0);
            st.subscribers
                .iter()
                .filter_map(|s| s.queue.upgrade())
                .collect()
        };

        let mut blocked = Vec::new();
        let mut dropped = 0u64;
        for queue in &targets {
            if terminal {
                queue.push_unchecked(msg.clone());
                continue;
            }
            match queue.push_now(&msg) {
                PushNow::Delivered => {},
                PushNow::Dropped => dropped += 1,
                PushNow::WouldBlock => blocked.push(queue.clone()),
            }
        }
        if dropped > 0 {
            self.metrics.incr(Counter::MessagesDroppedTotal, dropped);
        }
        if !blocked.is_empty() {
            // Concurrently, so one stalled subscriber cannot hold up another.
            futures::future::join_all(blocked.iter().map(|queue| async {
                if !queue.push_blocking(&msg, self.block_timeout).await {
                    warn!(
                        request_id = %self.request_id,
                        "subscriber stalled past the broadcast timeout, disconnecting"
                    );
                    queue.disconnect();
                }
            }))
            .await;
        }

        if terminal {
            let slots = {
                let mut st = self.state.lock();
                std::mem::take(&mut st.subscribers)
            };
            for slot in slots {
                if let Some(q) = slot.queue.upgrade() {
                    q.close();
                }
            }
        }
    }

    /// Whether the terminal message has been broadcast
    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }

    /// Live subscriber count (testing and diagnostics)
    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .subscribers
            .iter()
            .filter(|s| s.queue.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptmux_engine::{CancelReason, MessagePayload};

    fn text(n: u64) -> Message {
        Message::new(
            MessagePayload::Text {
                content: format!("m{n}"),
            },
            n,
        )
    }

    fn complete(n: u64) -> Message {
        Message::new(MessagePayload::Complete { stats: None }, n)
    }

    fn content(msg: &Message) -> &str {
        match &msg.payload {
            MessagePayload::Text { content } => content,
            _ => "<terminal>",
        }
    }

    fn broadcaster() -> Arc<Broadcaster> {
        Broadcaster::new(
            RequestId::new(),
            256,
            Duration::from_millis(100),
            Arc::new(crate::metrics::MemoryMetricsSink::default()),
        )
    }

    #[tokio::test]
    async fn drop_oldest_keeps_the_newest() {
        let b = broadcaster();
        let mut sub = b.subscribe(BackpressurePolicy::DropOldest, 2);
        for n in 0..5 {
            b.broadcast(text(n)).await;
        }
        b.broadcast(complete(5)).await;

        // The last two texts survive; the terminal rides along outside the cap.
        assert_eq!(sub.dropped_oldest(), 3);
        assert_eq!(content(&sub.recv().await.unwrap()), "m3");
        assert_eq!(content(&sub.recv().await.unwrap()), "m4");
        assert!(sub.recv().await.unwrap().is_terminal());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn terminal_reaches_a_full_drop_newest_ring() {
        let b = broadcaster();
        let mut sub = b.subscribe(BackpressurePolicy::DropNewest, 1);
        b.broadcast(text(0)).await;
        b.broadcast(text(1)).await;
        b.broadcast(complete(2)).await;

        assert_eq!(sub.dropped_newest(), 1);
        assert_eq!(content(&sub.recv().await.unwrap()), "m0");
        assert!(sub.recv().await.unwrap().is_terminal());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn drop_newest_rejects_overflow() {
        let b = broadcaster();
        let mut sub = b.subscribe(BackpressurePolicy::DropNewest, 2);
        for n in 0..5 {
            b.broadcast(text(n)).await;
        }
        assert_eq!(sub.dropped_newest(), 3);
        assert_eq!(content(&sub.recv().await.unwrap()), "m0");
        assert_eq!(content(&sub.recv().await.unwrap()), "m1");
    }

    #[tokio::test]
    async fn block_waits_for_the_consumer() {
        let b = Broadcaster::new(
            RequestId::new(),
            256,
            Duration::from_secs(5),
            Arc::new(crate::metrics::NullMetricsSink),
        );
        let mut sub = b.subscribe(BackpressurePolicy::Block, 1);
        b.broadcast(text(0)).await;

        let b2 = b.clone();
        let producer = tokio::spawn(async move { b2.broadcast(text(1)).await });
        // The producer is suspended on the full ring until we drain.
        tokio::task::yield_now().await;
        assert!(!producer.is_finished());

        assert_eq!(content(&sub.recv().await.unwrap()), "m0");
        producer.await.unwrap();
        assert_eq!(content(&sub.recv().await.unwrap()), "m1");
        assert_eq!(sub.dropped_oldest() + sub.dropped_newest(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_subscriber_is_disconnected_on_timeout_without_stalling_peers() {
        let b = Broadcaster::new(
            RequestId::new(),
            256,
            Duration::from_millis(50),
            Arc::new(crate::metrics::NullMetricsSink),
        );
        let mut stalled = b.subscribe(BackpressurePolicy::Block, 1);
        let mut healthy = b.subscribe(BackpressurePolicy::DropOldest, 8);

        b.broadcast(text(0)).await;
        // Ring of `stalled` is now full and nobody drains it.
        b.broadcast(text(1)).await;
        b.broadcast(text(2)).await;

        // Healthy peer saw everything despite the stalled one.
        assert_eq!(content(&healthy.recv().await.unwrap()), "m0");
        assert_eq!(content(&healthy.recv().await.unwrap()), "m1");
        assert_eq!(content(&healthy.recv().await.unwrap()), "m2");

        // The stalled subscriber was disconnected, not left hanging.
        assert!(stalled.recv().await.is_none());
        assert_eq!(b.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn late_joiner_gets_snapshot_then_live_without_gaps() {
        let b = broadcaster();
        b.broadcast(text(0)).await;
        b.broadcast(text(1)).await;

        let mut late = b.subscribe(BackpressurePolicy::DropOldest, 64);
        b.broadcast(text(2)).await;
        b.broadcast(complete(3)).await;

        let got = late.collect().await;
        let contents: Vec<&str> = got.iter().map(content).collect();
        assert_eq!(contents, ["m0", "m1", "m2", "<terminal>"]);
    }

    #[tokio::test]
    async fn snapshot_larger_than_ring_keeps_newest() {
        let b = broadcaster();
        for n in 0..10 {
            b.broadcast(text(n)).await;
        }
        let mut late = b.subscribe(BackpressurePolicy::Block, 3);
        assert_eq!(late.dropped_oldest(), 7);
        assert_eq!(content(&late.recv().await.unwrap()), "m7");
    }

    #[tokio::test]
    async fn subscriber_after_terminal_replays_window() {
        let b = broadcaster();
        b.broadcast(text(0)).await;
        b.broadcast(complete(1)).await;
        assert!(b.is_sealed());

        let got = b
            .subscribe(BackpressurePolicy::DropOldest, 64)
            .collect()
            .await;
        assert_eq!(got.len(), 2);
        assert!(got[1].is_terminal());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_delivery() {
        let b = broadcaster();
        let mut sub = b.subscribe(BackpressurePolicy::DropOldest, 8);
        b.broadcast(text(0)).await;
        sub.unsubscribe();
        sub.unsubscribe();
        b.broadcast(text(1)).await;
        assert!(sub.recv().await.is_none());
        assert_eq!(b.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropped_handle_is_pruned() {
        let b = broadcaster();
        let sub = b.subscribe(BackpressurePolicy::DropOldest, 8);
        drop(sub);
        b.broadcast(text(0)).await;
        assert_eq!(b.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn window_is_bounded() {
        let b = Broadcaster::new(
            RequestId::new(),
            2,
            Duration::from_millis(100),
            Arc::new(crate::metrics::NullMetricsSink),
        );
        for n in 0..10 {
            b.broadcast(text(n)).await;
        }
        let mut late = b.subscribe(BackpressurePolicy::DropOldest, 64);
        assert_eq!(content(&late.recv().await.unwrap()), "m8");
        assert_eq!(content(&late.recv().await.unwrap()), "m9");
    }

    #[tokio::test]
    async fn terminal_cancelled_closes_subscribers() {
        let b = broadcaster();
        let mut sub = b.subscribe(BackpressurePolicy::DropOldest, 8);
        b.broadcast(Message::new(
            MessagePayload::Cancelled {
                reason: CancelReason::Caller,
            },
            0,
        ))
        .await;
        assert!(sub.recv().await.unwrap().is_terminal());
        assert!(sub.recv().await.is_none());
    }
}
