//! Frame bus: fan-out of captured frames to subscribers
//!
//! The capture loop publishes each frame exactly once; every subscriber
//! owns a small bounded inbox with its own drop policy, so a slow consumer
//! can never stall the source. The only blocking the publisher tolerates
//! is the recorder's bounded budget ([`RECORDER_BLOCK_BUDGET`]).

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::frame::Frame;
use crate::error::{AppError, Result};

/// Longest the publisher will wait on a full recorder inbox
pub const RECORDER_BLOCK_BUDGET: Duration = Duration::from_millis(10);
/// Publisher retry interval while inside the recorder budget
const BLOCK_SPIN_INTERVAL: Duration = Duration::from_micros(500);

/// What happens when a subscriber inbox is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Discard the oldest queued frame to make room (stream default)
    NewestWins,
    /// Discard the incoming frame, keep contiguous older samples
    OldestWins,
    /// Publisher waits up to the recorder budget, then drops (recorder only)
    BlockBounded,
}

/// Subscriber role on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberKind {
    Stream,
    Recorder,
    ExtractionTap,
}

/// Value delivered through a subscriber inbox
#[derive(Debug, Clone)]
pub enum BusEvent {
    Frame(Frame),
    /// Sentinel: the capture session ended; no more frames will arrive
    Closed,
}

struct Inbox {
    queue: Mutex<VecDeque<Frame>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

struct SubscriberShared {
    id: u64,
    kind: SubscriberKind,
    policy: DropPolicy,
    inbox: Inbox,
    delivered: AtomicU64,
    dropped: AtomicU64,
    /// Sequence of the last frame pushed into the inbox (u64::MAX = none yet)
    last_sequence: AtomicU64,
}

impl SubscriberShared {
    fn push(&self, frame: &Frame) -> bool {
        let mut queue = self.inbox.queue.lock();
        if queue.len() >= self.inbox.capacity {
            return false;
        }
        debug_assert!(
            self.last_sequence.load(Ordering::Relaxed) == u64::MAX
                || frame.sequence > self.last_sequence.load(Ordering::Relaxed)
                || frame.sequence == 0,
            "frames must be enqueued in sequence order"
        );
        self.last_sequence.store(frame.sequence, Ordering::Relaxed);
        queue.push_back(frame.clone());
        drop(queue);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.inbox.notify.notify_one();
        true
    }

    fn push_evicting_oldest(&self, frame: &Frame) {
        let mut queue = self.inbox.queue.lock();
        if queue.len() >= self.inbox.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.last_sequence.store(frame.sequence, Ordering::Relaxed);
        queue.push_back(frame.clone());
        drop(queue);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.inbox.notify.notify_one();
    }

    fn close(&self) {
        self.inbox.closed.store(true, Ordering::SeqCst);
        self.inbox.notify.notify_waiters();
        self.inbox.notify.notify_one();
    }

    fn drain(&self) {
        self.inbox.queue.lock().clear();
    }
}

/// A registered consumer's receiving end.
///
/// Dropping the handle unsubscribes and drains the inbox, releasing all
/// held frame references.
pub struct SubscriberHandle {
    shared: Arc<SubscriberShared>,
    bus: Arc<FrameBus>,
}

impl SubscriberHandle {
    /// Unique subscriber id
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn kind(&self) -> SubscriberKind {
        self.shared.kind
    }

    /// Frames dropped for this subscriber due to a full inbox
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Frames enqueued for this subscriber
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// Receive the next event, waiting until one is available.
    ///
    /// After the sentinel has been observed and the inbox is drained this
    /// keeps returning [`BusEvent::Closed`].
    pub async fn recv(&self) -> BusEvent {
        loop {
            if let Some(frame) = self.try_pop() {
                return BusEvent::Frame(frame);
            }
            if self.shared.inbox.closed.load(Ordering::SeqCst) {
                return BusEvent::Closed;
            }
            let notified = self.shared.inbox.notify.notified();
            // Re-check after arming the waiter so a publish between the
            // first check and `notified()` cannot be lost.
            if let Some(frame) = self.try_pop() {
                return BusEvent::Frame(frame);
            }
            if self.shared.inbox.closed.load(Ordering::SeqCst) {
                return BusEvent::Closed;
            }
            notified.await;
        }
    }

    /// Non-blocking receive
    pub fn try_recv(&self) -> Option<BusEvent> {
        if let Some(frame) = self.try_pop() {
            return Some(BusEvent::Frame(frame));
        }
        if self.shared.inbox.closed.load(Ordering::SeqCst) {
            return Some(BusEvent::Closed);
        }
        None
    }

    fn try_pop(&self) -> Option<Frame> {
        self.shared.inbox.queue.lock().pop_front()
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.bus.remove_subscriber(self.shared.id);
        self.shared.drain();
    }
}

/// Bus-wide statistics
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub frames_published: u64,
    pub recorder_stalls: u64,
    pub subscribers: usize,
}

/// Fan-out hub between the capture source and all consumers
pub struct FrameBus {
    subscribers: Mutex<Vec<Arc<SubscriberShared>>>,
    next_id: AtomicU64,
    latest: ArcSwapOption<Frame>,
    frames_published: AtomicU64,
    recorder_stalls: AtomicU64,
}

impl FrameBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            latest: ArcSwapOption::empty(),
            frames_published: AtomicU64::new(0),
            recorder_stalls: AtomicU64::new(0),
        })
    }

    /// Register a subscriber.
    ///
    /// At most one recorder subscriber may be active; a second registration
    /// is rejected.
    pub fn subscribe(
        self: &Arc<Self>,
        kind: SubscriberKind,
        capacity: usize,
        policy: DropPolicy,
    ) -> Result<SubscriberHandle> {
        let capacity = capacity.clamp(1, 4);

        let mut subscribers = self.subscribers.lock();
        if kind == SubscriberKind::Recorder
            && subscribers.iter().any(|s| s.kind == SubscriberKind::Recorder)
        {
            return Err(AppError::State(
                "A recorder subscriber is already registered".to_string(),
            ));
        }

        let shared = Arc::new(SubscriberShared {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            policy,
            inbox: Inbox {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            },
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            last_sequence: AtomicU64::new(u64::MAX),
        });
        subscribers.push(shared.clone());
        drop(subscribers);

        debug!(id = shared.id, ?kind, ?policy, "Subscriber registered");
        Ok(SubscriberHandle {
            shared,
            bus: self.clone(),
        })
    }

    /// Publish one frame to every subscriber.
    ///
    /// Called from the capture loop; never blocks beyond the recorder
    /// budget. Delivery happens on a snapshot of the registry so that
    /// subscribe/unsubscribe never wait on slow consumers.
    pub fn publish(&self, frame: Frame) {
        self.latest.store(Some(Arc::new(frame.clone())));
        self.frames_published.fetch_add(1, Ordering::Relaxed);

        let snapshot: Vec<Arc<SubscriberShared>> = self.subscribers.lock().clone();
        for sub in &snapshot {
            match sub.policy {
                DropPolicy::NewestWins => sub.push_evicting_oldest(&frame),
                DropPolicy::OldestWins => {
                    if !sub.push(&frame) {
                        sub.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                DropPolicy::BlockBounded => {
                    let deadline = Instant::now() + RECORDER_BLOCK_BUDGET;
                    let mut stored = sub.push(&frame);
                    while !stored && Instant::now() < deadline {
                        std::thread::sleep(BLOCK_SPIN_INTERVAL);
                        stored = sub.push(&frame);
                    }
                    if !stored {
                        sub.dropped.fetch_add(1, Ordering::Relaxed);
                        self.recorder_stalls.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            subscriber = sub.id,
                            sequence = frame.sequence,
                            "Recorder inbox full past budget, frame dropped"
                        );
                    }
                }
            }
        }
    }

    /// Deliver the close sentinel to every subscriber in registration
    /// order, then clear the registry.
    pub fn publish_closed(&self) {
        let drained: Vec<Arc<SubscriberShared>> =
            std::mem::take(&mut *self.subscribers.lock());
        for sub in &drained {
            sub.close();
        }
        self.latest.store(None);
        debug!(count = drained.len(), "Close sentinel delivered");
    }

    /// Most recently published frame, if any
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.latest.load_full()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Whether a recorder subscriber is currently registered
    pub fn has_recorder(&self) -> bool {
        self.subscribers
            .lock()
            .iter()
            .any(|s| s.kind == SubscriberKind::Recorder)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            frames_published: self.frames_published.load(Ordering::Relaxed),
            recorder_stalls: self.recorder_stalls.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }

    fn remove_subscriber(&self, id: u64) {
        let mut subscribers = self.subscribers.lock();
        if let Some(pos) = subscribers.iter().position(|s| s.id == id) {
            subscribers.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::{PixelFormat, Resolution};
    use bytes::Bytes;

    fn frame(sequence: u64) -> Frame {
        let mut data = vec![0xFF, 0xD8];
        data.extend(vec![sequence as u8; 200]);
        data.extend([0xFF, 0xD9]);
        Frame::from_bytes(
            Bytes::from(data),
            Resolution::VGA,
            PixelFormat::Mjpeg,
            sequence,
        )
    }

    #[tokio::test]
    async fn test_delivery_order_is_monotonic() {
        let bus = FrameBus::new();
        let sub = bus
            .subscribe(SubscriberKind::Stream, 4, DropPolicy::NewestWins)
            .unwrap();

        for seq in 0..4 {
            bus.publish(frame(seq));
        }

        let mut last = None;
        while let Some(BusEvent::Frame(f)) = sub.try_recv() {
            if let Some(prev) = last {
                assert!(f.sequence > prev);
            }
            last = Some(f.sequence);
        }
        assert_eq!(last, Some(3));
    }

    #[tokio::test]
    async fn test_newest_wins_evicts_oldest() {
        let bus = FrameBus::new();
        let sub = bus
            .subscribe(SubscriberKind::Stream, 2, DropPolicy::NewestWins)
            .unwrap();

        for seq in 0..5 {
            bus.publish(frame(seq));
        }

        // Oldest three were evicted; the two newest remain
        assert_eq!(sub.dropped(), 3);
        match sub.recv().await {
            BusEvent::Frame(f) => assert_eq!(f.sequence, 3),
            other => panic!("expected frame, got {:?}", other),
        }
        match sub.recv().await {
            BusEvent::Frame(f) => assert_eq!(f.sequence, 4),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oldest_wins_discards_incoming() {
        let bus = FrameBus::new();
        let sub = bus
            .subscribe(SubscriberKind::Stream, 2, DropPolicy::OldestWins)
            .unwrap();

        for seq in 0..5 {
            bus.publish(frame(seq));
        }

        assert_eq!(sub.dropped(), 3);
        match sub.recv().await {
            BusEvent::Frame(f) => assert_eq!(f.sequence, 0),
            other => panic!("expected frame, got {:?}", other),
        }
        match sub.recv().await {
            BusEvent::Frame(f) => assert_eq!(f.sequence, 1),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_block_bounded_publish_is_time_bounded() {
        let bus = FrameBus::new();
        let sub = bus
            .subscribe(SubscriberKind::Recorder, 2, DropPolicy::BlockBounded)
            .unwrap();

        bus.publish(frame(0));
        bus.publish(frame(1));

        // Inbox full and nobody consuming: publish must return within the
        // budget (with slack for scheduling) and count a stall.
        let start = Instant::now();
        bus.publish(frame(2));
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(sub.dropped(), 1);
        assert_eq!(bus.stats().recorder_stalls, 1);
    }

    #[tokio::test]
    async fn test_single_recorder_invariant() {
        let bus = FrameBus::new();
        let first = bus
            .subscribe(SubscriberKind::Recorder, 2, DropPolicy::BlockBounded)
            .unwrap();
        assert!(bus
            .subscribe(SubscriberKind::Recorder, 2, DropPolicy::BlockBounded)
            .is_err());

        drop(first);
        // After the first recorder is gone a new one may register
        assert!(bus
            .subscribe(SubscriberKind::Recorder, 2, DropPolicy::BlockBounded)
            .is_ok());
    }

    #[tokio::test]
    async fn test_close_sentinel_after_drain() {
        let bus = FrameBus::new();
        let sub = bus
            .subscribe(SubscriberKind::Stream, 4, DropPolicy::NewestWins)
            .unwrap();

        bus.publish(frame(0));
        bus.publish_closed();

        // Queued frames are drained before the sentinel
        assert!(matches!(sub.recv().await, BusEvent::Frame(_)));
        assert!(matches!(sub.recv().await, BusEvent::Closed));
        assert!(matches!(sub.recv().await, BusEvent::Closed));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_buffers() {
        use crate::video::frame::{FrameBuffer, FrameBufferPool};

        let bus = FrameBus::new();
        let pool = Arc::new(FrameBufferPool::new(4));
        let sub = bus
            .subscribe(SubscriberKind::Stream, 4, DropPolicy::NewestWins)
            .unwrap();

        let mut payload = pool.take(256);
        payload.extend_from_slice(&[0xFF, 0xD8]);
        payload.extend_from_slice(&[0u8; 200]);
        payload.extend_from_slice(&[0xFF, 0xD9]);
        let pooled = Frame::from_pooled(
            Arc::new(FrameBuffer::new(payload, Some(pool.clone()))),
            Resolution::VGA,
            PixelFormat::Mjpeg,
            0,
            0,
        );
        bus.publish(pooled.clone());
        drop(pooled);
        bus.latest.store(None);

        // The inbox still holds the only clone
        assert_eq!(pool.idle(), 0);
        drop(sub);
        assert_eq!(pool.idle(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_latest_frame_cache() {
        let bus = FrameBus::new();
        assert!(bus.latest_frame().is_none());
        bus.publish(frame(9));
        assert_eq!(bus.latest_frame().unwrap().sequence, 9);
    }
}
