//! Event fan-out.
//!
//! Pipelines hand classified events to a shared [`Publisher`]: a bounded queue that
//! never blocks the producer and keeps events ordered by timestamp across sources.
//! A dispatcher drains the queue into an [`EventBus`], which delivers each event to
//! every enabled subscriber whose [`EventFilter`] accepts it.

use crate::event::{ActionKind, ClassifiedEvent, SourceKind};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub const DEFAULT_QUEUE_DEPTH: usize = 64;
pub const DEFAULT_REORDER_WINDOW: Duration = Duration::from_millis(20);

/// Returned by a subscriber that can no longer accept events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("subscriber disconnected")]
pub struct Disconnected;

/// Receives classified events from the bus.
pub trait Subscriber: Send {
    fn deliver(&mut self, event: &ClassifiedEvent) -> Result<(), Disconnected>;
}

impl<F> Subscriber for F
where
    F: FnMut(&ClassifiedEvent) -> Result<(), Disconnected> + Send,
{
    fn deliver(&mut self, event: &ClassifiedEvent) -> Result<(), Disconnected> {
        self(event)
    }
}

impl Subscriber for mpsc::Sender<ClassifiedEvent> {
    fn deliver(&mut self, event: &ClassifiedEvent) -> Result<(), Disconnected> {
        self.send(event.clone()).map_err(|_| Disconnected)
    }
}

/// Determines which events a subscriber wants to receive.
#[derive(Debug, Clone, Copy)]
pub enum EventFilter {
    All,
    PressesOnly,
    ReleasesOnly,
    Source(SourceKind),
    Custom(fn(&ClassifiedEvent) -> bool),
}

impl EventFilter {
    pub fn matches(&self, event: &ClassifiedEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::PressesOnly => event.action == ActionKind::Press,
            EventFilter::ReleasesOnly => event.action == ActionKind::ShortRelease,
            EventFilter::Source(source) => event.source == *source,
            EventFilter::Custom(f) => f(event),
        }
    }
}

struct SubscriberEntry {
    subscriber: Box<dyn Subscriber>,
    enabled: bool,
    filter: EventFilter,
}

/// Registry of subscribers. Delivery follows registration order.
#[derive(Default)]
pub struct EventBus {
    next_id: u64,
    subscribers: BTreeMap<u64, SubscriberEntry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber and returns its id.
    pub fn add(&mut self, subscriber: impl Subscriber + 'static, filter: EventFilter) -> u64 {
        self.add_boxed(Box::new(subscriber), filter)
    }

    pub fn add_boxed(&mut self, subscriber: Box<dyn Subscriber>, filter: EventFilter) -> u64 {
        let id = self.next_id;
        self.subscribers.insert(
            id,
            SubscriberEntry {
                subscriber,
                enabled: true,
                filter,
            },
        );
        self.next_id += 1;
        id
    }

    pub fn enable(&mut self, id: u64) {
        if let Some(entry) = self.subscribers.get_mut(&id) {
            entry.enabled = true;
        }
    }

    /// Mutes a subscriber without removing it.
    pub fn disable(&mut self, id: u64) {
        if let Some(entry) = self.subscribers.get_mut(&id) {
            entry.enabled = false;
        }
    }

    pub fn remove(&mut self, id: u64) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Delivers one event. Subscribers that report [`Disconnected`] are dropped.
    pub fn emit(&mut self, event: &ClassifiedEvent) {
        let mut gone = Vec::new();
        for (id, entry) in self.subscribers.iter_mut() {
            if !entry.enabled || !entry.filter.matches(event) {
                continue;
            }
            if entry.subscriber.deliver(event).is_err() {
                gone.push(*id);
            }
        }
        for id in gone {
            debug!(subscriber = id, "removing disconnected subscriber");
            self.subscribers.remove(&id);
        }
    }

    pub fn emit_all(&mut self, events: &[ClassifiedEvent]) {
        for event in events {
            self.emit(event);
        }
    }
}

/// How events with identical timestamps are ordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TieBreak {
    /// Earlier position in the list wins; unlisted sources go last.
    SourcePriority(Vec<SourceKind>),
    /// Whichever pipeline published first.
    Arrival,
}

impl Default for TieBreak {
    fn default() -> Self {
        TieBreak::SourcePriority(SourceKind::ALL.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    pub queue_depth: usize,
    pub tie_break: TieBreak,
    /// How long an event waits in the queue for slower pipelines to publish
    /// earlier-stamped events before it is delivered.
    pub reorder_window: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            tie_break: TieBreak::default(),
            reorder_window: DEFAULT_REORDER_WINDOW,
        }
    }
}

#[derive(Debug)]
struct Queued {
    rank: u8,
    seq: u64,
    event: ClassifiedEvent,
}

impl Queued {
    fn order_key(&self) -> (Instant, u8, u64) {
        (self.event.at, self.rank, self.seq)
    }
}

#[derive(Debug, Default)]
struct Queue {
    items: VecDeque<Queued>,
    next_seq: u64,
    closed: bool,
    /// Timestamp of the last event handed out.
    delivered: Option<Instant>,
}

impl Queue {
    fn pop(&mut self) -> Option<ClassifiedEvent> {
        let item = self.items.pop_front()?;
        self.delivered = Some(item.event.at);
        Some(item.event)
    }
}

/// Bounded, timestamp-ordered, drop-oldest queue shared by all pipelines.
#[derive(Debug)]
pub struct Publisher {
    queue: Mutex<Queue>,
    ready: Condvar,
    depth: usize,
    ranks: [u8; 4],
    reorder_window: Duration,
    dropped: AtomicU64,
    published: AtomicU64,
}

impl Publisher {
    pub fn new(config: PublisherConfig) -> Self {
        let ranks = match &config.tie_break {
            TieBreak::Arrival => [0; 4],
            TieBreak::SourcePriority(order) => SourceKind::ALL.map(|source| {
                order
                    .iter()
                    .position(|s| *s == source)
                    .unwrap_or(order.len())
                    .min(u8::MAX as usize) as u8
            }),
        };
        Self {
            queue: Mutex::new(Queue::default()),
            ready: Condvar::new(),
            depth: config.queue_depth.max(1),
            ranks,
            reorder_window: config.reorder_window,
            dropped: AtomicU64::new(0),
            published: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rank(&self, source: SourceKind) -> u8 {
        let idx = SourceKind::ALL
            .iter()
            .position(|s| *s == source)
            .unwrap_or(0);
        self.ranks[idx]
    }

    /// Enqueues an event without blocking. On overflow the oldest queued event is
    /// discarded and counted.
    ///
    /// An event stamped before the last delivered one arrived too late to be sorted
    /// in; it is restamped to that delivery time so the delivered stream never goes
    /// back in time.
    pub fn publish(&self, mut event: ClassifiedEvent) {
        let rank = self.rank(event.source);
        let mut q = self.lock();
        if q.closed {
            return;
        }
        if let Some(floor) = q.delivered.filter(|floor| event.at < *floor) {
            trace!(
                key = %event.key,
                late_by = ?floor - event.at,
                "late event restamped"
            );
            event.at = floor;
        }
        let seq = q.next_seq;
        q.next_seq += 1;
        let item = Queued { rank, seq, event };
        let key = item.order_key();
        let idx = q.items.partition_point(|e| e.order_key() <= key);
        q.items.insert(idx, item);
        self.published.fetch_add(1, Ordering::Relaxed);

        if q.items.len() > self.depth {
            if let Some(lost) = q.items.pop_front() {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n.is_power_of_two() {
                    warn!(
                        dropped = n,
                        key = %lost.event.key,
                        "event queue full, dropping oldest"
                    );
                }
            }
        }
        drop(q);
        self.ready.notify_one();
    }

    /// Publishes a batch in the order given.
    pub fn publish_all(&self, events: impl IntoIterator<Item = ClassifiedEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    /// Waits up to `timeout` for the next event that is due for delivery.
    ///
    /// Returns `None` on timeout, or once the publisher is closed and empty. A
    /// closed publisher hands out what is left without waiting for the reorder
    /// window.
    pub fn recv(&self, timeout: Duration) -> Option<ClassifiedEvent> {
        let deadline = Instant::now() + timeout;
        let mut q = self.lock();
        loop {
            let now = Instant::now();
            let wake_at = match q.items.front() {
                Some(front) => {
                    let due = front.event.at + self.reorder_window;
                    if q.closed || now >= due {
                        return q.pop();
                    }
                    due.min(deadline)
                }
                None if q.closed => return None,
                None => deadline,
            };
            if now >= deadline {
                return None;
            }
            q = self
                .ready
                .wait_timeout(q, wake_at.saturating_duration_since(now))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Takes everything queued right now, ignoring the reorder window.
    pub fn take_all(&self) -> Vec<ClassifiedEvent> {
        let mut q = self.lock();
        std::iter::from_fn(|| q.pop()).collect()
    }

    /// Delivers every queued event to `bus` synchronously.
    pub fn drain(&self, bus: &mut EventBus) -> usize {
        let events = self.take_all();
        bus.emit_all(&events);
        events.len()
    }

    /// Stops accepting events and wakes the dispatcher.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Runs a dispatcher thread that feeds `bus` until the publisher is closed and
    /// drained.
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        bus: Arc<Mutex<EventBus>>,
    ) -> std::io::Result<JoinHandle<()>> {
        let publisher = Arc::clone(self);
        thread::Builder::new()
            .name("keyrelay-dispatch".into())
            .spawn(move || {
                debug!("dispatcher started");
                loop {
                    match publisher.recv(Duration::from_millis(100)) {
                        Some(event) => bus
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .emit(&event),
                        None if publisher.is_closed() && publisher.is_empty() => break,
                        None => {}
                    }
                }
                debug!("dispatcher stopped");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::LogicalKey;

    fn ev(key: &str, source: SourceKind, action: ActionKind, at: Instant) -> ClassifiedEvent {
        ClassifiedEvent {
            key: LogicalKey::new(key).unwrap(),
            action,
            at,
            source,
        }
    }

    fn publisher(depth: usize, tie_break: TieBreak) -> Publisher {
        Publisher::new(PublisherConfig {
            queue_depth: depth,
            tie_break,
            reorder_window: Duration::ZERO,
        })
    }

    fn sources(events: &[ClassifiedEvent]) -> Vec<SourceKind> {
        events.iter().map(|e| e.source).collect()
    }

    #[test]
    fn orders_by_timestamp_then_source_priority() {
        let t0 = Instant::now();
        let p = publisher(16, TieBreak::default());
        let t1 = t0 + Duration::from_millis(1);
        p.publish(ev("KEY_OK", SourceKind::Ir, ActionKind::Press, t1));
        p.publish(ev("KEY_OK", SourceKind::Touch, ActionKind::Press, t1));
        p.publish(ev("KEY_OK", SourceKind::Gpio, ActionKind::Press, t1));
        p.publish(ev("KEY_UP", SourceKind::Gpio, ActionKind::Press, t0));

        let out = p.take_all();
        assert_eq!(out[0].key.as_str(), "KEY_UP");
        assert_eq!(
            sources(&out[1..]),
            vec![SourceKind::Gpio, SourceKind::Touch, SourceKind::Ir]
        );
    }

    #[test]
    fn arrival_tie_break_keeps_publish_order() {
        let t0 = Instant::now();
        let p = publisher(16, TieBreak::Arrival);
        p.publish(ev("KEY_OK", SourceKind::Ir, ActionKind::Press, t0));
        p.publish(ev("KEY_OK", SourceKind::Gpio, ActionKind::Press, t0));
        assert_eq!(sources(&p.take_all()), vec![SourceKind::Ir, SourceKind::Gpio]);
    }

    #[test]
    fn custom_priority_order() {
        let t0 = Instant::now();
        let p = publisher(16, TieBreak::SourcePriority(vec![SourceKind::Ir]));
        p.publish(ev("KEY_OK", SourceKind::Rotary, ActionKind::Press, t0));
        p.publish(ev("KEY_OK", SourceKind::Ir, ActionKind::Press, t0));
        assert_eq!(sources(&p.take_all()), vec![SourceKind::Ir, SourceKind::Rotary]);
    }

    #[test]
    fn full_queue_drops_oldest_and_counts() {
        let t0 = Instant::now();
        let p = publisher(2, TieBreak::default());
        for (i, key) in ["KEY_UP", "KEY_DOWN", "KEY_LEFT"].iter().enumerate() {
            let at = t0 + Duration::from_millis(i as u64);
            p.publish(ev(key, SourceKind::Gpio, ActionKind::Press, at));
        }
        assert_eq!(p.dropped(), 1);
        assert_eq!(p.published(), 3);
        let keys: Vec<_> = p.take_all().into_iter().map(|e| e.key.to_string()).collect();
        assert_eq!(keys, vec!["KEY_DOWN", "KEY_LEFT"]);
    }

    #[test]
    fn late_event_is_restamped_after_delivered_ones() {
        let t0 = Instant::now();
        let p = publisher(8, TieBreak::default());
        p.publish(ev("KEY_LEFT", SourceKind::Gpio, ActionKind::Press, t0 + Duration::from_millis(80)));
        assert_eq!(p.take_all().len(), 1);

        // Classified long after its physical time, e.g. an IR release.
        p.publish(ev("KEY_OK", SourceKind::Ir, ActionKind::ShortRelease, t0));
        p.publish(ev("KEY_UP", SourceKind::Gpio, ActionKind::Press, t0 + Duration::from_millis(90)));
        let out = p.take_all();
        assert_eq!(out[0].key.as_str(), "KEY_OK");
        assert_eq!(out[0].at, t0 + Duration::from_millis(80));
        assert!(out.windows(2).all(|w| w[0].at <= w[1].at));
    }

    #[test]
    fn recv_times_out_and_honors_close() {
        let p = publisher(4, TieBreak::default());
        assert!(p.recv(Duration::from_millis(5)).is_none());

        p.publish(ev("KEY_OK", SourceKind::Gpio, ActionKind::Press, Instant::now()));
        p.close();
        assert!(p.recv(Duration::from_millis(5)).is_some());
        assert!(p.recv(Duration::from_millis(5)).is_none());

        p.publish(ev("KEY_OK", SourceKind::Gpio, ActionKind::Press, Instant::now()));
        assert!(p.is_empty());
    }

    #[test]
    fn reorder_window_holds_fresh_events_back() {
        let p = Publisher::new(PublisherConfig {
            reorder_window: Duration::from_secs(60),
            ..PublisherConfig::default()
        });
        p.publish(ev("KEY_OK", SourceKind::Gpio, ActionKind::Press, Instant::now()));
        assert!(p.recv(Duration::from_millis(5)).is_none());
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn bus_filters_and_drops_disconnected_subscribers() {
        let t0 = Instant::now();
        let mut bus = EventBus::new();
        let (tx, rx) = mpsc::channel();
        let presses = bus.add(tx, EventFilter::PressesOnly);
        let ir_only = bus.add(
            |_: &ClassifiedEvent| -> Result<(), Disconnected> { Err(Disconnected) },
            EventFilter::Source(SourceKind::Ir),
        );

        bus.emit(&ev("KEY_OK", SourceKind::Gpio, ActionKind::Press, t0));
        bus.emit(&ev("KEY_OK", SourceKind::Gpio, ActionKind::ShortRelease, t0));
        assert_eq!(bus.len(), 2);

        bus.emit(&ev("KEY_UP", SourceKind::Ir, ActionKind::Press, t0));
        assert_eq!(bus.len(), 1);
        assert!(!bus.remove(ir_only));

        bus.disable(presses);
        bus.emit(&ev("KEY_DOWN", SourceKind::Gpio, ActionKind::Press, t0));
        bus.enable(presses);

        let got: Vec<_> = rx.try_iter().map(|e| e.key.to_string()).collect();
        assert_eq!(got, vec!["KEY_OK", "KEY_UP"]);
    }

    #[test]
    fn dispatcher_delivers_and_exits_on_close() {
        let p = Arc::new(publisher(8, TieBreak::default()));
        let bus = Arc::new(Mutex::new(EventBus::new()));
        let (tx, rx) = mpsc::channel();
        bus.lock().unwrap().add(tx, EventFilter::All);

        let handle = p.spawn_dispatcher(Arc::clone(&bus)).unwrap();
        p.publish(ev("KEY_OK", SourceKind::Gpio, ActionKind::Press, Instant::now()));
        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got.key.as_str(), "KEY_OK");

        p.close();
        handle.join().unwrap();
    }
}
