//! A topic-based publish/subscribe bus.
//!
//! Subscribers register interest in exact topics with [`Subscriber::subscribe`], or in topic
//! patterns with [`Subscriber::subscribe_pattern`]. Topics are `.`-separated segments, and
//! patterns use glob syntax per segment: `*` matches exactly one segment, `**` any number of
//! segments (including none), `?` a single character and `[...]` a character class. Matching never
//! crosses a `.`, and an empty topic segment is only ever matched by `**`.
//!
//! Delivery is best effort. A subscriber whose queue is full misses the message, and a subscriber
//! that has gone away is removed. Either way it does not count towards the delivered total returned
//! by [`PubSub::publish`] and [`PubSub::broadcast`].
//!
//! # Example
//!
//! ```
//! use kestrel::pubsub::PubSub;
//!
//! # tokio_test::block_on(async {
//! let bus = PubSub::<u32>::new();
//! let mut auth = bus.subscriber();
//! auth.subscribe_pattern("events.*")?;
//!
//! assert_eq!(bus.publish("events.auth", "login", 7), 1);
//! assert_eq!(bus.publish("notices.auth", "login", 8), 0);
//!
//! let published = auth.recv().await.unwrap();
//! assert_eq!(published.topic(), Some("events.auth"));
//! assert_eq!(published.kind(), "login");
//! assert_eq!(*published.payload(), 7);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::SystemTime,
};

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::trace;

use crate::{
    actor::{ActorRef, Behaviour},
    config::DEFAULT_SUBSCRIBER_CAPACITY,
    error::{BusError, SendError},
    system::ActorSystem,
};

// Each segment is matched on its own, so `/` is an ordinary character.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Identifies a subscriber within one bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriberId({})", self.0)
    }
}

/// A message delivered by the bus.
#[derive(Clone, Debug)]
pub struct Published<T> {
    topic: Option<Arc<str>>,
    kind: Arc<str>,
    payload: T,
    timestamp: SystemTime,
}

impl<T> Published<T> {
    /// The topic it was published on, or `None` for a broadcast.
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// The message kind given by the publisher.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Consumes the message, returning the payload.
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// When it was published.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

/// Counters for a bus.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMetrics {
    /// Messages published or broadcast.
    pub message_count: u64,
    /// Exact-topic and pattern subscriptions currently held.
    pub subscription_count: usize,
    /// Topics with at least one exact subscriber.
    pub topic_count: usize,
    /// Subscribers currently attached.
    pub subscriber_count: usize,
    /// Copies handed to subscribers.
    pub delivered_count: u64,
    /// Copies lost to full or closed subscribers.
    pub dropped_count: u64,
}

enum Delivery {
    Delivered,
    Full,
    Closed,
}

trait MessageSink<T>: Send + Sync {
    fn deliver(&self, msg: Published<T>) -> Delivery;
}

struct ChannelSink<T> {
    tx: mpsc::Sender<Published<T>>,
}

impl<T: Send> MessageSink<T> for ChannelSink<T> {
    fn deliver(&self, msg: Published<T>) -> Delivery {
        match self.tx.try_send(msg) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

struct ActorSink<B: Behaviour> {
    system: ActorSystem,
    actor_ref: ActorRef<B>,
}

impl<B, T> MessageSink<T> for ActorSink<B>
where
    B: Behaviour,
    B::Msg: From<Published<T>>,
{
    fn deliver(&self, msg: Published<T>) -> Delivery {
        match self.system.cast(&self.actor_ref, msg.into()).send() {
            Ok(()) => Delivery::Delivered,
            Err(SendError::MailboxFull(_)) => Delivery::Full,
            Err(_) => Delivery::Closed,
        }
    }
}

enum Segment {
    AnyDepth,
    Glob(Pattern),
}

/// A compiled topic pattern, one entry per `.`-separated segment.
struct TopicPattern {
    segments: Vec<Segment>,
}

impl TopicPattern {
    fn matches(&self, topic: &str) -> bool {
        let topic: Vec<&str> = topic.split('.').collect();
        matches_segments(&self.segments, &topic)
    }
}

fn matches_segments(pattern: &[Segment], topic: &[&str]) -> bool {
    match pattern.split_first() {
        None => topic.is_empty(),
        Some((Segment::AnyDepth, rest)) => {
            (0..=topic.len()).any(|skip| matches_segments(rest, &topic[skip..]))
        }
        Some((Segment::Glob(glob), rest)) => match topic.split_first() {
            Some((head, tail)) => {
                !head.is_empty()
                    && glob.matches_with(head, MATCH_OPTIONS)
                    && matches_segments(rest, tail)
            }
            None => false,
        },
    }
}

struct PatternSubscription {
    raw: Arc<str>,
    pattern: TopicPattern,
    subscriber: SubscriberId,
}

struct BusState<T> {
    sinks: HashMap<SubscriberId, Box<dyn MessageSink<T>>>,
    topics: HashMap<Arc<str>, BTreeSet<SubscriberId>>,
    patterns: Vec<PatternSubscription>,
}

impl<T> BusState<T> {
    fn remove_subscriber(&mut self, id: SubscriberId) -> bool {
        if self.sinks.remove(&id).is_none() {
            return false;
        }
        self.topics.retain(|_, subscribers| {
            subscribers.remove(&id);
            !subscribers.is_empty()
        });
        self.patterns.retain(|sub| sub.subscriber != id);
        true
    }
}

struct BusInner<T> {
    state: RwLock<BusState<T>>,
    capacity: usize,
    next_subscriber: AtomicU64,
    messages: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// A publish/subscribe bus carrying payloads of type `T`.
///
/// Clones share the same subscribers.
pub struct PubSub<T> {
    inner: Arc<BusInner<T>>,
}

impl<T: Clone + Send + 'static> PubSub<T> {
    /// Creates a bus whose channel subscribers buffer up to 64 messages.
    pub fn new() -> Self {
        PubSub::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Creates a bus whose channel subscribers buffer up to `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        PubSub {
            inner: Arc::new(BusInner {
                state: RwLock::new(BusState {
                    sinks: HashMap::new(),
                    topics: HashMap::new(),
                    patterns: Vec::new(),
                }),
                capacity: capacity.max(1),
                next_subscriber: AtomicU64::new(0),
                messages: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Attaches a channel-backed subscriber with no subscriptions yet.
    pub fn subscriber(&self) -> Subscriber<T> {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.attach(Box::new(ChannelSink { tx }));
        Subscriber {
            id,
            bus: self.clone(),
            rx,
        }
    }

    /// Attaches an actor as a subscriber. Messages arrive as casts.
    ///
    /// The actor is removed from the bus the first time a delivery finds it stopped.
    pub fn subscribe_actor<B>(&self, system: &ActorSystem, actor_ref: ActorRef<B>) -> SubscriberId
    where
        B: Behaviour,
        B::Msg: From<Published<T>>,
    {
        self.attach(Box::new(ActorSink {
            system: system.clone(),
            actor_ref,
        }))
    }

    /// Subscribes `subscriber` to an exact topic.
    ///
    /// Returns `false` if it was already subscribed, or is not attached to this bus.
    pub fn subscribe(&self, subscriber: SubscriberId, topic: &str) -> bool {
        let mut state = self.write_state();
        if !state.sinks.contains_key(&subscriber) {
            return false;
        }
        let added = state
            .topics
            .entry(Arc::from(topic))
            .or_default()
            .insert(subscriber);
        if added {
            trace!(%subscriber, %topic, "subscribed to topic");
        }
        added
    }

    /// Subscribes `subscriber` to every topic matching `pattern`.
    pub fn subscribe_pattern(&self, subscriber: SubscriberId, pattern: &str) -> Result<bool, BusError> {
        let compiled = compile_pattern(pattern)?;
        let mut state = self.write_state();
        if !state.sinks.contains_key(&subscriber) {
            return Ok(false);
        }
        if state
            .patterns
            .iter()
            .any(|sub| sub.subscriber == subscriber && &*sub.raw == pattern)
        {
            return Ok(false);
        }
        state.patterns.push(PatternSubscription {
            raw: Arc::from(pattern),
            pattern: compiled,
            subscriber,
        });
        trace!(%subscriber, %pattern, "subscribed to pattern");
        Ok(true)
    }

    /// Removes an exact-topic subscription. Pattern subscriptions are left alone.
    pub fn unsubscribe(&self, subscriber: SubscriberId, topic: &str) -> bool {
        let mut state = self.write_state();
        let Some(subscribers) = state.topics.get_mut(topic) else {
            return false;
        };
        let removed = subscribers.remove(&subscriber);
        if subscribers.is_empty() {
            state.topics.remove(topic);
        }
        removed
    }

    /// Removes a pattern subscription.
    pub fn unsubscribe_pattern(&self, subscriber: SubscriberId, pattern: &str) -> bool {
        let mut state = self.write_state();
        let before = state.patterns.len();
        state
            .patterns
            .retain(|sub| !(sub.subscriber == subscriber && &*sub.raw == pattern));
        state.patterns.len() != before
    }

    /// Detaches a subscriber and all of its subscriptions.
    pub fn remove(&self, subscriber: SubscriberId) -> bool {
        self.write_state().remove_subscriber(subscriber)
    }

    /// Delivers to every subscriber of `topic`, exact or by pattern.
    ///
    /// Each subscriber receives at most one copy. Returns the number of successful deliveries.
    pub fn publish(&self, topic: &str, kind: &str, payload: T) -> usize {
        let state = self.read_state();
        let mut recipients: BTreeSet<SubscriberId> =
            state.topics.get(topic).cloned().unwrap_or_default();
        recipients.extend(
            state
                .patterns
                .iter()
                .filter(|sub| sub.pattern.matches(topic))
                .map(|sub| sub.subscriber),
        );

        let msg = Published {
            topic: Some(Arc::from(topic)),
            kind: Arc::from(kind),
            payload,
            timestamp: SystemTime::now(),
        };
        self.deliver(state, recipients, msg)
    }

    /// Delivers to every subscriber regardless of subscriptions.
    pub fn broadcast(&self, kind: &str, payload: T) -> usize {
        let state = self.read_state();
        let recipients = state.sinks.keys().copied().collect();
        let msg = Published {
            topic: None,
            kind: Arc::from(kind),
            payload,
            timestamp: SystemTime::now(),
        };
        self.deliver(state, recipients, msg)
    }

    /// Returns the current counters.
    pub fn metrics(&self) -> BusMetrics {
        let state = self.read_state();
        BusMetrics {
            message_count: self.inner.messages.load(Ordering::Relaxed),
            subscription_count: state.topics.values().map(BTreeSet::len).sum::<usize>()
                + state.patterns.len(),
            topic_count: state.topics.len(),
            subscriber_count: state.sinks.len(),
            delivered_count: self.inner.delivered.load(Ordering::Relaxed),
            dropped_count: self.inner.dropped.load(Ordering::Relaxed),
        }
    }

    /// The topics with at least one exact subscriber, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self
            .read_state()
            .topics
            .keys()
            .map(|topic| topic.to_string())
            .collect();
        topics.sort();
        topics
    }

    fn attach(&self, sink: Box<dyn MessageSink<T>>) -> SubscriberId {
        let id = SubscriberId(self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed));
        self.write_state().sinks.insert(id, sink);
        id
    }

    fn deliver(
        &self,
        state: RwLockReadGuard<'_, BusState<T>>,
        recipients: BTreeSet<SubscriberId>,
        msg: Published<T>,
    ) -> usize {
        self.inner.messages.fetch_add(1, Ordering::Relaxed);
        let mut delivered = 0;
        let mut dropped = 0;
        let mut closed = Vec::new();
        for id in recipients {
            let Some(sink) = state.sinks.get(&id) else {
                continue;
            };
            match sink.deliver(msg.clone()) {
                Delivery::Delivered => delivered += 1,
                Delivery::Full => dropped += 1,
                Delivery::Closed => {
                    dropped += 1;
                    closed.push(id);
                }
            }
        }
        drop(state);

        if !closed.is_empty() {
            let mut state = self.write_state();
            for id in closed {
                trace!(subscriber = %id, "removing closed subscriber");
                state.remove_subscriber(id);
            }
        }

        self.inner
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.inner.dropped.fetch_add(dropped, Ordering::Relaxed);
        delivered
    }

    fn read_state(&self) -> RwLockReadGuard<'_, BusState<T>> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, BusState<T>> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send + 'static> Default for PubSub<T> {
    fn default() -> Self {
        PubSub::new()
    }
}

impl<T> Clone for PubSub<T> {
    fn clone(&self) -> Self {
        PubSub {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for PubSub<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSub")
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

/// A channel-backed subscriber.
///
/// Dropping it detaches it from the bus.
pub struct Subscriber<T: Clone + Send + 'static> {
    id: SubscriberId,
    bus: PubSub<T>,
    rx: mpsc::Receiver<Published<T>>,
}

impl<T: Clone + Send + 'static> Subscriber<T> {
    /// The id of this subscriber.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Subscribes to an exact topic.
    pub fn subscribe(&self, topic: &str) -> bool {
        self.bus.subscribe(self.id, topic)
    }

    /// Subscribes to a topic pattern.
    pub fn subscribe_pattern(&self, pattern: &str) -> Result<bool, BusError> {
        self.bus.subscribe_pattern(self.id, pattern)
    }

    /// Removes an exact-topic subscription.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        self.bus.unsubscribe(self.id, topic)
    }

    /// Removes a pattern subscription.
    pub fn unsubscribe_pattern(&self, pattern: &str) -> bool {
        self.bus.unsubscribe_pattern(self.id, pattern)
    }

    /// Waits for the next message.
    pub async fn recv(&mut self) -> Option<Published<T>> {
        self.rx.recv().await
    }

    /// Takes the next message if one is queued.
    pub fn try_recv(&mut self) -> Option<Published<T>> {
        self.rx.try_recv().ok()
    }
}

impl<T: Clone + Send + 'static> Drop for Subscriber<T> {
    fn drop(&mut self) {
        self.bus.remove(self.id);
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish()
    }
}

fn compile_pattern(pattern: &str) -> Result<TopicPattern, BusError> {
    let invalid = |reason| BusError::InvalidPattern {
        pattern: pattern.to_string(),
        reason,
    };
    if pattern.is_empty() {
        return Err(invalid("pattern is empty"));
    }
    if pattern.contains('/') {
        return Err(invalid("`/` is not allowed in topic patterns"));
    }
    let segments = pattern
        .split('.')
        .map(|segment| match segment {
            "" => Err(invalid("pattern has an empty segment")),
            "**" => Ok(Segment::AnyDepth),
            _ => Pattern::new(segment)
                .map(Segment::Glob)
                .map_err(|err| invalid(err.msg)),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(TopicPattern { segments })
}
