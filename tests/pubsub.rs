use std::convert::Infallible;

use kestrel::{error::BusError, prelude::*, pubsub::BusMetrics};

enum InboxMsg {
    Published(Published<String>),
    Drain,
}

impl From<Published<String>> for InboxMsg {
    fn from(published: Published<String>) -> Self {
        InboxMsg::Published(published)
    }
}

/// Collects published payloads.
struct Inbox;

impl Behaviour for Inbox {
    type State = Vec<String>;
    type Msg = InboxMsg;
    type Reply = Vec<String>;
    type Error = Infallible;

    async fn init(&self, _ctx: &mut Context<'_, Self>) -> Result<Vec<String>, Infallible> {
        Ok(Vec::new())
    }

    async fn receive(
        &self,
        _ctx: &mut Context<'_, Self>,
        received: &mut Vec<String>,
        msg: Envelope<InboxMsg>,
    ) -> Result<Option<Vec<String>>, Infallible> {
        match msg.into_payload() {
            InboxMsg::Published(published) => {
                received.push(format!("{}:{}", published.kind(), published.payload()));
                Ok(None)
            }
            InboxMsg::Drain => Ok(Some(std::mem::take(received))),
        }
    }
}

#[tokio::test]
async fn patterns_match_single_segments() -> Result<(), Box<dyn std::error::Error>> {
    let bus = PubSub::<String>::new();
    let mut events = bus.subscriber();
    let mut notices = bus.subscriber();
    events.subscribe_pattern("events.*")?;
    notices.subscribe_pattern("notices.*")?;

    assert_eq!(bus.publish("events.auth", "login", "alice".to_string()), 1);
    assert_eq!(bus.publish("events.auth.failed", "login", "bob".to_string()), 0);

    let published = events.try_recv().ok_or("missing event")?;
    assert_eq!(published.topic(), Some("events.auth"));
    assert_eq!(published.payload(), "alice");
    assert!(events.try_recv().is_none());
    assert!(notices.try_recv().is_none());

    assert_eq!(bus.broadcast("restart", "now".to_string()), 2);
    assert_eq!(events.recv().await.map(Published::into_payload), Some("now".to_string()));
    let broadcast = notices.recv().await.ok_or("missing broadcast")?;
    assert_eq!(broadcast.topic(), None);
    assert_eq!(broadcast.kind(), "restart");
    Ok(())
}

#[tokio::test]
async fn deep_patterns_match_any_depth() -> Result<(), Box<dyn std::error::Error>> {
    let bus = PubSub::<u32>::new();
    let mut sub = bus.subscriber();
    sub.subscribe_pattern("events.**")?;

    assert_eq!(bus.publish("events.auth.failed", "k", 1), 1);
    assert_eq!(bus.publish("notices.auth", "k", 2), 0);
    assert_eq!(sub.try_recv().map(Published::into_payload), Some(1));
    Ok(())
}

#[tokio::test]
async fn topic_segments_split_only_on_dots() -> Result<(), Box<dyn std::error::Error>> {
    let bus = PubSub::<u32>::new();
    let mut one = bus.subscriber();
    let mut two = bus.subscriber();
    one.subscribe_pattern("events.*")?;
    two.subscribe_pattern("events.*.*")?;

    assert_eq!(bus.publish("events.a/b", "k", 1), 1);
    assert_eq!(one.try_recv().map(Published::into_payload), Some(1));
    assert!(two.try_recv().is_none());

    // An empty trailing segment is not a segment `*` can match
    assert_eq!(bus.publish("events.", "k", 2), 0);
    assert!(one.try_recv().is_none());
    Ok(())
}

#[tokio::test]
async fn metrics_track_subscriptions() -> Result<(), Box<dyn std::error::Error>> {
    let bus = PubSub::<u32>::new();
    let a = bus.subscriber();
    let b = bus.subscriber();
    a.subscribe("orders.created");
    a.subscribe("orders.paid");
    b.subscribe("orders.created");
    b.subscribe_pattern("orders.*")?;

    assert_eq!(bus.publish("orders.created", "k", 1), 2);
    assert_eq!(bus.publish("orders.paid", "k", 2), 2);
    assert_eq!(bus.topics(), vec!["orders.created", "orders.paid"]);
    assert_eq!(
        bus.metrics(),
        BusMetrics {
            message_count: 2,
            subscription_count: 4,
            topic_count: 2,
            subscriber_count: 2,
            delivered_count: 4,
            dropped_count: 0,
        }
    );

    // Unsubscribing something that isn't subscribed is a no-op
    assert!(!b.unsubscribe("orders.paid"));
    assert!(a.unsubscribe("orders.paid"));
    assert_eq!(bus.topics(), vec!["orders.created"]);
    assert_eq!(bus.metrics().subscription_count, 3);
    Ok(())
}

#[tokio::test]
async fn invalid_patterns_are_rejected() {
    let bus = PubSub::<u32>::new();
    let sub = bus.subscriber();
    assert!(matches!(
        sub.subscribe_pattern("events.[auth"),
        Err(BusError::InvalidPattern { pattern, .. }) if pattern == "events.[auth"
    ));
    assert_eq!(bus.metrics().subscription_count, 0);
}

#[tokio::test]
async fn actors_receive_publications_as_casts() -> Result<(), Box<dyn std::error::Error>> {
    let system = ActorSystem::new();
    let bus = system.pubsub::<String>();
    let inbox = system.spawn(Inbox);
    let subscriber = bus.subscribe_actor(&system, inbox);
    assert!(bus.subscribe(subscriber, "chat.general"));

    assert_eq!(bus.publish("chat.general", "message", "hi".to_string()), 1);
    assert_eq!(bus.broadcast("notice", "bye".to_string()), 1);
    assert_eq!(
        system.call(&inbox, InboxMsg::Drain).await?,
        vec!["message:hi".to_string(), "notice:bye".to_string()]
    );

    // A stopped actor is dropped from the bus on the next delivery
    system.stop(inbox).await;
    assert_eq!(bus.publish("chat.general", "message", "anyone?".to_string()), 0);
    assert_eq!(bus.metrics().subscriber_count, 0);
    Ok(())
}
