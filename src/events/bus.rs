//! Topic-keyed publish/subscribe

use crate::events::{Event, Topic};
use dashmap::DashMap;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

type Subscribers = HashMap<Uuid, mpsc::UnboundedSender<Event>>;

/// Routes published events to every live subscription on their topic.
///
/// Cloning is cheap and clones share the same subscriber table.
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<DashMap<Topic, Subscribers>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every current subscriber of its topic.
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: Event) -> usize {
        let topic = event.topic();

        // Snapshot under the shard lock, deliver outside it.
        let subscribers: Vec<_> = match self.topics.get(&topic) {
            Some(subs) => subs.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
            None => Vec::new(),
        };

        if subscribers.is_empty() {
            debug!(topic = %topic, "No subscribers for topic");
            return 0;
        }

        let mut delivered = 0;
        for (id, tx) in subscribers {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(subscription_id = %id, topic = %topic, "Subscriber gone before delivery");
            }
        }

        debug!(topic = %topic, delivered, "Published event");
        delivered
    }

    /// Open a new subscription. Events published after this call are queued
    /// for the returned stream until it is dropped.
    pub fn subscribe(&self, topic: Topic) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.topics.entry(topic).or_default().insert(id, tx);
        debug!(subscription_id = %id, topic = %topic, "Subscribed");

        EventStream {
            id,
            topic,
            rx,
            topics: Arc::downgrade(&self.topics),
        }
    }

    /// Number of live subscriptions on `topic`
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics.get(&topic).map(|s| s.len()).unwrap_or(0)
    }
}

/// One subscriber's private, ordered queue of events.
///
/// Dropping the stream removes the subscription from the bus.
pub struct EventStream {
    id: Uuid,
    topic: Topic,
    rx: mpsc::UnboundedReceiver<Event>,
    topics: Weak<DashMap<Topic, Subscribers>>,
}

impl EventStream {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Wait for the next event; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(topics) = self.topics.upgrade() {
            if let Some(mut subs) = topics.get_mut(&self.topic) {
                subs.remove(&self.id);
            }
            debug!(subscription_id = %self.id, topic = %self.topic, "Unsubscribed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;
    use chrono::DateTime;
    use futures::StreamExt;

    fn message(id: i64) -> Event {
        Event::MessageAdded(Message {
            id,
            group_id: 1,
            author_id: 1,
            text: format!("m{}", id),
            created_at: DateTime::from_timestamp(1_700_000_000 + id, 0).unwrap(),
        })
    }

    #[tokio::test]
    async fn test_each_subscriber_gets_every_event_in_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(Topic::MessageAdded);
        let mut b = bus.subscribe(Topic::MessageAdded);

        for i in 1..=3 {
            assert_eq!(bus.publish(message(i)), 2);
        }

        for stream in [&mut a, &mut b] {
            for i in 1..=3 {
                assert_eq!(stream.recv().await, Some(message(i)));
            }
        }
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = EventBus::new();
        let _groups = bus.subscribe(Topic::GroupAdded);
        assert_eq!(bus.publish(message(1)), 0);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = EventBus::new();
        let stream = bus.subscribe(Topic::MessageAdded);
        assert_eq!(bus.subscriber_count(Topic::MessageAdded), 1);

        drop(stream);
        assert_eq!(bus.subscriber_count(Topic::MessageAdded), 0);
        assert_eq!(bus.publish(message(1)), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let _slow = bus.subscribe(Topic::MessageAdded);
        let mut fast = bus.subscribe(Topic::MessageAdded);

        for i in 1..=1000 {
            bus.publish(message(i));
        }

        let received: Vec<_> = (&mut fast).take(1000).collect().await;
        assert_eq!(received.len(), 1000);
    }

    #[tokio::test]
    async fn test_no_events_from_before_subscribe() {
        let bus = EventBus::new();
        bus.publish(message(1));
        let mut late = bus.subscribe(Topic::MessageAdded);
        bus.publish(message(2));
        assert_eq!(late.recv().await, Some(message(2)));
    }
}
