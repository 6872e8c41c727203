//! Authorization-gated event streams

use crate::error::ApiError;
use crate::events::{Event, EventStream};
use futures::future::BoxFuture;
use std::sync::Arc;

/// A one-shot authorization decision that may still be in flight
pub type AuthCheck = BoxFuture<'static, Result<(), ApiError>>;

/// Scope predicate: events returning false are silently dropped
pub type EventFilter = Box<dyn Fn(&Event) -> bool + Send + Sync>;

/// Authorization re-evaluated for every event that passes the filter
pub type ItemCheck = Arc<dyn Fn(&Event) -> BoxFuture<'static, Result<(), ApiError>> + Send + Sync>;

/// Wraps a bus subscription so nothing is yielded until `check` succeeds.
///
/// Failure is terminal: the underlying subscription is released and every
/// later call to [`next`](Self::next) returns `None`.
pub struct AuthorizedStream {
    inner: Option<EventStream>,
    gate: Option<AuthCheck>,
    rejected: Option<ApiError>,
    filter: Option<EventFilter>,
    per_item: Option<ItemCheck>,
}

impl AuthorizedStream {
    pub fn new(inner: EventStream, check: AuthCheck) -> Self {
        Self {
            inner: Some(inner),
            gate: Some(check),
            rejected: None,
            filter: None,
            per_item: None,
        }
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn with_item_check(mut self, check: ItemCheck) -> Self {
        self.per_item = Some(check);
        self
    }

    /// Settle the pending authorization check.
    ///
    /// Idempotent. If this future is dropped before the check completes, the
    /// check stays pending and nothing is delivered.
    pub async fn authorize(&mut self) -> Result<(), ApiError> {
        if let Some(check) = self.gate.as_mut() {
            let outcome = check.await;
            self.gate = None;
            if let Err(e) = outcome {
                self.inner = None;
                self.rejected = Some(e);
            }
        }

        match &self.rejected {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Next authorized, in-scope event.
    ///
    /// `Some(Err(_))` is yielded exactly once when authorization fails, after
    /// which the stream is finished.
    pub async fn next(&mut self) -> Option<Result<Event, ApiError>> {
        self.inner.as_ref()?;
        if let Err(e) = self.authorize().await {
            return Some(Err(e));
        }

        loop {
            let event = match self.inner.as_mut()?.recv().await {
                Some(event) => event,
                None => {
                    self.inner = None;
                    return None;
                }
            };

            if let Some(filter) = &self.filter {
                if !filter(&event) {
                    continue;
                }
            }

            if let Some(check) = &self.per_item {
                if let Err(e) = check(&event).await {
                    self.inner = None;
                    self.rejected = Some(e.clone());
                    return Some(Err(e));
                }
            }

            return Some(Ok(event));
        }
    }

    /// Cancel the stream. Waits for a pending authorization check to settle,
    /// then releases the bus subscription.
    pub async fn close(&mut self) {
        if let Some(check) = self.gate.as_mut() {
            let _ = check.await;
            self.gate = None;
        }
        self.inner = None;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, Topic};
    use crate::model::Message;
    use chrono::Utc;
    use futures::FutureExt;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    fn message(id: i64, group_id: i64, author_id: i64) -> Event {
        Event::MessageAdded(Message {
            id,
            group_id,
            author_id,
            text: "hi".to_string(),
            created_at: Utc::now(),
        })
    }

    fn allow() -> AuthCheck {
        async { Ok(()) }.boxed()
    }

    fn deny() -> AuthCheck {
        async { Err(ApiError::Forbidden("not a member".to_string())) }.boxed()
    }

    #[tokio::test]
    async fn test_denied_stream_yields_error_then_ends() {
        let bus = EventBus::new();
        let mut stream = AuthorizedStream::new(bus.subscribe(Topic::MessageAdded), deny());

        bus.publish(message(1, 1, 1));
        let first = stream.next().await;
        assert!(matches!(first, Some(Err(ApiError::Forbidden(_)))));
        assert!(stream.next().await.is_none());
        assert!(stream.is_closed());

        // The bus subscription was released
        assert_eq!(bus.subscriber_count(Topic::MessageAdded), 0);
    }

    #[tokio::test]
    async fn test_filter_drops_out_of_scope_events() {
        let bus = EventBus::new();
        let mut stream = AuthorizedStream::new(bus.subscribe(Topic::MessageAdded), allow())
            .with_filter(|event| match event {
                Event::MessageAdded(m) => m.group_id == 7 && m.author_id != 2,
                _ => false,
            });

        bus.publish(message(1, 3, 1)); // other group
        bus.publish(message(2, 7, 2)); // self-authored
        bus.publish(message(3, 7, 1));

        match stream.next().await {
            Some(Ok(Event::MessageAdded(m))) => assert_eq!(m.id, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_next_waits_for_pending_check() {
        let bus = EventBus::new();
        let (tx, rx) = oneshot::channel::<Result<(), ApiError>>();
        let check = async move { rx.await.unwrap_or(Err(ApiError::unauthenticated())) }.boxed();
        let mut stream = AuthorizedStream::new(bus.subscribe(Topic::MessageAdded), check);

        bus.publish(message(1, 1, 1));
        assert!(timeout(Duration::from_millis(50), stream.next()).await.is_err());

        // The timed-out poll must not have opened the gate
        tx.send(Ok(())).unwrap();
        match stream.next().await {
            Some(Ok(Event::MessageAdded(m))) => assert_eq!(m.id, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_releases_subscription_after_check_settles() {
        let bus = EventBus::new();
        let (tx, rx) = oneshot::channel::<Result<(), ApiError>>();
        let check = async move { rx.await.unwrap_or(Ok(())) }.boxed();
        let mut stream = AuthorizedStream::new(bus.subscribe(Topic::MessageAdded), check);

        let closer = tokio::spawn(async move {
            stream.close().await;
            stream
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.subscriber_count(Topic::MessageAdded), 1);

        tx.send(Ok(())).unwrap();
        let mut stream = closer.await.unwrap();
        assert_eq!(bus.subscriber_count(Topic::MessageAdded), 0);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_per_item_check_terminates_stream() {
        let bus = EventBus::new();
        let check: ItemCheck = Arc::new(|event: &Event| {
            let allowed = event.origin() != 99;
            async move {
                if allowed {
                    Ok(())
                } else {
                    Err(ApiError::Forbidden("membership revoked".to_string()))
                }
            }
            .boxed()
        });
        let mut stream = AuthorizedStream::new(bus.subscribe(Topic::MessageAdded), allow())
            .with_item_check(check);

        bus.publish(message(1, 1, 1));
        bus.publish(message(2, 1, 99));
        bus.publish(message(3, 1, 1));

        assert!(matches!(stream.next().await, Some(Ok(_))));
        assert!(matches!(stream.next().await, Some(Err(ApiError::Forbidden(_)))));
        assert!(stream.next().await.is_none());
    }
}
