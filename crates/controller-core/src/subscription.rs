//! Client-scoped subscription handle.
//!
//! Bus filters are conjunctive, but the API needs a union over app ids. The
//! handle realizes the disjunction: one bus subscriber per app-id filter,
//! each drained by a forwarder task into a single output channel. The output
//! closes exactly when every underlying channel has closed.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::bus::{EventBus, SubscriberHandle, SUBSCRIBER_BUFFER};
use crate::error::{Error, Result};
use crate::types::{Event, EventType};

/// Fan-in over one or more bus subscribers, presented as one event channel.
#[derive(Debug)]
pub struct EventSubscription {
    events: mpsc::Receiver<Event>,
    subs: Vec<SubscriberHandle>,
    err: Option<Error>,
    closed: bool,
}

/// Subscribes to events for the given app ids (empty ⇒ the wildcard
/// subscription), object types, and object ids.
///
/// # Errors
///
/// Fails when the bus cannot start its tail; any subscribers created before
/// the failure are closed.
pub async fn subscribe_events(
    bus: &EventBus,
    app_ids: &[String],
    object_types: &[EventType],
    object_ids: &[String],
) -> Result<EventSubscription> {
    let wildcard = [String::new()];
    let app_ids: &[String] = if app_ids.is_empty() { &wildcard } else { app_ids };

    let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
    let mut subs: Vec<SubscriberHandle> = Vec::with_capacity(app_ids.len());

    for app_id in app_ids {
        let sub = match bus
            .subscribe(
                app_id.clone(),
                object_types.iter().copied(),
                object_ids.iter().cloned(),
            )
            .await
        {
            Ok(sub) => sub,
            Err(err) => {
                for handle in &subs {
                    handle.close();
                }
                return Err(err);
            }
        };
        let (mut events, handle) = sub.into_parts();
        subs.push(handle);

        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
    }
    // Only forwarders hold senders now: the output closes when they all exit.
    drop(tx);

    Ok(EventSubscription {
        events: rx,
        subs,
        err: None,
        closed: false,
    })
}

impl EventSubscription {
    /// Receives the next event; `None` once every underlying subscriber's
    /// channel has closed.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Closes every underlying subscriber, aggregating the first error
    /// observed on any of them. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for sub in &self.subs {
            sub.close();
            if self.err.is_none() {
                self.err = sub.err();
            }
        }
    }

    /// The first error observed on any underlying subscriber.
    ///
    /// Meaningful after [`close`](Self::close) or after the channel has
    /// drained.
    #[must_use]
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Closes the subscription and returns its terminal error, if any.
    pub fn terminal_error(&mut self) -> Option<Error> {
        self.close();
        self.err.clone()
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl Stream for EventSubscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::ChangeLog;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryStore>, EventBus) {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(Arc::clone(&store) as Arc<dyn ChangeLog>);
        (store, bus)
    }

    #[tokio::test]
    async fn test_fan_in_unions_app_ids() {
        let (store, bus) = setup();
        let a = store.create_app("a", HashMap::new());
        let b = store.create_app("b", HashMap::new());
        let c = store.create_app("c", HashMap::new());

        let mut sub = subscribe_events(
            &bus,
            &[a.id.clone(), b.id.clone()],
            &[EventType::App],
            &[],
        )
        .await
        .unwrap();

        store
            .update_app_meta(&a.id, HashMap::from([("x".into(), "1".into())]))
            .unwrap();
        store
            .update_app_meta(&c.id, HashMap::from([("x".into(), "1".into())]))
            .unwrap();
        store
            .update_app_meta(&b.id, HashMap::from([("x".into(), "1".into())]))
            .unwrap();

        let mut seen = Vec::new();
        seen.push(sub.next_event().await.unwrap().app_id);
        seen.push(sub.next_event().await.unwrap().app_id);
        seen.sort();
        let mut expected = vec![a.id.clone(), b.id.clone()];
        expected.sort();
        assert_eq!(seen, expected);

        // Nothing further: the update to `c` was filtered out.
        let extra = tokio::time::timeout(Duration::from_millis(50), sub.next_event()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_empty_app_ids_is_wildcard() {
        let (store, bus) = setup();
        let mut sub = subscribe_events(&bus, &[], &[EventType::App], &[])
            .await
            .unwrap();

        let app = store.create_app("anything", HashMap::new());
        assert_eq!(sub.next_event().await.unwrap().object_id, app.id);
    }

    #[tokio::test]
    async fn test_close_closes_every_underlying_subscriber() {
        let (store, bus) = setup();
        let a = store.create_app("a", HashMap::new());
        let b = store.create_app("b", HashMap::new());

        let mut sub = subscribe_events(
            &bus,
            &[a.id.clone(), b.id.clone()],
            &[EventType::App],
            &[],
        )
        .await
        .unwrap();
        sub.close();

        // Output drains to None once the forwarders observe the closures.
        assert!(sub.next_event().await.is_none());
        assert!(sub.err().is_none());
    }

    #[tokio::test]
    async fn test_tail_death_surfaces_first_error() {
        let (store, bus) = setup();
        let mut sub = subscribe_events(&bus, &[], &[EventType::App], &[])
            .await
            .unwrap();

        store.fail_tails("connection reset");
        assert!(sub.next_event().await.is_none());
        assert!(matches!(
            sub.terminal_error(),
            Some(Error::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_unavailable() {
        let (store, bus) = setup();
        store.set_listen_error(true);
        let err = subscribe_events(&bus, &[], &[EventType::App], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }
}
