//! The event bus: one shared change-log tail, many filtered subscribers.
//!
//! The bus tails the change log at most once process-wide. A single
//! dispatcher task reads the tail and copies each event to every subscriber
//! whose filters accept it. Subscribers get independent bounded channels so
//! a slow consumer can never stall the dispatcher: when a channel fills, the
//! subscriber is dropped with [`Error::SlowConsumer`] instead of buffering
//! without bound.
//!
//! The tail starts lazily on the first `subscribe` and is restarted by the
//! next `subscribe` after it dies. Startup is serialized by an async mutex,
//! so concurrent subscribers racing a cold bus observe exactly one tail.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{ChangeLog, TailItem};
use crate::types::{Event, EventType};

/// Bounded queue depth per subscriber.
pub const SUBSCRIBER_BUFFER: usize = 64;

/// Unique identifier for a bus subscriber.
type SubscriberId = u64;

/// State a subscriber can observe after its channel closes.
#[derive(Debug, Default)]
pub struct SubscriberShared {
    closed: AtomicBool,
    err: parking_lot::Mutex<Option<Error>>,
}

impl SubscriberShared {
    fn set_err(&self, err: Error) {
        let mut slot = self.err.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn err(&self) -> Option<Error> {
        self.err.lock().clone()
    }
}

/// Registered subscriber state held by the tail.
#[derive(Debug)]
struct SubscriberEntry {
    app_id: String,
    object_types: HashSet<EventType>,
    object_ids: HashSet<String>,
    tx: mpsc::Sender<Event>,
    shared: Arc<SubscriberShared>,
}

impl SubscriberEntry {
    /// The delivery predicate: empty `app_id` and empty `object_ids` are
    /// wildcards; `object_types` is always a concrete set.
    fn matches(&self, event: &Event) -> bool {
        (self.app_id.is_empty() || event.app_id == self.app_id)
            && self.object_types.contains(&event.object_type)
            && (self.object_ids.is_empty() || self.object_ids.contains(&event.object_id))
    }
}

/// One live tail of the change log with its subscriber set.
#[derive(Debug)]
struct Tail {
    subscribers: RwLock<HashMap<SubscriberId, SubscriberEntry>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Tail {
    fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn register(
        self: &Arc<Self>,
        app_id: String,
        object_types: HashSet<EventType>,
        object_ids: HashSet<String>,
    ) -> Result<BusSubscriber> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let shared = Arc::new(SubscriberShared::default());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.write();
        // The dispatcher flips `closed` before draining the map; checking
        // under the write lock keeps a late registration from being orphaned.
        if self.is_closed() {
            return Err(Error::Unavailable("event bus is closed".into()));
        }
        subscribers.insert(
            id,
            SubscriberEntry {
                app_id,
                object_types,
                object_ids,
                tx,
                shared: Arc::clone(&shared),
            },
        );
        drop(subscribers);

        debug!(subscriber = id, "bus subscriber registered");
        Ok(BusSubscriber {
            events: rx,
            handle: SubscriberHandle {
                id,
                tail: Arc::clone(self),
                shared,
            },
        })
    }

    fn unregister(&self, id: SubscriberId) {
        if self.subscribers.write().remove(&id).is_some() {
            debug!(subscriber = id, "bus subscriber removed");
        }
    }

    /// Copies `event` to every matching subscriber. Subscribers whose
    /// channels are full or gone are collected under the read lock and
    /// removed under the write lock afterwards.
    fn fan_out(&self, event: &Event) {
        let mut dead: Vec<SubscriberId> = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (&id, entry) in subscribers.iter() {
                if !entry.matches(event) {
                    continue;
                }
                match entry.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(subscriber = id, event_id = event.id, "dropping slow subscriber");
                        entry.shared.set_err(Error::SlowConsumer);
                        dead.push(id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }

    /// Terminates the tail, propagating `cause` to every live subscriber.
    fn shutdown(&self, cause: &Error) {
        self.closed.store(true, Ordering::Release);
        let mut subscribers = self.subscribers.write();
        for (_, entry) in subscribers.drain() {
            entry.shared.set_err(cause.clone());
            // Dropping the sender closes the subscriber's channel.
        }
    }
}

/// Control handle for one bus subscriber, detached from its receiver so the
/// receiver can move into a forwarder task.
#[derive(Clone, Debug)]
pub struct SubscriberHandle {
    id: SubscriberId,
    tail: Arc<Tail>,
    shared: Arc<SubscriberShared>,
}

impl SubscriberHandle {
    /// Unregisters the subscriber and closes its channel. Idempotent.
    pub fn close(&self) {
        if self.shared.is_closed() {
            return;
        }
        self.shared.close();
        self.tail.unregister(self.id);
    }

    /// The error, if any, that terminated this subscriber.
    #[must_use]
    pub fn err(&self) -> Option<Error> {
        self.shared.err()
    }
}

/// A consumer of filtered events, as returned by [`EventBus::subscribe`].
#[derive(Debug)]
pub struct BusSubscriber {
    /// Filtered events, in strictly increasing id order.
    pub events: mpsc::Receiver<Event>,
    handle: SubscriberHandle,
}

impl BusSubscriber {
    /// Splits the subscriber into its receiver and control handle.
    #[must_use]
    pub fn into_parts(self) -> (mpsc::Receiver<Event>, SubscriberHandle) {
        (self.events, self.handle)
    }

    /// See [`SubscriberHandle::close`].
    pub fn close(&self) {
        self.handle.close();
    }

    /// See [`SubscriberHandle::err`].
    #[must_use]
    pub fn err(&self) -> Option<Error> {
        self.handle.err()
    }
}

/// The process-wide event bus.
///
/// Owned by the service object and shared with handlers behind `Arc`; the
/// tail itself is hidden state guarded by the start mutex.
pub struct EventBus {
    log: Arc<dyn ChangeLog>,
    tail: tokio::sync::Mutex<Option<Arc<Tail>>>,
}

impl EventBus {
    #[must_use]
    pub fn new(log: Arc<dyn ChangeLog>) -> Self {
        Self {
            log,
            tail: tokio::sync::Mutex::new(None),
        }
    }

    /// Subscribes to events matching all three filters.
    ///
    /// Empty `app_id` matches every app and an empty `object_ids` set
    /// matches every object; `object_types` must be non-empty.
    ///
    /// Lazily starts the tail. If the change log is unreachable the stored
    /// tail is torn down and the call fails with `Error::Unavailable`; the
    /// next call retries.
    pub async fn subscribe(
        &self,
        app_id: impl Into<String>,
        object_types: impl IntoIterator<Item = EventType>,
        object_ids: impl IntoIterator<Item = String>,
    ) -> Result<BusSubscriber> {
        let tail = self.maybe_start_tail().await?;
        tail.register(
            app_id.into(),
            object_types.into_iter().collect(),
            object_ids.into_iter().collect(),
        )
    }

    /// True iff no tail is live; the next `subscribe` will (re)start one.
    pub async fn is_closed(&self) -> bool {
        match self.tail.lock().await.as_ref() {
            Some(tail) => tail.is_closed(),
            None => true,
        }
    }

    /// Returns the live tail, starting one if needed. Serialized so that
    /// concurrent cold subscribes observe exactly one tail.
    async fn maybe_start_tail(&self) -> Result<Arc<Tail>> {
        let mut guard = self.tail.lock().await;
        if let Some(tail) = guard.as_ref() {
            if !tail.is_closed() {
                return Ok(Arc::clone(tail));
            }
        }
        *guard = None;

        let rx = self.log.listen().await?;
        let tail = Arc::new(Tail::new());
        tokio::spawn(dispatch(Arc::clone(&tail), rx));
        debug!("change log tail started");

        *guard = Some(Arc::clone(&tail));
        Ok(tail)
    }
}

/// Reads the tail until it ends and fans every event out.
async fn dispatch(tail: Arc<Tail>, mut rx: mpsc::UnboundedReceiver<TailItem>) {
    let cause = loop {
        match rx.recv().await {
            Some(Ok(event)) => tail.fan_out(&event),
            Some(Err(err)) => break err,
            None => break Error::Unavailable("change log tail ended".into()),
        }
    };
    warn!(error = %cause, "change log tail closed");
    tail.shutdown(&cause);
}
