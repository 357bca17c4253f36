//! Generic publish/subscribe bus.
//!
//! Subscribers declare the event kinds they want once, at registration.
//! `post` delivers synchronously on the calling thread, in registration
//! order. An event nobody wants goes to the cleanup subscribers instead so
//! they can release what it carries. No lock is held while a callback runs,
//! so callbacks may register, unregister or post on the same bus.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

/// An event that can travel on an `EventBus`.
pub trait BusEvent: Send + 'static {
    type Kind: Copy + Eq + std::fmt::Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Event kinds a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interest<K> {
    All,
    Kinds(Vec<K>),
}

impl<K: Copy + Eq> Interest<K> {
    pub fn matches(&self, kind: K) -> bool {
        match self {
            Interest::All => true,
            Interest::Kinds(kinds) => kinds.contains(&kind),
        }
    }
}

pub trait Subscriber<E: BusEvent>: Send + Sync {
    fn interest(&self) -> Interest<E::Kind>;

    fn on_event(&self, event: &E);
}

/// Fallback for events with no matching subscriber.
pub trait CleanupSubscriber<E: BusEvent>: Send + Sync {
    /// `event` matched no subscriber and is dropped after this call.
    fn on_no_subscriber(self: Arc<Self>, bus: &EventBus<E>, event: &E);

    /// The last normal subscriber was unregistered.
    fn on_all_unregistered(self: Arc<Self>, bus: &EventBus<E>);
}

/// Closure subscriber.
pub struct Listener<E: BusEvent, F> {
    interest: Interest<E::Kind>,
    callback: F,
    _event: PhantomData<fn(&E)>,
}

impl<E, F> Listener<E, F>
where
    E: BusEvent,
    F: Fn(&E) + Send + Sync + 'static,
{
    pub fn new(interest: Interest<E::Kind>, callback: F) -> Arc<Self> {
        Arc::new(Self {
            interest,
            callback,
            _event: PhantomData,
        })
    }
}

impl<E, F> Subscriber<E> for Listener<E, F>
where
    E: BusEvent,
    F: Fn(&E) + Send + Sync + 'static,
{
    fn interest(&self) -> Interest<E::Kind> {
        self.interest.clone()
    }

    fn on_event(&self, event: &E) {
        (self.callback)(event)
    }
}

struct Registration<E: BusEvent> {
    subscriber: Arc<dyn Subscriber<E>>,
    interest: Interest<E::Kind>,
}

pub struct EventBus<E: BusEvent> {
    name: &'static str,
    subscribers: RwLock<Vec<Registration<E>>>,
    cleanup: RwLock<Vec<Arc<dyn CleanupSubscriber<E>>>>,
}

fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl<E: BusEvent> EventBus<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            subscribers: RwLock::new(Vec::new()),
            cleanup: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register `subscriber`. Registering the same subscriber twice is a no-op.
    pub fn register(&self, subscriber: Arc<dyn Subscriber<E>>) {
        let mut subscribers = self.subscribers.write();
        if subscribers.iter().any(|r| same(&r.subscriber, &subscriber)) {
            return;
        }
        let interest = subscriber.interest();
        subscribers.push(Registration {
            subscriber,
            interest,
        });
    }

    /// Unregister `subscriber`; unknown subscribers are ignored. Removing
    /// the last subscriber notifies the cleanup subscribers.
    pub fn unregister(&self, subscriber: &Arc<dyn Subscriber<E>>) {
        let now_empty = {
            let mut subscribers = self.subscribers.write();
            let before = subscribers.len();
            subscribers.retain(|r| !same(&r.subscriber, subscriber));
            before != subscribers.len() && subscribers.is_empty()
        };
        if now_empty {
            debug!(bus = self.name, "All subscribers unregistered");
            for cleanup in self.cleanup_snapshot() {
                cleanup.on_all_unregistered(self);
            }
        }
    }

    pub fn register_cleanup_subscriber(&self, subscriber: Arc<dyn CleanupSubscriber<E>>) {
        let mut cleanup = self.cleanup.write();
        if !cleanup.iter().any(|c| same(c, &subscriber)) {
            cleanup.push(subscriber);
        }
    }

    pub fn unregister_cleanup_subscriber(&self, subscriber: &Arc<dyn CleanupSubscriber<E>>) {
        self.cleanup.write().retain(|c| !same(c, subscriber));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn cleanup_subscriber_count(&self) -> usize {
        self.cleanup.read().len()
    }

    fn cleanup_snapshot(&self) -> Vec<Arc<dyn CleanupSubscriber<E>>> {
        self.cleanup.read().clone()
    }

    /// Deliver `event`, returning how many subscribers received it.
    pub fn post(&self, event: E) -> usize {
        let kind = event.kind();
        let matching: Vec<Arc<dyn Subscriber<E>>> = self
            .subscribers
            .read()
            .iter()
            .filter(|r| r.interest.matches(kind))
            .map(|r| r.subscriber.clone())
            .collect();

        if matching.is_empty() {
            debug!(bus = self.name, ?kind, "No subscriber for event");
            for cleanup in self.cleanup_snapshot() {
                cleanup.on_no_subscriber(self, &event);
            }
            return 0;
        }

        trace!(bus = self.name, ?kind, subscribers = matching.len(), "Posting event");
        for subscriber in &matching {
            subscriber.on_event(&event);
        }
        matching.len()
    }
}
