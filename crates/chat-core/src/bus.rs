use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::events::{Event, EventKind};

/// Handler invoked for every event of the subscribed kind.
pub type EventHandler = dyn Fn(&Event) + Send + Sync;

/// Ordered handler list shared by the event bus and session observers.
///
/// Dispatch works on a snapshot, so handlers may subscribe or unsubscribe
/// while the list is being walked.
pub(crate) struct Registry<H: ?Sized> {
    inner: Mutex<RegistryInner<H>>,
}

struct RegistryInner<H: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Arc<H>)>,
}

impl<H: ?Sized + Send + Sync + 'static> Registry<H> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner {
                next_id: 0,
                entries: Vec::new(),
            }),
        })
    }

    pub(crate) fn insert(self: &Arc<Self>, handler: Arc<H>) -> Subscription {
        let id = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push((id, handler));
            id
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let registry: Weak<dyn Unsubscribe> = weak;
        Subscription {
            id,
            registry: Some(registry),
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<H>> {
        self.lock()
            .entries
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner<H>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

trait Unsubscribe: Send + Sync {
    fn remove(&self, id: u64);
}

impl<H: ?Sized + Send + Sync + 'static> Unsubscribe for Registry<H> {
    fn remove(&self, id: u64) {
        self.lock().entries.retain(|(entry_id, _)| *entry_id != id);
    }
}

/// Handle for one registered handler.
///
/// Dropping the handle unsubscribes. Call [`Subscription::detach`] to keep the
/// handler registered for as long as its source lives.
#[must_use = "dropping a Subscription unsubscribes the handler immediately"]
pub struct Subscription {
    id: u64,
    registry: Option<Weak<dyn Unsubscribe>>,
}

impl Subscription {
    /// Removes the handler now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keeps the handler registered without holding the handle.
    pub fn detach(mut self) {
        self.registry = None;
    }

    fn release(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|weak| weak.upgrade()) {
            registry.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Subscription")
            .field("id", &self.id)
            .field("attached", &self.registry.is_some())
            .finish()
    }
}

/// Typed publish/subscribe channel scoped to one backend.
///
/// Cloning yields another handle to the same channel, so worker tasks can emit
/// on behalf of their backend.
#[derive(Clone)]
pub struct EventBus {
    input: Arc<Registry<EventHandler>>,
    message: Arc<Registry<EventHandler>>,
    error: Arc<Registry<EventHandler>>,
    chunk: Arc<Registry<EventHandler>>,
    finish: Arc<Registry<EventHandler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            input: Registry::new(),
            message: Registry::new(),
            error: Registry::new(),
            chunk: Registry::new(),
            finish: Registry::new(),
        }
    }

    /// Registers `handler` for events of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.registry(kind).insert(Arc::new(handler))
    }

    /// Dispatches synchronously to the current subscribers of the event's kind,
    /// in subscription order. Events with no subscribers are dropped.
    pub fn emit(&self, event: &Event) {
        let handlers = self.registry(event.kind()).snapshot();
        if handlers.is_empty() {
            tracing::trace!(kind = event.kind().as_str(), id = %event.id, "event had no subscribers");
            return;
        }

        for handler in handlers {
            handler(event);
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.registry(kind).len()
    }

    fn registry(&self, kind: EventKind) -> &Arc<Registry<EventHandler>> {
        match kind {
            EventKind::Input => &self.input,
            EventKind::Message => &self.message,
            EventKind::Error => &self.error,
            EventKind::Chunk => &self.chunk,
            EventKind::Finish => &self.finish,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = formatter.debug_struct("EventBus");
        for kind in EventKind::ALL {
            debug.field(kind.as_str(), &self.subscriber_count(kind));
        }
        debug.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Box<dyn Fn(&Event) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |label: &'static str| -> Box<dyn Fn(&Event) + Send + Sync> {
            let sink = Arc::clone(&sink);
            Box::new(move |event: &Event| {
                sink.lock().unwrap().push(format!("{label}:{}", event.id));
            })
        };
        (log, make)
    }

    #[test]
    fn dispatches_in_subscription_order_by_kind() {
        let bus = EventBus::new();
        let (log, make) = recorder();

        let first = make("first");
        let second = make("second");
        let other = make("other");
        bus.on(EventKind::Chunk, move |event| first(event)).detach();
        bus.on(EventKind::Chunk, move |event| second(event)).detach();
        bus.on(EventKind::Finish, move |event| other(event)).detach();

        bus.emit(&Event::chunk("a").with_id("c1"));

        assert_eq!(*log.lock().unwrap(), vec!["first:c1", "second:c1"]);
    }

    #[test]
    fn dropped_subscription_stops_receiving() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let handler = make("h");

        let subscription = bus.on(EventKind::Input, move |event| handler(event));
        bus.emit(&Event::input("x").with_id("i1"));
        drop(subscription);
        bus.emit(&Event::input("y").with_id("i2"));

        assert_eq!(*log.lock().unwrap(), vec!["h:i1"]);
        assert_eq!(bus.subscriber_count(EventKind::Input), 0);
    }

    #[test]
    fn unsubscribing_during_dispatch_keeps_later_handlers() {
        let bus = EventBus::new();
        let (log, make) = recorder();

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_in_handler = Arc::clone(&slot);
        bus.on(EventKind::Chunk, move |_| {
            if let Some(subscription) = slot_in_handler.lock().unwrap().take() {
                subscription.unsubscribe();
            }
        })
        .detach();

        let victim = make("victim");
        *slot.lock().unwrap() = Some(bus.on(EventKind::Chunk, move |event| victim(event)));
        let tail = make("tail");
        bus.on(EventKind::Chunk, move |event| tail(event)).detach();

        bus.emit(&Event::chunk("a").with_id("c1"));
        bus.emit(&Event::chunk("b").with_id("c2"));

        // The first dispatch ran on a snapshot taken before the removal.
        assert_eq!(
            *log.lock().unwrap(),
            vec!["victim:c1", "tail:c1", "tail:c2"]
        );
    }

    #[test]
    fn subscribing_during_dispatch_applies_to_next_event() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let late = Arc::new(Mutex::new(Some(make("late"))));

        let bus_in_handler = bus.clone();
        bus.on(EventKind::Message, move |_| {
            if let Some(handler) = late.lock().unwrap().take() {
                bus_in_handler
                    .on(EventKind::Message, move |event| handler(event))
                    .detach();
            }
        })
        .detach();

        bus.emit(&Event::message(crate::Message::assistant("m", "x")).with_id("m1"));
        bus.emit(&Event::message(crate::Message::assistant("m", "y")).with_id("m2"));

        assert_eq!(*log.lock().unwrap(), vec!["late:m2"]);
    }

    #[test]
    fn events_before_subscription_are_lost() {
        let bus = EventBus::new();
        let (log, make) = recorder();

        bus.emit(&Event::error("boom").with_id("e0"));
        let handler = make("h");
        bus.on(EventKind::Error, move |event| handler(event)).detach();

        assert!(log.lock().unwrap().is_empty());
    }
}
