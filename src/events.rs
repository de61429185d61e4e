//! Events and their propagation through the GATT object graph
//!
//! Every object that can be the target of an event owns a set of listeners. When an object is created it computes
//! its broadcast route once: its own listeners followed by those of each ancestor. A characteristic's route is
//! characteristic → service → device → [`Bluetooth`][crate::Bluetooth], a service's route is service → device →
//! `Bluetooth`, and so on. Dispatching an event walks that list in order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::{Characteristic, Device, Service};

/// The kinds of event dispatched by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    /// A characteristic value was read or notified by the device.
    CharacteristicValueChanged,
    /// A service was discovered.
    ServiceAdded,
    /// A service changed on the device.
    ServiceChanged,
    /// A service is no longer available, e.g. because the device disconnected.
    ServiceRemoved,
    /// The GATT server of a device disconnected.
    GattServerDisconnected,
    /// A device already granted to the `Bluetooth` instance was seen advertising again.
    AdvertisementReceived,
    /// The Bluetooth adapter was enabled or disabled.
    AvailabilityChanged,
}

impl EventKind {
    /// The Web Bluetooth name of this event.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::CharacteristicValueChanged => "characteristicvaluechanged",
            EventKind::ServiceAdded => "serviceadded",
            EventKind::ServiceChanged => "servicechanged",
            EventKind::ServiceRemoved => "serviceremoved",
            EventKind::GattServerDisconnected => "gattserverdisconnected",
            EventKind::AdvertisementReceived => "advertisementreceived",
            EventKind::AvailabilityChanged => "availabilitychanged",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The object an event originated from.
#[derive(Debug, Clone)]
pub enum EventTarget {
    /// The `Bluetooth` instance itself, carrying the new availability.
    Bluetooth {
        /// Whether the adapter is now available
        available: bool,
    },
    /// A device
    Device(Device),
    /// A service
    Service(Service),
    /// A characteristic
    Characteristic(Characteristic),
}

/// An event delivered to listeners.
#[derive(Debug, Clone)]
pub struct Event {
    kind: EventKind,
    target: EventTarget,
}

impl Event {
    pub(crate) fn new(kind: EventKind, target: EventTarget) -> Self {
        Event { kind, target }
    }

    /// What happened.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The object the event originated from, regardless of which listener receives it.
    pub fn target(&self) -> &EventTarget {
        &self.target
    }
}

/// A callback registered for one [`EventKind`].
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Identifies a registered listener so it can be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// The listeners registered on one object.
#[derive(Default)]
pub(crate) struct Listeners {
    entries: Mutex<Vec<(ListenerId, EventKind, Listener)>>,
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.entries.lock().unwrap().len();
        f.debug_struct("Listeners").field("len", &len).finish()
    }
}

impl Listeners {
    pub fn add(&self, kind: EventKind, listener: Listener) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().unwrap().push((id, kind, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let len = entries.len();
        entries.retain(|(x, _, _)| *x != id);
        entries.len() != len
    }

    fn dispatch(&self, event: &Event) {
        // Listeners may add or remove listeners, so call them without holding the lock.
        let matching: Vec<Listener> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, kind, _)| *kind == event.kind)
            .map(|(_, _, listener)| listener.clone())
            .collect();

        for listener in matching {
            listener(event);
        }
    }
}

/// The ordered list of listener sets an object broadcasts to.
#[derive(Debug, Clone)]
pub(crate) struct EventRoute(Arc<[Arc<Listeners>]>);

impl EventRoute {
    /// The route of the root object.
    pub fn root() -> Self {
        EventRoute(Arc::from(vec![Arc::new(Listeners::default())]))
    }

    /// The route of a new child of the object owning `self`.
    pub fn child(&self) -> Self {
        let mut chain = Vec::with_capacity(self.0.len() + 1);
        chain.push(Arc::new(Listeners::default()));
        chain.extend(self.0.iter().cloned());
        EventRoute(Arc::from(chain))
    }

    /// The listeners owned by this object.
    pub fn own(&self) -> &Listeners {
        &self.0[0]
    }

    pub fn dispatch(&self, event: Event) {
        trace!("dispatching {} across {} levels", event.kind, self.0.len());
        for listeners in self.0.iter() {
            listeners.dispatch(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Listener {
        let log = log.clone();
        Arc::new(move |_| log.lock().unwrap().push(tag))
    }

    #[test]
    fn dispatch_walks_route_in_order() {
        let root = EventRoute::root();
        let device = root.child();
        let service = device.child();
        let characteristic = service.child();

        let log = Arc::new(Mutex::new(Vec::new()));
        let kind = EventKind::CharacteristicValueChanged;
        root.own().add(kind, recorder(&log, "root"));
        service.own().add(kind, recorder(&log, "service"));
        device.own().add(kind, recorder(&log, "device"));
        characteristic.own().add(kind, recorder(&log, "characteristic"));
        characteristic.own().add(EventKind::ServiceAdded, recorder(&log, "wrong kind"));

        characteristic.dispatch(Event::new(kind, EventTarget::Bluetooth { available: true }));
        assert_eq!(*log.lock().unwrap(), ["characteristic", "service", "device", "root"]);
    }

    #[test]
    fn removed_listeners_are_not_called() {
        let root = EventRoute::root();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = root.own().add(EventKind::AvailabilityChanged, recorder(&log, "root"));

        assert!(root.own().remove(id));
        assert!(!root.own().remove(id));
        root.dispatch(Event::new(
            EventKind::AvailabilityChanged,
            EventTarget::Bluetooth { available: false },
        ));
        assert!(log.lock().unwrap().is_empty());
    }
}
