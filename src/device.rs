use std::sync::{Arc, Mutex, Weak};

use tracing::debug;
use uuid::Uuid;

use crate::bluetooth::{Context, Registry};
use crate::events::{Event, EventKind, EventRoute, EventTarget, ListenerId};
use crate::server::RemoteGattServer;
use crate::{AdvertisementData, DeviceId, DiscoveredPeripheral, Result};

/// A Bluetooth LE device
///
/// Cloning is cheap. Clones share the advertisement, the GATT server and the event listeners.
#[derive(Clone)]
pub struct Device(pub(crate) Arc<DeviceInner>);

pub(crate) struct DeviceInner {
    id: DeviceId,
    peripheral: Mutex<DiscoveredPeripheral>,
    allowed_services: Mutex<Vec<Uuid>>,
    pub(crate) route: EventRoute,
    gatt: RemoteGattServer,
    registry: Weak<Registry>,
    adapter: usize,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.0.id)
            .field("name", &self.name())
            .finish()
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Device {}

impl std::hash::Hash for Device {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl Device {
    pub(crate) fn new(
        ctx: &Arc<Context>,
        peripheral: DiscoveredPeripheral,
        allowed_services: Vec<Uuid>,
        registry: Weak<Registry>,
        adapter: usize,
    ) -> Self {
        let id = peripheral.id.clone();
        Device(Arc::new_cyclic(|device| DeviceInner {
            gatt: RemoteGattServer::new(device.clone(), id.clone(), ctx.clone()),
            id,
            peripheral: Mutex::new(peripheral),
            allowed_services: Mutex::new(allowed_services),
            route: ctx.events.child(),
            registry,
            adapter,
        }))
    }

    pub(crate) fn from_inner(inner: Arc<DeviceInner>) -> Self {
        Device(inner)
    }

    /// This device's unique identifier
    pub fn id(&self) -> &DeviceId {
        &self.0.id
    }

    /// The advertised local name, or a placeholder naming the id if the device did not advertise one.
    pub fn name(&self) -> String {
        match &self.0.peripheral.lock().unwrap().name {
            Some(name) => name.clone(),
            None => format!("Unknown or Unsupported Device ({})", self.0.id),
        }
    }

    /// The most recent advertisement received from this device
    pub fn adv_data(&self) -> AdvertisementData {
        self.0.peripheral.lock().unwrap().adv_data.clone()
    }

    /// The services named by the request that granted this device, in its filters or optional services.
    pub fn allowed_services(&self) -> Vec<Uuid> {
        self.0.allowed_services.lock().unwrap().clone()
    }

    /// This device's GATT server
    pub fn gatt(&self) -> &RemoteGattServer {
        &self.0.gatt
    }

    /// Removes this device from the allow-list of the [`Bluetooth`][crate::Bluetooth] instance that granted it,
    /// disconnecting it first if it is connected.
    pub async fn forget(&self) -> Result<()> {
        if self.0.gatt.connected() {
            self.0.gatt.disconnect().await?;
        }
        if let Some(registry) = self.0.registry.upgrade() {
            if registry.remove(self.0.adapter, &self.0.id) {
                debug!("forgot {}", self.0.id);
            }
        }
        Ok(())
    }

    /// Registers a listener for events of `kind` dispatched on this device, including those bubbling up from its
    /// services and characteristics.
    pub fn add_event_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.0.route.own().add(kind, Arc::new(listener))
    }

    /// Removes a listener. Returns `false` if it was not registered on this device.
    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.0.route.own().remove(id)
    }

    /// Supersedes the advertisement with a newer sighting and fires `advertisementreceived`.
    pub(crate) fn advertised(&self, peripheral: DiscoveredPeripheral) {
        *self.0.peripheral.lock().unwrap() = peripheral;
        self.dispatch(EventKind::AdvertisementReceived);
    }

    pub(crate) fn allow_services(&self, services: &[Uuid]) {
        let mut allowed = self.0.allowed_services.lock().unwrap();
        for uuid in services {
            if !allowed.contains(uuid) {
                allowed.push(*uuid);
            }
        }
    }

    pub(crate) fn dispatch(&self, kind: EventKind) {
        self.0.route.dispatch(Event::new(kind, EventTarget::Device(self.clone())));
    }
}
