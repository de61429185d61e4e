use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::handles::{Handle, ValueCallback};
use crate::native::{EventStack, HandleStack};
use crate::{AdapterInfo, CharacteristicProperties, DeviceId, DiscoveredPeripheral, Result};

mod handle;
mod stream;

pub use handle::HandleBackend;
pub use stream::StreamBackend;

pub(crate) type FoundCallback = Arc<dyn Fn(DiscoveredPeripheral) + Send + Sync>;
pub(crate) type DisconnectFn = Box<dyn FnOnce() + Send>;
pub(crate) type AvailabilityFn = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServiceInfo {
    pub handle: Handle,
    pub uuid: Uuid,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CharacteristicInfo {
    pub handle: Handle,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DescriptorInfo {
    pub handle: Handle,
    pub uuid: Uuid,
}

/// A native stack adapted to the operations the GATT object graph needs.
///
/// The variant is chosen when the backend is constructed and fixed for its lifetime.
#[derive(Debug)]
pub enum Backend {
    /// A stack that reports radio activity as events.
    EventStream(StreamBackend),
    /// A stack with a synchronous, UUID-path addressed API.
    SyncHandle(HandleBackend),
}

impl Backend {
    /// Wraps an [`EventStack`].
    pub fn event_stream(stack: Arc<dyn EventStack>) -> Self {
        Backend::EventStream(StreamBackend::new(stack))
    }

    /// Wraps a [`HandleStack`], selecting its first adapter.
    ///
    /// Fails if the stack reports no adapters.
    pub fn sync_handle(stack: Arc<dyn HandleStack>) -> Result<Self> {
        HandleBackend::new(stack).map(Backend::SyncHandle)
    }

    pub(crate) fn set_write_settle_delay(&mut self, delay: Option<Duration>) {
        if let Backend::EventStream(backend) = self {
            backend.set_write_settle_delay(delay);
        }
    }

    pub(crate) fn set_availability_listener(&self, listener: AvailabilityFn) {
        match self {
            Backend::EventStream(backend) => backend.set_availability_listener(listener),
            // The handle API has no power state notifications.
            Backend::SyncHandle(_) => {}
        }
    }

    #[inline]
    pub(crate) async fn get_enabled(&self) -> bool {
        match self {
            Backend::EventStream(backend) => backend.get_enabled().await,
            Backend::SyncHandle(backend) => backend.get_enabled(),
        }
    }

    #[inline]
    pub(crate) async fn get_adapters(&self) -> Result<Vec<AdapterInfo>> {
        match self {
            Backend::EventStream(backend) => backend.get_adapters().await,
            Backend::SyncHandle(backend) => Ok(backend.get_adapters()),
        }
    }

    #[inline]
    pub(crate) async fn use_adapter(&self, index: usize) -> Result<()> {
        match self {
            Backend::EventStream(backend) => backend.use_adapter(index).await,
            Backend::SyncHandle(backend) => backend.use_adapter(index),
        }
    }

    #[inline]
    pub(crate) async fn start_scan(&self, services: &[Uuid], found: FoundCallback) -> Result<()> {
        match self {
            Backend::EventStream(backend) => backend.start_scan(services, found).await,
            Backend::SyncHandle(backend) => backend.start_scan(services, found),
        }
    }

    #[inline]
    pub(crate) fn stop_scan(&self) {
        match self {
            Backend::EventStream(backend) => backend.stop_scan(),
            Backend::SyncHandle(backend) => backend.stop_scan(),
        }
    }

    #[inline]
    pub(crate) async fn connect(&self, id: &DeviceId, on_disconnect: DisconnectFn) -> Result<()> {
        match self {
            Backend::EventStream(backend) => backend.connect(id, on_disconnect).await,
            Backend::SyncHandle(backend) => backend.connect(id, on_disconnect),
        }
    }

    #[inline]
    pub(crate) async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        match self {
            Backend::EventStream(backend) => backend.disconnect(id).await,
            Backend::SyncHandle(backend) => backend.disconnect(id),
        }
    }

    #[inline]
    pub(crate) async fn discover_services(&self, id: &DeviceId, uuids: &[Uuid]) -> Result<Vec<ServiceInfo>> {
        match self {
            Backend::EventStream(backend) => backend.discover_services(id, uuids).await,
            Backend::SyncHandle(backend) => backend.discover_services(id, uuids),
        }
    }

    #[inline]
    pub(crate) async fn discover_included_services(&self, service: Handle, uuids: &[Uuid]) -> Result<Vec<ServiceInfo>> {
        match self {
            Backend::EventStream(backend) => backend.discover_included_services(service, uuids).await,
            Backend::SyncHandle(backend) => backend.discover_included_services(service, uuids),
        }
    }

    #[inline]
    pub(crate) async fn discover_characteristics(
        &self,
        service: Handle,
        uuids: &[Uuid],
    ) -> Result<Vec<CharacteristicInfo>> {
        match self {
            Backend::EventStream(backend) => backend.discover_characteristics(service, uuids).await,
            Backend::SyncHandle(backend) => backend.discover_characteristics(service, uuids),
        }
    }

    #[inline]
    pub(crate) async fn discover_descriptors(
        &self,
        characteristic: Handle,
        uuids: &[Uuid],
    ) -> Result<Vec<DescriptorInfo>> {
        match self {
            Backend::EventStream(backend) => backend.discover_descriptors(characteristic, uuids).await,
            Backend::SyncHandle(backend) => backend.discover_descriptors(characteristic, uuids),
        }
    }

    #[inline]
    pub(crate) async fn read_characteristic(&self, characteristic: Handle) -> Result<Vec<u8>> {
        match self {
            Backend::EventStream(backend) => backend.read_characteristic(characteristic).await,
            Backend::SyncHandle(backend) => backend.read_characteristic(characteristic),
        }
    }

    /// Writes a characteristic. If `without_response` is `None` it is inferred from the characteristic properties.
    #[inline]
    pub(crate) async fn write_characteristic(
        &self,
        characteristic: Handle,
        data: &[u8],
        without_response: Option<bool>,
    ) -> Result<()> {
        match self {
            Backend::EventStream(backend) => {
                backend
                    .write_characteristic(characteristic, data, without_response)
                    .await
            }
            Backend::SyncHandle(backend) => backend.write_characteristic(characteristic, data, without_response),
        }
    }

    #[inline]
    pub(crate) async fn enable_notify(&self, characteristic: Handle, callback: ValueCallback) -> Result<()> {
        match self {
            Backend::EventStream(backend) => backend.enable_notify(characteristic, callback).await,
            Backend::SyncHandle(backend) => backend.enable_notify(characteristic, callback),
        }
    }

    #[inline]
    pub(crate) async fn disable_notify(&self, characteristic: Handle) -> Result<()> {
        match self {
            Backend::EventStream(backend) => backend.disable_notify(characteristic).await,
            Backend::SyncHandle(backend) => backend.disable_notify(characteristic),
        }
    }

    #[inline]
    pub(crate) async fn read_descriptor(&self, descriptor: Handle) -> Result<Vec<u8>> {
        match self {
            Backend::EventStream(backend) => backend.read_descriptor(descriptor).await,
            Backend::SyncHandle(backend) => backend.read_descriptor(descriptor),
        }
    }

    #[inline]
    pub(crate) async fn write_descriptor(&self, descriptor: Handle, data: &[u8]) -> Result<()> {
        match self {
            Backend::EventStream(backend) => backend.write_descriptor(descriptor, data).await,
            Backend::SyncHandle(backend) => backend.write_descriptor(descriptor, data),
        }
    }
}

/// Keeps the entries whose UUID is in `uuids`, or all of them if `uuids` is empty.
pub(crate) fn matches_uuid_filter(uuid: &Uuid, uuids: &[Uuid]) -> bool {
    uuids.is_empty() || uuids.contains(uuid)
}
