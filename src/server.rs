use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::bluetooth::Context;
use crate::btuuid::{service_uuid, UuidInput};
use crate::device::DeviceInner;
use crate::error::ErrorKind;
use crate::events::EventKind;
use crate::util::{defer, exactly_one};
use crate::{Device, DeviceId, Error, Result, Service};

/// The GATT server of a [`Device`]
///
/// Holds the connection state and caches the primary services discovered during the current connection. The cache
/// is discarded whenever the device disconnects.
#[derive(Clone)]
pub struct RemoteGattServer(Arc<ServerInner>);

struct ServerInner {
    device: Weak<DeviceInner>,
    id: DeviceId,
    ctx: Arc<Context>,
    connected: AtomicBool,
    connecting: AtomicBool,
    // Bumped on every disconnect so a discovery that straddles one does not repopulate the cache.
    generation: AtomicU64,
    services: Mutex<Option<Vec<Service>>>,
    discovery: async_lock::Mutex<()>,
}

impl std::fmt::Debug for RemoteGattServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteGattServer")
            .field("device", &self.0.id)
            .field("connected", &self.connected())
            .finish()
    }
}

impl RemoteGattServer {
    pub(crate) fn new(device: Weak<DeviceInner>, id: DeviceId, ctx: Arc<Context>) -> Self {
        RemoteGattServer(Arc::new(ServerInner {
            device,
            id,
            ctx,
            connected: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            services: Mutex::new(None),
            discovery: async_lock::Mutex::new(()),
        }))
    }

    /// The device this server belongs to, if it still exists.
    pub fn device(&self) -> Option<Device> {
        self.0.device.upgrade().map(Device::from_inner)
    }

    /// Whether the device is connected
    pub fn connected(&self) -> bool {
        self.0.connected.load(Ordering::Acquire)
    }

    /// Connects to the device.
    ///
    /// The connection lasts until [`disconnect`][Self::disconnect] is called or the device disconnects on its own.
    /// Either way `gattserverdisconnected` is fired on the device.
    pub async fn connect(&self) -> Result<()> {
        if self.connected() {
            return Err(Error::new(ErrorKind::AlreadyConnected, None, "device already connected"));
        }
        if self.0.connecting.swap(true, Ordering::AcqRel) {
            return Err(Error::new(
                ErrorKind::RequestInProgress,
                None,
                "connection already in progress",
            ));
        }
        let _connecting = defer(|| self.0.connecting.store(false, Ordering::Release));

        let generation = self.0.generation.load(Ordering::Acquire);
        let server = Arc::downgrade(&self.0);
        self.0
            .ctx
            .backend
            .connect(
                &self.0.id,
                Box::new(move || {
                    if let Some(server) = server.upgrade() {
                        server.disconnected();
                    }
                }),
            )
            .await?;

        // The disconnect callback has already run if the link dropped while connecting.
        if self.0.generation.load(Ordering::Acquire) != generation {
            return Err(Error::new(
                ErrorKind::ConnectionFailed,
                None,
                "device disconnected while connecting",
            ));
        }
        self.0.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Disconnects from the device. Does nothing if it is not connected.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.connected() {
            return Ok(());
        }
        self.0.ctx.backend.disconnect(&self.0.id).await
    }

    /// The primary service identified by `uuid`.
    ///
    /// Fails with [`ErrorKind::NotFound`] unless exactly one primary service has that UUID.
    pub async fn get_primary_service(&self, uuid: impl Into<UuidInput>) -> Result<Service> {
        let uuid = service_uuid(uuid)?;
        let services = self.get_primary_services_with_uuid(uuid).await?;
        exactly_one(services, "service", &uuid)
    }

    /// All primary services of the device.
    ///
    /// Services are discovered on the first call during a connection and cached until the device disconnects.
    pub async fn get_primary_services(&self) -> Result<Vec<Service>> {
        if !self.connected() {
            return Err(Error::new(ErrorKind::NotConnected, None, "device not connected"));
        }

        let _discovery = self.0.discovery.lock().await;
        if let Some(services) = self.0.services.lock().unwrap().clone() {
            return Ok(services);
        }

        let device = self
            .device()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, None, "device no longer exists"))?;
        let generation = self.0.generation.load(Ordering::Acquire);
        let discovered = self.0.ctx.backend.discover_services(&self.0.id, &[]).await?;
        let services: Vec<Service> = discovered
            .into_iter()
            .map(|info| Service::new(&device, &self.0.ctx, info))
            .collect();
        debug!("discovered {} services on {}", services.len(), self.0.id);

        let mut cache = self.0.services.lock().unwrap();
        if self.connected() && self.0.generation.load(Ordering::Acquire) == generation {
            *cache = Some(services.clone());
        }
        Ok(services)
    }

    /// The primary services identified by `uuid`.
    pub async fn get_primary_services_with_uuid(&self, uuid: impl Into<UuidInput>) -> Result<Vec<Service>> {
        let uuid = service_uuid(uuid)?;
        let mut services = self.get_primary_services().await?;
        services.retain(|x| x.uuid() == uuid);
        Ok(services)
    }
}

impl ServerInner {
    fn disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        let services = self.services.lock().unwrap().take().unwrap_or_default();

        for service in &services {
            service.unsubscribed();
            service.dispatch(EventKind::ServiceRemoved);
        }
        if let Some(device) = self.device.upgrade() {
            Device::from_inner(device).dispatch(EventKind::GattServerDisconnected);
        }
    }
}
