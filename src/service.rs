use std::sync::{Arc, Mutex, Weak};

use crate::backend::ServiceInfo;
use crate::bluetooth::Context;
use crate::btuuid::{characteristic_uuid, service_uuid, UuidInput};
use crate::device::DeviceInner;
use crate::error::ErrorKind;
use crate::events::{Event, EventKind, EventRoute, EventTarget, ListenerId};
use crate::handles::Handle;
use crate::util::exactly_one;
use crate::{Characteristic, Device, Error, Result, Uuid};

/// A Bluetooth GATT service
#[derive(Clone)]
pub struct Service(pub(crate) Arc<ServiceInner>);

pub(crate) struct ServiceInner {
    handle: Handle,
    uuid: Uuid,
    primary: bool,
    device: Weak<DeviceInner>,
    ctx: Arc<Context>,
    pub(crate) route: EventRoute,
    characteristics: Mutex<Option<Vec<Characteristic>>>,
    included: Mutex<Option<Vec<Service>>>,
    discovery: async_lock::Mutex<()>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("uuid", &self.0.uuid)
            .field("primary", &self.0.primary)
            .field("handle", &self.0.handle)
            .finish()
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Service {}

impl Service {
    /// Creates the service and fires `serviceadded` on it.
    pub(crate) fn new(device: &Device, ctx: &Arc<Context>, info: ServiceInfo) -> Self {
        let service = Service(Arc::new(ServiceInner {
            handle: info.handle,
            uuid: info.uuid,
            primary: info.primary,
            device: Arc::downgrade(&device.0),
            ctx: ctx.clone(),
            route: device.0.route.child(),
            characteristics: Mutex::new(None),
            included: Mutex::new(None),
            discovery: async_lock::Mutex::new(()),
        }));
        service.dispatch(EventKind::ServiceAdded);
        service
    }

    /// The [`Uuid`] identifying the type of this GATT service
    pub fn uuid(&self) -> Uuid {
        self.0.uuid
    }

    /// Whether this is a primary service rather than one included by another service
    pub fn is_primary(&self) -> bool {
        self.0.primary
    }

    /// The device this service belongs to, if it still exists.
    pub fn device(&self) -> Option<Device> {
        self.0.device.upgrade().map(Device::from_inner)
    }

    /// The characteristic identified by `uuid`.
    ///
    /// Fails with [`ErrorKind::NotFound`] unless exactly one characteristic of this
    /// service has that UUID.
    pub async fn get_characteristic(&self, uuid: impl Into<UuidInput>) -> Result<Characteristic> {
        let uuid = characteristic_uuid(uuid)?;
        let characteristics = self.get_characteristics_with_uuid(uuid).await?;
        exactly_one(characteristics, "characteristic", &uuid)
    }

    /// All characteristics of this service. Discovered once and cached.
    pub async fn get_characteristics(&self) -> Result<Vec<Characteristic>> {
        let _discovery = self.0.discovery.lock().await;
        if let Some(characteristics) = self.0.characteristics.lock().unwrap().clone() {
            return Ok(characteristics);
        }

        let discovered = self.0.ctx.backend.discover_characteristics(self.0.handle, &[]).await?;
        let characteristics: Vec<Characteristic> = discovered
            .into_iter()
            .map(|info| Characteristic::new(self, &self.0.ctx, info))
            .collect();
        *self.0.characteristics.lock().unwrap() = Some(characteristics.clone());
        Ok(characteristics)
    }

    /// The characteristics of this service identified by `uuid`.
    pub async fn get_characteristics_with_uuid(&self, uuid: impl Into<UuidInput>) -> Result<Vec<Characteristic>> {
        let uuid = characteristic_uuid(uuid)?;
        let mut characteristics = self.get_characteristics().await?;
        characteristics.retain(|x| x.uuid() == uuid);
        Ok(characteristics)
    }

    /// The included service identified by `uuid`.
    ///
    /// Fails with [`ErrorKind::NotFound`] unless exactly one included service has
    /// that UUID.
    pub async fn get_included_service(&self, uuid: impl Into<UuidInput>) -> Result<Service> {
        let uuid = service_uuid(uuid)?;
        let services = self.get_included_services_with_uuid(uuid).await?;
        exactly_one(services, "included service", &uuid)
    }

    /// All services included by this service. Discovered once and cached.
    pub async fn get_included_services(&self) -> Result<Vec<Service>> {
        let _discovery = self.0.discovery.lock().await;
        if let Some(included) = self.0.included.lock().unwrap().clone() {
            return Ok(included);
        }

        let device = self
            .device()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, None, "device no longer exists"))?;
        let discovered = self
            .0
            .ctx
            .backend
            .discover_included_services(self.0.handle, &[])
            .await?;
        let included: Vec<Service> = discovered
            .into_iter()
            .map(|info| Service::new(&device, &self.0.ctx, info))
            .collect();
        *self.0.included.lock().unwrap() = Some(included.clone());
        Ok(included)
    }

    /// The services included by this service identified by `uuid`.
    pub async fn get_included_services_with_uuid(&self, uuid: impl Into<UuidInput>) -> Result<Vec<Service>> {
        let uuid = service_uuid(uuid)?;
        let mut services = self.get_included_services().await?;
        services.retain(|x| x.uuid() == uuid);
        Ok(services)
    }

    /// Registers a listener for events of `kind` dispatched on this service, including those bubbling up from its
    /// characteristics.
    pub fn add_event_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.0.route.own().add(kind, Arc::new(listener))
    }

    /// Removes a listener. Returns `false` if it was not registered on this service.
    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.0.route.own().remove(id)
    }

    /// Clears the notification state of every cached characteristic, including those of included services.
    pub(crate) fn unsubscribed(&self) {
        let characteristics = self.0.characteristics.lock().unwrap().clone().unwrap_or_default();
        for characteristic in &characteristics {
            characteristic.unsubscribed();
        }
        let included = self.0.included.lock().unwrap().clone().unwrap_or_default();
        for service in &included {
            service.unsubscribed();
        }
    }

    pub(crate) fn dispatch(&self, kind: EventKind) {
        self.0.route.dispatch(Event::new(kind, EventTarget::Service(self.clone())));
    }
}
