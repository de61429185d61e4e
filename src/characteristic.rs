use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::backend::CharacteristicInfo;
use crate::bluetooth::Context;
use crate::btuuid::{descriptor_uuid, UuidInput};
use crate::events::{Event, EventKind, EventRoute, EventTarget, ListenerId};
use crate::handles::{Handle, ValueCallback};
use crate::service::ServiceInner;
use crate::util::exactly_one;
use crate::{CharacteristicProperties, Descriptor, Result, Service, Uuid};

/// A Bluetooth GATT characteristic
#[derive(Clone)]
pub struct Characteristic(pub(crate) Arc<CharacteristicInner>);

pub(crate) struct CharacteristicInner {
    handle: Handle,
    uuid: Uuid,
    properties: CharacteristicProperties,
    service: Weak<ServiceInner>,
    ctx: Arc<Context>,
    route: EventRoute,
    value: Mutex<Option<Vec<u8>>>,
    notifying: AtomicBool,
    descriptors: Mutex<Option<Vec<Descriptor>>>,
    discovery: async_lock::Mutex<()>,
}

impl std::fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Characteristic")
            .field("uuid", &self.0.uuid)
            .field("properties", &self.0.properties)
            .field("handle", &self.0.handle)
            .finish()
    }
}

impl PartialEq for Characteristic {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Characteristic {}

impl Characteristic {
    pub(crate) fn new(service: &Service, ctx: &Arc<Context>, info: CharacteristicInfo) -> Self {
        Characteristic(Arc::new(CharacteristicInner {
            handle: info.handle,
            uuid: info.uuid,
            properties: info.properties,
            service: Arc::downgrade(&service.0),
            ctx: ctx.clone(),
            route: service.0.route.child(),
            value: Mutex::new(None),
            notifying: AtomicBool::new(false),
            descriptors: Mutex::new(None),
            discovery: async_lock::Mutex::new(()),
        }))
    }

    /// The [`Uuid`] identifying the type of this GATT characteristic
    pub fn uuid(&self) -> Uuid {
        self.0.uuid
    }

    /// The properties of this this GATT characteristic.
    ///
    /// Characteristic properties indicate which operations (e.g. read, write, notify, etc) may be performed on this
    /// characteristic.
    pub fn properties(&self) -> CharacteristicProperties {
        self.0.properties
    }

    /// The last value read, written or notified, if any
    pub fn value(&self) -> Option<Vec<u8>> {
        self.0.value.lock().unwrap().clone()
    }

    /// The service this characteristic belongs to, if it still exists.
    pub fn service(&self) -> Option<Service> {
        self.0.service.upgrade().map(Service)
    }

    /// Whether notifications or indications are enabled
    pub fn is_notifying(&self) -> bool {
        self.0.notifying.load(Ordering::Acquire)
    }

    /// Reads the value of this characteristic from the device.
    ///
    /// The value is stored and `characteristicvaluechanged` is fired.
    pub async fn read_value(&self) -> Result<Vec<u8>> {
        let value = self.0.ctx.backend.read_characteristic(self.0.handle).await?;
        self.set_value(value.clone(), true);
        Ok(value)
    }

    /// Writes `value`, with or without response depending on the characteristic's properties.
    ///
    /// The value is stored but no event is fired.
    pub async fn write_value(&self, value: &[u8]) -> Result<()> {
        self.write(value, None).await
    }

    /// Writes `value` and waits for the device to confirm the write.
    pub async fn write_value_with_response(&self, value: &[u8]) -> Result<()> {
        self.write(value, Some(false)).await
    }

    /// Writes `value` without requesting a response.
    pub async fn write_value_without_response(&self, value: &[u8]) -> Result<()> {
        self.write(value, Some(true)).await
    }

    async fn write(&self, value: &[u8], without_response: Option<bool>) -> Result<()> {
        self.0
            .ctx
            .backend
            .write_characteristic(self.0.handle, value, without_response)
            .await?;
        self.set_value(value.to_vec(), false);
        Ok(())
    }

    /// Enables notifications or indications.
    ///
    /// Every value sent by the device is stored and fires `characteristicvaluechanged` on this characteristic, its
    /// service, its device and the [`Bluetooth`][crate::Bluetooth] instance, in that order. Calling this again while
    /// subscribed does not subscribe a second time.
    pub async fn start_notifications(&self) -> Result<()> {
        let characteristic = Arc::downgrade(&self.0);
        let callback: ValueCallback = Arc::new(move |value| {
            if let Some(characteristic) = characteristic.upgrade() {
                Characteristic(characteristic).set_value(value, true);
            }
        });

        self.0.ctx.backend.enable_notify(self.0.handle, callback).await?;
        self.0.notifying.store(true, Ordering::Release);
        debug!("notifications enabled for {}", self.0.uuid);
        Ok(())
    }

    /// Disables notifications or indications. Does nothing if they are not enabled.
    pub async fn stop_notifications(&self) -> Result<()> {
        if !self.is_notifying() {
            return Ok(());
        }
        self.0.ctx.backend.disable_notify(self.0.handle).await?;
        self.0.notifying.store(false, Ordering::Release);
        debug!("notifications disabled for {}", self.0.uuid);
        Ok(())
    }

    /// The descriptor identified by `uuid`.
    ///
    /// Fails with [`ErrorKind::NotFound`][crate::error::ErrorKind::NotFound] unless exactly one descriptor of this
    /// characteristic has that UUID.
    pub async fn get_descriptor(&self, uuid: impl Into<UuidInput>) -> Result<Descriptor> {
        let uuid = descriptor_uuid(uuid)?;
        let descriptors = self.get_descriptors_with_uuid(uuid).await?;
        exactly_one(descriptors, "descriptor", &uuid)
    }

    /// All descriptors of this characteristic. Discovered once and cached.
    pub async fn get_descriptors(&self) -> Result<Vec<Descriptor>> {
        let _discovery = self.0.discovery.lock().await;
        if let Some(descriptors) = self.0.descriptors.lock().unwrap().clone() {
            return Ok(descriptors);
        }

        let discovered = self.0.ctx.backend.discover_descriptors(self.0.handle, &[]).await?;
        let descriptors: Vec<Descriptor> = discovered
            .into_iter()
            .map(|info| Descriptor::new(self, &self.0.ctx, info))
            .collect();
        *self.0.descriptors.lock().unwrap() = Some(descriptors.clone());
        Ok(descriptors)
    }

    /// The descriptors of this characteristic identified by `uuid`.
    pub async fn get_descriptors_with_uuid(&self, uuid: impl Into<UuidInput>) -> Result<Vec<Descriptor>> {
        let uuid = descriptor_uuid(uuid)?;
        let mut descriptors = self.get_descriptors().await?;
        descriptors.retain(|x| x.uuid() == uuid);
        Ok(descriptors)
    }

    /// Registers a listener for events of `kind` dispatched on this characteristic.
    pub fn add_event_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.0.route.own().add(kind, Arc::new(listener))
    }

    /// Removes a listener. Returns `false` if it was not registered on this characteristic.
    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.0.route.own().remove(id)
    }

    pub(crate) fn unsubscribed(&self) {
        self.0.notifying.store(false, Ordering::Release);
    }

    fn set_value(&self, value: Vec<u8>, changed: bool) {
        *self.0.value.lock().unwrap() = Some(value);
        if changed {
            self.0.route.dispatch(Event::new(
                EventKind::CharacteristicValueChanged,
                EventTarget::Characteristic(self.clone()),
            ));
        }
    }
}
