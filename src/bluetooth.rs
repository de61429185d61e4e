use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use futures_core::Stream;
use futures_lite::StreamExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::Backend;
use crate::discovery::{self, DeviceRequest, DeviceSelector, ScanSession, ScanSlot};
use crate::error::ErrorKind;
use crate::events::{Event, EventKind, EventRoute, EventTarget, ListenerId};
use crate::options::{BluetoothOptions, RequestDeviceOptions};
use crate::{AdapterInfo, Device, DeviceId, DiscoveredPeripheral, Error, Result};

/// State shared by a [`Bluetooth`] instance and every object it hands out.
#[derive(Debug)]
pub(crate) struct Context {
    pub backend: Backend,
    pub events: EventRoute,
    pub scan: ScanSlot,
}

pub(crate) type DeviceFoundFn = Arc<dyn Fn(&Device, DeviceSelector) -> bool + Send + Sync>;
type FilterFn = Arc<dyn Fn(&DiscoveredPeripheral) -> bool + Send + Sync>;

#[derive(Debug, Default)]
struct AllowList {
    active: usize,
    devices: HashMap<usize, HashMap<DeviceId, Device>>,
}

/// The devices granted to a [`Bluetooth`] instance, per adapter.
#[derive(Debug, Default)]
pub(crate) struct Registry(Mutex<AllowList>);

impl Registry {
    fn active(&self) -> usize {
        self.0.lock().unwrap().active
    }

    fn get(&self, id: &DeviceId) -> Option<Device> {
        let list = self.0.lock().unwrap();
        list.devices.get(&list.active).and_then(|x| x.get(id)).cloned()
    }

    fn insert(&self, device: &Device) {
        let mut list = self.0.lock().unwrap();
        let active = list.active;
        list.devices
            .entry(active)
            .or_default()
            .insert(device.id().clone(), device.clone());
    }

    /// Removes `id` from the allow-list of `adapter`. Returns whether it was present.
    pub fn remove(&self, adapter: usize, id: &DeviceId) -> bool {
        let mut list = self.0.lock().unwrap();
        list.devices.get_mut(&adapter).is_some_and(|x| x.remove(id).is_some())
    }
}

/// The entry point: discovers devices through a [`Backend`] and keeps track of the ones granted to it.
///
/// Cloning is cheap and yields a handle to the same instance.
#[derive(Clone)]
pub struct Bluetooth(Arc<BluetoothInner>);

struct BluetoothInner {
    ctx: Arc<Context>,
    options: BluetoothOptions,
    registry: Arc<Registry>,
    device_found: Mutex<Option<DeviceFoundFn>>,
    filter: Mutex<Option<FilterFn>>,
}

impl std::fmt::Debug for Bluetooth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bluetooth")
            .field("backend", &self.0.ctx.backend)
            .field("options", &self.0.options)
            .finish_non_exhaustive()
    }
}

impl Bluetooth {
    /// Creates an instance over `backend`, switching to the configured adapter if one is set.
    pub async fn new(mut backend: Backend, options: BluetoothOptions) -> Result<Self> {
        backend.set_write_settle_delay(options.write_settle_delay);
        if let Some(index) = options.adapter_index {
            backend.use_adapter(index).await?;
        }

        let ctx = Arc::new(Context {
            backend,
            events: EventRoute::root(),
            scan: ScanSlot::default(),
        });

        let route = ctx.events.clone();
        ctx.backend.set_availability_listener(Arc::new(move |available| {
            route.dispatch(Event::new(
                EventKind::AvailabilityChanged,
                EventTarget::Bluetooth { available },
            ))
        }));

        let registry = Registry::default();
        registry.0.lock().unwrap().active = options.adapter_index.unwrap_or(0);

        Ok(Bluetooth(Arc::new(BluetoothInner {
            ctx,
            options,
            registry: Arc::new(registry),
            device_found: Mutex::new(None),
            filter: Mutex::new(None),
        })))
    }

    /// The options this instance was created with.
    pub fn options(&self) -> &BluetoothOptions {
        &self.0.options
    }

    /// Whether the Bluetooth radio is available.
    ///
    /// May wait for the backend to report its initial power state.
    pub async fn get_availability(&self) -> bool {
        self.0.ctx.backend.get_enabled().await
    }

    /// Scans for a single device accepted by `options`.
    ///
    /// Without a [device-found callback][Self::set_device_found] the first accepted device is returned. The device is
    /// added to the allow-list of this instance.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::InvalidParameter`] if `options` are invalid. Nothing is scanned in that case.
    /// - [`ErrorKind::RequestInProgress`] if another request is scanning.
    /// - [`ErrorKind::NoDevicesFound`] if no device was accepted within the scan time.
    /// - [`ErrorKind::Cancelled`] if [`cancel_request`][Self::cancel_request] was called.
    pub async fn request_device(&self, options: RequestDeviceOptions) -> Result<Device> {
        discovery::request_device(self, &options).await
    }

    /// Scans for the whole scan time and returns the devices seen that are on the allow-list of this instance (or
    /// every device seen if [`allow_all_devices`][BluetoothOptions::allow_all_devices] is set).
    pub async fn get_devices(&self) -> Result<Vec<Device>> {
        discovery::get_devices(self).await
    }

    /// Scans without time limit, yielding every device accepted by `options` once per scan.
    ///
    /// Yielded devices are added to the allow-list. Scanning stops when the stream is dropped or the request is
    /// [cancelled][Self::cancel_request], which also ends the stream.
    pub async fn scan(&self, options: RequestDeviceOptions) -> Result<impl Stream<Item = Device> + Send + 'static> {
        let request = DeviceRequest::new(&options)?;
        let session = ScanSession::begin(&self.0.ctx)?;

        let (found_tx, found_rx) = async_channel::unbounded();
        session.start(&request.search_services(), found_tx).await?;

        let this = self.clone();
        Ok(found_rx.filter_map(move |peripheral| {
            let _scanning = &session;
            let device = this.accept(&request, peripheral)?;
            this.allow(&device);
            Some(device)
        }))
    }

    /// Stops the request currently scanning, if any.
    ///
    /// A pending [`request_device`][Self::request_device] fails with [`ErrorKind::Cancelled`]; a pending
    /// [`get_devices`][Self::get_devices] returns the devices found so far.
    pub fn cancel_request(&self) {
        if self.0.ctx.scan.cancel() {
            self.0.ctx.backend.stop_scan();
            debug!("request cancelled");
        }
    }

    /// The radios known to the backend.
    pub async fn adapters(&self) -> Result<Vec<AdapterInfo>> {
        self.0.ctx.backend.get_adapters().await
    }

    /// Switches to the radio at `index` in [`adapters`][Self::adapters].
    ///
    /// The allow-list is kept per adapter, so devices granted on another adapter are not returned until switching
    /// back.
    pub async fn use_adapter(&self, index: usize) -> Result<()> {
        if self.0.ctx.scan.is_active() {
            return Err(Error::new(
                ErrorKind::RequestInProgress,
                None,
                "cannot switch adapters while scanning",
            ));
        }
        self.0.ctx.backend.use_adapter(index).await?;
        self.0.registry.0.lock().unwrap().active = index;
        info!("using adapter {}", index);
        Ok(())
    }

    /// Installs the callback deciding which device [`request_device`][Self::request_device] returns.
    ///
    /// It is called for every accepted device. Returning `true` selects the device. Otherwise scanning continues and
    /// the [`DeviceSelector`] may be used to select the device later.
    pub fn set_device_found<F>(&self, callback: F)
    where
        F: Fn(&Device, DeviceSelector) -> bool + Send + Sync + 'static,
    {
        *self.0.device_found.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Installs a predicate applied to every discovery before the request filters.
    pub fn set_filter<F>(&self, filter: F)
    where
        F: Fn(&DiscoveredPeripheral) -> bool + Send + Sync + 'static,
    {
        *self.0.filter.lock().unwrap() = Some(Arc::new(filter));
    }

    /// Registers a listener for events of `kind` dispatched on this instance, including those bubbling up from
    /// devices, services and characteristics.
    pub fn add_event_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.0.ctx.events.own().add(kind, Arc::new(listener))
    }

    /// Removes a listener. Returns `false` if it was not registered on this instance.
    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.0.ctx.events.own().remove(id)
    }

    pub(crate) fn context(&self) -> &Arc<Context> {
        &self.0.ctx
    }

    pub(crate) fn device_found(&self) -> Option<DeviceFoundFn> {
        self.0.device_found.lock().unwrap().clone()
    }

    /// Runs `peripheral` through the filter callback and `request`, returning the device if it is accepted.
    ///
    /// A device already on the allow-list is reused: its advertisement is superseded and `advertisementreceived` is
    /// fired on it.
    pub(crate) fn accept(&self, request: &DeviceRequest, peripheral: DiscoveredPeripheral) -> Option<Device> {
        let filter = self.0.filter.lock().unwrap().clone();
        if filter.is_some_and(|filter| !filter(&peripheral)) {
            return None;
        }

        if let Some(device) = self.0.registry.get(&peripheral.id) {
            let allowed = request.matches(&peripheral);
            device.advertised(peripheral);
            let allowed = allowed?;
            device.allow_services(&allowed);
            return Some(device);
        }

        let allowed = request.matches(&peripheral)?;
        Some(self.device(peripheral, allowed))
    }

    fn device(&self, peripheral: DiscoveredPeripheral, allowed: Vec<Uuid>) -> Device {
        let registry: Weak<Registry> = Arc::downgrade(&self.0.registry);
        Device::new(&self.0.ctx, peripheral, allowed, registry, self.0.registry.active())
    }

    pub(crate) fn allow(&self, device: &Device) {
        self.0.registry.insert(device);
    }

    pub(crate) fn is_allowed(&self, id: &DeviceId) -> bool {
        self.0.registry.get(id).is_some()
    }
}
