//! An [`EventStack`] for Linux, driving the BlueZ daemon through `bluer`
//!
//! The stack needs a Tokio runtime: it is created from within one and spawns its watcher tasks onto it.
//!
//! ```rust,no_run
//!# use webble::{Backend, Bluetooth, BluetoothOptions, StreamBackend};
//!# async fn run() -> webble::Result<()> {
//!let _teardown = webble::bluez::teardown_guard();
//!let stack = webble::bluez::stack().await?;
//!let backend = Backend::EventStream(StreamBackend::new(stack));
//!let bluetooth = Bluetooth::new(backend, BluetoothOptions::default()).await?;
//!# Ok(())
//!# }
//! ```

mod advertisement;
mod error;
mod gatt;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bluer::gatt::remote::CharacteristicWriteRequest;
use bluer::gatt::WriteOp;
use bluer::{AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty, DiscoveryFilter, DiscoveryTransport};
use futures_lite::StreamExt;
use tokio::runtime::Handle as Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use self::gatt::{Object, Objects};
use crate::error::ErrorKind;
use crate::native::{
    EventStack, NativeAdapter, NativeCharacteristic, NativeDescriptor, NativeId, NativeService, PowerState,
    StackEvent, StackListener,
};
use crate::session::{Release, Session, TeardownGuard};
use crate::{Error, Result};

static SESSION: Session<BluezStack> = Session::new();

/// The process-wide BlueZ stack, connecting to the daemon on first use.
pub async fn stack() -> Result<Arc<BluezStack>> {
    SESSION.get_or_init(BluezStack::new).await
}

/// Stops every task of the process-wide stack. Later calls to [`stack`] fail.
pub fn teardown() {
    SESSION.teardown()
}

/// A guard calling [`teardown`] when dropped.
pub fn teardown_guard() -> TeardownGuard<'static, BluezStack> {
    SESSION.teardown_guard()
}

/// The BlueZ stack
pub struct BluezStack {
    session: bluer::Session,
    runtime: Runtime,
    adapter: Mutex<bluer::Adapter>,
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    listener: Mutex<Option<StackListener>>,
    state: Mutex<Option<PowerState>>,
    objects: Mutex<Objects>,
    tasks: Mutex<Tasks>,
}

#[derive(Default)]
struct Tasks {
    power: Option<JoinHandle<()>>,
    scan: Option<JoinHandle<()>>,
    connections: HashMap<Address, JoinHandle<()>>,
    notifications: HashMap<NativeId, JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        let handles = self
            .power
            .take()
            .into_iter()
            .chain(self.scan.take())
            .chain(self.connections.drain().map(|(_, x)| x))
            .chain(self.notifications.drain().map(|(_, x)| x));
        for handle in handles {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for BluezStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluezStack")
            .field("adapter", &self.adapter.lock().unwrap().name())
            .field("state", &self.state())
            .finish()
    }
}

impl Shared {
    fn emit(&self, event: StackEvent) {
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener(event);
        }
    }

    fn set_state(&self, powered: bool) {
        let state = if powered {
            PowerState::PoweredOn
        } else {
            PowerState::PoweredOff
        };
        let changed = self.state.lock().unwrap().replace(state) != Some(state);
        if changed {
            debug!("adapter {:?}", state);
            self.emit(StackEvent::StateChange(state));
        }
    }

    /// Drops the GATT objects of `address` and stops its connection watcher and notification tasks.
    fn forget(&self, address: Address) {
        let removed = self.objects.lock().unwrap().forget(address);
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.connections.remove(&address) {
            task.abort();
        }
        for id in removed {
            if let Some(task) = tasks.notifications.remove(&id) {
                task.abort();
            }
        }
    }
}

fn parse_address(peripheral: &str) -> Result<Address> {
    peripheral.parse().map_err(|_| {
        Error::new(
            ErrorKind::InvalidParameter,
            None,
            format!("{peripheral} is not a Bluetooth address"),
        )
    })
}

impl BluezStack {
    async fn new() -> Result<Self> {
        let runtime = Runtime::try_current().map_err(|err| {
            Error::new(
                ErrorKind::Internal,
                Some(Box::new(err)),
                "the BlueZ stack requires a Tokio runtime",
            )
        })?;
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;

        let stack = BluezStack {
            session,
            runtime,
            adapter: Mutex::new(adapter.clone()),
            shared: Arc::new(Shared::default()),
        };
        stack.watch_power(adapter).await?;
        Ok(stack)
    }

    fn adapter(&self) -> bluer::Adapter {
        self.adapter.lock().unwrap().clone()
    }

    async fn watch_power(&self, adapter: bluer::Adapter) -> Result<()> {
        self.shared.set_state(adapter.is_powered().await?);

        let shared = self.shared.clone();
        let task = self.runtime.spawn(async move {
            let events = match adapter.events().await {
                Ok(events) => events,
                Err(err) => {
                    warn!("cannot watch adapter {}: {}", adapter.name(), err);
                    return;
                }
            };

            futures_lite::pin!(events);
            while let Some(event) = events.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    shared.set_state(powered);
                }
            }
        });

        if let Some(previous) = self.shared.tasks.lock().unwrap().power.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn register(&self, object: Object) -> NativeId {
        self.shared.objects.lock().unwrap().insert(object)
    }

    fn service(&self, id: NativeId) -> Result<bluer::gatt::remote::Service> {
        self.shared.objects.lock().unwrap().service(id)
    }

    fn characteristic(&self, id: NativeId) -> Result<bluer::gatt::remote::Characteristic> {
        self.shared.objects.lock().unwrap().characteristic(id)
    }

    fn descriptor(&self, id: NativeId) -> Result<bluer::gatt::remote::Descriptor> {
        self.shared.objects.lock().unwrap().descriptor(id)
    }

    async fn native_service(&self, service: bluer::gatt::remote::Service) -> Result<NativeService> {
        let uuid = service.uuid().await?;
        let id = self.register(Object::Service(service));
        Ok(NativeService { id, uuid })
    }
}

#[async_trait]
impl EventStack for BluezStack {
    fn set_listener(&self, listener: StackListener) {
        *self.shared.listener.lock().unwrap() = Some(listener);
    }

    fn state(&self) -> PowerState {
        self.shared.state.lock().unwrap().unwrap_or(PowerState::Unknown)
    }

    async fn adapters(&self) -> Result<Vec<NativeAdapter>> {
        let mut adapters = Vec::new();
        for name in self.session.adapter_names().await? {
            let address = self.session.adapter(&name)?.address().await.ok();
            adapters.push(NativeAdapter {
                identifier: name,
                address: address.map(|x| x.to_string()),
            });
        }
        Ok(adapters)
    }

    async fn use_adapter(&self, index: usize) -> Result<()> {
        let names = self.session.adapter_names().await?;
        let name = names.get(index).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidParameter,
                None,
                format!("no adapter at index {index}, {} available", names.len()),
            )
        })?;

        self.stop_scanning();
        let adapter = self.session.adapter(name)?;
        *self.adapter.lock().unwrap() = adapter.clone();
        self.watch_power(adapter).await
    }

    async fn start_scanning(&self, services: &[Uuid], allow_duplicates: bool) -> Result<()> {
        let adapter = self.adapter();
        adapter
            .set_discovery_filter(DiscoveryFilter {
                uuids: services.iter().copied().collect::<HashSet<_>>(),
                transport: DiscoveryTransport::Le,
                duplicate_data: allow_duplicates,
                ..Default::default()
            })
            .await?;

        let (ready_tx, ready_rx) = async_channel::bounded(1);
        let shared = self.shared.clone();
        let task = self.runtime.spawn(async move {
            let events = match adapter.discover_devices().await {
                Ok(events) => {
                    let _ = ready_tx.send(Ok(())).await;
                    events
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err)).await;
                    return;
                }
            };

            futures_lite::pin!(events);
            while let Some(event) = events.next().await {
                if let AdapterEvent::DeviceAdded(address) = event {
                    match advertisement::peripheral(&adapter, address).await {
                        Ok(peripheral) => shared.emit(StackEvent::Discover(peripheral)),
                        Err(err) => debug!("skipping {address}: {err}"),
                    }
                }
            }
        });

        if let Some(previous) = self.shared.tasks.lock().unwrap().scan.replace(task) {
            previous.abort();
        }

        match ready_rx.recv().await {
            Ok(res) => res.map_err(Into::into),
            Err(_) => Err(Error::new(ErrorKind::Internal, None, "scan task ended before scanning began")),
        }
    }

    fn stop_scanning(&self) {
        // Dropping the discovery stream inside the task ends the BlueZ discovery session.
        if let Some(task) = self.shared.tasks.lock().unwrap().scan.take() {
            task.abort();
        }
    }

    async fn connect(&self, peripheral: &str) -> Result<()> {
        let address = parse_address(peripheral)?;
        let device = self.adapter().device(address)?;
        device.connect().await?;

        let shared = self.shared.clone();
        let id = peripheral.to_string();
        let task = self.runtime.spawn(async move {
            let events = match device.events().await {
                Ok(events) => events,
                Err(err) => {
                    warn!("cannot watch connection to {}: {}", id, err);
                    return;
                }
            };

            futures_lite::pin!(events);
            while let Some(event) = events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    shared.emit(StackEvent::Disconnect(id.clone()));
                    // Also aborts this task, which ends here anyway.
                    shared.forget(address);
                    break;
                }
            }
        });

        if let Some(previous) = self.shared.tasks.lock().unwrap().connections.insert(address, task) {
            previous.abort();
        }
        Ok(())
    }

    async fn disconnect(&self, peripheral: &str) -> Result<()> {
        let address = parse_address(peripheral)?;
        let device = self.adapter().device(address)?;
        device.disconnect().await?;
        self.shared.forget(address);
        Ok(())
    }

    async fn discover_services(&self, peripheral: &str, uuids: &[Uuid]) -> Result<Vec<NativeService>> {
        let address = parse_address(peripheral)?;
        let device = self.adapter().device(address)?;

        let mut services = Vec::new();
        for service in device.services().await? {
            if !service.primary().await? {
                continue;
            }
            let service = self.native_service(service).await?;
            if crate::backend::matches_uuid_filter(&service.uuid, uuids) {
                services.push(service);
            }
        }
        Ok(services)
    }

    async fn discover_included_services(&self, service: NativeId, uuids: &[Uuid]) -> Result<Vec<NativeService>> {
        let parent = self.service(service)?;
        let device = self.adapter().device(parent.device_address())?;

        let mut services = Vec::new();
        for id in parent.includes().await? {
            let service = self.native_service(device.service(id).await?).await?;
            if crate::backend::matches_uuid_filter(&service.uuid, uuids) {
                services.push(service);
            }
        }
        Ok(services)
    }

    async fn discover_characteristics(
        &self,
        service: NativeId,
        uuids: &[Uuid],
    ) -> Result<Vec<NativeCharacteristic>> {
        let service = self.service(service)?;

        let mut characteristics = Vec::new();
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            if !crate::backend::matches_uuid_filter(&uuid, uuids) {
                continue;
            }
            let properties = characteristic.flags().await?.into();
            let id = self.register(Object::Characteristic(characteristic));
            characteristics.push(NativeCharacteristic { id, uuid, properties });
        }
        Ok(characteristics)
    }

    async fn discover_descriptors(&self, characteristic: NativeId) -> Result<Vec<NativeDescriptor>> {
        let characteristic = self.characteristic(characteristic)?;

        let mut descriptors = Vec::new();
        for descriptor in characteristic.descriptors().await? {
            let uuid = descriptor.uuid().await?;
            let id = self.register(Object::Descriptor(descriptor));
            descriptors.push(NativeDescriptor { id, uuid });
        }
        Ok(descriptors)
    }

    async fn read(&self, characteristic: NativeId) -> Result<Vec<u8>> {
        self.characteristic(characteristic)?.read().await.map_err(Into::into)
    }

    async fn write(&self, characteristic: NativeId, data: &[u8], without_response: bool) -> Result<()> {
        let op_type = if without_response {
            WriteOp::Command
        } else {
            WriteOp::Request
        };
        self.characteristic(characteristic)?
            .write_ext(
                data,
                &CharacteristicWriteRequest {
                    op_type,
                    ..Default::default()
                },
            )
            .await
            .map_err(Into::into)
    }

    async fn set_notify(&self, characteristic: NativeId, enable: bool) -> Result<()> {
        if !enable {
            if let Some(task) = self.shared.tasks.lock().unwrap().notifications.remove(&characteristic) {
                task.abort();
            }
            return Ok(());
        }

        let remote = self.characteristic(characteristic)?;
        let (ready_tx, ready_rx) = async_channel::bounded(1);
        let shared = self.shared.clone();
        let task = self.runtime.spawn(async move {
            let values = match remote.notify().await {
                Ok(values) => {
                    let _ = ready_tx.send(Ok(())).await;
                    values
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err)).await;
                    return;
                }
            };

            futures_lite::pin!(values);
            while let Some(value) = values.next().await {
                shared.emit(StackEvent::Data { characteristic, value });
            }
            debug!("notification stream of {:?} ended", characteristic);
        });

        if let Some(previous) = self.shared.tasks.lock().unwrap().notifications.insert(characteristic, task) {
            previous.abort();
        }

        match ready_rx.recv().await {
            Ok(res) => res.map_err(Into::into),
            Err(_) => Err(Error::new(
                ErrorKind::Internal,
                None,
                "notification task ended before subscribing",
            )),
        }
    }

    async fn read_descriptor(&self, descriptor: NativeId) -> Result<Vec<u8>> {
        self.descriptor(descriptor)?.read().await.map_err(Into::into)
    }

    async fn write_descriptor(&self, descriptor: NativeId, data: &[u8]) -> Result<()> {
        self.descriptor(descriptor)?.write(data).await.map_err(Into::into)
    }
}

impl Release for BluezStack {
    fn release(&self) {
        let mut tasks = self.shared.tasks.lock().unwrap();
        if !tasks.connections.is_empty() {
            warn!("releasing BlueZ stack with {} open connections", tasks.connections.len());
        }
        tasks.abort_all();
    }
}
