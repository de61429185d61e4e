use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_broadcast::{InactiveReceiver, RecvError, Sender};
use futures_timer::Delay;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{
    matches_uuid_filter, AvailabilityFn, CharacteristicInfo, DescriptorInfo, DisconnectFn, FoundCallback,
    ServiceInfo,
};
use crate::btuuid::canonical_uuid;
use crate::error::ErrorKind;
use crate::handles::{Handle, HandleArena, HandleKind, ValueCallback};
use crate::native::{EventStack, NativeId, NativePeripheral, PowerState, StackEvent};
use crate::util::defer;
use crate::{
    AdapterInfo, AdvertisementData, CharacteristicProperties, DeviceId, DiscoveredPeripheral, Error, Result,
};

/// Adapts an [`EventStack`].
///
/// Events pushed by the stack are handled synchronously on the thread that delivers them: discoveries are forwarded
/// to the active scan, disconnections release the peripheral's handles before the owner is told, and notifications
/// are routed to the callback registered for the characteristic.
pub struct StreamBackend {
    stack: Arc<dyn EventStack>,
    shared: Arc<Shared>,
    active_adapter: AtomicUsize,
    write_settle_delay: Option<Duration>,
}

impl std::fmt::Debug for StreamBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBackend")
            .field("active_adapter", &self.active_adapter.load(Ordering::Relaxed))
            .field("write_settle_delay", &self.write_settle_delay)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct ScanState {
    found: Option<FoundCallback>,
    services: Vec<Uuid>,
    seen: HashSet<DeviceId>,
}

struct Shared {
    graph: Mutex<HandleArena<NativeId>>,
    scan: Mutex<ScanState>,
    // Device id to the stack's peripheral id.
    peripherals: Mutex<HashMap<DeviceId, String>>,
    disconnects: Mutex<HashMap<DeviceId, DisconnectFn>>,
    availability: Mutex<Option<AvailabilityFn>>,
    power: Sender<PowerState>,
    _power_keepalive: InactiveReceiver<PowerState>,
}

impl StreamBackend {
    /// Wraps `stack` and installs this backend as its event listener.
    pub fn new(stack: Arc<dyn EventStack>) -> Self {
        let (mut power, receiver) = async_broadcast::broadcast(4);
        power.set_overflow(true);

        let shared = Arc::new(Shared {
            graph: Mutex::new(HandleArena::default()),
            scan: Mutex::new(ScanState::default()),
            peripherals: Mutex::new(HashMap::new()),
            disconnects: Mutex::new(HashMap::new()),
            availability: Mutex::new(None),
            power,
            _power_keepalive: receiver.deactivate(),
        });

        let listener = shared.clone();
        stack.set_listener(Arc::new(move |event| listener.handle_event(event)));

        StreamBackend {
            stack,
            shared,
            active_adapter: AtomicUsize::new(0),
            write_settle_delay: None,
        }
    }

    pub(crate) fn set_write_settle_delay(&mut self, delay: Option<Duration>) {
        self.write_settle_delay = delay;
    }

    pub(crate) fn set_availability_listener(&self, listener: AvailabilityFn) {
        *self.shared.availability.lock().unwrap() = Some(listener);
    }

    /// Whether the radio is powered on, waiting for the stack to report its first power state if necessary.
    pub(crate) async fn get_enabled(&self) -> bool {
        let mut receiver = self.shared.power.new_receiver();
        let mut state = self.stack.state();
        while state == PowerState::Unknown {
            match receiver.recv().await {
                Ok(next) => state = next,
                Err(RecvError::Overflowed(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
        state == PowerState::PoweredOn
    }

    pub(crate) async fn get_adapters(&self) -> Result<Vec<AdapterInfo>> {
        let active = self.active_adapter.load(Ordering::Acquire);
        Ok(self
            .stack
            .adapters()
            .await?
            .into_iter()
            .enumerate()
            .map(|(index, adapter)| AdapterInfo {
                index,
                address: adapter.address.unwrap_or(adapter.identifier),
                active: index == active,
            })
            .collect())
    }

    pub(crate) async fn use_adapter(&self, index: usize) -> Result<()> {
        self.stack.use_adapter(index).await?;
        self.active_adapter.store(index, Ordering::Release);
        Ok(())
    }

    pub(crate) async fn start_scan(&self, services: &[Uuid], found: FoundCallback) -> Result<()> {
        {
            let mut scan = self.shared.scan.lock().unwrap();
            scan.seen.clear();
            scan.services = services.to_vec();
            scan.found = Some(found);
        }
        let guard = defer(|| self.shared.scan.lock().unwrap().found = None);

        if !self.get_enabled().await {
            return Err(Error::new(ErrorKind::AdapterUnavailable, None, "adapter not enabled"));
        }
        self.stack.start_scanning(services, true).await?;

        guard.defuse();
        debug!("scanning for {} services", services.len());
        Ok(())
    }

    pub(crate) fn stop_scan(&self) {
        self.shared.scan.lock().unwrap().found = None;
        self.stack.stop_scanning();
        debug!("scan stopped");
    }

    pub(crate) async fn connect(&self, id: &DeviceId, on_disconnect: DisconnectFn) -> Result<()> {
        let peripheral = self.native_peripheral(id)?;

        // Registered first: the stack may report the disconnection before `connect` returns.
        self.shared.disconnects.lock().unwrap().insert(id.clone(), on_disconnect);
        let guard = defer(|| {
            self.shared.disconnects.lock().unwrap().remove(id);
        });

        self.stack.connect(&peripheral).await?;

        guard.defuse();
        info!("connected to {}", id);
        Ok(())
    }

    pub(crate) async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        let peripheral = self.native_peripheral(id)?;
        self.stack.disconnect(&peripheral).await?;
        // Stacks report requested disconnections too. Whichever comes first runs the callback.
        self.shared.disconnected(id);
        Ok(())
    }

    pub(crate) async fn discover_services(&self, id: &DeviceId, uuids: &[Uuid]) -> Result<Vec<ServiceInfo>> {
        let peripheral = self.native_peripheral(id)?;
        let services = self.stack.discover_services(&peripheral, uuids).await?;

        let mut graph = self.shared.graph.lock().unwrap();
        services
            .into_iter()
            .map(|service| {
                let handle = graph.insert(
                    id,
                    None,
                    HandleKind::Service,
                    service.uuid,
                    CharacteristicProperties::default(),
                    service.id,
                )?;
                Ok(ServiceInfo {
                    handle,
                    uuid: service.uuid,
                    primary: true,
                })
            })
            .collect()
    }

    pub(crate) async fn discover_included_services(&self, service: Handle, uuids: &[Uuid]) -> Result<Vec<ServiceInfo>> {
        let (peripheral, native) = self.lookup(service, HandleKind::Service)?;
        let included = self.stack.discover_included_services(native, uuids).await?;

        let mut graph = self.shared.graph.lock().unwrap();
        included
            .into_iter()
            .map(|x| {
                let handle = graph.insert(
                    &peripheral,
                    Some(service),
                    HandleKind::Service,
                    x.uuid,
                    CharacteristicProperties::default(),
                    x.id,
                )?;
                Ok(ServiceInfo {
                    handle,
                    uuid: x.uuid,
                    primary: false,
                })
            })
            .collect()
    }

    pub(crate) async fn discover_characteristics(
        &self,
        service: Handle,
        uuids: &[Uuid],
    ) -> Result<Vec<CharacteristicInfo>> {
        let (peripheral, native) = self.lookup(service, HandleKind::Service)?;
        let characteristics = self.stack.discover_characteristics(native, uuids).await?;

        let mut graph = self.shared.graph.lock().unwrap();
        characteristics
            .into_iter()
            .map(|x| {
                let handle = graph.insert(
                    &peripheral,
                    Some(service),
                    HandleKind::Characteristic,
                    x.uuid,
                    x.properties,
                    x.id,
                )?;
                Ok(CharacteristicInfo {
                    handle,
                    uuid: x.uuid,
                    properties: x.properties,
                })
            })
            .collect()
    }

    pub(crate) async fn discover_descriptors(
        &self,
        characteristic: Handle,
        uuids: &[Uuid],
    ) -> Result<Vec<DescriptorInfo>> {
        let (peripheral, native) = self.lookup(characteristic, HandleKind::Characteristic)?;
        let descriptors = self.stack.discover_descriptors(native).await?;

        let mut graph = self.shared.graph.lock().unwrap();
        descriptors
            .into_iter()
            .filter(|x| matches_uuid_filter(&x.uuid, uuids))
            .map(|x| {
                let handle = graph.insert(
                    &peripheral,
                    Some(characteristic),
                    HandleKind::Descriptor,
                    x.uuid,
                    CharacteristicProperties::default(),
                    x.id,
                )?;
                Ok(DescriptorInfo { handle, uuid: x.uuid })
            })
            .collect()
    }

    pub(crate) async fn read_characteristic(&self, characteristic: Handle) -> Result<Vec<u8>> {
        let (_, native) = self.lookup(characteristic, HandleKind::Characteristic)?;
        self.stack.read(native).await
    }

    pub(crate) async fn write_characteristic(
        &self,
        characteristic: Handle,
        data: &[u8],
        without_response: Option<bool>,
    ) -> Result<()> {
        let (native, properties) = {
            let graph = self.shared.graph.lock().unwrap();
            let entry = graph.entry_of_kind(characteristic, HandleKind::Characteristic)?;
            (entry.native, entry.properties)
        };
        let without_response = without_response.unwrap_or_else(|| properties.prefers_write_without_response());

        self.stack.write(native, data, without_response).await?;

        if without_response {
            if let Some(delay) = self.write_settle_delay {
                Delay::new(delay).await;
            }
        }
        Ok(())
    }

    pub(crate) async fn enable_notify(&self, characteristic: Handle, callback: ValueCallback) -> Result<()> {
        let native = {
            let mut graph = self.shared.graph.lock().unwrap();
            let native = graph.entry_of_kind(characteristic, HandleKind::Characteristic)?.native;
            let subscribed = graph.callback(characteristic).is_some();
            graph.set_callback(characteristic, callback)?;
            if subscribed {
                return Ok(());
            }
            native
        };

        if let Err(err) = self.stack.set_notify(native, true).await {
            self.shared.graph.lock().unwrap().remove_callback(characteristic);
            return Err(err.with_message("notify failed to enable"));
        }
        Ok(())
    }

    pub(crate) async fn disable_notify(&self, characteristic: Handle) -> Result<()> {
        let native = {
            let graph = self.shared.graph.lock().unwrap();
            let native = graph.entry_of_kind(characteristic, HandleKind::Characteristic)?.native;
            if graph.callback(characteristic).is_none() {
                return Ok(());
            }
            native
        };

        self.stack
            .set_notify(native, false)
            .await
            .map_err(|err| err.with_message("notify failed to disable"))?;
        self.shared.graph.lock().unwrap().remove_callback(characteristic);
        Ok(())
    }

    pub(crate) async fn read_descriptor(&self, descriptor: Handle) -> Result<Vec<u8>> {
        let (_, native) = self.lookup(descriptor, HandleKind::Descriptor)?;
        self.stack.read_descriptor(native).await
    }

    pub(crate) async fn write_descriptor(&self, descriptor: Handle, data: &[u8]) -> Result<()> {
        let (_, native) = self.lookup(descriptor, HandleKind::Descriptor)?;
        self.stack.write_descriptor(native, data).await
    }

    fn native_peripheral(&self, id: &DeviceId) -> Result<String> {
        self.shared
            .peripherals
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, None, format!("device {id} has not been discovered")))
    }

    fn lookup(&self, handle: Handle, kind: HandleKind) -> Result<(DeviceId, NativeId)> {
        let graph = self.shared.graph.lock().unwrap();
        let entry = graph.entry_of_kind(handle, kind)?;
        Ok((entry.peripheral.clone(), entry.native))
    }
}

impl Shared {
    fn handle_event(&self, event: StackEvent) {
        match event {
            StackEvent::StateChange(state) => {
                debug!("power state changed to {:?}", state);
                let _ = self.power.try_broadcast(state);
                let listener = self.availability.lock().unwrap().clone();
                if let Some(listener) = listener {
                    listener(state == PowerState::PoweredOn);
                }
            }
            StackEvent::Discover(peripheral) => self.discovered(peripheral),
            StackEvent::Disconnect(peripheral) => {
                let id = self
                    .peripherals
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|(_, native)| **native == peripheral)
                    .map(|(id, _)| id.clone())
                    .unwrap_or_else(|| DeviceId::new(peripheral));
                self.disconnected(&id);
            }
            StackEvent::Data { characteristic, value } => {
                let callback = self.graph.lock().unwrap().callback_for_native(&characteristic);
                match callback {
                    Some(callback) => callback(value),
                    None => trace!("dropping notification for unsubscribed characteristic {:?}", characteristic),
                }
            }
        }
    }

    fn discovered(&self, peripheral: NativePeripheral) {
        let native_id = peripheral.id.clone();
        let record = normalize(peripheral);

        let found = {
            let mut scan = self.scan.lock().unwrap();
            let Some(found) = scan.found.clone() else {
                return;
            };
            let advertised = &record.adv_data.services;
            if !scan.services.is_empty() && !advertised.iter().any(|x| scan.services.contains(x)) {
                return;
            }
            if !scan.seen.insert(record.id.clone()) {
                return;
            }
            found
        };

        self.peripherals.lock().unwrap().insert(record.id.clone(), native_id);
        trace!("discovered {}", record.id);
        found(record);
    }

    /// Releases the peripheral's handles, then runs its disconnect callback if one is pending.
    fn disconnected(&self, id: &DeviceId) {
        self.graph.lock().unwrap().delete_handles(id);
        let on_disconnect = self.disconnects.lock().unwrap().remove(id);
        if let Some(on_disconnect) = on_disconnect {
            info!("disconnected from {}", id);
            on_disconnect();
        }
    }
}

fn parse_uuid(value: &str) -> Option<Uuid> {
    let canonical = canonical_uuid(value);
    match Uuid::parse_str(&canonical) {
        Ok(uuid) => Some(uuid),
        Err(err) => {
            warn!("ignoring advertised UUID {:?}: {}", value, err);
            None
        }
    }
}

fn normalize(peripheral: NativePeripheral) -> DiscoveredPeripheral {
    let id = match peripheral.address {
        Some(address) if !address.is_empty() && address != "unknown" => address,
        _ => peripheral.id,
    };

    let services = peripheral.service_uuids.iter().filter_map(|x| parse_uuid(x)).collect();

    let service_data = peripheral
        .service_data
        .into_iter()
        .filter_map(|(uuid, data)| parse_uuid(&uuid).map(|uuid| (uuid, data)))
        .collect();

    let manufacturer_data = peripheral
        .manufacturer_data
        .filter(|raw| raw.len() >= 2)
        .map(|raw| (u16::from_le_bytes([raw[0], raw[1]]), raw[2..].to_vec()))
        .into_iter()
        .collect();

    DiscoveredPeripheral {
        id: DeviceId(id),
        name: peripheral.local_name,
        adv_data: AdvertisementData {
            services,
            service_data,
            manufacturer_data,
            rssi: peripheral.rssi,
            tx_power_level: peripheral.tx_power_level,
        },
    }
}
