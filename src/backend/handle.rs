use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{matches_uuid_filter, CharacteristicInfo, DescriptorInfo, DisconnectFn, FoundCallback, ServiceInfo};
use crate::error::ErrorKind;
use crate::handles::{Handle, HandleArena, HandleKind, ValueCallback};
use crate::native::{HandleStack, PeripheralRef, ScannedPeripheral};
use crate::util::defer;
use crate::{AdapterInfo, AdvertisementData, DeviceId, DiscoveredPeripheral, Error, Result};

/// Adapts a [`HandleStack`].
///
/// The stack reports the whole GATT tree on connection, so handles for every attribute are created up front and
/// discovery is answered from the handle arena. Attribute operations are translated back into UUID paths.
pub struct HandleBackend {
    stack: Arc<dyn HandleStack>,
    shared: Arc<Shared>,
    adapter: AtomicUsize,
}

impl std::fmt::Debug for HandleBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleBackend")
            .field("adapter", &self.adapter.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct ScanState {
    found: Option<FoundCallback>,
    services: Vec<Uuid>,
    seen: HashSet<PeripheralRef>,
}

#[derive(Default)]
struct Shared {
    graph: Mutex<HandleArena<()>>,
    peripherals: Mutex<HashMap<DeviceId, PeripheralRef>>,
    scan: Mutex<ScanState>,
    disconnects: Mutex<HashMap<DeviceId, DisconnectFn>>,
}

/// The UUID path of one attribute.
struct Path {
    peripheral: PeripheralRef,
    service: Uuid,
    characteristic: Uuid,
    descriptor: Option<Uuid>,
}

impl HandleBackend {
    /// Wraps `stack`, selecting its first adapter.
    pub fn new(stack: Arc<dyn HandleStack>) -> Result<Self> {
        let adapters = stack.adapters();
        if adapters.is_empty() {
            return Err(Error::new(
                ErrorKind::AdapterUnavailable,
                None,
                "no Bluetooth adapters found",
            ));
        }
        info!("using adapter {} of {}", adapters[0].identifier, adapters.len());

        Ok(HandleBackend {
            stack,
            shared: Arc::new(Shared::default()),
            adapter: AtomicUsize::new(0),
        })
    }

    pub(crate) fn get_enabled(&self) -> bool {
        self.stack.is_enabled()
    }

    pub(crate) fn get_adapters(&self) -> Vec<AdapterInfo> {
        let active = self.adapter.load(Ordering::Acquire);
        self.stack
            .adapters()
            .into_iter()
            .enumerate()
            .map(|(index, adapter)| AdapterInfo {
                index,
                address: adapter.address.unwrap_or(adapter.identifier),
                active: index == active,
            })
            .collect()
    }

    pub(crate) fn use_adapter(&self, index: usize) -> Result<()> {
        let count = self.stack.adapters().len();
        if index >= count {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                None,
                format!("adapter {index} does not exist, {count} available"),
            ));
        }
        self.adapter.store(index, Ordering::Release);
        info!("switched to adapter {}", index);
        Ok(())
    }

    pub(crate) fn start_scan(&self, services: &[Uuid], found: FoundCallback) -> Result<()> {
        if !self.stack.is_enabled() {
            return Err(Error::new(ErrorKind::AdapterUnavailable, None, "adapter not enabled"));
        }

        {
            let mut scan = self.shared.scan.lock().unwrap();
            scan.seen.clear();
            scan.services = services.to_vec();
            scan.found = Some(found);
        }
        let guard = defer(|| self.shared.scan.lock().unwrap().found = None);

        let shared = self.shared.clone();
        self.stack.scan_start(
            self.adapter.load(Ordering::Acquire),
            Box::new(move |peripheral| shared.scanned(peripheral)),
        )?;

        guard.defuse();
        debug!("scanning for {} services", services.len());
        Ok(())
    }

    pub(crate) fn stop_scan(&self) {
        self.shared.scan.lock().unwrap().found = None;
        if let Err(err) = self.stack.scan_stop(self.adapter.load(Ordering::Acquire)) {
            warn!("failed to stop scanning: {}", err);
        }
    }

    pub(crate) fn connect(&self, id: &DeviceId, on_disconnect: DisconnectFn) -> Result<()> {
        let peripheral = self.peripheral_ref(id)?;

        self.shared.disconnects.lock().unwrap().insert(id.clone(), on_disconnect);
        let guard = defer(|| {
            self.shared.disconnects.lock().unwrap().remove(id);
        });

        let shared = self.shared.clone();
        let disconnected = id.clone();
        self.stack
            .set_on_disconnected(peripheral, Box::new(move || shared.disconnected(&disconnected)));
        self.stack.connect(peripheral)?;

        let services = match self.stack.services(peripheral) {
            Ok(services) => services,
            Err(err) => {
                if let Err(err) = self.stack.disconnect(peripheral) {
                    warn!("failed to disconnect from {} after failed discovery: {}", id, err);
                }
                return Err(err);
            }
        };

        {
            let mut graph = self.shared.graph.lock().unwrap();
            graph.delete_handles(id);
            // A disconnection reported during setup has already run the callback; leave no handles behind.
            if self.shared.disconnects.lock().unwrap().contains_key(id) {
                graph.create_handles(id, &services)?;
            }
        }

        guard.defuse();
        info!("connected to {}", id);
        Ok(())
    }

    pub(crate) fn disconnect(&self, id: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral_ref(id)?;
        self.stack.disconnect(peripheral)?;
        self.shared.disconnected(id);
        Ok(())
    }

    pub(crate) fn discover_services(&self, id: &DeviceId, uuids: &[Uuid]) -> Result<Vec<ServiceInfo>> {
        let graph = self.shared.graph.lock().unwrap();
        Ok(graph
            .children(id, None, HandleKind::Service)
            .into_iter()
            .filter(|(_, entry)| matches_uuid_filter(&entry.uuid, uuids))
            .map(|(handle, entry)| ServiceInfo {
                handle,
                uuid: entry.uuid,
                primary: true,
            })
            .collect())
    }

    /// The stack does not report included services.
    pub(crate) fn discover_included_services(&self, service: Handle, _uuids: &[Uuid]) -> Result<Vec<ServiceInfo>> {
        self.shared.graph.lock().unwrap().entry_of_kind(service, HandleKind::Service)?;
        Ok(Vec::new())
    }

    pub(crate) fn discover_characteristics(&self, service: Handle, uuids: &[Uuid]) -> Result<Vec<CharacteristicInfo>> {
        let graph = self.shared.graph.lock().unwrap();
        let peripheral = graph.entry_of_kind(service, HandleKind::Service)?.peripheral.clone();
        Ok(graph
            .children(&peripheral, Some(service), HandleKind::Characteristic)
            .into_iter()
            .filter(|(_, entry)| matches_uuid_filter(&entry.uuid, uuids))
            .map(|(handle, entry)| CharacteristicInfo {
                handle,
                uuid: entry.uuid,
                properties: entry.properties,
            })
            .collect())
    }

    pub(crate) fn discover_descriptors(&self, characteristic: Handle, uuids: &[Uuid]) -> Result<Vec<DescriptorInfo>> {
        let graph = self.shared.graph.lock().unwrap();
        let peripheral = graph
            .entry_of_kind(characteristic, HandleKind::Characteristic)?
            .peripheral
            .clone();
        Ok(graph
            .children(&peripheral, Some(characteristic), HandleKind::Descriptor)
            .into_iter()
            .filter(|(_, entry)| matches_uuid_filter(&entry.uuid, uuids))
            .map(|(handle, entry)| DescriptorInfo {
                handle,
                uuid: entry.uuid,
            })
            .collect())
    }

    pub(crate) fn read_characteristic(&self, characteristic: Handle) -> Result<Vec<u8>> {
        let path = self.path(characteristic, HandleKind::Characteristic)?;
        self.stack.read(path.peripheral, path.service, path.characteristic)
    }

    pub(crate) fn write_characteristic(
        &self,
        characteristic: Handle,
        data: &[u8],
        without_response: Option<bool>,
    ) -> Result<()> {
        let path = self.path(characteristic, HandleKind::Characteristic)?;
        let without_response = match without_response {
            Some(x) => x,
            None => self
                .shared
                .graph
                .lock()
                .unwrap()
                .entry(characteristic)?
                .properties
                .prefers_write_without_response(),
        };

        if without_response {
            self.stack
                .write_command(path.peripheral, path.service, path.characteristic, data)
        } else {
            self.stack
                .write_request(path.peripheral, path.service, path.characteristic, data)
        }
    }

    pub(crate) fn enable_notify(&self, characteristic: Handle, callback: ValueCallback) -> Result<()> {
        let path = self.path(characteristic, HandleKind::Characteristic)?;
        {
            let mut graph = self.shared.graph.lock().unwrap();
            let subscribed = graph.callback(characteristic).is_some();
            graph.set_callback(characteristic, callback)?;
            if subscribed {
                return Ok(());
            }
        }

        let shared = self.shared.clone();
        let result = self.stack.notify(
            path.peripheral,
            path.service,
            path.characteristic,
            Box::new(move |value| {
                let callback = shared.graph.lock().unwrap().callback(characteristic);
                match callback {
                    Some(callback) => callback(value),
                    None => trace!("dropping notification for {}", characteristic),
                }
            }),
        );

        if let Err(err) = result {
            self.shared.graph.lock().unwrap().remove_callback(characteristic);
            return Err(err.with_message("notify failed to enable"));
        }
        Ok(())
    }

    pub(crate) fn disable_notify(&self, characteristic: Handle) -> Result<()> {
        let path = self.path(characteristic, HandleKind::Characteristic)?;
        if self.shared.graph.lock().unwrap().callback(characteristic).is_none() {
            return Ok(());
        }

        self.stack
            .unsubscribe(path.peripheral, path.service, path.characteristic)
            .map_err(|err| err.with_message("notify failed to disable"))?;
        self.shared.graph.lock().unwrap().remove_callback(characteristic);
        Ok(())
    }

    pub(crate) fn read_descriptor(&self, descriptor: Handle) -> Result<Vec<u8>> {
        let path = self.path(descriptor, HandleKind::Descriptor)?;
        self.stack.read_descriptor(
            path.peripheral,
            path.service,
            path.characteristic,
            path.descriptor.unwrap_or_default(),
        )
    }

    pub(crate) fn write_descriptor(&self, descriptor: Handle, data: &[u8]) -> Result<()> {
        let path = self.path(descriptor, HandleKind::Descriptor)?;
        self.stack.write_descriptor(
            path.peripheral,
            path.service,
            path.characteristic,
            path.descriptor.unwrap_or_default(),
            data,
        )
    }

    fn peripheral_ref(&self, id: &DeviceId) -> Result<PeripheralRef> {
        self.shared
            .peripherals
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, None, format!("device {id} has not been discovered")))
    }

    fn path(&self, handle: Handle, kind: HandleKind) -> Result<Path> {
        let ancestry = {
            let graph = self.shared.graph.lock().unwrap();
            graph.entry_of_kind(handle, kind)?;
            graph.resolve(handle)?
        };
        let characteristic = ancestry.characteristic.ok_or_else(|| {
            Error::new(
                ErrorKind::Internal,
                None,
                format!("handle {handle} has no parent characteristic"),
            )
        })?;

        Ok(Path {
            peripheral: self.peripheral_ref(&ancestry.peripheral)?,
            service: ancestry.service.uuid,
            characteristic: characteristic.uuid,
            descriptor: ancestry.descriptor.map(|x| x.uuid),
        })
    }
}

impl Shared {
    fn scanned(&self, peripheral: ScannedPeripheral) {
        let reference = peripheral.peripheral;
        let record = record(peripheral);

        let found = {
            let mut scan = self.scan.lock().unwrap();
            let Some(found) = scan.found.clone() else {
                return;
            };
            let advertised = &record.adv_data.services;
            if !scan.services.is_empty() && !advertised.iter().any(|x| scan.services.contains(x)) {
                return;
            }
            // The first sighting of a peripheral within a scan wins.
            if !scan.seen.insert(reference) {
                return;
            }
            found
        };

        self.peripherals.lock().unwrap().insert(record.id.clone(), reference);
        trace!("discovered {}", record.id);
        found(record);
    }

    fn disconnected(&self, id: &DeviceId) {
        self.graph.lock().unwrap().delete_handles(id);
        let on_disconnect = self.disconnects.lock().unwrap().remove(id);
        if let Some(on_disconnect) = on_disconnect {
            info!("disconnected from {}", id);
            on_disconnect();
        }
    }
}

fn record(peripheral: ScannedPeripheral) -> DiscoveredPeripheral {
    let id = if peripheral.address.is_empty() {
        peripheral.identifier.clone()
    } else {
        peripheral.address
    };
    let name = Some(peripheral.identifier).filter(|x| !x.is_empty());

    DiscoveredPeripheral {
        id: DeviceId(id),
        name,
        adv_data: AdvertisementData {
            services: peripheral.services,
            service_data: peripheral.service_data,
            manufacturer_data: peripheral.manufacturer_data,
            rssi: peripheral.rssi,
            tx_power_level: peripheral.tx_power_level,
        },
    }
}
