//! Scan orchestration and filter evaluation for device requests.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender};
use futures_lite::future::pending;
use futures_lite::FutureExt;
use futures_timer::Delay;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::FoundCallback;
use crate::bluetooth::{Bluetooth, Context};
use crate::btuuid::service_uuid;
use crate::error::ErrorKind;
use crate::options::{RequestDeviceOptions, ScanFilter};
use crate::{Device, DiscoveredPeripheral, Error, Result};

fn invalid(message: &str) -> Error {
    Error::new(ErrorKind::InvalidParameter, None, message)
}

/// One filter clause with every UUID resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CompiledFilter {
    name: Option<String>,
    name_prefix: Option<String>,
    services: Vec<Uuid>,
    service_data: Vec<(Uuid, Option<Vec<u8>>)>,
    manufacturer_data: Vec<(u16, Option<Vec<u8>>)>,
}

fn starts_with(data: Option<&Vec<u8>>, prefix: &Option<Vec<u8>>) -> bool {
    match (data, prefix) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(data), Some(prefix)) => data.starts_with(prefix),
    }
}

impl CompiledFilter {
    fn compile(filter: &ScanFilter) -> Result<Self> {
        if filter.is_empty() {
            return Err(invalid("empty filter specified"));
        }
        if filter.name_prefix.as_deref() == Some("") {
            return Err(invalid("empty namePrefix specified"));
        }

        Ok(CompiledFilter {
            name: filter.name.clone(),
            name_prefix: filter.name_prefix.clone(),
            services: filter.services.iter().cloned().map(service_uuid).collect::<Result<_>>()?,
            service_data: filter
                .service_data
                .iter()
                .map(|x| Ok((service_uuid(x.key.clone())?, x.data_prefix.clone())))
                .collect::<Result<_>>()?,
            manufacturer_data: filter
                .manufacturer_data
                .iter()
                .map(|x| (x.key, x.data_prefix.clone()))
                .collect(),
        })
    }

    fn matches(&self, peripheral: &DiscoveredPeripheral) -> bool {
        let name = peripheral.name.as_deref();
        let adv = &peripheral.adv_data;

        if self.name.as_deref().is_some_and(|x| name != Some(x)) {
            return false;
        }
        if let Some(prefix) = &self.name_prefix {
            if !name.is_some_and(|name| name.starts_with(prefix.as_str())) {
                return false;
            }
        }

        self.services.iter().all(|x| adv.services.contains(x))
            && self
                .service_data
                .iter()
                .all(|(uuid, prefix)| starts_with(adv.service_data.get(uuid), prefix))
            && self
                .manufacturer_data
                .iter()
                .all(|(company, prefix)| starts_with(adv.manufacturer_data.get(company), prefix))
    }
}

/// A validated device request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeviceRequest {
    filters: Vec<CompiledFilter>,
    accept_all: bool,
    optional_services: Vec<Uuid>,
}

impl DeviceRequest {
    /// Validates `options`. Nothing is scanned if this fails.
    pub fn new(options: &RequestDeviceOptions) -> Result<Self> {
        if options.accept_all_devices && !options.filters.is_empty() {
            return Err(invalid("specify filters or acceptAllDevices"));
        }
        if !options.accept_all_devices && options.filters.is_empty() {
            return Err(invalid("no filters specified"));
        }

        Ok(DeviceRequest {
            filters: options
                .filters
                .iter()
                .map(CompiledFilter::compile)
                .collect::<Result<_>>()?,
            accept_all: options.accept_all_devices,
            optional_services: options
                .optional_services
                .iter()
                .cloned()
                .map(service_uuid)
                .collect::<Result<_>>()?,
        })
    }

    pub fn accept_all() -> Self {
        DeviceRequest {
            filters: Vec::new(),
            accept_all: true,
            optional_services: Vec::new(),
        }
    }

    /// Services the backend may restrict the scan to.
    ///
    /// Only sound when every clause requires at least one service; otherwise devices matching the other clauses
    /// would be filtered out by the radio.
    pub fn search_services(&self) -> Vec<Uuid> {
        if self.accept_all || self.filters.iter().any(|x| x.services.is_empty()) {
            return Vec::new();
        }
        let mut services = Vec::new();
        for uuid in self.filters.iter().flat_map(|x| &x.services) {
            if !services.contains(uuid) {
                services.push(*uuid);
            }
        }
        services
    }

    /// The services granted to `peripheral` if it is accepted by this request.
    pub fn matches(&self, peripheral: &DiscoveredPeripheral) -> Option<Vec<Uuid>> {
        let mut allowed = self.optional_services.clone();
        if self.accept_all {
            return Some(allowed);
        }

        let mut matched = false;
        for filter in self.filters.iter().filter(|x| x.matches(peripheral)) {
            matched = true;
            for uuid in &filter.services {
                if !allowed.contains(uuid) {
                    allowed.push(*uuid);
                }
            }
        }
        matched.then_some(allowed)
    }
}

/// Tracks the single scan a [`Bluetooth`] instance may run at a time.
#[derive(Debug, Default)]
pub(crate) struct ScanSlot {
    active: Mutex<Option<(u64, Sender<()>)>>,
    next_generation: AtomicU64,
}

impl ScanSlot {
    fn begin(&self) -> Result<(u64, Receiver<()>)> {
        let mut active = self.active.lock().unwrap();
        if active.is_some() {
            return Err(Error::new(ErrorKind::RequestInProgress, None, "request in progress"));
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = async_channel::bounded(1);
        *active = Some((generation, sender));
        Ok((generation, receiver))
    }

    /// Signals the active scan to stop. Returns `false` if there was none.
    pub fn cancel(&self) -> bool {
        match self.active.lock().unwrap().take() {
            Some((_, sender)) => {
                sender.close();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    fn finish(&self, generation: u64) -> bool {
        let mut active = self.active.lock().unwrap();
        if active.as_ref().is_some_and(|(x, _)| *x == generation) {
            *active = None;
            true
        } else {
            false
        }
    }
}

/// The scan currently occupying the [`ScanSlot`]. Dropping it stops the backend scan unless it was cancelled.
pub(crate) struct ScanSession {
    ctx: Arc<Context>,
    generation: u64,
    cancel: Receiver<()>,
}

impl ScanSession {
    pub fn begin(ctx: &Arc<Context>) -> Result<Self> {
        let (generation, cancel) = ctx.scan.begin()?;
        Ok(ScanSession {
            ctx: ctx.clone(),
            generation,
            cancel,
        })
    }

    /// Starts the backend scan, forwarding every discovery to `found`.
    pub async fn start(&self, services: &[Uuid], found: Sender<DiscoveredPeripheral>) -> Result<()> {
        let callback: FoundCallback = Arc::new(move |peripheral| {
            let _ = found.try_send(peripheral);
        });
        self.ctx.backend.start_scan(services, callback).await?;

        if self.cancel.is_closed() {
            // Cancelled while the backend was starting, so the cancellation's stop came too early.
            self.ctx.backend.stop_scan();
            return Err(cancelled());
        }
        debug!("scan {} started", self.generation);
        Ok(())
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        if self.ctx.scan.finish(self.generation) {
            self.ctx.backend.stop_scan();
            debug!("scan {} finished", self.generation);
        }
    }
}

fn cancelled() -> Error {
    Error::new(ErrorKind::Cancelled, None, "request cancelled")
}

/// Lets a device-found callback pick a device after it has returned.
///
/// Selecting resolves the pending [`Bluetooth::request_device`] with the device, as if the callback had returned
/// `true`.
#[derive(Debug, Clone)]
pub struct DeviceSelector {
    device: Device,
    sender: Sender<Device>,
}

impl DeviceSelector {
    /// The device this selector picks.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Selects the device. Returns `false` if the request has already completed.
    pub fn select(self) -> bool {
        self.sender.try_send(self.device).is_ok()
    }
}

enum Step {
    Found(DiscoveredPeripheral),
    Selected(Device),
    Cancelled,
    TimedOut,
}

async fn next_step(
    found: &Receiver<DiscoveredPeripheral>,
    selected: &Receiver<Device>,
    cancel: &Receiver<()>,
    deadline: Pin<&mut Delay>,
) -> Step {
    let cancelled = async {
        let _ = cancel.recv().await;
        Step::Cancelled
    };
    let selected = async {
        match selected.recv().await {
            Ok(device) => Step::Selected(device),
            Err(_) => pending().await,
        }
    };
    let found = async {
        match found.recv().await {
            Ok(peripheral) => Step::Found(peripheral),
            Err(_) => pending().await,
        }
    };
    let timed_out = async {
        deadline.await;
        Step::TimedOut
    };

    cancelled.or(selected).or(found).or(timed_out).await
}

/// Scans until a device is accepted, the scan time elapses or the request is cancelled.
pub(crate) async fn request_device(bluetooth: &Bluetooth, options: &RequestDeviceOptions) -> Result<Device> {
    let request = DeviceRequest::new(options)?;
    let session = ScanSession::begin(bluetooth.context())?;

    let (found_tx, found_rx) = async_channel::unbounded();
    session.start(&request.search_services(), found_tx).await?;

    let (select_tx, select_rx) = async_channel::unbounded();
    let deadline = Delay::new(bluetooth.options().scan_time);
    futures_lite::pin!(deadline);

    loop {
        match next_step(&found_rx, &select_rx, &session.cancel, deadline.as_mut()).await {
            Step::Found(peripheral) => {
                let Some(device) = bluetooth.accept(&request, peripheral) else {
                    continue;
                };
                debug!("{} matched the request", device.id());

                let selected = match bluetooth.device_found() {
                    Some(callback) => callback(
                        &device,
                        DeviceSelector {
                            device: device.clone(),
                            sender: select_tx.clone(),
                        },
                    ),
                    None => true,
                };
                if selected {
                    bluetooth.allow(&device);
                    return Ok(device);
                }
            }
            Step::Selected(device) => {
                bluetooth.allow(&device);
                return Ok(device);
            }
            Step::Cancelled => return Err(cancelled()),
            Step::TimedOut => return Err(Error::new(ErrorKind::NoDevicesFound, None, "no devices found")),
        }
    }
}

/// Scans for the whole scan time and returns the discovered devices granted to `bluetooth`.
///
/// Cancelling ends the scan early with the devices found so far.
pub(crate) async fn get_devices(bluetooth: &Bluetooth) -> Result<Vec<Device>> {
    let request = DeviceRequest::accept_all();
    let session = ScanSession::begin(bluetooth.context())?;

    let (found_tx, found_rx) = async_channel::unbounded();
    session.start(&[], found_tx).await?;

    let (_select_tx, select_rx) = async_channel::unbounded();
    let deadline = Delay::new(bluetooth.options().scan_time);
    futures_lite::pin!(deadline);

    let mut devices: Vec<Device> = Vec::new();
    loop {
        match next_step(&found_rx, &select_rx, &session.cancel, deadline.as_mut()).await {
            Step::Found(peripheral) => {
                if let Some(device) = bluetooth.accept(&request, peripheral) {
                    if !devices.contains(&device) {
                        devices.push(device);
                    }
                }
            }
            Step::Selected(_) => warn!("ignoring device selection outside of request_device"),
            Step::Cancelled | Step::TimedOut => break,
        }
    }
    drop(session);

    let allow_all = bluetooth.options().allow_all_devices;
    Ok(devices
        .into_iter()
        .filter(|device| allow_all || bluetooth.is_allowed(device.id()))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::btuuid::bluetooth_uuid_from_u16;
    use crate::options::DataFilter;
    use crate::{AdvertisementData, DeviceId};

    fn peripheral(name: Option<&str>) -> DiscoveredPeripheral {
        DiscoveredPeripheral {
            id: DeviceId::new("AA:BB:CC:DD:EE:FF"),
            name: name.map(str::to_owned),
            adv_data: AdvertisementData {
                services: vec![bluetooth_uuid_from_u16(0x180D)],
                service_data: HashMap::from([(bluetooth_uuid_from_u16(0x180F), vec![0x64, 0x01])]),
                manufacturer_data: HashMap::from([(0x004C, vec![0x02, 0x15, 0xAA])]),
                rssi: Some(-50),
                tx_power_level: None,
            },
        }
    }

    fn kind_and_message(options: RequestDeviceOptions) -> (ErrorKind, String) {
        let err = DeviceRequest::new(&options).unwrap_err();
        (err.kind(), err.message().to_owned())
    }

    #[test]
    fn rejects_invalid_requests() {
        assert_eq!(
            kind_and_message(RequestDeviceOptions::default()),
            (ErrorKind::InvalidParameter, "no filters specified".into())
        );
        assert_eq!(
            kind_and_message(RequestDeviceOptions::with_filters(vec![ScanFilter::default()])),
            (ErrorKind::InvalidParameter, "empty filter specified".into())
        );
        assert_eq!(
            kind_and_message(RequestDeviceOptions::with_filters(vec![
                ScanFilter::name("x"),
                ScanFilter::name_prefix("")
            ])),
            (ErrorKind::InvalidParameter, "empty namePrefix specified".into())
        );
        assert_eq!(
            kind_and_message(RequestDeviceOptions {
                accept_all_devices: true,
                ..RequestDeviceOptions::with_filters(vec![ScanFilter::name("x")])
            }),
            (ErrorKind::InvalidParameter, "specify filters or acceptAllDevices".into())
        );
        assert_eq!(
            kind_and_message(RequestDeviceOptions::with_filters(vec![ScanFilter::services(["not a service"])])).0,
            ErrorKind::InvalidParameter
        );
    }

    #[test]
    fn clauses_require_every_condition() {
        let request = DeviceRequest::new(&RequestDeviceOptions::with_filters(vec![ScanFilter {
            name_prefix: Some("Poly".into()),
            services: vec!["heart_rate".into()],
            ..Default::default()
        }]))
        .unwrap();

        assert!(request.matches(&peripheral(Some("Polar H10"))).is_some());
        assert!(request.matches(&peripheral(Some("Po"))).is_none());
        assert!(request.matches(&peripheral(None)).is_none());
    }

    #[test]
    fn data_filters_match_on_prefix() {
        let matching = |filter: ScanFilter| {
            DeviceRequest::new(&RequestDeviceOptions::with_filters(vec![filter]))
                .unwrap()
                .matches(&peripheral(None))
                .is_some()
        };

        assert!(matching(ScanFilter::default().with_manufacturer_data(DataFilter::new(0x004Cu16))));
        assert!(matching(
            ScanFilter::default().with_manufacturer_data(DataFilter::new(0x004Cu16).with_prefix([0x02, 0x15]))
        ));
        assert!(!matching(
            ScanFilter::default().with_manufacturer_data(DataFilter::new(0x004Cu16).with_prefix([0x02, 0x16]))
        ));
        assert!(!matching(ScanFilter::default().with_manufacturer_data(DataFilter::new(0x0059u16))));
        assert!(matching(
            ScanFilter::default().with_service_data(DataFilter::new("battery_service").with_prefix([0x64]))
        ));
        assert!(!matching(
            ScanFilter::default().with_service_data(DataFilter::new(0x180Au16).with_prefix([0x64]))
        ));
    }

    #[test]
    fn allowed_services_come_from_matching_clauses() {
        let request = DeviceRequest::new(
            &RequestDeviceOptions::with_filters(vec![
                ScanFilter::services([0x180Du16]),
                ScanFilter::services([0x1816u16]),
            ])
            .with_optional_services(["battery_service"]),
        )
        .unwrap();

        assert_eq!(
            request.search_services(),
            vec![bluetooth_uuid_from_u16(0x180D), bluetooth_uuid_from_u16(0x1816)]
        );
        assert_eq!(
            request.matches(&peripheral(None)).unwrap(),
            vec![bluetooth_uuid_from_u16(0x180F), bluetooth_uuid_from_u16(0x180D)]
        );
    }

    #[test]
    fn search_services_need_every_clause_to_name_one() {
        let request = DeviceRequest::new(&RequestDeviceOptions::with_filters(vec![
            ScanFilter::services([0x180Du16]),
            ScanFilter::name("Thingy"),
        ]))
        .unwrap();
        assert!(request.search_services().is_empty());
        assert!(DeviceRequest::accept_all().search_services().is_empty());
    }

    #[test]
    fn scan_slot_allows_one_scan() {
        let slot = ScanSlot::default();
        let (first, cancel) = slot.begin().unwrap();
        assert_eq!(slot.begin().unwrap_err().kind(), ErrorKind::RequestInProgress);

        assert!(slot.cancel());
        assert!(cancel.is_closed());
        assert!(!slot.cancel());
        assert!(!slot.finish(first));

        let (second, _cancel) = slot.begin().unwrap();
        assert_ne!(first, second);
        assert!(slot.finish(second));
        assert!(!slot.is_active());
    }
}
