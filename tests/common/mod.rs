#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use webble::error::ErrorKind;
use webble::native::*;
use webble::session::Release;
use webble::{Backend, Bluetooth, BluetoothOptions, CharacteristicProperties, Error, Result, Uuid};

pub fn init_tracing() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

pub fn options() -> BluetoothOptions {
    BluetoothOptions::default()
        .with_scan_time(Duration::from_millis(200))
        .with_write_settle_delay(None)
}

pub fn properties(bits: u32) -> CharacteristicProperties {
    CharacteristicProperties::from_bits(bits)
}

pub const READ: u32 = 1 << 1;
pub const WRITE_WITHOUT_RESPONSE: u32 = 1 << 2;
pub const WRITE: u32 = 1 << 3;
pub const NOTIFY: u32 = 1 << 4;

fn failure(op: &str) -> Error {
    Error::new(ErrorKind::Other, None, format!("{op} failed"))
}

/// An [`EventStack`] that advertises a scripted set of peripherals and serves a scripted GATT tree.
#[derive(Default)]
pub struct FakeEventStack {
    listener: Mutex<Option<StackListener>>,
    state: Mutex<Option<PowerState>>,
    adapters: Mutex<Vec<NativeAdapter>>,
    advertisements: Mutex<Vec<NativePeripheral>>,
    gatt: Mutex<Gatt>,
    failing: Mutex<HashSet<&'static str>>,
    drop_on_connect: Mutex<bool>,
    calls: Mutex<Vec<String>>,
}

#[derive(Default)]
struct Gatt {
    next: u64,
    services: HashMap<String, Vec<NativeService>>,
    included: HashMap<NativeId, Vec<NativeService>>,
    characteristics: HashMap<NativeId, Vec<NativeCharacteristic>>,
    descriptors: HashMap<NativeId, Vec<NativeDescriptor>>,
    values: HashMap<NativeId, Vec<u8>>,
    writes: Vec<(NativeId, Vec<u8>, bool)>,
}

impl Gatt {
    fn next_id(&mut self) -> NativeId {
        self.next += 1;
        NativeId(self.next)
    }
}

impl FakeEventStack {
    pub fn powered_on() -> Arc<Self> {
        let stack = FakeEventStack::default();
        *stack.state.lock().unwrap() = Some(PowerState::PoweredOn);
        Arc::new(stack)
    }

    pub fn unknown_state() -> Arc<Self> {
        Arc::new(FakeEventStack::default())
    }

    pub fn backend(self: &Arc<Self>) -> Backend {
        Backend::event_stream(self.clone())
    }

    pub async fn bluetooth(self: &Arc<Self>, options: BluetoothOptions) -> Bluetooth {
        Bluetooth::new(self.backend(), options).await.unwrap()
    }

    /// Advertised every time scanning starts.
    pub fn advertise(&self, peripheral: NativePeripheral) {
        self.advertisements.lock().unwrap().push(peripheral);
    }

    pub fn set_adapters(&self, adapters: &[&str]) {
        *self.adapters.lock().unwrap() = adapters
            .iter()
            .map(|x| NativeAdapter {
                identifier: x.to_string(),
                address: None,
            })
            .collect();
    }

    pub fn fail(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    /// The next `connect` reports a disconnection before it succeeds.
    pub fn drop_next_connection(&self) {
        *self.drop_on_connect.lock().unwrap() = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|x| x.as_str() == op).count()
    }

    pub fn writes(&self) -> Vec<(NativeId, Vec<u8>, bool)> {
        self.gatt.lock().unwrap().writes.clone()
    }

    pub fn add_service(&self, peripheral: &str, uuid: Uuid) -> NativeId {
        let mut gatt = self.gatt.lock().unwrap();
        let id = gatt.next_id();
        gatt.services
            .entry(peripheral.to_string())
            .or_default()
            .push(NativeService { id, uuid });
        id
    }

    pub fn add_included_service(&self, service: NativeId, uuid: Uuid) -> NativeId {
        let mut gatt = self.gatt.lock().unwrap();
        let id = gatt.next_id();
        gatt.included.entry(service).or_default().push(NativeService { id, uuid });
        id
    }

    pub fn add_characteristic(&self, service: NativeId, uuid: Uuid, properties: u32) -> NativeId {
        let mut gatt = self.gatt.lock().unwrap();
        let id = gatt.next_id();
        gatt.characteristics
            .entry(service)
            .or_default()
            .push(NativeCharacteristic {
                id,
                uuid,
                properties: CharacteristicProperties::from_bits(properties),
            });
        id
    }

    pub fn add_descriptor(&self, characteristic: NativeId, uuid: Uuid) -> NativeId {
        let mut gatt = self.gatt.lock().unwrap();
        let id = gatt.next_id();
        gatt.descriptors
            .entry(characteristic)
            .or_default()
            .push(NativeDescriptor { id, uuid });
        id
    }

    pub fn set_value(&self, id: NativeId, value: &[u8]) {
        self.gatt.lock().unwrap().values.insert(id, value.to_vec());
    }

    pub fn set_state(&self, state: PowerState) {
        *self.state.lock().unwrap() = Some(state);
        self.emit(StackEvent::StateChange(state));
    }

    pub fn emit(&self, event: StackEvent) {
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener(event);
        }
    }

    fn call(&self, op: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(op.to_string());
        if self.failing.lock().unwrap().contains(op) {
            Err(failure(op))
        } else {
            Ok(())
        }
    }
}

fn filtered<T: Clone>(items: Option<&Vec<T>>, uuids: &[Uuid], uuid: impl Fn(&T) -> Uuid) -> Vec<T> {
    items
        .into_iter()
        .flatten()
        .filter(|x| uuids.is_empty() || uuids.contains(&uuid(x)))
        .cloned()
        .collect()
}

#[async_trait]
impl EventStack for FakeEventStack {
    fn set_listener(&self, listener: StackListener) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn state(&self) -> PowerState {
        self.state.lock().unwrap().unwrap_or(PowerState::Unknown)
    }

    async fn adapters(&self) -> Result<Vec<NativeAdapter>> {
        self.call("adapters")?;
        Ok(self.adapters.lock().unwrap().clone())
    }

    async fn use_adapter(&self, index: usize) -> Result<()> {
        self.call("use_adapter")?;
        if index >= self.adapters.lock().unwrap().len() {
            return Err(Error::new(ErrorKind::InvalidParameter, None, "no such adapter"));
        }
        Ok(())
    }

    async fn start_scanning(&self, _services: &[Uuid], _allow_duplicates: bool) -> Result<()> {
        self.call("start_scanning")?;
        let advertisements = self.advertisements.lock().unwrap().clone();
        for peripheral in advertisements {
            self.emit(StackEvent::Discover(peripheral));
        }
        Ok(())
    }

    fn stop_scanning(&self) {
        let _ = self.call("stop_scanning");
    }

    async fn connect(&self, peripheral: &str) -> Result<()> {
        self.call("connect")?;
        let dropped = std::mem::take(&mut *self.drop_on_connect.lock().unwrap());
        if dropped {
            self.emit(StackEvent::Disconnect(peripheral.to_string()));
        }
        Ok(())
    }

    async fn disconnect(&self, peripheral: &str) -> Result<()> {
        self.call("disconnect")?;
        self.emit(StackEvent::Disconnect(peripheral.to_string()));
        Ok(())
    }

    async fn discover_services(&self, peripheral: &str, uuids: &[Uuid]) -> Result<Vec<NativeService>> {
        self.call("discover_services")?;
        let gatt = self.gatt.lock().unwrap();
        Ok(filtered(gatt.services.get(peripheral), uuids, |x| x.uuid))
    }

    async fn discover_included_services(&self, service: NativeId, uuids: &[Uuid]) -> Result<Vec<NativeService>> {
        self.call("discover_included_services")?;
        let gatt = self.gatt.lock().unwrap();
        Ok(filtered(gatt.included.get(&service), uuids, |x| x.uuid))
    }

    async fn discover_characteristics(
        &self,
        service: NativeId,
        uuids: &[Uuid],
    ) -> Result<Vec<NativeCharacteristic>> {
        self.call("discover_characteristics")?;
        let gatt = self.gatt.lock().unwrap();
        Ok(filtered(gatt.characteristics.get(&service), uuids, |x| x.uuid))
    }

    async fn discover_descriptors(&self, characteristic: NativeId) -> Result<Vec<NativeDescriptor>> {
        self.call("discover_descriptors")?;
        let gatt = self.gatt.lock().unwrap();
        Ok(filtered(gatt.descriptors.get(&characteristic), &[], |x| x.uuid))
    }

    async fn read(&self, characteristic: NativeId) -> Result<Vec<u8>> {
        self.call("read")?;
        Ok(self
            .gatt
            .lock()
            .unwrap()
            .values
            .get(&characteristic)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(&self, characteristic: NativeId, data: &[u8], without_response: bool) -> Result<()> {
        self.call("write")?;
        let mut gatt = self.gatt.lock().unwrap();
        gatt.writes.push((characteristic, data.to_vec(), without_response));
        gatt.values.insert(characteristic, data.to_vec());
        Ok(())
    }

    async fn set_notify(&self, _characteristic: NativeId, enable: bool) -> Result<()> {
        self.call(if enable { "notify_on" } else { "notify_off" })
    }

    async fn read_descriptor(&self, descriptor: NativeId) -> Result<Vec<u8>> {
        self.call("read_descriptor")?;
        Ok(self
            .gatt
            .lock()
            .unwrap()
            .values
            .get(&descriptor)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_descriptor(&self, descriptor: NativeId, data: &[u8]) -> Result<()> {
        self.call("write_descriptor")?;
        self.gatt.lock().unwrap().values.insert(descriptor, data.to_vec());
        Ok(())
    }
}

/// A [`HandleStack`] with a scripted scan result list and GATT tree.
#[derive(Default)]
pub struct FakeHandleStack {
    enabled: Mutex<bool>,
    adapters: Mutex<Vec<NativeAdapter>>,
    scanned: Mutex<Vec<ScannedPeripheral>>,
    layouts: Mutex<HashMap<PeripheralRef, Vec<GattServiceLayout>>>,
    values: Mutex<HashMap<(PeripheralRef, Uuid, Uuid, Option<Uuid>), Vec<u8>>>,
    on_disconnected: Mutex<HashMap<PeripheralRef, Arc<DisconnectCallback>>>,
    subscriptions: Mutex<HashMap<(PeripheralRef, Uuid, Uuid), Arc<DataCallback>>>,
    calls: Mutex<Vec<String>>,
    released: Mutex<bool>,
}

impl FakeHandleStack {
    pub fn new() -> Arc<Self> {
        let stack = FakeHandleStack::default();
        *stack.enabled.lock().unwrap() = true;
        stack.adapters.lock().unwrap().push(NativeAdapter {
            identifier: "hci0".into(),
            address: Some("00:11:22:33:44:55".into()),
        });
        Arc::new(stack)
    }

    pub fn without_adapters() -> Arc<Self> {
        Arc::new(FakeHandleStack::default())
    }

    pub fn backend(self: &Arc<Self>) -> Backend {
        Backend::sync_handle(self.clone()).unwrap()
    }

    pub async fn bluetooth(self: &Arc<Self>, options: BluetoothOptions) -> Bluetooth {
        Bluetooth::new(self.backend(), options).await.unwrap()
    }

    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.lock().unwrap() = enabled;
    }

    pub fn scan_result(&self, peripheral: ScannedPeripheral) {
        self.scanned.lock().unwrap().push(peripheral);
    }

    pub fn set_layout(&self, peripheral: PeripheralRef, layout: Vec<GattServiceLayout>) {
        self.layouts.lock().unwrap().insert(peripheral, layout);
    }

    pub fn set_value(&self, path: (PeripheralRef, Uuid, Uuid, Option<Uuid>), value: &[u8]) {
        self.values.lock().unwrap().insert(path, value.to_vec());
    }

    pub fn value(&self, path: (PeripheralRef, Uuid, Uuid, Option<Uuid>)) -> Option<Vec<u8>> {
        self.values.lock().unwrap().get(&path).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|x| x.as_str() == op).count()
    }

    pub fn is_released(&self) -> bool {
        *self.released.lock().unwrap()
    }

    /// Simulates the peripheral dropping the connection.
    pub fn drop_connection(&self, peripheral: PeripheralRef) {
        let callback = self.on_disconnected.lock().unwrap().get(&peripheral).cloned();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Simulates a notification. Returns whether anyone was subscribed.
    pub fn notify_value(&self, peripheral: PeripheralRef, service: Uuid, characteristic: Uuid, value: &[u8]) -> bool {
        let callback = self
            .subscriptions
            .lock()
            .unwrap()
            .get(&(peripheral, service, characteristic))
            .cloned();
        match callback {
            Some(callback) => {
                callback(value.to_vec());
                true
            }
            None => false,
        }
    }

    fn call(&self, op: &str) {
        self.calls.lock().unwrap().push(op.to_string());
    }
}

impl Release for FakeHandleStack {
    fn release(&self) {
        *self.released.lock().unwrap() = true;
    }
}

impl HandleStack for FakeHandleStack {
    fn adapters(&self) -> Vec<NativeAdapter> {
        self.adapters.lock().unwrap().clone()
    }

    fn is_enabled(&self) -> bool {
        *self.enabled.lock().unwrap()
    }

    fn scan_start(&self, _adapter: usize, on_found: ScanCallback) -> Result<()> {
        self.call("scan_start");
        let scanned = self.scanned.lock().unwrap().clone();
        for peripheral in scanned {
            on_found(peripheral);
        }
        Ok(())
    }

    fn scan_stop(&self, _adapter: usize) -> Result<()> {
        self.call("scan_stop");
        Ok(())
    }

    fn connect(&self, _peripheral: PeripheralRef) -> Result<()> {
        self.call("connect");
        Ok(())
    }

    fn disconnect(&self, peripheral: PeripheralRef) -> Result<()> {
        self.call("disconnect");
        self.drop_connection(peripheral);
        Ok(())
    }

    fn set_on_disconnected(&self, peripheral: PeripheralRef, callback: DisconnectCallback) {
        self.on_disconnected.lock().unwrap().insert(peripheral, Arc::new(callback));
    }

    fn services(&self, peripheral: PeripheralRef) -> Result<Vec<GattServiceLayout>> {
        self.call("services");
        Ok(self.layouts.lock().unwrap().get(&peripheral).cloned().unwrap_or_default())
    }

    fn read(&self, peripheral: PeripheralRef, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        self.call("read");
        self.value((peripheral, service, characteristic, None))
            .ok_or_else(|| Error::new(ErrorKind::NotFound, None, "no value"))
    }

    fn write_request(&self, peripheral: PeripheralRef, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()> {
        self.call("write_request");
        self.set_value((peripheral, service, characteristic, None), data);
        Ok(())
    }

    fn write_command(&self, peripheral: PeripheralRef, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()> {
        self.call("write_command");
        self.set_value((peripheral, service, characteristic, None), data);
        Ok(())
    }

    fn notify(
        &self,
        peripheral: PeripheralRef,
        service: Uuid,
        characteristic: Uuid,
        callback: DataCallback,
    ) -> Result<()> {
        self.call("notify");
        self.subscriptions
            .lock()
            .unwrap()
            .insert((peripheral, service, characteristic), Arc::new(callback));
        Ok(())
    }

    fn unsubscribe(&self, peripheral: PeripheralRef, service: Uuid, characteristic: Uuid) -> Result<()> {
        self.call("unsubscribe");
        self.subscriptions
            .lock()
            .unwrap()
            .remove(&(peripheral, service, characteristic));
        Ok(())
    }

    fn read_descriptor(
        &self,
        peripheral: PeripheralRef,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<Vec<u8>> {
        self.call("read_descriptor");
        self.value((peripheral, service, characteristic, Some(descriptor)))
            .ok_or_else(|| Error::new(ErrorKind::NotFound, None, "no value"))
    }

    fn write_descriptor(
        &self,
        peripheral: PeripheralRef,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        data: &[u8],
    ) -> Result<()> {
        self.call("write_descriptor");
        self.set_value((peripheral, service, characteristic, Some(descriptor)), data);
        Ok(())
    }
}
