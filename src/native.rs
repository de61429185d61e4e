//! Interfaces implemented by native Bluetooth stacks
//!
//! The radio itself is driven by a native stack outside this crate. Stacks come in two shapes and a
//! [`Backend`][crate::Backend] adapts either one to the same asynchronous operation set.
//!
//! An [`EventStack`] reports everything that happens on the radio (power state, advertisements, disconnections and
//! characteristic notifications) as [`StackEvent`]s pushed to a single listener, and identifies GATT objects with
//! [`NativeId`]s it assigns itself.
//!
//! A [`HandleStack`] is a set of synchronous calls. Scanning and connection state are reported through callbacks,
//! GATT structure is returned as a complete tree after connecting, and every attribute operation must be addressed by
//! the full UUID path of the attribute.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::session::Release;
use crate::{CharacteristicProperties, Result};

/// Power state of the radio behind an [`EventStack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerState {
    /// The stack has not reported a state yet.
    Unknown,
    /// The radio is off, unauthorized or unsupported.
    PoweredOff,
    /// The radio is on and usable.
    PoweredOn,
}

/// An opaque reference to a GATT object owned by an [`EventStack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NativeId(pub u64);

/// An advertisement as reported by an [`EventStack`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativePeripheral {
    /// The stack's identifier for the peripheral.
    pub id: String,
    /// The Bluetooth address, if the platform exposes it. Some stacks report `"unknown"`.
    pub address: Option<String>,
    /// The advertised local name.
    pub local_name: Option<String>,
    /// Advertised service UUIDs in any form accepted by [`canonical_uuid`][crate::btuuid::canonical_uuid].
    pub service_uuids: Vec<String>,
    /// Service data keyed by service UUID in any form accepted by
    /// [`canonical_uuid`][crate::btuuid::canonical_uuid].
    pub service_data: Vec<(String, Vec<u8>)>,
    /// Raw manufacturer specific data: a little-endian company identifier followed by the payload.
    pub manufacturer_data: Option<Vec<u8>>,
    /// Received signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertised transmit power in dBm.
    pub tx_power_level: Option<i16>,
}

/// A service reported by an [`EventStack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeService {
    /// The stack's reference to the service
    pub id: NativeId,
    /// The service UUID
    pub uuid: Uuid,
}

/// A characteristic reported by an [`EventStack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCharacteristic {
    /// The stack's reference to the characteristic
    pub id: NativeId,
    /// The characteristic UUID
    pub uuid: Uuid,
    /// The characteristic properties
    pub properties: CharacteristicProperties,
}

/// A descriptor reported by an [`EventStack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeDescriptor {
    /// The stack's reference to the descriptor
    pub id: NativeId,
    /// The descriptor UUID
    pub uuid: Uuid,
}

/// A radio as reported by a native stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeAdapter {
    /// The platform's name for the adapter, e.g. `hci0`.
    pub identifier: String,
    /// The adapter's Bluetooth address.
    pub address: Option<String>,
}

/// Something that happened on the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    /// The radio changed power state.
    StateChange(PowerState),
    /// An advertisement was received while scanning.
    Discover(NativePeripheral),
    /// A peripheral disconnected, whether requested or not.
    Disconnect(String),
    /// A subscribed characteristic sent a notification or indication.
    Data {
        /// The characteristic the value belongs to
        characteristic: NativeId,
        /// The value
        value: Vec<u8>,
    },
}

/// Receives every [`StackEvent`] of an [`EventStack`].
pub type StackListener = Arc<dyn Fn(StackEvent) + Send + Sync>;

/// A native stack that reports radio activity as a stream of events.
///
/// Peripherals are addressed by their stack identifier ([`NativePeripheral::id`]) and GATT objects by [`NativeId`].
#[async_trait]
pub trait EventStack: Send + Sync + 'static {
    /// Installs the listener that receives all further events. Replaces any previous listener.
    fn set_listener(&self, listener: StackListener);

    /// The current power state.
    fn state(&self) -> PowerState;

    /// The radios available to this stack. Stacks bound to a single radio may return an empty list.
    async fn adapters(&self) -> Result<Vec<NativeAdapter>> {
        Ok(Vec::new())
    }

    /// Switches to the radio at `index` in [`adapters`][Self::adapters].
    async fn use_adapter(&self, index: usize) -> Result<()>;

    /// Starts scanning, restricted to peripherals advertising one of `services` if it is not empty. Returns once
    /// scanning has begun.
    async fn start_scanning(&self, services: &[Uuid], allow_duplicates: bool) -> Result<()>;

    /// Stops scanning.
    fn stop_scanning(&self);

    /// Connects to a peripheral.
    async fn connect(&self, peripheral: &str) -> Result<()>;

    /// Disconnects from a peripheral.
    async fn disconnect(&self, peripheral: &str) -> Result<()>;

    /// Discovers the primary services of a peripheral, all of them if `uuids` is empty.
    async fn discover_services(&self, peripheral: &str, uuids: &[Uuid]) -> Result<Vec<NativeService>>;

    /// Discovers the services included by `service`, all of them if `uuids` is empty.
    async fn discover_included_services(&self, service: NativeId, uuids: &[Uuid]) -> Result<Vec<NativeService>>;

    /// Discovers the characteristics of `service`, all of them if `uuids` is empty.
    async fn discover_characteristics(&self, service: NativeId, uuids: &[Uuid])
        -> Result<Vec<NativeCharacteristic>>;

    /// Discovers all descriptors of `characteristic`.
    async fn discover_descriptors(&self, characteristic: NativeId) -> Result<Vec<NativeDescriptor>>;

    /// Reads a characteristic.
    async fn read(&self, characteristic: NativeId) -> Result<Vec<u8>>;

    /// Writes a characteristic.
    async fn write(&self, characteristic: NativeId, data: &[u8], without_response: bool) -> Result<()>;

    /// Subscribes to or unsubscribes from notifications and indications of a characteristic.
    async fn set_notify(&self, characteristic: NativeId, enable: bool) -> Result<()>;

    /// Reads a descriptor.
    async fn read_descriptor(&self, descriptor: NativeId) -> Result<Vec<u8>>;

    /// Writes a descriptor.
    async fn write_descriptor(&self, descriptor: NativeId, data: &[u8]) -> Result<()>;
}

/// An opaque reference to a peripheral owned by a [`HandleStack`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeripheralRef(pub u64);

/// A scan result as reported by a [`HandleStack`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScannedPeripheral {
    /// The stack's reference to the peripheral.
    pub peripheral: PeripheralRef,
    /// The platform identifier of the peripheral, usually its advertised name.
    pub identifier: String,
    /// The Bluetooth address, empty if unknown.
    pub address: String,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// Advertised service data.
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Advertised manufacturer data keyed by company identifier.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Received signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertised transmit power in dBm.
    pub tx_power_level: Option<i16>,
}

/// The layout of one service as reported by [`HandleStack::services`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattServiceLayout {
    /// The service UUID
    pub uuid: Uuid,
    /// The characteristics of the service
    pub characteristics: Vec<GattCharacteristicLayout>,
}

/// The layout of one characteristic as reported by [`HandleStack::services`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristicLayout {
    /// The characteristic UUID
    pub uuid: Uuid,
    /// The characteristic properties
    pub properties: CharacteristicProperties,
    /// The UUIDs of the characteristic's descriptors
    pub descriptors: Vec<Uuid>,
}

/// Called for every scan result while scanning.
pub type ScanCallback = Box<dyn Fn(ScannedPeripheral) + Send + Sync>;
/// Called when a peripheral disconnects.
pub type DisconnectCallback = Box<dyn Fn() + Send + Sync>;
/// Called with every notified value of a subscribed characteristic.
pub type DataCallback = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// A native stack with a synchronous, handle based API.
///
/// Attributes are addressed by the UUID path `peripheral → service → characteristic → descriptor`. Calls may block
/// until the radio operation completes.
pub trait HandleStack: Release + Send + Sync + 'static {
    /// The radios available to this stack.
    fn adapters(&self) -> Vec<NativeAdapter>;

    /// Whether Bluetooth is enabled on this system.
    fn is_enabled(&self) -> bool;

    /// Starts scanning on `adapter`, reporting every scan result to `on_found`.
    fn scan_start(&self, adapter: usize, on_found: ScanCallback) -> Result<()>;

    /// Stops scanning on `adapter`.
    fn scan_stop(&self, adapter: usize) -> Result<()>;

    /// Connects to a peripheral.
    fn connect(&self, peripheral: PeripheralRef) -> Result<()>;

    /// Disconnects from a peripheral.
    fn disconnect(&self, peripheral: PeripheralRef) -> Result<()>;

    /// Installs the callback run whenever `peripheral` disconnects.
    fn set_on_disconnected(&self, peripheral: PeripheralRef, callback: DisconnectCallback);

    /// The complete GATT tree of a connected peripheral.
    fn services(&self, peripheral: PeripheralRef) -> Result<Vec<GattServiceLayout>>;

    /// Reads a characteristic.
    fn read(&self, peripheral: PeripheralRef, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Writes a characteristic, waiting for the response.
    fn write_request(&self, peripheral: PeripheralRef, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Writes a characteristic without response.
    fn write_command(&self, peripheral: PeripheralRef, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Subscribes to notifications or indications of a characteristic.
    fn notify(&self, peripheral: PeripheralRef, service: Uuid, characteristic: Uuid, callback: DataCallback)
        -> Result<()>;

    /// Unsubscribes from a characteristic.
    fn unsubscribe(&self, peripheral: PeripheralRef, service: Uuid, characteristic: Uuid) -> Result<()>;

    /// Reads a descriptor.
    fn read_descriptor(
        &self,
        peripheral: PeripheralRef,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<Vec<u8>>;

    /// Writes a descriptor.
    fn write_descriptor(
        &self,
        peripheral: PeripheralRef,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        data: &[u8],
    ) -> Result<()>;
}
