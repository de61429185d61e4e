#![warn(missing_docs)]

//! Webble is a [Web Bluetooth] style API for [Bluetooth Low Energy] (BLE) in [Rust]. It lets an application scan for
//! peripherals, connect, walk the remote GATT tree and read, write and subscribe to characteristics, while the radio
//! work is delegated to an interchangeable native Bluetooth stack.
//!
//! [Rust]: https://www.rust-lang.org/
//! [Web Bluetooth]: https://webbluetoothcg.github.io/web-bluetooth/
//! [Bluetooth Low Energy]: https://www.bluetooth.com/specifications/specs/
//!
//! # Usage
//!
//! ```rust,no_run
//!# use webble::{Backend, Bluetooth, BluetoothOptions, RequestDeviceOptions, ScanFilter};
//!# async fn run(backend: Backend) -> Result<(), Box<dyn std::error::Error>> {
//!let bluetooth = Bluetooth::new(backend, BluetoothOptions::default()).await?;
//!
//!let device = bluetooth
//!    .request_device(RequestDeviceOptions::with_filters(vec![ScanFilter::services(["heart_rate"])]))
//!    .await?;
//!println!("found {}", device.name());
//!
//!let server = device.gatt();
//!server.connect().await?;
//!let service = server.get_primary_service("heart_rate").await?;
//!let measurement = service.get_characteristic("heart_rate_measurement").await?;
//!measurement.start_notifications().await?;
//!#    Ok(())
//!# }
//! ```
//!
//! # Overview
//!
//! - Device discovery:
//!   - [Requesting][Bluetooth::request_device] a single device matching a set of [filters][ScanFilter]
//!   - [Listing][Bluetooth::get_devices] the devices previously granted to this instance
//!   - [Continuous scanning][Bluetooth::scan] for long-running programs
//! - Accessing remote GATT services:
//!   - [Connecting][RemoteGattServer::connect] and discovering [primary services][RemoteGattServer::get_primary_services]
//!   - Discovering service [characteristics][Service::get_characteristics] and
//!     [included services][Service::get_included_services]
//!   - Discovering characteristic [descriptors][Characteristic::get_descriptors]
//!   - [Read][Characteristic::read_value], [write][Characteristic::write_value] and
//!     [notify][Characteristic::start_notifications] operations on characteristics
//! - Events bubbling from characteristics through services and devices up to the [`Bluetooth`] instance, see
//!   [`events`].
//!
//! # Backends
//!
//! Native stacks come in two shapes, both described in [`native`]:
//!
//! - [`EventStack`][native::EventStack] pushes discovery, disconnect and notification events to a listener and
//!   identifies GATT objects by native id.
//! - [`HandleStack`][native::HandleStack] is a set of synchronous calls that need the full UUID path of an attribute
//!   for every operation.
//!
//! A [`Backend`] wraps either one and normalizes it into a single asynchronous operation set.
//!
//! # Asynchronous runtimes
//!
//! Webble does not spawn tasks and should work with any asynchronous runtime. The optional `bluez` stack is built on
//! `bluer`, which requires Tokio.
//!
//! # Feature flags
//!
//! - `serde` enables serializing/deserializing device identifiers, options and UUID inputs.
//! - `bluez` enables the Linux [`bluez`] event stack.

pub mod btuuid;
pub mod error;
pub mod events;
pub mod native;
pub mod session;

mod backend;
mod bluetooth;
mod characteristic;
mod descriptor;
mod device;
mod discovery;
mod handles;
mod options;
mod server;
mod service;
mod util;

#[cfg(all(feature = "bluez", target_os = "linux"))]
pub mod bluez;

use std::collections::HashMap;

pub use backend::{Backend, HandleBackend, StreamBackend};
pub use bluetooth::Bluetooth;
pub use btuuid::{BluetoothUuidExt, UuidInput};
pub use characteristic::Characteristic;
pub use descriptor::Descriptor;
pub use device::Device;
pub use discovery::DeviceSelector;
pub use error::Error;
pub use options::{BluetoothOptions, DataFilter, RequestDeviceOptions, ScanFilter};
pub use server::RemoteGattServer;
pub use service::Service;
pub use uuid::Uuid;

/// Convenience alias for a result with [`Error`]
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// A peripheral identifier: the Bluetooth address where the stack exposes one, otherwise a stack-assigned name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId(pub(crate) String);

impl DeviceId {
    /// Creates an identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    /// The string form of this identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Data included in a Bluetooth advertisement or scan reponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementData {
    /// Advertised GATT service UUIDs (CSS §A.1.1)
    pub services: Vec<Uuid>,
    /// Service associated data (CSS §A.1.11)
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Manufacturer specific data keyed by company identifier (CSS §A.1.4)
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// The signal strength in dBm of the received advertisement packet
    pub rssi: Option<i16>,
    /// Transmitted power level (CSS §A.1.5)
    pub tx_power_level: Option<i16>,
}

/// A peripheral as reported by a single discovery event.
///
/// Each sighting produces a fresh record. A later sighting of the same peripheral supersedes the earlier record
/// rather than being merged into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeripheral {
    /// The peripheral identifier
    pub id: DeviceId,
    /// The (possibly shortened) local name of the device
    pub name: Option<String>,
    /// The advertisement data
    pub adv_data: AdvertisementData,
}

/// A radio known to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdapterInfo {
    /// Position of the adapter in the backend's adapter list
    pub index: usize,
    /// The adapter's Bluetooth address, or a platform identifier if the address is unknown
    pub address: String,
    /// Whether this is the adapter currently in use
    pub active: bool,
}

/// GATT characteristic properties as defined in the Bluetooth Core Specification, Vol 3, Part G, §3.3.1.1.
/// Extended properties are also included as defined in §3.3.3.1.
#[allow(missing_docs)]
#[non_exhaustive]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProperties {
    pub broadcast: bool,
    pub read: bool,
    pub write_without_response: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
    pub authenticated_signed_writes: bool,
    pub extended_properties: bool,
    pub reliable_write: bool,
    pub writable_auxiliaries: bool,
}

impl CharacteristicProperties {
    /// Raw transmutation from [`u32`].
    ///
    /// Extended properties are in the upper bits.
    pub fn from_bits(bits: u32) -> Self {
        CharacteristicProperties {
            broadcast: (bits & (1 << 0)) != 0,
            read: (bits & (1 << 1)) != 0,
            write_without_response: (bits & (1 << 2)) != 0,
            write: (bits & (1 << 3)) != 0,
            notify: (bits & (1 << 4)) != 0,
            indicate: (bits & (1 << 5)) != 0,
            authenticated_signed_writes: (bits & (1 << 6)) != 0,
            extended_properties: (bits & (1 << 7)) != 0,
            reliable_write: (bits & (1 << 8)) != 0,
            writable_auxiliaries: (bits & (1 << 9)) != 0,
        }
    }

    /// Raw transmutation to [`u32`].
    ///
    /// Extended properties are in the upper bits.
    pub fn to_bits(self) -> u32 {
        u32::from(self.broadcast)
            | (u32::from(self.read) << 1)
            | (u32::from(self.write_without_response) << 2)
            | (u32::from(self.write) << 3)
            | (u32::from(self.notify) << 4)
            | (u32::from(self.indicate) << 5)
            | (u32::from(self.authenticated_signed_writes) << 6)
            | (u32::from(self.extended_properties) << 7)
            | (u32::from(self.reliable_write) << 8)
            | (u32::from(self.writable_auxiliaries) << 9)
    }

    /// Whether a write that does not say otherwise should be sent without response.
    pub(crate) fn prefers_write_without_response(self) -> bool {
        self.write_without_response || self.authenticated_signed_writes
    }
}
