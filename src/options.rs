use std::time::Duration;

use crate::btuuid::UuidInput;

/// Scan time used when none is configured, matching the Web Bluetooth reference chooser.
pub const DEFAULT_SCAN_TIME: Duration = Duration::from_millis(10_240);

/// Settle delay after a write without response on stacks that do not preserve write ordering.
const DEFAULT_WRITE_SETTLE_DELAY: Duration = Duration::from_millis(25);

/// Configuration of a [`Bluetooth`][crate::Bluetooth] instance.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct BluetoothOptions {
    /// How long `request_device` and `get_devices` scan before giving up.
    pub scan_time: Duration,
    /// Return every discovered device from `get_devices`, not only the ones granted to this instance.
    pub allow_all_devices: bool,
    /// The adapter to use. Defaults to the first one reported by the backend.
    pub adapter_index: Option<usize>,
    /// Delay after a write without response on the event-stream backend.
    ///
    /// CoreBluetooth keeps writes ordered on its own, so the default is `None` on macOS and iOS.
    pub write_settle_delay: Option<Duration>,
}

impl Default for BluetoothOptions {
    fn default() -> Self {
        BluetoothOptions {
            scan_time: DEFAULT_SCAN_TIME,
            allow_all_devices: false,
            adapter_index: None,
            write_settle_delay: if cfg!(any(target_os = "macos", target_os = "ios")) {
                None
            } else {
                Some(DEFAULT_WRITE_SETTLE_DELAY)
            },
        }
    }
}

impl BluetoothOptions {
    /// Sets [`scan_time`][Self::scan_time].
    pub fn with_scan_time(mut self, scan_time: Duration) -> Self {
        self.scan_time = scan_time;
        self
    }

    /// Sets [`allow_all_devices`][Self::allow_all_devices].
    pub fn with_allow_all_devices(mut self, allow_all_devices: bool) -> Self {
        self.allow_all_devices = allow_all_devices;
        self
    }

    /// Sets [`adapter_index`][Self::adapter_index].
    pub fn with_adapter_index(mut self, index: usize) -> Self {
        self.adapter_index = Some(index);
        self
    }

    /// Sets [`write_settle_delay`][Self::write_settle_delay].
    pub fn with_write_settle_delay(mut self, delay: Option<Duration>) -> Self {
        self.write_settle_delay = delay;
        self
    }
}

/// Options for [`Bluetooth::request_device`][crate::Bluetooth::request_device] and
/// [`Bluetooth::scan`][crate::Bluetooth::scan].
///
/// Exactly one of `filters` and `accept_all_devices` must be given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct RequestDeviceOptions {
    /// A device is accepted if any one of these filters matches it.
    pub filters: Vec<ScanFilter>,
    /// Accept every device regardless of its advertisement.
    pub accept_all_devices: bool,
    /// Services the caller intends to use besides those named in `filters`.
    pub optional_services: Vec<UuidInput>,
}

impl RequestDeviceOptions {
    /// Options matching any of `filters`.
    pub fn with_filters(filters: Vec<ScanFilter>) -> Self {
        RequestDeviceOptions {
            filters,
            ..Default::default()
        }
    }

    /// Options accepting every device.
    pub fn accept_all() -> Self {
        RequestDeviceOptions {
            accept_all_devices: true,
            ..Default::default()
        }
    }

    /// Adds `services` to [`optional_services`][Self::optional_services].
    pub fn with_optional_services<I, U>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = U>,
        U: Into<UuidInput>,
    {
        self.optional_services.extend(services.into_iter().map(Into::into));
        self
    }
}

/// One filter clause. It matches a device when every condition that is set holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct ScanFilter {
    /// The advertised name must equal this.
    pub name: Option<String>,
    /// The advertised name must start with this (case-sensitive).
    pub name_prefix: Option<String>,
    /// Every one of these services must be advertised.
    pub services: Vec<UuidInput>,
    /// Every one of these service data entries must be advertised.
    pub service_data: Vec<DataFilter<UuidInput>>,
    /// Every one of these manufacturer data entries must be advertised.
    pub manufacturer_data: Vec<DataFilter<u16>>,
}

impl ScanFilter {
    /// A filter on the exact advertised name.
    pub fn name(name: impl Into<String>) -> Self {
        ScanFilter {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// A filter on the start of the advertised name.
    pub fn name_prefix(prefix: impl Into<String>) -> Self {
        ScanFilter {
            name_prefix: Some(prefix.into()),
            ..Default::default()
        }
    }

    /// A filter on advertised services.
    pub fn services<I, U>(services: I) -> Self
    where
        I: IntoIterator<Item = U>,
        U: Into<UuidInput>,
    {
        ScanFilter {
            services: services.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Adds a service data condition.
    pub fn with_service_data(mut self, filter: DataFilter<UuidInput>) -> Self {
        self.service_data.push(filter);
        self
    }

    /// Adds a manufacturer data condition.
    pub fn with_manufacturer_data(mut self, filter: DataFilter<u16>) -> Self {
        self.manufacturer_data.push(filter);
        self
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.name_prefix.is_none()
            && self.services.is_empty()
            && self.service_data.is_empty()
            && self.manufacturer_data.is_empty()
    }
}

/// A service data or manufacturer data condition.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataFilter<K> {
    /// The service UUID or company identifier that must be present.
    pub key: K,
    /// If set, the advertised bytes must start with these.
    pub data_prefix: Option<Vec<u8>>,
}

impl<K> DataFilter<K> {
    /// A condition satisfied by the presence of `key`.
    pub fn new(key: impl Into<K>) -> Self {
        DataFilter {
            key: key.into(),
            data_prefix: None,
        }
    }

    /// Also requires the advertised bytes to start with `prefix`.
    pub fn with_prefix(mut self, prefix: impl Into<Vec<u8>>) -> Self {
        self.data_prefix = Some(prefix.into());
        self
    }
}
