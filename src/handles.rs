//! Arena of GATT attribute handles.
//!
//! Handles are allocated from an increasing counter and never reused, so a handle that outlived its connection can
//! never alias a newer attribute. Deleted entries are dropped from the arena. Each entry records its parent, which
//! makes ancestry resolution a pure lookup.

use std::collections::HashMap;

use tracing::debug;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::native::GattServiceLayout;
use crate::{CharacteristicProperties, DeviceId, Error, Result};

/// Opaque identifier of a service, characteristic or descriptor within one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Handle(u32);

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleKind {
    Service,
    Characteristic,
    Descriptor,
}

impl HandleKind {
    fn name(self) -> &'static str {
        match self {
            HandleKind::Service => "service",
            HandleKind::Characteristic => "characteristic",
            HandleKind::Descriptor => "descriptor",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Entry<N> {
    pub kind: HandleKind,
    pub uuid: Uuid,
    pub parent: Option<Handle>,
    pub peripheral: DeviceId,
    pub properties: CharacteristicProperties,
    pub native: N,
}

/// A resolved attribute: its UUID and the backend's native reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Node<N> {
    pub uuid: Uuid,
    pub native: N,
}

/// The full path from a peripheral down to an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Ancestry<N> {
    pub peripheral: DeviceId,
    pub service: Node<N>,
    pub characteristic: Option<Node<N>>,
    pub descriptor: Option<Node<N>>,
}

/// Handle bookkeeping for one backend, generic over the backend's native attribute reference.
pub(crate) struct HandleArena<N> {
    next: u32,
    entries: HashMap<Handle, Entry<N>>,
    by_peripheral: HashMap<DeviceId, Vec<Handle>>,
    callbacks: HashMap<Handle, ValueCallback>,
}

pub(crate) type ValueCallback = std::sync::Arc<dyn Fn(Vec<u8>) + Send + Sync>;

impl<N> Default for HandleArena<N> {
    fn default() -> Self {
        HandleArena {
            next: 0,
            entries: HashMap::new(),
            by_peripheral: HashMap::new(),
            callbacks: HashMap::new(),
        }
    }
}

fn not_found(handle: Handle) -> Error {
    Error::new(ErrorKind::NotFound, None, format!("handle {handle} is no longer valid"))
}

impl<N: Clone + PartialEq> HandleArena<N> {
    /// Records an attribute and returns its handle.
    ///
    /// Registering the same native object under the same parent twice returns the existing handle.
    pub fn insert(
        &mut self,
        peripheral: &DeviceId,
        parent: Option<Handle>,
        kind: HandleKind,
        uuid: Uuid,
        properties: CharacteristicProperties,
        native: N,
    ) -> Result<Handle> {
        if let Some(parent) = parent {
            self.entry(parent)?;
        }

        if let Some(existing) = self.by_peripheral.get(peripheral).and_then(|handles| {
            handles.iter().copied().find(|h| {
                self.entries
                    .get(h)
                    .is_some_and(|e| e.parent == parent && e.kind == kind && e.native == native)
            })
        }) {
            return Ok(existing);
        }

        self.push(peripheral, parent, kind, uuid, properties, native)
    }

    fn push(
        &mut self,
        peripheral: &DeviceId,
        parent: Option<Handle>,
        kind: HandleKind,
        uuid: Uuid,
        properties: CharacteristicProperties,
        native: N,
    ) -> Result<Handle> {
        let handle = Handle(self.next);
        self.next = self
            .next
            .checked_add(1)
            .ok_or_else(|| Error::new(ErrorKind::Internal, None, "attribute handles exhausted"))?;
        self.entries.insert(
            handle,
            Entry {
                kind,
                uuid,
                parent,
                peripheral: peripheral.clone(),
                properties,
                native,
            },
        );
        self.by_peripheral.entry(peripheral.clone()).or_default().push(handle);
        Ok(handle)
    }

    /// Releases every handle of `peripheral` together with its value callbacks. Returns how many were released.
    pub fn delete_handles(&mut self, peripheral: &DeviceId) -> usize {
        let handles = self.by_peripheral.remove(peripheral).unwrap_or_default();
        for handle in &handles {
            self.entries.remove(handle);
            self.callbacks.remove(handle);
        }
        if !handles.is_empty() {
            debug!("released {} handles of {}", handles.len(), peripheral);
        }
        handles.len()
    }

    pub fn entry(&self, handle: Handle) -> Result<&Entry<N>> {
        self.entries.get(&handle).ok_or_else(|| not_found(handle))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Looks up `handle`, failing unless it is of the expected kind.
    pub fn entry_of_kind(&self, handle: Handle, kind: HandleKind) -> Result<&Entry<N>> {
        let entry = self.entry(handle)?;
        if entry.kind != kind {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                None,
                format!("handle {handle} is a {}, not a {}", entry.kind.name(), kind.name()),
            ));
        }
        Ok(entry)
    }

    /// The live children of `parent` (or the top-level services of `peripheral` if `parent` is `None`).
    pub fn children(&self, peripheral: &DeviceId, parent: Option<Handle>, kind: HandleKind) -> Vec<(Handle, &Entry<N>)> {
        self.by_peripheral
            .get(peripheral)
            .into_iter()
            .flatten()
            .filter_map(|h| self.entries.get(h).map(|e| (*h, e)))
            .filter(|(_, e)| e.parent == parent && e.kind == kind)
            .collect()
    }

    /// Resolves the chain of ancestors of `handle`.
    pub fn resolve(&self, handle: Handle) -> Result<Ancestry<N>> {
        let mut descriptor = None;
        let mut characteristic = None;
        let mut current = handle;

        loop {
            let entry = self.entry(current)?;
            let node = Node {
                uuid: entry.uuid,
                native: entry.native.clone(),
            };
            match entry.kind {
                HandleKind::Descriptor => descriptor = Some(node),
                HandleKind::Characteristic => characteristic = Some(node),
                HandleKind::Service => {
                    return Ok(Ancestry {
                        peripheral: entry.peripheral.clone(),
                        service: node,
                        characteristic,
                        descriptor,
                    })
                }
            }
            current = entry.parent.ok_or_else(|| {
                Error::new(ErrorKind::Internal, None, format!("handle {current} has no parent service"))
            })?;
        }
    }

    pub fn set_callback(&mut self, handle: Handle, callback: ValueCallback) -> Result<()> {
        self.entry_of_kind(handle, HandleKind::Characteristic)?;
        self.callbacks.insert(handle, callback);
        Ok(())
    }

    pub fn callback(&self, handle: Handle) -> Option<ValueCallback> {
        self.callbacks.get(&handle).cloned()
    }

    pub fn remove_callback(&mut self, handle: Handle) -> Option<ValueCallback> {
        self.callbacks.remove(&handle)
    }

    /// The value callback registered for the characteristic whose native reference is `native`.
    pub fn callback_for_native(&self, native: &N) -> Option<ValueCallback> {
        self.callbacks
            .iter()
            .find(|(h, _)| self.entries.get(h).is_some_and(|e| e.native == *native))
            .map(|(_, cb)| cb.clone())
    }
}

impl HandleArena<()> {
    /// Assigns handles to a complete service tree as reported by a synchronous stack.
    ///
    /// Entries of a synchronous stack carry no native reference, so every attribute gets its own handle even when
    /// siblings share a UUID.
    pub fn create_handles(&mut self, peripheral: &DeviceId, services: &[GattServiceLayout]) -> Result<usize> {
        let none = CharacteristicProperties::default();
        let mut created = 0;
        for service in services {
            let service_handle = self.push(peripheral, None, HandleKind::Service, service.uuid, none, ())?;
            created += 1;
            for characteristic in &service.characteristics {
                let characteristic_handle = self.push(
                    peripheral,
                    Some(service_handle),
                    HandleKind::Characteristic,
                    characteristic.uuid,
                    characteristic.properties,
                    (),
                )?;
                created += 1;
                for descriptor in &characteristic.descriptors {
                    self.push(
                        peripheral,
                        Some(characteristic_handle),
                        HandleKind::Descriptor,
                        *descriptor,
                        none,
                        (),
                    )?;
                    created += 1;
                }
            }
        }
        debug!("created {} handles for {}", created, peripheral);
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btuuid::bluetooth_uuid_from_u16;
    use crate::native::GattCharacteristicLayout;

    fn layout() -> Vec<GattServiceLayout> {
        vec![
            GattServiceLayout {
                uuid: bluetooth_uuid_from_u16(0x180F),
                characteristics: vec![GattCharacteristicLayout {
                    uuid: bluetooth_uuid_from_u16(0x2A19),
                    properties: CharacteristicProperties::from_bits(0b10010),
                    descriptors: vec![bluetooth_uuid_from_u16(0x2902)],
                }],
            },
            GattServiceLayout {
                uuid: bluetooth_uuid_from_u16(0x180D),
                characteristics: vec![
                    GattCharacteristicLayout {
                        uuid: bluetooth_uuid_from_u16(0x2A37),
                        properties: CharacteristicProperties::from_bits(0b10000),
                        descriptors: vec![],
                    },
                    GattCharacteristicLayout {
                        uuid: bluetooth_uuid_from_u16(0x2A37),
                        properties: CharacteristicProperties::from_bits(0b10000),
                        descriptors: vec![],
                    },
                ],
            },
        ]
    }

    #[test]
    fn resolves_full_path_from_descriptor() {
        let device = DeviceId::new("AA:BB");
        let mut arena = HandleArena::<()>::default();
        assert_eq!(arena.create_handles(&device, &layout()).unwrap(), 6);

        let battery = arena.children(&device, None, HandleKind::Service)[0].0;
        let level = arena.children(&device, Some(battery), HandleKind::Characteristic)[0].0;
        let cccd = arena.children(&device, Some(level), HandleKind::Descriptor)[0].0;

        let path = arena.resolve(cccd).unwrap();
        assert_eq!(path.peripheral, device);
        assert_eq!(path.service.uuid, bluetooth_uuid_from_u16(0x180F));
        assert_eq!(path.characteristic.unwrap().uuid, bluetooth_uuid_from_u16(0x2A19));
        assert_eq!(path.descriptor.unwrap().uuid, bluetooth_uuid_from_u16(0x2902));
    }

    #[test]
    fn duplicate_uuids_get_distinct_handles() {
        let device = DeviceId::new("AA:BB");
        let mut arena = HandleArena::<()>::default();
        arena.create_handles(&device, &layout()).unwrap();

        let heart_rate = arena.children(&device, None, HandleKind::Service)[1].0;
        let characteristics = arena.children(&device, Some(heart_rate), HandleKind::Characteristic);
        assert_eq!(characteristics.len(), 2);
        assert_ne!(characteristics[0].0, characteristics[1].0);
    }

    #[test]
    fn deleted_handles_do_not_resolve_and_are_not_reused() {
        let device = DeviceId::new("AA:BB");
        let mut arena = HandleArena::<()>::default();
        arena.create_handles(&device, &layout()).unwrap();
        let service = arena.children(&device, None, HandleKind::Service)[0].0;
        let level = arena.children(&device, Some(service), HandleKind::Characteristic)[0].0;
        arena.set_callback(level, std::sync::Arc::new(|_| {})).unwrap();

        assert_eq!(arena.delete_handles(&device), 6);
        assert_eq!(arena.resolve(level).unwrap_err().kind(), ErrorKind::NotFound);
        assert!(arena.callback(level).is_none());
        assert_eq!(arena.len(), 0);

        arena.create_handles(&device, &layout()).unwrap();
        let fresh = arena.children(&device, None, HandleKind::Service)[0].0;
        assert!(fresh > level);
        assert_eq!(arena.len(), 6);
    }

    #[test]
    fn reconnect_cycles_do_not_grow_the_arena() {
        let device = DeviceId::new("AA:BB");
        let other = DeviceId::new("CC:DD");
        let mut arena = HandleArena::<()>::default();
        arena.create_handles(&other, &layout()).unwrap();

        for _ in 0..50 {
            arena.create_handles(&device, &layout()).unwrap();
            arena.delete_handles(&device);
        }
        assert_eq!(arena.len(), 6);
        assert_eq!(arena.children(&other, None, HandleKind::Service).len(), 2);
    }

    #[test]
    fn native_objects_are_registered_once() {
        let device = DeviceId::new("peripheral-1");
        let mut arena = HandleArena::<u64>::default();
        let uuid = bluetooth_uuid_from_u16(0x1800);
        let props = CharacteristicProperties::default();
        let a = arena.insert(&device, None, HandleKind::Service, uuid, props, 7).unwrap();
        let b = arena.insert(&device, None, HandleKind::Service, uuid, props, 7).unwrap();
        let c = arena.insert(&device, None, HandleKind::Service, uuid, props, 8).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(
            arena.entry_of_kind(a, HandleKind::Characteristic).unwrap_err().kind(),
            ErrorKind::InvalidParameter
        );
    }
}
