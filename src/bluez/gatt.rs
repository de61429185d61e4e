use std::collections::HashMap;

use bluer::gatt::remote;
use bluer::Address;

use crate::error::ErrorKind;
use crate::native::NativeId;
use crate::{CharacteristicProperties, Error, Result};

/// A remote GATT object known to the stack.
#[derive(Debug, Clone)]
pub(super) enum Object {
    Service(remote::Service),
    Characteristic(remote::Characteristic),
    Descriptor(remote::Descriptor),
}

// Device address, service id, characteristic id and descriptor id as assigned by BlueZ.
type Key = (Address, u16, Option<u16>, Option<u16>);

impl Object {
    fn key(&self) -> Key {
        match self {
            Object::Service(x) => (x.device_address(), x.id(), None, None),
            Object::Characteristic(x) => (x.device_address(), x.service_id(), Some(x.id()), None),
            Object::Descriptor(x) => (
                x.device_address(),
                x.service_id(),
                Some(x.characteristic_id()),
                Some(x.id()),
            ),
        }
    }
}

/// Assigns stable [`NativeId`]s to BlueZ GATT objects.
#[derive(Debug, Default)]
pub(super) struct Objects {
    next: u64,
    by_id: HashMap<NativeId, Object>,
    by_key: HashMap<Key, NativeId>,
}

fn unknown(id: NativeId, kind: &str) -> Error {
    Error::new(ErrorKind::NotFound, None, format!("no {kind} with id {}", id.0))
}

impl Objects {
    /// Registers `object`, returning the id it already has if it was registered before.
    pub fn insert(&mut self, object: Object) -> NativeId {
        let key = object.key();
        if let Some(id) = self.by_key.get(&key) {
            self.by_id.insert(*id, object);
            return *id;
        }

        let id = NativeId(self.next);
        self.next += 1;
        self.by_key.insert(key, id);
        self.by_id.insert(id, object);
        id
    }

    pub fn service(&self, id: NativeId) -> Result<remote::Service> {
        match self.by_id.get(&id) {
            Some(Object::Service(x)) => Ok(x.clone()),
            _ => Err(unknown(id, "service")),
        }
    }

    pub fn characteristic(&self, id: NativeId) -> Result<remote::Characteristic> {
        match self.by_id.get(&id) {
            Some(Object::Characteristic(x)) => Ok(x.clone()),
            _ => Err(unknown(id, "characteristic")),
        }
    }

    pub fn descriptor(&self, id: NativeId) -> Result<remote::Descriptor> {
        match self.by_id.get(&id) {
            Some(Object::Descriptor(x)) => Ok(x.clone()),
            _ => Err(unknown(id, "descriptor")),
        }
    }

    /// Drops every object of the device at `address`, returning their ids.
    pub fn forget(&mut self, address: Address) -> Vec<NativeId> {
        let mut removed = Vec::new();
        self.by_key.retain(|key, id| {
            if key.0 == address {
                removed.push(*id);
                false
            } else {
                true
            }
        });
        for id in &removed {
            self.by_id.remove(id);
        }
        removed
    }
}

impl From<bluer::gatt::CharacteristicFlags> for CharacteristicProperties {
    fn from(flags: bluer::gatt::CharacteristicFlags) -> Self {
        CharacteristicProperties {
            broadcast: flags.broadcast,
            read: flags.read,
            write_without_response: flags.write_without_response,
            write: flags.write,
            notify: flags.notify,
            indicate: flags.indicate,
            authenticated_signed_writes: flags.authenticated_signed_writes,
            extended_properties: flags.extended_properties,
            reliable_write: flags.reliable_write,
            writable_auxiliaries: flags.writable_auxiliaries,
        }
    }
}
