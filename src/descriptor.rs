use std::sync::{Arc, Mutex, Weak};

use crate::backend::DescriptorInfo;
use crate::bluetooth::Context;
use crate::characteristic::CharacteristicInner;
use crate::handles::Handle;
use crate::{Characteristic, Result, Uuid};

/// A Bluetooth GATT descriptor
#[derive(Clone)]
pub struct Descriptor(Arc<DescriptorInner>);

struct DescriptorInner {
    handle: Handle,
    uuid: Uuid,
    characteristic: Weak<CharacteristicInner>,
    ctx: Arc<Context>,
    value: Mutex<Option<Vec<u8>>>,
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("uuid", &self.0.uuid)
            .field("handle", &self.0.handle)
            .finish()
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Descriptor {}

impl Descriptor {
    pub(crate) fn new(characteristic: &Characteristic, ctx: &Arc<Context>, info: DescriptorInfo) -> Self {
        Descriptor(Arc::new(DescriptorInner {
            handle: info.handle,
            uuid: info.uuid,
            characteristic: Arc::downgrade(&characteristic.0),
            ctx: ctx.clone(),
            value: Mutex::new(None),
        }))
    }

    /// The [`Uuid`] identifying the type of this GATT descriptor
    pub fn uuid(&self) -> Uuid {
        self.0.uuid
    }

    /// The last value read or written, if any
    pub fn value(&self) -> Option<Vec<u8>> {
        self.0.value.lock().unwrap().clone()
    }

    /// The characteristic this descriptor belongs to, if it still exists.
    pub fn characteristic(&self) -> Option<Characteristic> {
        self.0.characteristic.upgrade().map(Characteristic)
    }

    /// Reads the value of this descriptor from the device and stores it.
    pub async fn read_value(&self) -> Result<Vec<u8>> {
        let value = self.0.ctx.backend.read_descriptor(self.0.handle).await?;
        *self.0.value.lock().unwrap() = Some(value.clone());
        Ok(value)
    }

    /// Writes `value` to this descriptor and stores it.
    pub async fn write_value(&self, value: &[u8]) -> Result<()> {
        self.0.ctx.backend.write_descriptor(self.0.handle, value).await?;
        *self.0.value.lock().unwrap() = Some(value.to_vec());
        Ok(())
    }
}
