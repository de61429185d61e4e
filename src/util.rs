use std::mem::ManuallyDrop;

use uuid::Uuid;

use crate::error::ErrorKind;
use crate::{Error, Result};

/// Runs a closure when dropped unless [`defuse`][ScopeGuard::defuse]d first.
pub struct ScopeGuard<F: FnOnce()> {
    dropfn: ManuallyDrop<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn defuse(mut self) {
        // SAFETY: `dropfn` is dropped exactly once here and `self` is forgotten so `Drop::drop` never sees it again.
        unsafe { ManuallyDrop::drop(&mut self.dropfn) }
        std::mem::forget(self)
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        // SAFETY: This is OK because `dropfn` is `ManuallyDrop` which will not be dropped by the compiler.
        let dropfn = unsafe { ManuallyDrop::take(&mut self.dropfn) };
        dropfn();
    }
}

pub fn defer<F: FnOnce()>(dropfn: F) -> ScopeGuard<F> {
    ScopeGuard {
        dropfn: ManuallyDrop::new(dropfn),
    }
}

/// The only item of `items`, or `NotFound` when there are none or several.
pub fn exactly_one<T>(mut items: Vec<T>, what: &str, uuid: &Uuid) -> Result<T> {
    match items.len() {
        1 => Ok(items.remove(0)),
        0 => Err(Error::new(ErrorKind::NotFound, None, format!("{what} {uuid} not found"))),
        n => Err(Error::new(
            ErrorKind::NotFound,
            None,
            format!("{what} {uuid} is not unique, {n} found"),
        )),
    }
}
