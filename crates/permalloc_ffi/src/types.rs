//! Type definitions for FFI.

use permalloc_core::Manager;

/// An opaque datastore handle.
///
/// Points at a boxed manager. Never dereference or modify directly.
#[repr(C)]
pub struct PermallocHandle {
    _private: [u8; 0],
}

impl PermallocHandle {
    pub(crate) fn into_raw(manager: Manager) -> *mut PermallocHandle {
        Box::into_raw(Box::new(manager)).cast()
    }

    /// # Safety
    ///
    /// `handle` must be null or come from [`into_raw`](Self::into_raw) and
    /// not have been released.
    pub(crate) unsafe fn as_manager<'a>(handle: *mut PermallocHandle) -> Option<&'a Manager> {
        handle.cast::<Manager>().as_ref()
    }

    /// # Safety
    ///
    /// As [`as_manager`](Self::as_manager); the handle is invalid afterwards.
    pub(crate) unsafe fn release(handle: *mut PermallocHandle) -> Option<Box<Manager>> {
        if handle.is_null() {
            None
        } else {
            Some(Box::from_raw(handle.cast::<Manager>()))
        }
    }
}
