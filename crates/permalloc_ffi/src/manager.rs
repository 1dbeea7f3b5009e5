//! Datastore FFI functions.

use crate::error::{clear_last_error, report, set_error};
use crate::types::PermallocHandle;
use permalloc_core::{Manager, ManagerError, ManagerResult, ObjectKind, Offset, MIN_BIN_SIZE};
use std::ffi::{c_char, c_int, c_void, CStr};
use std::path::Path;
use std::ptr;

/// Borrows a C string as UTF-8, reporting `EINVAL` on null or bad input.
unsafe fn str_arg<'a>(value: *const c_char, what: &str) -> Option<&'a str> {
    if value.is_null() {
        set_error(libc::EINVAL, format!("{what} is null"));
        return None;
    }
    match CStr::from_ptr(value).to_str() {
        Ok(s) => Some(s),
        Err(_) => {
            set_error(libc::EINVAL, format!("{what} is not valid UTF-8"));
            None
        }
    }
}

unsafe fn manager_arg<'a>(handle: *mut PermallocHandle) -> Option<&'a Manager> {
    let manager = PermallocHandle::as_manager(handle);
    if manager.is_none() {
        set_error(libc::EINVAL, "handle is null");
    }
    manager
}

fn open_handle(result: ManagerResult<Manager>) -> *mut PermallocHandle {
    match result {
        Ok(manager) => PermallocHandle::into_raw(manager),
        Err(e) => {
            report(&e);
            ptr::null_mut()
        }
    }
}

fn address(manager: &Manager, result: ManagerResult<Offset>) -> *mut c_void {
    match result.and_then(|offset| manager.to_address(offset)) {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(e) => {
            report(&e);
            ptr::null_mut()
        }
    }
}

/// Creates a datastore at `path`.
///
/// Returns null with `errno = EEXIST` if anything exists at `path`.
///
/// # Safety
///
/// `path` must be a valid null-terminated string or null.
#[no_mangle]
pub unsafe extern "C" fn permalloc_create(path: *const c_char) -> *mut PermallocHandle {
    clear_last_error();
    let Some(path) = str_arg(path, "path") else {
        return ptr::null_mut();
    };
    open_handle(Manager::create(Path::new(path)))
}

/// Opens a datastore for reading and writing.
///
/// Returns null with `errno = ENOTRECOVERABLE` if the datastore was not
/// closed properly or is open elsewhere.
///
/// # Safety
///
/// `path` must be a valid null-terminated string or null.
#[no_mangle]
pub unsafe extern "C" fn permalloc_open(path: *const c_char) -> *mut PermallocHandle {
    clear_last_error();
    let Some(path) = str_arg(path, "path") else {
        return ptr::null_mut();
    };
    open_handle(Manager::open(Path::new(path)))
}

/// Opens a datastore read-only.
///
/// # Safety
///
/// `path` must be a valid null-terminated string or null.
#[no_mangle]
pub unsafe extern "C" fn permalloc_open_read_only(path: *const c_char) -> *mut PermallocHandle {
    clear_last_error();
    let Some(path) = str_arg(path, "path") else {
        return ptr::null_mut();
    };
    open_handle(Manager::open_read_only(Path::new(path)))
}

/// Closes the datastore and releases the handle.
///
/// Returns 0 on success. The handle is released even if closing fails.
/// Closing null is a no-op.
///
/// # Safety
///
/// `handle` must be null or a live handle; it is invalid afterwards.
#[no_mangle]
pub unsafe extern "C" fn permalloc_close(handle: *mut PermallocHandle) -> c_int {
    clear_last_error();
    let Some(manager) = PermallocHandle::release(handle) else {
        return 0;
    };
    match manager.close() {
        Ok(()) => 0,
        Err(e) => {
            report(&e);
            -1
        }
    }
}

/// Removes the datastore at `path`.
///
/// Returns false with `errno = ENOENT` if nothing was there.
///
/// # Safety
///
/// `path` must be a valid null-terminated string or null.
#[no_mangle]
pub unsafe extern "C" fn permalloc_remove(path: *const c_char) -> bool {
    clear_last_error();
    let Some(path) = str_arg(path, "path") else {
        return false;
    };
    match Manager::remove(Path::new(path)) {
        Ok(true) => true,
        Ok(false) => {
            report(&ManagerError::not_found(path));
            false
        }
        Err(e) => {
            report(&e);
            false
        }
    }
}

/// Returns true if the datastore at `path` was closed properly.
///
/// # Safety
///
/// `path` must be a valid null-terminated string or null.
#[no_mangle]
pub unsafe extern "C" fn permalloc_consistent(path: *const c_char) -> bool {
    clear_last_error();
    str_arg(path, "path").is_some_and(|path| Manager::consistent(Path::new(path)))
}

/// Allocates `size` bytes registered under `name`.
///
/// Returns null with `errno = EEXIST` if the name is taken, or `ENOMEM` if
/// the segment cannot grow.
///
/// # Safety
///
/// `handle` must be a live handle; `name` a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn permalloc_named_malloc(
    handle: *mut PermallocHandle,
    name: *const c_char,
    size: usize,
) -> *mut c_void {
    clear_last_error();
    let (Some(manager), Some(name)) = (manager_arg(handle), str_arg(name, "name")) else {
        return ptr::null_mut();
    };
    let offset = manager
        .kernel()
        .construct(ObjectKind::Named, name, size, MIN_BIN_SIZE);
    address(manager, offset)
}

/// Looks up the object registered under `name`.
///
/// Returns null with `errno = ENOENT` if there is none.
///
/// # Safety
///
/// `handle` must be a live handle; `name` a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn permalloc_find(
    handle: *mut PermallocHandle,
    name: *const c_char,
) -> *mut c_void {
    clear_last_error();
    let (Some(manager), Some(name)) = (manager_arg(handle), str_arg(name, "name")) else {
        return ptr::null_mut();
    };
    let offset = manager
        .kernel()
        .find(ObjectKind::Named, name)
        .and_then(|entry| {
            entry
                .map(|e| Offset(e.offset))
                .ok_or_else(|| ManagerError::not_found(name))
        });
    address(manager, offset)
}

/// Frees the object registered under `name`.
///
/// Returns false with `errno = ENOENT` if there is none.
///
/// # Safety
///
/// `handle` must be a live handle; `name` a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn permalloc_named_free(
    handle: *mut PermallocHandle,
    name: *const c_char,
) -> bool {
    clear_last_error();
    let (Some(manager), Some(name)) = (manager_arg(handle), str_arg(name, "name")) else {
        return false;
    };
    match manager.kernel().destroy(ObjectKind::Named, name) {
        Ok(true) => true,
        Ok(false) => {
            report(&ManagerError::not_found(name));
            false
        }
        Err(e) => {
            report(&e);
            false
        }
    }
}

/// Allocates `size` unregistered bytes.
///
/// # Safety
///
/// `handle` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn permalloc_malloc(handle: *mut PermallocHandle, size: usize) -> *mut c_void {
    clear_last_error();
    let Some(manager) = manager_arg(handle) else {
        return ptr::null_mut();
    };
    address(manager, manager.allocate(size))
}

/// Frees memory returned by [`permalloc_malloc`]. Freeing null is a no-op.
///
/// An address that is not a live allocation sets `errno = EINVAL`.
///
/// # Safety
///
/// `handle` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn permalloc_free(handle: *mut PermallocHandle, addr: *mut c_void) {
    clear_last_error();
    if addr.is_null() {
        return;
    }
    let Some(manager) = manager_arg(handle) else {
        return;
    };
    let result = manager
        .to_offset(addr.cast_const().cast())
        .ok_or_else(|| ManagerError::invalid_free(0, "address outside the segment"))
        .and_then(|offset| manager.deallocate(offset));
    if let Err(e) = result {
        report(&e);
    }
}

/// Writes a point-in-time copy of the datastore to `destination`.
///
/// # Safety
///
/// `handle` must be a live handle; `destination` a valid null-terminated
/// string.
#[no_mangle]
pub unsafe extern "C" fn permalloc_snapshot(
    handle: *mut PermallocHandle,
    destination: *const c_char,
) -> bool {
    clear_last_error();
    let (Some(manager), Some(destination)) =
        (manager_arg(handle), str_arg(destination, "destination"))
    else {
        return false;
    };
    match manager.snapshot(Path::new(destination)) {
        Ok(()) => true,
        Err(e) => {
            report(&e);
            false
        }
    }
}

/// Syncs data and allocator metadata to disk. Returns 0 on success.
///
/// # Safety
///
/// `handle` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn permalloc_flush(handle: *mut PermallocHandle) -> c_int {
    clear_last_error();
    let Some(manager) = manager_arg(handle) else {
        return -1;
    };
    match manager.flush() {
        Ok(()) => 0,
        Err(e) => {
            report(&e);
            -1
        }
    }
}
