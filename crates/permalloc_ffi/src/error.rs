//! errno mapping and the thread-local last error.

use permalloc_core::ManagerError;
use std::cell::{Cell, RefCell};
use std::ffi::{c_char, c_int, CString};
use tracing::debug;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
    static LAST_ERRNO: Cell<c_int> = const { Cell::new(0) };
}

/// Returns the errno value that reports `error` to C callers.
pub fn errno_of(error: &ManagerError) -> c_int {
    match error {
        ManagerError::OutOfMemory { .. } => libc::ENOMEM,
        ManagerError::NotFound { .. } => libc::ENOENT,
        ManagerError::AlreadyExists { .. } | ManagerError::DuplicateKey { .. } => libc::EEXIST,
        ManagerError::Inconsistent { .. } => libc::ENOTRECOVERABLE,
        ManagerError::InvalidArgument { .. } | ManagerError::InvalidFree { .. } => libc::EINVAL,
        ManagerError::ReadOnly => libc::EROFS,
        ManagerError::Closed => libc::EBADF,
        ManagerError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        ManagerError::Format { .. } | ManagerError::Storage(_) => libc::EIO,
    }
}

/// Records `error` as the last error of this thread and sets `errno`.
pub(crate) fn report(error: &ManagerError) {
    let code = errno_of(error);
    debug!(errno = code, %error, "permalloc call failed");
    set_error(code, error.to_string());
}

/// Records an error that did not come from the manager.
pub(crate) fn set_error(code: c_int, message: impl Into<String>) {
    LAST_ERRNO.with(|e| e.set(code));
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(message.into()).ok();
    });
    set_errno(code);
}

/// Clears the last error.
pub(crate) fn clear_last_error() {
    LAST_ERRNO.with(|e| e.set(0));
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_errno(code: c_int) {
    // SAFETY: __errno_location returns this thread's errno slot.
    unsafe { *libc::__errno_location() = code };
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn set_errno(code: c_int) {
    // SAFETY: __error returns this thread's errno slot.
    unsafe { *libc::__error() = code };
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
fn set_errno(_code: c_int) {}

/// Gets the last error message as a C string.
///
/// Returns null if the last call on this thread succeeded.
///
/// # Safety
///
/// The returned pointer is valid until the next FFI call on this thread.
#[no_mangle]
pub extern "C" fn permalloc_get_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match e.borrow().as_ref() {
        Some(cstr) => cstr.as_ptr(),
        None => std::ptr::null(),
    })
}

/// Returns the errno value of the last failed call on this thread, or 0.
///
/// Unlike `errno`, this survives later libc calls.
#[no_mangle]
pub extern "C" fn permalloc_errno() -> c_int {
    LAST_ERRNO.with(Cell::get)
}

/// Clears the last error message.
#[no_mangle]
pub extern "C" fn permalloc_clear_error() {
    clear_last_error();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;
    use std::path::PathBuf;

    #[test]
    fn errno_mapping() {
        assert_eq!(errno_of(&ManagerError::OutOfMemory { requested: 1 }), libc::ENOMEM);
        assert_eq!(errno_of(&ManagerError::not_found("x")), libc::ENOENT);
        assert_eq!(
            errno_of(&ManagerError::AlreadyExists {
                path: PathBuf::from("/x")
            }),
            libc::EEXIST
        );
        assert_eq!(errno_of(&ManagerError::duplicate_key("k")), libc::EEXIST);
        assert_eq!(
            errno_of(&ManagerError::inconsistent("/x")),
            libc::ENOTRECOVERABLE
        );
        assert_eq!(errno_of(&ManagerError::invalid_argument("bad")), libc::EINVAL);
    }

    #[test]
    fn last_error() {
        clear_last_error();
        assert!(permalloc_get_last_error().is_null());
        assert_eq!(permalloc_errno(), 0);

        report(&ManagerError::not_found("thing"));
        let ptr = permalloc_get_last_error();
        assert!(!ptr.is_null());
        let msg = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap();
        assert!(msg.contains("thing"));
        assert_eq!(permalloc_errno(), libc::ENOENT);

        permalloc_clear_error();
        assert!(permalloc_get_last_error().is_null());
    }
}
