//! Reserved virtual address range that chunk files are mapped into.
//!
//! The whole segment is reserved up front as an inaccessible anonymous
//! mapping. Chunk files are then mapped over pieces of it with `MAP_FIXED`,
//! so the segment stays contiguous in memory and already-mapped addresses
//! never move when the segment grows.
//!
//! All raw `mmap` handling lives in this module.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;

#[cfg(target_os = "linux")]
const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
#[cfg(not(target_os = "linux"))]
const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

/// Returns the system page size.
pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(4096)
}

/// An address range reserved with `PROT_NONE`, unmapped on drop.
#[derive(Debug)]
pub(crate) struct ReservedRegion {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is a plain address range; all access to the bytes goes
// through raw pointers whose synchronization is the caller's responsibility.
unsafe impl Send for ReservedRegion {}
// SAFETY: see above.
unsafe impl Sync for ReservedRegion {}

impl ReservedRegion {
    /// Reserves `len` bytes whose start address is a multiple of `align`.
    ///
    /// `align` must be a power of two.
    pub(crate) fn reserve(len: usize, align: usize) -> io::Result<Self> {
        debug_assert!(align.is_power_of_two());
        let padded = len
            .checked_add(align)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "reservation too large"))?;

        // SAFETY: anonymous PROT_NONE mapping at a kernel-chosen address.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                padded,
                libc::PROT_NONE,
                RESERVE_FLAGS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let start = raw as usize;
        let aligned = (start + align - 1) & !(align - 1);
        let head = aligned - start;
        let tail = padded - head - len;

        // SAFETY: both ranges lie inside the mapping created above and are
        // not referenced by anything else.
        unsafe {
            if head > 0 {
                libc::munmap(raw, head);
            }
            if tail > 0 {
                libc::munmap((aligned + len) as *mut libc::c_void, tail);
            }
        }

        let base = NonNull::new(aligned as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self { base, len })
    }

    /// Returns the first address of the region.
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Returns the reserved length in bytes.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Maps `len` bytes of `file` (from file offset 0) at `offset` inside the
    /// region, replacing the reservation there.
    pub(crate) fn map_file(&self, offset: usize, len: usize, file: &File, writable: bool) -> io::Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mapping exceeds reserved region",
            ));
        }

        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        // SAFETY: the target range lies inside our reservation (checked
        // above), so MAP_FIXED only replaces pages we own.
        let addr = unsafe { self.base.as_ptr().add(offset) } as *mut libc::c_void;
        let mapped = unsafe {
            libc::mmap(
                addr,
                len,
                prot,
                libc::MAP_SHARED | libc::MAP_FIXED,
                file.as_raw_fd(),
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        if mapped != addr {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "kernel placed mapping at an unexpected address",
            ));
        }
        Ok(())
    }

    /// Synchronously writes back the dirty pages of `[offset, offset + len)`.
    pub(crate) fn sync(&self, offset: usize, len: usize) -> io::Result<()> {
        if len == 0 {
            return Ok(());
        }
        let page = page_size();
        let start = offset & !(page - 1);
        let end = offset.saturating_add(len).min(self.len);
        if start >= end {
            return Ok(());
        }

        // SAFETY: `[start, end)` is page aligned at the start and lies within
        // the reservation; msync on unmapped reservation pages fails cleanly
        // with ENOMEM rather than touching memory.
        let rc = unsafe {
            libc::msync(
                self.base.as_ptr().add(start) as *mut libc::c_void,
                end - start,
                libc::MS_SYNC,
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for ReservedRegion {
    fn drop(&mut self) {
        // SAFETY: the region (and every file mapped over it) was created by
        // this struct; unmapping the whole range releases all of it.
        let rc = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) };
        if rc == -1 {
            tracing::warn!(error = %io::Error::last_os_error(), "munmap failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reservation_is_aligned() {
        let align = 1 << 21;
        let region = ReservedRegion::reserve(8 << 20, align).unwrap();
        assert_eq!(region.base().as_ptr() as usize % align, 0);
        assert_eq!(region.len(), 8 << 20);
    }

    #[test]
    fn mapped_file_is_readable_and_writable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunk");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        file.set_len(1 << 16).unwrap();

        let region = ReservedRegion::reserve(1 << 20, 1 << 16).unwrap();
        region.map_file(1 << 16, 1 << 16, &file, true).unwrap();

        let ptr = unsafe { region.base().as_ptr().add(1 << 16) };
        unsafe { ptr.write(42) };
        region.sync(1 << 16, 1).unwrap();
        drop(region);

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data[0], 42);
    }

    #[test]
    fn mapping_outside_region_is_rejected() {
        let dir = tempdir().unwrap();
        let file = std::fs::File::create(dir.path().join("chunk")).unwrap();
        let region = ReservedRegion::reserve(1 << 16, 4096).unwrap();
        assert!(region.map_file(1 << 16, 4096, &file, false).is_err());
    }
}
