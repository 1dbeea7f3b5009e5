//! Segment storage: fixed-size chunk files mapped into one contiguous range.
//!
//! ```text
//! <segment>/
//! ├─ chunk_0000   # chunk_size bytes, mapped at base + 0 * chunk_size
//! ├─ chunk_0001   # mapped at base + 1 * chunk_size
//! └─ ...
//! ```
//!
//! The full `max_size` range is reserved when the segment is created or
//! opened. Growing the segment creates the next chunk file and maps it
//! directly behind the previous one, so offsets translate to addresses with a
//! single addition and existing addresses stay valid while the segment grows.

use crate::error::{StorageError, StorageResult};
use crate::file;
use crate::region::{page_size, ReservedRegion};
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Prefix shared by all chunk file names.
pub const CHUNK_FILE_PREFIX: &str = "chunk_";

/// Returns the file name of chunk `index`, e.g. `chunk_0003`.
#[must_use]
pub fn chunk_file_name(index: usize) -> String {
    format!("{CHUNK_FILE_PREFIX}{index:04}")
}

/// Geometry and access mode of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentOptions {
    /// Size of every chunk file in bytes. Must be a power of two.
    pub chunk_size: usize,
    /// Upper bound on the segment size; this much address space is reserved.
    pub max_size: usize,
    /// Allocate disk blocks for new chunks instead of creating sparse files.
    pub zero_fill: bool,
    /// Map chunks without write permission and refuse to grow.
    pub read_only: bool,
}

impl SegmentOptions {
    /// Checks the geometry invariants.
    pub fn validate(&self) -> StorageResult<()> {
        if !self.chunk_size.is_power_of_two() || self.chunk_size < page_size() {
            return Err(StorageError::format(format!(
                "chunk size {} must be a power of two of at least one page",
                self.chunk_size
            )));
        }
        if self.max_size < self.chunk_size || self.max_size % self.chunk_size != 0 {
            return Err(StorageError::format(format!(
                "maximum segment size {} must be a non-zero multiple of the chunk size {}",
                self.max_size, self.chunk_size
            )));
        }
        Ok(())
    }

    /// Returns the maximum number of chunks the segment can hold.
    #[must_use]
    pub fn max_chunks(&self) -> usize {
        self.max_size / self.chunk_size
    }
}

#[derive(Debug)]
struct MappedState {
    region: Option<ReservedRegion>,
    chunks: Vec<File>,
}

impl MappedState {
    fn region(&self) -> StorageResult<&ReservedRegion> {
        self.region.as_ref().ok_or(StorageError::Closed)
    }
}

/// A segment of chunk files mapped into the process.
///
/// # Thread Safety
///
/// Address translation takes a shared lock on the chunk table. Growing the
/// segment is serialized by a separate mutex and only takes the exclusive
/// lock to publish the new chunks, so translation is never blocked by file
/// creation.
#[derive(Debug)]
pub struct SegmentStorage {
    path: PathBuf,
    options: SegmentOptions,
    state: RwLock<MappedState>,
    grow_lock: Mutex<()>,
}

impl SegmentStorage {
    /// Creates a new segment in `path`.
    ///
    /// The directory is created if needed but must not already contain chunk
    /// files. `initial_size` bytes (rounded up to whole chunks) are allocated
    /// immediately.
    ///
    /// # Errors
    ///
    /// - [`StorageError::AlreadyExists`] if chunk files already exist
    /// - [`StorageError::Mapping`] if the address range cannot be reserved
    pub fn create(path: &Path, options: SegmentOptions, initial_size: u64) -> StorageResult<Self> {
        options.validate()?;
        if options.read_only {
            return Err(StorageError::ReadOnly);
        }

        fs::create_dir_all(path)?;
        let first_chunk = path.join(chunk_file_name(0));
        if file::file_exists(&first_chunk) {
            return Err(StorageError::AlreadyExists { path: first_chunk });
        }

        let segment = Self::with_region(path, options)?;
        if initial_size > 0 {
            segment.extend(initial_size)?;
        }
        Ok(segment)
    }

    /// Opens an existing segment of `chunk_count` chunks.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the directory or a chunk file is missing
    /// - [`StorageError::Format`] if a chunk file has the wrong size
    /// - [`StorageError::Mapping`] if mapping fails
    pub fn open(path: &Path, options: SegmentOptions, chunk_count: usize) -> StorageResult<Self> {
        options.validate()?;
        if !file::directory_exists(path) {
            return Err(StorageError::NotFound {
                path: path.to_path_buf(),
            });
        }
        if chunk_count > options.max_chunks() {
            return Err(StorageError::format(format!(
                "segment has {chunk_count} chunks but at most {} fit",
                options.max_chunks()
            )));
        }

        let segment = Self::with_region(path, options)?;
        {
            let mut state = segment.state.write();
            for index in 0..chunk_count {
                let chunk_path = path.join(chunk_file_name(index));
                let chunk = OpenOptions::new()
                    .read(true)
                    .write(!segment.options.read_only)
                    .open(&chunk_path)
                    .map_err(|e| match e.kind() {
                        io::ErrorKind::NotFound => StorageError::NotFound {
                            path: chunk_path.clone(),
                        },
                        _ => StorageError::Io(e),
                    })?;

                let len = chunk.metadata()?.len();
                if len != segment.options.chunk_size as u64 {
                    return Err(StorageError::format(format!(
                        "{} is {len} bytes, expected {}",
                        chunk_path.display(),
                        segment.options.chunk_size
                    )));
                }

                state
                    .region()?
                    .map_file(
                        index * segment.options.chunk_size,
                        segment.options.chunk_size,
                        &chunk,
                        !segment.options.read_only,
                    )
                    .map_err(|e| StorageError::mapping(format!("{}: {e}", chunk_path.display())))?;
                state.chunks.push(chunk);
            }
        }

        if file::file_exists(&path.join(chunk_file_name(chunk_count))) {
            if segment.options.read_only {
                warn!(
                    path = %path.display(),
                    chunk_count,
                    "ignoring chunk files beyond the recorded segment size"
                );
            } else {
                // Growth that was never recorded; the next extend reuses the names.
                let mut index = chunk_count;
                while file::remove_path(&path.join(chunk_file_name(index)))? {
                    index += 1;
                }
                warn!(
                    path = %path.display(),
                    chunk_count,
                    removed = index - chunk_count,
                    "removed chunk files beyond the recorded segment size"
                );
            }
        }
        debug!(path = %path.display(), chunk_count, "opened segment");
        Ok(segment)
    }

    fn with_region(path: &Path, options: SegmentOptions) -> StorageResult<Self> {
        let region = ReservedRegion::reserve(options.max_size, options.chunk_size)
            .map_err(|e| StorageError::mapping(format!("cannot reserve {} bytes: {e}", options.max_size)))?;
        Ok(Self {
            path: path.to_path_buf(),
            options,
            state: RwLock::new(MappedState {
                region: Some(region),
                chunks: Vec::new(),
            }),
            grow_lock: Mutex::new(()),
        })
    }

    /// Grows the segment by at least `additional` bytes, in whole chunks.
    ///
    /// Returns the offset of the first new byte.
    ///
    /// # Errors
    ///
    /// - [`StorageError::ReadOnly`] on a read-only segment
    /// - [`StorageError::SegmentFull`] if the maximum size would be exceeded
    pub fn extend(&self, additional: u64) -> StorageResult<u64> {
        if self.options.read_only {
            return Err(StorageError::ReadOnly);
        }

        let _grow = self.grow_lock.lock();
        let chunk_size = self.options.chunk_size;
        let needed = usize::try_from(additional.div_ceil(chunk_size as u64))
            .unwrap_or(usize::MAX)
            .max(1);
        let current = {
            let state = self.state.read();
            state.region()?;
            state.chunks.len()
        };

        if current.saturating_add(needed) > self.options.max_chunks() {
            return Err(StorageError::SegmentFull {
                requested: additional,
                max: self.options.max_size as u64,
            });
        }

        let mut new_chunks = Vec::with_capacity(needed);
        for index in current..current + needed {
            match self.create_chunk(index) {
                Ok(chunk) => new_chunks.push(chunk),
                Err(e) => {
                    for stale in current..=index {
                        let _ = fs::remove_file(self.path.join(chunk_file_name(stale)));
                    }
                    return Err(e);
                }
            }
        }

        self.state.write().chunks.extend(new_chunks);
        debug!(
            path = %self.path.display(),
            first_chunk = current,
            chunks = needed,
            "extended segment"
        );
        Ok((current * chunk_size) as u64)
    }

    fn create_chunk(&self, index: usize) -> StorageResult<File> {
        let chunk_path = self.path.join(chunk_file_name(index));
        let chunk = file::create_file(&chunk_path)?;
        file::extend_file_size(&chunk, self.options.chunk_size as u64, self.options.zero_fill)?;

        // Chunks beyond the published count are invisible to translate(), so
        // mapping them only needs the shared lock.
        let state = self.state.read();
        state
            .region()?
            .map_file(index * self.options.chunk_size, self.options.chunk_size, &chunk, true)
            .map_err(|e| StorageError::mapping(format!("{}: {e}", chunk_path.display())))?;
        Ok(chunk)
    }

    /// Converts a segment offset into the address it is mapped at.
    pub fn translate(&self, offset: u64) -> StorageResult<NonNull<u8>> {
        self.translate_range(offset, 1)
    }

    /// Converts `[offset, offset + len)` into an address, checking that the
    /// whole range is mapped.
    pub fn translate_range(&self, offset: u64, len: u64) -> StorageResult<NonNull<u8>> {
        let state = self.state.read();
        let region = state.region()?;
        let size = (state.chunks.len() * self.options.chunk_size) as u64;
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(StorageError::OutOfRange { offset, len, size });
        }
        let addr = region.base().as_ptr().wrapping_add(offset as usize);
        NonNull::new(addr).ok_or(StorageError::Closed)
    }

    /// Converts an address back into a segment offset.
    ///
    /// Returns `None` if the address does not lie inside the mapped segment.
    pub fn address_to_offset(&self, addr: *const u8) -> Option<u64> {
        let state = self.state.read();
        let region = state.region.as_ref()?;
        let base = region.base().as_ptr() as usize;
        let size = state.chunks.len() * self.options.chunk_size;
        let addr = addr as usize;
        (addr >= base && addr < base + size).then(|| (addr - base) as u64)
    }

    /// Returns the address of offset 0, or `None` once closed.
    pub fn base_address(&self) -> Option<NonNull<u8>> {
        self.state.read().region.as_ref().map(ReservedRegion::base)
    }

    /// Forces `[offset, offset + len)` to durable storage.
    pub fn flush(&self, offset: u64, len: u64) -> StorageResult<()> {
        let state = self.state.read();
        let size = (state.chunks.len() * self.options.chunk_size) as u64;
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(StorageError::OutOfRange { offset, len, size });
        }
        state.region()?.sync(offset as usize, len as usize)?;
        Ok(())
    }

    /// Forces every mapped chunk to durable storage.
    pub fn flush_all(&self) -> StorageResult<()> {
        let state = self.state.read();
        let size = state.chunks.len() * self.options.chunk_size;
        state.region()?.sync(0, size)?;
        Ok(())
    }

    /// Releases the disk blocks behind `[offset, offset + len)`.
    ///
    /// The range reads back as zeros afterwards. Returns `false` if the
    /// filesystem could not punch the hole; the data is then left in place.
    pub fn free_space(&self, offset: u64, len: u64) -> bool {
        if self.options.read_only {
            return false;
        }
        let state = self.state.read();
        let chunk_size = self.options.chunk_size as u64;
        let end = offset.saturating_add(len);
        let mut cursor = offset;
        let mut all_freed = true;

        while cursor < end {
            let index = (cursor / chunk_size) as usize;
            let Some(chunk) = state.chunks.get(index) else {
                return false;
            };
            let in_chunk = cursor % chunk_size;
            let piece = (chunk_size - in_chunk).min(end - cursor);
            all_freed &= file::free_file_space(chunk, in_chunk, piece);
            cursor += piece;
        }
        all_freed
    }

    /// Unmaps the segment. Calling it again is a no-op.
    pub fn close(&self) {
        let mut state = self.state.write();
        if state.region.take().is_some() {
            state.chunks.clear();
            debug!(path = %self.path.display(), "closed segment");
        }
    }

    /// Returns true once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.state.read().region.is_none()
    }

    /// Returns the segment directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the segment options.
    #[must_use]
    pub fn options(&self) -> &SegmentOptions {
        &self.options
    }

    /// Returns the chunk size in bytes.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.options.chunk_size
    }

    /// Returns true if the segment was opened read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    /// Returns the number of mapped chunks.
    pub fn chunk_count(&self) -> usize {
        self.state.read().chunks.len()
    }

    /// Returns the mapped size in bytes.
    pub fn size(&self) -> u64 {
        (self.chunk_count() * self.options.chunk_size) as u64
    }

    /// Returns the paths of all mapped chunk files, in order.
    pub fn chunk_paths(&self) -> Vec<PathBuf> {
        (0..self.chunk_count())
            .map(|index| self.path.join(chunk_file_name(index)))
            .collect()
    }
}

impl Drop for SegmentStorage {
    fn drop(&mut self) {
        self.close();
    }
}
