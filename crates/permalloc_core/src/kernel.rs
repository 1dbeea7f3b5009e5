//! The manager kernel: datastore lifecycle over the heap and directory.
//!
//! # Consistency protocol
//!
//! A datastore carries a `properly_closed` marker while no writer holds it.
//! Opening for writing removes the marker; a clean [`ManagerKernel::close`]
//! flushes the segment, persists the heap metadata and directory, and only
//! then writes the marker back. A writer that dies in between leaves the
//! marker absent, and the next writable open fails with
//! [`ManagerError::Inconsistent`].
//!
//! Read-only opens also require the marker unless
//! [`Config::relaxed_read_only`] is set, in which case the last persisted
//! metadata is used. Entries whose small block already carries a free-list
//! header are hidden, since the crashed writer destroyed them without
//! persisting the directory.
//!
//! # Thread Safety
//!
//! All allocation, lookup and registration methods take `&self` and may be
//! called from many threads. `close` must not race with those calls; the
//! caller is responsible for quiescing other threads first.

use crate::accessor::ObjectAttributeAccessor;
use crate::config::Config;
use crate::directory::{Directory, DirectoryEntry};
use crate::error::{ManagerError, ManagerResult};
use crate::heap::{Heap, HeapImage, HeapReport};
use crate::layout::DatastoreLayout;
use crate::stats::{AllocatorStats, StatsSnapshot};
use crate::types::{ObjectKind, OpenMode, Offset};
use crate::{bin, FORMAT_VERSION};
use parking_lot::Mutex;
use permalloc_storage::{chunk_file_name, file, CopyMode, SegmentOptions, SegmentStorage};
use std::fs;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Owns an open datastore.
#[derive(Debug)]
pub struct ManagerKernel {
    layout: DatastoreLayout,
    mode: OpenMode,
    config: Config,
    uuid: Uuid,
    heap: Heap,
    directory: Mutex<Directory>,
    stats: AllocatorStats,
    closed: AtomicBool,
}

impl ManagerKernel {
    /// Creates a new datastore at `path`.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::AlreadyExists`] if anything exists at `path`
    /// - [`ManagerError::InvalidArgument`] if the configuration is invalid
    pub fn create(path: &Path, config: Config) -> ManagerResult<Self> {
        config.validate()?;
        if path.exists() {
            return Err(ManagerError::AlreadyExists {
                path: path.to_path_buf(),
            });
        }
        fs::create_dir_all(path)?;

        let result = Self::initialize(path, config);
        if result.is_err() {
            if let Err(e) = file::remove_path(path) {
                warn!(path = %path.display(), error = %e, "failed to clean up partial datastore");
            }
        }
        result
    }

    fn initialize(path: &Path, config: Config) -> ManagerResult<Self> {
        let layout = DatastoreLayout::new(path);
        layout.write_version()?;
        let uuid = Uuid::new_v4();
        layout.write_uuid(uuid)?;

        let segment = SegmentStorage::create(
            path,
            segment_options(&config, config.chunk_size, config.max_segment_size, false),
            0,
        )?;
        let heap = Heap::new(
            segment,
            HeapImage::empty(config.chunk_size, config.max_segment_size),
            config.free_file_space,
        )?;

        let kernel = Self {
            layout,
            mode: OpenMode::Create,
            config,
            uuid,
            heap,
            directory: Mutex::new(Directory::new()),
            stats: AllocatorStats::new(),
            closed: AtomicBool::new(false),
        };
        kernel.persist_metadata()?;

        info!(path = %path.display(), %uuid, "created datastore");
        Ok(kernel)
    }

    /// Opens an existing datastore for reading and writing.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::NotFound`] if the datastore does not exist
    /// - [`ManagerError::Inconsistent`] if it was not closed properly
    /// - [`ManagerError::Format`] on a version mismatch or corrupt metadata
    pub fn open(path: &Path, config: Config) -> ManagerResult<Self> {
        Self::open_with_mode(path, OpenMode::ReadWrite, config)
    }

    /// Opens an existing datastore without write access.
    pub fn open_read_only(path: &Path, config: Config) -> ManagerResult<Self> {
        Self::open_with_mode(path, OpenMode::ReadOnly, config)
    }

    fn open_with_mode(path: &Path, mode: OpenMode, mut config: Config) -> ManagerResult<Self> {
        let layout = DatastoreLayout::new(path);
        if !file::directory_exists(path) {
            return Err(ManagerError::not_found(path.display().to_string()));
        }
        layout.check_version()?;

        let crashed = !layout.is_marked_consistent();
        if crashed {
            if mode == OpenMode::ReadOnly && config.relaxed_read_only {
                warn!(path = %path.display(), "opening inconsistent datastore read-only");
            } else {
                return Err(ManagerError::inconsistent(path));
            }
        }

        let uuid = layout.read_uuid()?;
        let image = HeapImage::decode(&file::read_file(&layout.heap_path())?)?;
        let mut directory = Directory::deserialize(&layout.directory_path())?;

        config.chunk_size = image.chunk_size;
        config.max_segment_size = image.max_segment_size;
        let segment = SegmentStorage::open(
            path,
            segment_options(
                &config,
                image.chunk_size,
                image.max_segment_size,
                mode == OpenMode::ReadOnly,
            ),
            image.kinds.len(),
        )?;
        let heap = Heap::new(segment, image, config.free_file_space)?;
        if crashed {
            hide_freed_objects(&heap, &mut directory, path);
        }

        if mode.is_writable() {
            layout.clear_consistent()?;
        }

        info!(
            path = %path.display(),
            %uuid,
            read_only = !mode.is_writable(),
            objects = directory.len(),
            "opened datastore"
        );
        Ok(Self {
            layout,
            mode,
            config,
            uuid,
            heap,
            directory: Mutex::new(directory),
            stats: AllocatorStats::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Flushes, persists metadata, marks the datastore consistent and
    /// unmaps it.
    ///
    /// Calling `close` again, or dropping the kernel afterwards, does
    /// nothing. If persisting fails the marker is not written, so the
    /// datastore will be reported inconsistent.
    pub fn close(&self) -> ManagerResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let result = if self.mode.is_writable() {
            self.persist_metadata()
                .and_then(|()| self.layout.mark_consistent())
        } else {
            Ok(())
        };
        self.heap.segment().close();

        match &result {
            Ok(()) => info!(path = %self.layout.root().display(), "closed datastore"),
            Err(e) => error!(
                path = %self.layout.root().display(),
                error = %e,
                "failed to close datastore cleanly"
            ),
        }
        result
    }

    /// Unmaps the datastore without persisting metadata or writing the
    /// consistency marker, as if the process had crashed.
    pub fn abort(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.heap.segment().close();
            warn!(path = %self.layout.root().display(), "abandoned datastore without closing");
        }
    }

    /// Returns true once the kernel has been closed or aborted.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> ManagerResult<()> {
        if self.is_closed() {
            Err(ManagerError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_writable(&self) -> ManagerResult<()> {
        self.ensure_open()?;
        if self.mode.is_writable() {
            Ok(())
        } else {
            Err(ManagerError::ReadOnly)
        }
    }

    fn track<T>(&self, result: ManagerResult<T>) -> ManagerResult<T> {
        if result.is_err() {
            self.stats.record_error();
        }
        result
    }

    /// Writes the heap metadata and directory. Data pages are flushed first.
    fn persist_metadata(&self) -> ManagerResult<()> {
        let directory = self.directory.lock();
        let image = self.heap.image();
        self.heap.segment().flush_all()?;
        file::write_file_atomic(&self.layout.heap_path(), &image.encode())?;
        directory.serialize(&self.layout.directory_path())?;
        debug!(
            path = %self.layout.root().display(),
            chunks = image.kinds.len(),
            objects = directory.len(),
            "persisted metadata"
        );
        Ok(())
    }

    fn rounded_size(&self, size: usize, align: usize) -> u64 {
        let table = self.heap.bin_table();
        table
            .bin_for(size, align)
            .map_or(size, |bin| table.size_of(bin)) as u64
    }

    // === Allocation ===

    /// Allocates `size` bytes and returns their offset.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::InvalidArgument`] if `size` is zero
    /// - [`ManagerError::OutOfMemory`] if the segment cannot grow enough
    /// - [`ManagerError::ReadOnly`] on a read-only datastore
    pub fn allocate(&self, size: usize) -> ManagerResult<Offset> {
        self.allocate_aligned(size, bin::MIN_BIN_SIZE)
    }

    /// Allocates `size` bytes at an offset that is a multiple of `align`.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> ManagerResult<Offset> {
        self.ensure_writable()?;
        let result = self.heap.allocate(size, align).map(|offset| {
            self.stats.record_allocation(self.rounded_size(size, align));
            Offset(offset)
        });
        self.track(result)
    }

    /// Frees the allocation at `offset`.
    ///
    /// # Errors
    ///
    /// [`ManagerError::InvalidFree`] if `offset` is not a live allocation.
    pub fn deallocate(&self, offset: Offset) -> ManagerResult<()> {
        self.ensure_writable()?;
        let result = self
            .heap
            .deallocate(offset.0)
            .map(|freed| self.stats.record_deallocation(freed));
        self.track(result)
    }

    // === Registered objects ===

    /// Allocates `size` bytes and registers them under `name`.
    ///
    /// Both steps happen under the directory lock; if registration fails
    /// the allocation is released. For anonymous objects `name` is ignored.
    ///
    /// # Errors
    ///
    /// [`ManagerError::DuplicateKey`] if `name` is already registered.
    pub fn construct(
        &self,
        kind: ObjectKind,
        name: &str,
        size: usize,
        align: usize,
    ) -> ManagerResult<Offset> {
        self.ensure_writable()?;
        let result = self.construct_locked(kind, name, size, align);
        self.track(result)
    }

    fn construct_locked(
        &self,
        kind: ObjectKind,
        name: &str,
        size: usize,
        align: usize,
    ) -> ManagerResult<Offset> {
        let mut directory = self.directory.lock();
        if kind != ObjectKind::Anonymous && directory.table(kind).find(name).is_some() {
            return Err(ManagerError::duplicate_key(name));
        }

        let offset = self.heap.allocate(size, align)?;
        if let Err(e) = directory.insert(kind, name, offset, size as u64) {
            if let Err(rollback) = self.heap.deallocate(offset) {
                error!(offset, error = %rollback, "failed to release unregistered allocation");
            }
            return Err(e);
        }

        self.stats.record_allocation(self.rounded_size(size, align));
        self.stats.record_construct();
        debug!(%kind, name, offset, size, "constructed object");
        Ok(Offset(offset))
    }

    /// Looks up a registered object.
    pub fn find(&self, kind: ObjectKind, name: &str) -> ManagerResult<Option<DirectoryEntry>> {
        self.ensure_open()?;
        Ok(self.directory.lock().table(kind).find(name).cloned())
    }

    /// Unregisters and frees the object `name`.
    ///
    /// Returns false if no such object exists.
    pub fn destroy(&self, kind: ObjectKind, name: &str) -> ManagerResult<bool> {
        self.ensure_writable()?;
        let result = self.destroy_locked(kind, name);
        self.track(result)
    }

    fn destroy_locked(&self, kind: ObjectKind, name: &str) -> ManagerResult<bool> {
        let mut directory = self.directory.lock();
        let Some(offset) = directory.table(kind).find(name).map(|e| e.offset) else {
            return Ok(false);
        };
        let freed = self.heap.deallocate(offset)?;
        directory.table_mut(kind).erase(name);
        self.stats.record_deallocation(freed);
        self.stats.record_destroy();
        debug!(%kind, name, offset, "destroyed object");
        Ok(true)
    }

    /// Unregisters and frees the registered object at `offset`, of any kind.
    ///
    /// Returns false if nothing is registered there.
    pub fn destroy_at(&self, offset: Offset) -> ManagerResult<bool> {
        self.ensure_writable()?;
        let result = self.destroy_at_locked(offset.0);
        self.track(result)
    }

    fn destroy_at_locked(&self, offset: u64) -> ManagerResult<bool> {
        let mut directory = self.directory.lock();
        if directory.find_by_offset(offset).is_none() {
            return Ok(false);
        }
        let freed = self.heap.deallocate(offset)?;
        directory.erase_by_offset(offset);
        self.stats.record_deallocation(freed);
        self.stats.record_destroy();
        Ok(true)
    }

    /// Returns the registered objects of `kind` in insertion order.
    pub fn objects(&self, kind: ObjectKind) -> ManagerResult<Vec<DirectoryEntry>> {
        self.ensure_open()?;
        Ok(self.directory.lock().table(kind).iter().cloned().collect())
    }

    /// Returns the number of registered objects of `kind`.
    pub fn num_objects(&self, kind: ObjectKind) -> ManagerResult<usize> {
        self.ensure_open()?;
        Ok(self.directory.lock().table(kind).len())
    }

    // === Instance attributes ===

    fn instance(&self, offset: Offset) -> ManagerResult<Option<DirectoryEntry>> {
        self.ensure_open()?;
        Ok(self.directory.lock().find_by_offset(offset.0).cloned())
    }

    /// Returns the name of the registered object at `offset`.
    ///
    /// Anonymous objects have an empty name.
    pub fn instance_name(&self, offset: Offset) -> ManagerResult<Option<String>> {
        Ok(self.instance(offset)?.map(|e| e.name))
    }

    /// Returns the length in bytes of the registered object at `offset`.
    pub fn instance_length(&self, offset: Offset) -> ManagerResult<Option<u64>> {
        Ok(self.instance(offset)?.map(|e| e.length))
    }

    /// Returns the kind of the registered object at `offset`.
    pub fn instance_kind(&self, offset: Offset) -> ManagerResult<Option<ObjectKind>> {
        Ok(self.instance(offset)?.map(|e| e.kind))
    }

    /// Returns the description of the registered object at `offset`.
    pub fn instance_description(&self, offset: Offset) -> ManagerResult<Option<String>> {
        Ok(self.instance(offset)?.map(|e| e.description))
    }

    /// Sets the description of the registered object at `offset`.
    ///
    /// Returns false if nothing is registered there.
    pub fn set_instance_description(&self, offset: Offset, description: &str) -> ManagerResult<bool> {
        self.ensure_writable()?;
        let mut directory = self.directory.lock();
        let Some(kind) = directory.find_by_offset(offset.0).map(|e| e.kind) else {
            return Ok(false);
        };
        Ok(directory
            .table_mut(kind)
            .set_description_by_offset(offset.0, description))
    }

    // === Address translation ===

    /// Returns the address `offset` is mapped at in this process.
    pub fn to_address(&self, offset: Offset) -> ManagerResult<NonNull<u8>> {
        self.ensure_open()?;
        Ok(self.heap.segment().translate(offset.0)?)
    }

    /// Returns the address of `[offset, offset + len)`, checking the whole
    /// range is mapped.
    pub fn to_address_range(&self, offset: Offset, len: u64) -> ManagerResult<NonNull<u8>> {
        self.ensure_open()?;
        Ok(self.heap.segment().translate_range(offset.0, len)?)
    }

    /// Returns the offset of a mapped address, or `None` if `addr` lies
    /// outside the segment.
    pub fn to_offset(&self, addr: *const u8) -> Option<Offset> {
        self.heap.segment().address_to_offset(addr).map(Offset)
    }

    // === Durability ===

    /// Syncs all chunks and persists the metadata without marking the
    /// datastore consistent.
    pub fn flush(&self) -> ManagerResult<()> {
        self.ensure_open()?;
        if !self.mode.is_writable() {
            return Ok(());
        }
        let result = self.persist_metadata();
        if result.is_ok() {
            self.stats.record_flush();
        }
        self.track(result)
    }

    /// Writes a point-in-time copy of the datastore to `destination`.
    ///
    /// Allocation, deallocation and registration block until the copy is
    /// done. Stores into already allocated memory are not blocked; callers
    /// that need those in the snapshot must quiesce writers first. The copy
    /// gets a new uuid and is marked consistent.
    ///
    /// On failure the partial copy is removed.
    pub fn snapshot(&self, destination: &Path) -> ManagerResult<()> {
        self.ensure_open()?;
        if destination.exists() {
            return Err(ManagerError::AlreadyExists {
                path: destination.to_path_buf(),
            });
        }

        let directory = self.directory.lock();
        let freeze = self.heap.freeze();
        let image = freeze.image();
        let result = self.flush_for_snapshot().and_then(|()| {
            fs::create_dir_all(destination)?;
            self.write_snapshot(destination, &image, &directory)
        });
        drop(freeze);
        drop(directory);

        match result {
            Ok(()) => {
                self.stats.record_snapshot();
                info!(
                    source = %self.layout.root().display(),
                    destination = %destination.display(),
                    chunks = image.kinds.len(),
                    "snapshot complete"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = file::remove_path(destination) {
                    warn!(path = %destination.display(), error = %cleanup, "failed to remove partial snapshot");
                }
                self.track(Err(e))
            }
        }
    }

    fn flush_for_snapshot(&self) -> ManagerResult<()> {
        if self.mode.is_writable() {
            self.heap.segment().flush_all()?;
        }
        Ok(())
    }

    fn write_snapshot(
        &self,
        destination: &Path,
        image: &HeapImage,
        directory: &Directory,
    ) -> ManagerResult<()> {
        let pairs: Vec<(PathBuf, PathBuf)> = (0..image.kinds.len())
            .map(|index| {
                let name = chunk_file_name(index);
                (self.layout.root().join(&name), destination.join(&name))
            })
            .collect();
        file::copy_files_in_parallel(&pairs, self.config.copy_threads, self.copy_mode())?;

        let target = DatastoreLayout::new(destination);
        file::write_file_atomic(&target.heap_path(), &image.encode())?;
        directory.serialize(&target.directory_path())?;
        if let Some(description) = self.layout.read_description()? {
            target.write_description(&description)?;
        }
        target.write_version()?;
        target.write_uuid(Uuid::new_v4())?;
        file::sync_directory(destination)?;
        target.mark_consistent()
    }

    fn copy_mode(&self) -> CopyMode {
        if self.config.snapshot_clone {
            CopyMode::Clone
        } else {
            CopyMode::Sparse
        }
    }

    // === Introspection ===

    /// Walks the heap and verifies that free lists, live blocks and unused
    /// space partition the segment.
    pub fn check_heap(&self) -> ManagerResult<HeapReport> {
        self.ensure_open()?;
        self.heap.check()
    }

    /// Returns the allocator counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns the datastore path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.layout.root()
    }

    /// Returns the open mode.
    #[must_use]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Returns true if the datastore was opened read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        !self.mode.is_writable()
    }

    /// Returns the effective configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the datastore identity.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the on-disk format version.
    #[must_use]
    pub fn version(&self) -> u32 {
        FORMAT_VERSION
    }

    /// Returns the chunk size.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.heap.bin_table().chunk_size()
    }

    /// Returns the mapped segment size in bytes.
    pub fn segment_size(&self) -> u64 {
        self.heap.segment().size()
    }

    /// Sets the datastore description.
    pub fn set_description(&self, description: &str) -> ManagerResult<()> {
        self.ensure_writable()?;
        self.layout.write_description(description)
    }

    /// Returns the datastore description, if any.
    pub fn description(&self) -> ManagerResult<Option<String>> {
        self.layout.read_description()
    }

    // === Path-level operations ===

    /// Returns true if the datastore at `path` was closed properly and is
    /// not held by a writer. Never modifies anything.
    #[must_use]
    pub fn consistent(path: &Path) -> bool {
        DatastoreLayout::new(path).is_marked_consistent()
    }

    /// Removes the datastore at `path`. Returns false if nothing was there.
    pub fn remove(path: &Path) -> ManagerResult<bool> {
        let removed = file::remove_path(path)?;
        if removed {
            info!(path = %path.display(), "removed datastore");
        }
        Ok(removed)
    }

    /// Copies a closed datastore, file by file, in parallel.
    ///
    /// The copy keeps the source's uuid.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::Inconsistent`] if the source was not closed properly
    /// - [`ManagerError::AlreadyExists`] if `destination` exists
    pub fn copy(source: &Path, destination: &Path, config: &Config) -> ManagerResult<()> {
        if !Self::consistent(source) {
            return Err(ManagerError::inconsistent(source));
        }
        if destination.exists() {
            return Err(ManagerError::AlreadyExists {
                path: destination.to_path_buf(),
            });
        }

        let mode = if config.snapshot_clone {
            CopyMode::Clone
        } else {
            CopyMode::Sparse
        };
        match file::copy_files_in_directory_in_parallel(source, destination, config.copy_threads, mode) {
            Ok(files) => {
                info!(
                    source = %source.display(),
                    destination = %destination.display(),
                    files,
                    "copied datastore"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = file::remove_path(destination) {
                    warn!(path = %destination.display(), error = %cleanup, "failed to remove partial copy");
                }
                Err(e.into())
            }
        }
    }

    /// Returns the uuid of the datastore at `path`.
    pub fn get_uuid(path: &Path) -> ManagerResult<Uuid> {
        DatastoreLayout::new(path).read_uuid()
    }

    /// Returns the format version of the datastore at `path`.
    pub fn get_version(path: &Path) -> ManagerResult<u32> {
        DatastoreLayout::new(path).read_version()
    }

    /// Sets the description of the datastore at `path` without opening it.
    pub fn set_description_at(path: &Path, description: &str) -> ManagerResult<()> {
        if !file::directory_exists(path) {
            return Err(ManagerError::not_found(path.display().to_string()));
        }
        DatastoreLayout::new(path).write_description(description)
    }

    /// Returns the description of the datastore at `path` without opening it.
    pub fn get_description_at(path: &Path) -> ManagerResult<Option<String>> {
        if !file::directory_exists(path) {
            return Err(ManagerError::not_found(path.display().to_string()));
        }
        DatastoreLayout::new(path).read_description()
    }

    /// Reads the named-object attributes of a closed datastore.
    pub fn access_named_object_attribute(path: &Path) -> ManagerResult<ObjectAttributeAccessor> {
        ObjectAttributeAccessor::open(DatastoreLayout::new(path), ObjectKind::Named, false)
    }

    /// Reads the unique-object attributes of a closed datastore.
    pub fn access_unique_object_attribute(path: &Path) -> ManagerResult<ObjectAttributeAccessor> {
        ObjectAttributeAccessor::open(DatastoreLayout::new(path), ObjectKind::Unique, false)
    }

    /// Reads the anonymous-object attributes of a closed datastore.
    pub fn access_anonymous_object_attribute(path: &Path) -> ManagerResult<ObjectAttributeAccessor> {
        ObjectAttributeAccessor::open(DatastoreLayout::new(path), ObjectKind::Anonymous, false)
    }

    /// Opens the `kind` attributes of a properly closed datastore for
    /// annotation.
    pub fn access_object_attribute_mut(
        path: &Path,
        kind: ObjectKind,
    ) -> ManagerResult<ObjectAttributeAccessor> {
        ObjectAttributeAccessor::open(DatastoreLayout::new(path), kind, true)
    }
}

impl Drop for ManagerKernel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Drops directory entries whose small block was freed after the last
/// flush. The writer that crashed never persisted the matching directory
/// change, but the free-list header reached the chunk file.
fn hide_freed_objects(heap: &Heap, directory: &mut Directory, path: &Path) {
    let tables: &Directory = directory;
    let freed: Vec<u64> = ObjectKind::ALL
        .iter()
        .flat_map(move |&kind| tables.table(kind).iter())
        .map(|entry| entry.offset)
        .filter(|&offset| heap.is_free_small_block(offset))
        .collect();
    for &offset in &freed {
        directory.erase_by_offset(offset);
    }
    if !freed.is_empty() {
        warn!(
            path = %path.display(),
            hidden = freed.len(),
            "hiding objects freed after the last flush"
        );
    }
}

fn segment_options(config: &Config, chunk_size: usize, max_size: usize, read_only: bool) -> SegmentOptions {
    SegmentOptions {
        chunk_size,
        max_size,
        zero_fill: config.zero_fill_new_chunks,
        read_only,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config() -> Config {
        Config::new().chunk_size(1 << 16).max_segment_size(1 << 24)
    }

    #[test]
    fn create_refuses_existing_path() {
        let tmp = tempdir().unwrap();
        assert!(matches!(
            ManagerKernel::create(tmp.path(), config()),
            Err(ManagerError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn created_datastore_is_not_consistent_until_closed() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("ds");
        let kernel = ManagerKernel::create(&path, config()).unwrap();
        assert!(!ManagerKernel::consistent(&path));
        assert_eq!(kernel.mode(), OpenMode::Create);

        kernel.close().unwrap();
        assert!(ManagerKernel::consistent(&path));
    }

    #[test]
    fn construct_find_destroy() {
        let tmp = tempdir().unwrap();
        let kernel = ManagerKernel::create(&tmp.path().join("ds"), config()).unwrap();

        let offset = kernel.construct(ObjectKind::Named, "a", 4, 4).unwrap();
        assert!(matches!(
            kernel.construct(ObjectKind::Named, "a", 4, 4),
            Err(ManagerError::DuplicateKey { .. })
        ));

        let entry = kernel.find(ObjectKind::Named, "a").unwrap().unwrap();
        assert_eq!(entry.offset, offset.0);
        assert_eq!(entry.length, 4);
        assert_eq!(kernel.instance_name(offset).unwrap().as_deref(), Some("a"));
        assert_eq!(kernel.instance_kind(offset).unwrap(), Some(ObjectKind::Named));

        assert!(kernel.destroy(ObjectKind::Named, "a").unwrap());
        assert!(!kernel.destroy(ObjectKind::Named, "a").unwrap());
        assert!(kernel.find(ObjectKind::Named, "a").unwrap().is_none());
        assert_eq!(kernel.stats().constructs, 1);
        assert_eq!(kernel.stats().destroys, 1);
    }

    #[test]
    fn duplicate_construct_does_not_leak() {
        let tmp = tempdir().unwrap();
        let kernel = ManagerKernel::create(&tmp.path().join("ds"), config()).unwrap();
        kernel.construct(ObjectKind::Named, "a", 64, 8).unwrap();
        let before = kernel.check_heap().unwrap();

        assert!(kernel.construct(ObjectKind::Named, "a", 64, 8).is_err());
        let after = kernel.check_heap().unwrap();
        assert_eq!(before.small_allocated_blocks, after.small_allocated_blocks);
    }

    #[test]
    fn operations_after_close_fail() {
        let tmp = tempdir().unwrap();
        let kernel = ManagerKernel::create(&tmp.path().join("ds"), config()).unwrap();
        kernel.close().unwrap();
        kernel.close().unwrap();

        assert!(matches!(kernel.allocate(8), Err(ManagerError::Closed)));
        assert!(matches!(
            kernel.find(ObjectKind::Named, "x"),
            Err(ManagerError::Closed)
        ));
    }

    #[test]
    fn abort_leaves_datastore_inconsistent() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("ds");
        let kernel = ManagerKernel::create(&path, config()).unwrap();
        kernel.construct(ObjectKind::Named, "x", 8, 8).unwrap();
        kernel.abort();
        drop(kernel);

        assert!(!ManagerKernel::consistent(&path));
        assert!(matches!(
            ManagerKernel::open(&path, config()),
            Err(ManagerError::Inconsistent { .. })
        ));
    }

    #[test]
    fn open_missing_datastore() {
        let tmp = tempdir().unwrap();
        assert!(matches!(
            ManagerKernel::open(&tmp.path().join("none"), config()),
            Err(ManagerError::NotFound { .. })
        ));
    }

    #[test]
    fn persisted_geometry_wins_on_open() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("ds");
        ManagerKernel::create(&path, config()).unwrap().close().unwrap();

        let kernel = ManagerKernel::open(&path, Config::default()).unwrap();
        assert_eq!(kernel.chunk_size(), 1 << 16);
        assert_eq!(kernel.config().max_segment_size, 1 << 24);
    }

    #[test]
    fn description_by_instance_and_path() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("ds");
        let kernel = ManagerKernel::create(&path, config()).unwrap();
        assert_eq!(kernel.description().unwrap(), None);
        kernel.set_description("test store").unwrap();
        kernel.close().unwrap();

        assert_eq!(
            ManagerKernel::get_description_at(&path).unwrap().as_deref(),
            Some("test store")
        );
        ManagerKernel::set_description_at(&path, "renamed").unwrap();
        let kernel = ManagerKernel::open_read_only(&path, config()).unwrap();
        assert_eq!(kernel.description().unwrap().as_deref(), Some("renamed"));
        assert!(matches!(
            kernel.set_description("nope"),
            Err(ManagerError::ReadOnly)
        ));
    }

    #[test]
    fn uuid_and_version_by_path() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("ds");
        let kernel = ManagerKernel::create(&path, config()).unwrap();
        let uuid = kernel.uuid();
        kernel.close().unwrap();

        assert_eq!(ManagerKernel::get_uuid(&path).unwrap(), uuid);
        assert_eq!(ManagerKernel::get_version(&path).unwrap(), FORMAT_VERSION);
    }
}
