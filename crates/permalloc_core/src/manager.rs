//! Typed façade over the manager kernel.
//!
//! [`Manager`] stores values of [`Persistable`] types in the segment and
//! registers them as named, unique or anonymous objects. Lookups hand back a
//! [`PersistentPtr`], a typed address valid for as long as the datastore stays
//! open in this process.
//!
//! ```no_run
//! use permalloc_core::Manager;
//! use std::path::Path;
//!
//! let path = Path::new("/tmp/counter");
//! let manager = Manager::create(path)?;
//! let counter = manager.construct("count", 0u64)?;
//! unsafe { counter.write(counter.read() + 1) };
//! manager.close()?;
//!
//! let manager = Manager::open(path)?;
//! let counter = manager.find::<u64>("count")?.expect("registered above");
//! assert_eq!(unsafe { counter.read() }, 1);
//! # Ok::<(), permalloc_core::ManagerError>(())
//! ```

use crate::accessor::ObjectAttributeAccessor;
use crate::config::Config;
use crate::directory::DirectoryEntry;
use crate::error::{ManagerError, ManagerResult};
use crate::heap::HeapReport;
use crate::kernel::ManagerKernel;
use crate::offset_ptr::OffsetPtr;
use crate::stats::StatsSnapshot;
use crate::types::{ObjectKind, Offset};
use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use uuid::Uuid;

/// Types that may be stored in a persistent segment.
///
/// # Safety
///
/// Implementors must be plain data: no absolute pointers or references
/// (use [`OffsetPtr`] instead), no heap-owning fields, and no `Drop` logic
/// that matters, since destructors are never run for persisted values.
/// Every bit pattern the program writes must be valid to read back in a
/// later process.
pub unsafe trait Persistable: 'static {}

macro_rules! persistable {
    ($($ty:ty),* $(,)?) => {
        $(unsafe impl Persistable for $ty {})*
    };
}

persistable!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool);

unsafe impl<T: Persistable, const N: usize> Persistable for [T; N] {}

unsafe impl<T: 'static> Persistable for OffsetPtr<T> {}

/// A typed address of a persisted object, valid while the datastore is open.
///
/// Holds `len` consecutive values of `T`. The offset is the stable identity;
/// the address is specific to this mapping.
pub struct PersistentPtr<T> {
    ptr: NonNull<T>,
    len: usize,
    offset: Offset,
    _marker: PhantomData<T>,
}

impl<T> PersistentPtr<T> {
    fn new(ptr: NonNull<u8>, len: usize, offset: Offset) -> Self {
        Self {
            ptr: ptr.cast(),
            len,
            offset,
            _marker: PhantomData,
        }
    }

    /// Returns the segment offset.
    #[must_use]
    pub fn offset(&self) -> Offset {
        self.offset
    }

    /// Returns the number of `T` values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the object holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the address in this process.
    #[must_use]
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Reads the first value.
    ///
    /// # Safety
    ///
    /// The datastore must still be open and no other thread may be writing
    /// the value.
    pub unsafe fn read(&self) -> T
    where
        T: Copy,
    {
        self.ptr.as_ptr().read()
    }

    /// Overwrites the first value without dropping the old one.
    ///
    /// # Safety
    ///
    /// The datastore must be open for writing and no other thread may be
    /// accessing the value.
    pub unsafe fn write(&self, value: T) {
        self.ptr.as_ptr().write(value);
    }

    /// Borrows the first value.
    ///
    /// # Safety
    ///
    /// The datastore must stay open for `'a` and the value must not be
    /// mutated meanwhile.
    pub unsafe fn as_ref<'a>(&self) -> &'a T {
        &*self.ptr.as_ptr()
    }

    /// Mutably borrows the first value.
    ///
    /// # Safety
    ///
    /// As [`as_ref`](Self::as_ref), and the borrow must be unique.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut<'a>(&self) -> &'a mut T {
        &mut *self.ptr.as_ptr()
    }

    /// Borrows all values.
    ///
    /// # Safety
    ///
    /// Same as [`as_ref`](Self::as_ref).
    pub unsafe fn as_slice<'a>(&self) -> &'a [T] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// Mutably borrows all values.
    ///
    /// # Safety
    ///
    /// Same as [`as_mut`](Self::as_mut).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [T] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

impl<T> Clone for PersistentPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PersistentPtr<T> {}

impl<T> PartialEq for PersistentPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr && self.len == other.len
    }
}

impl<T> Eq for PersistentPtr<T> {}

impl<T> fmt::Debug for PersistentPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentPtr")
            .field("type", &type_name::<T>())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

// SAFETY: the pointer targets the shared mapping, not thread-local data.
unsafe impl<T: Send> Send for PersistentPtr<T> {}
// SAFETY: as above; access goes through unsafe methods with their own contracts.
unsafe impl<T: Sync> Sync for PersistentPtr<T> {}

/// The persistent memory manager.
///
/// Dropping the last handle (the manager and every [`PersistentAllocator`]
/// cloned from it) closes the datastore. Use [`Manager::close`] to observe
/// close errors.
#[derive(Debug, Clone)]
pub struct Manager {
    kernel: Arc<ManagerKernel>,
}

impl Manager {
    /// Creates a datastore at `path` with the default configuration.
    pub fn create(path: &Path) -> ManagerResult<Self> {
        Self::create_with_config(path, Config::default())
    }

    /// Creates a datastore at `path`.
    pub fn create_with_config(path: &Path, config: Config) -> ManagerResult<Self> {
        Ok(Self::from_kernel(ManagerKernel::create(path, config)?))
    }

    /// Opens a datastore for reading and writing.
    pub fn open(path: &Path) -> ManagerResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens a datastore for reading and writing.
    pub fn open_with_config(path: &Path, config: Config) -> ManagerResult<Self> {
        Ok(Self::from_kernel(ManagerKernel::open(path, config)?))
    }

    /// Opens a datastore read-only.
    pub fn open_read_only(path: &Path) -> ManagerResult<Self> {
        Self::open_read_only_with_config(path, Config::default())
    }

    /// Opens a datastore read-only.
    pub fn open_read_only_with_config(path: &Path, config: Config) -> ManagerResult<Self> {
        Ok(Self::from_kernel(ManagerKernel::open_read_only(path, config)?))
    }

    fn from_kernel(kernel: ManagerKernel) -> Self {
        Self {
            kernel: Arc::new(kernel),
        }
    }

    /// Returns the underlying kernel.
    #[must_use]
    pub fn kernel(&self) -> &Arc<ManagerKernel> {
        &self.kernel
    }

    /// Returns an allocator handle sharing this datastore.
    #[must_use]
    pub fn allocator(&self) -> PersistentAllocator {
        PersistentAllocator {
            kernel: Arc::clone(&self.kernel),
        }
    }

    /// Closes the datastore. Handles sharing it see [`ManagerError::Closed`]
    /// afterwards.
    pub fn close(&self) -> ManagerResult<()> {
        self.kernel.close()
    }

    // === Named objects ===

    /// Stores `value` under `name`.
    ///
    /// # Errors
    ///
    /// [`ManagerError::DuplicateKey`] if `name` is taken.
    pub fn construct<T: Persistable>(&self, name: &str, value: T) -> ManagerResult<PersistentPtr<T>> {
        self.construct_kind(ObjectKind::Named, name, value)
    }

    /// Stores `len` copies of `value` under `name`.
    pub fn construct_array<T: Persistable + Clone>(
        &self,
        name: &str,
        len: usize,
        value: T,
    ) -> ManagerResult<PersistentPtr<T>> {
        self.construct_array_kind(ObjectKind::Named, name, len, value)
    }

    /// Looks up the object named `name`.
    ///
    /// Returns `None` if there is no such object.
    ///
    /// # Errors
    ///
    /// [`ManagerError::InvalidArgument`] if the stored length is not a whole
    /// number of `T`.
    pub fn find<T: Persistable>(&self, name: &str) -> ManagerResult<Option<PersistentPtr<T>>> {
        self.find_kind(ObjectKind::Named, name)
    }

    /// Frees the object named `name`. Returns false if it does not exist.
    ///
    /// Destructors are not run.
    pub fn destroy<T: Persistable>(&self, name: &str) -> ManagerResult<bool> {
        self.kernel.destroy(ObjectKind::Named, name)
    }

    // === Unique objects ===

    /// Stores the single object of type `T`.
    pub fn construct_unique<T: Persistable>(&self, value: T) -> ManagerResult<PersistentPtr<T>> {
        self.construct_kind(ObjectKind::Unique, type_name::<T>(), value)
    }

    /// Stores the single array of type `T`.
    pub fn construct_unique_array<T: Persistable + Clone>(
        &self,
        len: usize,
        value: T,
    ) -> ManagerResult<PersistentPtr<T>> {
        self.construct_array_kind(ObjectKind::Unique, type_name::<T>(), len, value)
    }

    /// Looks up the single object of type `T`.
    pub fn find_unique<T: Persistable>(&self) -> ManagerResult<Option<PersistentPtr<T>>> {
        self.find_kind(ObjectKind::Unique, type_name::<T>())
    }

    /// Frees the single object of type `T`.
    pub fn destroy_unique<T: Persistable>(&self) -> ManagerResult<bool> {
        self.kernel.destroy(ObjectKind::Unique, type_name::<T>())
    }

    // === Anonymous objects ===

    /// Stores `value` as an anonymous object, identified only by its offset.
    pub fn construct_anonymous<T: Persistable>(&self, value: T) -> ManagerResult<PersistentPtr<T>> {
        self.construct_kind(ObjectKind::Anonymous, "", value)
    }

    /// Frees the registered object `ptr` points to, of any kind.
    ///
    /// Returns false if nothing is registered at its offset.
    pub fn destroy_ptr<T>(&self, ptr: &PersistentPtr<T>) -> ManagerResult<bool> {
        self.kernel.destroy_at(ptr.offset())
    }

    fn construct_kind<T: Persistable>(
        &self,
        kind: ObjectKind,
        name: &str,
        value: T,
    ) -> ManagerResult<PersistentPtr<T>> {
        let size = size_of::<T>();
        let offset = self.kernel.construct(kind, name, size, align_of::<T>())?;
        let address = self.kernel.to_address_range(offset, size as u64)?;
        let ptr = PersistentPtr::new(address, 1, offset);
        // SAFETY: the block is freshly allocated, sized and aligned for T.
        unsafe { ptr.write(value) };
        Ok(ptr)
    }

    fn construct_array_kind<T: Persistable + Clone>(
        &self,
        kind: ObjectKind,
        name: &str,
        len: usize,
        value: T,
    ) -> ManagerResult<PersistentPtr<T>> {
        let size = size_of::<T>()
            .checked_mul(len)
            .ok_or_else(|| ManagerError::invalid_argument("array size overflows"))?;
        let offset = self.kernel.construct(kind, name, size, align_of::<T>())?;
        let address = self.kernel.to_address_range(offset, size as u64)?;
        let ptr = PersistentPtr::<T>::new(address, len, offset);
        for index in 0..len {
            // SAFETY: index < len and the block holds len values of T.
            unsafe { ptr.as_ptr().add(index).write(value.clone()) };
        }
        Ok(ptr)
    }

    fn find_kind<T: Persistable>(
        &self,
        kind: ObjectKind,
        name: &str,
    ) -> ManagerResult<Option<PersistentPtr<T>>> {
        let Some(entry) = self.kernel.find(kind, name)? else {
            return Ok(None);
        };
        self.typed(&entry).map(Some)
    }

    fn typed<T>(&self, entry: &DirectoryEntry) -> ManagerResult<PersistentPtr<T>> {
        let size = size_of::<T>() as u64;
        if size == 0 || entry.length % size != 0 {
            return Err(ManagerError::invalid_argument(format!(
                "object '{}' is {} bytes, not a whole number of {}",
                entry.name,
                entry.length,
                type_name::<T>()
            )));
        }
        if entry.offset % align_of::<T>() as u64 != 0 {
            return Err(ManagerError::invalid_argument(format!(
                "object '{}' is not aligned for {}",
                entry.name,
                type_name::<T>()
            )));
        }
        let offset = Offset(entry.offset);
        let address = self.kernel.to_address_range(offset, entry.length)?;
        Ok(PersistentPtr::new(address, (entry.length / size) as usize, offset))
    }

    // === Raw memory ===

    /// Allocates `size` unregistered bytes.
    pub fn allocate(&self, size: usize) -> ManagerResult<Offset> {
        self.kernel.allocate(size)
    }

    /// Allocates `size` unregistered bytes aligned to `align`.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> ManagerResult<Offset> {
        self.kernel.allocate_aligned(size, align)
    }

    /// Frees unregistered bytes.
    pub fn deallocate(&self, offset: Offset) -> ManagerResult<()> {
        self.kernel.deallocate(offset)
    }

    /// Returns the address of `offset` in this process.
    pub fn to_address(&self, offset: Offset) -> ManagerResult<NonNull<u8>> {
        self.kernel.to_address(offset)
    }

    /// Returns the offset of a mapped address.
    pub fn to_offset(&self, address: *const u8) -> Option<Offset> {
        self.kernel.to_offset(address)
    }

    // === Directory ===

    /// Returns the registered objects of `kind` in insertion order.
    pub fn objects(&self, kind: ObjectKind) -> ManagerResult<Vec<DirectoryEntry>> {
        self.kernel.objects(kind)
    }

    /// Returns the number of registered objects of `kind`.
    pub fn num_objects(&self, kind: ObjectKind) -> ManagerResult<usize> {
        self.kernel.num_objects(kind)
    }

    /// Returns the name of the object `ptr` points to.
    pub fn instance_name<T>(&self, ptr: &PersistentPtr<T>) -> ManagerResult<Option<String>> {
        self.kernel.instance_name(ptr.offset())
    }

    /// Returns the length in bytes of the object `ptr` points to.
    pub fn instance_length<T>(&self, ptr: &PersistentPtr<T>) -> ManagerResult<Option<u64>> {
        self.kernel.instance_length(ptr.offset())
    }

    /// Returns the kind of the object `ptr` points to.
    pub fn instance_kind<T>(&self, ptr: &PersistentPtr<T>) -> ManagerResult<Option<ObjectKind>> {
        self.kernel.instance_kind(ptr.offset())
    }

    /// Returns the description of the object `ptr` points to.
    pub fn instance_description<T>(&self, ptr: &PersistentPtr<T>) -> ManagerResult<Option<String>> {
        self.kernel.instance_description(ptr.offset())
    }

    /// Sets the description of the object `ptr` points to.
    pub fn set_instance_description<T>(
        &self,
        ptr: &PersistentPtr<T>,
        description: &str,
    ) -> ManagerResult<bool> {
        self.kernel.set_instance_description(ptr.offset(), description)
    }

    // === Datastore ===

    /// Syncs data and metadata without marking the datastore clean.
    pub fn flush(&self) -> ManagerResult<()> {
        self.kernel.flush()
    }

    /// Writes a point-in-time copy to `destination`.
    pub fn snapshot(&self, destination: &Path) -> ManagerResult<()> {
        self.kernel.snapshot(destination)
    }

    /// Walks the heap and checks it for consistency.
    pub fn check_heap(&self) -> ManagerResult<HeapReport> {
        self.kernel.check_heap()
    }

    /// Returns the allocator counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.kernel.stats()
    }

    /// Returns the datastore identity.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.kernel.uuid()
    }

    /// Returns the datastore path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.kernel.path()
    }

    /// Returns true if opened read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.kernel.is_read_only()
    }

    /// Sets the datastore description.
    pub fn set_description(&self, description: &str) -> ManagerResult<()> {
        self.kernel.set_description(description)
    }

    /// Returns the datastore description.
    pub fn description(&self) -> ManagerResult<Option<String>> {
        self.kernel.description()
    }

    // === Path-level operations ===

    /// Returns true if the datastore at `path` was closed properly.
    #[must_use]
    pub fn consistent(path: &Path) -> bool {
        ManagerKernel::consistent(path)
    }

    /// Removes the datastore at `path`.
    pub fn remove(path: &Path) -> ManagerResult<bool> {
        ManagerKernel::remove(path)
    }

    /// Copies a closed datastore.
    pub fn copy(source: &Path, destination: &Path) -> ManagerResult<()> {
        ManagerKernel::copy(source, destination, &Config::default())
    }

    /// Returns the uuid of the datastore at `path`.
    pub fn get_uuid(path: &Path) -> ManagerResult<Uuid> {
        ManagerKernel::get_uuid(path)
    }

    /// Returns the format version of the datastore at `path`.
    pub fn get_version(path: &Path) -> ManagerResult<u32> {
        ManagerKernel::get_version(path)
    }

    /// Sets the description of the datastore at `path`.
    pub fn set_description_at(path: &Path, description: &str) -> ManagerResult<()> {
        ManagerKernel::set_description_at(path, description)
    }

    /// Returns the description of the datastore at `path`.
    pub fn get_description_at(path: &Path) -> ManagerResult<Option<String>> {
        ManagerKernel::get_description_at(path)
    }

    /// Reads the named objects of a closed datastore.
    pub fn access_named_object_attribute(path: &Path) -> ManagerResult<ObjectAttributeAccessor> {
        ManagerKernel::access_named_object_attribute(path)
    }

    /// Reads the unique objects of a closed datastore.
    pub fn access_unique_object_attribute(path: &Path) -> ManagerResult<ObjectAttributeAccessor> {
        ManagerKernel::access_unique_object_attribute(path)
    }

    /// Reads the anonymous objects of a closed datastore.
    pub fn access_anonymous_object_attribute(path: &Path) -> ManagerResult<ObjectAttributeAccessor> {
        ManagerKernel::access_anonymous_object_attribute(path)
    }
}

/// A cheap, cloneable allocation handle bound to one datastore.
///
/// Every clone keeps the datastore mapped.
#[derive(Clone)]
pub struct PersistentAllocator {
    kernel: Arc<ManagerKernel>,
}

impl PersistentAllocator {
    /// Allocates `size` bytes aligned to `align`.
    pub fn allocate(&self, size: usize, align: usize) -> ManagerResult<NonNull<u8>> {
        let offset = self.kernel.allocate_aligned(size, align)?;
        self.kernel.to_address_range(offset, size as u64)
    }

    /// Allocates room for `len` values of `T`.
    pub fn allocate_array<T: Persistable>(&self, len: usize) -> ManagerResult<NonNull<T>> {
        let size = size_of::<T>()
            .checked_mul(len)
            .ok_or_else(|| ManagerError::invalid_argument("array size overflows"))?;
        Ok(self.allocate(size, align_of::<T>())?.cast())
    }

    /// Frees memory returned by [`allocate`](Self::allocate).
    ///
    /// # Errors
    ///
    /// [`ManagerError::InvalidFree`] if `ptr` is not a live allocation of
    /// this datastore.
    pub fn deallocate(&self, ptr: NonNull<u8>) -> ManagerResult<()> {
        let offset = self
            .kernel
            .to_offset(ptr.as_ptr())
            .ok_or_else(|| ManagerError::invalid_free(0, "address outside the segment"))?;
        self.kernel.deallocate(offset)
    }

    /// Returns the offset of an address in this datastore.
    pub fn to_offset(&self, ptr: *const u8) -> Option<Offset> {
        self.kernel.to_offset(ptr)
    }

    /// Returns the address of `offset`.
    pub fn to_address(&self, offset: Offset) -> ManagerResult<NonNull<u8>> {
        self.kernel.to_address(offset)
    }
}

impl PartialEq for PersistentAllocator {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.kernel, &other.kernel)
    }
}

impl Eq for PersistentAllocator {}

impl fmt::Debug for PersistentAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentAllocator")
            .field("path", &self.kernel.path())
            .finish()
    }
}
