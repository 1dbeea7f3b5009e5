//! Relocatable pointer for structures stored inside the segment.
//!
//! An [`OffsetPtr`] stores the distance from its own address to its target
//! instead of the target's address. When the segment is mapped at a
//! different base in a later process, pointer and target move by the same
//! amount and the stored distance stays correct.
//!
//! The pointer is only meaningful while it lives at its final address, so it
//! is neither `Copy` nor `Clone`; use [`OffsetPtr::assign`] to make one
//! pointer refer to another's target.

use std::fmt;
use std::marker::PhantomData;
use std::ptr;

/// Displacement reserved for the null pointer.
///
/// A target exactly one byte past the pointer's own address cannot be
/// represented.
const NULL_DISPLACEMENT: isize = 1;

/// A pointer stored as a displacement from its own address.
#[repr(transparent)]
pub struct OffsetPtr<T> {
    displacement: isize,
    _target: PhantomData<*mut T>,
}

impl<T> OffsetPtr<T> {
    /// Returns a null pointer.
    #[must_use]
    pub const fn null() -> Self {
        Self {
            displacement: NULL_DISPLACEMENT,
            _target: PhantomData,
        }
    }

    /// Returns true if the pointer is null.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.displacement == NULL_DISPLACEMENT
    }

    /// Returns the raw displacement.
    #[must_use]
    pub const fn displacement(&self) -> isize {
        self.displacement
    }

    fn self_address(&self) -> *const u8 {
        ptr::from_ref(self).cast::<u8>()
    }

    /// Resolves the target address, or null.
    #[must_use]
    pub fn get(&self) -> *mut T {
        if self.is_null() {
            return ptr::null_mut();
        }
        self.self_address()
            .wrapping_offset(self.displacement)
            .cast::<T>()
            .cast_mut()
    }

    /// Points at `target`, or becomes null if `target` is null.
    pub fn set(&mut self, target: *const T) {
        self.displacement = if target.is_null() {
            NULL_DISPLACEMENT
        } else {
            (target as isize).wrapping_sub(self.self_address() as isize)
        };
    }

    /// Makes this pointer refer to the same target as `other`.
    pub fn assign(&mut self, other: &OffsetPtr<T>) {
        self.set(other.get());
    }

    /// Makes the pointer null.
    pub fn reset(&mut self) {
        self.displacement = NULL_DISPLACEMENT;
    }

    /// Returns a shared reference to the target.
    ///
    /// # Safety
    ///
    /// The target must be a valid, initialized `T` for `'a` and must not be
    /// mutated through another path meanwhile.
    #[must_use]
    pub unsafe fn as_ref<'a>(&self) -> Option<&'a T> {
        // SAFETY: forwarded to the caller.
        unsafe { self.get().as_ref() }
    }

    /// Returns a mutable reference to the target.
    ///
    /// # Safety
    ///
    /// The target must be a valid, initialized `T` for `'a` with no other
    /// live reference to it.
    #[must_use]
    pub unsafe fn as_mut<'a>(&self) -> Option<&'a mut T> {
        // SAFETY: forwarded to the caller.
        unsafe { self.get().as_mut() }
    }
}

impl<T> Default for OffsetPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for OffsetPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl<T> Eq for OffsetPtr<T> {}

impl<T> fmt::Debug for OffsetPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("OffsetPtr(null)")
        } else {
            write!(f, "OffsetPtr({:p}, {:+})", self.get(), self.displacement)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Node {
        next: OffsetPtr<Node>,
        value: u64,
    }

    #[repr(C, align(16))]
    struct Arena([u8; 64]);

    #[test]
    fn null_by_default() {
        let p: OffsetPtr<u32> = OffsetPtr::default();
        assert!(p.is_null());
        assert!(p.get().is_null());
        assert_eq!(p, OffsetPtr::null());
    }

    #[test]
    fn resolves_target() {
        let target = 42u32;
        let mut p = OffsetPtr::null();
        p.set(&target);
        assert!(!p.is_null());
        assert_eq!(p.get().cast_const(), ptr::from_ref(&target));
        assert_eq!(unsafe { p.as_ref() }, Some(&42));

        p.set(ptr::null());
        assert!(p.is_null());
    }

    #[test]
    fn points_to_itself() {
        let mut node = Node {
            next: OffsetPtr::null(),
            value: 5,
        };
        let addr = ptr::from_ref(&node);
        node.next.set(addr);
        assert_eq!(node.next.displacement(), 0);
        assert_eq!(unsafe { node.next.as_ref() }.map(|n| n.value), Some(5));
    }

    #[test]
    fn survives_relocation_of_whole_region() {
        let mut a = Arena([0; 64]);
        let first = a.0.as_mut_ptr().cast::<Node>();
        unsafe {
            let second = first.add(1);
            first.write(Node {
                next: OffsetPtr::null(),
                value: 1,
            });
            second.write(Node {
                next: OffsetPtr::null(),
                value: 2,
            });
            (*first).next.set(second);
        }

        let mut b = Arena([0; 64]);
        b.0.copy_from_slice(&a.0);
        a.0.fill(0);

        let moved = b.0.as_ptr().cast::<Node>();
        let next = unsafe { (*moved).next.as_ref() }.unwrap();
        assert_eq!(next.value, 2);
        assert_eq!(ptr::from_ref(next), unsafe { moved.add(1) });
    }

    #[test]
    fn assign_copies_target_not_displacement() {
        let values = [10u64, 20];
        let mut a = OffsetPtr::null();
        a.set(&values[1]);

        let mut b = OffsetPtr::null();
        b.assign(&a);
        assert_eq!(a, b);
        assert_eq!(unsafe { b.as_ref() }, Some(&20));
    }
}
