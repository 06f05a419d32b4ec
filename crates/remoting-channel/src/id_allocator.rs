use std::convert::TryFrom;
use std::marker::PhantomData;

use bitvec::prelude::*;
use remoting_proto::Oid;

pub(crate) trait Id: Copy {
    fn from_index(idx: u32) -> Self;
    fn index(self) -> u32;
}

impl Id for Oid {
    fn from_index(idx: u32) -> Self {
        // index 0 is reserved for `Oid::NULL`; shift every allocated slot up by one.
        Oid::new(idx + 1)
    }

    fn index(self) -> u32 {
        self.get() - 1
    }
}

/// Reuses freed object IDs before minting new ones, so a long-lived channel
/// doesn't march `Oid` towards `u32::MAX` just from churn.
pub(crate) struct IdAllocator<T: Id> {
    taken: BitVec,
    _pd: PhantomData<T>,
}

impl<T: Id> Default for IdAllocator<T> {
    fn default() -> Self {
        Self {
            taken: BitVec::new(),
            _pd: PhantomData,
        }
    }
}

impl<T: Id> IdAllocator<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns `None` only in the practically unreachable case of running
    /// out of `u32` index space.
    pub(crate) fn alloc(&mut self) -> Option<T> {
        match self.taken.iter_zeros().next() {
            Some(freed_idx) => {
                let freed_idx_u32 = u32::try_from(freed_idx).expect("freed IDs should fit in a u32");
                self.taken.set(freed_idx, true);
                Some(T::from_index(freed_idx_u32))
            }
            None => {
                let new_idx = self.taken.len();
                let new_idx_u32 = u32::try_from(new_idx).ok()?;
                self.taken.push(true);
                Some(T::from_index(new_idx_u32))
            }
        }
    }

    pub(crate) fn free(&mut self, id: T) {
        let idx = usize::try_from(id.index()).expect("ID should fit in a usize");
        if idx < self.taken.len() {
            self.taken.set(idx, false);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn allocates_increasing_non_null_ids() {
        let mut alloc: IdAllocator<Oid> = IdAllocator::new();
        let a = alloc.alloc().unwrap();
        let b = alloc.alloc().unwrap();
        assert!(!a.is_null());
        assert!(!b.is_null());
        assert_ne!(a, b);
    }

    #[test]
    fn reclaims_freed_ids() {
        let mut alloc: IdAllocator<Oid> = IdAllocator::new();
        let a = alloc.alloc().unwrap();
        alloc.free(a);
        let b = alloc.alloc().unwrap();
        assert_eq!(a, b);
    }
}
