//! The collective seam consumed by team management.
//!
//! Reduction and barrier algorithms live above this crate; teams only
//! dictate which PEs participate and which pSync slot is scratch.

use thiserror::Error;

/// A strided subset of world ranks: `start, start+stride, …`,
/// `size` members in all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActiveSet {
    pub start: usize,
    pub stride: usize,
    pub size: usize,
}

impl ActiveSet {
    /// Index of `pe` within the set, if it is a member.
    pub fn index_of(&self, pe: usize) -> Option<usize> {
        if pe < self.start {
            return None;
        }
        let off = pe - self.start;
        if off % self.stride != 0 {
            return None;
        }
        let idx = off / self.stride;
        if idx < self.size {
            Some(idx)
        } else {
            None
        }
    }

    pub fn contains(&self, pe: usize) -> bool {
        self.index_of(pe).is_some()
    }

    /// World rank of member `idx`.
    pub fn world_rank(&self, idx: usize) -> usize {
        self.start + idx * self.stride
    }
}

/// Handle to a symmetric allocation, identical on every PE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymHandle(pub u64);

/// A pSync scratch slot inside a symmetric allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PsyncRef {
    pub handle: SymHandle,
    pub offset_words: usize,
}

#[derive(Debug, Error)]
pub enum CollectiveError {
    #[error("collective failed: {0}")]
    Failed(String),
}

/// Symmetric allocator, consumed once at teams init for the pSync pool and
/// the reservation word. Allocations are never returned during a run.
pub trait SymmetricHeap: Send + Sync {
    /// Allocate `count` words at the same symmetric address on every PE,
    /// each initialized to `fill`.
    fn alloc_words(&self, count: usize, fill: i64) -> Result<SymHandle, CollectiveError>;
}

pub trait Collectives: Send + Sync {
    /// Bitwise-AND reduction of `value` across `set`, using `scratch` for
    /// coordination. Every member must call with the same `set`/`scratch`.
    fn and_reduce_u64(
        &self,
        set: ActiveSet,
        value: u64,
        scratch: PsyncRef,
    ) -> Result<u64, CollectiveError>;

    /// Barrier across `set`, coordinated through `scratch`.
    fn barrier(&self, set: ActiveSet, scratch: PsyncRef) -> Result<(), CollectiveError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_of_strided_membership() {
        let set = ActiveSet { start: 2, stride: 3, size: 4 };
        // Members: 2, 5, 8, 11.
        assert_eq!(set.index_of(2), Some(0));
        assert_eq!(set.index_of(5), Some(1));
        assert_eq!(set.index_of(11), Some(3));
        assert_eq!(set.index_of(14), None);
        assert_eq!(set.index_of(3), None);
        assert_eq!(set.index_of(0), None);
    }

    #[test]
    fn world_rank_inverts_index_of() {
        let set = ActiveSet { start: 1, stride: 2, size: 5 };
        for idx in 0..set.size {
            assert_eq!(set.index_of(set.world_rank(idx)), Some(idx));
        }
    }
}
