//! Shared-transmit-context pool.
//!
//! A fixed pool of provider transmit resources is multiplexed over every
//! communication context. Contexts that ask for a private STX get an
//! exclusive slot keyed by thread identity when one is free; otherwise they
//! fall back to sharing and the private option is stripped. Shared slots
//! are picked round-robin or at random, under a soft over-subscription
//! threshold.
//!
//! All mutation happens under the process-wide transport lock; slots are
//! referenced by index so nothing here holds a cycle.

use super::TransportError;
use crate::config::StxAllocatorKind;
use crate::provider::SharedTx;
use crate::tid::ThreadId;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::collections::HashMap;
use std::fmt::Write as _;
use tracing::{debug, warn};

pub struct StxSlot {
    pub handle: Box<dyn SharedTx>,
    pub ref_cnt: u64,
    pub is_private: bool,
}

/// Outcome of an allocation: the slot index and whether exclusivity was
/// actually granted.
#[derive(Debug, Clone, Copy)]
pub struct StxGrant {
    pub idx: usize,
    pub private: bool,
}

pub struct StxPool {
    slots: Vec<StxSlot>,
    /// thread -> slot holding that thread's private STX.
    tid_map: HashMap<ThreadId, usize>,
    allocator: StxAllocatorKind,
    rr_cursor: usize,
    rng: ChaCha20Rng,
}

impl StxPool {
    pub fn new(handles: Vec<Box<dyn SharedTx>>, allocator: StxAllocatorKind, my_pe: usize) -> Self {
        let slots = handles
            .into_iter()
            .map(|handle| StxSlot { handle, ref_cnt: 0, is_private: false })
            .collect();
        StxPool {
            slots,
            tid_map: HashMap::new(),
            allocator,
            rr_cursor: 0,
            rng: ChaCha20Rng::seed_from_u64(my_pe as u64),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ref_cnt(&self, idx: usize) -> u64 {
        self.slots[idx].ref_cnt
    }

    pub fn is_private(&self, idx: usize) -> bool {
        self.slots[idx].is_private
    }

    pub fn handle(&self, idx: usize) -> &dyn SharedTx {
        self.slots[idx].handle.as_ref()
    }

    /// Sum of reference counts; equals the number of live context bindings.
    pub fn ref_sum(&self) -> u64 {
        self.slots.iter().map(|s| s.ref_cnt).sum()
    }

    pub fn private_owner(&self, tid: &ThreadId) -> Option<usize> {
        self.tid_map.get(tid).copied()
    }

    pub fn private_owner_count(&self) -> usize {
        self.tid_map.len()
    }

    fn find_unused(&self) -> Option<usize> {
        let idx = self.slots.iter().position(|s| s.ref_cnt == 0);
        if let Some(i) = idx {
            debug_assert!(!self.slots[i].is_private);
        }
        idx
    }

    fn eligible_shared(slot: &StxSlot, threshold: i64) -> bool {
        slot.ref_cnt > 0
            && !slot.is_private
            && (threshold == -1 || slot.ref_cnt <= threshold as u64)
    }

    fn find_shared(&mut self, threshold: i64) -> Option<usize> {
        match self.allocator {
            StxAllocatorKind::RoundRobin => {
                let n = self.slots.len();
                let mut i = self.rr_cursor;
                for _ in 0..n {
                    if Self::eligible_shared(&self.slots[i], threshold) {
                        self.rr_cursor = (i + 1) % n;
                        return Some(i);
                    }
                    i = (i + 1) % n;
                }
                None
            }
            StxAllocatorKind::Random => {
                if !self.slots.iter().any(|s| Self::eligible_shared(s, threshold)) {
                    return None;
                }
                // Probe at random until an eligible slot turns up.
                loop {
                    let idx = self.rng.gen_range(0..self.slots.len());
                    if Self::eligible_shared(&self.slots[idx], threshold) {
                        return Some(idx);
                    }
                }
            }
        }
    }

    /// Bind one more context to the pool under `threshold` over-subscription.
    ///
    /// `request_private` must already account for the disable-private knob.
    pub fn allocate(
        &mut self,
        request_private: bool,
        tid: ThreadId,
        threshold: i64,
    ) -> Result<StxGrant, TransportError> {
        let grant = if request_private {
            if let Some(&idx) = self.tid_map.get(&tid) {
                // Contexts private to the same thread share that thread's STX.
                self.slots[idx].ref_cnt += 1;
                StxGrant { idx, private: true }
            } else if let Some(idx) = self.find_unused() {
                let slot = &mut self.slots[idx];
                slot.ref_cnt = 1;
                slot.is_private = true;
                self.tid_map.insert(tid, idx);
                StxGrant { idx, private: true }
            } else {
                debug!("private STX unavailable, falling back to STX sharing");
                let idx = self
                    .find_shared(threshold)
                    .or_else(|| self.find_shared(-1))
                    .ok_or(TransportError::StxExhausted)?;
                self.slots[idx].ref_cnt += 1;
                StxGrant { idx, private: false }
            }
        } else {
            let idx = self
                .find_shared(threshold)
                .or_else(|| self.find_unused())
                .or_else(|| self.find_shared(-1))
                .ok_or(TransportError::StxExhausted)?;
            self.slots[idx].ref_cnt += 1;
            StxGrant { idx, private: false }
        };

        debug!("STX[{}] = [ {} ]", self.slots.len(), self.dump());
        Ok(grant)
    }

    /// Drop one context's binding. `private` reflects the context's final
    /// (post-strip) options; `tid` is the owner recorded at creation.
    pub fn release(
        &mut self,
        idx: usize,
        private: bool,
        tid: Option<ThreadId>,
    ) -> Result<(), TransportError> {
        if private {
            let owner = tid.and_then(|t| self.tid_map.get(&t).map(|&i| (t, i)));
            match owner {
                Some((t, _)) => {
                    let slot = &mut self.slots[idx];
                    slot.ref_cnt = slot.ref_cnt.saturating_sub(1);
                    if slot.ref_cnt == 0 {
                        self.tid_map.remove(&t);
                        slot.is_private = false;
                    }
                }
                None => warn!(idx, "unable to locate private STX"),
            }
        } else {
            let slot = &mut self.slots[idx];
            slot.ref_cnt = slot.ref_cnt.saturating_sub(1);
            if slot.is_private {
                return Err(TransportError::InconsistentPrivateFlag(idx as i64));
            }
        }
        Ok(())
    }

    /// Clear leaked private-owner entries at shutdown, returning how many
    /// were left behind.
    pub fn drain_private_owners(&mut self) -> usize {
        let leaked = self.tid_map.len();
        self.tid_map.clear();
        leaked
    }

    /// Per-slot "refcount + P|S" summary for diagnostics.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, slot) in self.slots.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{}{}", slot.ref_cnt, if slot.is_private { "P" } else { "S" });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::loopback::{LoopbackConfig, LoopbackProvider};
    use crate::provider::{Caps, FabricHints, Provider, Threading};

    fn pool(n: usize, allocator: StxAllocatorKind) -> StxPool {
        let prov = LoopbackProvider::new(LoopbackConfig::default());
        let hints = FabricHints {
            caps: Caps::RMA,
            threading: Threading::Domain,
            provider_name: None,
            inject_size: 16,
        };
        let desc = prov.discover(&hints).unwrap().remove(0);
        let fabric = prov.open_fabric(&desc).unwrap();
        let domain = fabric.open_domain(&desc).unwrap();
        let handles = (0..n).map(|_| domain.alloc_stx().unwrap()).collect();
        StxPool::new(handles, allocator, 0)
    }

    #[test]
    fn round_robin_spreads_shared_contexts() {
        let mut pool = pool(2, StxAllocatorKind::RoundRobin);
        // Scenario: stx_max=2, threshold=1, four shared contexts.
        let a = pool.allocate(false, ThreadId::Synthetic(0), 1).unwrap();
        let b = pool.allocate(false, ThreadId::Synthetic(0), 1).unwrap();
        let c = pool.allocate(false, ThreadId::Synthetic(0), 1).unwrap();
        let d = pool.allocate(false, ThreadId::Synthetic(0), 1).unwrap();
        assert_eq!(pool.ref_cnt(0), 2);
        assert_eq!(pool.ref_cnt(1), 2);
        assert!(!a.private && !b.private && !c.private && !d.private);
        assert_eq!(pool.ref_sum(), 4);
    }

    #[test]
    fn private_contexts_on_one_thread_share_a_slot() {
        let mut pool = pool(2, StxAllocatorKind::RoundRobin);
        let t1 = ThreadId::OsTid(100);
        let a = pool.allocate(true, t1, 1).unwrap();
        let b = pool.allocate(true, t1, 1).unwrap();
        assert!(a.private && b.private);
        assert_eq!(a.idx, b.idx);
        assert_eq!(pool.ref_cnt(a.idx), 2);
        assert!(pool.is_private(a.idx));
        assert_eq!(pool.private_owner(&t1), Some(a.idx));
    }

    #[test]
    fn private_downgrades_when_no_slot_is_unused() {
        let mut pool = pool(1, StxAllocatorKind::RoundRobin);
        // The default context occupies the only slot, shared.
        let shared = pool.allocate(false, ThreadId::Synthetic(0), 1).unwrap();
        assert!(!shared.private);
        let grant = pool.allocate(true, ThreadId::OsTid(7), 1).unwrap();
        assert!(!grant.private, "private request must downgrade to shared");
        assert_eq!(grant.idx, shared.idx);
        assert!(!pool.is_private(grant.idx));
        assert_eq!(pool.private_owner_count(), 0);
    }

    #[test]
    fn release_returns_refcounts_to_baseline() {
        let mut pool = pool(3, StxAllocatorKind::RoundRobin);
        let before = pool.ref_sum();
        let t = ThreadId::OsTid(1);
        let g = pool.allocate(true, t, 1).unwrap();
        let h = pool.allocate(false, ThreadId::Synthetic(9), 1).unwrap();
        pool.release(h.idx, false, None).unwrap();
        pool.release(g.idx, true, Some(t)).unwrap();
        assert_eq!(pool.ref_sum(), before);
        assert!(!pool.is_private(g.idx));
        assert_eq!(pool.private_owner_count(), 0);
    }

    #[test]
    fn private_release_keeps_slot_until_last_reference() {
        let mut pool = pool(2, StxAllocatorKind::RoundRobin);
        let t = ThreadId::OsTid(5);
        let a = pool.allocate(true, t, 1).unwrap();
        let _b = pool.allocate(true, t, 1).unwrap();
        pool.release(a.idx, true, Some(t)).unwrap();
        assert!(pool.is_private(a.idx));
        assert_eq!(pool.private_owner(&t), Some(a.idx));
        pool.release(a.idx, true, Some(t)).unwrap();
        assert!(!pool.is_private(a.idx));
        assert_eq!(pool.private_owner(&t), None);
    }

    #[test]
    fn shared_release_of_private_slot_is_an_error() {
        let mut pool = pool(1, StxAllocatorKind::RoundRobin);
        let t = ThreadId::OsTid(2);
        let g = pool.allocate(true, t, 1).unwrap();
        assert!(g.private);
        assert!(matches!(
            pool.release(g.idx, false, None),
            Err(TransportError::InconsistentPrivateFlag(_))
        ));
    }

    #[test]
    fn random_allocator_only_picks_eligible_slots() {
        let mut pool = pool(4, StxAllocatorKind::Random);
        // Seed one shared binding so the shared search has a target.
        let first = pool.allocate(false, ThreadId::Synthetic(0), -1).unwrap();
        for _ in 0..16 {
            let g = pool.allocate(false, ThreadId::Synthetic(0), -1).unwrap();
            assert_eq!(g.idx, first.idx, "unbounded sharing reuses the loaded slot");
        }
    }

    #[test]
    fn invariants_hold_across_a_mixed_workload() {
        let mut pool = pool(3, StxAllocatorKind::RoundRobin);
        let mut grants = Vec::new();
        for i in 0..10u64 {
            let private = i % 3 == 0;
            let tid = ThreadId::OsTid(i % 4);
            grants.push((pool.allocate(private, tid, 2).unwrap(), tid));
        }
        assert_eq!(pool.ref_sum(), 10);
        for i in 0..pool.len() {
            if pool.is_private(i) {
                assert!(pool.ref_cnt(i) >= 1);
            }
            if pool.ref_cnt(i) == 0 {
                assert!(!pool.is_private(i));
            }
        }
        for (g, tid) in grants {
            pool.release(g.idx, g.private, Some(tid)).unwrap();
        }
        assert_eq!(pool.ref_sum(), 0);
        assert_eq!(pool.private_owner_count(), 0);
    }
}
