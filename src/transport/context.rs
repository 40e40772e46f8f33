//! Communication contexts.
//!
//! A context bundles one transmit endpoint with its put/get counters, a
//! completion queue, an optional bounce-buffer freelist and one STX slot.
//! The default context carries the sentinel id −1; every other context is
//! addressed by its slot in the registry.

use super::bounce::BouncePool;
use super::TransportError;
use crate::provider::{CompletionQueue, Counter, Endpoint};
use crate::tid::ThreadId;
use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

bitflags! {
    /// Context creation options. Unsupported combinations are silently
    /// downgraded: private falls back to shared when no exclusive STX is
    /// available, bounce buffering is stripped when the provider or the
    /// configuration cannot support it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtxOptions: u64 {
        /// Request an STX exclusive to the creating thread.
        const PRIVATE = 1 << 0;
        /// Stage small puts through transport-owned buffers.
        const BOUNCE_BUFFER = 1 << 1;
    }
}

/// Sentinel id of the default context.
pub const DEFAULT_CTX_ID: i64 = -1;

/// Registry slots are grown in fixed increments.
pub(crate) const CTX_GROW_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxState {
    /// Allocated, resources not yet attached.
    Nascent,
    /// Endpoint, counters, CQ and STX attached.
    Bound,
    /// Endpoint enabled; usable for RMA.
    Active,
    /// A quiesce is in flight.
    Draining,
    /// Resources released.
    Closed,
}

/// How completion waits burn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Poll up to the limit, then block on the counter.
    Poll(u64),
    /// Block immediately.
    Block,
    /// Poll forever, yielding the CPU between probes. Used with per-context
    /// locking so waiters release the core to the thread making progress.
    Yield,
}

pub struct Context {
    id: i64,
    options: CtxOptions,
    stx_idx: usize,
    tid: Option<ThreadId>,
    endpoint: Box<dyn Endpoint>,
    put_cntr: Box<dyn Counter>,
    get_cntr: Box<dyn Counter>,
    cq: Box<dyn CompletionQueue>,
    bounce: Option<Mutex<BouncePool>>,
    wait_put: WaitMode,
    wait_get: WaitMode,
    state: Mutex<CtxState>,
    /// Serializes user operations when per-context locking is enabled.
    lock: Option<Mutex<()>>,
    pending_put: AtomicU64,
    pending_get: AtomicU64,
    pending_bb: AtomicU64,
    completed_bb: AtomicU64,
}

pub(crate) struct ContextBuild {
    pub id: i64,
    pub options: CtxOptions,
    pub stx_idx: usize,
    pub tid: Option<ThreadId>,
    pub endpoint: Box<dyn Endpoint>,
    pub put_cntr: Box<dyn Counter>,
    pub get_cntr: Box<dyn Counter>,
    pub cq: Box<dyn CompletionQueue>,
    pub bounce: Option<BouncePool>,
    pub wait_put: WaitMode,
    pub wait_get: WaitMode,
    pub ctx_locking: bool,
}

impl Context {
    pub(crate) fn from_build(b: ContextBuild) -> Self {
        Context {
            id: b.id,
            options: b.options,
            stx_idx: b.stx_idx,
            tid: b.tid,
            endpoint: b.endpoint,
            put_cntr: b.put_cntr,
            get_cntr: b.get_cntr,
            cq: b.cq,
            bounce: b.bounce.map(Mutex::new),
            wait_put: b.wait_put,
            wait_get: b.wait_get,
            state: Mutex::new(CtxState::Nascent),
            lock: if b.ctx_locking { Some(Mutex::new(())) } else { None },
            pending_put: AtomicU64::new(0),
            pending_get: AtomicU64::new(0),
            pending_bb: AtomicU64::new(0),
            completed_bb: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn options(&self) -> CtxOptions {
        self.options
    }

    pub fn stx_idx(&self) -> usize {
        self.stx_idx
    }

    pub(crate) fn tid(&self) -> Option<ThreadId> {
        self.tid
    }

    pub fn state(&self) -> CtxState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, s: CtxState) {
        *self.state.lock().unwrap() = s;
    }

    pub fn has_bounce_buffers(&self) -> bool {
        self.bounce.is_some()
    }

    /// The transmit endpoint, for the RMA verb layer above.
    pub fn endpoint(&self) -> &dyn Endpoint {
        self.endpoint.as_ref()
    }

    pub fn put_counter(&self) -> &dyn Counter {
        self.put_cntr.as_ref()
    }

    pub fn get_counter(&self) -> &dyn Counter {
        self.get_cntr.as_ref()
    }

    pub fn completion_queue(&self) -> &dyn CompletionQueue {
        self.cq.as_ref()
    }

    /// Record issued non-fetching operations.
    pub fn note_pending_put(&self, n: u64) {
        self.pending_put.fetch_add(n, Ordering::Relaxed);
    }

    /// Record issued fetching operations.
    pub fn note_pending_get(&self, n: u64) {
        self.pending_get.fetch_add(n, Ordering::Relaxed);
    }

    pub fn pending_put(&self) -> u64 {
        self.pending_put.load(Ordering::Relaxed)
    }

    pub fn pending_get(&self) -> u64 {
        self.pending_get.load(Ordering::Relaxed)
    }

    pub fn pending_bounce(&self) -> u64 {
        self.pending_bb.load(Ordering::Relaxed)
    }

    pub fn completed_bounce(&self) -> u64 {
        self.completed_bb.load(Ordering::Relaxed)
    }

    /// Stage `data` into a bounce fragment and account it as injected.
    /// Returns the fragment's completion token, or `None` when bounce
    /// buffering is off or the freelist is exhausted.
    pub fn bounce_inject(&self, data: &[u8]) -> Option<u64> {
        let pool = self.bounce.as_ref()?;
        let mut pool = pool.lock().unwrap();
        if data.len() > pool.buffer_size() {
            return None;
        }
        let mut buf = pool.checkout()?;
        buf.payload_mut()[..data.len()].copy_from_slice(data);
        let token = pool.launch(buf);
        drop(pool);
        self.pending_bb.fetch_add(1, Ordering::Relaxed);
        self.note_pending_put(1);
        Some(token)
    }

    /// Wait until every operation issued on this context has completed:
    /// puts remotely, gets locally. No cross-context ordering is implied.
    pub fn quiet(&self) -> Result<(), TransportError> {
        let _serial = self.lock.as_ref().map(|l| l.lock().unwrap());

        {
            let mut st = self.state.lock().unwrap();
            if *st == CtxState::Closed {
                return Err(TransportError::InvalidContext(self.id));
            }
            *st = CtxState::Draining;
        }

        let result = self
            .drain_bounce()
            .and_then(|_| self.wait_counter(self.put_cntr.as_ref(), self.pending_put(), self.wait_put))
            .and_then(|_| self.wait_counter(self.get_cntr.as_ref(), self.pending_get(), self.wait_get));

        *self.state.lock().unwrap() = CtxState::Active;
        result
    }

    fn drain_bounce(&self) -> Result<(), TransportError> {
        let Some(pool) = self.bounce.as_ref() else {
            return Ok(());
        };
        while self.completed_bb.load(Ordering::Relaxed) < self.pending_bb.load(Ordering::Relaxed) {
            match self.cq.read_context()? {
                Some(token) => {
                    if pool.lock().unwrap().complete(token) {
                        self.completed_bb.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => std::thread::yield_now(),
            }
        }
        Ok(())
    }

    fn wait_counter(
        &self,
        cntr: &dyn Counter,
        target: u64,
        mode: WaitMode,
    ) -> Result<(), TransportError> {
        match mode {
            WaitMode::Block => {
                if cntr.read() < target {
                    cntr.wait(target)?;
                }
            }
            WaitMode::Poll(limit) => {
                let mut polls = 0u64;
                while cntr.read() < target {
                    polls += 1;
                    if polls > limit {
                        cntr.wait(target)?;
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
            WaitMode::Yield => {
                while cntr.read() < target {
                    std::thread::yield_now();
                }
            }
        }
        Ok(())
    }
}

/// Slot array of live contexts, reachable for the global quiesce at
/// teardown. The default context lives outside this vector.
pub(crate) struct CtxRegistry {
    slots: Vec<Option<Arc<Context>>>,
}

impl CtxRegistry {
    pub fn new() -> Self {
        CtxRegistry { slots: Vec::new() }
    }

    /// First open slot, growing the array when none is free.
    pub fn claim(&mut self) -> usize {
        if let Some(id) = self.slots.iter().position(Option::is_none) {
            return id;
        }
        let id = self.slots.len();
        self.slots.resize_with(self.slots.len() + CTX_GROW_SIZE, || None);
        id
    }

    pub fn insert(&mut self, id: usize, ctx: Arc<Context>) {
        self.slots[id] = Some(ctx);
    }

    pub fn take(&mut self, id: usize) -> Option<Arc<Context>> {
        self.slots.get_mut(id).and_then(Option::take)
    }

    pub fn live(&self) -> Vec<Arc<Context>> {
        self.slots.iter().flatten().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::loopback::{LoopbackConfig, LoopbackProvider};
    use crate::provider::{Caps, CounterWait, EndpointKind, FabricHints, Provider, Threading};

    fn build_ctx(bounce: Option<BouncePool>, wait: WaitMode) -> Context {
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
        Context::from_build(ContextBuild {
            id: 0,
            options: CtxOptions::empty(),
            stx_idx: 0,
            tid: None,
            endpoint: domain.open_endpoint(EndpointKind::Transmit).unwrap(),
            put_cntr: domain.open_counter(CounterWait::Unspec).unwrap(),
            get_cntr: domain.open_counter(CounterWait::Unspec).unwrap(),
            cq: domain.open_cq().unwrap(),
            bounce,
            wait_put: wait,
            wait_get: wait,
            ctx_locking: false,
        })
    }

    #[test]
    fn quiet_with_nothing_pending_is_a_noop() {
        let ctx = build_ctx(None, WaitMode::Poll(10));
        ctx.quiet().unwrap();
        ctx.quiet().unwrap();
        assert_eq!(ctx.state(), CtxState::Active);
    }

    #[test]
    fn quiet_waits_for_put_completions() {
        let ctx = Arc::new(build_ctx(None, WaitMode::Poll(4)));
        ctx.note_pending_put(2);

        let waiter = Arc::clone(&ctx);
        let handle = std::thread::spawn(move || waiter.quiet());
        ctx.put_counter().add(1);
        ctx.put_counter().add(1);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn quiet_drains_bounce_fragments_back_to_the_freelist() {
        let ctx = build_ctx(Some(BouncePool::new(64, 4)), WaitMode::Yield);
        let t1 = ctx.bounce_inject(b"hello").unwrap();
        let t2 = ctx.bounce_inject(b"world").unwrap();
        assert_eq!(ctx.pending_bounce(), 2);

        // Simulate provider completions: tokens come back through the CQ and
        // the put counter advances.
        ctx.completion_queue().push_context(t1);
        ctx.completion_queue().push_context(t2);
        ctx.put_counter().add(2);

        ctx.quiet().unwrap();
        assert_eq!(ctx.completed_bounce(), 2);
        // Fragments are reusable afterwards.
        assert!(ctx.bounce_inject(b"again").is_some());
    }

    #[test]
    fn oversized_bounce_payload_is_rejected() {
        let ctx = build_ctx(Some(BouncePool::new(4, 1)), WaitMode::Poll(1));
        assert!(ctx.bounce_inject(b"too large for four").is_none());
        assert_eq!(ctx.pending_bounce(), 0);
    }

    #[test]
    fn registry_grows_in_fixed_increments() {
        let mut reg = CtxRegistry::new();
        let id = reg.claim();
        assert_eq!(id, 0);
        reg.insert(id, Arc::new(build_ctx(None, WaitMode::Block)));
        assert_eq!(reg.live_count(), 1);
        let next = reg.claim();
        assert_eq!(next, 1);
        assert!(reg.take(0).is_some());
        assert_eq!(reg.live_count(), 0);
        // Slot 0 is reusable after release.
        assert_eq!(reg.claim(), 0);
    }
}
