//! One-sided transport core.
//!
//! Owns the provider resources for one PE: fabric, domain, address vector,
//! the target endpoint with its memory regions, the STX pool, and every
//! communication context. All of it lives in one [`TransportState`] value
//! so isolated instances can coexist (tests run several PEs in-process)
//! and teardown order is the field declaration order.

pub mod atomics;
pub mod bounce;
pub mod context;
pub mod fabric;
pub mod stx;

pub use atomics::{atomic_limitations_check, AtomicSupport};
pub use bounce::{BounceBuffer, BouncePool, FRAG_BOUNCE};
pub use context::{Context, CtxOptions, CtxState, WaitMode, DEFAULT_CTX_ID};
pub use fabric::{RemoteAccessTable, DATA_KEY_SCALABLE, HEAP_KEY_SCALABLE, MIN_INJECT_SIZE};
pub use stx::{StxGrant, StxPool, StxSlot};

use crate::config::{Params, Setting, ThreadLevel};
use crate::provider::{
    AddressVector, AmoDt, AmoOp, CntrEvents, CounterWait, DomainHandle, EndpointKind, FabricDesc,
    FabricHandle, MrMode, Provider, ProviderError, ProviderMode,
};
use crate::runtime::{KvsError, RuntimeKvs};
use crate::tid::{self, ThreadId};
use context::{ContextBuild, CtxRegistry};
use fabric::TargetResources;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no valid fabric (provider={provider:?}, fabric={fabric:?}, domain={domain:?})")]
    NoMatchingFabric {
        provider: Option<String>,
        fabric: Option<String>,
        domain: Option<String>,
    },
    #[error("invalid selection pattern '{0}'")]
    BadPattern(String),
    #[error("provider did not report a maximum message size")]
    NoMaxMsgSize,
    #[error("address vector insertion short count: {inserted} of {expected}")]
    AvShortCount { inserted: usize, expected: usize },
    #[error("provider does not support atomic '{op}' on type '{dt}'")]
    AtomicUnsupported { dt: AmoDt, op: AmoOp },
    #[error("transmit resources exhausted")]
    StxExhausted,
    #[error("STX node max must be greater than zero")]
    BadStxNodeMax,
    #[error("context {0} destroyed with an inconsistent private flag")]
    InconsistentPrivateFlag(i64),
    #[error("invalid context ({0})")]
    InvalidContext(i64),
    #[error("transport not started")]
    NotStarted,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Kvs(#[from] KvsError),
}

/// Symmetric segment placement, supplied by the memory layer above.
#[derive(Debug, Clone, Copy)]
pub struct MemoryLayout {
    pub heap_base: u64,
    pub heap_len: u64,
    pub data_base: u64,
    pub data_len: u64,
}

/// Settings resolved at init from `Params` plus provider properties.
#[derive(Debug, Clone, Copy)]
struct Resolved {
    stx_max: usize,
    stx_threshold: i64,
    bounce_size: usize,
    max_bounce_buffers: usize,
    wait_put: WaitMode,
    wait_get: WaitMode,
    addrlen: usize,
}

/// State guarded by the process-wide transport lock: the STX pool, its
/// thread-owner map, and the context registry.
struct Locked {
    registry: CtxRegistry,
    stx: Option<StxPool>,
}

pub struct TransportState {
    // Field order is teardown order: contexts and STX slots close before
    // the target endpoint, which closes before the MRs, AV, domain and
    // fabric.
    locked: Mutex<Locked>,
    default_ctx: Mutex<Option<Arc<Context>>>,
    target: TargetResources,
    mr_table: RemoteAccessTable,
    av: Box<dyn AddressVector>,
    domain: Box<dyn DomainHandle>,
    #[allow(dead_code)]
    fabric: Box<dyn FabricHandle>,
    desc: FabricDesc,
    kvs: Arc<dyn RuntimeKvs>,
    params: Params,
    thread_level: ThreadLevel,
    layout: MemoryLayout,
    resolved: Resolved,
    my_pe: usize,
    n_pes: usize,
    started: bool,
    finalized: bool,
}

fn resolve_wait(limit: Setting<i64>, ctx_locking: bool, level: ThreadLevel) -> WaitMode {
    // Per-context locking in multithreaded mode forces waiters to poll and
    // yield, so the thread making progress can take the lock. An explicit
    // user limit still wins.
    if ctx_locking && level == ThreadLevel::Multiple && !limit.provided {
        return WaitMode::Yield;
    }
    if limit.value < 0 {
        WaitMode::Block
    } else {
        WaitMode::Poll(limit.value as u64)
    }
}

fn counter_wait_for(mode: WaitMode) -> CounterWait {
    match mode {
        WaitMode::Yield => CounterWait::None,
        _ => CounterWait::Unspec,
    }
}

impl TransportState {
    /// Bring up the fabric: select a provider offering, open the domain and
    /// address vector, resolve STX/bounce/poll settings, create the target
    /// endpoint with its memory regions, and publish MR and addressing
    /// metadata. The KVS barrier and table population happen in
    /// [`TransportState::startup`].
    pub fn init(
        provider: Arc<dyn Provider>,
        kvs: Arc<dyn RuntimeKvs>,
        params: Params,
        thread_level: ThreadLevel,
        layout: MemoryLayout,
    ) -> Result<Self, TransportError> {
        let my_pe = kvs.rank();
        let n_pes = kvs.size();

        let desc = fabric::query_for_fabric(provider.as_ref(), &params, thread_level)?;

        let fabric_h = provider.open_fabric(&desc)?;
        let domain = fabric_h.open_domain(&desc)?;
        let av = domain.open_av()?;

        // One STX suffices when only one thread may transmit.
        let stx_max = if matches!(thread_level, ThreadLevel::Single | ThreadLevel::Funneled)
            && params.stx_max.value > 1
        {
            if params.stx_max.provided {
                warn!(
                    pe = my_pe,
                    requested = params.stx_max.value,
                    "ignoring invalid STX max setting; using 1 STX in single-threaded mode"
                );
            }
            1
        } else {
            params.stx_max.value.max(1)
        };

        // Bounce buffering recovers fragments through the completion event
        // context, which providers requiring caller-owned per-op contexts
        // cannot deliver.
        let (bounce_size, max_bounce_buffers) = if desc.mode.contains(ProviderMode::OP_CONTEXT) {
            if my_pe == 0 && params.bounce_size > 0 {
                debug!("provider requires per-op contexts; disabling bounce buffering");
            }
            (0, 0)
        } else {
            (params.bounce_size, params.max_bounce_buffers)
        };

        let resolved = Resolved {
            stx_max,
            stx_threshold: params.stx_threshold,
            bounce_size,
            max_bounce_buffers,
            wait_put: resolve_wait(params.tx_poll_limit, params.ctx_locking, thread_level),
            wait_get: resolve_wait(params.rx_poll_limit, params.ctx_locking, thread_level),
            addrlen: 0,
        };

        let target = fabric::target_ep_init(domain.as_ref(), av.as_ref(), &desc, &layout)?;

        fabric::publish_mr_info(kvs.as_ref(), &desc, &target.mrs, &layout)?;
        let addrlen = fabric::publish_av_info(kvs.as_ref(), target.ep.as_ref())?;

        Ok(TransportState {
            locked: Mutex::new(Locked { registry: CtxRegistry::new(), stx: None }),
            default_ctx: Mutex::new(None),
            target,
            mr_table: RemoteAccessTable::default(),
            av,
            domain,
            fabric: fabric_h,
            desc,
            kvs,
            params,
            thread_level,
            layout,
            resolved: Resolved { addrlen, ..resolved },
            my_pe,
            n_pes,
            started: false,
            finalized: false,
        })
    }

    /// Complete bring-up after every PE has published: barrier, size and
    /// allocate the STX pool, create the default context, validate provider
    /// atomics, and populate the MR and address tables.
    pub fn startup(&mut self) -> Result<(), TransportError> {
        self.kvs.barrier()?;

        if self.params.stx_auto {
            let tx_ctx_cnt = match self.params.stx_node_max {
                Some(0) => return Err(TransportError::BadStxNodeMax),
                Some(n) => n,
                None => self.desc.tx_ctx_cnt,
            };
            let num_on_node = self.kvs.local_size().max(1);

            // Partition transmit resources evenly across node-local PEs,
            // remainder to the lower local ranks.
            let mut stx_max = tx_ctx_cnt / num_on_node;
            let remainder = tx_ctx_cnt % num_on_node;
            let node_pe = self.my_pe % num_on_node;
            if node_pe < remainder {
                stx_max += 1;
            }
            if stx_max == 0 {
                stx_max = 1;
                warn!(
                    pe = self.my_pe,
                    available = tx_ctx_cnt,
                    pes_on_node = num_on_node,
                    "need at least 1 STX per PE"
                );
            }
            debug!(pe = self.my_pe, stx_max, "auto-set STX max");
            self.resolved.stx_max = stx_max;
        }

        let mut handles = Vec::with_capacity(self.resolved.stx_max);
        for _ in 0..self.resolved.stx_max {
            handles.push(self.domain.alloc_stx()?);
        }
        {
            let mut locked = self.locked.lock().unwrap();
            locked.stx = Some(StxPool::new(handles, self.params.stx_allocator, self.my_pe));
        }

        // The default context always asks for bounce buffering; feasibility
        // stripping applies like everywhere else.
        let default = {
            let mut locked = self.locked.lock().unwrap();
            let stx = locked.stx.as_mut().ok_or(TransportError::NotStarted)?;
            self.ctx_build(DEFAULT_CTX_ID, CtxOptions::BOUNCE_BUFFER, stx)?
        };
        *self.default_ctx.lock().unwrap() = Some(Arc::clone(&default));

        atomic_limitations_check(default.endpoint(), self.params.atomic_checks_warn)?;

        self.mr_table = fabric::populate_mr_tables(self.kvs.as_ref(), &self.desc)?;
        fabric::populate_av(self.kvs.as_ref(), self.av.as_ref(), self.resolved.addrlen)?;

        self.started = true;
        Ok(())
    }

    fn ctx_build(
        &self,
        id: i64,
        mut options: CtxOptions,
        stx: &mut StxPool,
    ) -> Result<Arc<Context>, TransportError> {
        let put_cntr = self.domain.open_counter(counter_wait_for(self.resolved.wait_put))?;
        let get_cntr = self.domain.open_counter(counter_wait_for(self.resolved.wait_get))?;
        let cq = self.domain.open_cq()?;
        let endpoint = self.domain.open_endpoint(EndpointKind::Transmit)?;

        let request_private =
            !self.params.stx_disable_private && options.contains(CtxOptions::PRIVATE);
        let tid = if request_private {
            if self.thread_level > ThreadLevel::Funneled {
                Some(tid::current(self.params.tid_source))
            } else {
                // Below serialized there is effectively one thread.
                Some(ThreadId::Synthetic(0))
            }
        } else {
            None
        };

        let grant = stx.allocate(
            request_private,
            tid.unwrap_or(ThreadId::Synthetic(0)),
            self.resolved.stx_threshold,
        )?;
        if request_private && !grant.private {
            options.remove(CtxOptions::PRIVATE);
        }

        let bounce = if options.contains(CtxOptions::BOUNCE_BUFFER)
            && self.resolved.bounce_size > 0
            && self.resolved.max_bounce_buffers > 0
        {
            Some(BouncePool::new(self.resolved.bounce_size, self.resolved.max_bounce_buffers))
        } else {
            options.remove(CtxOptions::BOUNCE_BUFFER);
            None
        };

        let ctx = Arc::new(Context::from_build(ContextBuild {
            id,
            options,
            stx_idx: grant.idx,
            tid,
            endpoint,
            put_cntr,
            get_cntr,
            cq,
            bounce,
            wait_put: self.resolved.wait_put,
            wait_get: self.resolved.wait_get,
            ctx_locking: self.params.ctx_locking,
        }));

        if let Err(e) = ctx.bind_and_enable(stx.handle(grant.idx), self.av.as_ref()) {
            // Creation failure releases everything acquired so far; the
            // context itself drops with its handles.
            let _ = stx.release(grant.idx, grant.private, tid);
            return Err(e.into());
        }

        Ok(ctx)
    }

    /// Create a user context. Draws one STX reference under the allocator
    /// policy; unsupported option combinations downgrade silently.
    pub fn ctx_create(&self, options: CtxOptions) -> Result<Arc<Context>, TransportError> {
        let mut locked = self.locked.lock().unwrap();
        let locked = &mut *locked;
        let stx = locked.stx.as_mut().ok_or(TransportError::NotStarted)?;

        let id = locked.registry.claim();
        let ctx = self.ctx_build(id as i64, options, stx)?;
        locked.registry.insert(id, Arc::clone(&ctx));
        Ok(ctx)
    }

    /// Destroy a context, releasing its STX reference. Destroying the
    /// default context is legal exactly once.
    pub fn ctx_destroy(&self, ctx: Arc<Context>) -> Result<(), TransportError> {
        if self.params.debug {
            debug!(
                pe = self.my_pe,
                id = ctx.id(),
                options = ?ctx.options(),
                stx_idx = ctx.stx_idx(),
                pending_put = ctx.pending_put(),
                completed_put = ctx.put_counter().read(),
                pending_get = ctx.pending_get(),
                completed_get = ctx.get_counter().read(),
                pending_bb = ctx.pending_bounce(),
                completed_bb = ctx.completed_bounce(),
                "destroying context"
            );
        }

        let id = ctx.id();
        if id >= 0 {
            let mut locked = self.locked.lock().unwrap();
            let taken = locked.registry.take(id as usize);
            if taken.is_none() {
                return Err(TransportError::InvalidContext(id));
            }
            self.release_ctx_stx(&mut locked, &ctx)?;
        } else if id == DEFAULT_CTX_ID {
            let taken = self.default_ctx.lock().unwrap().take();
            if taken.is_none() {
                return Err(TransportError::InvalidContext(id));
            }
            let mut locked = self.locked.lock().unwrap();
            self.release_ctx_stx(&mut locked, &ctx)?;
        } else {
            return Err(TransportError::InvalidContext(id));
        }

        ctx.set_state(CtxState::Closed);
        Ok(())
    }

    fn release_ctx_stx(&self, locked: &mut Locked, ctx: &Context) -> Result<(), TransportError> {
        let stx = locked.stx.as_mut().ok_or(TransportError::NotStarted)?;
        let private =
            !self.params.stx_disable_private && ctx.options().contains(CtxOptions::PRIVATE);
        stx.release(ctx.stx_idx(), private, ctx.tid())
    }

    /// Quiesce every context and release all transport resources. Handle
    /// closure completes when the state drops; this performs the ordered
    /// shutdown and the leak diagnostics.
    pub fn fini(&mut self) -> Result<(), TransportError> {
        if self.finalized {
            return Ok(());
        }

        // Quiet and destroy all shareable contexts, ensuring outstanding
        // operations complete before shutdown.
        let live = self.locked.lock().unwrap().registry.live();
        for ctx in live {
            if ctx.options().contains(CtxOptions::PRIVATE) {
                warn!(pe = self.my_pe, id = ctx.id(), "shutting down with unfreed private context");
            }
            ctx.quiet()?;
            self.ctx_destroy(ctx)?;
        }

        let default = self.default_ctx.lock().unwrap().take();
        if let Some(ctx) = default {
            ctx.quiet()?;
            let mut locked = self.locked.lock().unwrap();
            self.release_ctx_stx(&mut locked, &ctx)?;
            ctx.set_state(CtxState::Closed);
        }

        {
            let mut locked = self.locked.lock().unwrap();
            if let Some(stx) = locked.stx.as_mut() {
                let leaked = stx.drain_private_owners();
                if leaked > 0 {
                    warn!(
                        pe = self.my_pe,
                        leaked, "thread map contained unfreed private context owners"
                    );
                }
                for i in 0..stx.len() {
                    if stx.ref_cnt(i) != 0 {
                        warn!(
                            pe = self.my_pe,
                            slot = i,
                            ref_cnt = stx.ref_cnt(i),
                            private = stx.is_private(i),
                            "closing an STX with nonzero ref count"
                        );
                    }
                }
            }
            locked.stx = None;
        }

        self.finalized = true;
        Ok(())
    }

    // --- introspection -----------------------------------------------------

    pub fn my_pe(&self) -> usize {
        self.my_pe
    }

    pub fn n_pes(&self) -> usize {
        self.n_pes
    }

    pub fn desc(&self) -> &FabricDesc {
        &self.desc
    }

    pub fn layout(&self) -> MemoryLayout {
        self.layout
    }

    pub fn thread_level(&self) -> ThreadLevel {
        self.thread_level
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Resolved STX pool size (after single-thread forcing and auto sizing).
    pub fn stx_max(&self) -> usize {
        self.resolved.stx_max
    }

    pub fn bounce_buffering_enabled(&self) -> bool {
        self.resolved.bounce_size > 0 && self.resolved.max_bounce_buffers > 0
    }

    /// Counter of incoming remote writes on this PE, when the provider
    /// offers remote RMA events. Wait-style operations above the transport
    /// poll it.
    pub fn target_counter(&self) -> Option<&dyn crate::provider::Counter> {
        self.target.cntr.as_deref()
    }

    pub fn default_ctx(&self) -> Option<Arc<Context>> {
        self.default_ctx.lock().unwrap().clone()
    }

    pub fn live_ctx_count(&self) -> usize {
        let registered = self.locked.lock().unwrap().registry.live_count();
        registered + usize::from(self.default_ctx.lock().unwrap().is_some())
    }

    /// Sum of STX reference counts; equals the number of live context
    /// bindings.
    pub fn stx_ref_sum(&self) -> u64 {
        let locked = self.locked.lock().unwrap();
        locked.stx.as_ref().map(|s| s.ref_sum()).unwrap_or(0)
    }

    /// Per-slot `(ref_cnt, is_private)` snapshot.
    pub fn stx_snapshot(&self) -> Vec<(u64, bool)> {
        let locked = self.locked.lock().unwrap();
        match locked.stx.as_ref() {
            Some(stx) => (0..stx.len()).map(|i| (stx.ref_cnt(i), stx.is_private(i))).collect(),
            None => Vec::new(),
        }
    }

    /// Remote key for `pe`'s heap segment, if key exchange applies.
    pub fn remote_heap_key(&self, pe: usize) -> Option<u64> {
        match (self.desc.mr_mode, self.desc.remote_va) {
            (MrMode::Scalable, true) => None,
            (MrMode::Scalable, false) => Some(HEAP_KEY_SCALABLE),
            (MrMode::Basic, _) => self.mr_table.heap_keys.as_ref().map(|k| k[pe]),
        }
    }

    /// Remote key for `pe`'s data segment, if key exchange applies.
    pub fn remote_data_key(&self, pe: usize) -> Option<u64> {
        match (self.desc.mr_mode, self.desc.remote_va) {
            (MrMode::Scalable, true) => None,
            (MrMode::Scalable, false) => Some(DATA_KEY_SCALABLE),
            (MrMode::Basic, _) => self.mr_table.data_keys.as_ref().map(|k| k[pe]),
        }
    }

    /// Remote base address of `pe`'s heap segment, when address exchange
    /// applies (basic mode without remote virtual addressing).
    pub fn remote_heap_addr(&self, pe: usize) -> Option<u64> {
        self.mr_table.heap_addrs.as_ref().map(|a| a[pe])
    }

    pub fn remote_data_addr(&self, pe: usize) -> Option<u64> {
        self.mr_table.data_addrs.as_ref().map(|a| a[pe])
    }
}

impl Drop for TransportState {
    fn drop(&mut self) {
        if !self.finalized {
            let _ = self.fini();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setting(value: i64, provided: bool) -> Setting<i64> {
        Setting { value, provided }
    }

    #[test]
    fn negative_poll_limit_blocks_immediately() {
        assert_eq!(
            resolve_wait(setting(-1, true), false, ThreadLevel::Single),
            WaitMode::Block
        );
    }

    #[test]
    fn nonnegative_poll_limit_polls_then_blocks() {
        assert_eq!(
            resolve_wait(setting(1000, false), false, ThreadLevel::Multiple),
            WaitMode::Poll(1000)
        );
    }

    #[test]
    fn ctx_locking_forces_yield_unless_user_chose() {
        assert_eq!(
            resolve_wait(setting(0, false), true, ThreadLevel::Multiple),
            WaitMode::Yield
        );
        // An explicit limit wins over the forcing.
        assert_eq!(
            resolve_wait(setting(64, true), true, ThreadLevel::Multiple),
            WaitMode::Poll(64)
        );
        // Below multiple there is no lock contention to yield for.
        assert_eq!(
            resolve_wait(setting(0, false), true, ThreadLevel::Serialized),
            WaitMode::Poll(0)
        );
    }

    #[test]
    fn yield_mode_needs_no_wait_object() {
        assert_eq!(counter_wait_for(WaitMode::Yield), CounterWait::None);
        assert_eq!(counter_wait_for(WaitMode::Block), CounterWait::Unspec);
        assert_eq!(counter_wait_for(WaitMode::Poll(3)), CounterWait::Unspec);
    }
}

// Contexts bind and enable through methods on Context so the state machine
// transitions stay next to the resources they describe.
impl Context {
    pub(crate) fn bind_and_enable(
        &self,
        stx: &dyn crate::provider::SharedTx,
        av: &dyn AddressVector,
    ) -> Result<(), ProviderError> {
        self.endpoint().bind_stx(stx)?;
        // Put counter captures completions for non-fetching operations,
        // get counter for fetching ones.
        self.endpoint().bind_counter(self.put_counter(), CntrEvents::Write)?;
        self.endpoint().bind_counter(self.get_counter(), CntrEvents::Read)?;
        // Bounce-buffered puts additionally generate a CQ event used to
        // reclaim the fragment.
        self.endpoint().bind_cq(self.completion_queue(), true)?;
        self.endpoint().bind_av(av)?;
        self.set_state(CtxState::Bound);
        self.endpoint().enable()?;
        self.set_state(CtxState::Active);
        Ok(())
    }
}
