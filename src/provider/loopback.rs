//! In-process provider.
//!
//! Backs the demo binary and the integration tests: counters, completion
//! queues and registrations are real, RMA data movement is not. Quirks that
//! change transport behavior (per-op context requirement, MR mode, remote
//! virtual addressing, denied atomics, short address insertion) are all
//! configurable so boundary paths can be driven deliberately.

use super::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub provider_name: String,
    pub fabric_name: String,
    pub domain_name: String,
    pub mr_mode: MrMode,
    pub remote_va: bool,
    /// Advertise `ProviderMode::OP_CONTEXT`, which disables bounce buffering.
    pub require_op_context: bool,
    pub mr_rma_event: bool,
    pub tx_ctx_cnt: usize,
    pub max_msg_size: usize,
    pub inject_size: usize,
    /// (datatype, op) pairs reported as unsupported by every validity query.
    pub denied_atomics: Vec<(AmoDt, AmoOp)>,
    /// Pretend this many addresses failed to insert into the AV.
    pub av_insert_drop: usize,
    /// Additional (fabric, domain) name pairs offered after the primary one.
    pub extra_fabrics: Vec<(String, String)>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        LoopbackConfig {
            provider_name: "loopback".into(),
            fabric_name: "loop0".into(),
            domain_name: "loop0-dom".into(),
            mr_mode: MrMode::Basic,
            remote_va: false,
            require_op_context: false,
            mr_rma_event: true,
            tx_ctx_cnt: 16,
            max_msg_size: 1 << 30,
            inject_size: 512,
            denied_atomics: Vec::new(),
            av_insert_drop: 0,
            extra_fabrics: Vec::new(),
        }
    }
}

/// Live-handle counts, decremented on drop. Lets tests assert that teardown
/// released everything.
#[derive(Debug, Default)]
pub struct HandleLedger {
    pub fabrics: AtomicI64,
    pub domains: AtomicI64,
    pub endpoints: AtomicI64,
    pub counters: AtomicI64,
    pub cqs: AtomicI64,
    pub mrs: AtomicI64,
    pub stxs: AtomicI64,
    pub avs: AtomicI64,
}

impl HandleLedger {
    pub fn total(&self) -> i64 {
        self.fabrics.load(Ordering::SeqCst)
            + self.domains.load(Ordering::SeqCst)
            + self.endpoints.load(Ordering::SeqCst)
            + self.counters.load(Ordering::SeqCst)
            + self.cqs.load(Ordering::SeqCst)
            + self.mrs.load(Ordering::SeqCst)
            + self.stxs.load(Ordering::SeqCst)
            + self.avs.load(Ordering::SeqCst)
    }
}

struct Shared {
    cfg: LoopbackConfig,
    ledger: Arc<HandleLedger>,
    next_serial: AtomicU64,
    next_mr_key: AtomicU64,
}

pub struct LoopbackProvider {
    shared: Arc<Shared>,
}

impl LoopbackProvider {
    pub fn new(cfg: LoopbackConfig) -> Self {
        LoopbackProvider {
            shared: Arc::new(Shared {
                cfg,
                ledger: Arc::new(HandleLedger::default()),
                next_serial: AtomicU64::new(1),
                // Provider-assigned keys start away from the static 0/1 pair
                // used in scalable mode.
                next_mr_key: AtomicU64::new(0x1000),
            }),
        }
    }

    pub fn ledger(&self) -> Arc<HandleLedger> {
        Arc::clone(&self.shared.ledger)
    }

    fn desc_with_names(&self, fabric: &str, domain: &str) -> FabricDesc {
        let cfg = &self.shared.cfg;
        let mut mode = ProviderMode::empty();
        if cfg.require_op_context {
            mode |= ProviderMode::OP_CONTEXT;
        }
        FabricDesc {
            provider_name: cfg.provider_name.clone(),
            fabric_name: fabric.into(),
            domain_name: domain.into(),
            caps: Caps::RMA
                | Caps::ATOMICS
                | Caps::READ
                | Caps::WRITE
                | Caps::REMOTE_READ
                | Caps::REMOTE_WRITE
                | if cfg.mr_rma_event { Caps::RMA_EVENT } else { Caps::empty() },
            mode,
            mr_mode: cfg.mr_mode,
            remote_va: cfg.remote_va,
            max_msg_size: cfg.max_msg_size,
            inject_size: cfg.inject_size,
            tx_ctx_cnt: cfg.tx_ctx_cnt,
            mr_rma_event: cfg.mr_rma_event,
        }
    }
}

impl Provider for LoopbackProvider {
    fn discover(&self, hints: &FabricHints) -> Result<Vec<FabricDesc>, ProviderError> {
        let cfg = &self.shared.cfg;
        if hints.inject_size > cfg.inject_size {
            return Err(ProviderError::NoFabric);
        }
        let mut out = vec![self.desc_with_names(&cfg.fabric_name, &cfg.domain_name)];
        for (f, d) in &cfg.extra_fabrics {
            out.push(self.desc_with_names(f, d));
        }
        Ok(out)
    }

    fn open_fabric(&self, _desc: &FabricDesc) -> Result<Box<dyn FabricHandle>, ProviderError> {
        self.shared.ledger.fabrics.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackFabric { shared: Arc::clone(&self.shared) }))
    }
}

struct LoopbackFabric {
    shared: Arc<Shared>,
}

impl FabricHandle for LoopbackFabric {
    fn open_domain(&self, _desc: &FabricDesc) -> Result<Box<dyn DomainHandle>, ProviderError> {
        self.shared.ledger.domains.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackDomain { shared: Arc::clone(&self.shared) }))
    }
}

impl Drop for LoopbackFabric {
    fn drop(&mut self) {
        self.shared.ledger.fabrics.fetch_sub(1, Ordering::SeqCst);
    }
}

struct LoopbackDomain {
    shared: Arc<Shared>,
}

impl DomainHandle for LoopbackDomain {
    fn open_av(&self) -> Result<Box<dyn AddressVector>, ProviderError> {
        self.shared.ledger.avs.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackAv { shared: Arc::clone(&self.shared) }))
    }

    fn open_counter(&self, _wait: CounterWait) -> Result<Box<dyn Counter>, ProviderError> {
        self.shared.ledger.counters.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackCounter {
            shared: Arc::clone(&self.shared),
            value: Mutex::new(0),
            bumped: Condvar::new(),
        }))
    }

    fn open_cq(&self) -> Result<Box<dyn CompletionQueue>, ProviderError> {
        self.shared.ledger.cqs.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackCq {
            shared: Arc::clone(&self.shared),
            events: Mutex::new(VecDeque::new()),
        }))
    }

    fn open_endpoint(&self, kind: EndpointKind) -> Result<Box<dyn Endpoint>, ProviderError> {
        self.shared.ledger.endpoints.fetch_add(1, Ordering::SeqCst);
        let serial = self.shared.next_serial.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackEndpoint {
            shared: Arc::clone(&self.shared),
            kind,
            serial,
            enabled: AtomicBool::new(false),
            stx_bound: AtomicBool::new(false),
            av_bound: AtomicBool::new(false),
        }))
    }

    fn register_mr(
        &self,
        _base: u64,
        len: u64,
        _access: Caps,
        requested_key: u64,
        rma_event: bool,
    ) -> Result<Box<dyn MemoryRegion>, ProviderError> {
        if len == 0 {
            return Err(ProviderError::BadState("zero-length registration"));
        }
        if rma_event && !self.shared.cfg.mr_rma_event {
            return Err(ProviderError::Unsupported("MR RMA events"));
        }
        let key = match self.shared.cfg.mr_mode {
            MrMode::Scalable => requested_key,
            MrMode::Basic => self.shared.next_mr_key.fetch_add(1, Ordering::SeqCst),
        };
        self.shared.ledger.mrs.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackMr {
            shared: Arc::clone(&self.shared),
            key,
            enabled: AtomicBool::new(false),
        }))
    }

    fn alloc_stx(&self) -> Result<Box<dyn SharedTx>, ProviderError> {
        self.shared.ledger.stxs.fetch_add(1, Ordering::SeqCst);
        let serial = self.shared.next_serial.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackStx { shared: Arc::clone(&self.shared), serial }))
    }
}

impl Drop for LoopbackDomain {
    fn drop(&mut self) {
        self.shared.ledger.domains.fetch_sub(1, Ordering::SeqCst);
    }
}

struct LoopbackEndpoint {
    shared: Arc<Shared>,
    kind: EndpointKind,
    serial: u64,
    enabled: AtomicBool,
    stx_bound: AtomicBool,
    av_bound: AtomicBool,
}

impl LoopbackEndpoint {
    fn validity(&self, dt: AmoDt, op: AmoOp) -> Result<usize, ProviderError> {
        if self.shared.cfg.denied_atomics.iter().any(|&(d, o)| d == dt && o == op) {
            Ok(0)
        } else {
            Ok(self.shared.cfg.max_msg_size / 8)
        }
    }
}

impl Endpoint for LoopbackEndpoint {
    fn bind_stx(&self, _stx: &dyn SharedTx) -> Result<(), ProviderError> {
        if self.kind != EndpointKind::Transmit {
            return Err(ProviderError::BadState("STX bind on target endpoint"));
        }
        if self.enabled.load(Ordering::SeqCst) {
            return Err(ProviderError::BadState("bind after enable"));
        }
        self.stx_bound.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn bind_counter(&self, _cntr: &dyn Counter, _events: CntrEvents) -> Result<(), ProviderError> {
        Ok(())
    }

    fn bind_cq(&self, _cq: &dyn CompletionQueue, _selective: bool) -> Result<(), ProviderError> {
        Ok(())
    }

    fn bind_av(&self, _av: &dyn AddressVector) -> Result<(), ProviderError> {
        self.av_bound.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn enable(&self) -> Result<(), ProviderError> {
        if !self.av_bound.load(Ordering::SeqCst) {
            return Err(ProviderError::BadState("enable before AV bind"));
        }
        if self.kind == EndpointKind::Transmit && !self.stx_bound.load(Ordering::SeqCst) {
            return Err(ProviderError::BadState("enable before STX bind"));
        }
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> Result<Vec<u8>, ProviderError> {
        let mut name = b"lb-ep-".to_vec();
        name.extend_from_slice(&self.serial.to_le_bytes());
        Ok(name)
    }

    fn atomic_valid(&self, dt: AmoDt, op: AmoOp) -> Result<usize, ProviderError> {
        self.validity(dt, op)
    }

    fn fetch_atomic_valid(&self, dt: AmoDt, op: AmoOp) -> Result<usize, ProviderError> {
        self.validity(dt, op)
    }

    fn compare_atomic_valid(&self, dt: AmoDt, op: AmoOp) -> Result<usize, ProviderError> {
        self.validity(dt, op)
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        self.shared.ledger.endpoints.fetch_sub(1, Ordering::SeqCst);
    }
}

struct LoopbackCounter {
    shared: Arc<Shared>,
    value: Mutex<u64>,
    bumped: Condvar,
}

impl Counter for LoopbackCounter {
    fn read(&self) -> u64 {
        *self.value.lock().unwrap()
    }

    fn add(&self, delta: u64) {
        let mut v = self.value.lock().unwrap();
        *v += delta;
        self.bumped.notify_all();
    }

    fn wait(&self, threshold: u64) -> Result<(), ProviderError> {
        let mut v = self.value.lock().unwrap();
        while *v < threshold {
            v = self.bumped.wait(v).map_err(|_| {
                ProviderError::Internal("counter wait poisoned".into())
            })?;
        }
        Ok(())
    }
}

impl Drop for LoopbackCounter {
    fn drop(&mut self) {
        self.shared.ledger.counters.fetch_sub(1, Ordering::SeqCst);
    }
}

struct LoopbackCq {
    shared: Arc<Shared>,
    events: Mutex<VecDeque<u64>>,
}

impl CompletionQueue for LoopbackCq {
    fn read_context(&self) -> Result<Option<u64>, ProviderError> {
        Ok(self.events.lock().unwrap().pop_front())
    }

    fn push_context(&self, token: u64) {
        self.events.lock().unwrap().push_back(token);
    }
}

impl Drop for LoopbackCq {
    fn drop(&mut self) {
        self.shared.ledger.cqs.fetch_sub(1, Ordering::SeqCst);
    }
}

struct LoopbackMr {
    shared: Arc<Shared>,
    key: u64,
    enabled: AtomicBool,
}

impl MemoryRegion for LoopbackMr {
    fn key(&self) -> u64 {
        self.key
    }

    fn bind_counter(&self, _cntr: &dyn Counter) -> Result<(), ProviderError> {
        if self.enabled.load(Ordering::SeqCst) {
            return Err(ProviderError::BadState("MR bind after enable"));
        }
        Ok(())
    }

    fn enable(&self) -> Result<(), ProviderError> {
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for LoopbackMr {
    fn drop(&mut self) {
        self.shared.ledger.mrs.fetch_sub(1, Ordering::SeqCst);
    }
}

struct LoopbackStx {
    shared: Arc<Shared>,
    serial: u64,
}

impl SharedTx for LoopbackStx {
    fn id(&self) -> u64 {
        self.serial
    }
}

impl Drop for LoopbackStx {
    fn drop(&mut self) {
        self.shared.ledger.stxs.fetch_sub(1, Ordering::SeqCst);
    }
}

struct LoopbackAv {
    shared: Arc<Shared>,
}

impl AddressVector for LoopbackAv {
    fn insert(&self, addrs: &[Vec<u8>]) -> Result<usize, ProviderError> {
        Ok(addrs.len().saturating_sub(self.shared.cfg.av_insert_drop))
    }
}

impl Drop for LoopbackAv {
    fn drop(&mut self) {
        self.shared.ledger.avs.fetch_sub(1, Ordering::SeqCst);
    }
}
