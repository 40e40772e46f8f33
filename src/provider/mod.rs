//! RMA provider handle layer.
//!
//! The runtime owns the lifecycle of fabric resources but not their
//! semantics: discovery, domains, address vectors, endpoints, counters,
//! completion queues, memory regions and shared transmit contexts are all
//! reached through this trait family. Handles close on drop, so teardown
//! ordering is expressed by field order in the owning state.

pub mod loopback;

use bitflags::bitflags;
use std::fmt;
use thiserror::Error;

bitflags! {
    /// Capabilities requested from, or offered by, a fabric.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u32 {
        const RMA          = 1 << 0;
        const ATOMICS      = 1 << 1;
        /// Remote-side completion events on memory regions.
        const RMA_EVENT    = 1 << 2;
        const READ         = 1 << 3;
        const WRITE        = 1 << 4;
        const REMOTE_READ  = 1 << 5;
        const REMOTE_WRITE = 1 << 6;
    }
}

bitflags! {
    /// Provider-imposed operating requirements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProviderMode: u32 {
        /// Every operation must carry a caller-owned context pointer.
        /// Incompatible with bounce buffering, which repurposes the
        /// completion context to recover the buffer.
        const OP_CONTEXT = 1 << 0;
    }
}

/// Memory registration discipline offered by a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MrMode {
    /// One registration can span the whole address space; keys are chosen
    /// by the application.
    Scalable,
    /// Registrations cover concrete ranges; keys are assigned by the
    /// provider and must be exchanged.
    Basic,
}

/// Domain threading policy derived from the requested thread level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threading {
    /// All domain access is serialized by the caller.
    Domain,
    /// Concurrent access is safe when completions are kept disjoint.
    Completion,
    /// Fully thread-safe.
    Safe,
}

/// Whether a counter needs a native blocking-wait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterWait {
    None,
    Unspec,
}

/// Completion direction a counter is bound to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CntrEvents {
    /// Non-fetching operations: put, atomic, …
    Write,
    /// Fetching operations: get, fetch-atomic, …
    Read,
    /// Incoming remote writes on the target side.
    RemoteWrite,
}

/// Role an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Receives incoming RMA; no transmit resources.
    Target,
    /// Issues RMA through a shared transmit context.
    Transmit,
}

/// Discovery constraints.
#[derive(Debug, Clone)]
pub struct FabricHints {
    pub caps: Caps,
    pub threading: Threading,
    pub provider_name: Option<String>,
    /// Minimum buffered-send (inject) size the transport requires.
    pub inject_size: usize,
}

/// One fabric/domain pairing offered by a provider.
#[derive(Debug, Clone)]
pub struct FabricDesc {
    pub provider_name: String,
    pub fabric_name: String,
    pub domain_name: String,
    pub caps: Caps,
    pub mode: ProviderMode,
    pub mr_mode: MrMode,
    /// Remote peers may address memory by virtual address directly.
    pub remote_va: bool,
    pub max_msg_size: usize,
    pub inject_size: usize,
    /// Transmit contexts the domain can supply, node-wide.
    pub tx_ctx_cnt: usize,
    /// Memory regions can generate remote RMA events.
    pub mr_rma_event: bool,
}

/// Atomic operand datatypes the runtime depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmoDt {
    Int32,
    Int64,
    Uint32,
    Uint64,
    Float,
    Double,
}

impl AmoDt {
    pub fn name(&self) -> &'static str {
        match self {
            AmoDt::Int32 => "int32",
            AmoDt::Int64 => "int64",
            AmoDt::Uint32 => "uint32",
            AmoDt::Uint64 => "uint64",
            AmoDt::Float => "float",
            AmoDt::Double => "double",
        }
    }
}

/// Atomic operations the runtime depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmoOp {
    Sum,
    Prod,
    Min,
    Max,
    Band,
    Bor,
    Bxor,
    AtomicWrite,
    AtomicRead,
    Cswap,
    Mswap,
}

impl AmoOp {
    pub fn name(&self) -> &'static str {
        match self {
            AmoOp::Sum => "SUM",
            AmoOp::Prod => "PROD",
            AmoOp::Min => "MIN",
            AmoOp::Max => "MAX",
            AmoOp::Band => "BAND",
            AmoOp::Bor => "BOR",
            AmoOp::Bxor => "BXOR",
            AmoOp::AtomicWrite => "ATOMIC_WRITE",
            AmoOp::AtomicRead => "ATOMIC_READ",
            AmoOp::Cswap => "CSWAP",
            AmoOp::Mswap => "MSWAP",
        }
    }
}

impl fmt::Display for AmoDt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for AmoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no fabric matched the requested capabilities")]
    NoFabric,
    #[error("resource limit reached: {0}")]
    ResourceLimit(&'static str),
    #[error("handle is not in a usable state: {0}")]
    BadState(&'static str),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("provider internal failure: {0}")]
    Internal(String),
}

pub trait Provider: Send + Sync {
    /// Enumerate fabrics compatible with `hints`, best first.
    fn discover(&self, hints: &FabricHints) -> Result<Vec<FabricDesc>, ProviderError>;

    fn open_fabric(&self, desc: &FabricDesc) -> Result<Box<dyn FabricHandle>, ProviderError>;
}

pub trait FabricHandle: Send + Sync {
    fn open_domain(&self, desc: &FabricDesc) -> Result<Box<dyn DomainHandle>, ProviderError>;
}

pub trait DomainHandle: Send + Sync {
    fn open_av(&self) -> Result<Box<dyn AddressVector>, ProviderError>;

    fn open_counter(&self, wait: CounterWait) -> Result<Box<dyn Counter>, ProviderError>;

    fn open_cq(&self) -> Result<Box<dyn CompletionQueue>, ProviderError>;

    fn open_endpoint(&self, kind: EndpointKind) -> Result<Box<dyn Endpoint>, ProviderError>;

    /// Register `[base, base+len)` for remote access. `requested_key` is
    /// honored in scalable mode and ignored in basic mode. `rma_event`
    /// requests remote-completion counting on the region.
    fn register_mr(
        &self,
        base: u64,
        len: u64,
        access: Caps,
        requested_key: u64,
        rma_event: bool,
    ) -> Result<Box<dyn MemoryRegion>, ProviderError>;

    fn alloc_stx(&self) -> Result<Box<dyn SharedTx>, ProviderError>;
}

pub trait Endpoint: Send + Sync {
    fn bind_stx(&self, stx: &dyn SharedTx) -> Result<(), ProviderError>;

    fn bind_counter(&self, cntr: &dyn Counter, events: CntrEvents) -> Result<(), ProviderError>;

    /// `selective`: only operations that ask for a completion generate one.
    fn bind_cq(&self, cq: &dyn CompletionQueue, selective: bool) -> Result<(), ProviderError>;

    fn bind_av(&self, av: &dyn AddressVector) -> Result<(), ProviderError>;

    fn enable(&self) -> Result<(), ProviderError>;

    /// Opaque fabric address of this endpoint, for address-vector exchange.
    fn name(&self) -> Result<Vec<u8>, ProviderError>;

    /// Maximum element count for the (datatype, op) pair; 0 = unsupported.
    fn atomic_valid(&self, dt: AmoDt, op: AmoOp) -> Result<usize, ProviderError>;

    fn fetch_atomic_valid(&self, dt: AmoDt, op: AmoOp) -> Result<usize, ProviderError>;

    fn compare_atomic_valid(&self, dt: AmoDt, op: AmoOp) -> Result<usize, ProviderError>;
}

pub trait Counter: Send + Sync {
    fn read(&self) -> u64;

    /// Advance the counter; exposed for completion injection.
    fn add(&self, delta: u64);

    /// Block until the counter reaches `threshold`.
    fn wait(&self, threshold: u64) -> Result<(), ProviderError>;
}

pub trait CompletionQueue: Send + Sync {
    /// Pop one completion, returning its operation context token.
    fn read_context(&self) -> Result<Option<u64>, ProviderError>;

    /// Push a completion carrying `token`; exposed for completion injection.
    fn push_context(&self, token: u64);
}

pub trait MemoryRegion: Send + Sync {
    fn key(&self) -> u64;

    fn bind_counter(&self, cntr: &dyn Counter) -> Result<(), ProviderError>;

    fn enable(&self) -> Result<(), ProviderError>;
}

pub trait AddressVector: Send + Sync {
    /// Insert endpoint addresses for PEs `0..addrs.len()`, returning the
    /// number successfully inserted.
    fn insert(&self, addrs: &[Vec<u8>]) -> Result<usize, ProviderError>;
}

/// Opaque shared transmit resource.
pub trait SharedTx: Send + Sync {
    /// Stable identity for bind bookkeeping.
    fn id(&self) -> u64;
}
