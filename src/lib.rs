//! pgasrt — partitioned global address space transport runtime core.
//!
//! One-sided communication over an RMA provider: every PE exposes a
//! symmetric heap and data segment, and any PE may read, write or atomically
//! update memory owned by any other PE without the remote side's
//! participation. This crate is the transport core: fabric bring-up and
//! teardown, the shared-transmit-context allocator, communication contexts
//! with their completion machinery, and teams with their pSync slot pool.
//! RMA verbs, collectives algorithms and the symmetric allocator live above
//! and reach the core through the seams in [`provider`], [`runtime`] and
//! [`collectives`].

pub mod collectives;
pub mod config;
pub mod provider;
pub mod runtime;
pub mod sim;
pub mod team;
pub mod tid;
pub mod transport;

// Re-exports
pub use collectives::{ActiveSet, Collectives, PsyncRef, SymHandle, SymmetricHeap};
pub use config::{Params, Setting, StxAllocatorKind, ThreadLevel, TEAMS_MAX_LIMIT};
pub use runtime::{KvsError, RuntimeKvs};
pub use team::{
    ctx_get_team, team_get_config, team_my_pe, team_n_pes, Team, TeamConfig, TeamError,
    TeamManager, PSYNC_GROUPS, SYNC_SIZE, SYNC_VALUE,
};
pub use tid::{ThreadId, TidSource};
pub use transport::{
    Context, CtxOptions, CtxState, MemoryLayout, TransportError, TransportState, WaitMode,
    DEFAULT_CTX_ID,
};
