//! Runtime parameters, read once from the environment at startup.
//!
//! Every knob has a `PGASRT_*` environment variable. Invalid values never
//! abort: they log a warning and fall back to the default, except where the
//! setting gates a hard resource limit (checked at the use site).

use crate::tid::TidSource;
use std::env;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Thread support level requested by the caller at init time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadLevel {
    /// One thread ever enters the runtime.
    Single,
    /// Only the initializing thread enters.
    Funneled,
    /// Any thread may enter, never concurrently.
    Serialized,
    /// Unrestricted concurrency.
    Multiple,
}

/// Shared-transmit-context fallback allocation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StxAllocatorKind {
    RoundRobin,
    Random,
}

impl FromStr for StxAllocatorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(StxAllocatorKind::RoundRobin),
            "random" => Ok(StxAllocatorKind::Random),
            _ => Err(()),
        }
    }
}

impl fmt::Display for StxAllocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StxAllocatorKind::RoundRobin => write!(f, "round-robin"),
            StxAllocatorKind::Random => write!(f, "random"),
        }
    }
}

/// A parameter value plus whether the user explicitly supplied it.
///
/// Several limits behave differently when defaulted: an explicit
/// `PGASRT_STX_MAX` in single-threaded mode draws a warning before being
/// overridden, and poll limits are only forced to yield mode when the user
/// did not pick them.
#[derive(Debug, Clone, Copy)]
pub struct Setting<T> {
    pub value: T,
    pub provided: bool,
}

impl<T> Setting<T> {
    fn defaulted(value: T) -> Self {
        Setting { value, provided: false }
    }

    fn provided(value: T) -> Self {
        Setting { value, provided: true }
    }
}

/// Maximum teams representable by the reservation word.
pub const TEAMS_MAX_LIMIT: usize = u64::BITS as usize;

#[derive(Debug, Clone)]
pub struct Params {
    /// Maximum simultaneous teams; hard-capped at the reservation word width.
    pub teams_max: usize,
    /// STX pool size.
    pub stx_max: Setting<usize>,
    /// Derive the STX pool size from provider transmit resources.
    pub stx_auto: bool,
    /// Override for the node-wide transmit resource count in auto mode.
    pub stx_node_max: Option<usize>,
    /// Soft sharing cap for `find_shared`; -1 = unbounded.
    pub stx_threshold: i64,
    pub stx_allocator: StxAllocatorKind,
    /// Force every context onto the shared path.
    pub stx_disable_private: bool,
    /// Provider name selection filter (glob).
    pub provider_filter: Option<String>,
    /// Fabric name selection filter (glob).
    pub fabric_filter: Option<String>,
    /// Domain name selection filter (glob).
    pub domain_filter: Option<String>,
    /// Bounce buffer payload size; 0 disables bounce buffering.
    pub bounce_size: usize,
    /// Bounce buffers per context; 0 disables bounce buffering.
    pub max_bounce_buffers: usize,
    /// Put-side counter poll limit; negative forces an immediate blocking wait.
    pub tx_poll_limit: Setting<i64>,
    /// Get-side counter poll limit; negative forces an immediate blocking wait.
    pub rx_poll_limit: Setting<i64>,
    /// Demote missing provider atomics from error to warning.
    pub atomic_checks_warn: bool,
    /// Give each context its own lock; completion waits then poll and yield.
    pub ctx_locking: bool,
    /// Verbose destroy-time counter dumps.
    pub debug: bool,
    /// Thread identity source override, used by tests.
    pub tid_source: Option<TidSource>,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            teams_max: 16,
            stx_max: Setting::defaulted(1),
            stx_auto: false,
            stx_node_max: None,
            stx_threshold: 1,
            stx_allocator: StxAllocatorKind::RoundRobin,
            stx_disable_private: false,
            provider_filter: None,
            fabric_filter: None,
            domain_filter: None,
            bounce_size: 2048,
            max_bounce_buffers: 128,
            tx_poll_limit: Setting::defaulted(0),
            rx_poll_limit: Setting::defaulted(0),
            atomic_checks_warn: false,
            ctx_locking: false,
            debug: false,
            tid_source: None,
        }
    }
}

impl Params {
    /// Read all parameters from `PGASRT_*` environment variables.
    pub fn from_env() -> Self {
        let mut p = Params::default();

        if let Some(v) = env_number::<usize>("PGASRT_TEAMS_MAX") {
            p.teams_max = v;
        }
        if let Some(v) = env_number::<usize>("PGASRT_STX_MAX") {
            p.stx_max = Setting::provided(v);
        }
        if let Some(v) = env_bool("PGASRT_STX_AUTO") {
            p.stx_auto = v;
        }
        if let Some(v) = env_number::<usize>("PGASRT_STX_NODE_MAX") {
            p.stx_node_max = Some(v);
        }
        if let Some(v) = env_number::<i64>("PGASRT_STX_THRESHOLD") {
            p.stx_threshold = v;
        }
        if let Ok(raw) = env::var("PGASRT_STX_ALLOCATOR") {
            match raw.parse() {
                Ok(kind) => p.stx_allocator = kind,
                Err(()) => warn!(
                    value = %raw,
                    "ignoring bad STX share algorithm, using 'round-robin'"
                ),
            }
        }
        if let Some(v) = env_bool("PGASRT_STX_DISABLE_PRIVATE") {
            p.stx_disable_private = v;
        }

        p.provider_filter = env::var("PGASRT_PROVIDER")
            .or_else(|_| env::var("PGASRT_USE_PROVIDER"))
            .ok();
        p.fabric_filter = env::var("PGASRT_FABRIC").ok();
        p.domain_filter = env::var("PGASRT_DOMAIN").ok();

        if let Some(v) = env_number::<i64>("PGASRT_BOUNCE_SIZE") {
            p.bounce_size = v.max(0) as usize;
        }
        if let Some(v) = env_number::<i64>("PGASRT_MAX_BOUNCE_BUFFERS") {
            p.max_bounce_buffers = v.max(0) as usize;
        }
        if let Some(v) = env_number::<i64>("PGASRT_TX_POLL_LIMIT") {
            p.tx_poll_limit = Setting::provided(v);
        }
        if let Some(v) = env_number::<i64>("PGASRT_RX_POLL_LIMIT") {
            p.rx_poll_limit = Setting::provided(v);
        }
        if let Some(v) = env_bool("PGASRT_ATOMIC_CHECKS_WARN") {
            p.atomic_checks_warn = v;
        }
        if let Some(v) = env_bool("PGASRT_CTX_LOCKING") {
            p.ctx_locking = v;
        }
        if let Some(v) = env_bool("PGASRT_DEBUG") {
            p.debug = v;
        }

        p
    }
}

fn env_number<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable numeric parameter");
            None
        }
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(key, value = %raw, "ignoring unparseable boolean parameter");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let p = Params::default();
        assert_eq!(p.teams_max, 16);
        assert_eq!(p.stx_max.value, 1);
        assert!(!p.stx_max.provided);
        assert_eq!(p.stx_threshold, 1);
        assert_eq!(p.stx_allocator, StxAllocatorKind::RoundRobin);
        assert!(p.teams_max <= TEAMS_MAX_LIMIT);
    }

    #[test]
    fn allocator_kind_parses() {
        assert_eq!("round-robin".parse(), Ok(StxAllocatorKind::RoundRobin));
        assert_eq!("random".parse(), Ok(StxAllocatorKind::Random));
        assert!("fancy".parse::<StxAllocatorKind>().is_err());
    }

    #[test]
    fn thread_levels_are_ordered() {
        assert!(ThreadLevel::Single < ThreadLevel::Funneled);
        assert!(ThreadLevel::Funneled < ThreadLevel::Serialized);
        assert!(ThreadLevel::Serialized < ThreadLevel::Multiple);
    }
}
