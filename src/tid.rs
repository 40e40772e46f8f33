//! Thread identity for private transmit-context ownership.
//!
//! Platforms differ in what a "thread id" is, so identity is a tagged value
//! produced by a pluggable source. The default source hands every OS thread
//! a synthetic id from a process-wide counter; callers that can obtain a
//! kernel tid inject their own source.

use std::sync::atomic::{AtomicU64, Ordering};

/// A thread identity. Equality and hashing are per-variant: a kernel tid
/// never compares equal to a synthetic one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadId {
    /// Kernel-assigned thread id.
    OsTid(u64),
    /// Process-private identity from the fallback counter.
    Synthetic(u64),
}

/// Pluggable producer of the calling thread's identity.
pub type TidSource = fn() -> ThreadId;

static NEXT_SYNTHETIC: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static SELF_TID: ThreadId =
        ThreadId::Synthetic(NEXT_SYNTHETIC.fetch_add(1, Ordering::Relaxed));
}

/// Default source: one synthetic id per OS thread, stable for the thread's
/// lifetime.
pub fn default_tid_source() -> ThreadId {
    SELF_TID.with(|t| *t)
}

/// Resolve the calling thread's identity through `source`, or the default.
pub fn current(source: Option<TidSource>) -> ThreadId {
    match source {
        Some(f) => f(),
        None => default_tid_source(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_thread_is_stable() {
        assert_eq!(current(None), current(None));
    }

    #[test]
    fn distinct_threads_get_distinct_ids() {
        let mine = current(None);
        let other = std::thread::spawn(|| current(None)).join().unwrap();
        assert_ne!(mine, other);
    }

    #[test]
    fn variants_never_collide() {
        assert_ne!(ThreadId::OsTid(7), ThreadId::Synthetic(7));
    }

    #[test]
    fn injected_source_wins() {
        fn fixed() -> ThreadId {
            ThreadId::OsTid(42)
        }
        assert_eq!(current(Some(fixed)), ThreadId::OsTid(42));
    }
}
