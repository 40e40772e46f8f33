//! Bounce buffers: transport-owned staging for puts whose source cannot be
//! pinned for the life of the operation.
//!
//! Buffers are drawn from a per-context freelist and recovered through the
//! completion queue: the operation context token carried by the completion
//! identifies the fragment. Providers that require caller-owned per-op
//! contexts cannot support this, so the option is stripped up front.

use std::collections::HashMap;

/// Discriminator for completion-queue tokens that name a bounce fragment.
pub const FRAG_BOUNCE: u8 = 1;

#[derive(Debug)]
pub struct BounceBuffer {
    token: u64,
    payload: Vec<u8>,
}

impl BounceBuffer {
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }
}

/// Per-context freelist. `checkout` hands a buffer to an injection,
/// `complete` returns it once the completion event surfaces its token.
#[derive(Debug)]
pub struct BouncePool {
    buffer_size: usize,
    max_buffers: usize,
    created: usize,
    next_token: u64,
    free: Vec<BounceBuffer>,
    in_flight: HashMap<u64, BounceBuffer>,
}

impl BouncePool {
    pub fn new(buffer_size: usize, max_buffers: usize) -> Self {
        BouncePool {
            buffer_size,
            max_buffers,
            created: 0,
            next_token: 0,
            free: Vec::new(),
            in_flight: HashMap::new(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a buffer for staging, or `None` when the pool is exhausted and
    /// the caller must wait for completions.
    pub fn checkout(&mut self) -> Option<BounceBuffer> {
        if let Some(buf) = self.free.pop() {
            return Some(buf);
        }
        if self.created < self.max_buffers {
            self.created += 1;
            let token = (u64::from(FRAG_BOUNCE) << 56) | self.next_token;
            self.next_token += 1;
            return Some(BounceBuffer {
                token,
                payload: vec![0; self.buffer_size],
            });
        }
        None
    }

    /// Record a checked-out buffer as injected.
    pub fn launch(&mut self, buf: BounceBuffer) -> u64 {
        let token = buf.token;
        self.in_flight.insert(token, buf);
        token
    }

    /// Return the fragment named by a completion token to the freelist.
    /// Unknown tokens belong to other operation kinds and are ignored.
    pub fn complete(&mut self, token: u64) -> bool {
        match self.in_flight.remove(&token) {
            Some(buf) => {
                self.free.push(buf);
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_caps_at_max() {
        let mut pool = BouncePool::new(64, 2);
        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        assert!(pool.checkout().is_none());
        let ta = pool.launch(a);
        let _tb = pool.launch(b);
        assert_eq!(pool.in_flight(), 2);

        assert!(pool.complete(ta));
        assert_eq!(pool.in_flight(), 1);
        // The completed buffer is reusable.
        assert!(pool.checkout().is_some());
    }

    #[test]
    fn unknown_token_is_ignored() {
        let mut pool = BouncePool::new(16, 1);
        assert!(!pool.complete(0xdead));
    }

    #[test]
    fn payload_matches_configured_size() {
        let mut pool = BouncePool::new(128, 1);
        let mut buf = pool.checkout().unwrap();
        assert_eq!(buf.payload_mut().len(), 128);
    }

    #[test]
    fn tokens_carry_the_bounce_discriminator() {
        let mut pool = BouncePool::new(8, 4);
        let buf = pool.checkout().unwrap();
        assert_eq!((buf.token() >> 56) as u8, FRAG_BOUNCE);
    }
}
