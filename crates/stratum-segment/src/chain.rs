//! Per-thread context chain.
//!
//! Every open context registers here under its (map, segment) pair. The
//! chain enforces two rules:
//!
//! - At most one context per (thread, segment) may own the shared lock.
//!   A second context on the same segment from the same thread is refused
//!   with `NestedContext`; acquiring the shared word twice from one thread
//!   would self-deadlock on upgrade.
//! - The chain depth is capped at 2^16. Blowing the cap almost always
//!   means contexts are opened in a loop without being closed, and is
//!   fatal.

use std::cell::RefCell;
use stratum_common::{Result, StratumError};

/// Maximum number of simultaneously open contexts per thread.
pub const MAX_CHAIN_DEPTH: usize = 1 << 16;

thread_local! {
    static CHAIN: RefCell<Vec<(u64, usize)>> = const { RefCell::new(Vec::new()) };
}

/// Registration of one context in its thread's chain; deregisters on drop.
#[derive(Debug)]
pub struct ChainGuard {
    map_id: u64,
    segment: usize,
}

impl ChainGuard {
    /// Registers a context for `segment` of the map identified by
    /// `map_id`.
    ///
    /// # Panics
    ///
    /// Panics when the chain depth exceeds [`MAX_CHAIN_DEPTH`].
    pub fn enter(map_id: u64, segment: usize) -> Result<Self> {
        CHAIN.with(|chain| {
            let mut chain = chain.borrow_mut();
            if chain.len() >= MAX_CHAIN_DEPTH {
                panic!(
                    "NestedContextExhausted: more than {} contexts open on this thread",
                    MAX_CHAIN_DEPTH
                );
            }
            if chain.iter().any(|&(m, s)| m == map_id && s == segment) {
                return Err(StratumError::NestedContext { segment });
            }
            chain.push((map_id, segment));
            Ok(Self { map_id, segment })
        })
    }

    /// Number of contexts this thread currently has open.
    pub fn depth() -> usize {
        CHAIN.with(|chain| chain.borrow().len())
    }
}

impl Drop for ChainGuard {
    fn drop(&mut self) {
        CHAIN.with(|chain| {
            let mut chain = chain.borrow_mut();
            if let Some(i) = chain
                .iter()
                .rposition(|&(m, s)| m == self.map_id && s == self.segment)
            {
                chain.remove(i);
            }
        });
    }
}
