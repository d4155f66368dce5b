// SPDX-License-Identifier: MPL-2.0

//! The randomness source consumed by the allocator.

use core::sync::atomic::{AtomicU64, Ordering};

/// A source of fast, non-cryptographic randomness.
///
/// The address space takes this as an injected dependency so that address
/// randomization is deterministic under test.
pub trait Rng: Send + Sync {
    fn rand_u64(&self) -> u64;
}

/// A splitmix64 generator over an atomic state word.
#[derive(Debug)]
pub struct FastRng {
    state: AtomicU64,
}

impl FastRng {
    pub const fn new(seed: u64) -> Self {
        Self {
            state: AtomicU64::new(seed),
        }
    }
}

impl Default for FastRng {
    fn default() -> Self {
        Self::new(0x9e37_79b9_7f4a_7c15)
    }
}

impl Rng for FastRng {
    fn rand_u64(&self) -> u64 {
        let mut z = self
            .state
            .fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed)
            .wrapping_add(0x9e37_79b9_7f4a_7c15);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }
}
