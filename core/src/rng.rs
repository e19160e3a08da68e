//! Deterministic random number generation.
//!
//! RULE: Nothing in the simulation may call any platform RNG.
//! All randomness flows through RegionRng instances derived from the
//! single master seed of the run.
//!
//! Each region gets its own stream, seeded from
//! (master_seed XOR mixed region_index). Adding a region never changes
//! the streams of the regions before it.

use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// A deterministic RNG stream for a single region.
pub struct RegionRng {
    inner: Pcg64Mcg,
}

impl RegionRng {
    /// The region index must never change once assigned.
    pub fn new(master_seed: u64, region_index: usize) -> Self {
        let derived_seed = master_seed ^ (region_index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Self { inner: Pcg64Mcg::seed_from_u64(derived_seed) }
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// `base` scaled by a uniform factor in [1 - spread, 1 + spread).
    pub fn vary(&mut self, base: f64, spread: f64) -> f64 {
        base * (1.0 + spread * (2.0 * self.next_f64() - 1.0))
    }
}
