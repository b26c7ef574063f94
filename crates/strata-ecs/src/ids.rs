//! Fresh entity id generation.
//!
//! Ids are random (version 4) UUID strings. The randomness comes from a PCG
//! generator so that tests can seed it and get reproducible ids.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

/// Generates fresh, globally unique entity ids.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    rng: Pcg64,
}

impl IdGenerator {
    /// A generator seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self {
            rng: Pcg64::from_entropy(),
        }
    }

    /// A deterministic generator. Two generators with the same seed produce
    /// the same id sequence.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Pcg64::seed_from_u64(seed),
        }
    }

    /// The next id, formatted as a hyphenated lowercase UUID.
    pub fn next_id(&mut self) -> String {
        let bytes: [u8; 16] = self.rng.gen();
        uuid::Builder::from_random_bytes(bytes)
            .into_uuid()
            .hyphenated()
            .to_string()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::from_entropy()
    }
}
