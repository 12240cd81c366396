//! Environment abstraction for deterministic testing.
//!
//! Decouples session logic from system resources (wall clock, randomness).
//! Production code uses [`SystemEnvironment`]; tests substitute a seeded
//! RNG and a steppable clock so ratchet policy and pruning are exercised
//! without sleeping.

use rand_core::CryptoRngCore;

/// Abstract environment providing time and randomness.
///
/// Implementations MUST guarantee:
///
/// - `now_ms()` never decreases within a single execution context
/// - `rng()` hands out a cryptographically secure generator in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// The RNG handle produced by this environment.
    type Rng: CryptoRngCore + Send;

    /// Current wall-clock time in unix milliseconds.
    ///
    /// Wall clock, not monotonic: the values end up inside persisted
    /// session records (`ratchet_at`, skipped-key `created_at`) and must
    /// stay meaningful across process restarts.
    fn now_ms(&self) -> u64;

    /// Fresh handle to this environment's RNG.
    fn rng(&self) -> Self::Rng;
}

/// Production environment: system clock plus OS entropy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnvironment;

impl Environment for SystemEnvironment {
    type Rng = rand::rngs::OsRng;

    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis() as u64)
    }

    fn rng(&self) -> Self::Rng {
        rand::rngs::OsRng
    }
}
