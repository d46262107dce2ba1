//! Fault injection ("chaos mode")
//!
//! Randomly fails a fraction of chunk admissions and adds latency to
//! requests. The injector is built from an explicit [`FaultConfig`] and is
//! inert unless `enabled` is set. A fixed `seed` makes the sequence of
//! decisions reproducible.

use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

/// Fault injection settings
#[derive(Debug, Clone, Deserialize)]
pub struct FaultConfig {
    /// Master switch; nothing is injected when false
    pub enabled: bool,

    /// Probability in `[0, 1]` that a chunk admission fails
    pub failure_rate: f64,

    /// Upper bound of the uniformly drawn latency
    pub max_latency_ms: u64,

    /// RNG seed; entropy-seeded when absent
    pub seed: Option<u64>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_rate: 0.15,
            max_latency_ms: 2000,
            seed: None,
        }
    }
}

impl FaultConfig {
    /// Failures only, no latency. Handy for deterministic tests.
    pub fn failures_only(failure_rate: f64, seed: u64) -> Self {
        Self {
            enabled: true,
            failure_rate,
            max_latency_ms: 0,
            seed: Some(seed),
        }
    }
}

/// What the injector decided for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultDecision {
    pub fail: bool,
    pub delay: Duration,
}

impl FaultDecision {
    pub const NONE: FaultDecision = FaultDecision {
        fail: false,
        delay: Duration::ZERO,
    };
}

/// Draws fault decisions from a (possibly seeded) RNG
pub struct FaultInjector {
    config: FaultConfig,
    rng: Mutex<StdRng>,
}

impl FaultInjector {
    pub fn new(config: FaultConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    /// An injector that never injects anything
    pub fn disabled() -> Self {
        Self::new(FaultConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Decide the fate of one request.
    ///
    /// `can_fail` is false for requests that only get latency (everything
    /// except chunk admission).
    pub fn decide(&self, can_fail: bool) -> FaultDecision {
        if !self.config.enabled {
            return FaultDecision::NONE;
        }

        let mut rng = self.rng.lock();
        let rate = match self.config.failure_rate {
            r if r.is_nan() => 0.0,
            r => r.clamp(0.0, 1.0),
        };
        let fail = can_fail && rng.gen_bool(rate);
        let delay = if self.config.max_latency_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..=self.config.max_latency_ms))
        };

        FaultDecision { fail, delay }
    }
}

impl std::fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjector")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_is_inert() {
        let injector = FaultInjector::disabled();
        for _ in 0..100 {
            assert_eq!(injector.decide(true), FaultDecision::NONE);
        }
    }

    #[test]
    fn test_seeded_decisions_are_reproducible() {
        let a = FaultInjector::new(FaultConfig::failures_only(0.5, 42));
        let b = FaultInjector::new(FaultConfig::failures_only(0.5, 42));

        let first: Vec<bool> = (0..64).map(|_| a.decide(true).fail).collect();
        let second: Vec<bool> = (0..64).map(|_| b.decide(true).fail).collect();

        assert_eq!(first, second);
        assert!(first.iter().any(|f| *f));
        assert!(first.iter().any(|f| !*f));
    }

    #[test]
    fn test_latency_only_requests_never_fail() {
        let injector = FaultInjector::new(FaultConfig {
            enabled: true,
            failure_rate: 1.0,
            max_latency_ms: 5,
            seed: Some(7),
        });

        for _ in 0..32 {
            let decision = injector.decide(false);
            assert!(!decision.fail);
            assert!(decision.delay <= Duration::from_millis(5));
        }
        assert!(injector.decide(true).fail);
    }

    #[test]
    fn test_nan_rate_never_fails() {
        let injector = FaultInjector::new(FaultConfig::failures_only(f64::NAN, 9));
        for _ in 0..16 {
            assert!(!injector.decide(true).fail);
        }
    }
}
