//! Tunable parameters for the primitives.
//!
//! The spin counts, collision thresholds, and arena bounds in this crate
//! are empirically tuned quantities, not semantic constants; they live in
//! config structs so a target platform can retune them. Values are
//! resolved in this order (highest priority first):
//!
//! 1. **Programmatic** — fields set on the config struct
//! 2. **Environment variables** — `CONVERGE_*` overrides
//! 3. **Defaults** — built-in defaults below
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `SpinConfig::spin_limit` | 6 (spin rounds double up to `2^6` hints) |
//! | `SpinConfig::yield_limit` | 10 (yields after spins, then park) |
//! | `ExchangeConfig::spin_iterations` | 1024 |
//! | `ExchangeConfig::collision_threshold` | 2 |
//! | `ExchangeConfig::max_arena_slots` | 0 (derive from available parallelism) |
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `CONVERGE_SPIN_LIMIT` | `u32` | `SpinConfig::spin_limit` |
//! | `CONVERGE_YIELD_LIMIT` | `u32` | `SpinConfig::yield_limit` |
//! | `CONVERGE_EXCHANGE_SPIN` | `u32` | `ExchangeConfig::spin_iterations` |
//! | `CONVERGE_EXCHANGE_COLLISIONS` | `u32` | `ExchangeConfig::collision_threshold` |
//! | `CONVERGE_EXCHANGE_ARENA_SLOTS` | `usize` | `ExchangeConfig::max_arena_slots` |

use std::thread;

/// Environment variable name for the spin-phase bound.
pub const ENV_SPIN_LIMIT: &str = "CONVERGE_SPIN_LIMIT";
/// Environment variable name for the yield-phase bound.
pub const ENV_YIELD_LIMIT: &str = "CONVERGE_YIELD_LIMIT";
/// Environment variable name for exchanger spin iterations.
pub const ENV_EXCHANGE_SPIN: &str = "CONVERGE_EXCHANGE_SPIN";
/// Environment variable name for the exchanger collision threshold.
pub const ENV_EXCHANGE_COLLISIONS: &str = "CONVERGE_EXCHANGE_COLLISIONS";
/// Environment variable name for the exchanger arena capacity.
pub const ENV_EXCHANGE_ARENA_SLOTS: &str = "CONVERGE_EXCHANGE_ARENA_SLOTS";

/// Error returned when an override variable holds an unparseable value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value {value:?} for {var}")]
pub struct ConfigError {
    /// The environment variable at fault.
    pub var: &'static str,
    /// The raw value that failed to parse.
    pub value: String,
}

/// Spin/yield bounds shared by the parking wait loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinConfig {
    /// Backoff steps spent in processor-hint spins (round length doubles
    /// each step).
    pub spin_limit: u32,
    /// Backoff steps after which the wait must park or give up.
    pub yield_limit: u32,
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self {
            spin_limit: 6,
            yield_limit: 10,
        }
    }
}

impl SpinConfig {
    /// Normalizes the configuration to internally consistent values.
    pub fn normalize(&mut self) {
        if self.yield_limit < self.spin_limit {
            self.yield_limit = self.spin_limit;
        }
    }
}

/// Tuning for [`Exchanger`](crate::sync::Exchanger).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeConfig {
    /// Randomized spin iterations before a waiting offer parks (single
    /// slot, arena slot 0) or moves on (other arena slots). Forced to 1
    /// on single-core hosts, where spinning cannot observe progress.
    pub spin_iterations: u32,
    /// Failed release CASes treated as true contention before escalating
    /// to the elimination arena. Failed *offer* CASes never count: two
    /// simultaneous offers are the expected rendezvous, not contention.
    pub collision_threshold: u32,
    /// Arena capacity. `0` derives half the available parallelism,
    /// clamped to `1..=32`. The arena is allocated once at this size;
    /// only the in-use bound moves afterwards.
    pub max_arena_slots: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            spin_iterations: 1024,
            collision_threshold: 2,
            max_arena_slots: 0,
        }
    }
}

impl ExchangeConfig {
    /// Normalizes the configuration, deriving the arena capacity from the
    /// host when left at 0.
    pub fn normalize(&mut self) {
        if self.spin_iterations == 0 {
            self.spin_iterations = 1;
        }
        if self.collision_threshold == 0 {
            self.collision_threshold = 1;
        }
        if self.max_arena_slots == 0 {
            let cpus = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
            self.max_arena_slots = (cpus / 2).clamp(1, 32);
        }
    }
}

/// Applies `CONVERGE_*` overrides to a [`SpinConfig`].
///
/// Only variables present in the environment are applied.
pub fn apply_spin_env_overrides(config: &mut SpinConfig) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_SPIN_LIMIT) {
        config.spin_limit = parse(ENV_SPIN_LIMIT, &val)?;
    }
    if let Some(val) = read_env(ENV_YIELD_LIMIT) {
        config.yield_limit = parse(ENV_YIELD_LIMIT, &val)?;
    }
    Ok(())
}

/// Applies `CONVERGE_*` overrides to an [`ExchangeConfig`].
///
/// Only variables present in the environment are applied.
pub fn apply_exchange_env_overrides(config: &mut ExchangeConfig) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_EXCHANGE_SPIN) {
        config.spin_iterations = parse(ENV_EXCHANGE_SPIN, &val)?;
    }
    if let Some(val) = read_env(ENV_EXCHANGE_COLLISIONS) {
        config.collision_threshold = parse(ENV_EXCHANGE_COLLISIONS, &val)?;
    }
    if let Some(val) = read_env(ENV_EXCHANGE_ARENA_SLOTS) {
        config.max_arena_slots = parse(ENV_EXCHANGE_ARENA_SLOTS, &val)?;
    }
    Ok(())
}

fn read_env(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(val) if !val.trim().is_empty() => Some(val.trim().to_owned()),
        _ => None,
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError {
        var,
        value: value.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::env_lock;

    #[test]
    fn exchange_normalize_derives_arena() {
        let mut config = ExchangeConfig {
            max_arena_slots: 0,
            ..ExchangeConfig::default()
        };
        config.normalize();
        assert!(config.max_arena_slots >= 1);
        assert!(config.max_arena_slots <= 32);
    }

    #[test]
    fn spin_normalize_orders_limits() {
        let mut config = SpinConfig {
            spin_limit: 8,
            yield_limit: 2,
        };
        config.normalize();
        assert!(config.yield_limit >= config.spin_limit);
    }

    #[test]
    fn env_override_applies() {
        let _guard = env_lock();
        std::env::set_var(ENV_EXCHANGE_SPIN, "77");
        let mut config = ExchangeConfig::default();
        let result = apply_exchange_env_overrides(&mut config);
        std::env::remove_var(ENV_EXCHANGE_SPIN);
        result.expect("override should parse");
        assert_eq!(config.spin_iterations, 77);
    }

    #[test]
    fn env_override_rejects_garbage() {
        let _guard = env_lock();
        std::env::set_var(ENV_EXCHANGE_COLLISIONS, "not-a-number");
        let mut config = ExchangeConfig::default();
        let result = apply_exchange_env_overrides(&mut config);
        std::env::remove_var(ENV_EXCHANGE_COLLISIONS);
        let err = result.expect_err("garbage should be rejected");
        assert_eq!(err.var, ENV_EXCHANGE_COLLISIONS);
    }

    #[test]
    fn env_absent_leaves_defaults() {
        let _guard = env_lock();
        std::env::remove_var(ENV_SPIN_LIMIT);
        std::env::remove_var(ENV_YIELD_LIMIT);
        let mut config = SpinConfig::default();
        apply_spin_env_overrides(&mut config).expect("no overrides set");
        assert_eq!(config, SpinConfig::default());
    }
}
