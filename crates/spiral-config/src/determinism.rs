// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use rand::{rngs::StdRng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

const DEFAULT_SEED: u64 = 42;

/// Seeding policy used when layers draw initial weights or dropout masks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeterminismConfig {
    /// Whether every RNG is derived from `base_seed`.
    pub enabled: bool,
    /// Seed that per-layer seeds are hashed from.
    pub base_seed: u64,
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_seed: DEFAULT_SEED,
        }
    }
}

impl DeterminismConfig {
    /// Deterministic configuration pinned to `seed`.
    pub fn seeded(seed: u64) -> Self {
        Self {
            enabled: true,
            base_seed: seed,
        }
    }

    /// Reads `SPIRAL_DETERMINISTIC` and `SPIRAL_DETERMINISTIC_SEED`.
    pub fn from_env() -> Self {
        let enabled = std::env::var("SPIRAL_DETERMINISTIC")
            .ok()
            .map(|v| parse_flag(&v))
            .unwrap_or(false);
        let base_seed = std::env::var("SPIRAL_DETERMINISTIC_SEED")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_SEED);
        Self { enabled, base_seed }
    }

    /// Stable seed for a layer label such as `"block0::weight"`.
    pub fn seed_for<L: Hash>(&self, label: L) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.base_seed.hash(&mut hasher);
        label.hash(&mut hasher);
        hasher.finish()
    }

    /// RNG for `label`; falls back to OS entropy when determinism is off.
    pub fn rng_for(&self, label: &str) -> StdRng {
        if self.enabled {
            StdRng::seed_from_u64(self.seed_for(label))
        } else {
            StdRng::from_entropy()
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    !matches!(
        raw.trim(),
        "" | "0" | "false" | "False" | "FALSE" | "off" | "OFF"
    )
}

static CONFIG: OnceLock<DeterminismConfig> = OnceLock::new();

/// Process-wide configuration, read from the environment on first use.
pub fn config() -> &'static DeterminismConfig {
    CONFIG.get_or_init(DeterminismConfig::from_env)
}

/// Installs `cfg` unless a configuration was already read. Returns the active one.
pub fn configure(cfg: DeterminismConfig) -> &'static DeterminismConfig {
    CONFIG.get_or_init(|| cfg)
}

/// RNG derived from `label` under the process configuration.
pub fn rng_from_label(label: &str) -> StdRng {
    config().rng_for(label)
}

/// Explicit seeds win; otherwise defer to [`rng_from_label`].
pub fn rng_from_optional(seed: Option<u64>, label: &str) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(value),
        None => rng_from_label(label),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn flags_parse_textual_values() {
        assert!(parse_flag("1"));
        assert!(parse_flag("on"));
        assert!(!parse_flag("off"));
        assert!(!parse_flag(" false "));
    }

    #[test]
    fn seeded_config_derives_stable_label_seeds() {
        let cfg = DeterminismConfig::seeded(99);
        assert_eq!(cfg.seed_for("block::weight"), cfg.seed_for("block::weight"));
        assert_ne!(cfg.seed_for("block::weight"), cfg.seed_for("block::bias"));
    }

    #[test]
    fn seeded_rngs_replay() {
        let cfg = DeterminismConfig::seeded(7);
        let a: f32 = cfg.rng_for("dropout").gen();
        let b: f32 = cfg.rng_for("dropout").gen();
        assert_eq!(a, b);
    }

    #[test]
    fn explicit_seed_overrides_label() {
        let a: u64 = rng_from_optional(Some(5), "x").gen();
        let b: u64 = rng_from_optional(Some(5), "y").gen();
        assert_eq!(a, b);
    }
}
