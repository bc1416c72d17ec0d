//! Worker identity from the launch environment.
//!
//! # Environment Variables
//!
//! The launcher uses the standard distributed launch variables:
//! - `RANK`: Global rank of this process (0..WORLD_SIZE)
//! - `WORLD_SIZE`: Total number of processes
//! - `LOCAL_RANK`: Local rank on this node (for multi-node setups)
//!
//! # Usage
//!
//! ```ignore
//! use dit_parallel_core::distributed::{DistributedConfig, LocalGroupCoordinator};
//!
//! let config = DistributedConfig::from_env();
//! let coordinator = LocalGroupCoordinator::new(config.rank, config.world_size);
//! ```

use std::env;

use super::error::{DistributedError, Result};

/// Distributed configuration from environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedConfig {
    /// Global rank of this process.
    pub rank: usize,
    /// Total number of processes.
    pub world_size: usize,
    /// Local rank on this node.
    pub local_rank: usize,
}

impl DistributedConfig {
    /// Create from environment variables.
    ///
    /// Falls back to single-process defaults if not set or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| lookup(key).and_then(|s| s.trim().parse::<usize>().ok());

        let rank = parse("RANK").unwrap_or(0);
        let world_size = parse("WORLD_SIZE").unwrap_or(1);
        let local_rank = parse("LOCAL_RANK").unwrap_or(rank);

        Self {
            rank,
            world_size,
            local_rank,
        }
    }

    /// Configuration for a single process.
    pub fn single_process() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
        }
    }

    /// Check that the rank fits the world.
    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 || self.rank >= self.world_size {
            return Err(DistributedError::InvalidRank {
                rank: self.rank,
                world_size: self.world_size,
            });
        }
        Ok(())
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self::single_process()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_single_process() {
        let cfg = DistributedConfig::from_lookup(lookup_from(&[]));
        assert_eq!(cfg, DistributedConfig::single_process());
    }

    #[test]
    fn reads_launch_variables() {
        let cfg = DistributedConfig::from_lookup(lookup_from(&[
            ("RANK", "3"),
            ("WORLD_SIZE", "4"),
            ("LOCAL_RANK", "1"),
        ]));
        assert_eq!(cfg.rank, 3);
        assert_eq!(cfg.world_size, 4);
        assert_eq!(cfg.local_rank, 1);
        cfg.validate().unwrap();
    }

    #[test]
    fn local_rank_falls_back_to_rank() {
        let cfg = DistributedConfig::from_lookup(lookup_from(&[("RANK", "2"), ("WORLD_SIZE", "3")]));
        assert_eq!(cfg.local_rank, 2);
    }

    #[test]
    fn garbage_values_use_defaults() {
        let cfg = DistributedConfig::from_lookup(lookup_from(&[("RANK", "x"), ("WORLD_SIZE", "")]));
        assert_eq!(cfg.rank, 0);
        assert_eq!(cfg.world_size, 1);
    }

    #[test]
    fn validate_rejects_rank_outside_world() {
        let cfg = DistributedConfig {
            rank: 4,
            world_size: 4,
            local_rank: 0,
        };
        assert!(matches!(
            cfg.validate(),
            Err(DistributedError::InvalidRank {
                rank: 4,
                world_size: 4
            })
        ));
    }
}
