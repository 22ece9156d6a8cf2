//! Throttle specifications.
//!
//! A [`ThrottleSpec`] answers the three limit queries for any bin name. The
//! spec attached to a group can be replaced live; `poll` pushes the current
//! answers into every existing bin. Queries are fallible because specs are
//! caller-supplied collaborators (they may consult config stores that can
//! reject a bin); a failed query aborts the operation that needed it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use cg_common::BinLimits;
use crate::error::ThrottleError;
use crate::Result;

/// Caller-supplied limit source, queried per bin name.
pub trait ThrottleSpec: Send + Sync {
    fn max_open_connections(&self, bin: &str) -> anyhow::Result<u32>;
    fn min_ms_between_fetches(&self, bin: &str) -> anyhow::Result<u64>;
    fn min_ms_per_byte(&self, bin: &str) -> anyhow::Result<f64>;
}

/// Spec that never throttles anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedSpec;

impl ThrottleSpec for UnlimitedSpec {
    fn max_open_connections(&self, _bin: &str) -> anyhow::Result<u32> {
        Ok(u32::MAX)
    }

    fn min_ms_between_fetches(&self, _bin: &str) -> anyhow::Result<u64> {
        Ok(0)
    }

    fn min_ms_per_byte(&self, _bin: &str) -> anyhow::Result<f64> {
        Ok(0.0)
    }
}

/// Fixed per-bin limit table with a default for unnamed bins.
///
/// Deserializable from TOML:
///
/// ```toml
/// [default]
/// max_open_connections = 4
///
/// [bins."example.com"]
/// max_open_connections = 2
/// min_ms_between_fetches = 500
/// min_ms_per_byte = 0.5
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StaticThrottleSpec {
    default: BinLimits,
    bins: HashMap<String, BinLimits>,
}

impl StaticThrottleSpec {
    pub fn new(default: BinLimits) -> Self {
        Self {
            default,
            bins: HashMap::new(),
        }
    }

    /// Add or replace the limits for one bin.
    pub fn with_bin(mut self, bin: impl Into<String>, limits: BinLimits) -> Self {
        self.bins.insert(bin.into(), limits);
        self
    }

    /// Parse a spec from a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let spec: Self = toml::from_str(raw)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Load a spec from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Wrap in the `Arc<dyn ThrottleSpec>` form the throttler consumes.
    pub fn into_shared(self) -> Arc<dyn ThrottleSpec> {
        Arc::new(self)
    }

    fn limits_for(&self, bin: &str) -> &BinLimits {
        self.bins.get(bin).unwrap_or(&self.default)
    }

    fn validate(&self) -> Result<()> {
        for (bin, limits) in
            std::iter::once(("<default>", &self.default)).chain(self.bins.iter().map(|(k, v)| (k.as_str(), v)))
        {
            if !limits.min_ms_per_byte.is_finite() || limits.min_ms_per_byte < 0.0 {
                return Err(ThrottleError::Validation(format!(
                    "bin [{}]: min_ms_per_byte must be finite and non-negative, got {}",
                    bin, limits.min_ms_per_byte
                )));
            }
        }
        Ok(())
    }
}

impl ThrottleSpec for StaticThrottleSpec {
    fn max_open_connections(&self, bin: &str) -> anyhow::Result<u32> {
        Ok(self.limits_for(bin).max_open_connections)
    }

    fn min_ms_between_fetches(&self, bin: &str) -> anyhow::Result<u64> {
        Ok(self.limits_for(bin).min_ms_between_fetches)
    }

    fn min_ms_per_byte(&self, bin: &str) -> anyhow::Result<f64> {
        Ok(self.limits_for(bin).min_ms_per_byte)
    }
}
