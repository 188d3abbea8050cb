//! Manager configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reference-resolution bound: a chain of this many indirection hops is
/// accepted, one more fails with `TooManyReferences`.
pub const DEFAULT_MAX_REFERENCE_DEPTH: u32 = 100;

/// Initial bucket count of the identifier table.
pub const DEFAULT_TABLE_SIZE: usize = 16;

// ---------------------------------------------------------------------------
// ManagerConfig
// ---------------------------------------------------------------------------

/// Configuration controlling one reconstruction pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Correlation id stamped onto every emitted event.
    pub trace_id: String,
    pub max_reference_depth: u32,
    /// Bucket count the identifier table starts with (power of two).
    pub initial_table_size: usize,
    /// Host-imposed bound on completion sweeps; `None` means unbounded.
    pub max_completion_sweeps: Option<u64>,
    pub record_events: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            trace_id: "graph-fixup".to_string(),
            max_reference_depth: DEFAULT_MAX_REFERENCE_DEPTH,
            initial_table_size: DEFAULT_TABLE_SIZE,
            max_completion_sweeps: None,
            record_events: true,
        }
    }
}

impl ManagerConfig {
    /// Fixed trace id and event recording on, for replay comparisons.
    pub fn deterministic() -> Self {
        Self {
            trace_id: "deterministic".to_string(),
            ..Self::default()
        }
    }

    /// Bounded completion for untrusted input.
    pub fn strict() -> Self {
        Self {
            trace_id: "strict".to_string(),
            max_reference_depth: 32,
            max_completion_sweeps: Some(1024),
            ..Self::default()
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trace_id.is_empty() {
            return Err(ConfigError::EmptyTraceId);
        }
        if self.max_reference_depth == 0 {
            return Err(ConfigError::ZeroReferenceDepth);
        }
        if self.initial_table_size < 2 || !self.initial_table_size.is_power_of_two() {
            return Err(ConfigError::InvalidTableSize {
                size: self.initial_table_size,
            });
        }
        if self.max_completion_sweeps == Some(0) {
            return Err(ConfigError::ZeroSweepBudget);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigError {
    EmptyTraceId,
    ZeroReferenceDepth,
    InvalidTableSize { size: usize },
    ZeroSweepBudget,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyTraceId => write!(f, "trace_id must not be empty"),
            Self::ZeroReferenceDepth => write!(f, "max_reference_depth must be at least 1"),
            Self::InvalidTableSize { size } => {
                write!(f, "initial_table_size {size} is not a power of two >= 2")
            }
            Self::ZeroSweepBudget => write!(f, "max_completion_sweeps must be at least 1"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ManagerConfig::default();
        assert_eq!(config.max_reference_depth, 100);
        assert_eq!(config.initial_table_size, 16);
        assert!(config.validate().is_ok());
        assert!(ManagerConfig::deterministic().validate().is_ok());
        assert!(ManagerConfig::strict().validate().is_ok());
    }

    #[test]
    fn rejects_bad_table_sizes() {
        for size in [0, 1, 3, 24] {
            let config = ManagerConfig {
                initial_table_size: size,
                ..ManagerConfig::default()
            };
            assert_eq!(config.validate(), Err(ConfigError::InvalidTableSize { size }));
        }
    }

    #[test]
    fn rejects_zero_limits() {
        let depth = ManagerConfig {
            max_reference_depth: 0,
            ..ManagerConfig::default()
        };
        assert_eq!(depth.validate(), Err(ConfigError::ZeroReferenceDepth));
        let sweeps = ManagerConfig {
            max_completion_sweeps: Some(0),
            ..ManagerConfig::default()
        };
        assert_eq!(sweeps.validate(), Err(ConfigError::ZeroSweepBudget));
        let trace = ManagerConfig::default().with_trace_id("");
        assert_eq!(trace.validate(), Err(ConfigError::EmptyTraceId));
    }

    #[test]
    fn serde_round_trip() {
        let config = ManagerConfig::strict();
        let json = serde_json::to_string(&config).unwrap();
        let back: ManagerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
