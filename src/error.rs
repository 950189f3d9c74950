//! Error types for the PMU sequencer.
//!
//! Every controller operation returns [`PmucalError`]. Nothing is swallowed
//! inside the register access engine: a partially executed sequence is never
//! rolled back, the error simply tells the caller where it stopped.

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T, E = PmucalError> = std::result::Result<T, E>;

/// Configuration problems detected before any register is touched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Entity index is past the end of its table.
    #[error("{entity} index {index} out of range ({count} entries)")]
    IndexOutOfRange {
        /// Entity class ("cpu", "cluster", "domain", ...).
        entity: &'static str,
        /// Requested index.
        index: usize,
        /// Number of entries in the table.
        count: usize,
    },

    /// The entity has no sequence for the requested operation.
    #[error("{entity} {index} has no '{op}' sequence")]
    MissingSequence {
        /// Entity class.
        entity: &'static str,
        /// Entity index.
        index: usize,
        /// Operation name ("on", "off", "status", ...).
        op: &'static str,
    },

    /// No entity with the given name.
    #[error("no {entity} named '{name}'")]
    UnknownName {
        /// Entity class.
        entity: &'static str,
        /// Requested name.
        name: String,
    },

    /// A step's access kind needs an operand the table did not provide.
    #[error("step '{label}' has no {operand} register")]
    MissingOperand {
        /// Step label.
        label: String,
        /// "target" or "condition".
        operand: &'static str,
    },

    /// The table declares more entities of a class than can be addressed.
    #[error("{count} {entity} entries, at most {max} supported")]
    TooMany {
        /// Entity class.
        entity: &'static str,
        /// Entries in the table.
        count: usize,
        /// Addressable entries.
        max: usize,
    },
}

/// Errors returned by the sequencer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PmucalError {
    /// Bad index, missing sequence or malformed step.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A step references a physical address outside every mapped block.
    #[error("step '{label}': physical address 0x{phys:08X} is not mapped")]
    AddressResolution {
        /// Step label.
        label: String,
        /// Unresolved physical address.
        phys: u64,
    },

    /// A polling step ran out of iterations.
    #[error("timeout at step {index} '{label}' (register 0x{addr:08X})")]
    Timeout {
        /// Index of the failing step within its sequence.
        index: usize,
        /// Step label.
        label: String,
        /// Physical address of the polled register.
        addr: u64,
    },

    /// The secure monitor returned a nonzero status.
    #[error("secure monitor call 0x{function_id:08X} failed with status 0x{status:X}")]
    SecureCall {
        /// SMC function identifier.
        function_id: u32,
        /// Status reported by the monitor.
        status: u64,
    },
}

impl PmucalError {
    /// True for polling timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PmucalError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_converts() {
        let err: PmucalError = ConfigError::IndexOutOfRange {
            entity: "cpu",
            index: 9,
            count: 8,
        }
        .into();
        assert_eq!(err.to_string(), "cpu index 9 out of range (8 entries)");
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_timeout_message() {
        let err = PmucalError::Timeout {
            index: 2,
            label: "CPU0_STATUS".to_string(),
            addr: 0x1586_1004,
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "timeout at step 2 'CPU0_STATUS' (register 0x15861004)");
    }
}
