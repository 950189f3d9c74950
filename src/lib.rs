//! pmucal library
//!
//! Table-driven PMU sequencer: power CPU cores, clusters, power domains and
//! a modem coprocessor, and enter/exit SoC low-power modes, by interpreting
//! ordered register micro-operations against a register backend.

pub mod config;
pub mod device;
pub mod error;
pub mod pmucal;
pub mod table;

pub use error::{ConfigError, PmucalError, Result};
