//! Hardware access layer.
//!
//! This module provides:
//! - The [`RegisterBackend`] and [`SecureMonitor`] capability traits
//! - The Address Resolution Table ([`AddressMap`]) built once at init
//! - A simulated PMU for tests and the CLI ([`SimulatedPmu`], [`SimulatedMonitor`])
//! - A `/dev/mem` backend for real boards ([`DevMemBackend`])
//!
//! # Address Model
//!
//! ```text
//!   table (physical)          AddressMap              backend (mapped)
//!   base_pa + offset   --->   block lookup   --->   mapped_base + offset
//!                                                     |
//!                          offset < 0x4000:           +-- offset | 0xC000  atomic set
//!                                                     +-- offset | 0x8000  atomic clear
//! ```

pub mod backend;
pub mod devmem;
pub mod map;
pub mod sim;

pub use backend::{NoSecureMonitor, RegisterBackend, SecureMonitor, SMC_NOT_SUPPORTED};
pub use devmem::DevMemBackend;
pub use map::{AddressMap, MappedBlock, RegAddr};
pub use sim::{Access, SimModel, SimulatedMonitor, SimulatedPmu, SmcCall};
