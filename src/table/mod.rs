//! PMU sequence tables.
//!
//! A table describes, in physical addresses, every entity the sequencer can
//! drive and the ordered register micro-operations for each transition:
//!
//! ```text
//! PmuTable
//!   blocks    PMU register blocks to map (phys base, size)
//!   cpus      per-core  on / off / status / release
//!   clusters  per-cluster on / off / status / emulation, core span
//!   options   PMU options (e.g. L3 flush) on / off / status
//!   domains   power domains on / save / off / status
//!   lpm_init  one-time low-power-mode defaults
//!   lpms      low-power modes enter / save / exit / early_wakeup
//!   cp        modem coprocessor sequences + secure register window
//! ```
//!
//! Tables are plain data: they are loaded from TOML (or the compiled-in
//! demo table) and later resolved against an
//! [`AddressMap`](crate::device::AddressMap) by
//! [`PmuContext::new`](crate::pmucal::PmuContext::new).
//!
//! # Example
//!
//! ```
//! use pmucal::table::PmuTable;
//!
//! let table = PmuTable::builtin()?;
//! assert!(!table.cpus.is_empty());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod seq;

pub use seq::{AccessKind, SeqDesc};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::device::sim::SimModel;

/// Compiled-in demo table.
const BUILTIN_TABLE: &str = include_str!("../../tables/exynos-demo.toml");

/// Low-power modes a table may declare. A core's power-mode hint carries
/// the mode index in one byte.
pub const MAX_LPMS: usize = 0x100;

/// A PMU register block mapped at init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDesc {
    /// Block name.
    pub name: String,
    /// Physical base address.
    pub base: u64,
    /// Size in bytes.
    pub size: u64,
}

/// A CPU core or PMU option.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityDesc {
    pub name: String,
    pub on: Vec<SeqDesc>,
    pub off: Vec<SeqDesc>,
    pub status: Vec<SeqDesc>,
    /// Reset release, run before the first power-on of a core.
    pub release: Vec<SeqDesc>,
}

/// A CPU cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterDesc {
    pub name: String,
    /// First core index belonging to the cluster.
    pub first_core: usize,
    /// Last core index belonging to the cluster (inclusive).
    pub last_core: usize,
    /// May be empty when the hardware powers the cluster on its own.
    pub on: Vec<SeqDesc>,
    /// May be empty when the hardware powers the cluster off on its own.
    pub off: Vec<SeqDesc>,
    pub status: Vec<SeqDesc>,
    /// Debug emulation bit, applied on disable while requested.
    pub emulation: Vec<SeqDesc>,
}

/// A power domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainDesc {
    pub name: String,
    pub on: Vec<SeqDesc>,
    /// Registers captured before power-off and replayed after power-on.
    pub save: Vec<SeqDesc>,
    pub off: Vec<SeqDesc>,
    pub status: Vec<SeqDesc>,
    /// Secure-monitor callback id for trust-zone save/restore.
    pub secure_id: Option<u32>,
}

/// A SoC-wide low-power mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LpmDesc {
    pub name: String,
    pub enter: Vec<SeqDesc>,
    pub save: Vec<SeqDesc>,
    pub exit: Vec<SeqDesc>,
    pub early_wakeup: Vec<SeqDesc>,
}

/// Registers of the coprocessor block that sit behind the secure monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureWindowDesc {
    /// Physical base of the block holding the secure registers.
    pub base: u64,
    /// The two offsets accessed through the secure monitor.
    pub offsets: [u32; 2],
    /// SMC function identifier.
    pub function_id: u32,
}

/// The modem coprocessor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpDesc {
    pub init: Vec<SeqDesc>,
    pub status: Vec<SeqDesc>,
    pub reset_assert: Vec<SeqDesc>,
    pub reset_release: Vec<SeqDesc>,
    pub active_clear: Vec<SeqDesc>,
    pub reset_req_clear: Vec<SeqDesc>,
    pub enable_dump: Vec<SeqDesc>,
    pub disable_dump: Vec<SeqDesc>,
    pub secure: Option<SecureWindowDesc>,
}

/// A complete SoC table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PmuTable {
    pub name: String,
    #[serde(rename = "block")]
    pub blocks: Vec<BlockDesc>,
    #[serde(rename = "cpu")]
    pub cpus: Vec<EntityDesc>,
    #[serde(rename = "cluster")]
    pub clusters: Vec<ClusterDesc>,
    #[serde(rename = "option")]
    pub options: Vec<EntityDesc>,
    #[serde(rename = "domain")]
    pub domains: Vec<DomainDesc>,
    pub lpm_init: Vec<SeqDesc>,
    #[serde(rename = "lpm")]
    pub lpms: Vec<LpmDesc>,
    pub cp: Option<CpDesc>,
    /// Hardware behaviour for the simulated backend.
    pub simulation: SimModel,
}

impl PmuTable {
    /// Parse a table from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let table: PmuTable = toml::from_str(text).context("Failed to parse PMU table")?;
        table.validate()?;
        Ok(table)
    }

    /// Load a table from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let table = Self::from_toml_str(&text).with_context(|| format!("In {}", path.display()))?;
        log::info!("Loaded PMU table '{}' from {}", table.name, path.display());
        Ok(table)
    }

    /// The compiled-in demo table.
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_TABLE)
    }

    /// Check structural consistency.
    ///
    /// Hard errors: duplicate entity names, cluster spans outside the core
    /// list, more than [`MAX_LPMS`] low-power modes. Empty status arrays
    /// are only warned about, since the operation itself reports them when
    /// used.
    pub fn validate(&self) -> Result<()> {
        check_unique("cpu", self.cpus.iter().map(|c| c.name.as_str()))?;
        check_unique("cluster", self.clusters.iter().map(|c| c.name.as_str()))?;
        check_unique("option", self.options.iter().map(|o| o.name.as_str()))?;
        check_unique("domain", self.domains.iter().map(|d| d.name.as_str()))?;
        check_unique("lpm", self.lpms.iter().map(|l| l.name.as_str()))?;
        if self.lpms.len() > MAX_LPMS {
            bail!("table has {} low-power modes, at most {} are supported", self.lpms.len(), MAX_LPMS);
        }

        for cluster in &self.clusters {
            if cluster.first_core > cluster.last_core || cluster.last_core >= self.cpus.len() {
                bail!(
                    "cluster '{}' spans cores {}..={} but the table has {} cores",
                    cluster.name,
                    cluster.first_core,
                    cluster.last_core,
                    self.cpus.len()
                );
            }
            if cluster.status.is_empty() {
                log::warn!("cluster '{}' has no status sequence", cluster.name);
            }
        }
        for cpu in &self.cpus {
            if cpu.status.is_empty() {
                log::warn!("cpu '{}' has no status sequence", cpu.name);
            }
        }
        for domain in &self.domains {
            if domain.status.is_empty() {
                log::warn!("domain '{}' has no status sequence", domain.name);
            }
        }
        Ok(())
    }

    /// Total number of sequence steps in the table.
    pub fn step_count(&self) -> usize {
        let entity = |e: &EntityDesc| e.on.len() + e.off.len() + e.status.len() + e.release.len();
        let mut total: usize = self.cpus.iter().map(entity).sum();
        total += self.options.iter().map(entity).sum::<usize>();
        total += self
            .clusters
            .iter()
            .map(|c| c.on.len() + c.off.len() + c.status.len() + c.emulation.len())
            .sum::<usize>();
        total += self
            .domains
            .iter()
            .map(|d| d.on.len() + d.save.len() + d.off.len() + d.status.len())
            .sum::<usize>();
        total += self.lpm_init.len();
        total += self
            .lpms
            .iter()
            .map(|l| l.enter.len() + l.save.len() + l.exit.len() + l.early_wakeup.len())
            .sum::<usize>();
        if let Some(cp) = &self.cp {
            total += cp.sequences().iter().map(|(_, s)| s.len()).sum::<usize>();
        }
        total
    }

    /// Print a summary of the table contents.
    pub fn print_summary(&self) {
        println!("PMU Table Summary");
        println!("=================");
        println!("Name: {}", self.name);
        println!("Steps: {}", self.step_count());
        println!();
        println!("Blocks:");
        for block in &self.blocks {
            println!("  {:<16} 0x{:08X} + 0x{:X}", block.name, block.base, block.size);
        }
        println!();
        println!("CPUs: {}", self.cpus.len());
        for (i, cpu) in self.cpus.iter().enumerate() {
            println!(
                "  [{}] {:<10} on={} off={} status={} release={}",
                i,
                cpu.name,
                cpu.on.len(),
                cpu.off.len(),
                cpu.status.len(),
                cpu.release.len()
            );
        }
        println!("Clusters: {}", self.clusters.len());
        for (i, cluster) in self.clusters.iter().enumerate() {
            println!(
                "  [{}] {:<10} cores {}..={} on={} off={} status={}",
                i,
                cluster.name,
                cluster.first_core,
                cluster.last_core,
                cluster.on.len(),
                cluster.off.len(),
                cluster.status.len()
            );
        }
        println!("Options: {}", self.options.len());
        for (i, option) in self.options.iter().enumerate() {
            println!("  [{}] {}", i, option.name);
        }
        println!("Domains: {}", self.domains.len());
        for (i, domain) in self.domains.iter().enumerate() {
            let secure = domain
                .secure_id
                .map(|id| format!(" secure_id=0x{:X}", id))
                .unwrap_or_default();
            println!(
                "  [{}] {:<10} on={} save={} off={}{}",
                i,
                domain.name,
                domain.on.len(),
                domain.save.len(),
                domain.off.len(),
                secure
            );
        }
        println!("Low-power modes: {} (init steps: {})", self.lpms.len(), self.lpm_init.len());
        for (i, lpm) in self.lpms.iter().enumerate() {
            println!(
                "  [{}] {:<10} enter={} save={} exit={} early_wakeup={}",
                i,
                lpm.name,
                lpm.enter.len(),
                lpm.save.len(),
                lpm.exit.len(),
                lpm.early_wakeup.len()
            );
        }
        match &self.cp {
            Some(cp) => {
                println!("CP:");
                for (name, seq) in cp.sequences() {
                    println!("  {:<16} {} steps", name, seq.len());
                }
            }
            None => println!("CP: none"),
        }
    }
}

impl CpDesc {
    /// All coprocessor sequences with their names.
    pub fn sequences(&self) -> [(&'static str, &Vec<SeqDesc>); 8] {
        [
            ("init", &self.init),
            ("status", &self.status),
            ("reset_assert", &self.reset_assert),
            ("reset_release", &self.reset_release),
            ("active_clear", &self.active_clear),
            ("reset_req_clear", &self.reset_req_clear),
            ("enable_dump", &self.enable_dump),
            ("disable_dump", &self.disable_dump),
        ]
    }
}

fn check_unique<'a>(entity: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            bail!("duplicate {} name '{}'", entity, name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table_parses() {
        let table = PmuTable::builtin().unwrap();
        assert_eq!(table.name, "exynos-demo");
        assert_eq!(table.cpus.len(), 6);
        assert_eq!(table.clusters.len(), 2);
        assert!(table.domains.iter().any(|d| d.name == "g3d"));
        assert!(table.lpms.iter().any(|l| l.name == "sicd"));
        assert!(table.cp.is_some());
        assert!(table.step_count() > 50);
    }

    #[test]
    fn test_builtin_cluster_spans_cover_cores() {
        let table = PmuTable::builtin().unwrap();
        let covered: usize = table
            .clusters
            .iter()
            .map(|c| c.last_core - c.first_core + 1)
            .sum();
        assert_eq!(covered, table.cpus.len());
    }

    #[test]
    fn test_minimal_table() {
        let text = r#"
name = "tiny"

[[block]]
name = "pmu"
base = 0x10000000
size = 0x10000

[[cpu]]
name = "core0"
on = [ { kind = "write", name = "CPU0_CONFIG", base = 0x10000000, offset = 0x1000, mask = 0x1, value = 0x1 } ]
status = [ { kind = "read", name = "CPU0_STATUS", base = 0x10000000, offset = 0x1004, mask = 0x1 } ]
"#;
        let table = PmuTable::from_toml_str(text).unwrap();
        assert_eq!(table.blocks.len(), 1);
        assert_eq!(table.cpus[0].on[0].kind, AccessKind::Write);
        assert_eq!(table.cpus[0].status[0].mask, 0x1);
        assert!(table.cpus[0].off.is_empty());
        assert!(table.cp.is_none());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let text = r#"
name = "dup"
[[domain]]
name = "g3d"
[[domain]]
name = "g3d"
"#;
        assert!(PmuTable::from_toml_str(text).is_err());
    }

    #[test]
    fn test_cluster_span_checked() {
        let text = r#"
name = "bad"
[[cpu]]
name = "core0"
[[cluster]]
name = "cl0"
first_core = 0
last_core = 3
"#;
        let err = PmuTable::from_toml_str(text).unwrap_err();
        assert!(format!("{:#}", err).contains("cl0"));
    }

    #[test]
    fn test_lpm_count_limited() {
        let mut text = String::from("name = \"wide\"\n");
        for i in 0..MAX_LPMS {
            text.push_str(&format!("[[lpm]]\nname = \"lpm{}\"\n", i));
        }
        let table = PmuTable::from_toml_str(&text).unwrap();
        assert_eq!(table.lpms.len(), MAX_LPMS);

        text.push_str("[[lpm]]\nname = \"one_too_many\"\n");
        let err = PmuTable::from_toml_str(&text).unwrap_err();
        assert!(format!("{:#}", err).contains("257 low-power modes"));
    }
}
