//! CPU core, cluster and PMU option control.
//!
//! Cores and options share one descriptor shape (on / off / status, plus
//! a release array for cores). Clusters own a contiguous span of cores and
//! may have empty on/off arrays when the hardware powers them on its own
//! once the last member core goes down.
//!
//! Power-mode hints: enabling a core clears its hint; disabling a core
//! publishes [`PowerMode::CoreOff`] *before* the off sequence runs, so an
//! observer sees the target state even if the core stops mid-sequence.

use std::ops::RangeInclusive;

use super::rae::{resolve_seq, status_matches, Rae, SeqStep};
use super::{lookup, require, resolve_all, PmuContext, PowerMode, Resolved};
use crate::device::{AddressMap, RegisterBackend, SecureMonitor};
use crate::error::Result;
use crate::table::{ClusterDesc, EntityDesc, PmuTable};

/// Resolved core or option.
#[derive(Debug)]
pub(crate) struct EntitySeqs {
    pub name: String,
    pub on: Vec<SeqStep>,
    pub off: Vec<SeqStep>,
    pub status: Vec<SeqStep>,
    pub release: Vec<SeqStep>,
}

impl EntitySeqs {
    fn resolve(desc: &EntityDesc, map: &AddressMap) -> Result<Self> {
        Ok(Self {
            name: desc.name.clone(),
            on: resolve_seq(&desc.on, map)?,
            off: resolve_seq(&desc.off, map)?,
            status: resolve_seq(&desc.status, map)?,
            release: resolve_seq(&desc.release, map)?,
        })
    }
}

/// Resolved cluster.
#[derive(Debug)]
pub(crate) struct ClusterSeqs {
    pub name: String,
    pub on: Vec<SeqStep>,
    pub off: Vec<SeqStep>,
    pub status: Vec<SeqStep>,
    pub emulation: Vec<SeqStep>,
    /// Outstanding emulation requests.
    pub emulation_refs: u32,
}

impl ClusterSeqs {
    fn resolve(desc: &ClusterDesc, map: &AddressMap) -> Result<Self> {
        Ok(Self {
            name: desc.name.clone(),
            on: resolve_seq(&desc.on, map)?,
            off: resolve_seq(&desc.off, map)?,
            status: resolve_seq(&desc.status, map)?,
            emulation: resolve_seq(&desc.emulation, map)?,
            emulation_refs: 0,
        })
    }
}

/// Cores, clusters and options of one table.
#[derive(Debug, Default)]
pub(crate) struct CpuTables {
    cores: Vec<Resolved<EntitySeqs>>,
    clusters: Vec<Resolved<ClusterSeqs>>,
    options: Vec<Resolved<EntitySeqs>>,
    /// Core span of each cluster, kept even for unusable clusters.
    spans: Vec<RangeInclusive<usize>>,
}

impl CpuTables {
    pub fn resolve(table: &PmuTable, map: &AddressMap) -> Self {
        Self {
            cores: resolve_all(&table.cpus, "cpu", |d| &d.name, |d| EntitySeqs::resolve(d, map)),
            clusters: resolve_all(&table.clusters, "cluster", |d| &d.name, |d| ClusterSeqs::resolve(d, map)),
            options: resolve_all(&table.options, "option", |d| &d.name, |d| EntitySeqs::resolve(d, map)),
            spans: table.clusters.iter().map(|c| c.first_core..=c.last_core).collect(),
        }
    }
}

/// Run a status sequence and apply the all-steps-match rule.
fn query<B: RegisterBackend, S: SecureMonitor>(rae: &mut Rae<B, S>, seq: &mut [SeqStep]) -> Result<bool> {
    rae.execute(seq)?;
    Ok(status_matches(seq))
}

impl<B: RegisterBackend, S: SecureMonitor> PmuContext<B, S> {
    /// Number of cores in the table.
    pub fn num_cores(&self) -> usize {
        self.cpu.cores.len()
    }

    /// Number of clusters in the table.
    pub fn num_clusters(&self) -> usize {
        self.cpu.clusters.len()
    }

    /// Number of PMU options in the table.
    pub fn num_options(&self) -> usize {
        self.cpu.options.len()
    }

    /// Power a core on.
    pub fn core_enable(&mut self, core: usize) -> Result<()> {
        let entry = lookup(&mut self.cpu.cores, "cpu", core)?;
        let seq = require(&mut entry.on, "cpu", core, "on")?;
        self.hints.set(core, PowerMode::Active);
        log::debug!("core {} ({}) on", core, entry.name);
        self.rae.execute(seq)
    }

    /// Power a core off.
    pub fn core_disable(&mut self, core: usize) -> Result<()> {
        let entry = lookup(&mut self.cpu.cores, "cpu", core)?;
        let seq = require(&mut entry.off, "cpu", core, "off")?;
        self.hints.set(core, PowerMode::CoreOff);
        log::debug!("core {} ({}) off", core, entry.name);
        self.rae.execute(seq)
    }

    /// Query whether a core is powered.
    pub fn core_is_enabled(&mut self, core: usize) -> Result<bool> {
        let entry = lookup(&mut self.cpu.cores, "cpu", core)?;
        let seq = require(&mut entry.status, "cpu", core, "status")?;
        query(&mut self.rae, seq)
    }

    /// Release a core from reset ahead of its first power-on.
    pub fn core_release(&mut self, core: usize) -> Result<()> {
        let entry = lookup(&mut self.cpu.cores, "cpu", core)?;
        let seq = require(&mut entry.release, "cpu", core, "release")?;
        log::debug!("core {} ({}) release", core, entry.name);
        self.rae.execute(seq)
    }

    /// Power a cluster on. An empty on array is a no-op.
    pub fn cluster_enable(&mut self, cluster: usize) -> Result<()> {
        let entry = lookup(&mut self.cpu.clusters, "cluster", cluster)?;
        if entry.on.is_empty() {
            log::trace!("cluster {} ({}) on: hardware managed", cluster, entry.name);
            return Ok(());
        }
        log::debug!("cluster {} ({}) on", cluster, entry.name);
        self.rae.execute(&mut entry.on)
    }

    /// Power a cluster off, forcing the emulation bit first while requested.
    /// An empty off array is a no-op.
    pub fn cluster_disable(&mut self, cluster: usize) -> Result<()> {
        let entry = lookup(&mut self.cpu.clusters, "cluster", cluster)?;
        if entry.emulation_refs > 0 && !entry.emulation.is_empty() {
            log::debug!(
                "cluster {} ({}) emulation ({} requests)",
                cluster,
                entry.name,
                entry.emulation_refs
            );
            self.rae.execute(&mut entry.emulation)?;
        }
        if entry.off.is_empty() {
            log::trace!("cluster {} ({}) off: hardware managed", cluster, entry.name);
            return Ok(());
        }
        log::debug!("cluster {} ({}) off", cluster, entry.name);
        self.rae.execute(&mut entry.off)
    }

    /// Query whether a cluster is powered.
    pub fn cluster_is_enabled(&mut self, cluster: usize) -> Result<bool> {
        let entry = lookup(&mut self.cpu.clusters, "cluster", cluster)?;
        let seq = require(&mut entry.status, "cluster", cluster, "status")?;
        query(&mut self.rae, seq)
    }

    /// Add (`enabled`) or drop a request to force emulation on the next
    /// cluster disable. Bookkeeping only, no register access.
    pub fn cluster_request_emulation(&mut self, cluster: usize, enabled: bool) -> Result<()> {
        let entry = lookup(&mut self.cpu.clusters, "cluster", cluster)?;
        if enabled {
            entry.emulation_refs = entry.emulation_refs.saturating_add(1);
        } else if entry.emulation_refs == 0 {
            log::warn!("cluster {} ({}): emulation release without request", cluster, entry.name);
        } else {
            entry.emulation_refs -= 1;
        }
        Ok(())
    }

    /// Outstanding emulation requests of a cluster.
    pub fn cluster_emulation_requests(&mut self, cluster: usize) -> Result<u32> {
        Ok(lookup(&mut self.cpu.clusters, "cluster", cluster)?.emulation_refs)
    }

    /// Cluster owning a core.
    pub fn cluster_of(&self, core: usize) -> Option<usize> {
        self.cpu.spans.iter().position(|span| span.contains(&core))
    }

    /// Cores of a cluster.
    pub fn cluster_cores(&self, cluster: usize) -> Option<RangeInclusive<usize>> {
        self.cpu.spans.get(cluster).cloned()
    }

    /// Turn a PMU option on.
    pub fn option_enable(&mut self, option: usize) -> Result<()> {
        let entry = lookup(&mut self.cpu.options, "option", option)?;
        let seq = require(&mut entry.on, "option", option, "on")?;
        log::debug!("option {} ({}) on", option, entry.name);
        self.rae.execute(seq)
    }

    /// Turn a PMU option off.
    pub fn option_disable(&mut self, option: usize) -> Result<()> {
        let entry = lookup(&mut self.cpu.options, "option", option)?;
        let seq = require(&mut entry.off, "option", option, "off")?;
        log::debug!("option {} ({}) off", option, entry.name);
        self.rae.execute(seq)
    }

    /// Query a PMU option.
    pub fn option_is_enabled(&mut self, option: usize) -> Result<bool> {
        let entry = lookup(&mut self.cpu.options, "option", option)?;
        let seq = require(&mut entry.status, "option", option, "status")?;
        query(&mut self.rae, seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{NoSecureMonitor, SimulatedPmu};
    use crate::error::{ConfigError, PmucalError};
    use crate::pmucal::PollConfig;
    use crate::table::{AccessKind, BlockDesc, SeqDesc};

    const PMU: u64 = 0x1586_0000;

    fn w(name: &str, offset: u32, mask: u32, value: u32) -> SeqDesc {
        SeqDesc::simple(AccessKind::Write, name, PMU, offset, mask, value)
    }

    fn r(name: &str, offset: u32, mask: u32) -> SeqDesc {
        SeqDesc::simple(AccessKind::Read, name, PMU, offset, mask, 0)
    }

    fn core(i: u32) -> EntityDesc {
        let config = 0x1000 + 0x80 * i;
        EntityDesc {
            name: format!("core{}", i),
            on: vec![w("CONFIGURATION", config, 0x1, 0x1)],
            off: vec![w("CONFIGURATION", config, 0x1, 0x0)],
            status: vec![r("STATUS", config + 4, 0x1)],
            release: vec![SeqDesc::simple(AccessKind::SetBitAtomic, "OPTION", PMU, config + 8, 0, 0x1)],
        }
    }

    fn table() -> PmuTable {
        PmuTable {
            name: "cpu-test".to_string(),
            blocks: vec![BlockDesc {
                name: "pmu".to_string(),
                base: PMU,
                size: 0x1_0000,
            }],
            cpus: (0..4).map(core).collect(),
            clusters: vec![
                ClusterDesc {
                    name: "cl0".to_string(),
                    first_core: 0,
                    last_core: 1,
                    status: vec![r("CL0_STATUS", 0x1204, 0x1)],
                    ..ClusterDesc::default()
                },
                ClusterDesc {
                    name: "cl1".to_string(),
                    first_core: 2,
                    last_core: 3,
                    on: vec![w("CL1_CONFIG", 0x1300, 0x1, 0x1)],
                    off: vec![w("CL1_CONFIG", 0x1300, 0x1, 0x0)],
                    status: vec![r("CL1_STATUS", 0x1304, 0x1), r("CL1_STATES", 0x1308, 0x3)],
                    emulation: vec![w("CL1_EMULATION", 0x1310, 0x1, 0x1)],
                },
            ],
            options: vec![EntityDesc {
                name: "l3flush".to_string(),
                on: vec![w("L3_FLUSH", 0x1400, 0x1, 0x1)],
                off: vec![w("L3_FLUSH", 0x1400, 0x1, 0x0)],
                status: vec![r("L3_FLUSH", 0x1400, 0x1)],
                ..EntityDesc::default()
            }],
            ..PmuTable::default()
        }
    }

    fn context() -> PmuContext<SimulatedPmu> {
        let mut sim = SimulatedPmu::new();
        for i in 0..4u64 {
            let config = PMU + 0x1000 + 0x80 * i;
            sim.add_mirror(config, config + 4, 0x1);
        }
        sim.add_mirror(PMU + 0x1300, PMU + 0x1304, 0x1);
        PmuContext::new(sim, NoSecureMonitor, &table(), PollConfig::fast()).unwrap()
    }

    #[test]
    fn test_core_on_off() {
        let mut pmu = context();
        pmu.core_enable(2).unwrap();
        assert!(pmu.core_is_enabled(2).unwrap());
        assert!(!pmu.core_is_enabled(3).unwrap());
        pmu.core_disable(2).unwrap();
        assert!(!pmu.core_is_enabled(2).unwrap());
    }

    #[test]
    fn test_core_hints() {
        let mut pmu = context();
        pmu.core_disable(1).unwrap();
        assert_eq!(pmu.hint(1), Some(PowerMode::CoreOff));
        pmu.core_enable(1).unwrap();
        assert_eq!(pmu.hint(1), Some(PowerMode::Active));
    }

    #[test]
    fn test_core_disable_sets_hint_even_when_off_fails() {
        let mut t = table();
        t.cpus[0].off = vec![SeqDesc::simple(AccessKind::Wait, "NEVER", PMU, 0x1FF0, 0x1, 0x1)];
        let mut pmu = PmuContext::new(SimulatedPmu::new(), NoSecureMonitor, &t, PollConfig::fast()).unwrap();
        assert!(pmu.core_disable(0).unwrap_err().is_timeout());
        assert_eq!(pmu.hint(0), Some(PowerMode::CoreOff));
    }

    #[test]
    fn test_out_of_range_touches_nothing() {
        let mut pmu = context();
        let err = pmu.core_enable(4).unwrap_err();
        assert_eq!(
            err,
            PmucalError::Config(ConfigError::IndexOutOfRange {
                entity: "cpu",
                index: 4,
                count: 4
            })
        );
        assert!(pmu.backend().log().is_empty());
        assert!(pmu.cluster_disable(7).is_err());
        assert!(pmu.option_is_enabled(1).is_err());
    }

    #[test]
    fn test_missing_array_is_config_error() {
        let mut t = table();
        t.cpus[1].off.clear();
        let mut pmu = PmuContext::new(SimulatedPmu::new(), NoSecureMonitor, &t, PollConfig::fast()).unwrap();
        assert_eq!(
            pmu.core_disable(1).unwrap_err(),
            PmucalError::Config(ConfigError::MissingSequence {
                entity: "cpu",
                index: 1,
                op: "off"
            })
        );
        // No hint published for an operation that never started.
        assert_eq!(pmu.hint(1), Some(PowerMode::Active));
    }

    #[test]
    fn test_core_release_uses_atomic_set() {
        let mut pmu = context();
        pmu.core_release(1).unwrap();
        assert_eq!(pmu.backend().written_addresses(), vec![PMU + 0xD088]);
        assert_eq!(pmu.backend().peek(PMU + 0x1088), 0x1);
    }

    #[test]
    fn test_hardware_managed_cluster_is_noop() {
        let mut pmu = context();
        pmu.cluster_enable(0).unwrap();
        pmu.cluster_disable(0).unwrap();
        assert!(pmu.backend().written_addresses().is_empty());
    }

    #[test]
    fn test_cluster_status_needs_every_step() {
        let mut pmu = context();
        pmu.cluster_enable(1).unwrap();
        assert!(!pmu.cluster_is_enabled(1).unwrap());
        pmu.backend_mut().poke(PMU + 0x1308, 0x3);
        assert!(pmu.cluster_is_enabled(1).unwrap());
        pmu.cluster_disable(1).unwrap();
        assert!(!pmu.cluster_is_enabled(1).unwrap());
    }

    #[test]
    fn test_cluster_emulation_requests() {
        let mut pmu = context();
        pmu.cluster_disable(1).unwrap();
        assert_eq!(pmu.backend().peek(PMU + 0x1310), 0);

        pmu.cluster_request_emulation(1, true).unwrap();
        pmu.cluster_request_emulation(1, true).unwrap();
        pmu.cluster_request_emulation(1, false).unwrap();
        assert_eq!(pmu.cluster_emulation_requests(1).unwrap(), 1);
        pmu.cluster_disable(1).unwrap();
        assert_eq!(pmu.backend().peek(PMU + 0x1310), 1);

        pmu.cluster_request_emulation(1, false).unwrap();
        pmu.cluster_request_emulation(1, false).unwrap();
        assert_eq!(pmu.cluster_emulation_requests(1).unwrap(), 0);
    }

    #[test]
    fn test_topology() {
        let pmu = context();
        assert_eq!(pmu.cluster_of(0), Some(0));
        assert_eq!(pmu.cluster_of(3), Some(1));
        assert_eq!(pmu.cluster_of(9), None);
        assert_eq!(pmu.cluster_cores(1), Some(2..=3));
    }

    #[test]
    fn test_option() {
        let mut pmu = context();
        assert!(!pmu.option_is_enabled(0).unwrap());
        pmu.option_enable(0).unwrap();
        assert!(pmu.option_is_enabled(0).unwrap());
        pmu.option_disable(0).unwrap();
        assert!(!pmu.option_is_enabled(0).unwrap());
    }
}
