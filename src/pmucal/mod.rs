//! PMU sequencer core.
//!
//! [`PmuContext`] ties everything together: the register access engine,
//! the address map built at init, the per-core power-mode hints and the
//! resolved sequences of every entity in a [`PmuTable`]. The controllers
//! live in their own modules and add their operations to the context:
//!
//! | Module     | Operations                                                      |
//! |------------|-----------------------------------------------------------------|
//! | [`cpu`]    | `core_*`, `cluster_*`, `option_*`                               |
//! | [`local`]  | `pd_*` (power domains with save/restore)                        |
//! | [`system`] | `lpm_*` and `system_init`                                       |
//! | [`cp`]     | `cp_*` (modem coprocessor, secure register window)              |
//!
//! # Lifecycle
//!
//! ```text
//! PmuTable (physical)  --new()-->  map blocks  -->  resolve entities  -->  lpm_init
//!                                                        |
//!                                        unresolvable entity: kept, but every
//!                                        operation on it returns the error
//! ```
//!
//! # Example
//!
//! ```
//! use pmucal::device::{SimulatedMonitor, SimulatedPmu};
//! use pmucal::pmucal::{PmuContext, PollConfig};
//! use pmucal::table::PmuTable;
//!
//! let table = PmuTable::builtin()?;
//! let sim = SimulatedPmu::with_model(&table.simulation);
//! let monitor = SimulatedMonitor::new(table.cp.as_ref().and_then(|c| c.secure.as_ref()).map_or(0, |s| s.function_id));
//! let mut pmu = PmuContext::new(sim, monitor, &table, PollConfig::default())?;
//!
//! pmu.core_enable(1)?;
//! assert!(pmu.core_is_enabled(1)?);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod cp;
pub mod cpu;
pub mod local;
pub mod rae;
pub mod system;

pub use cp::{CpSeq, SecureWindow, SMC_CP_FUNCTION_ID, SMC_CP_READ, SMC_CP_WRITE};
pub use local::{DomainState, PD_SMC_FUNCTION_ID, PD_SMC_RESTORE, PD_SMC_SAVE, PD_SMC_TZPC_GROUP};
pub use rae::{dump_saved, resolve_seq, status_matches, PollBudget, PollConfig, Rae, RaeStats, SeqStep, SMC_EXT_FUNCTION_ID};

use std::sync::atomic::{AtomicU32, Ordering};

use crate::device::{AddressMap, NoSecureMonitor, RegisterBackend, SecureMonitor};
use crate::error::{ConfigError, PmucalError, Result};
use crate::table::PmuTable;

/// An entity resolved at init, or the error that made it unusable.
pub(crate) type Resolved<T> = std::result::Result<T, PmucalError>;

/// Look up a usable entity.
pub(crate) fn lookup<'a, T>(entries: &'a mut [Resolved<T>], entity: &'static str, index: usize) -> Result<&'a mut T> {
    let count = entries.len();
    match entries.get_mut(index) {
        None => Err(ConfigError::IndexOutOfRange { entity, index, count }.into()),
        Some(Ok(entry)) => Ok(entry),
        Some(Err(e)) => Err(e.clone()),
    }
}

/// Require a non-empty sequence for an operation.
pub(crate) fn require<'a>(
    seq: &'a mut Vec<SeqStep>,
    entity: &'static str,
    index: usize,
    op: &'static str,
) -> Result<&'a mut Vec<SeqStep>> {
    if seq.is_empty() {
        return Err(ConfigError::MissingSequence { entity, index, op }.into());
    }
    Ok(seq)
}

/// Resolve every entity of a list, logging the ones that cannot be used.
pub(crate) fn resolve_all<D, T>(
    descs: &[D],
    entity: &str,
    name: impl Fn(&D) -> &str,
    resolve: impl Fn(&D) -> Result<T>,
) -> Vec<Resolved<T>> {
    descs
        .iter()
        .map(|d| {
            let resolved = resolve(d);
            if let Err(e) = &resolved {
                log::error!("{} '{}' is unusable: {}", entity, name(d), e);
            }
            resolved
        })
        .collect()
}

/// Power mode a core is about to enter (or is in).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerMode {
    /// Running, no transition pending.
    #[default]
    Active,
    /// Core power-down.
    CoreOff,
    /// SoC low-power mode with the given index.
    System(u32),
}

impl PowerMode {
    const CORE_OFF: u32 = 0x1;
    const SYSTEM: u32 = 0x100;

    /// Low-power modes a slot can name; the index lives in the low byte.
    pub const MAX_SYSTEM_MODES: usize = crate::table::MAX_LPMS;

    /// Raw slot encoding.
    pub fn encode(self) -> u32 {
        match self {
            PowerMode::Active => 0,
            PowerMode::CoreOff => Self::CORE_OFF,
            PowerMode::System(mode) => Self::SYSTEM | (mode & 0xFF),
        }
    }

    /// Decode a raw slot value.
    pub fn decode(raw: u32) -> Self {
        if raw & Self::SYSTEM != 0 {
            PowerMode::System(raw & 0xFF)
        } else if raw == Self::CORE_OFF {
            PowerMode::CoreOff
        } else {
            PowerMode::Active
        }
    }
}

/// Per-core power-mode hint slots.
///
/// Each core writes only its own slot; any observer may read any slot
/// through a shared reference.
#[derive(Debug, Default)]
pub struct PowerHints {
    slots: Vec<AtomicU32>,
}

impl PowerHints {
    /// One `Active` slot per core.
    pub fn new(cores: usize) -> Self {
        Self {
            slots: (0..cores).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Hint of a core.
    pub fn get(&self, cpu: usize) -> Option<PowerMode> {
        self.slots.get(cpu).map(|s| PowerMode::decode(s.load(Ordering::Acquire)))
    }

    /// Store a hint.
    pub fn set(&self, cpu: usize, mode: PowerMode) {
        if let Some(slot) = self.slots.get(cpu) {
            slot.store(mode.encode(), Ordering::Release);
        }
    }

    /// Fail unless `cpu` has a slot.
    pub fn check(&self, cpu: usize) -> Result<()> {
        if cpu >= self.slots.len() {
            return Err(ConfigError::IndexOutOfRange {
                entity: "cpu",
                index: cpu,
                count: self.slots.len(),
            }
            .into());
        }
        Ok(())
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when there are no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// The PMU sequencer.
///
/// All operations take the context explicitly; there is no global state.
pub struct PmuContext<B, S = NoSecureMonitor> {
    rae: Rae<B, S>,
    map: AddressMap,
    hints: PowerHints,
    cpu: cpu::CpuTables,
    local: local::Domains,
    system: system::Modes,
    cp: Option<Resolved<cp::CpEntity>>,
}

impl<B: RegisterBackend, S: SecureMonitor> PmuContext<B, S> {
    /// Map the table's blocks, resolve every entity and run the one-time
    /// low-power-mode init sequence.
    pub fn new(mut backend: B, monitor: S, table: &PmuTable, config: PollConfig) -> Result<Self> {
        if table.lpms.len() > PowerMode::MAX_SYSTEM_MODES {
            return Err(ConfigError::TooMany {
                entity: "lpm",
                count: table.lpms.len(),
                max: PowerMode::MAX_SYSTEM_MODES,
            }
            .into());
        }
        let map = AddressMap::build(&mut backend, &table.blocks);
        log::info!(
            "PMU table '{}': {} of {} blocks mapped",
            table.name,
            map.len(),
            table.blocks.len()
        );

        let mut ctx = Self {
            rae: Rae::with_monitor(backend, monitor, config),
            hints: PowerHints::new(table.cpus.len()),
            cpu: cpu::CpuTables::resolve(table, &map),
            local: local::Domains::resolve(&table.domains, &map),
            system: system::Modes::resolve(table, &map),
            cp: table.cp.as_ref().map(|desc| {
                let resolved = cp::CpEntity::resolve(desc, &map);
                if let Err(e) = &resolved {
                    log::error!("cp is unusable: {}", e);
                }
                resolved
            }),
            map,
        };

        ctx.system_init()?;
        ctx.pd_init_states();
        log::info!(
            "PMU ready: {} cores, {} clusters, {} options, {} domains, {} low-power modes",
            ctx.num_cores(),
            ctx.num_clusters(),
            ctx.num_options(),
            ctx.num_domains(),
            ctx.num_lpms()
        );
        Ok(ctx)
    }

    /// The register backend.
    pub fn backend(&self) -> &B {
        self.rae.backend()
    }

    /// The register backend, mutably.
    pub fn backend_mut(&mut self) -> &mut B {
        self.rae.backend_mut()
    }

    /// The secure monitor.
    pub fn monitor(&self) -> &S {
        self.rae.monitor()
    }

    /// The secure monitor, mutably.
    pub fn monitor_mut(&mut self) -> &mut S {
        self.rae.monitor_mut()
    }

    /// Power-mode hint of a core.
    pub fn hint(&self, cpu: usize) -> Option<PowerMode> {
        self.hints.get(cpu)
    }

    /// All hint slots.
    pub fn hints(&self) -> &PowerHints {
        &self.hints
    }

    /// Engine counters.
    pub fn stats(&self) -> &RaeStats {
        self.rae.stats()
    }

    /// Polling budgets in use.
    pub fn poll_config(&self) -> &PollConfig {
        self.rae.config()
    }

    /// The address resolution table.
    pub fn address_map(&self) -> &AddressMap {
        &self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SimulatedMonitor, SimulatedPmu};
    use crate::table::{AccessKind, BlockDesc, DomainDesc, EntityDesc, LpmDesc, SeqDesc};

    fn block(base: u64) -> BlockDesc {
        BlockDesc {
            name: "pmu".to_string(),
            base,
            size: 0x1_0000,
        }
    }

    #[test]
    fn test_power_mode_encoding() {
        for mode in [PowerMode::Active, PowerMode::CoreOff, PowerMode::System(0), PowerMode::System(3)] {
            assert_eq!(PowerMode::decode(mode.encode()), mode);
        }
        assert_eq!(PowerMode::System(2).encode(), 0x102);
        let last = PowerMode::System(PowerMode::MAX_SYSTEM_MODES as u32 - 1);
        assert_eq!(PowerMode::decode(last.encode()), last);
    }

    #[test]
    fn test_too_many_lpms_rejected() {
        let table = PmuTable {
            name: "wide".to_string(),
            lpms: (0..=PowerMode::MAX_SYSTEM_MODES)
                .map(|i| LpmDesc {
                    name: format!("lpm{}", i),
                    ..LpmDesc::default()
                })
                .collect(),
            ..PmuTable::default()
        };
        let err = PmuContext::new(SimulatedPmu::new(), NoSecureMonitor, &table, PollConfig::fast())
            .err()
            .unwrap();
        assert_eq!(
            err,
            PmucalError::Config(ConfigError::TooMany {
                entity: "lpm",
                count: 0x101,
                max: 0x100
            })
        );
    }

    #[test]
    fn test_hint_slots() {
        let hints = PowerHints::new(2);
        hints.set(1, PowerMode::CoreOff);
        assert_eq!(hints.get(0), Some(PowerMode::Active));
        assert_eq!(hints.get(1), Some(PowerMode::CoreOff));
        assert_eq!(hints.get(2), None);
        assert!(hints.check(2).is_err());
    }

    #[test]
    fn test_scenario_core_enable_and_status() {
        let table = PmuTable {
            name: "scenario-a".to_string(),
            blocks: vec![block(0)],
            cpus: vec![EntityDesc {
                name: "core0".to_string(),
                on: vec![SeqDesc::simple(AccessKind::Write, "CORE0_CONFIG", 0, 0x1000, 0xF, 0x1)],
                status: vec![SeqDesc::simple(AccessKind::Read, "CORE0_STATUS", 0, 0x1000, 0x1, 0)],
                ..EntityDesc::default()
            }],
            ..PmuTable::default()
        };
        let mut sim = SimulatedPmu::new();
        sim.poke(0x1000, 0xA0);

        let mut pmu = PmuContext::new(sim, NoSecureMonitor, &table, PollConfig::fast()).unwrap();
        assert!(!pmu.core_is_enabled(0).unwrap());
        pmu.core_enable(0).unwrap();
        assert!(pmu.core_is_enabled(0).unwrap());
        assert_eq!(pmu.backend().peek(0x1000), 0xA1);
    }

    #[test]
    fn test_scenario_domain_registers_survive_power_cycle() {
        const PD_CONFIG: u32 = 0x3000;
        const PD_REG: u32 = 0x2000;
        let table = PmuTable {
            name: "scenario-b".to_string(),
            blocks: vec![block(0)],
            domains: vec![DomainDesc {
                name: "pd".to_string(),
                on: vec![SeqDesc::simple(AccessKind::Write, "PD_CONFIG", 0, PD_CONFIG, 0x1, 0x1)],
                save: vec![SeqDesc::simple(AccessKind::SaveRestore, "PD_REG", 0, PD_REG, 0xFFFF_FFFF, 0)],
                off: vec![SeqDesc::simple(AccessKind::Write, "PD_CONFIG", 0, PD_CONFIG, 0x1, 0x0)],
                ..DomainDesc::default()
            }],
            ..PmuTable::default()
        };
        let mut sim = SimulatedPmu::new();
        sim.add_power_gate(PD_CONFIG as u64, 0x1, PD_REG as u64, 0x100);
        sim.poke(PD_CONFIG as u64, 0x1);
        sim.poke(PD_REG as u64, 0xCAFE_F00D);

        let mut pmu = PmuContext::new(sim, NoSecureMonitor, &table, PollConfig::fast()).unwrap();
        pmu.pd_disable(0).unwrap();
        assert_eq!(pmu.backend().peek(PD_REG as u64), 0);
        assert_eq!(pmu.pd_state(0).unwrap(), DomainState::Off);

        pmu.pd_enable(0).unwrap();
        assert_eq!(pmu.backend().peek(PD_REG as u64), 0xCAFE_F00D);
        assert_eq!(pmu.pd_state(0).unwrap(), DomainState::On);
    }

    #[test]
    fn test_unresolvable_entity_is_unusable() {
        let table = PmuTable {
            name: "partial".to_string(),
            blocks: vec![block(0x1586_0000)],
            cpus: vec![
                EntityDesc {
                    name: "core0".to_string(),
                    on: vec![SeqDesc::simple(AccessKind::Write, "OK", 0x1586_0000, 0x1000, 0x1, 0x1)],
                    ..EntityDesc::default()
                },
                EntityDesc {
                    name: "core1".to_string(),
                    on: vec![SeqDesc::simple(AccessKind::Write, "ELSEWHERE", 0x1A00_0000, 0x0, 0x1, 0x1)],
                    ..EntityDesc::default()
                },
            ],
            ..PmuTable::default()
        };
        let mut pmu = PmuContext::new(SimulatedPmu::new(), NoSecureMonitor, &table, PollConfig::fast()).unwrap();
        pmu.core_enable(0).unwrap();
        assert!(matches!(
            pmu.core_enable(1).unwrap_err(),
            PmucalError::AddressResolution { phys: 0x1A00_0000, .. }
        ));
    }

    #[test]
    fn test_unmapped_block_makes_entities_unusable() {
        let table = PmuTable::builtin().unwrap();
        let mut sim = SimulatedPmu::with_model(&table.simulation);
        // The sysreg block backs the g3d save array.
        let sysreg = table.blocks.iter().find(|b| b.name == "sysreg_g3d").unwrap().base;
        sim.deny_block(sysreg);

        let mut pmu = PmuContext::new(sim, SimulatedMonitor::new(SMC_CP_FUNCTION_ID), &table, PollConfig::fast()).unwrap();
        let g3d = pmu.pd_index("g3d").unwrap();
        assert!(matches!(pmu.pd_enable(g3d).unwrap_err(), PmucalError::AddressResolution { .. }));
        // Cores do not touch that block.
        pmu.core_enable(1).unwrap();
    }

    #[test]
    fn test_builtin_table_walkthrough() {
        let table = PmuTable::builtin().unwrap();
        let sim = SimulatedPmu::with_model(&table.simulation);
        let mut pmu = PmuContext::new(sim, SimulatedMonitor::new(SMC_CP_FUNCTION_ID), &table, PollConfig::fast()).unwrap();

        for core in 1..pmu.num_cores() {
            pmu.core_enable(core).unwrap();
            assert!(pmu.core_is_enabled(core).unwrap(), "core {}", core);
        }
        pmu.core_disable(5).unwrap();
        assert!(!pmu.core_is_enabled(5).unwrap());
        assert_eq!(pmu.hint(5), Some(PowerMode::CoreOff));

        let g3d = pmu.pd_index("g3d").unwrap();
        pmu.pd_enable(g3d).unwrap();
        assert!(pmu.pd_is_enabled(g3d).unwrap());
        pmu.pd_disable(g3d).unwrap();
        assert!(!pmu.pd_is_enabled(g3d).unwrap());

        let sicd = pmu.lpm_index("sicd").unwrap();
        pmu.lpm_enter(sicd, 0).unwrap();
        pmu.lpm_exit(sicd, 0).unwrap();

        pmu.cp_init().unwrap();
        pmu.cp_wait_online().unwrap();
        assert!(pmu.cp_status().unwrap());
        assert!(pmu.stats().steps > 0);
    }
}
