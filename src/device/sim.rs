//! Simulated PMU register file and secure monitor.
//!
//! The simulator stands in for real hardware in tests and in the CLI. It is
//! a sparse register file with just enough hardware behaviour to exercise
//! every access kind:
//!
//! - **Atomic aliases**: a write to `offset | 0xC000` sets, and a write to
//!   `offset | 0x8000` clears, the written bits of `offset` (only for
//!   `offset < 0x4000`).
//! - **Mirror rules**: CONFIGURATION registers reflected into their STATUS
//!   registers.
//! - **Power gates**: registers of a domain lose their contents when the
//!   domain's control bits drop to zero.
//! - **Scripted polls**: a register takes a new value only after it has
//!   been read a given number of times.
//!
//! Every access is logged in physical addresses so tests can assert on
//! ordering.
//!
//! # Example
//!
//! ```
//! use pmucal::device::{RegisterBackend, SimulatedPmu};
//!
//! let mut sim = SimulatedPmu::new();
//! let base = sim.map_block(0x1586_0000, 0x1_0000).unwrap();
//! sim.write32(base + 0x1000, 0xF);
//! assert_eq!(sim.peek(0x1586_1000), 0xF);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::backend::{RegisterBackend, SecureMonitor};
use super::map::{ATOMIC_CLEAR_OFFSET, ATOMIC_OFFSET_LIMIT, ATOMIC_SET_OFFSET};
use crate::pmucal::cp::{SMC_CP_READ, SMC_CP_WRITE};

/// Mapped addresses are physical addresses plus this offset.
pub const SIM_VIRT_OFFSET: u64 = 0xFFFF_0000_0000_0000;

/// Reflect the masked bits of a control register into a status register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRule {
    /// Physical address of the control register.
    pub control: u64,
    /// Physical address of the status register.
    pub status: u64,
    /// Bits copied.
    pub mask: u32,
}

/// Zero a register range when a control register's masked bits clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerGate {
    /// Physical address of the control register.
    pub control: u64,
    /// Power-enable bits.
    pub mask: u32,
    /// First physical address of the gated range.
    pub start: u64,
    /// Length of the gated range in bytes.
    pub len: u64,
}

/// Initial register value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    /// Physical address.
    pub addr: u64,
    /// Reset value.
    pub value: u32,
}

/// Hardware behaviour loaded from a table's `[simulation]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimModel {
    #[serde(rename = "mirror")]
    pub mirrors: Vec<MirrorRule>,
    #[serde(rename = "power_gate")]
    pub power_gates: Vec<PowerGate>,
    #[serde(rename = "preset")]
    pub presets: Vec<Preset>,
}

/// One logged register access (physical addresses).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read { addr: u64, value: u32 },
    Write { addr: u64, value: u32 },
    Delay { us: u32 },
}

#[derive(Debug, Clone, Copy)]
struct PollScript {
    after_reads: usize,
    value: u32,
}

/// Sparse simulated PMU.
#[derive(Debug, Default)]
pub struct SimulatedPmu {
    /// Register contents keyed by physical address.
    registers: BTreeMap<u64, u32>,
    /// Mapped blocks: (physical base, size).
    blocks: Vec<(u64, u64)>,
    /// Physical bases that refuse to map.
    denied: Vec<u64>,
    mirrors: Vec<MirrorRule>,
    power_gates: Vec<PowerGate>,
    scripts: HashMap<u64, PollScript>,
    read_counts: HashMap<u64, usize>,
    write_counts: HashMap<u64, usize>,
    log: Vec<Access>,
    total_delay_us: u64,
}

impl SimulatedPmu {
    /// Create an empty simulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a simulator with the given hardware model.
    pub fn with_model(model: &SimModel) -> Self {
        let mut sim = Self::new();
        for preset in &model.presets {
            sim.poke(preset.addr, preset.value);
        }
        sim.mirrors = model.mirrors.clone();
        sim.power_gates = model.power_gates.clone();
        sim
    }

    /// Make `map_block` fail for this physical base.
    pub fn deny_block(&mut self, phys_base: u64) {
        self.denied.push(phys_base);
    }

    /// Add a mirror rule.
    pub fn add_mirror(&mut self, control: u64, status: u64, mask: u32) {
        self.mirrors.push(MirrorRule { control, status, mask });
    }

    /// Add a power gate.
    pub fn add_power_gate(&mut self, control: u64, mask: u32, start: u64, len: u64) {
        self.power_gates.push(PowerGate { control, mask, start, len });
    }

    /// Make `phys` read as `value` once it has been read `after_reads` times.
    pub fn script_after_reads(&mut self, phys: u64, after_reads: usize, value: u32) {
        let done = self.read_counts.get(&phys).copied().unwrap_or(0);
        self.scripts.insert(
            phys,
            PollScript {
                after_reads: done + after_reads,
                value,
            },
        );
    }

    /// Current register value, without side effects.
    pub fn peek(&self, phys: u64) -> u32 {
        self.registers.get(&phys).copied().unwrap_or(0)
    }

    /// Set a register value, without side effects or logging.
    pub fn poke(&mut self, phys: u64, value: u32) {
        self.registers.insert(phys, value);
    }

    /// Number of reads of a register.
    pub fn reads_of(&self, phys: u64) -> usize {
        self.read_counts.get(&phys).copied().unwrap_or(0)
    }

    /// Number of writes to a register (alias writes count against the alias).
    pub fn writes_to(&self, phys: u64) -> usize {
        self.write_counts.get(&phys).copied().unwrap_or(0)
    }

    /// Access log.
    pub fn log(&self) -> &[Access] {
        &self.log
    }

    /// Physical addresses written, in order.
    pub fn written_addresses(&self) -> Vec<u64> {
        self.log
            .iter()
            .filter_map(|a| match a {
                Access::Write { addr, .. } => Some(*addr),
                _ => None,
            })
            .collect()
    }

    /// Forget the access log and counters (register contents are kept).
    pub fn clear_log(&mut self) {
        self.log.clear();
        self.read_counts.clear();
        self.write_counts.clear();
        self.total_delay_us = 0;
    }

    /// Sum of all busy-wait delays.
    pub fn total_delay_us(&self) -> u64 {
        self.total_delay_us
    }

    /// All registers with a nonzero value.
    pub fn nonzero_registers(&self) -> Vec<(u64, u32)> {
        self.registers
            .iter()
            .filter(|(_, v)| **v != 0)
            .map(|(a, v)| (*a, *v))
            .collect()
    }

    /// Print nonzero registers.
    pub fn print_state(&self) {
        println!("Simulated registers (nonzero):");
        for (addr, value) in self.nonzero_registers() {
            println!("  0x{:08X} = 0x{:08X}", addr, value);
        }
    }

    fn block_of(&self, phys: u64) -> Option<u64> {
        self.blocks
            .iter()
            .find(|(base, size)| phys >= *base && phys < base + size)
            .map(|(base, _)| *base)
    }

    /// Store a value and apply mirror rules and power gates.
    fn store(&mut self, phys: u64, value: u32) {
        self.registers.insert(phys, value);

        let mirrors: Vec<MirrorRule> = self.mirrors.iter().filter(|m| m.control == phys).cloned().collect();
        for rule in mirrors {
            let status = self.peek(rule.status);
            self.registers
                .insert(rule.status, (status & !rule.mask) | (value & rule.mask));
        }

        let gates: Vec<PowerGate> = self
            .power_gates
            .iter()
            .filter(|g| g.control == phys && value & g.mask == 0)
            .cloned()
            .collect();
        for gate in gates {
            log::trace!("sim: power gate at 0x{:08X} zeroes 0x{:08X}+0x{:X}", phys, gate.start, gate.len);
            let end = gate.start + gate.len;
            for (_, v) in self.registers.range_mut(gate.start..end) {
                *v = 0;
            }
        }
    }
}

impl RegisterBackend for SimulatedPmu {
    fn map_block(&mut self, phys_base: u64, size: u64) -> Option<u64> {
        if self.denied.contains(&phys_base) {
            return None;
        }
        self.blocks.push((phys_base, size));
        Some(phys_base + SIM_VIRT_OFFSET)
    }

    fn read32(&mut self, addr: u64) -> u32 {
        let phys = addr - SIM_VIRT_OFFSET;
        let count = self.read_counts.entry(phys).or_insert(0);
        *count += 1;
        let count = *count;

        if let Some(script) = self.scripts.get(&phys).copied() {
            if count > script.after_reads {
                self.scripts.remove(&phys);
                self.store(phys, script.value);
            }
        }

        let value = self.peek(phys);
        self.log.push(Access::Read { addr: phys, value });
        value
    }

    fn write32(&mut self, addr: u64, value: u32) {
        let phys = addr - SIM_VIRT_OFFSET;
        *self.write_counts.entry(phys).or_insert(0) += 1;
        self.log.push(Access::Write { addr: phys, value });

        if let Some(base) = self.block_of(phys) {
            let offset = (phys - base) as u32;
            let real = base + (offset & (ATOMIC_OFFSET_LIMIT - 1)) as u64;
            if offset & ATOMIC_SET_OFFSET == ATOMIC_SET_OFFSET && offset < 0x1_0000 {
                let current = self.peek(real);
                self.store(real, current | value);
                return;
            }
            if offset & ATOMIC_SET_OFFSET == ATOMIC_CLEAR_OFFSET && offset < 0x1_0000 {
                let current = self.peek(real);
                self.store(real, current & !value);
                return;
            }
        }
        self.store(phys, value);
    }

    fn delay_us(&mut self, us: u32) {
        self.total_delay_us += us as u64;
        self.log.push(Access::Delay { us });
    }
}

/// One recorded secure monitor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmcCall {
    pub function_id: u32,
    pub arg0: u64,
    pub arg1: u64,
    pub arg2: u64,
}

/// Simulated trust-zone monitor.
///
/// Calls with the coprocessor function id implement the split 16-bit
/// register protocol against an internal register map; any other function
/// id is accepted and only recorded.
#[derive(Debug, Default)]
pub struct SimulatedMonitor {
    cp_function_id: u32,
    registers: HashMap<u64, u32>,
    calls: Vec<SmcCall>,
    fail_status: Option<u64>,
}

impl SimulatedMonitor {
    /// Create a monitor serving coprocessor registers under `cp_function_id`.
    pub fn new(cp_function_id: u32) -> Self {
        Self {
            cp_function_id,
            ..Self::default()
        }
    }

    /// Make every subsequent call fail with `status`.
    pub fn fail_with(&mut self, status: u64) {
        self.fail_status = Some(status);
    }

    /// Secure register value.
    pub fn peek(&self, phys: u64) -> u32 {
        self.registers.get(&phys).copied().unwrap_or(0)
    }

    /// Set a secure register value.
    pub fn poke(&mut self, phys: u64, value: u32) {
        self.registers.insert(phys, value);
    }

    /// Recorded calls.
    pub fn calls(&self) -> &[SmcCall] {
        &self.calls
    }
}

impl SecureMonitor for SimulatedMonitor {
    fn smc(&mut self, function_id: u32, arg0: u64, arg1: u64, arg2: u64) -> u64 {
        self.calls.push(SmcCall {
            function_id,
            arg0,
            arg1,
            arg2,
        });
        if let Some(status) = self.fail_status {
            return status;
        }
        if function_id != self.cp_function_id {
            return 0;
        }

        let reg = self.peek(arg0);
        match arg1 as u32 {
            SMC_CP_READ => {
                let shift = 16 * (arg2 & 1);
                let half = (reg >> shift) & 0xFFFF;
                (half as u64) << 16
            }
            SMC_CP_WRITE => {
                let shift = 16 * ((arg2 >> 16) & 1);
                let half = (arg2 & 0xFFFF) as u32;
                let updated = (reg & !(0xFFFF << shift)) | (half << shift);
                self.registers.insert(arg0, updated);
                0
            }
            _ => 0x1,
        }
    }
}
