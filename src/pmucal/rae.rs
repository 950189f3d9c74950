//! Register Access Engine.
//!
//! The engine interprets resolved sequences step by step against mapped
//! registers. Three passes exist:
//!
//! - [`Rae::execute`]: run a transition ("power on core 3", "enter sleep").
//! - [`Rae::save`]: capture SaveRestore registers before power is removed.
//! - [`Rae::restore`]: replay captured registers after power returns.
//!
//! `ExtFunc` steps leave the register space and call a firmware function
//! through the engine's [`SecureMonitor`].
//!
//! Steps run strictly in array order. A `CheckSkip` step decides only
//! whether the step right after it runs. Polling steps are bounded by a
//! [`PollBudget`]; an exhausted budget aborts the rest of the sequence with
//! [`PmucalError::Timeout`] and leaves the hardware as the earlier steps left
//! it.
//!
//! # Example
//!
//! ```
//! use pmucal::device::{AddressMap, RegisterBackend, SimulatedPmu};
//! use pmucal::pmucal::{PollConfig, Rae, SeqStep};
//! use pmucal::table::{AccessKind, SeqDesc};
//!
//! let mut sim = SimulatedPmu::new();
//! let mut map = AddressMap::new();
//! let base = sim.map_block(0x1586_0000, 0x1_0000).unwrap();
//! map.insert("pmu", 0x1586_0000, base, 0x1_0000);
//!
//! let desc = SeqDesc::simple(AccessKind::Write, "CPU0_CONFIG", 0x1586_0000, 0x1000, 0x1, 0x1);
//! let mut seq = vec![SeqStep::resolve(&desc, &map)?];
//!
//! let mut rae = Rae::new(sim, PollConfig::default());
//! rae.execute(&mut seq)?;
//! assert_eq!(rae.backend().peek(0x1586_1000), 0x1);
//! # Ok::<(), pmucal::PmucalError>(())
//! ```

use crate::device::{AddressMap, NoSecureMonitor, RegAddr, RegisterBackend, SecureMonitor};
use crate::error::{ConfigError, PmucalError, Result};
use crate::table::{AccessKind, SeqDesc};

use super::cp::{SecureRouted, SecureWindow};

/// Writes issued on the first attempt of a WriteRetry step.
pub const WRITE_RETRY_FIRST_BURST: u32 = 10;

/// Monitor function identifier of the firmware function service used by
/// `ExtFunc` steps.
pub const SMC_EXT_FUNCTION_ID: u32 = 0x8200_0720;

/// Bounded polling: how many times to look, and how long to wait between looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    /// Maximum number of polls before giving up.
    pub max_iterations: u32,
    /// Busy-wait between polls, in microseconds.
    pub poll_interval_us: u32,
}

impl PollBudget {
    /// Create a budget.
    pub const fn new(max_iterations: u32, poll_interval_us: u32) -> Self {
        Self {
            max_iterations,
            poll_interval_us,
        }
    }
}

/// Budgets of the three polling constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Wait, WaitTwo and WriteWait steps.
    pub wait: PollBudget,
    /// WriteRetry and WriteRetryInv steps.
    pub write_retry: PollBudget,
    /// Coprocessor status poll.
    pub cp_status: PollBudget,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            wait: PollBudget::new(2000, 1),
            write_retry: PollBudget::new(1000, 1),
            cp_status: PollBudget::new(1000, 1),
        }
    }
}

impl PollConfig {
    /// Small budgets for fast tests.
    pub fn fast() -> Self {
        Self {
            wait: PollBudget::new(8, 1),
            write_retry: PollBudget::new(5, 1),
            cp_status: PollBudget::new(6, 1),
        }
    }
}

/// Counters kept by the engine.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RaeStats {
    /// Sequences started (execute, save and restore passes).
    pub sequences: usize,
    /// Steps evaluated.
    pub steps: usize,
    /// Steps skipped by CheckSkip.
    pub skipped: usize,
    /// Poll iterations.
    pub polls: usize,
    /// Timeouts reported.
    pub timeouts: usize,
}

impl RaeStats {
    /// Print the counters.
    pub fn print_summary(&self) {
        println!("Engine statistics:");
        println!("  Sequences: {}", self.sequences);
        println!("  Steps:     {}", self.steps);
        println!("  Skipped:   {}", self.skipped);
        println!("  Polls:     {}", self.polls);
        println!("  Timeouts:  {}", self.timeouts);
    }
}

/// A resolved sequence step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqStep {
    pub kind: AccessKind,
    pub label: String,
    pub target: Option<RegAddr>,
    pub mask: u32,
    /// Input for writes and polls; output of reads.
    pub value: u32,
    pub cond: Option<RegAddr>,
    pub cond_mask: u32,
    pub cond_value: u32,
    /// Set when a save pass captured a value to write back.
    pub need_restore: bool,
    /// Set by the preceding CheckSkip step.
    pub need_skip: bool,
}

impl SeqStep {
    /// Resolve a descriptor against the address map.
    pub fn resolve(desc: &SeqDesc, map: &AddressMap) -> Result<Self> {
        let lookup = |phys: Option<u64>| -> Result<Option<RegAddr>> {
            match phys {
                Some(phys) => map
                    .resolve(phys)
                    .map(Some)
                    .ok_or_else(|| PmucalError::AddressResolution {
                        label: desc.name.clone(),
                        phys,
                    }),
                None => Ok(None),
            }
        };
        let target = lookup(desc.target_phys())?;
        let cond = lookup(desc.cond_phys())?;

        if desc.kind.needs_target() && target.is_none() {
            return Err(ConfigError::MissingOperand {
                label: desc.name.clone(),
                operand: "target",
            }
            .into());
        }
        if desc.kind.needs_condition() && cond.is_none() {
            return Err(ConfigError::MissingOperand {
                label: desc.name.clone(),
                operand: "condition",
            }
            .into());
        }

        Ok(Self {
            kind: desc.kind,
            label: desc.name.clone(),
            target,
            mask: desc.mask,
            value: desc.value,
            cond,
            cond_mask: desc.cond_mask,
            cond_value: desc.cond_value,
            need_restore: false,
            need_skip: false,
        })
    }

    fn target_reg(&self) -> Result<RegAddr> {
        self.target.ok_or_else(|| {
            ConfigError::MissingOperand {
                label: self.label.clone(),
                operand: "target",
            }
            .into()
        })
    }

    fn cond_reg(&self) -> Result<RegAddr> {
        self.cond.ok_or_else(|| {
            ConfigError::MissingOperand {
                label: self.label.clone(),
                operand: "condition",
            }
            .into()
        })
    }

    /// Physical target address, 0 when none.
    pub fn phys(&self) -> u64 {
        self.target.map(|t| t.phys()).unwrap_or(0)
    }
}

/// Resolve a whole sequence. Fails on the first unresolvable step.
pub fn resolve_seq(descs: &[SeqDesc], map: &AddressMap) -> Result<Vec<SeqStep>> {
    descs.iter().map(|d| SeqStep::resolve(d, map)).collect()
}

/// True iff every step of an executed status sequence reports `value == mask`.
pub fn status_matches(seq: &[SeqStep]) -> bool {
    seq.iter().all(|s| s.value == s.mask)
}

/// Log the values captured by the last save pass.
pub fn dump_saved(seq: &[SeqStep]) {
    for step in seq.iter().filter(|s| s.kind.is_save_restore()) {
        log::error!(
            "  {:<28} 0x{:08X} = 0x{:08X}{}",
            step.label,
            step.phys(),
            step.value,
            if step.need_restore { "" } else { " (not captured)" }
        );
    }
}

/// Register I/O as seen by the interpreter.
pub(crate) trait RegIo {
    /// Read a register.
    fn read(&mut self, reg: &RegAddr) -> Result<u32>;
    /// Raw store when `mask` is all ones, read-modify-write otherwise.
    fn update(&mut self, reg: &RegAddr, mask: u32, value: u32) -> Result<()>;
    /// Set (`set`) or clear the `value` bits of a register in one store.
    /// Returns false when the register has no way to do so.
    fn atomic(&mut self, reg: &RegAddr, set: bool, value: u32) -> Result<bool>;
    /// Issue a monitor call.
    fn call(&mut self, function_id: u32, arg0: u64, arg1: u64, arg2: u64) -> u64;
    /// Busy-wait.
    fn delay_us(&mut self, us: u32);
}

/// Plain memory-mapped access.
pub(crate) struct Direct<'a, B: ?Sized, S: ?Sized> {
    pub backend: &'a mut B,
    pub monitor: &'a mut S,
}

impl<B: RegisterBackend + ?Sized, S: SecureMonitor + ?Sized> RegIo for Direct<'_, B, S> {
    fn read(&mut self, reg: &RegAddr) -> Result<u32> {
        Ok(self.backend.read32(reg.mapped()))
    }

    fn update(&mut self, reg: &RegAddr, mask: u32, value: u32) -> Result<()> {
        if mask == u32::MAX {
            self.backend.write32(reg.mapped(), value);
        } else {
            let current = self.backend.read32(reg.mapped());
            self.backend.write32(reg.mapped(), (current & !mask) | (value & mask));
        }
        Ok(())
    }

    fn atomic(&mut self, reg: &RegAddr, set: bool, value: u32) -> Result<bool> {
        let alias = if set { reg.atomic_set() } else { reg.atomic_clear() };
        Ok(match alias {
            Some(addr) => {
                self.backend.write32(addr, value);
                true
            }
            None => false,
        })
    }

    fn call(&mut self, function_id: u32, arg0: u64, arg1: u64, arg2: u64) -> u64 {
        self.monitor.smc(function_id, arg0, arg1, arg2)
    }

    fn delay_us(&mut self, us: u32) {
        self.backend.delay_us(us);
    }
}

/// One interpreter run over some register I/O.
pub(crate) struct Interp<'a, IO> {
    pub io: IO,
    pub config: &'a PollConfig,
    pub stats: &'a mut RaeStats,
}

impl<IO: RegIo> Interp<'_, IO> {
    fn read_masked(&mut self, step: &SeqStep) -> Result<u32> {
        let reg = step.target_reg()?;
        Ok(self.io.read(&reg)? & step.mask)
    }

    fn target_matches(&mut self, step: &SeqStep) -> Result<bool> {
        Ok(self.read_masked(step)? == step.value)
    }

    fn cond_matches(&mut self, step: &SeqStep) -> Result<bool> {
        let reg = step.cond_reg()?;
        Ok(self.io.read(&reg)? & step.cond_mask == step.cond_value)
    }

    fn write(&mut self, step: &SeqStep) -> Result<()> {
        let reg = step.target_reg()?;
        self.io.update(&reg, step.mask, step.value)
    }

    fn timeout(&mut self, index: usize, step: &SeqStep) -> PmucalError {
        self.stats.timeouts += 1;
        log::error!(
            "timeout at step {} {} '{}' (0x{:08X} mask=0x{:08X} value=0x{:08X})",
            index,
            step.kind,
            step.label,
            step.phys(),
            step.mask,
            step.value
        );
        PmucalError::Timeout {
            index,
            label: step.label.clone(),
            addr: step.phys(),
        }
    }

    /// Poll until the target (and for WaitTwo the condition) matches.
    fn wait(&mut self, index: usize, step: &SeqStep) -> Result<()> {
        let budget = self.config.wait;
        for poll in 0..budget.max_iterations {
            self.stats.polls += 1;
            let mut done = self.target_matches(step)?;
            if done && step.kind == AccessKind::WaitTwo {
                done = self.cond_matches(step)?;
            }
            if done {
                return Ok(());
            }
            if poll + 1 < budget.max_iterations {
                self.io.delay_us(budget.poll_interval_us);
            }
        }
        Err(self.timeout(index, step))
    }

    /// Keep re-writing while the condition says the write did not stick.
    ///
    /// The first attempt writes a burst of ten; attempt `n` writes `n` times.
    fn write_retry(&mut self, index: usize, step: &SeqStep, inverted: bool) -> Result<()> {
        let budget = self.config.write_retry;
        for attempt in 0..budget.max_iterations {
            self.stats.polls += 1;
            let matches = self.cond_matches(step)?;
            let retry = if inverted { !matches } else { matches };
            if !retry {
                return Ok(());
            }
            let burst = if attempt == 0 { WRITE_RETRY_FIRST_BURST } else { attempt };
            for _ in 0..burst {
                self.write(step)?;
            }
            self.io.delay_us(budget.poll_interval_us);
        }
        Err(self.timeout(index, step))
    }

    fn atomic(&mut self, step: &SeqStep, set: bool) -> Result<()> {
        let reg = step.target_reg()?;
        if !self.io.atomic(&reg, set, step.value)? {
            log::warn!(
                "{} '{}': offset 0x{:X} has no atomic alias, skipped",
                step.kind,
                step.label,
                reg.offset
            );
        }
        Ok(())
    }

    fn ext_func(&mut self, step: &SeqStep) -> Result<()> {
        let status = self
            .io
            .call(SMC_EXT_FUNCTION_ID, step.mask as u64, step.value as u64, 0);
        if status != 0 {
            log::error!(
                "ext func '{}' (0x{:X}, {}) failed: 0x{:X}",
                step.label,
                step.mask,
                step.value,
                status
            );
            return Err(PmucalError::SecureCall {
                function_id: SMC_EXT_FUNCTION_ID,
                status,
            });
        }
        Ok(())
    }

    fn clear_pend(&mut self, step: &SeqStep) -> Result<()> {
        let cond = step.cond_reg()?;
        let target = step.target_reg()?;
        let pending = self.io.read(&cond)? & step.cond_mask;
        self.io.update(&target, u32::MAX, pending)
    }

    /// Evaluate a CheckSkip/CondCheckSkip step and flag the next step.
    fn check_skip(&mut self, seq: &mut [SeqStep], index: usize) -> Result<()> {
        let step = &seq[index];
        let skip = match step.kind {
            AccessKind::CondCheckSkip => {
                if self.cond_matches(step)? {
                    self.target_matches(step)?
                } else {
                    true
                }
            }
            _ => self.target_matches(step)?,
        };
        if let Some(next) = seq.get_mut(index + 1) {
            next.need_skip = skip;
        }
        Ok(())
    }

    /// Consume a pending skip flag. Returns true if the step is skipped.
    fn take_skip(&mut self, step: &mut SeqStep) -> bool {
        if step.need_skip {
            step.need_skip = false;
            self.stats.skipped += 1;
            log::trace!("  skip '{}'", step.label);
            return true;
        }
        false
    }

    pub fn execute(&mut self, seq: &mut [SeqStep]) -> Result<()> {
        self.stats.sequences += 1;
        for i in 0..seq.len() {
            if self.take_skip(&mut seq[i]) {
                continue;
            }
            self.stats.steps += 1;
            log::trace!("  [{}] {} '{}' 0x{:08X}", i, seq[i].kind, seq[i].label, seq[i].phys());

            match seq[i].kind {
                AccessKind::Read => {
                    seq[i].value = self.read_masked(&seq[i])?;
                }
                AccessKind::Write => self.write(&seq[i])?,
                AccessKind::CondRead => {
                    if self.cond_matches(&seq[i])? {
                        seq[i].value = self.read_masked(&seq[i])?;
                    }
                }
                AccessKind::CondWrite => {
                    if self.cond_matches(&seq[i])? {
                        self.write(&seq[i])?;
                    }
                }
                // Handled by the save and restore passes.
                AccessKind::SaveRestore | AccessKind::CondSaveRestore => {}
                AccessKind::Wait | AccessKind::WaitTwo => self.wait(i, &seq[i])?,
                AccessKind::CheckSkip | AccessKind::CondCheckSkip => self.check_skip(seq, i)?,
                AccessKind::WriteWait => {
                    self.write(&seq[i])?;
                    self.wait(i, &seq[i])?;
                }
                AccessKind::WriteRetry => self.write_retry(i, &seq[i], false)?,
                AccessKind::WriteRetryInv => self.write_retry(i, &seq[i], true)?,
                AccessKind::WriteReturn => {
                    self.write(&seq[i])?;
                    return Ok(());
                }
                AccessKind::SetBitAtomic => self.atomic(&seq[i], true)?,
                AccessKind::ClearBitAtomic => self.atomic(&seq[i], false)?,
                AccessKind::Delay => self.io.delay_us(seq[i].value),
                AccessKind::ClearPend => self.clear_pend(&seq[i])?,
                AccessKind::ExtFunc => self.ext_func(&seq[i])?,
            }
        }
        Ok(())
    }

    pub fn save(&mut self, seq: &mut [SeqStep]) -> Result<()> {
        self.stats.sequences += 1;
        for step in seq.iter_mut() {
            match step.kind {
                AccessKind::SaveRestore => {
                    step.value = self.read_masked(step)?;
                    step.need_restore = true;
                }
                AccessKind::CondSaveRestore => {
                    if self.cond_matches(step)? {
                        step.value = self.read_masked(step)?;
                        step.need_restore = true;
                    } else {
                        step.need_restore = false;
                    }
                }
                AccessKind::Read => {
                    step.value = self.read_masked(step)?;
                }
                AccessKind::CondRead => {
                    if self.cond_matches(step)? {
                        step.value = self.read_masked(step)?;
                    }
                }
                AccessKind::ClearPend => self.clear_pend(step)?,
                _ => continue,
            }
            self.stats.steps += 1;
            log::trace!("  save {} '{}' = 0x{:08X}", step.kind, step.label, step.value);
        }
        Ok(())
    }

    pub fn restore(&mut self, seq: &mut [SeqStep]) -> Result<()> {
        self.stats.sequences += 1;
        for i in 0..seq.len() {
            if self.take_skip(&mut seq[i]) {
                continue;
            }
            match seq[i].kind {
                AccessKind::SaveRestore | AccessKind::CondSaveRestore => {
                    if seq[i].need_restore {
                        self.write(&seq[i])?;
                        seq[i].need_restore = false;
                    }
                }
                AccessKind::CheckSkip | AccessKind::CondCheckSkip => self.check_skip(seq, i)?,
                AccessKind::Wait | AccessKind::WaitTwo => self.wait(i, &seq[i])?,
                AccessKind::Write => self.write(&seq[i])?,
                AccessKind::CondWrite => {
                    if self.cond_matches(&seq[i])? {
                        self.write(&seq[i])?;
                    }
                }
                AccessKind::Delay => self.io.delay_us(seq[i].value),
                _ => continue,
            }
            self.stats.steps += 1;
            log::trace!("  restore [{}] {} '{}'", i, seq[i].kind, seq[i].label);
        }
        Ok(())
    }
}

/// The Register Access Engine: a backend, a secure monitor and polling
/// budgets.
#[derive(Debug)]
pub struct Rae<B, S = NoSecureMonitor> {
    backend: B,
    monitor: S,
    config: PollConfig,
    stats: RaeStats,
}

impl<B: RegisterBackend> Rae<B> {
    /// Create an engine over `backend` with no secure monitor.
    pub fn new(backend: B, config: PollConfig) -> Self {
        Self::with_monitor(backend, NoSecureMonitor, config)
    }
}

impl<B: RegisterBackend, S: SecureMonitor> Rae<B, S> {
    /// Create an engine over `backend` that issues monitor calls to `monitor`.
    pub fn with_monitor(backend: B, monitor: S, config: PollConfig) -> Self {
        Self {
            backend,
            monitor,
            config,
            stats: RaeStats::default(),
        }
    }

    fn interp(&mut self) -> Interp<'_, Direct<'_, B, S>> {
        Interp {
            io: Direct {
                backend: &mut self.backend,
                monitor: &mut self.monitor,
            },
            config: &self.config,
            stats: &mut self.stats,
        }
    }

    /// Execute a transition sequence.
    pub fn execute(&mut self, seq: &mut [SeqStep]) -> Result<()> {
        self.interp().execute(seq)
    }

    /// Capture SaveRestore registers.
    pub fn save(&mut self, seq: &mut [SeqStep]) -> Result<()> {
        self.interp().save(seq)
    }

    /// Replay captured registers.
    pub fn restore(&mut self, seq: &mut [SeqStep]) -> Result<()> {
        self.interp().restore(seq)
    }

    /// Execute a coprocessor sequence, routing secure registers through the monitor.
    pub fn execute_cp(&mut self, seq: &mut [SeqStep], window: &SecureWindow) -> Result<()> {
        let mut interp = Interp {
            io: SecureRouted {
                backend: &mut self.backend,
                monitor: &mut self.monitor,
                window,
            },
            config: &self.config,
            stats: &mut self.stats,
        };
        interp.execute(seq)
    }

    /// The backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The backend, mutably.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// The secure monitor.
    pub fn monitor(&self) -> &S {
        &self.monitor
    }

    /// The secure monitor, mutably.
    pub fn monitor_mut(&mut self) -> &mut S {
        &mut self.monitor
    }

    /// Polling budgets.
    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Engine counters.
    pub fn stats(&self) -> &RaeStats {
        &self.stats
    }
}
