//! Modem coprocessor control.
//!
//! The coprocessor sequences run through the normal engine, except that two
//! registers of its control block are only reachable through the secure
//! monitor. Each logical 32-bit access is split in 16-bit halves because a
//! monitor call returns at most 16 bits of payload:
//!
//! ```text
//! read  half h:  smc(fid, pa, SMC_CP_READ,  h)              -> status | data << 16
//! write half h:  smc(fid, pa, SMC_CP_WRITE, h << 16 | data)  -> status
//! ```
//!
//! A write to a secure register is always a read-modify-write: two read
//! calls, then two write calls. Atomic set and clear steps on a secure
//! register take the same path.

use super::rae::{resolve_seq, status_matches, Direct, RegIo, SeqStep};
use super::PmuContext;
use crate::device::{AddressMap, RegAddr, RegisterBackend, SecureMonitor};
use crate::error::{ConfigError, PmucalError, Result};
use crate::table::{CpDesc, SecureWindowDesc};

/// Sub-operation: read one half of a secure register.
pub const SMC_CP_READ: u32 = 3;
/// Sub-operation: write one half of a secure register.
pub const SMC_CP_WRITE: u32 = 4;
/// Default function identifier of the coprocessor register service.
pub const SMC_CP_FUNCTION_ID: u32 = 0x8200_0700;

/// The coprocessor sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpSeq {
    Init,
    Status,
    ResetAssert,
    ResetRelease,
    ActiveClear,
    ResetReqClear,
    EnableDump,
    DisableDump,
}

impl CpSeq {
    /// Every sequence, in table order.
    pub const ALL: [CpSeq; 8] = [
        CpSeq::Init,
        CpSeq::Status,
        CpSeq::ResetAssert,
        CpSeq::ResetRelease,
        CpSeq::ActiveClear,
        CpSeq::ResetReqClear,
        CpSeq::EnableDump,
        CpSeq::DisableDump,
    ];

    /// Table key of the sequence.
    pub fn name(self) -> &'static str {
        match self {
            CpSeq::Init => "init",
            CpSeq::Status => "status",
            CpSeq::ResetAssert => "reset_assert",
            CpSeq::ResetRelease => "reset_release",
            CpSeq::ActiveClear => "active_clear",
            CpSeq::ResetReqClear => "reset_req_clear",
            CpSeq::EnableDump => "enable_dump",
            CpSeq::DisableDump => "disable_dump",
        }
    }
}

/// Registers served by the secure monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureWindow {
    /// Physical base of the control block.
    pub base: u64,
    /// Secure register offsets.
    pub offsets: [u32; 2],
    /// Monitor function identifier.
    pub function_id: u32,
}

impl SecureWindow {
    /// True if the register must go through the monitor.
    pub fn is_secure(&self, reg: &RegAddr) -> bool {
        let phys = reg.phys();
        self.offsets.iter().any(|&off| phys == self.base + off as u64)
    }
}

impl From<&SecureWindowDesc> for SecureWindow {
    fn from(desc: &SecureWindowDesc) -> Self {
        Self {
            base: desc.base,
            offsets: desc.offsets,
            function_id: desc.function_id,
        }
    }
}

/// Register I/O that sends secure registers through the monitor.
pub(crate) struct SecureRouted<'a, B: ?Sized, S: ?Sized> {
    pub backend: &'a mut B,
    pub monitor: &'a mut S,
    pub window: &'a SecureWindow,
}

impl<B: ?Sized, S: SecureMonitor + ?Sized> SecureRouted<'_, B, S> {
    fn direct(&mut self) -> Direct<'_, B, S> {
        Direct {
            backend: &mut *self.backend,
            monitor: &mut *self.monitor,
        }
    }

    fn check(&self, status: u64) -> Result<()> {
        if status != 0 {
            log::error!("secure cp access failed: 0x{:X}", status);
            return Err(PmucalError::SecureCall {
                function_id: self.window.function_id,
                status,
            });
        }
        Ok(())
    }

    fn smc_read(&mut self, phys: u64) -> Result<u32> {
        let mut value = 0;
        for half in 0..2u64 {
            let ret = self
                .monitor
                .smc(self.window.function_id, phys, SMC_CP_READ as u64, half);
            self.check(ret & 0xFFFF)?;
            value |= (((ret >> 16) & 0xFFFF) as u32) << (16 * half);
        }
        log::trace!("  secure read 0x{:08X} = 0x{:08X}", phys, value);
        Ok(value)
    }

    fn smc_write(&mut self, phys: u64, value: u32) -> Result<()> {
        log::trace!("  secure write 0x{:08X} = 0x{:08X}", phys, value);
        for half in 0..2u64 {
            let data = ((value >> (16 * half)) & 0xFFFF) as u64;
            let ret = self
                .monitor
                .smc(self.window.function_id, phys, SMC_CP_WRITE as u64, (half << 16) | data);
            self.check(ret)?;
        }
        Ok(())
    }
}

impl<B: RegisterBackend + ?Sized, S: SecureMonitor + ?Sized> RegIo for SecureRouted<'_, B, S> {
    fn read(&mut self, reg: &RegAddr) -> Result<u32> {
        if self.window.is_secure(reg) {
            return self.smc_read(reg.phys());
        }
        self.direct().read(reg)
    }

    fn update(&mut self, reg: &RegAddr, mask: u32, value: u32) -> Result<()> {
        if self.window.is_secure(reg) {
            let old = self.smc_read(reg.phys())?;
            return self.smc_write(reg.phys(), (old & !mask) | (value & mask));
        }
        self.direct().update(reg, mask, value)
    }

    fn atomic(&mut self, reg: &RegAddr, set: bool, value: u32) -> Result<bool> {
        if self.window.is_secure(reg) {
            let old = self.smc_read(reg.phys())?;
            let new = if set { old | value } else { old & !value };
            self.smc_write(reg.phys(), new)?;
            return Ok(true);
        }
        self.direct().atomic(reg, set, value)
    }

    fn call(&mut self, function_id: u32, arg0: u64, arg1: u64, arg2: u64) -> u64 {
        self.monitor.smc(function_id, arg0, arg1, arg2)
    }

    fn delay_us(&mut self, us: u32) {
        self.backend.delay_us(us);
    }
}

/// Resolved coprocessor sequences, indexed by [`CpSeq`].
#[derive(Debug)]
pub(crate) struct CpEntity {
    seqs: Vec<Vec<SeqStep>>,
    window: Option<SecureWindow>,
}

impl CpEntity {
    pub fn resolve(desc: &CpDesc, map: &AddressMap) -> Result<Self> {
        let seqs = desc
            .sequences()
            .iter()
            .map(|(_, seq)| resolve_seq(seq, map))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            seqs,
            window: desc.secure.as_ref().map(SecureWindow::from),
        })
    }
}

fn missing(which: CpSeq) -> PmucalError {
    ConfigError::MissingSequence {
        entity: "cp",
        index: 0,
        op: which.name(),
    }
    .into()
}

impl<B: RegisterBackend, S: SecureMonitor> PmuContext<B, S> {
    /// Execute one coprocessor sequence. Returns the status rule applied to
    /// the executed steps.
    pub fn cp_run(&mut self, which: CpSeq) -> Result<bool> {
        let cp = match self.cp.as_mut() {
            None => return Err(missing(which)),
            Some(Err(e)) => return Err(e.clone()),
            Some(Ok(cp)) => cp,
        };
        let seq = &mut cp.seqs[which as usize];
        if seq.is_empty() {
            return Err(missing(which));
        }
        log::debug!("cp {}", which.name());
        match &cp.window {
            Some(window) => self.rae.execute_cp(seq, window)?,
            None => self.rae.execute(seq)?,
        }
        Ok(status_matches(seq))
    }

    /// Initialise the coprocessor power block.
    pub fn cp_init(&mut self) -> Result<()> {
        self.cp_run(CpSeq::Init).map(drop)
    }

    /// Query whether the coprocessor is online.
    pub fn cp_status(&mut self) -> Result<bool> {
        self.cp_run(CpSeq::Status)
    }

    /// Poll the status sequence until the coprocessor reports online.
    ///
    /// Evaluates the status sequence at most `cp_status.max_iterations`
    /// times.
    pub fn cp_wait_online(&mut self) -> Result<()> {
        let budget = self.rae.config().cp_status;
        for poll in 0..budget.max_iterations {
            if self.cp_run(CpSeq::Status)? {
                return Ok(());
            }
            if poll + 1 < budget.max_iterations {
                self.rae.backend_mut().delay_us(budget.poll_interval_us);
            }
        }

        let (label, addr) = match self.cp.as_ref() {
            Some(Ok(cp)) => cp.seqs[CpSeq::Status as usize]
                .first()
                .map(|s| (s.label.clone(), s.phys()))
                .unwrap_or_default(),
            _ => Default::default(),
        };
        log::error!("cp did not come online after {} polls", budget.max_iterations);
        Err(PmucalError::Timeout { index: 0, label, addr })
    }

    /// Hold the coprocessor in reset.
    pub fn cp_reset_assert(&mut self) -> Result<()> {
        self.cp_run(CpSeq::ResetAssert).map(drop)
    }

    /// Release the coprocessor from reset.
    pub fn cp_reset_release(&mut self) -> Result<()> {
        self.cp_run(CpSeq::ResetRelease).map(drop)
    }

    /// Clear the coprocessor active flag.
    pub fn cp_active_clear(&mut self) -> Result<()> {
        self.cp_run(CpSeq::ActiveClear).map(drop)
    }

    /// Clear a pending coprocessor reset request.
    pub fn cp_reset_req_clear(&mut self) -> Result<()> {
        self.cp_run(CpSeq::ResetReqClear).map(drop)
    }

    /// Enable the coprocessor debug dump.
    pub fn cp_enable_dump(&mut self) -> Result<()> {
        self.cp_run(CpSeq::EnableDump).map(drop)
    }

    /// Disable the coprocessor debug dump.
    pub fn cp_disable_dump(&mut self) -> Result<()> {
        self.cp_run(CpSeq::DisableDump).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SimulatedMonitor, SimulatedPmu, SmcCall};
    use crate::pmucal::PollConfig;
    use crate::table::{AccessKind, BlockDesc, PmuTable, SeqDesc};

    const PMU: u64 = 0x1586_0000;
    const CP_CTRL_NS: u32 = 0x0030;
    const CP_CTRL_S: u32 = 0x0034;
    const CP_STATUS: u32 = 0x0038;
    const FID: u32 = SMC_CP_FUNCTION_ID;

    fn w(name: &str, offset: u32, mask: u32, value: u32) -> SeqDesc {
        SeqDesc::simple(AccessKind::Write, name, PMU, offset, mask, value)
    }

    fn table() -> PmuTable {
        PmuTable {
            name: "cp-test".to_string(),
            blocks: vec![BlockDesc {
                name: "pmu".to_string(),
                base: PMU,
                size: 0x1_0000,
            }],
            cp: Some(CpDesc {
                init: vec![
                    w("CP_CTRL_NS", CP_CTRL_NS, 0x1, 0x1),
                    w("CP_CTRL_S", CP_CTRL_S, 0x0000_0008, 0x0000_0008),
                ],
                status: vec![SeqDesc::simple(AccessKind::Read, "CP_STATUS", PMU, CP_STATUS, 0x1, 0)],
                reset_assert: vec![w("CP_CTRL_S", CP_CTRL_S, 0x0000_0100, 0x0000_0100)],
                reset_release: vec![w("CP_CTRL_S", CP_CTRL_S, 0x0000_0100, 0x0)],
                active_clear: vec![w("CP_CTRL_NS", CP_CTRL_NS, 0x0000_0040, 0x0000_0040)],
                enable_dump: vec![SeqDesc::simple(AccessKind::Read, "CP_CTRL_S", PMU, CP_CTRL_S, 0x0001_0000, 0)],
                secure: Some(SecureWindowDesc {
                    base: PMU,
                    offsets: [CP_CTRL_NS + 0x100, CP_CTRL_S],
                    function_id: FID,
                }),
                ..CpDesc::default()
            }),
            ..PmuTable::default()
        }
    }

    fn context() -> PmuContext<SimulatedPmu, SimulatedMonitor> {
        PmuContext::new(SimulatedPmu::new(), SimulatedMonitor::new(FID), &table(), PollConfig::fast()).unwrap()
    }

    #[test]
    fn test_secure_register_never_touches_mmio() {
        let mut pmu = context();
        pmu.monitor_mut().poke(PMU + CP_CTRL_S as u64, 0x1234_0001);
        pmu.cp_init().unwrap();

        // Non-secure register went through MMIO.
        assert_eq!(pmu.backend().peek(PMU + CP_CTRL_NS as u64), 0x1);
        // Secure register did not.
        assert_eq!(pmu.backend().writes_to(PMU + CP_CTRL_S as u64), 0);
        assert_eq!(pmu.backend().reads_of(PMU + CP_CTRL_S as u64), 0);

        let pa = PMU + CP_CTRL_S as u64;
        let call = |arg1: u32, arg2: u64| SmcCall {
            function_id: FID,
            arg0: pa,
            arg1: arg1 as u64,
            arg2,
        };
        assert_eq!(
            pmu.monitor().calls(),
            &[
                call(SMC_CP_READ, 0),
                call(SMC_CP_READ, 1),
                call(SMC_CP_WRITE, 0x0009),
                call(SMC_CP_WRITE, (1 << 16) | 0x1234),
            ]
        );
        assert_eq!(pmu.monitor().peek(pa), 0x1234_0009);
    }

    #[test]
    fn test_secure_atomic_bits_go_through_monitor() {
        let mut t = table();
        if let Some(cp) = t.cp.as_mut() {
            cp.init = vec![SeqDesc::simple(AccessKind::SetBitAtomic, "CP_CTRL_S", PMU, CP_CTRL_S, 0, 0x0001_0001)];
            cp.disable_dump = vec![SeqDesc::simple(AccessKind::ClearBitAtomic, "CP_CTRL_S", PMU, CP_CTRL_S, 0, 0x0000_0100)];
        }
        let mut pmu = PmuContext::new(SimulatedPmu::new(), SimulatedMonitor::new(FID), &t, PollConfig::fast()).unwrap();
        let pa = PMU + CP_CTRL_S as u64;
        pmu.monitor_mut().poke(pa, 0x1234_0100);
        pmu.backend_mut().clear_log();

        pmu.cp_init().unwrap();
        assert!(pmu.backend().written_addresses().is_empty());
        assert_eq!(pmu.backend().reads_of(pa), 0);
        let call = |arg1: u32, arg2: u64| SmcCall {
            function_id: FID,
            arg0: pa,
            arg1: arg1 as u64,
            arg2,
        };
        assert_eq!(
            pmu.monitor().calls(),
            &[
                call(SMC_CP_READ, 0),
                call(SMC_CP_READ, 1),
                call(SMC_CP_WRITE, 0x0101),
                call(SMC_CP_WRITE, (1 << 16) | 0x1235),
            ]
        );
        assert_eq!(pmu.monitor().peek(pa), 0x1235_0101);

        pmu.cp_disable_dump().unwrap();
        assert!(pmu.backend().written_addresses().is_empty());
        assert_eq!(pmu.monitor().calls().len(), 8);
        assert_eq!(pmu.monitor().peek(pa), 0x1235_0001);
    }

    #[test]
    fn test_secure_read_combines_halves() {
        let mut pmu = context();
        pmu.monitor_mut().poke(PMU + CP_CTRL_S as u64, 0x0001_0000);
        // enable_dump is a single masked read of the secure register.
        assert!(pmu.cp_run(CpSeq::EnableDump).unwrap());
        pmu.monitor_mut().poke(PMU + CP_CTRL_S as u64, 0x0000_FFFF);
        assert!(!pmu.cp_run(CpSeq::EnableDump).unwrap());
    }

    #[test]
    fn test_reset_assert_and_release() {
        let mut pmu = context();
        let pa = PMU + CP_CTRL_S as u64;
        pmu.monitor_mut().poke(pa, 0x8);
        pmu.cp_reset_assert().unwrap();
        assert_eq!(pmu.monitor().peek(pa), 0x108);
        pmu.cp_reset_release().unwrap();
        assert_eq!(pmu.monitor().peek(pa), 0x8);
    }

    #[test]
    fn test_monitor_failure_is_secure_call_error() {
        let mut pmu = context();
        pmu.monitor_mut().fail_with(0x2);
        assert_eq!(
            pmu.cp_reset_assert().unwrap_err(),
            PmucalError::SecureCall {
                function_id: FID,
                status: 0x2
            }
        );
    }

    #[test]
    fn test_status_and_wait_online() {
        let mut pmu = context();
        assert!(!pmu.cp_status().unwrap());
        pmu.backend_mut().script_after_reads(PMU + CP_STATUS as u64, 3, 0x1);
        pmu.cp_wait_online().unwrap();
        assert!(pmu.cp_status().unwrap());
    }

    #[test]
    fn test_wait_online_times_out_after_budget() {
        let mut pmu = context();
        pmu.backend_mut().clear_log();
        let err = pmu.cp_wait_online().unwrap_err();
        assert_eq!(
            err,
            PmucalError::Timeout {
                index: 0,
                label: "CP_STATUS".to_string(),
                addr: PMU + CP_STATUS as u64
            }
        );
        let budget = PollConfig::fast().cp_status.max_iterations as usize;
        assert_eq!(pmu.backend().reads_of(PMU + CP_STATUS as u64), budget);
    }

    #[test]
    fn test_missing_sequence() {
        let mut pmu = context();
        assert!(matches!(
            pmu.cp_disable_dump().unwrap_err(),
            PmucalError::Config(ConfigError::MissingSequence { entity: "cp", op: "disable_dump", .. })
        ));

        let mut t = table();
        t.cp = None;
        let mut pmu = PmuContext::new(SimulatedPmu::new(), SimulatedMonitor::new(FID), &t, PollConfig::fast()).unwrap();
        assert!(pmu.cp_init().is_err());
    }

    #[test]
    fn test_without_window_everything_is_mmio() {
        let mut t = table();
        if let Some(cp) = t.cp.as_mut() {
            cp.secure = None;
        }
        let mut pmu = PmuContext::new(SimulatedPmu::new(), SimulatedMonitor::new(FID), &t, PollConfig::fast()).unwrap();
        pmu.cp_init().unwrap();
        assert_eq!(pmu.backend().peek(PMU + CP_CTRL_S as u64), 0x8);
        assert!(pmu.monitor().calls().is_empty());
    }
}
