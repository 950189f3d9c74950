//! SoC low-power modes.
//!
//! A mode is entered from one core and affects the whole SoC:
//!
//! ```text
//! enter:         hint = System(mode) -> save(save) -> execute(enter)
//! exit:          execute(exit)         -> restore(save)
//! early_wakeup:  execute(early_wakeup) -> restore(save) -> hint = Active
//! ```
//!
//! `exit` leaves the hint in place; the caller's idle path clears it once
//! the core is fully back.

use super::rae::{resolve_seq, SeqStep};
use super::{lookup, require, resolve_all, PmuContext, PowerMode, Resolved};
use crate::device::{AddressMap, RegisterBackend, SecureMonitor};
use crate::error::{ConfigError, Result};
use crate::table::{LpmDesc, PmuTable};

#[derive(Debug)]
pub(crate) struct ModeSeqs {
    pub name: String,
    pub enter: Vec<SeqStep>,
    pub save: Vec<SeqStep>,
    pub exit: Vec<SeqStep>,
    pub early_wakeup: Vec<SeqStep>,
}

impl ModeSeqs {
    fn resolve(desc: &LpmDesc, map: &AddressMap) -> Result<Self> {
        Ok(Self {
            name: desc.name.clone(),
            enter: resolve_seq(&desc.enter, map)?,
            save: resolve_seq(&desc.save, map)?,
            exit: resolve_seq(&desc.exit, map)?,
            early_wakeup: resolve_seq(&desc.early_wakeup, map)?,
        })
    }
}

#[derive(Debug)]
pub(crate) struct Modes {
    init: Resolved<Vec<SeqStep>>,
    modes: Vec<Resolved<ModeSeqs>>,
    names: Vec<String>,
}

impl Modes {
    pub fn resolve(table: &PmuTable, map: &AddressMap) -> Self {
        Self {
            init: resolve_seq(&table.lpm_init, map),
            modes: resolve_all(&table.lpms, "lpm", |d| &d.name, |d| ModeSeqs::resolve(d, map)),
            names: table.lpms.iter().map(|d| d.name.clone()).collect(),
        }
    }
}

impl<B: RegisterBackend, S: SecureMonitor> PmuContext<B, S> {
    /// Number of low-power modes.
    pub fn num_lpms(&self) -> usize {
        self.system.modes.len()
    }

    /// Index of a low-power mode by name.
    pub fn lpm_index(&self, name: &str) -> Result<usize> {
        self.system.names.iter().position(|n| n == name).ok_or_else(|| {
            ConfigError::UnknownName {
                entity: "lpm",
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Run the one-time low-power-mode defaults. Called by
    /// [`PmuContext::new`]; running it again rewrites the same defaults.
    pub fn system_init(&mut self) -> Result<()> {
        let init = self.system.init.as_mut().map_err(|e| e.clone())?;
        if init.is_empty() {
            return Ok(());
        }
        log::debug!("low-power-mode init: {} steps", init.len());
        self.rae.execute(init)
    }

    /// Enter a low-power mode on behalf of `cpu`.
    ///
    /// On failure the hint is put back to `Active`: the SoC did not enter
    /// the mode.
    pub fn lpm_enter(&mut self, mode: usize, cpu: usize) -> Result<()> {
        self.hints.check(cpu)?;
        let lpm = lookup(&mut self.system.modes, "lpm", mode)?;
        let enter = require(&mut lpm.enter, "lpm", mode, "enter")?;

        log::debug!("cpu {} enters {} ({})", cpu, mode, lpm.name);
        self.hints.set(cpu, PowerMode::System(mode as u32));
        let result = self.rae.save(&mut lpm.save).and_then(|()| self.rae.execute(enter));
        if result.is_err() {
            self.hints.set(cpu, PowerMode::Active);
        }
        result
    }

    /// Leave a low-power mode after a normal wakeup.
    pub fn lpm_exit(&mut self, mode: usize, cpu: usize) -> Result<()> {
        self.hints.check(cpu)?;
        let lpm = lookup(&mut self.system.modes, "lpm", mode)?;
        let exit = require(&mut lpm.exit, "lpm", mode, "exit")?;

        log::debug!("cpu {} exits {} ({})", cpu, mode, lpm.name);
        self.rae.execute(exit)?;
        self.rae.restore(&mut lpm.save)
    }

    /// Abort a low-power mode entry that the hardware has not committed.
    pub fn lpm_early_wakeup(&mut self, mode: usize, cpu: usize) -> Result<()> {
        self.hints.check(cpu)?;
        let lpm = lookup(&mut self.system.modes, "lpm", mode)?;
        let wakeup = require(&mut lpm.early_wakeup, "lpm", mode, "early_wakeup")?;

        log::debug!("cpu {} early wakeup from {} ({})", cpu, mode, lpm.name);
        self.rae.execute(wakeup)?;
        self.rae.restore(&mut lpm.save)?;
        self.hints.set(cpu, PowerMode::Active);
        Ok(())
    }
}
