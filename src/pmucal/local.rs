//! Power-domain control with register save/restore.
//!
//! Domain registers lose their contents when power is cut, so the two
//! transitions are strictly ordered:
//!
//! ```text
//! disable:  save(save)  ->  secure save   ->  execute(off)
//! enable:   execute(on) ->  secure restore ->  restore(save)
//! ```
//!
//! Domains that sit in a trust-zone partition carry a secure callback id;
//! the secure monitor saves and restores the partition state around the
//! transition.

use std::fmt;

use super::rae::{dump_saved, resolve_seq, status_matches, SeqStep};
use super::{lookup, require, resolve_all, PmuContext, Resolved};
use crate::device::{AddressMap, RegisterBackend, SecureMonitor};
use crate::error::{ConfigError, PmucalError, Result};
use crate::table::DomainDesc;

/// Secure monitor call preparing a domain power transition.
pub const PD_SMC_FUNCTION_ID: u32 = 0x8200_0410;
/// Sub-operation: save partition state before power-off.
pub const PD_SMC_SAVE: u64 = 0;
/// Sub-operation: restore partition state after power-on.
pub const PD_SMC_RESTORE: u64 = 1;
/// Protection group passed with every domain call.
pub const PD_SMC_TZPC_GROUP: u64 = 2;

/// Power state of a domain as last driven by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainState {
    #[default]
    Off,
    TransitioningOn,
    On,
    TransitioningOff,
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DomainState::Off => "off",
            DomainState::TransitioningOn => "turning on",
            DomainState::On => "on",
            DomainState::TransitioningOff => "turning off",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
pub(crate) struct DomainSeqs {
    pub name: String,
    pub on: Vec<SeqStep>,
    pub save: Vec<SeqStep>,
    pub off: Vec<SeqStep>,
    pub status: Vec<SeqStep>,
    pub secure_id: Option<u32>,
    pub state: DomainState,
}

impl DomainSeqs {
    fn resolve(desc: &DomainDesc, map: &AddressMap) -> Result<Self> {
        Ok(Self {
            name: desc.name.clone(),
            on: resolve_seq(&desc.on, map)?,
            save: resolve_seq(&desc.save, map)?,
            off: resolve_seq(&desc.off, map)?,
            status: resolve_seq(&desc.status, map)?,
            secure_id: desc.secure_id,
            state: DomainState::Off,
        })
    }
}

#[derive(Debug, Default)]
pub(crate) struct Domains {
    domains: Vec<Resolved<DomainSeqs>>,
    names: Vec<String>,
}

impl Domains {
    pub fn resolve(descs: &[DomainDesc], map: &AddressMap) -> Self {
        Self {
            domains: resolve_all(descs, "domain", |d| &d.name, |d| DomainSeqs::resolve(d, map)),
            names: descs.iter().map(|d| d.name.clone()).collect(),
        }
    }
}

fn secure_call<S: SecureMonitor + ?Sized>(monitor: &mut S, secure_id: u32, op: u64) -> Result<()> {
    let status = monitor.smc(PD_SMC_FUNCTION_ID, secure_id as u64, op, PD_SMC_TZPC_GROUP);
    if status != 0 {
        log::error!(
            "secure {} of partition 0x{:X} failed: 0x{:X}",
            if op == PD_SMC_SAVE { "save" } else { "restore" },
            secure_id,
            status
        );
        return Err(PmucalError::SecureCall {
            function_id: PD_SMC_FUNCTION_ID,
            status,
        });
    }
    Ok(())
}

impl<B: RegisterBackend, S: SecureMonitor> PmuContext<B, S> {
    /// Number of power domains.
    pub fn num_domains(&self) -> usize {
        self.local.domains.len()
    }

    /// Index of a domain by name.
    pub fn pd_index(&self, name: &str) -> Result<usize> {
        self.local.names.iter().position(|n| n == name).ok_or_else(|| {
            ConfigError::UnknownName {
                entity: "domain",
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Name of a domain.
    pub fn pd_name(&self, domain: usize) -> Option<&str> {
        self.local.names.get(domain).map(String::as_str)
    }

    /// Seed each domain's state from its status array.
    pub(crate) fn pd_init_states(&mut self) {
        for (index, entry) in self.local.domains.iter_mut().enumerate() {
            let Ok(pd) = entry else { continue };
            if pd.status.is_empty() {
                continue;
            }
            match self.rae.execute(&mut pd.status) {
                Ok(()) if status_matches(&pd.status) => pd.state = DomainState::On,
                Ok(()) => pd.state = DomainState::Off,
                Err(e) => log::warn!("domain {} ({}): initial status unknown: {}", index, pd.name, e),
            }
            log::debug!("domain {} ({}) starts {}", index, pd.name, pd.state);
        }
    }

    /// Power a domain on and replay its saved registers.
    pub fn pd_enable(&mut self, domain: usize) -> Result<()> {
        let pd = lookup(&mut self.local.domains, "domain", domain)?;
        let on = require(&mut pd.on, "domain", domain, "on")?;

        pd.state = DomainState::TransitioningOn;
        log::debug!("domain {} ({}) on", domain, pd.name);
        self.rae.execute(on)?;
        if let Some(id) = pd.secure_id {
            secure_call(self.rae.monitor_mut(), id, PD_SMC_RESTORE)?;
        }
        self.rae.restore(&mut pd.save)?;
        pd.state = DomainState::On;
        Ok(())
    }

    /// Capture a domain's registers and power it off.
    ///
    /// When the off sequence times out the captured values are dumped at
    /// error level.
    pub fn pd_disable(&mut self, domain: usize) -> Result<()> {
        let pd = lookup(&mut self.local.domains, "domain", domain)?;
        if pd.off.is_empty() {
            return Err(ConfigError::MissingSequence {
                entity: "domain",
                index: domain,
                op: "off",
            }
            .into());
        }

        pd.state = DomainState::TransitioningOff;
        log::debug!("domain {} ({}) off", domain, pd.name);
        self.rae.save(&mut pd.save)?;
        if let Some(id) = pd.secure_id {
            secure_call(self.rae.monitor_mut(), id, PD_SMC_SAVE)?;
        }
        if let Err(e) = self.rae.execute(&mut pd.off) {
            if e.is_timeout() {
                log::error!("domain {} ({}) failed to power off; saved registers:", domain, pd.name);
                dump_saved(&pd.save);
            }
            return Err(e);
        }
        pd.state = DomainState::Off;
        Ok(())
    }

    /// Query whether a domain is powered.
    pub fn pd_is_enabled(&mut self, domain: usize) -> Result<bool> {
        let pd = lookup(&mut self.local.domains, "domain", domain)?;
        let seq = require(&mut pd.status, "domain", domain, "status")?;
        self.rae.execute(seq)?;
        Ok(status_matches(seq))
    }

    /// Last state the controller drove the domain into.
    pub fn pd_state(&mut self, domain: usize) -> Result<DomainState> {
        Ok(lookup(&mut self.local.domains, "domain", domain)?.state)
    }

    /// Attach a secure-monitor callback id to a domain.
    pub fn pd_set_secure_callback_id(&mut self, domain: usize, id: u32) -> Result<()> {
        let pd = lookup(&mut self.local.domains, "domain", domain)?;
        log::debug!("domain {} ({}) secure id 0x{:X}", domain, pd.name, id);
        pd.secure_id = Some(id);
        Ok(())
    }
}
