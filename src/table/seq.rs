//! Sequence step descriptors.
//!
//! A [`SeqDesc`] is one row of a PMU sequence table, still expressed in
//! physical addresses. It corresponds to a single register micro-operation:
//!
//! ```text
//! kind, name, base, offset, mask, value, cond_base, cond_offset, cond_mask, cond_value
//! ```
//!
//! The target register is `base + offset`; the optional condition register
//! is `cond_base + cond_offset`. Address zero means "no register".
//! Descriptors are resolved into executable steps by
//! [`crate::pmucal::SeqStep::resolve`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Register access kind of a sequence step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    /// Masked read; result stored back into the step's value.
    Read,
    /// Raw write (full mask) or read-modify-write.
    Write,
    /// Read only if the condition register matches.
    CondRead,
    /// Write only if the condition register matches.
    CondWrite,
    /// Captured by a save pass, written back by a restore pass.
    SaveRestore,
    /// SaveRestore gated by the condition register.
    CondSaveRestore,
    /// Poll until `(reg & mask) == value`.
    Wait,
    /// Poll until both target and condition registers match.
    WaitTwo,
    /// Decide whether the next step runs.
    CheckSkip,
    /// CheckSkip gated by the condition register.
    CondCheckSkip,
    /// Write, then wait on the same register.
    WriteWait,
    /// Re-write while the condition register matches.
    WriteRetry,
    /// Re-write while the condition register does not match.
    WriteRetryInv,
    /// Write and end the sequence.
    WriteReturn,
    /// Set bits through the hardware atomic-set alias.
    SetBitAtomic,
    /// Clear bits through the hardware atomic-clear alias.
    ClearBitAtomic,
    /// Busy-wait `value` microseconds.
    Delay,
    /// Acknowledge a pending bit read from the condition register.
    ClearPend,
    /// Call a firmware function: `mask` selects it, `value` is its argument.
    ExtFunc,
}

impl AccessKind {
    /// Every kind touches a target register except `Delay` and `ExtFunc`.
    pub fn needs_target(&self) -> bool {
        !matches!(self, AccessKind::Delay | AccessKind::ExtFunc)
    }

    /// Kinds that cannot run without a condition register.
    pub fn needs_condition(&self) -> bool {
        matches!(
            self,
            AccessKind::CondRead
                | AccessKind::CondWrite
                | AccessKind::CondSaveRestore
                | AccessKind::CondCheckSkip
                | AccessKind::WaitTwo
                | AccessKind::WriteRetry
                | AccessKind::WriteRetryInv
                | AccessKind::ClearPend
        )
    }

    /// Kinds captured by a save pass.
    pub fn is_save_restore(&self) -> bool {
        matches!(self, AccessKind::SaveRestore | AccessKind::CondSaveRestore)
    }

    /// Short upper-case mnemonic for logs and summaries.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            AccessKind::Read => "READ",
            AccessKind::Write => "WRITE",
            AccessKind::CondRead => "COND_READ",
            AccessKind::CondWrite => "COND_WRITE",
            AccessKind::SaveRestore => "SAVE_RESTORE",
            AccessKind::CondSaveRestore => "COND_SAVE_RESTORE",
            AccessKind::Wait => "WAIT",
            AccessKind::WaitTwo => "WAIT_TWO",
            AccessKind::CheckSkip => "CHECK_SKIP",
            AccessKind::CondCheckSkip => "COND_CHECK_SKIP",
            AccessKind::WriteWait => "WRITE_WAIT",
            AccessKind::WriteRetry => "WRITE_RETRY",
            AccessKind::WriteRetryInv => "WRITE_RETRY_INV",
            AccessKind::WriteReturn => "WRITE_RETURN",
            AccessKind::SetBitAtomic => "SET_BIT_ATOMIC",
            AccessKind::ClearBitAtomic => "CLR_BIT_ATOMIC",
            AccessKind::Delay => "DELAY",
            AccessKind::ClearPend => "CLEAR_PEND",
            AccessKind::ExtFunc => "EXT_FUNC",
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// One unresolved sequence step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqDesc {
    /// Access kind.
    pub kind: AccessKind,
    /// Register name, diagnostic only.
    pub name: String,
    /// Physical base of the target block.
    #[serde(default)]
    pub base: u64,
    /// Target offset within the block.
    #[serde(default)]
    pub offset: u32,
    /// Bit mask.
    #[serde(default)]
    pub mask: u32,
    /// Value written, polled for, or compared against.
    #[serde(default)]
    pub value: u32,
    /// Physical base of the condition block.
    #[serde(default)]
    pub cond_base: u64,
    /// Condition offset within its block.
    #[serde(default)]
    pub cond_offset: u32,
    /// Condition mask.
    #[serde(default)]
    pub cond_mask: u32,
    /// Expected condition value.
    #[serde(default)]
    pub cond_value: u32,
}

impl SeqDesc {
    /// Build a descriptor from a full table row.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: AccessKind,
        name: &str,
        base: u64,
        offset: u32,
        mask: u32,
        value: u32,
        cond_base: u64,
        cond_offset: u32,
        cond_mask: u32,
        cond_value: u32,
    ) -> Self {
        Self {
            kind,
            name: name.to_string(),
            base,
            offset,
            mask,
            value,
            cond_base,
            cond_offset,
            cond_mask,
            cond_value,
        }
    }

    /// Descriptor without a condition register.
    pub fn simple(kind: AccessKind, name: &str, base: u64, offset: u32, mask: u32, value: u32) -> Self {
        Self::new(kind, name, base, offset, mask, value, 0, 0, 0, 0)
    }

    /// Attach a condition register.
    pub fn with_condition(mut self, cond_base: u64, cond_offset: u32, cond_mask: u32, cond_value: u32) -> Self {
        self.cond_base = cond_base;
        self.cond_offset = cond_offset;
        self.cond_mask = cond_mask;
        self.cond_value = cond_value;
        self
    }

    /// Physical target address, `None` when zero.
    pub fn target_phys(&self) -> Option<u64> {
        let addr = self.base + self.offset as u64;
        (addr != 0).then_some(addr)
    }

    /// Physical condition address, `None` when zero.
    pub fn cond_phys(&self) -> Option<u64> {
        let addr = self.cond_base + self.cond_offset as u64;
        (addr != 0).then_some(addr)
    }
}

impl fmt::Display for SeqDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<17} {:<28} 0x{:08X} mask=0x{:08X} value=0x{:08X}",
            self.kind,
            self.name,
            self.base + self.offset as u64,
            self.mask,
            self.value
        )?;
        if let Some(cond) = self.cond_phys() {
            write!(f, " if (0x{:08X} & 0x{:08X}) == 0x{:08X}", cond, self.cond_mask, self.cond_value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert!(!AccessKind::Delay.needs_target());
        assert!(AccessKind::Read.needs_target());
        assert!(AccessKind::ClearPend.needs_condition());
        assert!(!AccessKind::Write.needs_condition());
        assert!(!AccessKind::ExtFunc.needs_target());
        assert!(!AccessKind::ExtFunc.needs_condition());
        assert!(AccessKind::CondSaveRestore.is_save_restore());
    }

    #[test]
    fn test_zero_address_is_absent() {
        let desc = SeqDesc::simple(AccessKind::Delay, "settle", 0, 0, 0, 10);
        assert_eq!(desc.target_phys(), None);
        assert_eq!(desc.cond_phys(), None);

        let desc = SeqDesc::simple(AccessKind::Write, "CPU0_CONFIG", 0, 0x1000, 0xF, 0x1);
        assert_eq!(desc.target_phys(), Some(0x1000));
    }

    #[test]
    fn test_kind_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: AccessKind,
        }
        let w: Wrapper = toml::from_str("kind = \"write_retry_inv\"").unwrap();
        assert_eq!(w.kind, AccessKind::WriteRetryInv);
        let w: Wrapper = toml::from_str("kind = \"clear_pend\"").unwrap();
        assert_eq!(w.kind, AccessKind::ClearPend);
        let w: Wrapper = toml::from_str("kind = \"ext_func\"").unwrap();
        assert_eq!(w.kind, AccessKind::ExtFunc);
    }

    #[test]
    fn test_display_includes_condition() {
        let desc = SeqDesc::simple(AccessKind::ClearPend, "GRP1_INTR_BID_CLEAR", 0x1587_0000, 0x010C, 0x1, 0x1)
            .with_condition(0x1587_0000, 0x0108, 0x1, 0);
        let text = desc.to_string();
        assert!(text.contains("CLEAR_PEND"));
        assert!(text.contains("0x1587010C"));
        assert!(text.contains("0x15870108"));
    }
}
