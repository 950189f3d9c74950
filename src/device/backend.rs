//! Hardware access capabilities.
//!
//! The sequencer never touches memory directly. Register I/O, the busy-wait
//! delay and block mapping go through [`RegisterBackend`]; calls into the
//! trust-zone monitor go through [`SecureMonitor`]. Real hardware plugs in
//! [`DevMemBackend`](super::DevMemBackend), tests plug in
//! [`SimulatedPmu`](super::SimulatedPmu) and
//! [`SimulatedMonitor`](super::SimulatedMonitor).

/// Memory-mapped register access.
pub trait RegisterBackend {
    /// Map `size` bytes of physical register space starting at `phys_base`.
    ///
    /// Returns the mapped base address, or `None` when the block cannot be
    /// mapped.
    fn map_block(&mut self, phys_base: u64, size: u64) -> Option<u64>;

    /// Read a 32-bit register at a mapped address.
    fn read32(&mut self, addr: u64) -> u32;

    /// Write a 32-bit register at a mapped address.
    fn write32(&mut self, addr: u64, value: u32);

    /// Busy-wait for `us` microseconds.
    fn delay_us(&mut self, us: u32);
}

/// Secure monitor call interface.
pub trait SecureMonitor {
    /// Issue a secure monitor call and return its raw result.
    fn smc(&mut self, function_id: u32, arg0: u64, arg1: u64, arg2: u64) -> u64;
}

/// Status returned by [`NoSecureMonitor`] for every call.
pub const SMC_NOT_SUPPORTED: u64 = 0xFFFF;

/// Secure monitor for platforms without a reachable monitor.
///
/// Every call fails with [`SMC_NOT_SUPPORTED`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSecureMonitor;

impl SecureMonitor for NoSecureMonitor {
    fn smc(&mut self, function_id: u32, _arg0: u64, _arg1: u64, _arg2: u64) -> u64 {
        log::warn!("SMC 0x{:08X} issued without a secure monitor", function_id);
        SMC_NOT_SUPPORTED
    }
}

impl<T: RegisterBackend + ?Sized> RegisterBackend for &mut T {
    fn map_block(&mut self, phys_base: u64, size: u64) -> Option<u64> {
        (**self).map_block(phys_base, size)
    }

    fn read32(&mut self, addr: u64) -> u32 {
        (**self).read32(addr)
    }

    fn write32(&mut self, addr: u64, value: u32) {
        (**self).write32(addr, value)
    }

    fn delay_us(&mut self, us: u32) {
        (**self).delay_us(us)
    }
}

impl<T: SecureMonitor + ?Sized> SecureMonitor for &mut T {
    fn smc(&mut self, function_id: u32, arg0: u64, arg1: u64, arg2: u64) -> u64 {
        (**self).smc(function_id, arg0, arg1, arg2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_secure_monitor_fails() {
        let mut monitor = NoSecureMonitor;
        assert_eq!(monitor.smc(0x8200_0000, 0, 0, 0), SMC_NOT_SUPPORTED);
    }
}
