//! Flash controller register protocol
//!
//! Typed addresses and bit sets for the CH32F2x flash controller, plus the
//! busy-poll primitive shared by every multi-step sequence. The register
//! map is a plain value object constructed per flash bank; nothing here
//! holds state beyond the controller base address.

use crate::error::{Error, Result};
use crate::target::DebugTarget;
use bitflags::bitflags;
use maybe_async::maybe_async;

/// Default flash controller base address
pub const FLASH_REG_BASE: u32 = 0x4002_2000;

/// Flash bank base in the target address space
pub const FLASH_BANK_BASE: u32 = 0x0800_0000;

/// Option byte region base
pub const OPTION_BYTE_BASE: u32 = 0x1FFF_F800;

/// Flash size register (u16, KiB)
pub const FLASH_SIZE_REG: u32 = 0x1FFF_F7E0;

/// Device ID register
pub const IDCODE_REG: u32 = 0xE004_2000;

/// First unlock key, written to any of the three key registers
pub const KEY1: u32 = 0x4567_0123;
/// Second unlock key
pub const KEY2: u32 = 0xCDEF_89AB;

/// Factory read-protection key: this value in the RDP option byte means
/// the device is *not* read protected
pub const RDP_KEY: u8 = 0xA5;

bitflags! {
    /// Status register (offset 0x0C) bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        /// Operation in progress
        const BSY      = 1 << 0;
        /// Fast-program word write in progress
        const WRBSY    = 1 << 1;
        /// Write protection error (write 1 to clear)
        const WRPRTERR = 1 << 4;
        /// End of operation (write 1 to clear)
        const EOP      = 1 << 5;
    }
}

bitflags! {
    /// Control register (offset 0x10) bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Control: u32 {
        /// Halfword program mode
        const PG     = 1 << 0;
        /// 4 KiB sector erase mode
        const PER    = 1 << 1;
        /// Mass erase mode
        const MER    = 1 << 2;
        /// Option byte program mode
        const OBPG   = 1 << 4;
        /// Option byte erase mode
        const OBER   = 1 << 5;
        /// Start strobe for the selected erase mode
        const STRT   = 1 << 6;
        /// Main lock; cleared by the key sequence
        const LOCK   = 1 << 7;
        /// Option byte write enable; set by the option key sequence
        const OBWRE  = 1 << 9;
        /// Fast-mode lock; cleared by the mode-key sequence
        const FLOCK  = 1 << 15;
        /// Fast page program mode
        const FTPG   = 1 << 16;
        /// Fast page erase mode (256 byte pages)
        const FTER   = 1 << 17;
        /// 32 KiB block erase mode
        const BER32  = 1 << 18;
        /// 64 KiB block erase mode
        const BER64  = 1 << 19;
        /// Start strobe for a fast page program burst
        const PGSTRT = 1 << 21;
    }
}

bitflags! {
    /// Option byte status register (offset 0x1C) bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObStatus: u32 {
        /// Option byte complement mismatch
        const OBERR       = 1 << 0;
        /// Read protection active
        const RDPRT       = 1 << 1;
        /// Software watchdog selected (hardware IWDG off)
        const IWDG_SW     = 1 << 2;
        /// No reset on stop-mode entry
        const STOP_RST    = 1 << 3;
        /// No reset on standby-mode entry
        const STANDBY_RST = 1 << 4;
    }
}

/// Poll budgets per operation class, in 1 ms poll rounds
pub mod timeout {
    /// Short register commands (mode changes, lock polling)
    pub const COMMAND: u32 = 5;
    /// Single halfword program
    pub const WRITE: u32 = 20;
    /// Any erase granularity, including mass erase
    pub const ERASE: u32 = 160;
}

/// Flash controller register addresses for one bank
///
/// Constructed once per [`crate::bank::FlashBank`] from the controller
/// base address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    base: u32,
}

impl RegisterMap {
    /// Register map at the given controller base address
    pub const fn new(base: u32) -> Self {
        Self { base }
    }

    /// Controller base address
    pub const fn base(&self) -> u32 {
        self.base
    }

    /// Main unlock key register (0x04)
    pub const fn keyr(&self) -> u32 {
        self.base + 0x04
    }

    /// Option byte unlock key register (0x08)
    pub const fn obkeyr(&self) -> u32 {
        self.base + 0x08
    }

    /// Status register (0x0C)
    pub const fn statr(&self) -> u32 {
        self.base + 0x0C
    }

    /// Control register (0x10)
    pub const fn ctlr(&self) -> u32 {
        self.base + 0x10
    }

    /// Erase/program address register (0x14)
    pub const fn addr(&self) -> u32 {
        self.base + 0x14
    }

    /// Option byte status register (0x1C)
    pub const fn obr(&self) -> u32 {
        self.base + 0x1C
    }

    /// Write protection mask register (0x20)
    pub const fn wpr(&self) -> u32 {
        self.base + 0x20
    }

    /// Fast-mode unlock key register (0x24)
    pub const fn modekeyr(&self) -> u32 {
        self.base + 0x24
    }
}

/// Read the status register
#[maybe_async]
pub async fn read_status<T: DebugTarget + ?Sized>(
    target: &mut T,
    regs: &RegisterMap,
) -> Result<Status> {
    Ok(Status::from_bits_retain(target.read_u32(regs.statr()).await?))
}

/// Read the control register
#[maybe_async]
pub async fn read_control<T: DebugTarget + ?Sized>(
    target: &mut T,
    regs: &RegisterMap,
) -> Result<Control> {
    Ok(Control::from_bits_retain(target.read_u32(regs.ctlr()).await?))
}

/// Write the control register
#[maybe_async]
pub async fn write_control<T: DebugTarget + ?Sized>(
    target: &mut T,
    regs: &RegisterMap,
    value: Control,
) -> Result<()> {
    target.write_u32(regs.ctlr(), value.bits()).await
}

/// Wait for the busy bit to clear, checking for protection errors
///
/// Polls the status register once per millisecond for up to `rounds`
/// polls. A set WRPRTERR bit is cleared (write 1 to clear) and reported as
/// [`Error::ProtectionViolation`]; a poll budget overrun is reported as
/// [`Error::BusyTimeout`].
#[maybe_async]
pub async fn wait_status_busy<T: DebugTarget + ?Sized>(
    target: &mut T,
    regs: &RegisterMap,
    rounds: u32,
) -> Result<()> {
    let mut remaining = rounds;
    let status = loop {
        let status = read_status(target, regs).await?;
        log::trace!("flash status: {:#010x}", status.bits());
        if !status.contains(Status::BSY) {
            break status;
        }
        if remaining == 0 {
            log::error!("timed out waiting for flash");
            return Err(Error::BusyTimeout);
        }
        remaining -= 1;
        target.delay_ms(1).await;
    };

    if status.contains(Status::WRPRTERR) {
        log::error!("flash write protection error");
        // W1C: writing the set bit back clears it
        target.write_u32(regs.statr(), status.bits()).await?;
        return Err(Error::ProtectionViolation);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_addresses_follow_base() {
        let regs = RegisterMap::new(0x4002_2000);
        assert_eq!(regs.keyr(), 0x4002_2004);
        assert_eq!(regs.obkeyr(), 0x4002_2008);
        assert_eq!(regs.statr(), 0x4002_200C);
        assert_eq!(regs.ctlr(), 0x4002_2010);
        assert_eq!(regs.addr(), 0x4002_2014);
        assert_eq!(regs.obr(), 0x4002_201C);
        assert_eq!(regs.wpr(), 0x4002_2020);
        assert_eq!(regs.modekeyr(), 0x4002_2024);
    }

    #[test]
    fn control_bits_match_hardware_layout() {
        assert_eq!(Control::PG.bits(), 1 << 0);
        assert_eq!(Control::PER.bits(), 1 << 1);
        assert_eq!(Control::MER.bits(), 1 << 2);
        assert_eq!(Control::OBER.bits(), 1 << 5);
        assert_eq!(Control::STRT.bits(), 1 << 6);
        assert_eq!(Control::LOCK.bits(), 1 << 7);
        assert_eq!(Control::OBWRE.bits(), 1 << 9);
        assert_eq!(Control::FLOCK.bits(), 1 << 15);
        assert_eq!(Control::FTPG.bits(), 1 << 16);
        assert_eq!(Control::FTER.bits(), 1 << 17);
        assert_eq!(Control::BER32.bits(), 1 << 18);
        assert_eq!(Control::BER64.bits(), 1 << 19);
        assert_eq!(Control::PGSTRT.bits(), 1 << 21);
        assert_eq!(Status::WRPRTERR.bits(), 1 << 4);
    }
}
