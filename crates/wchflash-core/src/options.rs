//! Option bytes: read protection, user configuration, write protection
//!
//! Option bytes live in a dedicated info page and are programmed through
//! their own erase/program control bits behind the OBWRE lock. In memory
//! each byte occupies a halfword lane with its hardware-maintained
//! complement in the high byte; the host only ever writes the value, the
//! controller fills in the complement. Changing anything means erasing the
//! whole page and rewriting every byte, so all writers here go through the
//! cached [`OptionBytes`] image.

use crate::bank::FlashBank;
use crate::error::{Error, Result};
use crate::regs::{self, timeout, Control, ObStatus, OPTION_BYTE_BASE};
use crate::target::DebugTarget;
use crate::unlock;
use maybe_async::maybe_async;

/// Mask of the RAM code mode field inside the user option byte
const USER_RAM_CODE_MASK: u8 = 0b1100_0000;
/// Shift of the RAM code mode field
const USER_RAM_CODE_SHIFT: u8 = 6;

/// Cached image of the option byte page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptionBytes {
    /// Read protection byte; the factory key value means unprotected
    pub rdp: u8,
    /// User configuration byte
    pub user: u8,
    /// The two free data bytes, low lane first
    pub data: u16,
    /// Write protection mask, one bit per block, bit clear = protected
    pub protection: u32,
}

impl OptionBytes {
    /// Software watchdog selected (hardware IWDG disabled)
    pub fn sw_watchdog(&self) -> bool {
        self.user & 1 != 0
    }

    /// No reset on stop-mode entry
    pub fn no_reset_on_stop(&self) -> bool {
        self.user & (1 << 1) != 0
    }

    /// No reset on standby-mode entry
    pub fn no_reset_on_standby(&self) -> bool {
        self.user & (1 << 2) != 0
    }

    /// RAM code mode field (device specific boot RAM sizing)
    pub fn ram_code_mode(&self) -> u8 {
        (self.user & USER_RAM_CODE_MASK) >> USER_RAM_CODE_SHIFT
    }
}

/// Requested changes to the user option byte and data bytes
///
/// Unset fields keep their current value. Applied on top of a fresh
/// [`read_options`] image before writing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserOptionPatch {
    /// Select the software watchdog
    pub sw_watchdog: Option<bool>,
    /// Suppress the reset on stop-mode entry
    pub no_reset_on_stop: Option<bool>,
    /// Suppress the reset on standby-mode entry
    pub no_reset_on_standby: Option<bool>,
    /// RAM code mode field (two bits)
    pub ram_code_mode: Option<u8>,
    /// Replace the free data bytes
    pub data: Option<u16>,
}

impl UserOptionPatch {
    /// Apply the requested changes to an option byte image
    pub fn apply(&self, options: &mut OptionBytes) {
        let mut set_bit = |bit: u8, on: Option<bool>| match on {
            Some(true) => options.user |= 1 << bit,
            Some(false) => options.user &= !(1 << bit),
            None => {}
        };
        set_bit(0, self.sw_watchdog);
        set_bit(1, self.no_reset_on_stop);
        set_bit(2, self.no_reset_on_standby);
        if let Some(mode) = self.ram_code_mode {
            options.user = (options.user & !USER_RAM_CODE_MASK)
                | ((mode << USER_RAM_CODE_SHIFT) & USER_RAM_CODE_MASK);
        }
        if let Some(data) = self.data {
            options.data = data;
        }
    }
}

/// Refresh the bank's cached option byte image from the device
#[maybe_async]
pub async fn read_options<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &mut FlashBank,
) -> Result<()> {
    let regs = *bank.regs();
    let obr = ObStatus::from_bits_retain(target.read_u32(regs.obr()).await?);

    bank.option_bytes.rdp = if obr.contains(ObStatus::RDPRT) {
        0
    } else {
        bank.default_rdp
    };
    bank.option_bytes.user = (obr.bits() >> 2) as u8;

    // Data bytes sit in the low lanes of one word, complements in between
    let data = target.read_u32(OPTION_BYTE_BASE + 4).await?;
    bank.option_bytes.data = (data & 0xFF) as u16 | (((data >> 16) & 0xFF) as u16) << 8;

    bank.option_bytes.protection = target.read_u32(regs.wpr()).await?;

    if obr.contains(ObStatus::RDPRT) {
        log::info!("device is read protected");
    }

    Ok(())
}

/// Erase the option byte page
///
/// Resets the cached read protection byte to the factory key; everything
/// else keeps its cached value for a follow-up [`write_options`].
#[maybe_async]
pub async fn erase_options<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &mut FlashBank,
) -> Result<()> {
    let regs = *bank.regs();

    read_options(target, bank).await?;

    unlock::unlock_options(target, &regs).await?;
    regs::wait_status_busy(target, &regs, timeout::COMMAND).await?;

    let ctrl = regs::read_control(target, &regs).await?;
    regs::write_control(target, &regs, ctrl | Control::OBER).await?;
    regs::write_control(target, &regs, ctrl | Control::OBER | Control::STRT).await?;
    regs::wait_status_busy(target, &regs, timeout::ERASE).await?;

    let ctrl = regs::read_control(target, &regs).await?;
    regs::write_control(target, &regs, ctrl & !Control::OBER).await?;
    regs::wait_status_busy(target, &regs, timeout::COMMAND).await?;

    // Erased means unprotected
    bank.option_bytes.rdp = bank.default_rdp;
    Ok(())
}

/// Program the cached option byte image into the freshly erased page
#[maybe_async]
pub async fn write_options<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &mut FlashBank,
) -> Result<()> {
    let regs = *bank.regs();

    unlock::unlock_options(target, &regs).await?;
    regs::wait_status_busy(target, &regs, timeout::COMMAND).await?;

    let ctrl = regs::read_control(target, &regs).await?;
    regs::write_control(target, &regs, ctrl | Control::OBPG).await?;
    regs::write_control(target, &regs, ctrl | Control::OBPG | Control::STRT).await?;

    let opts = bank.option_bytes;
    let lanes: [u16; 8] = [
        u16::from(opts.rdp),
        u16::from(opts.user),
        opts.data & 0xFF,
        opts.data >> 8,
        (opts.protection & 0xFF) as u16,
        ((opts.protection >> 8) & 0xFF) as u16,
        ((opts.protection >> 16) & 0xFF) as u16,
        ((opts.protection >> 24) & 0xFF) as u16,
    ];
    for (i, lane) in lanes.iter().enumerate() {
        target.write_u16(OPTION_BYTE_BASE + 2 * i as u32, *lane).await?;
        regs::wait_status_busy(target, &regs, timeout::WRITE).await?;
    }

    let ctrl = regs::read_control(target, &regs).await?;
    regs::write_control(target, &regs, ctrl & !Control::OBPG).await?;
    regs::wait_status_busy(target, &regs, timeout::COMMAND).await
}

/// Apply user option changes, preserving everything the patch leaves out
///
/// Reads the current image, erases the option page and rewrites it with
/// the patch applied.
#[maybe_async]
pub async fn apply_user_options<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &mut FlashBank,
    patch: &UserOptionPatch,
) -> Result<()> {
    if !target.is_halted().await? {
        log::error!("target not halted");
        return Err(Error::NotHalted);
    }
    erase_options(target, bank).await?;
    patch.apply(&mut bank.option_bytes);
    write_options(target, bank).await
}

/// Change write protection for the inclusive block range `[first, last]`
///
/// Requires an option page rewrite, so all other option bytes are
/// preserved through the cached image.
#[maybe_async]
pub async fn protect<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &mut FlashBank,
    set: bool,
    first: u32,
    last: u32,
) -> Result<()> {
    if !target.is_halted().await? {
        log::error!("target not halted");
        return Err(Error::NotHalted);
    }
    if first > last || last >= bank.num_prot_blocks() {
        return Err(Error::InvalidRange);
    }

    erase_options(target, bank).await?;

    // Hardware polarity: a clear mask bit protects the block
    for block in first..=last {
        if set {
            bank.option_bytes.protection &= !(1 << block);
        } else {
            bank.option_bytes.protection |= 1 << block;
        }
    }

    write_options(target, bank).await
}

/// Blocks currently write protected, one bit per block, bit set = protected
///
/// Active read protection implicitly protects the block holding the boot
/// flash, which the mask register does not reflect.
#[maybe_async]
pub async fn protect_check<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &FlashBank,
) -> Result<u32> {
    let regs = *bank.regs();
    let wpr = target.read_u32(regs.wpr()).await?;
    let obr = ObStatus::from_bits_retain(target.read_u32(regs.obr()).await?);

    let mut protected = !wpr;
    if obr.contains(ObStatus::RDPRT) {
        protected |= 1;
    }
    if bank.num_prot_blocks() < 32 {
        protected &= (1u32 << bank.num_prot_blocks()) - 1;
    }
    Ok(protected)
}

/// Enable read protection (takes effect after the next reset)
#[maybe_async]
pub async fn lock_device<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &mut FlashBank,
) -> Result<()> {
    if !target.is_halted().await? {
        log::error!("target not halted");
        return Err(Error::NotHalted);
    }
    erase_options(target, bank).await?;
    // Anything but the factory key reads as protected
    bank.option_bytes.rdp = 0;
    write_options(target, bank).await
}

/// Disable read protection (mass-erases the main flash as a side effect
/// on real silicon; takes effect after the next reset)
#[maybe_async]
pub async fn unlock_device<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &mut FlashBank,
) -> Result<()> {
    if !target.is_halted().await? {
        log::error!("target not halted");
        return Err(Error::NotHalted);
    }
    erase_options(target, bank).await?;
    bank.option_bytes.rdp = bank.default_rdp;
    write_options(target, bank).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_byte_accessors() {
        let opts = OptionBytes {
            user: 0b1000_0101,
            ..Default::default()
        };
        assert!(opts.sw_watchdog());
        assert!(!opts.no_reset_on_stop());
        assert!(opts.no_reset_on_standby());
        assert_eq!(opts.ram_code_mode(), 0b10);
    }

    #[test]
    fn patch_touches_only_requested_fields() {
        let mut opts = OptionBytes {
            user: 0xFF,
            data: 0x1234,
            ..Default::default()
        };
        let patch = UserOptionPatch {
            sw_watchdog: Some(false),
            ram_code_mode: Some(0),
            ..Default::default()
        };
        patch.apply(&mut opts);
        assert_eq!(opts.user, 0b0011_1110);
        assert_eq!(opts.data, 0x1234);

        let patch = UserOptionPatch {
            data: Some(0xBEEF),
            ..Default::default()
        };
        patch.apply(&mut opts);
        assert_eq!(opts.user, 0b0011_1110);
        assert_eq!(opts.data, 0xBEEF);
    }

    #[test]
    fn patch_clamps_ram_code_mode() {
        let mut opts = OptionBytes::default();
        UserOptionPatch {
            ram_code_mode: Some(0b11),
            ..Default::default()
        }
        .apply(&mut opts);
        assert_eq!(opts.ram_code_mode(), 0b11);
        assert_eq!(opts.user & !USER_RAM_CODE_MASK, 0);
    }
}
