//! Option byte commands

use crate::cli::Watchdog;
use crate::commands::CommandError;
use wchflash_core::bank::FlashBank;
use wchflash_core::options::{self, UserOptionPatch};
use wchflash_core::regs::{ObStatus, RDP_KEY};
use wchflash_core::target::DebugTarget;

/// Run the `options read` command
pub fn run_read<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &mut FlashBank,
) -> Result<(), CommandError> {
    bank.auto_probe(target)?;
    options::read_options(target, bank)?;

    let obr = ObStatus::from_bits_retain(target.read_u32(bank.regs().obr())?);
    let opts = *bank.option_bytes();

    if obr.contains(ObStatus::OBERR) {
        println!("Option byte complement error: yes");
    }
    println!(
        "Read protection: {}",
        if opts.rdp == RDP_KEY { "off" } else { "on" }
    );
    println!(
        "Watchdog: {}",
        if opts.sw_watchdog() { "software" } else { "hardware" }
    );
    println!(
        "Stop mode entry: {}",
        if opts.no_reset_on_stop() { "no reset" } else { "reset" }
    );
    println!(
        "Standby mode entry: {}",
        if opts.no_reset_on_standby() { "no reset" } else { "reset" }
    );
    println!("RAM code mode: {}", opts.ram_code_mode());
    println!("User data: {:#06x}", opts.data);
    println!("Protection mask: {:#010x} (bit clear = protected)", opts.protection);

    Ok(())
}

/// Run the `options write` command
#[allow(clippy::too_many_arguments)]
pub fn run_write<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &mut FlashBank,
    watchdog: Option<Watchdog>,
    reset_on_stop: Option<bool>,
    reset_on_standby: Option<bool>,
    ram_code_mode: Option<u8>,
    user_data: Option<u16>,
) -> Result<(), CommandError> {
    bank.auto_probe(target)?;

    let patch = UserOptionPatch {
        sw_watchdog: watchdog.map(|w| w == Watchdog::Software),
        // The option bits are "no reset" flags, the CLI asks the positive
        // question
        no_reset_on_stop: reset_on_stop.map(|reset| !reset),
        no_reset_on_standby: reset_on_standby.map(|reset| !reset),
        ram_code_mode,
        data: user_data,
    };
    if patch == UserOptionPatch::default() {
        return Err(CommandError::Usage(
            "no option changes requested, see --help for the available flags".into(),
        ));
    }

    options::apply_user_options(target, bank, &patch)?;
    println!("Option bytes written (most take effect after reset)");

    run_read(target, bank)
}

/// Run the lock command (enable read protection)
pub fn run_lock<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &mut FlashBank,
) -> Result<(), CommandError> {
    bank.auto_probe(target)?;
    options::lock_device(target, bank)?;
    println!("Device locked, read protection engages after reset");
    Ok(())
}

/// Run the unlock command (disable read protection)
pub fn run_unlock<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &mut FlashBank,
) -> Result<(), CommandError> {
    bank.auto_probe(target)?;
    options::unlock_device(target, bank)?;
    println!("Device unlocked, flash contents are mass-erased by hardware");
    Ok(())
}
