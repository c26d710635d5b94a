//! Write protection commands

use crate::commands::CommandError;
use wchflash_core::bank::FlashBank;
use wchflash_core::options;
use wchflash_core::target::DebugTarget;

/// Run the protect/unprotect command
pub fn run<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &mut FlashBank,
    set: bool,
    first: u32,
    last: u32,
) -> Result<(), CommandError> {
    bank.auto_probe(target)?;

    options::protect(target, bank, set, first, last)?;

    let verb = if set { "Protected" } else { "Unprotected" };
    println!("{} blocks {}..={}", verb, first, last);

    let protected = options::protect_check(target, bank)?;
    println!("Protection now: {:#010x} (bit set = protected)", protected);
    Ok(())
}
