//! Probe command: identify the device and print geometry

use crate::commands::CommandError;
use wchflash_core::bank::FlashBank;
use wchflash_core::options;
use wchflash_core::target::DebugTarget;

/// Run the probe command
pub fn run<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &mut FlashBank,
) -> Result<(), CommandError> {
    bank.probe(target)?;
    let info = bank.describe(target)?;

    match info.rev {
        Some(rev) => println!("Found: {} rev {}", info.family, rev),
        None => println!("Found: {} (unknown revision {:#06x})", info.family, info.rev_id),
    }
    println!(
        "Flash: {} KiB, {} sectors of {} bytes, {} protection blocks",
        bank.size() / 1024,
        bank.num_sectors(),
        bank.sector_size(),
        bank.num_prot_blocks()
    );

    let protected = options::protect_check(target, bank)?;
    if protected == 0 {
        println!("Write protection: none");
    } else {
        println!("Write protection: blocks {:#010x}", protected);
    }

    Ok(())
}
