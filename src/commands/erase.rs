//! Erase commands

use crate::commands::CommandError;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use wchflash_core::bank::FlashBank;
use wchflash_core::erase;
use wchflash_core::target::DebugTarget;

fn spinner(message: String) -> Result<ProgressBar, CommandError> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .map_err(|e| CommandError::Usage(e.to_string()))?,
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

/// Run the erase command over an inclusive sector range
pub fn run<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &mut FlashBank,
    first: u32,
    last: Option<u32>,
) -> Result<(), CommandError> {
    bank.auto_probe(target)?;
    let last = last.unwrap_or(bank.num_sectors() - 1);

    let pb = spinner(format!("Erasing sectors {}..={}...", first, last))?;
    erase::erase(target, bank, first, last)?;
    pb.finish_with_message(format!("Erased sectors {}..={}", first, last));

    Ok(())
}

/// Run the mass-erase command
pub fn run_mass<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &mut FlashBank,
) -> Result<(), CommandError> {
    bank.auto_probe(target)?;

    let pb = spinner(format!("Mass erasing {} KiB...", bank.size() / 1024))?;
    erase::mass_erase(target, bank)?;
    pb.finish_with_message("Mass erase complete");

    Ok(())
}
