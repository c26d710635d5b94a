//! Write command

use crate::commands::CommandError;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;
use wchflash_core::bank::FlashBank;
use wchflash_core::target::DebugTarget;
use wchflash_core::{erase, write};

/// Run the write command
pub fn run<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &mut FlashBank,
    input: &Path,
    offset: u32,
    no_erase: bool,
) -> Result<(), CommandError> {
    bank.auto_probe(target)?;

    let mut data = std::fs::read(input)?;
    if data.is_empty() {
        return Err(CommandError::Usage(format!("{} is empty", input.display())));
    }
    if data.len() % 2 != 0 {
        // The flash programs in halfwords; pad with the erased value
        log::info!("padding odd-sized image with one 0xFF byte");
        data.push(0xFF);
    }
    if !bank.contains(offset, data.len() as u32) {
        return Err(CommandError::Usage(format!(
            "{} bytes at offset {:#x} exceed the {} KiB bank",
            data.len(),
            offset,
            bank.size() / 1024
        )));
    }

    if !no_erase {
        let first = offset / bank.sector_size();
        let last = (offset + data.len() as u32 - 1) / bank.sector_size();
        log::info!("erasing sectors {}..={} before write", first, last);
        erase::erase(target, bank, first, last)?;
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .map_err(|e| CommandError::Usage(e.to_string()))?,
    );
    pb.set_message(format!("Writing {} bytes at {:#010x}...", data.len(), offset));
    pb.enable_steady_tick(Duration::from_millis(100));

    write::write(target, bank, &data, offset)?;

    pb.finish_with_message(format!(
        "Wrote {} bytes at offset {:#x}",
        data.len(),
        offset
    ));
    Ok(())
}
