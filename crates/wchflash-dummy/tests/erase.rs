//! Erase engine behavior against the emulated target

use wchflash_core::bank::{BankConfig, FlashBank};
use wchflash_core::erase;
use wchflash_core::regs::FLASH_BANK_BASE;
use wchflash_core::Error;
use wchflash_dummy::{EraseOp, SimConfig, SimTarget};

fn probed(target: &mut SimTarget) -> FlashBank {
    let mut bank = FlashBank::new(BankConfig::default());
    bank.auto_probe(target).unwrap();
    bank
}

#[test]
fn full_bank_range_becomes_mass_erase() {
    let mut target = SimTarget::new_default();
    target.preload_flash(0, &[0xAB; 4096]);
    let bank = probed(&mut target);

    erase::erase(&mut target, &bank, 0, bank.num_sectors() - 1).unwrap();

    assert_eq!(target.mass_erase_count(), 1);
    assert!(target.erase_ops().is_empty());
    assert!(target.flash().iter().all(|&b| b == 0xFF));
}

#[test]
fn range_erase_picks_largest_tiers_first() {
    let mut target = SimTarget::new_default();
    target.preload_flash(0, &vec![0x55; 128 * 1024]);
    let bank = probed(&mut target);

    // 64 KiB + 32 KiB + 4 KiB + 1 page worth of sectors
    erase::erase(&mut target, &bank, 0, 400).unwrap();

    assert_eq!(target.mass_erase_count(), 0);
    assert_eq!(
        target.erase_ops(),
        &[
            EraseOp { addr: FLASH_BANK_BASE, size: 64 * 1024 },
            EraseOp { addr: FLASH_BANK_BASE + 64 * 1024, size: 32 * 1024 },
            EraseOp { addr: FLASH_BANK_BASE + 96 * 1024, size: 4 * 1024 },
            EraseOp { addr: FLASH_BANK_BASE + 100 * 1024, size: 256 },
        ]
    );
    let erased = 401 * 256;
    assert!(target.flash()[..erased].iter().all(|&b| b == 0xFF));
    assert!(target.flash()[erased..].iter().all(|&b| b == 0x55));
}

#[test]
fn short_range_uses_pages_only() {
    let mut target = SimTarget::new_default();
    target.preload_flash(0, &[0u8; 2048]);
    let bank = probed(&mut target);

    erase::erase(&mut target, &bank, 1, 2).unwrap();

    assert_eq!(
        target.erase_ops(),
        &[
            EraseOp { addr: FLASH_BANK_BASE + 256, size: 256 },
            EraseOp { addr: FLASH_BANK_BASE + 512, size: 256 },
        ]
    );
    assert!(target.flash()[..256].iter().all(|&b| b == 0));
    assert!(target.flash()[256..768].iter().all(|&b| b == 0xFF));
    assert!(target.flash()[768..1024].iter().all(|&b| b == 0));
}

#[test]
fn invalid_ranges_are_rejected() {
    let mut target = SimTarget::new_default();
    let bank = probed(&mut target);

    assert_eq!(erase::erase(&mut target, &bank, 5, 4), Err(Error::InvalidRange));
    assert_eq!(
        erase::erase(&mut target, &bank, 0, bank.num_sectors()),
        Err(Error::InvalidRange)
    );
    assert!(target.erase_ops().is_empty());
    assert_eq!(target.mass_erase_count(), 0);
}

#[test]
fn running_target_is_rejected() {
    let mut target = SimTarget::new_default();
    let bank = probed(&mut target);
    target.set_halted(false);

    assert_eq!(erase::erase(&mut target, &bank, 0, 0), Err(Error::NotHalted));
    assert_eq!(erase::mass_erase(&mut target, &bank), Err(Error::NotHalted));
}

#[test]
fn locked_up_controller_reported() {
    let mut target = SimTarget::new_default();
    let bank = probed(&mut target);
    target.set_stuck_lock(true);

    assert_eq!(erase::erase(&mut target, &bank, 0, 0), Err(Error::LockedUp));
}

#[test]
fn stuck_busy_times_out() {
    let mut target = SimTarget::new_default();
    let bank = probed(&mut target);
    target.set_stuck_busy(true);

    assert_eq!(erase::erase(&mut target, &bank, 0, 0), Err(Error::BusyTimeout));
}

#[test]
fn protected_block_aborts_erase() {
    let mut target = SimTarget::new_default();
    target.set_protection_mask(!1);
    let bank = probed(&mut target);

    assert_eq!(
        erase::erase(&mut target, &bank, 0, 0),
        Err(Error::ProtectionViolation)
    );
    assert!(target.erase_ops().is_empty());
}

#[test]
fn small_device_geometry_probes_from_size_register() {
    let mut target = SimTarget::new(SimConfig {
        flash_size: 64 * 1024,
        ..SimConfig::default()
    });
    let bank = probed(&mut target);

    assert_eq!(bank.size(), 64 * 1024);
    assert_eq!(bank.num_sectors(), 256);
    assert_eq!(bank.num_prot_blocks(), 16);
}
