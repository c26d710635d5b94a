//! Option byte engine behavior against the emulated target

use wchflash_core::bank::{BankConfig, FlashBank};
use wchflash_core::options::{self, UserOptionPatch};
use wchflash_core::regs::RDP_KEY;
use wchflash_core::Error;
use wchflash_dummy::SimTarget;

fn probed(target: &mut SimTarget) -> FlashBank {
    let mut bank = FlashBank::new(BankConfig::default());
    bank.auto_probe(target).unwrap();
    bank
}

#[test]
fn fresh_device_reads_factory_options() {
    let mut target = SimTarget::new_default();
    let mut bank = probed(&mut target);

    options::read_options(&mut target, &mut bank).unwrap();

    let opts = bank.option_bytes();
    assert_eq!(opts.rdp, RDP_KEY);
    assert_eq!(opts.user, 0xFF);
    assert_eq!(opts.data, 0xFFFF);
    assert_eq!(opts.protection, 0xFFFF_FFFF);
    assert!(opts.sw_watchdog());
}

#[test]
fn user_option_patch_round_trips() {
    let mut target = SimTarget::new_default();
    let mut bank = probed(&mut target);

    let patch = UserOptionPatch {
        sw_watchdog: Some(false),
        no_reset_on_standby: Some(false),
        data: Some(0xBEEF),
        ..Default::default()
    };
    options::apply_user_options(&mut target, &mut bank, &patch).unwrap();

    let mut reread = probed(&mut target);
    options::read_options(&mut target, &mut reread).unwrap();
    let opts = reread.option_bytes();
    assert!(!opts.sw_watchdog());
    assert!(!opts.no_reset_on_standby());
    assert!(opts.no_reset_on_stop());
    assert_eq!(opts.data, 0xBEEF);
    assert_eq!(opts.rdp, RDP_KEY);
}

#[test]
fn protection_round_trips() {
    let mut target = SimTarget::new_default();
    let mut bank = probed(&mut target);

    assert_eq!(options::protect_check(&mut target, &bank).unwrap(), 0);

    options::protect(&mut target, &mut bank, true, 0, 2).unwrap();
    assert_eq!(options::protect_check(&mut target, &bank).unwrap(), 0b111);

    options::protect(&mut target, &mut bank, false, 1, 1).unwrap();
    assert_eq!(options::protect_check(&mut target, &bank).unwrap(), 0b101);

    options::protect(&mut target, &mut bank, false, 0, 2).unwrap();
    assert_eq!(options::protect_check(&mut target, &bank).unwrap(), 0);
}

#[test]
fn protect_rejects_bad_ranges() {
    let mut target = SimTarget::new_default();
    let mut bank = probed(&mut target);

    assert_eq!(
        options::protect(&mut target, &mut bank, true, 2, 1),
        Err(Error::InvalidRange)
    );
    let num_prot_blocks = bank.num_prot_blocks();
    assert_eq!(
        options::protect(&mut target, &mut bank, true, 0, num_prot_blocks),
        Err(Error::InvalidRange)
    );
}

#[test]
fn read_protection_implies_block_zero_protected() {
    let mut target = SimTarget::new_default();
    let mut bank = probed(&mut target);

    options::lock_device(&mut target, &mut bank).unwrap();
    assert_eq!(options::protect_check(&mut target, &bank).unwrap(), 1);

    let mut reread = probed(&mut target);
    options::read_options(&mut target, &mut reread).unwrap();
    assert_eq!(reread.option_bytes().rdp, 0);

    options::unlock_device(&mut target, &mut bank).unwrap();
    assert_eq!(options::protect_check(&mut target, &bank).unwrap(), 0);
}

#[test]
fn stuck_busy_aborts_option_write() {
    let mut target = SimTarget::new_default();
    let mut bank = probed(&mut target);
    target.set_stuck_busy(true);

    assert_eq!(
        options::protect(&mut target, &mut bank, true, 0, 0),
        Err(Error::BusyTimeout)
    );
    // The option page was never touched
    assert_eq!(target.option_page()[0], RDP_KEY);
}

#[test]
fn option_writes_require_halted_target() {
    let mut target = SimTarget::new_default();
    let mut bank = probed(&mut target);
    target.set_halted(false);

    assert_eq!(
        options::protect(&mut target, &mut bank, true, 0, 0),
        Err(Error::NotHalted)
    );
    assert_eq!(
        options::lock_device(&mut target, &mut bank),
        Err(Error::NotHalted)
    );
}
