//! Write engine behavior against the emulated target

use wchflash_core::bank::{BankConfig, FlashBank};
use wchflash_core::write;
use wchflash_core::Error;
use wchflash_dummy::{SimConfig, SimTarget};

fn probed(target: &mut SimTarget) -> FlashBank {
    let mut bank = FlashBank::new(BankConfig::default());
    bank.auto_probe(target).unwrap();
    bank
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 13) as u8).collect()
}

#[test]
fn streamed_write_programs_content() {
    let mut target = SimTarget::new_default();
    let bank = probed(&mut target);
    let data = pattern(3000);

    write::write(&mut target, &bank, &data, 512).unwrap();

    assert_eq!(&target.flash()[512..3512], &data[..]);
    assert!(target.flash()[..512].iter().all(|&b| b == 0xFF));
    assert!(target.fast_page_commit_count() > 0);
}

#[test]
fn page_aligned_page_multiple_uses_bursts_only() {
    let mut target = SimTarget::new_default();
    let bank = probed(&mut target);
    let data = pattern(256);

    write::write(&mut target, &bank, &data, 0).unwrap();

    assert_eq!(&target.flash()[..256], &data[..]);
    assert_eq!(target.fast_page_commit_count(), 1);
    assert_eq!(target.halfword_program_count(), 0);
}

#[test]
fn tail_written_as_halfwords() {
    let mut target = SimTarget::new_default();
    let bank = probed(&mut target);
    let data = pattern(258);

    write::write(&mut target, &bank, &data, 0).unwrap();

    assert_eq!(&target.flash()[..258], &data[..]);
    assert!(target.flash()[258..260].iter().all(|&b| b == 0xFF));
    assert_eq!(target.fast_page_commit_count(), 1);
    assert_eq!(target.halfword_program_count(), 1);
}

#[test]
fn small_write_streams_without_fast_bursts() {
    let mut target = SimTarget::new_default();
    let bank = probed(&mut target);
    let data = pattern(4);

    write::write(&mut target, &bank, &data, 2).unwrap();

    assert_eq!(&target.flash()[2..6], &data[..]);
    assert_eq!(target.fast_page_commit_count(), 0);
    assert_eq!(target.halfword_program_count(), 2);
}

#[test]
fn tiny_scratch_ram_falls_back_to_halfwords() {
    let mut target = SimTarget::new(SimConfig {
        ram_size: 512,
        ..SimConfig::default()
    });
    let bank = probed(&mut target);
    let data = pattern(64);

    write::write(&mut target, &bank, &data, 0).unwrap();

    assert_eq!(&target.flash()[..64], &data[..]);
    assert_eq!(target.fast_page_commit_count(), 0);
    assert_eq!(target.halfword_program_count(), 32);
}

#[test]
fn odd_word_offset_streams_intact() {
    let mut target = SimTarget::new_default();
    let bank = probed(&mut target);
    let data = pattern(2048);

    write::write(&mut target, &bank, &data, 2).unwrap();

    assert_eq!(&target.flash()[2..2050], &data[..]);
    assert!(target.flash()[..2].iter().all(|&b| b == 0xFF));
    // 127 halfwords up to the page boundary, 7 full pages, 1 tail
    assert_eq!(target.fast_page_commit_count(), 7);
    assert_eq!(target.halfword_program_count(), 128);
}

#[test]
fn ring_wrap_with_odd_word_offset() {
    let mut target = SimTarget::new(SimConfig {
        ram_size: 1024,
        ..SimConfig::default()
    });
    let bank = probed(&mut target);
    let data = pattern(4096);

    write::write(&mut target, &bank, &data, 2).unwrap();

    assert_eq!(&target.flash()[2..4098], &data[..]);
    assert_eq!(target.fast_page_commit_count(), 15);
    assert_eq!(target.halfword_program_count(), 128);
}

#[test]
fn ring_wraps_in_small_ram() {
    let mut target = SimTarget::new(SimConfig {
        ram_size: 1024,
        ..SimConfig::default()
    });
    let bank = probed(&mut target);
    let data = pattern(4096);

    write::write(&mut target, &bank, &data, 0).unwrap();

    assert_eq!(&target.flash()[..4096], &data[..]);
    assert_eq!(target.fast_page_commit_count(), 16);
    assert_eq!(target.halfword_program_count(), 0);
}

#[test]
fn alloc_failure_falls_back_with_identical_content() {
    let mut primary = SimTarget::new_default();
    let mut fallback = SimTarget::new_default();
    fallback.set_fail_alloc(true);
    let data = pattern(1030);

    let bank = probed(&mut primary);
    write::write(&mut primary, &bank, &data, 256).unwrap();

    let bank = probed(&mut fallback);
    write::write(&mut fallback, &bank, &data, 256).unwrap();

    assert_eq!(primary.flash(), fallback.flash());
    assert_eq!(fallback.fast_page_commit_count(), 0);
    assert_eq!(fallback.halfword_program_count(), 515);
}

#[test]
fn protected_block_aborts_streamed_write() {
    let mut target = SimTarget::new_default();
    target.set_protection_mask(!1);
    let bank = probed(&mut target);
    let data = pattern(512);

    assert_eq!(
        write::write(&mut target, &bank, &data, 0),
        Err(Error::ProtectionViolation)
    );
    assert!(target.flash().iter().all(|&b| b == 0xFF));
}

#[test]
fn protected_block_aborts_fallback_write() {
    let mut target = SimTarget::new_default();
    target.set_protection_mask(!1);
    target.set_fail_alloc(true);
    let bank = probed(&mut target);
    let data = pattern(8);

    assert_eq!(
        write::write(&mut target, &bank, &data, 0),
        Err(Error::ProtectionViolation)
    );
    assert!(target.flash().iter().all(|&b| b == 0xFF));
}

#[test]
fn misaligned_writes_rejected_before_touching_the_device() {
    let mut target = SimTarget::new_default();
    let bank = probed(&mut target);

    assert_eq!(
        write::write(&mut target, &bank, &[0u8; 4], 1),
        Err(Error::InvalidAlignment)
    );
    assert_eq!(
        write::write(&mut target, &bank, &[0u8; 3], 0),
        Err(Error::InvalidAlignment)
    );
    assert!(target.ctlr_writes().is_empty());
    assert!(target.flash().iter().all(|&b| b == 0xFF));
}

#[test]
fn out_of_range_write_rejected() {
    let mut target = SimTarget::new_default();
    let bank = probed(&mut target);

    let end = bank.size();
    assert_eq!(
        write::write(&mut target, &bank, &[0u8; 4], end - 2),
        Err(Error::InvalidRange)
    );
    assert!(target.ctlr_writes().is_empty());
}

#[test]
fn running_target_rejected() {
    let mut target = SimTarget::new_default();
    let bank = probed(&mut target);
    target.set_halted(false);

    assert_eq!(
        write::write(&mut target, &bank, &[0u8; 4], 0),
        Err(Error::NotHalted)
    );
}

#[test]
fn stuck_busy_times_out() {
    let mut target = SimTarget::new_default();
    let bank = probed(&mut target);
    target.set_stuck_busy(true);

    assert_eq!(
        write::write(&mut target, &bank, &[0u8; 4], 0),
        Err(Error::BusyTimeout)
    );
}

#[test]
fn locked_up_controller_reported() {
    let mut target = SimTarget::new_default();
    let bank = probed(&mut target);
    target.set_stuck_lock(true);

    assert_eq!(
        write::write(&mut target, &bank, &[0u8; 4], 0),
        Err(Error::LockedUp)
    );
}

#[test]
fn hardware_watchdog_armed_and_fed_by_routine() {
    let mut target = SimTarget::new_default();
    // User bit 0 clear selects the hardware watchdog
    target.set_option_user(0xFE);
    let bank = probed(&mut target);
    let data = pattern(512);

    write::write(&mut target, &bank, &data, 0).unwrap();

    assert!(target.iwdg_armed());
    assert!(target.iwdg_feed_count() > 0);
    assert_eq!(&target.flash()[..512], &data[..]);
}

#[test]
fn software_watchdog_leaves_iwdg_alone() {
    let mut target = SimTarget::new_default();
    let bank = probed(&mut target);

    write::write(&mut target, &bank, &pattern(512), 0).unwrap();

    assert!(!target.iwdg_armed());
    assert_eq!(target.iwdg_feed_count(), 0);
}
