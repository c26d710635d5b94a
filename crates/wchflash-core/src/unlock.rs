//! Key-sequence unlock protocols
//!
//! Three independent locks gate the flash controller: the main LOCK bit
//! (key register), the option-write enable OBWRE (option key register) and
//! the fast-mode FLOCK (mode key register). All use the same two-key
//! sequence. Unlocks are idempotent; a lock bit that survives the key
//! sequence means the controller ignores keys until reset, which is
//! surfaced as [`Error::LockedUp`] and never retried.

use crate::error::{Error, Result};
use crate::regs::{self, timeout, Control, RegisterMap, KEY1, KEY2};
use crate::target::DebugTarget;
use maybe_async::maybe_async;

/// Unlock the main flash control register
///
/// No-op when LOCK is already clear.
#[maybe_async]
pub async fn unlock<T: DebugTarget + ?Sized>(target: &mut T, regs: &RegisterMap) -> Result<()> {
    let ctrl = regs::read_control(target, regs).await?;
    if !ctrl.contains(Control::LOCK) {
        return Ok(());
    }

    target.write_u32(regs.keyr(), KEY1).await?;
    target.write_u32(regs.keyr(), KEY2).await?;

    let mut rounds = timeout::COMMAND;
    loop {
        let ctrl = regs::read_control(target, regs).await?;
        if !ctrl.contains(Control::LOCK) {
            return Ok(());
        }
        if rounds == 0 {
            log::error!("timed out waiting for flash unlock, maybe flash is locked-up, please reset");
            return Err(Error::LockedUp);
        }
        rounds -= 1;
        target.delay_ms(1).await;
    }
}

/// Unlock the option byte registers
///
/// Requires the main lock to be clear; unlocks it first when needed. No-op
/// when OBWRE is already set.
#[maybe_async]
pub async fn unlock_options<T: DebugTarget + ?Sized>(
    target: &mut T,
    regs: &RegisterMap,
) -> Result<()> {
    let ctrl = regs::read_control(target, regs).await?;
    if !ctrl.contains(Control::LOCK) && ctrl.contains(Control::OBWRE) {
        return Ok(());
    }

    if ctrl.contains(Control::LOCK) {
        unlock(target, regs).await?;
    }

    if !regs::read_control(target, regs).await?.contains(Control::OBWRE) {
        target.write_u32(regs.obkeyr(), KEY1).await?;
        target.write_u32(regs.obkeyr(), KEY2).await?;

        let mut rounds = timeout::COMMAND;
        loop {
            let ctrl = regs::read_control(target, regs).await?;
            if ctrl.contains(Control::OBWRE) {
                return Ok(());
            }
            if rounds == 0 {
                log::error!(
                    "timed out waiting for flash options unlock, maybe flash options is locked-up, please reset"
                );
                return Err(Error::LockedUp);
            }
            rounds -= 1;
            target.delay_ms(1).await;
        }
    }

    Ok(())
}

/// Unlock the fast program/erase mode
///
/// Used before the fast erase tiers; the resident write routine does its
/// own FLOCK unlock on the target side. No-op when FLOCK is already
/// clear.
#[maybe_async]
pub async fn unlock_fast_mode<T: DebugTarget + ?Sized>(
    target: &mut T,
    regs: &RegisterMap,
) -> Result<()> {
    let ctrl = regs::read_control(target, regs).await?;
    if !ctrl.contains(Control::FLOCK) {
        return Ok(());
    }

    target.write_u32(regs.modekeyr(), KEY1).await?;
    target.write_u32(regs.modekeyr(), KEY2).await?;

    regs::wait_status_busy(target, regs, timeout::COMMAND).await
}
