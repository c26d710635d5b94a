//! Erase engine
//!
//! The controller offers four erase granularities plus a mass erase. A
//! range erase greedily takes the largest tier whose unit still fits the
//! remaining range, advancing a sector cursor and handing the remainder
//! down; a full-bank range short-circuits to the mass erase. Every tier
//! except the classic 4 KiB sector erase additionally requires the
//! fast-mode lock to be open.

use crate::bank::FlashBank;
use crate::error::{Error, Result};
use crate::regs::{self, timeout, Control, RegisterMap};
use crate::target::DebugTarget;
use crate::unlock;
use maybe_async::maybe_async;

/// Erase granularity tiers, largest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// 64 KiB block (BER64), fast mode
    Block64,
    /// 32 KiB block (BER32), fast mode
    Block32,
    /// 4 KiB sector (PER)
    Sector4k,
    /// 256 byte page (FTER), fast mode
    Page,
}

/// Descending order tried by the range erase
pub const TIERS: [Tier; 4] = [Tier::Block64, Tier::Block32, Tier::Sector4k, Tier::Page];

impl Tier {
    /// Unit size in bytes
    pub fn size(self) -> u32 {
        match self {
            Tier::Block64 => 64 * 1024,
            Tier::Block32 => 32 * 1024,
            Tier::Sector4k => 4 * 1024,
            Tier::Page => 256,
        }
    }

    /// Control register mode bit selecting this tier
    pub fn select_bit(self) -> Control {
        match self {
            Tier::Block64 => Control::BER64,
            Tier::Block32 => Control::BER32,
            Tier::Sector4k => Control::PER,
            Tier::Page => Control::FTER,
        }
    }

    /// Whether this tier sits behind the fast-mode lock
    ///
    /// Everything except the classic 4 KiB sector erase counts as a fast
    /// operation.
    pub fn needs_fast_mode(self) -> bool {
        !matches!(self, Tier::Sector4k)
    }

    /// Unit size in sectors
    pub fn sectors(self, sector_size: u32) -> u32 {
        self.size() / sector_size
    }
}

/// Units each tier would erase for a contiguous run of `count` sectors
///
/// Pure planning helper mirroring the erase loop: every tier consumes as
/// many whole units as fit and passes the remainder down.
pub fn tier_plan(count: u32, sector_size: u32) -> [u32; 4] {
    let mut remaining = count;
    let mut plan = [0u32; 4];
    for (slot, tier) in plan.iter_mut().zip(TIERS) {
        let per_unit = tier.sectors(sector_size);
        *slot = remaining / per_unit;
        remaining %= per_unit;
    }
    plan
}

/// Erase every sector of the bank in one operation
#[maybe_async]
pub async fn mass_erase<T: DebugTarget + ?Sized>(target: &mut T, bank: &FlashBank) -> Result<()> {
    if !target.is_halted().await? {
        log::error!("target not halted");
        return Err(Error::NotHalted);
    }

    let regs = *bank.regs();
    unlock::unlock(target, &regs).await?;
    regs::wait_status_busy(target, &regs, timeout::COMMAND).await?;

    let ctrl = regs::read_control(target, &regs).await?;
    regs::write_control(target, &regs, ctrl | Control::MER).await?;
    regs::write_control(target, &regs, ctrl | Control::MER | Control::STRT).await?;
    regs::wait_status_busy(target, &regs, timeout::ERASE).await?;

    let ctrl = regs::read_control(target, &regs).await?;
    regs::write_control(target, &regs, ctrl & !Control::MER).await?;
    regs::wait_status_busy(target, &regs, timeout::COMMAND).await
}

/// Erase the inclusive sector range `[first, last]`
///
/// A range spanning the whole bank is performed as a mass erase.
#[maybe_async]
pub async fn erase<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &FlashBank,
    first: u32,
    last: u32,
) -> Result<()> {
    if !target.is_halted().await? {
        log::error!("target not halted");
        return Err(Error::NotHalted);
    }
    if !bank.is_probed() {
        return Err(Error::NotProbed);
    }
    if first > last || last >= bank.num_sectors() {
        return Err(Error::InvalidRange);
    }

    if first == 0 && last == bank.num_sectors() - 1 {
        return mass_erase(target, bank).await;
    }

    let regs = *bank.regs();
    unlock::unlock(target, &regs).await?;
    regs::wait_status_busy(target, &regs, timeout::COMMAND).await?;

    let mut cursor = first;
    for tier in TIERS {
        if cursor > last {
            break;
        }
        let per_unit = tier.sectors(bank.sector_size());
        if last + 1 - cursor >= per_unit {
            tier_erase(target, bank, &regs, tier, &mut cursor, last).await?;
        }
    }

    Ok(())
}

/// Erase whole `tier` units starting at `*cursor` while they fit
#[maybe_async]
async fn tier_erase<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &FlashBank,
    regs: &RegisterMap,
    tier: Tier,
    cursor: &mut u32,
    last: u32,
) -> Result<()> {
    if tier.needs_fast_mode() {
        unlock::unlock_fast_mode(target, regs).await?;
    }

    let ctrl = regs::read_control(target, regs).await? | tier.select_bit();
    regs::write_control(target, regs, ctrl).await?;

    let per_unit = tier.sectors(bank.sector_size());
    let mut count = last + 1 - *cursor;
    while count >= per_unit {
        let sector = bank.sector(*cursor).ok_or(Error::InvalidRange)?;
        target.write_u32(regs.addr(), bank.base() + sector.offset).await?;
        regs::write_control(target, regs, ctrl | Control::STRT).await?;
        regs::wait_status_busy(target, regs, timeout::ERASE).await?;

        count -= per_unit;
        *cursor += per_unit;
    }

    let ctrl = regs::read_control(target, regs).await?;
    regs::write_control(target, regs, ctrl & !tier.select_bit()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_descend() {
        for pair in TIERS.windows(2) {
            assert!(pair[0].size() > pair[1].size());
        }
    }

    #[test]
    fn plan_prefers_largest_tier() {
        // 64 KiB worth of 256-byte sectors: one 64 KiB unit, nothing else
        assert_eq!(tier_plan(256, 256), [1, 0, 0, 0]);
        // 100 KiB: 1x64K + 1x32K + 1x4K + 0 pages
        assert_eq!(tier_plan(400, 256), [1, 1, 1, 0]);
    }

    #[test]
    fn plan_remainder_falls_through() {
        // 3 sectors: pages only
        assert_eq!(tier_plan(3, 256), [0, 0, 0, 3]);
        // 17 sectors: one 4 KiB sector + one page
        assert_eq!(tier_plan(17, 256), [0, 0, 1, 1]);
    }

    #[test]
    fn plan_covers_exactly() {
        for count in [1u32, 15, 16, 127, 128, 129, 300, 511] {
            let plan = tier_plan(count, 256);
            let total: u32 = plan
                .iter()
                .zip(TIERS)
                .map(|(n, t)| n * t.sectors(256))
                .sum();
            assert_eq!(total, count, "count {}", count);
        }
    }
}
