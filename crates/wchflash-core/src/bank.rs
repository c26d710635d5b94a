//! Flash bank geometry and device identification
//!
//! A [`FlashBank`] is created once at configuration time and probed lazily
//! on first use: the device-ID register selects the family constants (page
//! size, protection granularity, maximum size) and the flash-size register
//! supplies the actual size, with a user override taking precedence over
//! both. Sectors and protection blocks are uniform, so they are exposed as
//! computed values rather than stored tables.

use crate::error::{Error, Result};
use crate::options::OptionBytes;
use crate::regs::{
    RegisterMap, FLASH_BANK_BASE, FLASH_REG_BASE, FLASH_SIZE_REG, IDCODE_REG, RDP_KEY,
};
use crate::target::DebugTarget;
use maybe_async::maybe_async;

/// Pages per write-protection block on the medium-density family
const PAGES_PER_PROT_BLOCK: u32 = 16;

/// Width of the protection mask register, in blocks
const MAX_PROT_BLOCKS: u32 = 32;

/// Fast-program page size; also the smallest erase unit
const PAGE_SIZE: u32 = 256;

/// One flash sector (a 256-byte page on this family)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    /// Offset from the bank base
    pub offset: u32,
    /// Size in bytes
    pub size: u32,
}

/// One write-protection block (a group of sectors sharing a mask bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtBlock {
    /// Offset from the bank base
    pub offset: u32,
    /// Size in bytes; the last block absorbs any remainder
    pub size: u32,
}

/// Static configuration of a flash bank
#[derive(Debug, Clone, Copy)]
pub struct BankConfig {
    /// Bank base address in the target address space
    pub base: u32,
    /// User-supplied size override in bytes; 0 means use the probed size
    ///
    /// Escape hatch for devices whose flash-size register lies.
    pub size: u32,
    /// Flash controller register base
    pub reg_base: u32,
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            base: FLASH_BANK_BASE,
            size: 0,
            reg_base: FLASH_REG_BASE,
        }
    }
}

/// Identification strings for the probed device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Family name
    pub family: &'static str,
    /// Revision name, if the revision ID is known
    pub rev: Option<&'static str>,
    /// Raw revision ID (high 16 bits of the ID register)
    pub rev_id: u16,
}

/// One bank of on-chip flash and its controller
#[derive(Debug)]
pub struct FlashBank {
    regs: RegisterMap,
    base: u32,
    size: u32,
    num_sectors: u32,
    num_prot_blocks: u32,
    user_size: u32,
    probed: bool,
    pub(crate) default_rdp: u8,
    pub(crate) option_bytes: OptionBytes,
}

impl FlashBank {
    /// Bank from configuration; geometry is filled in by [`Self::probe`]
    pub fn new(config: BankConfig) -> Self {
        Self {
            regs: RegisterMap::new(config.reg_base),
            base: config.base,
            size: 0,
            num_sectors: 0,
            num_prot_blocks: 0,
            user_size: config.size,
            probed: false,
            default_rdp: RDP_KEY,
            option_bytes: OptionBytes::default(),
        }
    }

    /// Controller register map
    pub fn regs(&self) -> &RegisterMap {
        &self.regs
    }

    /// Bank base address
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Bank size in bytes (0 before probing)
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Number of sectors
    pub fn num_sectors(&self) -> u32 {
        self.num_sectors
    }

    /// Number of write-protection blocks
    pub fn num_prot_blocks(&self) -> u32 {
        self.num_prot_blocks
    }

    /// Sector size in bytes
    pub fn sector_size(&self) -> u32 {
        PAGE_SIZE
    }

    /// Whether geometry has been probed
    pub fn is_probed(&self) -> bool {
        self.probed
    }

    /// Last option bytes read from the device
    pub fn option_bytes(&self) -> &OptionBytes {
        &self.option_bytes
    }

    /// Sector by index
    pub fn sector(&self, index: u32) -> Option<Sector> {
        if index >= self.num_sectors {
            return None;
        }
        Some(Sector {
            offset: index * PAGE_SIZE,
            size: PAGE_SIZE,
        })
    }

    /// Protection block by index
    pub fn prot_block(&self, index: u32) -> Option<ProtBlock> {
        if index >= self.num_prot_blocks {
            return None;
        }
        let block_size = PAGES_PER_PROT_BLOCK * PAGE_SIZE;
        let offset = index * block_size;
        let size = if index == self.num_prot_blocks - 1 {
            self.size - offset
        } else {
            block_size
        };
        Some(ProtBlock { offset, size })
    }

    /// Whether `[offset, offset+len)` lies within the bank
    pub fn contains(&self, offset: u32, len: u32) -> bool {
        offset
            .checked_add(len)
            .map(|end| end <= self.size)
            .unwrap_or(false)
    }

    /// Read the raw device ID register
    #[maybe_async]
    pub async fn device_id<T: DebugTarget + ?Sized>(&self, target: &mut T) -> Result<u32> {
        target.read_u32(IDCODE_REG).await
    }

    /// Identification strings for display
    #[maybe_async]
    pub async fn describe<T: DebugTarget + ?Sized>(&self, target: &mut T) -> Result<DeviceInfo> {
        let idcode = self.device_id(target).await?;
        let rev_id = (idcode >> 16) as u16;
        match idcode & 0xFFF {
            0x418 | 0x41c => Ok(DeviceInfo {
                family: "CH32F2x (Medium Density)",
                rev: match rev_id {
                    0x2050 => Some("5"),
                    _ => None,
                },
                rev_id,
            }),
            _ => Err(Error::UnknownDevice),
        }
    }

    /// Probe geometry from the ID and size registers
    #[maybe_async]
    pub async fn probe<T: DebugTarget + ?Sized>(&mut self, target: &mut T) -> Result<()> {
        self.probed = false;
        self.default_rdp = RDP_KEY;

        let idcode = self.device_id(target).await?;
        log::info!("device id = {:#010x}", idcode);

        // Family constants; the revision only bounds the size fallback
        let max_size_kb = match idcode & 0xFFF {
            0x418 | 0x41c => 128u32,
            _ => {
                log::warn!("cannot identify target as a CH32 family");
                return Err(Error::UnknownDevice);
            }
        };

        let size_kb = match target.read_u16(FLASH_SIZE_REG).await {
            Ok(kb) if kb != 0 && kb != 0xFFFF => u32::from(kb),
            // Early silicon reports 0 or all-ones here
            _ => {
                log::warn!(
                    "flash size register unusable, probe inaccurate - assuming {}k flash",
                    max_size_kb
                );
                max_size_kb
            }
        };

        let size_kb = if self.user_size != 0 {
            log::info!("ignoring flash probed value, using configured bank size");
            self.user_size / 1024
        } else {
            size_kb
        };

        log::info!("flash size = {} KiB", size_kb);

        let num_pages = size_kb * 1024 / PAGE_SIZE;
        self.size = num_pages * PAGE_SIZE;
        self.num_sectors = num_pages;
        self.num_prot_blocks = num_pages.div_ceil(PAGES_PER_PROT_BLOCK).min(MAX_PROT_BLOCKS);
        self.probed = true;

        Ok(())
    }

    /// Probe once; later calls are free
    #[maybe_async]
    pub async fn auto_probe<T: DebugTarget + ?Sized>(&mut self, target: &mut T) -> Result<()> {
        if self.probed {
            return Ok(());
        }
        self.probe(target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probed_bank(size: u32) -> FlashBank {
        let mut bank = FlashBank::new(BankConfig::default());
        bank.size = size;
        bank.num_sectors = size / PAGE_SIZE;
        bank.num_prot_blocks = (size / PAGE_SIZE).div_ceil(PAGES_PER_PROT_BLOCK).min(32);
        bank.probed = true;
        bank
    }

    #[test]
    fn sectors_cover_bank_contiguously() {
        let bank = probed_bank(128 * 1024);
        assert_eq!(bank.num_sectors(), 512);
        let mut expected = 0;
        for i in 0..bank.num_sectors() {
            let s = bank.sector(i).unwrap();
            assert_eq!(s.offset, expected);
            expected += s.size;
        }
        assert_eq!(expected, bank.size());
        assert_eq!(bank.sector(512), None);
    }

    #[test]
    fn prot_blocks_group_sixteen_pages() {
        let bank = probed_bank(128 * 1024);
        assert_eq!(bank.num_prot_blocks(), 32);
        assert_eq!(bank.prot_block(0).unwrap().size, 4096);
        assert_eq!(bank.prot_block(31).unwrap().offset, 31 * 4096);
        assert_eq!(bank.prot_block(31).unwrap().size, 4096);
    }

    #[test]
    fn last_prot_block_absorbs_remainder() {
        // 130 KiB: 520 pages, 33 groups capped at 32, last one oversized
        let bank = probed_bank(130 * 1024);
        assert_eq!(bank.num_prot_blocks(), 32);
        let last = bank.prot_block(31).unwrap();
        assert_eq!(last.offset, 31 * 4096);
        assert_eq!(last.offset + last.size, bank.size());
        assert_eq!(last.size, 24 * 256);
    }

    #[test]
    fn small_bank_has_partial_last_block() {
        // 10 KiB: 40 pages = 2 full groups + 8 pages
        let bank = probed_bank(10 * 1024);
        assert_eq!(bank.num_prot_blocks(), 3);
        assert_eq!(bank.prot_block(2).unwrap().size, 8 * 256);
    }

    #[test]
    fn bounds_checking() {
        let bank = probed_bank(128 * 1024);
        assert!(bank.contains(0, 128 * 1024));
        assert!(bank.contains(128 * 1024 - 2, 2));
        assert!(!bank.contains(128 * 1024, 2));
        assert!(!bank.contains(u32::MAX, 4));
    }
}
