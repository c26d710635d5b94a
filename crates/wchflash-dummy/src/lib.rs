//! wchflash-dummy - In-memory CH32F2x target emulator for testing
//!
//! This crate provides an emulated debug target backed by plain host
//! memory: a flash array, an option byte page, scratch RAM and a
//! behavioral model of the flash controller registers. The resident write
//! routine is executed through its state-machine model, pumped from within
//! the [`DebugTarget`] memory operations so host and target interleave the
//! way they do over a real probe.
//!
//! Beyond the target itself it exposes counters and fault injection knobs
//! (allocation failure, stuck busy bit, stuck lock) so tests can assert
//! which hardware path the engine took.

use maybe_async::maybe_async;
use wchflash_core::error::{Error, Result};
use wchflash_core::loader::{
    LoaderBus, LoaderParams, WriteLoader, IWDG_BASE, IWDG_FEED, IWDG_UNLOCK,
};
use wchflash_core::regs::{
    Control, Status, FLASH_BANK_BASE, FLASH_REG_BASE, FLASH_SIZE_REG, IDCODE_REG, KEY1, KEY2,
    OPTION_BYTE_BASE, RDP_KEY,
};
use wchflash_core::target::{DebugTarget, LoaderPoll, WorkingArea};

/// Scratch RAM base in the emulated address space
pub const RAM_BASE: u32 = 0x2000_0000;

/// Size of the option byte page in bytes
const OPTION_PAGE_SIZE: usize = 16;

/// Fast-program page size
const PAGE_SIZE: u32 = 256;

/// Sector size backing one write-protection granule
const PROT_GRANULE: u32 = 4096;

/// Configuration for the emulated target
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Flash size in bytes
    pub flash_size: u32,
    /// Scratch RAM size in bytes
    pub ram_size: u32,
    /// Value of the device ID register
    pub idcode: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            flash_size: 128 * 1024,
            ram_size: 16 * 1024,
            idcode: 0x2050_0418, // CH32F2x medium density, revision 5
        }
    }
}

/// One performed erase operation, for test assertions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseOp {
    /// Absolute flash address the erase was aimed at
    pub addr: u32,
    /// Erase unit size in bytes
    pub size: u32,
}

/// Emulated CH32F2x debug target
pub struct SimTarget {
    config: SimConfig,
    flash: Vec<u8>,
    ram: Vec<u8>,
    option_raw: [u8; OPTION_PAGE_SIZE],

    ctlr: u32,
    addr_reg: u32,
    /// Sticky WRPRTERR/EOP bits, cleared by writing them back
    statr_sticky: u32,
    main_key1: bool,
    ob_key1: bool,
    mode_key1: bool,

    latch_page: Option<u32>,
    latch: [u8; PAGE_SIZE as usize],

    wa_next: u32,
    wa_live: Vec<WorkingArea>,

    loader: Option<WriteLoader>,

    halted: bool,
    fail_alloc: bool,
    stuck_busy: bool,
    stuck_lock: bool,

    iwdg_unlocked: bool,
    iwdg_armed: bool,
    iwdg_feeds: u32,

    ctlr_log: Vec<u32>,
    erase_log: Vec<EraseOp>,
    mass_erases: u32,
    halfword_programs: u32,
    fast_page_commits: u32,
}

impl SimTarget {
    /// Emulated target with the given configuration, flash erased
    pub fn new(config: SimConfig) -> Self {
        // Value lanes all 0xFF except the factory RDP key; complement
        // lanes maintained by the controller
        let mut option_raw = [0u8; OPTION_PAGE_SIZE];
        for i in (0..OPTION_PAGE_SIZE).step_by(2) {
            let value = if i == 0 { RDP_KEY } else { 0xFF };
            option_raw[i] = value;
            option_raw[i + 1] = !value;
        }

        Self {
            flash: vec![0xFF; config.flash_size as usize],
            ram: vec![0; config.ram_size as usize],
            option_raw,
            ctlr: (Control::LOCK | Control::FLOCK).bits(),
            addr_reg: 0,
            statr_sticky: 0,
            main_key1: false,
            ob_key1: false,
            mode_key1: false,
            latch_page: None,
            latch: [0xFF; PAGE_SIZE as usize],
            wa_next: RAM_BASE,
            wa_live: Vec::new(),
            loader: None,
            halted: true,
            fail_alloc: false,
            stuck_busy: false,
            stuck_lock: false,
            iwdg_unlocked: false,
            iwdg_armed: false,
            iwdg_feeds: 0,
            ctlr_log: Vec::new(),
            erase_log: Vec::new(),
            mass_erases: 0,
            halfword_programs: 0,
            fast_page_commits: 0,
            config,
        }
    }

    /// Emulated target with the default configuration
    pub fn new_default() -> Self {
        Self::new(SimConfig::default())
    }

    /// Flash contents
    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    /// Prefill flash starting at `offset`, bypassing the controller
    pub fn preload_flash(&mut self, offset: usize, data: &[u8]) {
        self.flash[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Raw option byte page including complement lanes
    pub fn option_page(&self) -> &[u8] {
        &self.option_raw
    }

    /// Overwrite the user option byte, bypassing the controller
    pub fn set_option_user(&mut self, user: u8) {
        self.option_raw[2] = user;
        self.option_raw[3] = !user;
    }

    /// Set the write-protection mask directly (bit clear = protected)
    pub fn set_protection_mask(&mut self, mask: u32) {
        for i in 0..4 {
            let byte = (mask >> (8 * i)) as u8;
            self.option_raw[8 + 2 * i] = byte;
            self.option_raw[9 + 2 * i] = !byte;
        }
    }

    /// Mark the CPU halted or running
    pub fn set_halted(&mut self, halted: bool) {
        self.halted = halted;
    }

    /// Make every working-area allocation fail
    pub fn set_fail_alloc(&mut self, fail: bool) {
        self.fail_alloc = fail;
    }

    /// Force the status busy bit to stay set
    pub fn set_stuck_busy(&mut self, stuck: bool) {
        self.stuck_busy = stuck;
    }

    /// Make the unlock key sequence ineffective
    pub fn set_stuck_lock(&mut self, stuck: bool) {
        self.stuck_lock = stuck;
    }

    /// Every value written to the control register
    pub fn ctlr_writes(&self) -> &[u32] {
        &self.ctlr_log
    }

    /// Performed unit erases, in order (mass erases not included)
    pub fn erase_ops(&self) -> &[EraseOp] {
        &self.erase_log
    }

    /// Number of mass erases performed
    pub fn mass_erase_count(&self) -> u32 {
        self.mass_erases
    }

    /// Halfwords programmed in PG mode
    pub fn halfword_program_count(&self) -> u32 {
        self.halfword_programs
    }

    /// Fast page bursts committed with PGSTRT
    pub fn fast_page_commit_count(&self) -> u32 {
        self.fast_page_commits
    }

    /// Whether the watchdog was armed by the write routine
    pub fn iwdg_armed(&self) -> bool {
        self.iwdg_armed
    }

    /// Watchdog reloads observed
    pub fn iwdg_feed_count(&self) -> u32 {
        self.iwdg_feeds
    }

    fn ram_end(&self) -> u32 {
        RAM_BASE + self.config.ram_size
    }

    fn flash_end(&self) -> u32 {
        FLASH_BANK_BASE + self.config.flash_size
    }

    /// Whether `[addr, addr+len)` falls inside one emulated region
    fn valid(&self, addr: u32, len: u32) -> bool {
        let end = match addr.checked_add(len) {
            Some(end) => end,
            None => return false,
        };
        (addr >= FLASH_BANK_BASE && end <= self.flash_end())
            || (addr >= RAM_BASE && end <= self.ram_end())
            || (addr >= OPTION_BYTE_BASE && end <= OPTION_BYTE_BASE + OPTION_PAGE_SIZE as u32)
            || (addr >= FLASH_REG_BASE && end <= FLASH_REG_BASE + 0x28)
            || (addr >= IWDG_BASE && end <= IWDG_BASE + 0x0C)
            || (addr == FLASH_SIZE_REG && len <= 2)
            || (addr == IDCODE_REG && len == 4)
    }

    fn check(&self, addr: u32, len: u32) -> Result<()> {
        if self.valid(addr, len) {
            Ok(())
        } else {
            log::error!("access outside emulated memory: {:#010x}+{}", addr, len);
            Err(Error::Link)
        }
    }

    /// Run the loader model until it blocks or halts
    fn pump(&mut self) {
        if let Some(mut loader) = self.loader.take() {
            if !loader.finished() {
                let _ = loader.run(self);
            }
            self.loader = Some(loader);
        }
    }

    // -- option byte derived registers --------------------------------

    fn read_protected(&self) -> bool {
        self.option_raw[0] != RDP_KEY
    }

    fn obr_value(&self) -> u32 {
        let user = u32::from(self.option_raw[2]);
        (user << 2) | (u32::from(self.read_protected()) << 1)
    }

    fn wpr_value(&self) -> u32 {
        u32::from(self.option_raw[8])
            | u32::from(self.option_raw[10]) << 8
            | u32::from(self.option_raw[12]) << 16
            | u32::from(self.option_raw[14]) << 24
    }

    /// Whether any protection granule overlapping the range is protected
    fn range_protected(&self, offset: u32, len: u32) -> bool {
        let mask = self.wpr_value();
        let first = offset / PROT_GRANULE;
        let last = (offset + len - 1) / PROT_GRANULE;
        (first..=last).any(|granule| mask & (1 << granule.min(31)) == 0)
    }

    // -- register model -----------------------------------------------

    fn statr_value(&self) -> u32 {
        let busy = if self.stuck_busy { Status::BSY.bits() } else { 0 };
        self.statr_sticky | busy
    }

    fn write_statr(&mut self, value: u32) {
        // W1C bits
        self.statr_sticky &= !(value & (Status::WRPRTERR | Status::EOP).bits());
    }

    fn fault(&mut self) {
        self.statr_sticky |= Status::WRPRTERR.bits();
    }

    fn key_write(seen_key1: &mut bool, value: u32) -> bool {
        if value == KEY1 {
            *seen_key1 = true;
            false
        } else {
            let matched = *seen_key1 && value == KEY2;
            *seen_key1 = false;
            matched
        }
    }

    fn write_keyr(&mut self, value: u32) {
        let mut seen = self.main_key1;
        if Self::key_write(&mut seen, value) && !self.stuck_lock {
            self.ctlr &= !Control::LOCK.bits();
        }
        self.main_key1 = seen;
    }

    fn write_obkeyr(&mut self, value: u32) {
        let mut seen = self.ob_key1;
        if Self::key_write(&mut seen, value) && self.ctlr & Control::LOCK.bits() == 0 {
            self.ctlr |= Control::OBWRE.bits();
        }
        self.ob_key1 = seen;
    }

    fn write_modekeyr(&mut self, value: u32) {
        let mut seen = self.mode_key1;
        if Self::key_write(&mut seen, value) && self.ctlr & Control::LOCK.bits() == 0 {
            self.ctlr &= !Control::FLOCK.bits();
        }
        self.mode_key1 = seen;
    }

    fn write_ctlr(&mut self, value: u32) {
        if self.ctlr & Control::LOCK.bits() != 0 {
            // The lock only clears through the key sequence; everything
            // else is ignored while it is set
            log::warn!("control register write ignored while locked");
            return;
        }
        // FLOCK and OBWRE track the key sequences, not this register
        let keyed = (Control::FLOCK | Control::OBWRE).bits();
        self.ctlr = (value & !keyed) | (self.ctlr & keyed);
        self.ctlr_log.push(value);

        let ctrl = Control::from_bits_retain(value);
        if ctrl.contains(Control::STRT) {
            self.strobe(ctrl);
            self.ctlr &= !Control::STRT.bits();
        }
        if ctrl.contains(Control::PGSTRT) && ctrl.contains(Control::FTPG) {
            self.commit_latch();
            self.ctlr &= !Control::PGSTRT.bits();
        }
        if !ctrl.contains(Control::FTPG) {
            self.latch_page = None;
        }
    }

    /// Perform the erase selected by the mode bits accompanying STRT
    fn strobe(&mut self, ctrl: Control) {
        if ctrl.contains(Control::MER) {
            self.flash.fill(0xFF);
            self.mass_erases += 1;
            self.statr_sticky |= Status::EOP.bits();
            return;
        }
        if ctrl.contains(Control::OBER) {
            if self.ctlr & Control::OBWRE.bits() != 0 {
                self.option_raw.fill(0xFF);
                self.statr_sticky |= Status::EOP.bits();
            } else {
                log::warn!("option erase without OBWRE ignored");
            }
            return;
        }

        let size = if ctrl.contains(Control::PER) {
            4 * 1024
        } else if ctrl.contains(Control::BER32) {
            32 * 1024
        } else if ctrl.contains(Control::BER64) {
            64 * 1024
        } else if ctrl.contains(Control::FTER) {
            PAGE_SIZE
        } else {
            return;
        };

        // The fast-mode tiers sit behind FLOCK
        if !ctrl.contains(Control::PER) && self.ctlr & Control::FLOCK.bits() != 0 {
            log::warn!("fast erase ignored while FLOCK set");
            return;
        }

        let offset = (self.addr_reg - FLASH_BANK_BASE) & !(size - 1);
        if offset + size > self.config.flash_size {
            log::warn!("erase past end of flash ignored");
            return;
        }
        if self.range_protected(offset, size) {
            self.fault();
            return;
        }

        self.flash[offset as usize..(offset + size) as usize].fill(0xFF);
        self.erase_log.push(EraseOp {
            addr: FLASH_BANK_BASE + offset,
            size,
        });
        self.statr_sticky |= Status::EOP.bits();
    }

    fn latch_store(&mut self, addr: u32, bytes: &[u8]) {
        let page = addr & !(PAGE_SIZE - 1);
        if self.latch_page != Some(page) {
            if self.latch_page.is_some() {
                log::warn!("page latch redirected mid burst");
            }
            self.latch_page = Some(page);
            self.latch.fill(0xFF);
        }
        let off = (addr & (PAGE_SIZE - 1)) as usize;
        self.latch[off..off + bytes.len()].copy_from_slice(bytes);
    }

    fn commit_latch(&mut self) {
        let page = match self.latch_page.take() {
            Some(page) => page,
            None => return,
        };
        let offset = page - FLASH_BANK_BASE;
        if self.range_protected(offset, PAGE_SIZE) {
            self.fault();
            return;
        }
        for (i, byte) in self.latch.iter().enumerate() {
            // Programming can only clear bits
            self.flash[offset as usize + i] &= byte;
        }
        self.fast_page_commits += 1;
        self.statr_sticky |= Status::EOP.bits();
    }

    fn program_halfword(&mut self, addr: u32, value: u16) {
        let ctrl = Control::from_bits_retain(self.ctlr);
        let offset = addr - FLASH_BANK_BASE;
        if ctrl.contains(Control::FTPG) {
            self.latch_store(addr, &value.to_le_bytes());
        } else if ctrl.contains(Control::PG) {
            if self.range_protected(offset, 2) {
                self.fault();
                return;
            }
            let bytes = value.to_le_bytes();
            self.flash[offset as usize] &= bytes[0];
            self.flash[offset as usize + 1] &= bytes[1];
            self.halfword_programs += 1;
            self.statr_sticky |= Status::EOP.bits();
        } else {
            log::warn!("flash write at {:#010x} without a program mode", addr);
        }
    }

    fn write_iwdg(&mut self, addr: u32, value: u16) {
        match addr - IWDG_BASE {
            0x00 => match value {
                IWDG_UNLOCK => self.iwdg_unlocked = true,
                IWDG_FEED => {
                    if self.iwdg_armed {
                        self.iwdg_feeds += 1;
                    }
                }
                _ => {}
            },
            0x04 => {}
            0x08 => {
                if self.iwdg_unlocked {
                    self.iwdg_armed = true;
                }
            }
            _ => {}
        }
    }

    // -- infallible bus, shared by the host side and the loader model --

    fn bus_load_u32(&mut self, addr: u32) -> u32 {
        if addr >= FLASH_BANK_BASE && addr + 4 <= self.flash_end() {
            let off = (addr - FLASH_BANK_BASE) as usize;
            return u32::from_le_bytes(self.flash[off..off + 4].try_into().unwrap());
        }
        if addr >= RAM_BASE && addr + 4 <= self.ram_end() {
            let off = (addr - RAM_BASE) as usize;
            return u32::from_le_bytes(self.ram[off..off + 4].try_into().unwrap());
        }
        if addr >= OPTION_BYTE_BASE && addr + 4 <= OPTION_BYTE_BASE + OPTION_PAGE_SIZE as u32 {
            let off = (addr - OPTION_BYTE_BASE) as usize;
            return u32::from_le_bytes(self.option_raw[off..off + 4].try_into().unwrap());
        }
        if addr == IDCODE_REG {
            return self.config.idcode;
        }
        if addr >= FLASH_REG_BASE && addr < FLASH_REG_BASE + 0x28 {
            return match addr - FLASH_REG_BASE {
                0x0C => self.statr_value(),
                0x10 => self.ctlr,
                0x14 => self.addr_reg,
                0x1C => self.obr_value(),
                0x20 => self.wpr_value(),
                _ => 0,
            };
        }
        log::error!("unmapped load at {:#010x}", addr);
        0xFFFF_FFFF
    }

    fn bus_store_u32(&mut self, addr: u32, value: u32) {
        if addr >= RAM_BASE && addr + 4 <= self.ram_end() {
            let off = (addr - RAM_BASE) as usize;
            self.ram[off..off + 4].copy_from_slice(&value.to_le_bytes());
            return;
        }
        if addr >= FLASH_BANK_BASE && addr + 4 <= self.flash_end() {
            if Control::from_bits_retain(self.ctlr).contains(Control::FTPG) {
                self.latch_store(addr, &value.to_le_bytes());
            } else {
                log::warn!("word store to flash at {:#010x} ignored", addr);
            }
            return;
        }
        if addr >= FLASH_REG_BASE && addr < FLASH_REG_BASE + 0x28 {
            match addr - FLASH_REG_BASE {
                0x04 => self.write_keyr(value),
                0x08 => self.write_obkeyr(value),
                0x0C => self.write_statr(value),
                0x10 => self.write_ctlr(value),
                0x14 => self.addr_reg = value,
                0x24 => self.write_modekeyr(value),
                _ => {}
            }
            return;
        }
        log::error!("unmapped store at {:#010x}", addr);
    }

    fn bus_load_u16(&mut self, addr: u32) -> u16 {
        if addr == FLASH_SIZE_REG {
            return (self.config.flash_size / 1024) as u16;
        }
        if addr >= RAM_BASE && addr + 2 <= self.ram_end() {
            let off = (addr - RAM_BASE) as usize;
            return u16::from_le_bytes(self.ram[off..off + 2].try_into().unwrap());
        }
        if addr >= FLASH_BANK_BASE && addr + 2 <= self.flash_end() {
            let off = (addr - FLASH_BANK_BASE) as usize;
            return u16::from_le_bytes(self.flash[off..off + 2].try_into().unwrap());
        }
        if addr >= OPTION_BYTE_BASE && addr + 2 <= OPTION_BYTE_BASE + OPTION_PAGE_SIZE as u32 {
            let off = (addr - OPTION_BYTE_BASE) as usize;
            return u16::from_le_bytes(self.option_raw[off..off + 2].try_into().unwrap());
        }
        log::error!("unmapped halfword load at {:#010x}", addr);
        0xFFFF
    }

    fn bus_store_u16(&mut self, addr: u32, value: u16) {
        if addr >= RAM_BASE && addr + 2 <= self.ram_end() {
            let off = (addr - RAM_BASE) as usize;
            self.ram[off..off + 2].copy_from_slice(&value.to_le_bytes());
            return;
        }
        if addr >= FLASH_BANK_BASE && addr + 2 <= self.flash_end() {
            self.program_halfword(addr, value);
            return;
        }
        if addr >= OPTION_BYTE_BASE && addr + 2 <= OPTION_BYTE_BASE + OPTION_PAGE_SIZE as u32 {
            let ctrl = Control::from_bits_retain(self.ctlr);
            if ctrl.contains(Control::OBPG) && ctrl.contains(Control::OBWRE) {
                let off = (addr - OPTION_BYTE_BASE) as usize & !1;
                // The controller programs the complement lane itself
                self.option_raw[off] = value as u8;
                self.option_raw[off + 1] = !(value as u8);
                self.statr_sticky |= Status::EOP.bits();
            } else {
                log::warn!("option byte write without OBPG/OBWRE ignored");
            }
            return;
        }
        if addr >= IWDG_BASE && addr < IWDG_BASE + 0x0C {
            self.write_iwdg(addr, value);
            return;
        }
        log::error!("unmapped halfword store at {:#010x}", addr);
    }
}

impl LoaderBus for SimTarget {
    fn load_u32(&mut self, addr: u32) -> u32 {
        self.bus_load_u32(addr)
    }

    fn store_u32(&mut self, addr: u32, value: u32) {
        self.bus_store_u32(addr, value);
    }

    fn load_u16(&mut self, addr: u32) -> u16 {
        self.bus_load_u16(addr)
    }

    fn store_u16(&mut self, addr: u32, value: u16) {
        self.bus_store_u16(addr, value);
    }
}

#[maybe_async(AFIT)]
impl DebugTarget for SimTarget {
    async fn is_halted(&mut self) -> Result<bool> {
        Ok(self.halted)
    }

    async fn read_u32(&mut self, addr: u32) -> Result<u32> {
        self.pump();
        self.check(addr, 4)?;
        Ok(self.bus_load_u32(addr))
    }

    async fn read_u16(&mut self, addr: u32) -> Result<u16> {
        self.pump();
        self.check(addr, 2)?;
        Ok(self.bus_load_u16(addr))
    }

    async fn write_u32(&mut self, addr: u32, value: u32) -> Result<()> {
        self.check(addr, 4)?;
        self.bus_store_u32(addr, value);
        self.pump();
        Ok(())
    }

    async fn write_u16(&mut self, addr: u32, value: u16) -> Result<()> {
        self.check(addr, 2)?;
        self.bus_store_u16(addr, value);
        self.pump();
        Ok(())
    }

    async fn read_mem(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.pump();
        self.check(addr, buf.len() as u32)?;
        if addr >= RAM_BASE {
            let off = (addr - RAM_BASE) as usize;
            buf.copy_from_slice(&self.ram[off..off + buf.len()]);
        } else if addr >= FLASH_BANK_BASE && addr < self.flash_end() {
            let off = (addr - FLASH_BANK_BASE) as usize;
            buf.copy_from_slice(&self.flash[off..off + buf.len()]);
        } else {
            return Err(Error::Link);
        }
        Ok(())
    }

    async fn write_mem(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.check(addr, data.len() as u32)?;
        if addr < RAM_BASE || addr >= self.ram_end() {
            // Bulk writes only target scratch RAM; flash goes through the
            // controller
            return Err(Error::Link);
        }
        let off = (addr - RAM_BASE) as usize;
        self.ram[off..off + data.len()].copy_from_slice(data);
        self.pump();
        Ok(())
    }

    async fn alloc_working_area(&mut self, size: u32) -> Result<Option<WorkingArea>> {
        if self.fail_alloc {
            return Ok(None);
        }
        let size = (size + 3) & !3;
        if self.wa_next + size > self.ram_end() {
            return Ok(None);
        }
        let area = WorkingArea {
            address: self.wa_next,
            size,
        };
        self.wa_next += size;
        self.wa_live.push(area);
        log::debug!("working area {:#010x}+{:#x}", area.address, area.size);
        Ok(Some(area))
    }

    async fn free_working_area(&mut self, area: WorkingArea) -> Result<()> {
        match self.wa_live.iter().position(|a| *a == area) {
            Some(pos) => {
                self.wa_live.remove(pos);
                if area.end() == self.wa_next {
                    self.wa_next = area.address;
                }
                Ok(())
            }
            None => {
                log::error!("freeing unknown working area {:#010x}", area.address);
                Err(Error::Link)
            }
        }
    }

    fn working_area_avail(&self) -> u32 {
        self.ram_end() - self.wa_next
    }

    async fn start_write_loader(&mut self, entry: u32, params: &LoaderParams) -> Result<()> {
        self.check(entry, 4)?;
        // The fifth parameter travels in the stack slot sp points at,
        // exactly as the real routine fetches it
        let halfwords = self.bus_load_u32(params.sp);
        self.loader = Some(WriteLoader::new(&LoaderParams {
            halfwords,
            ..*params
        }));
        self.pump();
        Ok(())
    }

    async fn poll_loader(&mut self) -> Result<LoaderPoll> {
        self.pump();
        match &self.loader {
            Some(loader) if loader.finished() => Ok(LoaderPoll::Finished { r0: loader.r0() }),
            Some(_) => Ok(LoaderPoll::Running),
            None => Err(Error::Link),
        }
    }

    async fn delay_ms(&mut self, _ms: u32) {
        self.pump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unlocked(target: &mut SimTarget) {
        target.bus_store_u32(FLASH_REG_BASE + 0x04, KEY1);
        target.bus_store_u32(FLASH_REG_BASE + 0x04, KEY2);
    }

    #[test]
    fn reset_state_is_locked() {
        let mut t = SimTarget::new_default();
        let ctlr = Control::from_bits_retain(t.bus_load_u32(FLASH_REG_BASE + 0x10));
        assert!(ctlr.contains(Control::LOCK));
        assert!(ctlr.contains(Control::FLOCK));
        assert!(!ctlr.contains(Control::OBWRE));
    }

    #[test]
    fn key_sequence_clears_lock() {
        let mut t = SimTarget::new_default();
        unlocked(&mut t);
        let ctlr = Control::from_bits_retain(t.bus_load_u32(FLASH_REG_BASE + 0x10));
        assert!(!ctlr.contains(Control::LOCK));
    }

    #[test]
    fn wrong_key_order_does_not_unlock() {
        let mut t = SimTarget::new_default();
        t.bus_store_u32(FLASH_REG_BASE + 0x04, KEY2);
        t.bus_store_u32(FLASH_REG_BASE + 0x04, KEY1);
        let ctlr = Control::from_bits_retain(t.bus_load_u32(FLASH_REG_BASE + 0x10));
        assert!(ctlr.contains(Control::LOCK));
    }

    #[test]
    fn control_writes_ignored_while_locked() {
        let mut t = SimTarget::new_default();
        t.bus_store_u32(FLASH_REG_BASE + 0x10, Control::PER.bits());
        let ctlr = Control::from_bits_retain(t.bus_load_u32(FLASH_REG_BASE + 0x10));
        assert!(!ctlr.contains(Control::PER));
        assert!(ctlr.contains(Control::LOCK));
    }

    #[test]
    fn sector_erase_fills_ff() {
        let mut t = SimTarget::new_default();
        t.preload_flash(0, &[0u8; 8192]);
        unlocked(&mut t);
        t.bus_store_u32(FLASH_REG_BASE + 0x14, FLASH_BANK_BASE);
        t.bus_store_u32(FLASH_REG_BASE + 0x10, Control::PER.bits());
        t.bus_store_u32(FLASH_REG_BASE + 0x10, (Control::PER | Control::STRT).bits());
        assert!(t.flash()[..4096].iter().all(|&b| b == 0xFF));
        assert!(t.flash()[4096..8192].iter().all(|&b| b == 0));
        assert_eq!(t.erase_ops(), &[EraseOp { addr: FLASH_BANK_BASE, size: 4096 }]);
    }

    #[test]
    fn protected_erase_sets_wrprterr() {
        let mut t = SimTarget::new_default();
        t.set_protection_mask(!1); // protect block 0
        unlocked(&mut t);
        t.bus_store_u32(FLASH_REG_BASE + 0x14, FLASH_BANK_BASE);
        t.bus_store_u32(FLASH_REG_BASE + 0x10, Control::PER.bits());
        t.bus_store_u32(FLASH_REG_BASE + 0x10, (Control::PER | Control::STRT).bits());
        let statr = Status::from_bits_retain(t.bus_load_u32(FLASH_REG_BASE + 0x0C));
        assert!(statr.contains(Status::WRPRTERR));
        assert!(t.erase_ops().is_empty());
    }

    #[test]
    fn wrprterr_is_write_one_to_clear() {
        let mut t = SimTarget::new_default();
        t.fault();
        t.bus_store_u32(FLASH_REG_BASE + 0x0C, Status::WRPRTERR.bits());
        let statr = Status::from_bits_retain(t.bus_load_u32(FLASH_REG_BASE + 0x0C));
        assert!(!statr.contains(Status::WRPRTERR));
    }

    #[test]
    fn option_page_boots_with_complements() {
        let t = SimTarget::new_default();
        let page = t.option_page();
        assert_eq!(page[0], RDP_KEY);
        assert_eq!(page[1], !RDP_KEY);
        assert_eq!(page[8], 0xFF);
        // wpr reads back as all-unprotected
        assert_eq!(page[2], 0xFF);
    }
}
