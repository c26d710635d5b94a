//! Resident write routine: wire format, calling convention, state machine
//!
//! Block writes stream data through a ring buffer in target RAM to a small
//! routine running on the target CPU. The routine ships as an opaque
//! Thumb-2 blob ([`LOADER_CODE`], assembled from
//! `loaders/ch32f2x_write.S`); its observable behavior is modeled here as
//! the explicit state machine [`WriteLoader`] so that emulated targets and
//! tests can execute it without an instruction-set simulator.
//!
//! The ring buffer lives at the start of the data working area:
//!
//! ```text
//! offset 0: write pointer (u32 LE) - producer cursor, advanced by the host
//! offset 4: read pointer  (u32 LE) - consumer cursor, advanced by the target
//! offset 8: payload, wrapping back to offset 8
//! ```
//!
//! Both cursors hold absolute target addresses within the payload region.
//! A write pointer of exactly zero is the stream-termination sentinel. The
//! consumer never advances past the producer; the producer keeps a one
//! unit gap so the full and empty states stay distinguishable.

use crate::regs::{Control, RegisterMap, Status, KEY1, KEY2};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Size of a fast-program page in bytes
pub const PAGE_SIZE: u32 = 256;

/// Words per fast-program page burst
pub const PAGE_WORDS: u32 = PAGE_SIZE / 4;

/// Halfwords per fast-program page
pub const PAGE_HALFWORDS: u32 = PAGE_SIZE / 2;

/// Ring buffer header size (write pointer + read pointer)
pub const HEADER_SIZE: u32 = 8;

/// Stack reserved for the resident routine, bytes
pub const STACK_SIZE: u32 = 32;

/// Independent watchdog register base
pub const IWDG_BASE: u32 = 0x4000_3000;
/// IWDG control key: enable register access
pub const IWDG_UNLOCK: u16 = 0x5555;
/// IWDG control key: reload the counter
pub const IWDG_FEED: u16 = 0xAAAA;
/// Prescaler divider for the ~32 s safety timeout
pub const IWDG_PRESCALER: u16 = 0x06;
/// Maximum reload value
pub const IWDG_RELOAD: u16 = 0x0FFF;

/// Spin budget for the modeled busy loops
///
/// The routine on silicon spins without bound; the model converts an
/// exhausted spin into a fault so a wedged emulated bus cannot hang the
/// host process.
const SPIN_LIMIT: u32 = 1_000_000;

/// Ring buffer header as it appears in target memory
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct StreamHeader {
    /// Producer cursor (absolute target address), zero terminates
    pub write_ptr: U32,
    /// Consumer cursor (absolute target address)
    pub read_ptr: U32,
}

impl StreamHeader {
    /// Header with both cursors primed to the first payload byte
    pub fn primed(buffer_start: u32) -> Self {
        let data = buffer_start + HEADER_SIZE;
        Self {
            write_ptr: U32::new(data),
            read_ptr: U32::new(data),
        }
    }
}

/// Parameters of the resident routine
///
/// Calling convention (Thumb, no call stack of its own):
///
/// | carrier    | parameter                                   |
/// |------------|---------------------------------------------|
/// | r0         | flash controller register base (also return)|
/// | r1         | ring buffer start (header address)          |
/// | r2         | ring buffer end (one past last payload byte)|
/// | r3         | first target flash address                  |
/// | stack slot | halfword count, at the initial sp           |
///
/// The fifth parameter does not fit a register; the host stores it at the
/// 8-byte-aligned stack top minus 4 and points sp there before starting
/// the routine. On exit r0 holds the register base (clean completion),
/// zero (sentinel exit) or the raw status register value (fault).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderParams {
    /// r0: flash controller register base
    pub reg_base: u32,
    /// r1: ring buffer start
    pub buffer_start: u32,
    /// r2: ring buffer end
    pub buffer_end: u32,
    /// r3: first flash address to program
    pub dest: u32,
    /// Halfword count, stored in the stack slot at `sp`
    pub halfwords: u32,
    /// Initial stack pointer; the halfword count lives at this address
    pub sp: u32,
}

/// Contiguous bytes the producer may write at `wp` without wrapping
///
/// `data_start` is the first payload address (buffer start + header) and
/// `buf_end` one past the last. Keeps a one-halfword gap so the producer
/// never advances onto the consumer.
pub fn ring_free_contiguous(wp: u32, rp: u32, data_start: u32, buf_end: u32) -> u32 {
    if wp >= rp {
        // Writing the tail; stop short of the end when a wrap would land
        // exactly on the consumer.
        let limit = if rp == data_start { buf_end - 2 } else { buf_end };
        limit - wp
    } else {
        rp - wp - 2
    }
}

/// Advance the producer cursor, wrapping past the payload end
pub fn ring_advance(wp: u32, len: u32, data_start: u32, buf_end: u32) -> u32 {
    let next = wp + len;
    if next >= buf_end {
        data_start
    } else {
        next
    }
}

/// Memory and register access as seen by the resident routine
///
/// Implemented by emulated targets. All accesses are target-side and
/// infallible: the routine runs out of RAM it was just loaded into, and a
/// genuinely stuck peripheral surfaces through the bounded spin guards.
pub trait LoaderBus {
    /// Load a 32-bit word
    fn load_u32(&mut self, addr: u32) -> u32;
    /// Store a 32-bit word
    fn store_u32(&mut self, addr: u32, value: u32);
    /// Load a 16-bit halfword
    fn load_u16(&mut self, addr: u32) -> u16;
    /// Store a 16-bit halfword
    fn store_u16(&mut self, addr: u32, value: u16);
}

/// Execution state of the modeled routine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    /// Not started; watchdog check pending
    Idle,
    /// Top of the outer loop, choosing the next program mode
    Step,
    /// Mid fast-page burst with this many words still to copy
    FastBurst {
        /// Words of the current page not yet copied into the latch
        words_left: u32,
        /// Low halfword of a word whose high half is still in the ring
        low: Option<u16>,
    },
    /// Fast burst copied, PGSTRT strobe pending
    FastCommit,
    /// Single halfword program pending data
    HalfwordStep,
    /// Stopped after a protection fault
    Fault,
    /// Stopped normally (breakpoint)
    Done,
}

/// Result of one [`WriteLoader::run`] slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderRun {
    /// Starved: the ring is empty and no sentinel was seen; run again
    /// after the producer makes progress
    Blocked,
    /// Routine reached its breakpoint; see [`WriteLoader::r0`]
    Halted,
}

enum Fifo {
    /// Data available at the consumer cursor
    Data,
    /// Ring empty, producer still active
    Starved,
    /// Producer wrote the zero sentinel
    Sentinel,
}

/// The resident flash write routine, modeled as a state machine
///
/// `run` executes until the routine would block on an empty ring or until
/// it halts. Between slices the host (or the emulator driving this model)
/// may refill the ring and re-run; the state carries across slices exactly
/// like the suspended spin loop does on silicon.
#[derive(Debug)]
pub struct WriteLoader {
    regs: RegisterMap,
    buf_start: u32,
    buf_end: u32,
    dest: u32,
    hwords_left: u32,
    /// Consumer cursor (absolute address); mirrors the published header
    /// field except while a copy is in flight
    rp: u32,
    /// Last producer cursor read from the header
    wp_seen: u32,
    state: LoaderState,
    r0: u32,
}

impl WriteLoader {
    /// Model the routine started with the given parameters
    pub fn new(params: &LoaderParams) -> Self {
        Self {
            regs: RegisterMap::new(params.reg_base),
            buf_start: params.buffer_start,
            buf_end: params.buffer_end,
            dest: params.dest,
            hwords_left: params.halfwords,
            rp: 0,
            wp_seen: 0,
            state: LoaderState::Idle,
            r0: params.reg_base,
        }
    }

    /// Current state
    pub fn state(&self) -> LoaderState {
        self.state
    }

    /// Whether the routine has hit its breakpoint
    pub fn finished(&self) -> bool {
        matches!(self.state, LoaderState::Done | LoaderState::Fault)
    }

    /// Value left in r0 (valid once finished)
    pub fn r0(&self) -> u32 {
        self.r0
    }

    fn ctrl<B: LoaderBus>(&self, bus: &mut B) -> Control {
        Control::from_bits_retain(bus.load_u32(self.regs.ctlr()))
    }

    fn set_ctrl<B: LoaderBus>(&self, bus: &mut B, value: Control) {
        bus.store_u32(self.regs.ctlr(), value.bits());
    }

    fn statr<B: LoaderBus>(&self, bus: &mut B) -> Status {
        Status::from_bits_retain(bus.load_u32(self.regs.statr()))
    }

    fn publish_rp<B: LoaderBus>(&self, bus: &mut B, value: u32) {
        bus.store_u32(self.buf_start + 4, value);
    }

    /// Transition guard: wait for the ring to hold data
    ///
    /// One probe of the header per call; a starved ring suspends the slice
    /// instead of spinning, since only the host can make progress.
    fn wait_fifo<B: LoaderBus>(&mut self, bus: &mut B) -> Fifo {
        loop {
            if self.wp_seen != self.rp {
                return Fifo::Data;
            }
            let wp = bus.load_u32(self.buf_start);
            if wp == 0 {
                return Fifo::Sentinel;
            }
            if wp == self.wp_seen {
                return Fifo::Starved;
            }
            self.wp_seen = wp;
            self.rp = bus.load_u32(self.buf_start + 4);
        }
    }

    /// Transition guard: wait for BSY to clear, then check WRPRTERR
    ///
    /// On a protection error the routine signals the host by zeroing the
    /// published read pointer and leaving the raw status in r0.
    fn wait_busy<B: LoaderBus>(&mut self, bus: &mut B) -> Result<(), ()> {
        let mut spins = SPIN_LIMIT;
        let mut status = self.statr(bus);
        while status.contains(Status::BSY) {
            if spins == 0 {
                break;
            }
            spins -= 1;
            status = self.statr(bus);
        }
        if status.contains(Status::WRPRTERR) || spins == 0 {
            self.publish_rp(bus, 0);
            self.r0 = status.bits();
            Err(())
        } else {
            Ok(())
        }
    }

    fn wait_word_busy<B: LoaderBus>(&mut self, bus: &mut B) {
        let mut spins = SPIN_LIMIT;
        while self.statr(bus).contains(Status::WRBSY) && spins > 0 {
            spins -= 1;
        }
    }

    fn feed_watchdog<B: LoaderBus>(&self, bus: &mut B) {
        bus.store_u16(IWDG_BASE, IWDG_FEED);
    }

    fn wrap_rp(&mut self) {
        if self.rp >= self.buf_end {
            self.rp = self.buf_start + HEADER_SIZE;
        }
    }

    /// Clear program modes and halt; the exit path shared by completion,
    /// sentinel exit and fault
    fn exit<B: LoaderBus>(&mut self, bus: &mut B, state: LoaderState) -> LoaderRun {
        let ctrl = self.ctrl(bus);
        self.set_ctrl(bus, ctrl & !Control::PG);
        let ctrl = self.ctrl(bus);
        self.set_ctrl(bus, ctrl & !Control::FTPG);
        self.state = state;
        LoaderRun::Halted
    }

    /// Execute until the ring starves or the routine halts
    pub fn run<B: LoaderBus>(&mut self, bus: &mut B) -> LoaderRun {
        loop {
            match self.state {
                LoaderState::Idle => {
                    // Hardware watchdog selected: arm it with its maximum
                    // period as a safety net, it cannot be paused
                    let obr = bus.load_u32(self.regs.obr());
                    if obr & crate::regs::ObStatus::IWDG_SW.bits() == 0 {
                        bus.store_u16(IWDG_BASE, IWDG_UNLOCK);
                        bus.store_u16(IWDG_BASE + 0x04, IWDG_PRESCALER);
                        bus.store_u16(IWDG_BASE + 0x08, IWDG_RELOAD);
                    }
                    self.state = LoaderState::Step;
                }
                LoaderState::Step => {
                    if self.hwords_left == 0 {
                        return self.exit(bus, LoaderState::Done);
                    }
                    self.feed_watchdog(bus);
                    if self.dest % PAGE_SIZE == 0 && self.hwords_left >= PAGE_HALFWORDS {
                        // Fast page program: leave halfword mode, unlock
                        // the fast-mode lock if still set
                        let ctrl = self.ctrl(bus);
                        self.set_ctrl(bus, ctrl & !Control::PG);
                        if self.ctrl(bus).contains(Control::FLOCK) {
                            bus.store_u32(self.regs.modekeyr(), KEY1);
                            bus.store_u32(self.regs.modekeyr(), KEY2);
                        }
                        if self.wait_busy(bus).is_err() {
                            return self.exit(bus, LoaderState::Fault);
                        }
                        let ctrl = self.ctrl(bus);
                        self.set_ctrl(bus, ctrl | Control::FTPG);
                        self.state = LoaderState::FastBurst {
                            words_left: PAGE_WORDS,
                            low: None,
                        };
                    } else {
                        let ctrl = self.ctrl(bus);
                        self.set_ctrl(bus, ctrl & !Control::FTPG);
                        let ctrl = self.ctrl(bus);
                        self.set_ctrl(bus, ctrl | Control::PG);
                        self.state = LoaderState::HalfwordStep;
                    }
                }
                LoaderState::FastBurst { words_left, low } => {
                    let mut left = words_left;
                    let mut pending = low;
                    while left > 0 {
                        match self.wait_fifo(bus) {
                            Fifo::Data => {}
                            Fifo::Starved => {
                                self.state = LoaderState::FastBurst {
                                    words_left: left,
                                    low: pending,
                                };
                                return LoaderRun::Blocked;
                            }
                            Fifo::Sentinel => {
                                self.r0 = 0;
                                return self.exit(bus, LoaderState::Done);
                            }
                        }
                        // The ring holds halfword granular data and the
                        // consumer cursor may sit on any halfword, so each
                        // word is fetched as two gated halfword loads
                        let half = bus.load_u16(self.rp);
                        self.rp += 2;
                        self.wrap_rp();
                        self.publish_rp(bus, self.rp);
                        self.hwords_left -= 1;
                        match pending.take() {
                            None => pending = Some(half),
                            Some(lo) => {
                                let word = u32::from(lo) | u32::from(half) << 16;
                                bus.store_u32(self.dest, word);
                                self.dest += 4;
                                self.wait_word_busy(bus);
                                left -= 1;
                            }
                        }
                    }
                    self.state = LoaderState::FastCommit;
                }
                LoaderState::FastCommit => {
                    let ctrl = self.ctrl(bus);
                    self.set_ctrl(bus, ctrl | Control::PGSTRT);
                    if self.wait_busy(bus).is_err() {
                        return self.exit(bus, LoaderState::Fault);
                    }
                    self.state = LoaderState::Step;
                }
                LoaderState::HalfwordStep => {
                    match self.wait_fifo(bus) {
                        Fifo::Data => {}
                        Fifo::Starved => return LoaderRun::Blocked,
                        Fifo::Sentinel => {
                            self.r0 = 0;
                            return self.exit(bus, LoaderState::Done);
                        }
                    }
                    let half = bus.load_u16(self.rp);
                    bus.store_u16(self.dest, half);
                    self.rp += 2;
                    self.dest += 2;
                    if self.wait_busy(bus).is_err() {
                        return self.exit(bus, LoaderState::Fault);
                    }
                    self.wrap_rp();
                    self.publish_rp(bus, self.rp);
                    self.hwords_left -= 1;
                    self.state = LoaderState::Step;
                }
                LoaderState::Fault | LoaderState::Done => return LoaderRun::Halted,
            }
        }
    }
}

/// The assembled resident routine
///
/// Thumb-2, position independent, ends in a breakpoint. Built from
/// `loaders/ch32f2x_write.S`; regenerate with the Makefile there when the
/// source changes. [`WriteLoader`] is the behavioral model of this blob.
pub const LOADER_CODE: &[u8] = &[
    0x2c, 0x46, 0x00, 0x25, 0x00, 0x26, 0x9f, 0x4f, 0xd0, 0xf8, 0x1c, 0x80, 0x18, 0xf0, 0x04, 0x0f,
    0x1a, 0xd1, 0x40, 0xf2, 0x55, 0x58, 0xa7, 0xf8, 0x00, 0x80, 0x4f, 0xf0, 0x06, 0x08, 0xa7, 0xf8,
    0x04, 0x80, 0x4f, 0xf6, 0xff, 0x78, 0xa7, 0xf8, 0x08, 0x80, 0x00, 0x2c, 0x7b, 0xd0, 0x40, 0xf2,
    0xaa, 0x58, 0xa7, 0xf8, 0x00, 0x80, 0x13, 0xf0, 0xff, 0x0f, 0x29, 0xd1, 0xb4, 0xf5, 0x80, 0x7f,
    0x26, 0xd3, 0xd0, 0xf8, 0x10, 0x80, 0x28, 0xf0, 0x01, 0x08, 0xc0, 0xf8, 0x10, 0x80, 0xd0, 0xf8,
    0x10, 0x80, 0x18, 0xf4, 0x00, 0x4f, 0x08, 0xd0, 0x96, 0x4f, 0xc0, 0xf8, 0x24, 0x70, 0x96, 0x4f,
    0xc0, 0xf8, 0x24, 0x70, 0x00, 0xbf, 0x00, 0xbf, 0x00, 0xbf, 0x00, 0xf1, 0x0c, 0x07, 0x3f, 0x68,
    0x17, 0xf0, 0x01, 0x0f, 0xfb, 0xd1, 0x17, 0xf0, 0x10, 0x0f, 0x4e, 0xd1, 0xd0, 0xf8, 0x10, 0x80,
    0x48, 0xf4, 0x80, 0x38, 0xc0, 0xf8, 0x10, 0x80, 0x40, 0x27, 0x2e, 0x46, 0x0d, 0x68, 0x00, 0x2d,
    0x5a, 0xd0, 0xb5, 0x42, 0xfa, 0xd0, 0x35, 0xf8, 0x02, 0x9b, 0x95, 0x42, 0x01, 0xd3, 0x09, 0xf1,
    0x08, 0x05, 0x4d, 0x60, 0x0d, 0x68, 0x00, 0x2d, 0x4e, 0xd0, 0xb5, 0x42, 0xfa, 0xd0, 0x35, 0xf8,
    0x02, 0xab, 0x49, 0xea, 0x0a, 0x49, 0x95, 0x42, 0x01, 0xd3, 0x09, 0xf1, 0x08, 0x05, 0x4d, 0x60,
    0x43, 0xf8, 0x04, 0x9b, 0xd0, 0xf8, 0x0c, 0xa0, 0x1a, 0xf0, 0x02, 0x0f, 0xfa, 0xd1, 0xa4, 0xf1,
    0x02, 0x04, 0x01, 0x3f, 0xd5, 0xd1, 0xd0, 0xf8, 0x10, 0x80, 0x48, 0xf4, 0x00, 0x18, 0xc0, 0xf8,
    0x10, 0x80, 0x00, 0xf1, 0x0c, 0x07, 0x3f, 0x68, 0x17, 0xf0, 0x01, 0x0f, 0xfb, 0xd1, 0x17, 0xf0,
    0x10, 0x0f, 0x1f, 0xd1, 0xa8, 0xe7, 0xd0, 0xf8, 0x10, 0x80, 0x28, 0xf4, 0x80, 0x38, 0x48, 0xf0,
    0x01, 0x08, 0xc0, 0xf8, 0x10, 0x80, 0x0d, 0x68, 0x00, 0x2d, 0x1b, 0xd0, 0xb5, 0x42, 0xfa, 0xd0,
    0x35, 0xf8, 0x02, 0x9b, 0x23, 0xf8, 0x02, 0x9b, 0x00, 0xf1, 0x0c, 0x07, 0x3f, 0x68, 0x17, 0xf0,
    0x01, 0x0f, 0xfb, 0xd1, 0x17, 0xf0, 0x10, 0x0f, 0x07, 0xd1, 0x95, 0x42, 0x01, 0xd3, 0x09, 0xf1,
    0x08, 0x05, 0x4d, 0x60, 0x01, 0x3c, 0x84, 0xe7, 0x00, 0x20, 0x48, 0x60, 0x47, 0x46, 0x00, 0xe0,
    0x00, 0x25, 0xd0, 0xf8, 0x10, 0x80, 0x28, 0xf0, 0x01, 0x08, 0xc0, 0xf8, 0x10, 0x80, 0xd0, 0xf8,
    0x10, 0x80, 0x28, 0xf4, 0x80, 0x38, 0xc0, 0xf8, 0x10, 0x80, 0x00, 0xbe, 0x23, 0x01, 0x67, 0x45,
    0xab, 0x89, 0xef, 0xcd, 0x00, 0x30, 0x00, 0x40,
];

#[cfg(test)]
mod tests {
    use super::*;

    const DATA: u32 = 0x2000_0008; // buf_start 0x2000_0000, header 8 bytes
    const END: u32 = 0x2000_0108;

    #[test]
    fn empty_ring_leaves_full_payload_minus_gap() {
        // Both cursors primed: free space ends 2 bytes short of the end
        // because a wrap would land on the consumer
        assert_eq!(ring_free_contiguous(DATA, DATA, DATA, END), END - DATA - 2);
    }

    #[test]
    fn tail_space_runs_to_buffer_end_when_consumer_advanced() {
        assert_eq!(ring_free_contiguous(DATA + 16, DATA + 8, DATA, END), END - DATA - 16);
    }

    #[test]
    fn wrapped_producer_stops_short_of_consumer() {
        assert_eq!(ring_free_contiguous(DATA, DATA + 64, DATA, END), 62);
        assert_eq!(ring_free_contiguous(DATA + 60, DATA + 64, DATA, END), 2);
        assert_eq!(ring_free_contiguous(DATA + 62, DATA + 64, DATA, END), 0);
    }

    #[test]
    fn advance_wraps_at_end() {
        assert_eq!(ring_advance(END - 2, 2, DATA, END), DATA);
        assert_eq!(ring_advance(DATA, 4, DATA, END), DATA + 4);
    }

    #[test]
    fn primed_header_points_past_itself() {
        let hdr = StreamHeader::primed(0x2000_0000);
        assert_eq!(hdr.write_ptr.get(), 0x2000_0008);
        assert_eq!(hdr.read_ptr.get(), 0x2000_0008);
    }

    #[test]
    fn loader_blob_ends_in_breakpoint_before_literals() {
        // Three 32-bit literals (two unlock keys, IWDG base) trail the code
        let code_end = LOADER_CODE.len() - 12;
        assert_eq!(&LOADER_CODE[code_end - 2..code_end], &[0x00, 0xbe]);
    }
}
