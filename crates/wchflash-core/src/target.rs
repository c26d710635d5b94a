//! Debug target abstraction
//!
//! The engine never talks to a probe directly; it is generic over the
//! [`DebugTarget`] trait, which exposes the handful of primitives a debug
//! link provides: memory access on the halted core, working-area (scratch
//! RAM) management, and starting/polling the resident write routine.
//!
//! These traits use `maybe_async` so the same engine builds for blocking
//! probe drivers (`is_sync` feature) and async ones.

use crate::error::Result;
use crate::loader::LoaderParams;
use maybe_async::maybe_async;

/// A region of target RAM reserved for the host
///
/// Obtained from [`DebugTarget::alloc_working_area`] and returned with
/// [`DebugTarget::free_working_area`]. The engine treats the handle as
/// opaque apart from its address and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingArea {
    /// Target address of the first byte
    pub address: u32,
    /// Size in bytes actually reserved (may be rounded up by the target)
    pub size: u32,
}

impl WorkingArea {
    /// Address one past the last byte
    pub fn end(&self) -> u32 {
        self.address + self.size
    }
}

/// Execution state of the resident write routine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderPoll {
    /// Routine is still executing
    Running,
    /// Routine hit its breakpoint; `r0` is the value it left in r0
    Finished {
        /// Final r0: the register base on clean completion, zero after a
        /// sentinel exit, or the raw status register value after a fault
        r0: u32,
    },
}

/// Debug target primitives required by the flash engine
///
/// Implementations exist per probe backend; `wchflash-dummy` provides an
/// emulated one for tests. All memory accesses refer to the target's
/// address space and require the core to be halted.
#[maybe_async(AFIT)]
pub trait DebugTarget {
    /// Whether the target CPU is currently halted
    async fn is_halted(&mut self) -> Result<bool>;

    /// Read a 32-bit word from target memory
    async fn read_u32(&mut self, addr: u32) -> Result<u32>;

    /// Read a 16-bit halfword from target memory
    async fn read_u16(&mut self, addr: u32) -> Result<u16>;

    /// Write a 32-bit word to target memory
    async fn write_u32(&mut self, addr: u32, value: u32) -> Result<()>;

    /// Write a 16-bit halfword to target memory
    async fn write_u16(&mut self, addr: u32, value: u16) -> Result<()>;

    /// Read a byte buffer from target memory
    async fn read_mem(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Write a byte buffer to target memory
    async fn write_mem(&mut self, addr: u32, data: &[u8]) -> Result<()>;

    /// Reserve `size` bytes of target scratch RAM
    ///
    /// Returns `None` when not enough scratch is free. That is a normal
    /// outcome (the write engine falls back to host-paced programming),
    /// not an error.
    async fn alloc_working_area(&mut self, size: u32) -> Result<Option<WorkingArea>>;

    /// Release a working area obtained from [`Self::alloc_working_area`]
    async fn free_working_area(&mut self, area: WorkingArea) -> Result<()>;

    /// Scratch RAM still available for allocation, in bytes
    fn working_area_avail(&self) -> u32;

    /// Start the resident write routine at `entry` with the given
    /// parameters loaded per the [`LoaderParams`] calling convention
    async fn start_write_loader(&mut self, entry: u32, params: &LoaderParams) -> Result<()>;

    /// Check whether the resident routine is still running
    async fn poll_loader(&mut self) -> Result<LoaderPoll>;

    /// Sleep for the given number of milliseconds
    ///
    /// Used between status polls; implementations should keep the debug
    /// link responsive while waiting.
    async fn delay_ms(&mut self, ms: u32);
}
