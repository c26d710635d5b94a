//! Flash programming
//!
//! The primary path streams data through a ring buffer in target RAM to
//! the resident write routine, which picks fast page bursts or single
//! halfword programs on its own. When no usable working area can be
//! reserved the engine falls back to host-paced halfword programming over
//! the debug link, which is slow but needs no target RAM at all.

use crate::bank::FlashBank;
use crate::error::{Error, Result};
use crate::loader::{
    ring_advance, ring_free_contiguous, LoaderParams, StreamHeader, HEADER_SIZE, LOADER_CODE,
    PAGE_HALFWORDS, STACK_SIZE,
};
use crate::regs::{self, timeout, Control, RegisterMap, Status};
use crate::target::{DebugTarget, LoaderPoll, WorkingArea};
use crate::unlock;
use maybe_async::maybe_async;
use zerocopy::IntoBytes;

/// Smallest scratch (after the stack reservation) worth streaming
/// through; with less the fallback is used instead. Small writes still
/// stream, through a ring sized to the data.
const MIN_BUFFER_SIZE: u32 = 256;

/// Error matching the status a faulted routine left in r0
fn fault_error(r0: u32) -> Error {
    if Status::from_bits_retain(r0).contains(Status::WRPRTERR) {
        Error::ProtectionViolation
    } else {
        Error::BusyTimeout
    }
}

/// Program `data` at `offset` bytes into the bank
///
/// The range must already be erased. Both offset and length must be
/// halfword aligned.
#[maybe_async]
pub async fn write<T: DebugTarget + ?Sized>(
    target: &mut T,
    bank: &FlashBank,
    data: &[u8],
    offset: u32,
) -> Result<()> {
    if !target.is_halted().await? {
        log::error!("target not halted");
        return Err(Error::NotHalted);
    }
    if !bank.is_probed() {
        return Err(Error::NotProbed);
    }
    if offset % 2 != 0 || data.len() % 2 != 0 {
        log::warn!("offset {:#x} and size {:#x} must be halfword aligned", offset, data.len());
        return Err(Error::InvalidAlignment);
    }
    if !bank.contains(offset, data.len() as u32) {
        return Err(Error::InvalidRange);
    }
    if data.is_empty() {
        return Ok(());
    }

    let regs = *bank.regs();
    unlock::unlock(target, &regs).await?;
    regs::wait_status_busy(target, &regs, timeout::COMMAND).await?;

    let address = bank.base() + offset;
    match write_streamed(target, &regs, data, address).await {
        Ok(()) => Ok(()),
        Err(Error::ResourceUnavailable) => {
            log::warn!("falling back to slow memory writes");
            write_halfwords(target, &regs, data, address).await
        }
        Err(err) => Err(err),
    }
}

/// Stream `data` to the resident routine through a RAM ring buffer
///
/// Reserves three working areas (routine code, ring buffer, stack);
/// failure to get any of them releases what was taken and reports
/// [`Error::ResourceUnavailable`] so the caller can fall back.
#[maybe_async]
async fn write_streamed<T: DebugTarget + ?Sized>(
    target: &mut T,
    regs: &RegisterMap,
    data: &[u8],
    address: u32,
) -> Result<()> {
    let code = match target.alloc_working_area(LOADER_CODE.len() as u32).await? {
        Some(area) => area,
        None => {
            log::warn!("no working area for the write routine");
            return Err(Error::ResourceUnavailable);
        }
    };

    // As much ring as the data needs, capped by what is left after the
    // stack reservation; the floor guards the available scratch, not the
    // request size
    let avail = target.working_area_avail().saturating_sub(STACK_SIZE);
    if avail < MIN_BUFFER_SIZE {
        log::warn!("not enough working area for the ring buffer");
        target.free_working_area(code).await?;
        return Err(Error::ResourceUnavailable);
    }
    let buffer_size = ((data.len() as u32 + HEADER_SIZE).min(avail) & !3).max(HEADER_SIZE + 4);
    let buffer = match target.alloc_working_area(buffer_size).await? {
        Some(area) => area,
        None => {
            log::warn!("no working area for the ring buffer");
            target.free_working_area(code).await?;
            return Err(Error::ResourceUnavailable);
        }
    };

    let stack = match target.alloc_working_area(STACK_SIZE).await? {
        Some(area) => area,
        None => {
            log::warn!("no working area for the routine stack");
            target.free_working_area(buffer).await?;
            target.free_working_area(code).await?;
            return Err(Error::ResourceUnavailable);
        }
    };

    let result = stream_data(target, regs, data, address, code, buffer, buffer_size, stack).await;

    target.free_working_area(stack).await?;
    target.free_working_area(buffer).await?;
    target.free_working_area(code).await?;

    result
}

/// Run the resident routine and keep its ring buffer fed
#[maybe_async]
#[allow(clippy::too_many_arguments)]
async fn stream_data<T: DebugTarget + ?Sized>(
    target: &mut T,
    regs: &RegisterMap,
    data: &[u8],
    address: u32,
    code: WorkingArea,
    buffer: WorkingArea,
    buffer_size: u32,
    stack: WorkingArea,
) -> Result<()> {
    let halfwords = data.len() as u32 / 2;
    let buf_start = buffer.address;
    let buf_end = buf_start + buffer_size;
    let data_start = buf_start + HEADER_SIZE;

    target.write_mem(code.address, LOADER_CODE).await?;

    let header = StreamHeader::primed(buf_start);
    target.write_mem(buf_start, header.as_bytes()).await?;

    // The halfword count rides in a stack slot below the aligned stack
    // top; sp points at it when the routine starts
    let stack_top = stack.end() & !7;
    let sp = stack_top - 4;
    target.write_u32(sp, halfwords).await?;

    let params = LoaderParams {
        reg_base: regs.base(),
        buffer_start: buf_start,
        buffer_end: buf_end,
        dest: address,
        halfwords,
        sp,
    };
    target.start_write_loader(code.address, &params).await?;

    // Producer loop: the routine owns the read pointer, we own the write
    // pointer. A zeroed read pointer is its fault signal.
    let mut wp = data_start;
    let mut sent = 0usize;
    let mut stalled = 0u32;
    while sent < data.len() {
        let rp = target.read_u32(buf_start + 4).await?;
        if rp == 0 {
            log::error!("write routine reported a fault");
            let r0 = drain_loader(target, halfwords).await?;
            // Picks up and clears WRPRTERR when the fault was a
            // protection error
            regs::wait_status_busy(target, regs, timeout::COMMAND).await?;
            return Err(fault_error(r0));
        }

        let remaining = (data.len() - sent) as u32;
        let free = ring_free_contiguous(wp, rp, data_start, buf_end);
        let chunk = free.min(remaining);
        if chunk == 0 {
            // Ring full; the routine has to drain it before more fits
            stalled += 1;
            if stalled > timeout::ERASE {
                log::error!("write routine stopped consuming data");
                return Err(Error::BusyTimeout);
            }
            target.delay_ms(1).await;
            continue;
        }
        stalled = 0;

        target.write_mem(wp, &data[sent..sent + chunk as usize]).await?;
        wp = ring_advance(wp, chunk, data_start, buf_end);
        target.write_u32(buf_start, wp).await?;
        sent += chunk as usize;
        log::trace!("streamed {}/{} bytes", sent, data.len());
    }

    // All data queued: raise the termination sentinel and let the routine
    // drain the ring
    target.write_u32(buf_start, 0).await?;
    let r0 = drain_loader(target, halfwords).await?;

    // r0: register base on clean completion, zero after a sentinel exit,
    // anything else is the raw status of a fault
    if r0 != 0 && r0 != regs.base() {
        log::error!("write routine faulted, status {:#010x}", r0);
        regs::wait_status_busy(target, regs, timeout::COMMAND).await?;
        return Err(fault_error(r0));
    }

    regs::wait_status_busy(target, regs, timeout::COMMAND).await
}

/// Poll the routine to its breakpoint and return its final r0
#[maybe_async]
async fn drain_loader<T: DebugTarget + ?Sized>(target: &mut T, halfwords: u32) -> Result<u32> {
    // Scale the budget with the job: one write budget per page plus slack
    let mut rounds = halfwords.div_ceil(PAGE_HALFWORDS).max(1) * timeout::WRITE + timeout::COMMAND;
    loop {
        match target.poll_loader().await? {
            LoaderPoll::Finished { r0 } => return Ok(r0),
            LoaderPoll::Running => {
                if rounds == 0 {
                    log::error!("timed out waiting for the write routine");
                    return Err(Error::BusyTimeout);
                }
                rounds -= 1;
                target.delay_ms(1).await;
            }
        }
    }
}

/// Program halfword by halfword over the debug link
#[maybe_async]
async fn write_halfwords<T: DebugTarget + ?Sized>(
    target: &mut T,
    regs: &RegisterMap,
    data: &[u8],
    address: u32,
) -> Result<()> {
    let ctrl = regs::read_control(target, regs).await?;
    regs::write_control(target, regs, ctrl | Control::PG).await?;

    for (i, half) in data.chunks_exact(2).enumerate() {
        let value = u16::from_le_bytes([half[0], half[1]]);
        target.write_u16(address + 2 * i as u32, value).await?;
        regs::wait_status_busy(target, regs, timeout::WRITE).await?;
    }

    let ctrl = regs::read_control(target, regs).await?;
    regs::write_control(target, regs, ctrl & !Control::PG).await?;
    regs::wait_status_busy(target, regs, timeout::COMMAND).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_status_maps_to_error_kind() {
        let wrprterr = Status::WRPRTERR.bits();
        assert_eq!(fault_error(wrprterr), Error::ProtectionViolation);
        assert_eq!(
            fault_error(wrprterr | Status::BSY.bits()),
            Error::ProtectionViolation
        );
        // A routine that ran out of spins leaves a busy status behind
        assert_eq!(fault_error(Status::BSY.bits()), Error::BusyTimeout);
        assert_eq!(fault_error(Status::WRBSY.bits()), Error::BusyTimeout);
    }
}
