//! wchflash-core - Flash programming engine for WCH CH32F2x targets
//!
//! This crate drives the on-chip flash controller of a CH32F2x through a
//! debug probe while the target CPU is halted. It is generic over the
//! [`target::DebugTarget`] trait, so any probe backend (or the emulator in
//! `wchflash-dummy`) can host it, and is `no_std` with no allocation.
//!
//! # Features
//!
//! - `std` - Enable standard library support (std::error::Error impls)
//! - `is_sync` - Compile the async engine as synchronous code
//!
//! # Example
//!
//! ```ignore
//! use wchflash_core::{bank::FlashBank, erase, target::DebugTarget};
//!
//! fn wipe_app<T: DebugTarget>(target: &mut T) -> wchflash_core::Result<()> {
//!     let mut bank = FlashBank::new(Default::default());
//!     bank.auto_probe(target)?;
//!     // everything except the first 16 KiB
//!     erase::erase(target, &bank, 64, bank.num_sectors() - 1)
//! }
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
// Allow async fn in traits - we use maybe-async for dual sync/async support
#![allow(async_fn_in_trait)]

#[cfg(feature = "std")]
extern crate std;

pub mod bank;
pub mod erase;
pub mod error;
pub mod loader;
pub mod options;
pub mod regs;
pub mod target;
pub mod unlock;
pub mod write;

pub use error::{Error, Result};
