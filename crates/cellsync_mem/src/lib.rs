//! Shared memory substrate for the cellsync primitives.
//!
//! The target architecture has one physical memory region shared by a coordinator core and several accelerator cores.
//! The accelerator cores can't address that region: they move data between it and a small local buffer using block transfers,
//! and they have a single *reservation* slot to implement atomic read-modify-write on a 128-byte block:
//!
//! 1. load a block and reserve it
//! 2. modify the local copy
//! 3. write it back, on the condition that no other unit wrote the block in between
//!
//! When the condition fails, the unit retries, optionally after waiting for the "reservation lost" event.
//!
//! This crate provides that model on the host: [`SharedRegion`] is the shared memory, [`Unit`] is the transfer engine and reservation slot of a single core,
//! and [`Backoff`] is what a unit does while it waits.

mod address;
mod alloc;
mod backoff;
mod block;
mod config;
mod region;
mod reservation;
mod spin_wait;
mod unit;

use cellsync_logging::LogCategory;

pub use address::{BLOCK_SIZE, SharedAddress, round_to_blocks};
pub use backoff::{Backoff, EventWait, RandomDelay, SpinBackoff, CountingBackoff, DefaultBackoff, default_backoff};
pub use block::Block;
pub use config::{RegionConfig, BackoffConfig};
pub use region::SharedRegion;
pub use reservation::ReservationEvent;
pub use spin_wait::SpinWait;
pub use unit::{Unit, Step};

pub const LOG_CAT : LogCategory = LogCategory::new("Mem");
