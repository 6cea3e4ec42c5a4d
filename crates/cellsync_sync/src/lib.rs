//! Synchronization primitives living in a shared region that is only reachable through block transfers.
//!
//! Every primitive is a small `Copy` view on a [`SharedAddress`], its operations take the [`Unit`](cellsync_mem::Unit) performing them.
//! All state changes go through the unit's single reservation: a block is reserved, modified locally and conditionally written back,
//! retrying whenever another unit wrote the block in between.
//!
//! - [`AtomicCell`]: 32-bit integer with atomic read-modify-write operations
//! - [`RemoteMutex`]: binary lock
//! - [`Semaphore`]: counting semaphore
//! - [`Barrier`]: single-use rendezvous barrier
//! - [`Condvar`]: condition variable, usable with any [`RemoteLock`]
//! - [`Queue`]: bounded lock-protected queue
//! - [`LfQueue`]: bounded queue driven by a reserved counter pair
//! - [`Resource`]: reference-counted handle that allocates, initializes and frees a primitive

use cellsync_logging::LogCategory;

mod atomic;
mod barrier;
mod condvar;
mod error;
mod handle;
mod lfqueue;
mod mutex;
mod queue;
mod semaphore;

pub use cellsync_mem::SharedAddress;

pub use atomic::AtomicCell;
pub use barrier::Barrier;
pub use condvar::Condvar;
pub use error::{Error, Result};
pub use handle::{Primitive, Resource};
pub use lfqueue::LfQueue;
pub use mutex::{RemoteLock, RemoteMutex, RemoteMutexGuard};
pub use queue::{Queue, QueueParams};
pub use semaphore::Semaphore;

pub const LOG_CAT : LogCategory = LogCategory::new("Sync");
