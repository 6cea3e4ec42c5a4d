//! Synchronization primitives for cores that can only reach shared memory through block transfers.
//!
//! This crate bundles the workspace:
//! - [`logging`]: the logger used by all other crates, installing one is optional
//! - [`mem`]: the shared region, block transfers and the reservation slot of each unit
//! - [`sync`]: the primitives built on top of it
//!
//! ```
//! use cellsync::prelude::*;
//!
//! let region = SharedRegion::new(16 * BLOCK_SIZE);
//! let queue = Resource::<LfQueue>::create(&region, QueueParams::new(4, 8)).unwrap();
//!
//! // Any unit can operate on the queue through its address
//! let unit = Unit::new(region.clone());
//! let remote = LfQueue::at(queue.address());
//! remote.enq(&unit, &42u64.to_le_bytes());
//!
//! let mut item = [0u8; 8];
//! queue.get().deq(queue.unit(), &mut item);
//! assert_eq!(u64::from_le_bytes(item), 42);
//! ```

pub use cellsync_logging as logging;
pub use cellsync_mem as mem;
pub use cellsync_sync as sync;

pub mod prelude;
