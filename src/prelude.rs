pub use cellsync_mem::{SharedAddress, SharedRegion, Unit, BLOCK_SIZE};

pub use cellsync_sync::{
    AtomicCell, Barrier, Condvar, LfQueue, Queue, QueueParams, RemoteLock, RemoteMutex, Resource, Semaphore, Primitive,
    Error, Result,
};
