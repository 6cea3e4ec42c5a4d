use core::fmt;
use std::sync::Arc;
use cellsync_logging::{log_info, log_verbose, log_warning};
use cellsync_mem::{SharedAddress, SharedRegion, Unit};
use scopeguard::ScopeGuard;

use crate::{AtomicCell, Error, Result, LOG_CAT};

/// A synchronization primitive that can be placed in freshly allocated shared memory
pub trait Primitive : Copy {
    /// Value the primitive is initialized with
    type Init;

    /// Get the number of bytes the primitive needs, including any storage it owns.
    ///
    /// Returns [`Error::BadValue`] when `init` describes a primitive that can't be sized.
    fn storage_size(init: &Self::Init) -> Result<usize>;

    /// Initialize the primitive at `addr`, which points to at least [`Primitive::storage_size`] zeroed, block aligned bytes.
    fn create_at(unit: &Unit, addr: SharedAddress, init: Self::Init) -> Result<Self>;

    /// Get the address the primitive lives at
    fn address(&self) -> SharedAddress;
}

/// A reference-counted handle to a primitive in shared memory.
///
/// The count is kept in a separate [`AtomicCell`] in shared memory, so the handle can be cloned by any unit.
/// When the last handle is dropped, the storage of the primitive and its count are returned to the region.
///
/// Each handle owns its own [`Unit`], which is used for the reference count and available to operate on the primitive.
pub struct Resource<P: Primitive> {
    unit      : Unit,
    primitive : P,
    refcount  : AtomicCell,
    size      : usize,
}

impl<P: Primitive> Resource<P> {
    /// Allocate and initialize a new primitive in `region`, with a reference count of 1.
    ///
    /// Returns [`Error::OutOfMemory`] when the region has no room left, or the error of the primitive's initialization.
    /// In both cases, nothing stays allocated.
    pub fn create(region: &Arc<SharedRegion>, init: P::Init) -> Result<Self> {
        let unit = Unit::new(region.clone());

        let size = match P::storage_size(&init) {
            Ok(size) => size,
            Err(err) => {
                log_warning!(LOG_CAT, "Failed to size primitive: {}", err);
                return Err(err);
            }
        };
        let storage = region.alloc(size).ok_or(Error::OutOfMemory { size })?;
        let storage = scopeguard::guard(storage, |addr| region.free(addr, size));

        let count_addr = region.alloc(AtomicCell::SIZE).ok_or(Error::OutOfMemory { size: AtomicCell::SIZE })?;
        let count_addr = scopeguard::guard(count_addr, |addr| region.free(addr, AtomicCell::SIZE));

        let primitive = match P::create_at(&unit, *storage, init) {
            Ok(primitive) => primitive,
            Err(err) => {
                log_warning!(LOG_CAT, "Failed to create primitive at {}: {}", *storage, err);
                return Err(err);
            }
        };
        let refcount = AtomicCell::at(*count_addr);
        refcount.init(&unit, 1);

        let addr = ScopeGuard::into_inner(storage);
        ScopeGuard::into_inner(count_addr);
        log_verbose!(LOG_CAT, "Created primitive at {} ({} bytes)", addr, size);

        Ok(Self { unit, primitive, refcount, size })
    }

    /// Get the address of the primitive, to hand to other units
    #[inline]
    pub fn address(&self) -> SharedAddress {
        self.primitive.address()
    }

    /// Get a view on the primitive
    #[inline]
    pub fn get(&self) -> P {
        self.primitive
    }

    /// Get the unit owned by this handle
    #[inline]
    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    /// Get the current number of handles to the primitive
    #[inline]
    pub fn refcount(&self) -> i32 {
        self.refcount.get(&self.unit)
    }
}

impl<P: Primitive> Clone for Resource<P> {
    fn clone(&self) -> Self {
        self.refcount.inc(&self.unit);
        Self {
            unit: Unit::new(self.unit.region().clone()),
            primitive: self.primitive,
            refcount: self.refcount,
            size: self.size,
        }
    }

    fn clone_from(&mut self, source: &Self) {
        if self.refcount == source.refcount {
            return;
        }
        *self = source.clone();
    }
}

impl<P: Primitive> Drop for Resource<P> {
    fn drop(&mut self) {
        if self.refcount.dec(&self.unit) != 1 {
            return;
        }

        let addr = self.primitive.address();
        let region = self.unit.region();
        region.free(addr, self.size);
        region.free(self.refcount.address(), AtomicCell::SIZE);
        log_info!(LOG_CAT, "Destroyed primitive at {} ({} bytes)", addr, self.size);
    }
}

impl<P: Primitive + fmt::Debug> fmt::Debug for Resource<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("primitive", &self.primitive)
            .field("refcount", &self.refcount.address())
            .field("size", &self.size)
            .finish()
    }
}
