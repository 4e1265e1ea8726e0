use parking_lot::Mutex;

use crate::error::{Error, Result};

use super::{BusAddr, PageFrame, PhysRange, UserAddr, DMA_PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// A request from user space to alias part of the internal buffer.
pub struct MapRequest {
    /// Where the mapping starts in the user address space.
    pub start: UserAddr,
    /// Length of the mapping in bytes.
    pub len: usize,
    /// Byte offset into the internal buffer. Must be page aligned.
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// What the caller has to install in the user address space to complete a mapping: `len` bytes of
/// physically contiguous frames starting at `pfn`.
pub struct MappingGrant {
    pub pfn: PageFrame,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The active user alias of the internal buffer.
pub struct UserMapping {
    pub start: UserAddr,
    pub len: usize,
    pub offset: usize,
}

/// The internal buffer: physically contiguous, mapped once for the device at attach, and aliased
/// into user space by at most one mapping at a time.
#[derive(Debug)]
pub struct MappedRegion {
    phys: PhysRange,
    bus: BusAddr,
    mapping: Mutex<Option<UserMapping>>,
}

impl MappedRegion {
    pub fn new(phys: PhysRange, bus: BusAddr) -> Self {
        Self {
            phys,
            bus,
            mapping: Mutex::new(None),
        }
    }

    /// Size of the buffer in bytes.
    pub fn size(&self) -> usize {
        self.phys.len
    }

    pub fn phys(&self) -> PhysRange {
        self.phys
    }

    pub fn bus(&self) -> BusAddr {
        self.bus
    }

    pub fn mapping(&self) -> Option<UserMapping> {
        *self.mapping.lock()
    }

    /// Validate a mapping request against the buffer and make it the active mapping, replacing any
    /// previous one.
    pub fn establish(&self, req: MapRequest) -> Result<MappingGrant> {
        let size = self.size();
        if req.offset >= size || req.len == 0 || req.len > size - req.offset {
            tracing::error!(
                "mapping request out of range: offset {:#x}, len {:#x}, buffer size {:#x}",
                req.offset,
                req.len,
                size
            );
            return Err(Error::InvalidAddress);
        }
        if req.offset % DMA_PAGE_SIZE != 0 || req.start.checked_add(req.len).is_none() {
            tracing::error!(
                "bad mapping request at {} (offset {:#x})",
                req.start,
                req.offset
            );
            return Err(Error::InvalidAddress);
        }

        let mapping = UserMapping {
            start: req.start,
            len: req.len,
            offset: req.offset,
        };
        if let Some(old) = self.mapping.lock().replace(mapping) {
            tracing::debug!("replacing user mapping at {}", old.start);
        }
        tracing::debug!(
            "mapped {:#x} bytes of the internal buffer at {}",
            req.len,
            req.start
        );
        Ok(MappingGrant {
            pfn: self.phys.start.offset(req.offset).frame(),
            len: req.len,
        })
    }

    /// Drop the active mapping if it starts at `start`. Returns whether a mapping was dropped.
    pub fn release(&self, start: UserAddr) -> bool {
        let mut mapping = self.mapping.lock();
        match *mapping {
            Some(m) if m.start == start => {
                *mapping = None;
                true
            }
            _ => false,
        }
    }

    /// Resolve `len` bytes at `addr` to a bus address. The whole range has to lie within the active
    /// mapping.
    pub fn translate(&self, addr: UserAddr, len: usize) -> Option<BusAddr> {
        let mapping = (*self.mapping.lock())?;
        let end = addr.checked_add(len)?;
        let map_end = mapping.start.checked_add(mapping.len)?;
        if addr < mapping.start || addr >= map_end || end > map_end {
            return None;
        }
        let delta = (addr.0 - mapping.start.0) as u64;
        Some(self.bus.offset(mapping.offset as u64 + delta))
    }
}
