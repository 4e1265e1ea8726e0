//! Module for the two ways a transfer reaches memory: the single pre-mapped internal buffer that user
//! space aliases through a memory mapping ([MappedRegion]), and arbitrary user buffers that are
//! pinned page-by-page and mapped for the device segment-by-segment ([PinnedBuffer]). Both hand the
//! transfer core a list of [SgEntry] values that the channel can consume.

mod pin;
mod region;

use std::fmt;

pub use pin::{page_span, segment_layout, PageSpan, PinnedBuffer, ScatterSegment};
pub use region::{MapRequest, MappedRegion, MappingGrant, UserMapping};

pub use super::arch::DMA_PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash)]
/// Intended access direction for DMA memory.
pub enum Access {
    /// The memory is used for the host to write and the device to read.
    HostToDevice,
    /// The memory is used for the host to read and the device to write.
    DeviceToHost,
    /// The memory is accessed read/write by both device and host.
    BiDirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash)]
/// Mode of syncing to apply to a device-mapped range.
pub enum SyncMode {
    /// Make CPU writes visible to the device. Issued before the device reads the memory.
    ForDevice,
    /// Make device writes visible to the CPU. Issued after the device wrote the memory.
    ForCpu,
}

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash, Default)]
/// A virtual address in the address space of the process that issued the transfer.
pub struct UserAddr(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash, Default)]
/// A CPU physical address.
pub struct PhysAddr(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash, Default)]
/// An address as seen by the DMA hardware. Not necessarily related to any CPU-visible address.
pub struct BusAddr(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash)]
/// Handle to one physical page frame, as returned by pinning.
pub struct PageFrame(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash)]
/// A range of physical memory handed to the driver by the platform at attach time.
pub struct PhysRange {
    pub start: PhysAddr,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// One device-addressable (address, length) pair of a scatter-gather list.
pub struct SgEntry {
    pub bus: BusAddr,
    pub len: usize,
}

impl UserAddr {
    pub fn checked_add(self, len: usize) -> Option<UserAddr> {
        self.0.checked_add(len).map(UserAddr)
    }
}

impl PhysAddr {
    pub fn frame(self) -> PageFrame {
        PageFrame(self.0 / DMA_PAGE_SIZE as u64)
    }

    pub fn offset(self, off: usize) -> PhysAddr {
        PhysAddr(self.0 + off as u64)
    }
}

impl PageFrame {
    pub fn phys(self) -> PhysAddr {
        PhysAddr(self.0 * DMA_PAGE_SIZE as u64)
    }
}

impl BusAddr {
    pub fn offset(self, off: u64) -> BusAddr {
        BusAddr(self.0 + off)
    }
}

impl PhysRange {
    pub fn new(start: PhysAddr, len: usize) -> Self {
        Self { start, len }
    }
}

impl SgEntry {
    pub fn new(bus: BusAddr, len: usize) -> Self {
        Self { bus, len }
    }
}

impl From<BusAddr> for u64 {
    fn from(b: BusAddr) -> Self {
        b.0
    }
}

impl From<PhysAddr> for u64 {
    fn from(p: PhysAddr) -> Self {
        p.0
    }
}

impl fmt::Display for UserAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus:{:#x}", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phys:{:#x}", self.0)
    }
}
