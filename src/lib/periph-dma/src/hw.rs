//! The hardware boundary. The transfer core talks to the DMA controller, to the bus mapping layer
//! and to the user address space only through the traits in this module. A real driver implements
//! them on top of its platform bindings; [crate::sim] implements them in software.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    dma::{Access, BusAddr, PageFrame, PhysAddr, SgEntry, SyncMode, UserAddr},
    error::HwError,
};

bitflags::bitflags! {
    /// Capabilities a channel must provide to be handed out by [DmaController::request_channel].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DmaCaps : u32 {
        /// Transfers between memory and a peripheral with a fixed bus address.
        const SLAVE = 1;
        /// Memory to memory copies.
        const MEMCPY = 2;
    }
}

bitflags::bitflags! {
    /// Flags for descriptor preparation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PrepFlags : u32 {
        /// Raise a completion interrupt (and run the callback) when the descriptor finishes.
        const INTERRUPT = 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Direction of a slave transfer.
pub enum TransferDirection {
    DeviceToMemory,
    MemoryToDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The transfer type a descriptor is programmed with. Normally follows the direction; a binding may
/// rewrite it in [DmaChannel::fixup_descriptor].
pub enum TransferKind {
    DeviceToMemory,
    MemoryToDevice,
    MemoryToMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
/// Width of one bus beat.
pub enum BusWidth {
    One,
    Two,
    Four,
    Eight,
}

/// Per-transfer channel parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaveConfig {
    pub direction: TransferDirection,
    /// Peripheral address for device-to-memory transfers.
    pub src_addr: BusAddr,
    /// Peripheral address for memory-to-device transfers.
    pub dst_addr: BusAddr,
    pub src_width: BusWidth,
    pub dst_width: BusWidth,
    pub src_maxburst: u32,
    pub dst_maxburst: u32,
    /// The peripheral side is a FIFO register: its address does not advance.
    pub device_addr_fixed: bool,
}

/// A descriptor prepared by a channel. It is consumed by [DmaChannel::submit].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub id: u64,
    pub direction: TransferDirection,
    pub kind: TransferKind,
    pub segments: Vec<SgEntry>,
    pub flags: PrepFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Tracking cookie the channel assigns to an accepted descriptor.
pub struct Cookie(pub u64);

/// Invoked exactly once, from the channel's completion context, when a submitted descriptor
/// finishes. A channel that discards a descriptor without running it drops the callback instead.
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// A DMA controller that hands out channels.
pub trait DmaController: Send + Sync {
    /// Reserve a channel by name, which must provide all of `caps`.
    fn request_channel(&self, name: &str, caps: DmaCaps) -> Result<Arc<dyn DmaChannel>, HwError>;
}

/// One reserved hardware channel. Releasing the last reference releases the channel.
pub trait DmaChannel: Send + Sync {
    /// The mapping layer of the device that performs this channel's bus accesses.
    fn device(&self) -> Arc<dyn DeviceMapper>;

    /// Apply per-transfer parameters.
    fn configure(&self, config: &SlaveConfig) -> Result<(), HwError>;

    /// Build a descriptor covering every entry of `sgl`, in order.
    fn prep_slave_sg(
        &self,
        sgl: &[SgEntry],
        direction: TransferDirection,
        flags: PrepFlags,
    ) -> Result<Descriptor, HwError>;

    /// Hook for controller-binding quirks that have to patch a prepared descriptor. Not part of the
    /// transfer contract.
    fn fixup_descriptor(&self, _desc: &mut Descriptor) {}

    /// Queue a descriptor. It does not run until [DmaChannel::issue_pending].
    fn submit(&self, desc: Descriptor, callback: CompletionCallback) -> Result<Cookie, HwError>;

    /// Start executing queued descriptors.
    fn issue_pending(&self);

    /// Stop all activity on the channel and discard queued and running descriptors. Returns once
    /// the channel is quiescent.
    fn terminate_sync(&self);
}

/// Bus address mapping for the device that owns a channel.
pub trait DeviceMapper: Send + Sync {
    /// Restrict the bus addresses the device can generate.
    fn set_mask(&self, mask: u64) -> Result<(), HwError>;

    /// Map an MMIO resource (a peripheral register window).
    fn map_resource(&self, phys: PhysAddr, size: usize, access: Access)
        -> Result<BusAddr, HwError>;

    fn unmap_resource(&self, bus: BusAddr, size: usize, access: Access);

    /// Map a physically contiguous kernel buffer.
    fn map_single(&self, phys: PhysAddr, size: usize, access: Access) -> Result<BusAddr, HwError>;

    fn unmap_single(&self, bus: BusAddr, size: usize, access: Access);

    /// Map `len` bytes starting at `offset` within `page`.
    fn map_page(
        &self,
        page: PageFrame,
        offset: usize,
        len: usize,
        access: Access,
    ) -> Result<BusAddr, HwError>;

    fn unmap_page(&self, bus: BusAddr, len: usize, access: Access);

    /// Cache maintenance for a mapped range.
    fn sync(&self, bus: BusAddr, len: usize, access: Access, mode: SyncMode);
}

/// The address space of the process issuing transfers.
pub trait UserMemory: Send + Sync {
    /// Pin up to `nr_pages` pages starting at the page containing `start`, appending them to
    /// `pages`. May stop short of `nr_pages`. Every page appended is pinned and must be passed to
    /// [UserMemory::unpin_page] exactly once, even if an error is returned. Any address-space lock
    /// is held only for the duration of this call.
    fn pin_pages(
        &self,
        start: UserAddr,
        nr_pages: usize,
        write: bool,
        pages: &mut Vec<PageFrame>,
    ) -> Result<(), HwError>;

    fn unpin_page(&self, page: PageFrame);
}

impl TransferDirection {
    /// How the memory side of a transfer in this direction is accessed.
    pub fn access(&self) -> Access {
        match self {
            TransferDirection::DeviceToMemory => Access::DeviceToHost,
            TransferDirection::MemoryToDevice => Access::HostToDevice,
        }
    }
}

impl From<TransferDirection> for TransferKind {
    fn from(d: TransferDirection) -> Self {
        match d {
            TransferDirection::DeviceToMemory => TransferKind::DeviceToMemory,
            TransferDirection::MemoryToDevice => TransferKind::MemoryToDevice,
        }
    }
}

impl BusWidth {
    pub fn bytes(&self) -> usize {
        match self {
            BusWidth::One => 1,
            BusWidth::Two => 2,
            BusWidth::Four => 4,
            BusWidth::Eight => 8,
        }
    }
}

impl TryFrom<u32> for BusWidth {
    type Error = InvalidBusWidth;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => BusWidth::One,
            2 => BusWidth::Two,
            4 => BusWidth::Four,
            8 => BusWidth::Eight,
            _ => return Err(InvalidBusWidth(value)),
        })
    }
}

impl From<BusWidth> for u32 {
    fn from(w: BusWidth) -> Self {
        w.bytes() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("bus width must be 1, 2, 4 or 8 bytes, not {0}")]
pub struct InvalidBusWidth(pub u32);

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::DeviceToMemory => write!(f, "dev->mem"),
            TransferDirection::MemoryToDevice => write!(f, "mem->dev"),
        }
    }
}
