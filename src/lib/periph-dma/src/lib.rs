//! A scatter-gather DMA transfer engine for a memory-mapped peripheral.
//!
//! Data moves between the peripheral's register window and user memory along one of two DMA paths:
//!
//!  - the contiguous path, where user space aliases a pre-mapped internal buffer
//!    ([dma::MappedRegion]) and transfers name addresses inside that alias, and
//!  - the scatter-gather path, where an arbitrary user buffer is pinned and mapped for the device
//!    page by page ([dma::PinnedBuffer]) for the duration of one transfer.
//!
//! The hardware itself sits behind the traits in [hw]. [device::DmaDevice] ties a channel, the
//! internal buffer and the mode state together, and [sim] provides a software implementation of
//! the hardware boundary.

mod arch;
pub mod channel;
pub mod completion;
pub mod config;
pub mod control;
pub mod device;
pub mod dma;
pub mod error;
pub mod hw;
pub mod sim;
mod transfer;

pub use channel::{ChannelResource, DeviceResources};
pub use config::DriverConfig;
pub use device::{AddrMode, CpuCopyPath, DmaDevice, TransferMode};
pub use error::{Error, HwError, Result};
pub use transfer::TransferDescriptorBuilder;
