//! The per-device context that the character-device glue talks to.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    channel::{ChannelResource, DeviceResources},
    config::DriverConfig,
    dma::{MapRequest, MappedRegion, MappingGrant, UserAddr},
    error::{Error, Result},
    hw::UserMemory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u32)]
/// Which path reads and writes take.
pub enum TransferMode {
    /// Programmed I/O through the CPU. Needs a [CpuCopyPath].
    CpuCopy = 0,
    /// DMA into the internal buffer, which user space reaches through a mapping.
    #[default]
    Contiguous = 1,
    /// DMA directly into pinned user pages.
    ScatterGather = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
/// How the peripheral side is addressed.
pub enum AddrMode {
    /// The peripheral address advances with every beat. Only offset zero is accepted.
    Incrementing = 0,
    /// The peripheral is a FIFO register: every beat hits the same address.
    #[default]
    Fifo = 1,
}

impl TryFrom<u64> for TransferMode {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self> {
        Ok(match value {
            0 => TransferMode::CpuCopy,
            1 => TransferMode::Contiguous,
            2 => TransferMode::ScatterGather,
            _ => return Err(Error::UnsupportedMode),
        })
    }
}

impl TryFrom<u64> for AddrMode {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self> {
        Ok(match value {
            0 => AddrMode::Incrementing,
            1 => AddrMode::Fifo,
            _ => return Err(Error::UnsupportedMode),
        })
    }
}

/// The CPU-copy transfer strategy. Lives outside this crate; [DmaDevice] only dispatches to it.
pub trait CpuCopyPath: Send + Sync {
    fn read(&self, offset: usize, dst: UserAddr, len: usize, addr_mode: AddrMode) -> Result<usize>;

    fn write(&self, offset: usize, src: UserAddr, len: usize, addr_mode: AddrMode)
        -> Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Modes {
    transfer: TransferMode,
    addr: AddrMode,
}

/// A DMA-capable peripheral bound to one channel.
pub struct DmaDevice {
    channel: Arc<ChannelResource>,
    region: MappedRegion,
    memory: Arc<dyn UserMemory>,
    modes: Mutex<Modes>,
    cpu_copy: Option<Box<dyn CpuCopyPath>>,
}

impl DmaDevice {
    pub fn attach(
        res: &DeviceResources,
        memory: Arc<dyn UserMemory>,
        config: &DriverConfig,
    ) -> Result<Self> {
        let channel = ChannelResource::attach(res, config)?;
        let region = MappedRegion::new(channel.iobuf(), channel.iobuf_bus());
        Ok(Self {
            channel: Arc::new(channel),
            region,
            memory,
            modes: Mutex::new(Modes {
                transfer: config.mode,
                addr: config.addr_mode,
            }),
            cpu_copy: None,
        })
    }

    /// Install the strategy used in [TransferMode::CpuCopy].
    pub fn with_cpu_copy(mut self, path: Box<dyn CpuCopyPath>) -> Self {
        self.cpu_copy = Some(path);
        self
    }

    pub fn detach(&self) {
        self.channel.detach();
    }

    pub fn channel(&self) -> &Arc<ChannelResource> {
        &self.channel
    }

    pub fn region(&self) -> &MappedRegion {
        &self.region
    }

    pub fn mode(&self) -> TransferMode {
        self.modes.lock().transfer
    }

    pub fn set_mode(&self, mode: TransferMode) {
        tracing::debug!("transfer mode {:?}", mode);
        self.modes.lock().transfer = mode;
    }

    pub fn addr_mode(&self) -> AddrMode {
        self.modes.lock().addr
    }

    pub fn set_addr_mode(&self, mode: AddrMode) {
        tracing::debug!("address mode {:?}", mode);
        self.modes.lock().addr = mode;
    }

    /// Alias part of the internal buffer into user space. The caller installs the returned frames
    /// at `req.start`.
    pub fn establish_mapping(&self, req: MapRequest) -> Result<MappingGrant> {
        self.region.establish(req)
    }

    /// Forget the mapping at `start` once user space has unmapped it.
    pub fn release_mapping(&self, start: UserAddr) -> bool {
        self.region.release(start)
    }

    fn check_offset(&self, offset: usize, addr_mode: AddrMode) -> Result<()> {
        if addr_mode == AddrMode::Incrementing && offset != 0 {
            tracing::error!("offset {:#x} not supported with incrementing addresses", offset);
            return Err(Error::InvalidAddress);
        }
        if offset >= self.channel.regs().len {
            tracing::error!("offset {:#x} outside register window", offset);
            return Err(Error::InvalidAddress);
        }
        Ok(())
    }

    /// Read `len` bytes from the peripheral at `offset` into `dst` using the current mode.
    pub fn read(&self, offset: usize, dst: UserAddr, len: usize) -> Result<usize> {
        let modes = *self.modes.lock();
        tracing::debug!("read {:?}, len = {}", modes.transfer, len);
        self.check_offset(offset, modes.addr)?;
        let fifo = modes.addr == AddrMode::Fifo;
        match modes.transfer {
            TransferMode::CpuCopy => self.cpu_copy()?.read(offset, dst, len, modes.addr),
            TransferMode::Contiguous => self
                .channel
                .read_contiguous(&self.region, offset, dst, len, fifo),
            TransferMode::ScatterGather => {
                self.channel
                    .read_scatter(self.memory.as_ref(), offset, dst, len, fifo)
            }
        }
    }

    /// Write `len` bytes from `src` to the peripheral at `offset` using the current mode.
    pub fn write(&self, offset: usize, src: UserAddr, len: usize) -> Result<usize> {
        let modes = *self.modes.lock();
        tracing::debug!("write {:?}, len = {}", modes.transfer, len);
        self.check_offset(offset, modes.addr)?;
        let fifo = modes.addr == AddrMode::Fifo;
        match modes.transfer {
            TransferMode::CpuCopy => self.cpu_copy()?.write(offset, src, len, modes.addr),
            TransferMode::Contiguous => self
                .channel
                .write_contiguous(&self.region, offset, src, len, fifo),
            TransferMode::ScatterGather => {
                self.channel
                    .write_scatter(self.memory.as_ref(), offset, src, len, fifo)
            }
        }
    }

    fn cpu_copy(&self) -> Result<&dyn CpuCopyPath> {
        self.cpu_copy.as_deref().ok_or_else(|| {
            tracing::error!("no CPU copy path installed");
            Error::UnsupportedMode
        })
    }
}

impl std::fmt::Debug for DmaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaDevice")
            .field("channel", &self.channel)
            .field("region", &self.region)
            .field("modes", &*self.modes.lock())
            .field("cpu_copy", &self.cpu_copy.is_some())
            .finish()
    }
}
