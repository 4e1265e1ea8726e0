//! Transfer orchestration. Both DMA paths share [TransferDescriptorBuilder] for channel
//! configuration and descriptor preparation and differ only in where the memory-side segment list
//! comes from: a single translated range inside the internal buffer, or the segments of a
//! [PinnedBuffer].

use crate::{
    channel::{ChannelResource, TransferParams},
    dma::{BusAddr, MappedRegion, PinnedBuffer, SgEntry, SyncMode, UserAddr},
    error::{Error, Result},
    hw::{Descriptor, DmaChannel, PrepFlags, SlaveConfig, TransferDirection, UserMemory},
};

/// Configures a channel for one transfer and prepares its descriptor.
pub struct TransferDescriptorBuilder<'a> {
    channel: &'a dyn DmaChannel,
    config: SlaveConfig,
}

impl<'a> TransferDescriptorBuilder<'a> {
    /// `device_addr` is the bus address of the peripheral side. Reads burst by `device_burst` on
    /// the source and `memory_burst` on the destination, writes the other way round.
    pub fn new(
        channel: &'a dyn DmaChannel,
        params: &TransferParams,
        direction: TransferDirection,
        device_addr: BusAddr,
        device_addr_fixed: bool,
    ) -> Self {
        let mut config = SlaveConfig {
            direction,
            src_addr: Default::default(),
            dst_addr: Default::default(),
            src_width: params.bus_width,
            dst_width: params.bus_width,
            src_maxburst: params.device_burst,
            dst_maxburst: params.memory_burst,
            device_addr_fixed,
        };
        match direction {
            TransferDirection::DeviceToMemory => config.src_addr = device_addr,
            TransferDirection::MemoryToDevice => {
                config.dst_addr = device_addr;
                config.src_maxburst = params.memory_burst;
                config.dst_maxburst = params.device_burst;
            }
        }
        Self { channel, config }
    }

    pub fn slave_config(&self) -> &SlaveConfig {
        &self.config
    }

    /// Apply the slave configuration and prepare a descriptor for `sgl`. Nothing is submitted.
    pub fn build(&self, sgl: &[SgEntry]) -> Result<Descriptor> {
        let direction = self.config.direction;
        self.channel.configure(&self.config).map_err(|e| {
            tracing::error!("failed to configure channel for {}: {}", direction, e);
            Error::HardwareConfigRejected
        })?;
        let mut desc = self
            .channel
            .prep_slave_sg(sgl, direction, PrepFlags::INTERRUPT)
            .map_err(|e| {
                tracing::error!(
                    "failed to prepare {} descriptor with {} segments: {}",
                    direction,
                    sgl.len(),
                    e
                );
                Error::DescriptorBuildFailed
            })?;
        self.channel.fixup_descriptor(&mut desc);
        Ok(desc)
    }
}

impl ChannelResource {
    fn builder<'a>(
        &self,
        channel: &'a dyn DmaChannel,
        direction: TransferDirection,
        offset: usize,
        device_addr_fixed: bool,
    ) -> Result<TransferDescriptorBuilder<'a>> {
        if offset >= self.regs().len {
            tracing::error!(
                "peripheral offset {:#x} outside register window of {:#x} bytes",
                offset,
                self.regs().len
            );
            return Err(Error::InvalidAddress);
        }
        Ok(TransferDescriptorBuilder::new(
            channel,
            self.params(),
            direction,
            self.regs_bus().offset(offset as u64),
            device_addr_fixed,
        ))
    }

    /// Move `len` bytes from the peripheral at `offset` into the internal buffer, addressed through
    /// its user alias at `dst`.
    pub fn read_contiguous(
        &self,
        region: &MappedRegion,
        offset: usize,
        dst: UserAddr,
        len: usize,
        device_addr_fixed: bool,
    ) -> Result<usize> {
        self.contiguous(
            TransferDirection::DeviceToMemory,
            region,
            offset,
            dst,
            len,
            device_addr_fixed,
        )
    }

    /// Move `len` bytes from the internal buffer, addressed through its user alias at `src`, to the
    /// peripheral at `offset`.
    pub fn write_contiguous(
        &self,
        region: &MappedRegion,
        offset: usize,
        src: UserAddr,
        len: usize,
        device_addr_fixed: bool,
    ) -> Result<usize> {
        self.contiguous(
            TransferDirection::MemoryToDevice,
            region,
            offset,
            src,
            len,
            device_addr_fixed,
        )
    }

    fn contiguous(
        &self,
        direction: TransferDirection,
        region: &MappedRegion,
        offset: usize,
        addr: UserAddr,
        len: usize,
        device_addr_fixed: bool,
    ) -> Result<usize> {
        if len == 0 {
            return Ok(0);
        }
        let mut gate = self.begin();
        let access = direction.access();

        let (bus, cookie) = {
            let channel = self.hold()?;
            let builder = self.builder(&*channel, direction, offset, device_addr_fixed)?;
            let bus = region.translate(addr, len).ok_or_else(|| {
                tracing::error!(
                    "{} bytes at {} are not inside the internal buffer mapping",
                    len,
                    addr
                );
                Error::InvalidAddress
            })?;
            let desc = builder.build(&[SgEntry::new(bus, len)])?;
            if direction == TransferDirection::MemoryToDevice {
                self.mapper().sync(bus, len, access, SyncMode::ForDevice);
            }
            (bus, self.submit(&*channel, desc, &mut gate)?)
        };

        self.wait(&gate, cookie)?;
        if direction == TransferDirection::DeviceToMemory {
            self.mapper().sync(bus, len, access, SyncMode::ForCpu);
        }
        tracing::debug!("{} of {} bytes through {} done", direction, len, bus);
        Ok(len)
    }

    /// Move `len` bytes from the peripheral at `offset` into an arbitrary user buffer at `dst`,
    /// pinning it for the duration of the transfer.
    pub fn read_scatter(
        &self,
        memory: &dyn UserMemory,
        offset: usize,
        dst: UserAddr,
        len: usize,
        device_addr_fixed: bool,
    ) -> Result<usize> {
        self.scatter(
            TransferDirection::DeviceToMemory,
            memory,
            offset,
            dst,
            len,
            device_addr_fixed,
        )
    }

    /// Move `len` bytes from an arbitrary user buffer at `src` to the peripheral at `offset`,
    /// pinning it for the duration of the transfer.
    pub fn write_scatter(
        &self,
        memory: &dyn UserMemory,
        offset: usize,
        src: UserAddr,
        len: usize,
        device_addr_fixed: bool,
    ) -> Result<usize> {
        self.scatter(
            TransferDirection::MemoryToDevice,
            memory,
            offset,
            src,
            len,
            device_addr_fixed,
        )
    }

    fn scatter(
        &self,
        direction: TransferDirection,
        memory: &dyn UserMemory,
        offset: usize,
        addr: UserAddr,
        len: usize,
        device_addr_fixed: bool,
    ) -> Result<usize> {
        if len == 0 {
            return Ok(0);
        }
        let mut gate = self.begin();

        let (buffer, cookie) = {
            let channel = self.hold()?;
            let builder = self.builder(&*channel, direction, offset, device_addr_fixed)?;
            let buffer = PinnedBuffer::pin(memory, self.mapper(), addr, len, direction.access())?;
            tracing::debug!(
                "{} of {} bytes at {} in {} segments",
                direction,
                len,
                addr,
                buffer.segments().len()
            );
            let desc = builder.build(&buffer.sg_list())?;
            if direction == TransferDirection::MemoryToDevice {
                buffer.sync(SyncMode::ForDevice);
            }
            let cookie = self.submit(&*channel, desc, &mut gate)?;
            (buffer, cookie)
        };

        self.wait(&gate, cookie)?;
        if direction == TransferDirection::DeviceToMemory {
            buffer.sync(SyncMode::ForCpu);
        }
        drop(buffer);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DriverConfig,
        dma::DMA_PAGE_SIZE,
        hw::{BusWidth, DmaCaps, DmaController},
        sim::{ChannelFaults, HwEvent, SimPlatform},
    };

    fn params() -> TransferParams {
        TransferParams {
            bus_width: BusWidth::Four,
            device_burst: 8,
            memory_burst: 16,
        }
    }

    #[test]
    fn read_config_bursts() {
        let plat = SimPlatform::new(&DriverConfig::default());
        let chan = plat
            .controller
            .request_channel("rxtx", DmaCaps::SLAVE)
            .unwrap();
        let b = TransferDescriptorBuilder::new(
            chan.as_ref(),
            &params(),
            TransferDirection::DeviceToMemory,
            BusAddr(0x4000),
            true,
        );
        let c = b.slave_config();
        assert_eq!(c.src_addr, BusAddr(0x4000));
        assert_eq!(c.dst_addr, BusAddr(0));
        assert_eq!(c.src_maxburst, 8);
        assert_eq!(c.dst_maxburst, 16);
        assert_eq!(c.src_width, BusWidth::Four);
        assert!(c.device_addr_fixed);
    }

    #[test]
    fn write_config_bursts() {
        let plat = SimPlatform::new(&DriverConfig::default());
        let chan = plat
            .controller
            .request_channel("rxtx", DmaCaps::SLAVE)
            .unwrap();
        let b = TransferDescriptorBuilder::new(
            chan.as_ref(),
            &params(),
            TransferDirection::MemoryToDevice,
            BusAddr(0x4000),
            false,
        );
        let c = b.slave_config();
        assert_eq!(c.dst_addr, BusAddr(0x4000));
        assert_eq!(c.src_addr, BusAddr(0));
        assert_eq!(c.src_maxburst, 16);
        assert_eq!(c.dst_maxburst, 8);
        assert!(!c.device_addr_fixed);
    }

    #[test]
    fn build_prepares_all_segments() {
        let plat = SimPlatform::new(&DriverConfig::default());
        let chan = plat
            .controller
            .request_channel("rxtx", DmaCaps::SLAVE)
            .unwrap();
        let b = TransferDescriptorBuilder::new(
            chan.as_ref(),
            &params(),
            TransferDirection::DeviceToMemory,
            BusAddr(0x4000),
            true,
        );
        let sgl = [
            SgEntry::new(BusAddr(0x10000), 100),
            SgEntry::new(BusAddr(0x20000), DMA_PAGE_SIZE),
        ];
        let desc = b.build(&sgl).unwrap();
        assert_eq!(desc.segments, sgl);
        assert_eq!(desc.flags, PrepFlags::INTERRUPT);
        assert!(plat.events.contains(&HwEvent::Configure(*b.slave_config())));
    }

    #[test]
    fn build_fails_on_configure() {
        let plat = SimPlatform::new(&DriverConfig::default());
        let chan = plat
            .controller
            .request_channel("rxtx", DmaCaps::SLAVE)
            .unwrap();
        plat.controller.set_faults(ChannelFaults {
            fail_configure: true,
            ..Default::default()
        });
        let b = TransferDescriptorBuilder::new(
            chan.as_ref(),
            &params(),
            TransferDirection::DeviceToMemory,
            BusAddr(0x4000),
            true,
        );
        assert_eq!(
            b.build(&[SgEntry::new(BusAddr(0x10000), 4)]).unwrap_err(),
            Error::HardwareConfigRejected
        );
        assert!(!plat
            .events
            .snapshot()
            .iter()
            .any(|e| matches!(e, HwEvent::Prep { .. })));
    }

    #[test]
    fn build_fails_on_prep() {
        let plat = SimPlatform::new(&DriverConfig::default());
        let chan = plat
            .controller
            .request_channel("rxtx", DmaCaps::SLAVE)
            .unwrap();
        plat.controller.set_faults(ChannelFaults {
            fail_prep: true,
            ..Default::default()
        });
        let b = TransferDescriptorBuilder::new(
            chan.as_ref(),
            &params(),
            TransferDirection::MemoryToDevice,
            BusAddr(0x4000),
            false,
        );
        assert_eq!(
            b.build(&[SgEntry::new(BusAddr(0x10000), 4)]).unwrap_err(),
            Error::DescriptorBuildFailed
        );
    }
}
