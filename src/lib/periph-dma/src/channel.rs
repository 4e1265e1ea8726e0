//! The device-wide channel handle: the reserved hardware channel together with the bus mappings of
//! the peripheral register window and of the internal buffer.

use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, Mutex, MutexGuard, RwLock, RwLockReadGuard};

use crate::{
    completion::{CompletionGate, Outcome},
    config::DriverConfig,
    dma::{Access, BusAddr, PhysRange},
    error::{Error, Result},
    hw::{BusWidth, Cookie, Descriptor, DeviceMapper, DmaCaps, DmaChannel, DmaController},
};

/// What the platform hands the driver at attach.
#[derive(Clone)]
pub struct DeviceResources {
    pub controller: Arc<dyn DmaController>,
    /// The peripheral register window.
    pub regs: PhysRange,
    /// The physically contiguous internal buffer.
    pub iobuf: PhysRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Fixed per-device transfer parameters, taken from the configuration at attach.
pub struct TransferParams {
    pub bus_width: BusWidth,
    pub device_burst: u32,
    pub memory_burst: u32,
}

impl From<&DriverConfig> for TransferParams {
    fn from(config: &DriverConfig) -> Self {
        Self {
            bus_width: config.bus_width,
            device_burst: config.device_burst,
            memory_burst: config.memory_burst,
        }
    }
}

/// The reserved channel, borrowed for the part of a transfer that talks to it.
pub(crate) type ChannelGuard<'a> = MappedRwLockReadGuard<'a, dyn DmaChannel>;

/// The acquired hardware channel and the device bus mappings that go with it.
///
/// At most one transfer runs through a channel at a time: every transfer holds the completion slot
/// from start to finish, so a second caller blocks until the first one is done. The channel itself
/// is only borrowed while a transfer talks to it (configure, prepare, submit, issue), never during
/// the wait, so [ChannelResource::detach] can run while a transfer is blocked and will abort it.
pub struct ChannelResource {
    /// `None` once detached.
    channel: RwLock<Option<Arc<dyn DmaChannel>>>,
    mapper: Arc<dyn DeviceMapper>,
    regs: PhysRange,
    regs_bus: BusAddr,
    iobuf: PhysRange,
    iobuf_bus: BusAddr,
    params: TransferParams,
    slot: Mutex<CompletionGate>,
}

impl ChannelResource {
    /// Reserve a slave channel, map the register window and the internal buffer for its device and
    /// apply the configured address mask. A failure at any step undoes the steps before it.
    pub fn attach(res: &DeviceResources, config: &DriverConfig) -> Result<Self> {
        let channel = res
            .controller
            .request_channel(&config.channel, DmaCaps::SLAVE)
            .map_err(|e| {
                tracing::error!("failed to request channel {}: {}", config.channel, e);
                Error::ChannelUnavailable
            })?;
        let mapper = channel.device();

        let regs_bus = mapper
            .map_resource(res.regs.start, res.regs.len, Access::BiDirectional)
            .map_err(|e| {
                tracing::error!("failed to map register window {}: {}", res.regs.start, e);
                Error::MappingFailed
            })?;

        if let Some(mask) = config.dma_mask {
            if let Err(e) = mapper.set_mask(mask) {
                tracing::error!("failed to set DMA mask {:#x}: {}", mask, e);
                mapper.unmap_resource(regs_bus, res.regs.len, Access::BiDirectional);
                return Err(Error::ChannelUnavailable);
            }
        }

        let iobuf_bus = match mapper.map_single(res.iobuf.start, res.iobuf.len, Access::BiDirectional)
        {
            Ok(bus) => bus,
            Err(e) => {
                tracing::error!("failed to map internal buffer {}: {}", res.iobuf.start, e);
                mapper.unmap_resource(regs_bus, res.regs.len, Access::BiDirectional);
                return Err(Error::MappingFailed);
            }
        };

        tracing::info!(
            "attached channel {}: registers at {}, buffer of {:#x} bytes at {}",
            config.channel,
            regs_bus,
            res.iobuf.len,
            iobuf_bus
        );
        Ok(Self {
            channel: RwLock::new(Some(channel)),
            mapper,
            regs: res.regs,
            regs_bus,
            iobuf: res.iobuf,
            iobuf_bus,
            params: TransferParams::from(config),
            slot: Mutex::new(CompletionGate::new()),
        })
    }

    /// Stop the channel, undo the attach mappings in reverse order and release the channel.
    /// Idempotent. Any transfer still waiting on the channel returns [Error::TransferAborted].
    pub fn detach(&self) {
        let mut held = self.channel.write();
        let Some(channel) = held.take() else {
            return;
        };
        channel.terminate_sync();
        self.mapper
            .unmap_single(self.iobuf_bus, self.iobuf.len, Access::BiDirectional);
        self.mapper
            .unmap_resource(self.regs_bus, self.regs.len, Access::BiDirectional);
        drop(channel);
        tracing::info!("detached channel");
    }

    pub fn is_attached(&self) -> bool {
        self.channel.read().is_some()
    }

    pub fn regs(&self) -> PhysRange {
        self.regs
    }

    pub fn regs_bus(&self) -> BusAddr {
        self.regs_bus
    }

    pub fn iobuf(&self) -> PhysRange {
        self.iobuf
    }

    pub fn iobuf_bus(&self) -> BusAddr {
        self.iobuf_bus
    }

    pub fn params(&self) -> &TransferParams {
        &self.params
    }

    pub(crate) fn mapper(&self) -> &dyn DeviceMapper {
        self.mapper.as_ref()
    }

    /// Take the completion slot for one transfer.
    pub(crate) fn begin(&self) -> MutexGuard<'_, CompletionGate> {
        self.slot.lock()
    }

    /// Borrow the channel, holding off detach until the guard is dropped. Fails if the channel
    /// is gone.
    pub(crate) fn hold(&self) -> Result<ChannelGuard<'_>> {
        RwLockReadGuard::try_map(self.channel.read(), |c| c.as_deref()).map_err(|_| {
            tracing::error!("transfer on detached channel");
            Error::Detached
        })
    }

    /// Arm `gate`, hand `desc` to `channel` with a callback that signals it and start execution.
    pub(crate) fn submit(
        &self,
        channel: &dyn DmaChannel,
        desc: Descriptor,
        gate: &mut CompletionGate,
    ) -> Result<Cookie> {
        let token = gate.arm();
        let id = desc.id;
        let cookie = channel
            .submit(desc, Box::new(move || token.signal()))
            .map_err(|e| {
                tracing::error!("failed to submit descriptor {}: {}", id, e);
                Error::SubmissionRejected
            })?;
        channel.issue_pending();
        Ok(cookie)
    }

    /// Block until the armed transfer is released.
    pub(crate) fn wait(&self, gate: &CompletionGate, cookie: Cookie) -> Result<()> {
        tracing::trace!("waiting for completion of cookie {}", cookie.0);
        match gate.wait() {
            Outcome::Completed => Ok(()),
            Outcome::Aborted => {
                tracing::error!("transfer with cookie {} aborted", cookie.0);
                Err(Error::TransferAborted)
            }
        }
    }
}

impl Drop for ChannelResource {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for ChannelResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelResource")
            .field("regs", &self.regs)
            .field("regs_bus", &self.regs_bus)
            .field("iobuf", &self.iobuf)
            .field("iobuf_bus", &self.iobuf_bus)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{BusFaults, ChannelFaults, HwEvent, SimPlatform};

    #[test]
    fn attach_maps_and_detach_unmaps_in_reverse() {
        let config = DriverConfig {
            dma_mask: Some(0xffffff),
            ..Default::default()
        };
        let plat = SimPlatform::new(&config);
        let chan = ChannelResource::attach(&plat.resources(), &config).unwrap();
        assert!(chan.is_attached());
        assert_eq!(plat.bus.mapping_count(), 2);

        plat.events.clear();
        chan.detach();
        chan.detach();
        assert!(!chan.is_attached());
        let events = plat.events.snapshot();
        assert_eq!(
            events,
            vec![
                HwEvent::Terminate,
                HwEvent::UnmapSingle {
                    bus: chan.iobuf_bus(),
                    len: config.iobuf_size
                },
                HwEvent::UnmapResource {
                    bus: chan.regs_bus(),
                    len: config.regs_size
                },
                HwEvent::ReleaseChannel,
            ]
        );
        assert_eq!(plat.bus.mapping_count(), 0);
    }

    #[test]
    fn detach_releases_channel_for_reattach() {
        let config = DriverConfig::default();
        let plat = SimPlatform::new(&config);
        let chan = ChannelResource::attach(&plat.resources(), &config).unwrap();
        assert_eq!(
            ChannelResource::attach(&plat.resources(), &config).unwrap_err(),
            Error::ChannelUnavailable
        );

        chan.detach();
        assert!(plat.events.contains(&HwEvent::ReleaseChannel));
        assert_eq!(chan.hold().err(), Some(Error::Detached));
        let again = ChannelResource::attach(&plat.resources(), &config).unwrap();
        assert!(again.is_attached());
        assert_eq!(plat.bus.mapping_count(), 2);

        // Dropping the detached handle touches nothing that belongs to the new one.
        drop(chan);
        assert!(again.is_attached());
        assert_eq!(plat.bus.mapping_count(), 2);
    }

    #[test]
    fn attach_without_channel() {
        let config = DriverConfig::default();
        let plat = SimPlatform::new(&config);
        plat.controller.set_faults(ChannelFaults {
            unavailable: true,
            ..Default::default()
        });
        let err = ChannelResource::attach(&plat.resources(), &config).unwrap_err();
        assert_eq!(err, Error::ChannelUnavailable);
        assert_eq!(plat.bus.mapping_count(), 0);
    }

    #[test]
    fn attach_unknown_channel_name() {
        let config = DriverConfig {
            channel: "tx".to_owned(),
            ..Default::default()
        };
        let plat = SimPlatform::new(&DriverConfig::default());
        let err = ChannelResource::attach(&plat.resources(), &config).unwrap_err();
        assert_eq!(err, Error::ChannelUnavailable);
    }

    #[test]
    fn attach_rolls_back_register_window() {
        let config = DriverConfig::default();
        let plat = SimPlatform::new(&config);
        plat.bus.inject(BusFaults {
            fail_map_single: true,
            ..Default::default()
        });
        let err = ChannelResource::attach(&plat.resources(), &config).unwrap_err();
        assert_eq!(err, Error::MappingFailed);
        assert_eq!(plat.bus.mapping_count(), 0);
        assert!(plat
            .events
            .snapshot()
            .iter()
            .any(|e| matches!(e, HwEvent::UnmapResource { .. })));
        assert!(plat.events.contains(&HwEvent::ReleaseChannel));
    }

    #[test]
    fn attach_mask_failure() {
        let config = DriverConfig {
            dma_mask: Some(0xffff_ffff),
            ..Default::default()
        };
        let plat = SimPlatform::new(&config);
        plat.bus.inject(BusFaults {
            fail_set_mask: true,
            ..Default::default()
        });
        let err = ChannelResource::attach(&plat.resources(), &config).unwrap_err();
        assert_eq!(err, Error::ChannelUnavailable);
        assert_eq!(plat.bus.mapping_count(), 0);
        assert!(!plat
            .events
            .snapshot()
            .iter()
            .any(|e| matches!(e, HwEvent::MapSingle { .. })));
    }

    #[test]
    fn attach_register_window_failure() {
        let config = DriverConfig::default();
        let plat = SimPlatform::new(&config);
        plat.bus.inject(BusFaults {
            fail_map_resource: true,
            ..Default::default()
        });
        let err = ChannelResource::attach(&plat.resources(), &config).unwrap_err();
        assert_eq!(err, Error::MappingFailed);
        assert_eq!(plat.bus.mapping_count(), 0);
    }

    #[test]
    fn drop_detaches() {
        let config = DriverConfig::default();
        let plat = SimPlatform::new(&config);
        let chan = ChannelResource::attach(&plat.resources(), &config).unwrap();
        drop(chan);
        assert_eq!(plat.bus.mapping_count(), 0);
        assert!(plat.events.contains(&HwEvent::Terminate));
        assert!(plat.events.contains(&HwEvent::ReleaseChannel));
    }
}
