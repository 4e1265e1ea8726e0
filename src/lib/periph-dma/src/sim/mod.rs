//! A software model of the hardware boundary: physical memory, a bus mapper, a process address
//! space and a DMA controller whose channels move data on worker threads. Every call across the
//! boundary is recorded in an [EventLog], and most calls can be made to fail.

mod bus;
mod channel;
mod events;
mod memory;
mod phys;

use std::sync::Arc;

pub use bus::{BusFaults, SimBus};
pub use channel::{ChannelFaults, SimChannel, SimController};
pub use events::{EventLog, HwEvent};
pub use memory::SimAddressSpace;
pub use phys::PhysMemory;

use crate::{
    channel::DeviceResources,
    config::DriverConfig,
    dma::{PhysAddr, PhysRange},
};

/// A complete simulated platform for one device.
pub struct SimPlatform {
    pub phys: Arc<PhysMemory>,
    pub bus: Arc<SimBus>,
    pub controller: Arc<SimController>,
    pub memory: Arc<SimAddressSpace>,
    pub events: EventLog,
    pub regs: PhysRange,
    pub iobuf: PhysRange,
}

impl SimPlatform {
    /// Build a platform with a register window of `config.regs_size` bytes, an internal buffer of
    /// `config.iobuf_size` bytes and one channel named `config.channel`.
    pub fn new(config: &DriverConfig) -> Self {
        let events = EventLog::new();
        let phys = Arc::new(PhysMemory::new());
        let bus = Arc::new(SimBus::new(events.clone()));
        let controller = Arc::new(SimController::new(
            phys.clone(),
            bus.clone(),
            events.clone(),
            [config.channel.clone()],
        ));
        let memory = Arc::new(SimAddressSpace::new(phys.clone(), events.clone()));
        let regs = phys.alloc_range(config.regs_size);
        let iobuf = phys.alloc_range(config.iobuf_size);
        tracing::debug!(
            "simulated platform: registers at {}, buffer at {}",
            regs.start,
            iobuf.start
        );
        Self {
            phys,
            bus,
            controller,
            memory,
            events,
            regs,
            iobuf,
        }
    }

    pub fn resources(&self) -> DeviceResources {
        DeviceResources {
            controller: self.controller.clone(),
            regs: self.regs,
            iobuf: self.iobuf,
        }
    }

    /// Physical address of the register at `offset`.
    pub fn reg(&self, offset: usize) -> PhysAddr {
        self.regs.start.offset(offset)
    }
}
