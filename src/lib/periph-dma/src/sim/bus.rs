use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::{EventLog, HwEvent};
use crate::{
    dma::{Access, BusAddr, PageFrame, PhysAddr, SyncMode, DMA_PAGE_SIZE},
    error::HwError,
    hw::DeviceMapper,
};

/// Lowest bus address handed out.
const IOVA_BASE: u64 = 0x10_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Failures to inject into a [SimBus].
pub struct BusFaults {
    /// Fail the map_page call with this index, counted from when the faults were injected.
    pub fail_map_page_at: Option<usize>,
    pub fail_map_resource: bool,
    pub fail_map_single: bool,
    pub fail_set_mask: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MappingKind {
    Resource,
    Single,
    Page,
}

#[derive(Debug, Clone, Copy)]
struct BusMapping {
    kind: MappingKind,
    phys: PhysAddr,
    len: usize,
    /// The page-aligned IOVA range reserved for this mapping.
    iova_start: u64,
    iova_len: u64,
}

#[derive(Debug)]
struct BusInner {
    mask: u64,
    mappings: BTreeMap<u64, BusMapping>,
    faults: BusFaults,
    map_page_calls: usize,
}

/// The simulated IOMMU of the device that owns the channels: translates bus addresses back to
/// physical memory.
#[derive(Debug)]
pub struct SimBus {
    events: EventLog,
    inner: Mutex<BusInner>,
}

impl SimBus {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            inner: Mutex::new(BusInner {
                mask: u64::MAX,
                mappings: BTreeMap::new(),
                faults: BusFaults::default(),
                map_page_calls: 0,
            }),
        }
    }

    pub fn inject(&self, faults: BusFaults) {
        let mut inner = self.inner.lock();
        inner.faults = faults;
        inner.map_page_calls = 0;
    }

    /// Number of live mappings.
    pub fn mapping_count(&self) -> usize {
        self.inner.lock().mappings.len()
    }

    /// Translate `len` bytes at `bus` to physical memory. The range must lie inside one mapping.
    pub fn resolve(&self, bus: BusAddr, len: usize) -> Result<PhysAddr, HwError> {
        let inner = self.inner.lock();
        let (&start, m) = inner
            .mappings
            .range(..=bus.0)
            .next_back()
            .ok_or(HwError::MappingFault)?;
        if bus.0 + len as u64 > start + m.len as u64 {
            return Err(HwError::MappingFault);
        }
        Ok(m.phys.offset((bus.0 - start) as usize))
    }

    fn map(
        &self,
        kind: MappingKind,
        phys: PhysAddr,
        len: usize,
    ) -> Result<BusAddr, HwError> {
        let mut inner = self.inner.lock();
        let in_page = phys.0 % DMA_PAGE_SIZE as u64;
        let iova_len = (in_page + len as u64).div_ceil(DMA_PAGE_SIZE as u64) * DMA_PAGE_SIZE as u64;

        // First fit between existing reservations.
        let mut candidate = IOVA_BASE;
        for m in inner.mappings.values() {
            if candidate + iova_len <= m.iova_start {
                break;
            }
            candidate = candidate.max(m.iova_start + m.iova_len);
        }
        if candidate + iova_len - 1 > inner.mask {
            return Err(HwError::OutOfResources);
        }

        let bus = candidate + in_page;
        inner.mappings.insert(
            bus,
            BusMapping {
                kind,
                phys,
                len,
                iova_start: candidate,
                iova_len,
            },
        );
        Ok(BusAddr(bus))
    }

    fn unmap(&self, kind: MappingKind, bus: BusAddr, len: usize) -> bool {
        let mut inner = self.inner.lock();
        let found = matches!(inner.mappings.get(&bus.0), Some(m) if m.kind == kind && m.len == len);
        if found {
            inner.mappings.remove(&bus.0);
            return true;
        }
        drop(inner);
        tracing::warn!("unmap of unknown bus address {}", bus);
        self.events.push(HwEvent::BadUnmap { bus });
        false
    }
}

impl DeviceMapper for SimBus {
    fn set_mask(&self, mask: u64) -> Result<(), HwError> {
        let mut inner = self.inner.lock();
        if inner.faults.fail_set_mask {
            return Err(HwError::Unsupported);
        }
        inner.mask = mask;
        drop(inner);
        self.events.push(HwEvent::SetMask(mask));
        Ok(())
    }

    fn map_resource(
        &self,
        phys: PhysAddr,
        size: usize,
        _access: Access,
    ) -> Result<BusAddr, HwError> {
        if self.inner.lock().faults.fail_map_resource {
            return Err(HwError::MappingFault);
        }
        let bus = self.map(MappingKind::Resource, phys, size)?;
        self.events.push(HwEvent::MapResource { bus, len: size });
        Ok(bus)
    }

    fn unmap_resource(&self, bus: BusAddr, size: usize, _access: Access) {
        if self.unmap(MappingKind::Resource, bus, size) {
            self.events.push(HwEvent::UnmapResource { bus, len: size });
        }
    }

    fn map_single(&self, phys: PhysAddr, size: usize, _access: Access) -> Result<BusAddr, HwError> {
        if self.inner.lock().faults.fail_map_single {
            return Err(HwError::MappingFault);
        }
        let bus = self.map(MappingKind::Single, phys, size)?;
        self.events.push(HwEvent::MapSingle { bus, len: size });
        Ok(bus)
    }

    fn unmap_single(&self, bus: BusAddr, size: usize, _access: Access) {
        if self.unmap(MappingKind::Single, bus, size) {
            self.events.push(HwEvent::UnmapSingle { bus, len: size });
        }
    }

    fn map_page(
        &self,
        page: PageFrame,
        offset: usize,
        len: usize,
        _access: Access,
    ) -> Result<BusAddr, HwError> {
        if offset + len > DMA_PAGE_SIZE {
            return Err(HwError::InvalidArgument);
        }
        {
            let mut inner = self.inner.lock();
            let call = inner.map_page_calls;
            inner.map_page_calls += 1;
            if inner.faults.fail_map_page_at == Some(call) {
                return Err(HwError::MappingFault);
            }
        }
        let bus = self.map(MappingKind::Page, page.phys().offset(offset), len)?;
        self.events.push(HwEvent::MapPage {
            page,
            offset,
            len,
            bus,
        });
        Ok(bus)
    }

    fn unmap_page(&self, bus: BusAddr, len: usize, _access: Access) {
        if self.unmap(MappingKind::Page, bus, len) {
            self.events.push(HwEvent::UnmapPage { bus, len });
        }
    }

    fn sync(&self, bus: BusAddr, len: usize, _access: Access, mode: SyncMode) {
        if self.resolve(bus, len).is_err() {
            tracing::warn!("sync of unmapped range {} (+{:#x})", bus, len);
        }
        self.events.push(HwEvent::Sync { bus, len, mode });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_resolve_unmap() {
        let events = EventLog::new();
        let bus = SimBus::new(events.clone());
        let a = bus
            .map_single(PhysAddr(0x20_0000), 3 * DMA_PAGE_SIZE, Access::BiDirectional)
            .unwrap();
        let b = bus
            .map_page(PageFrame(0x300), 100, 200, Access::DeviceToHost)
            .unwrap();
        assert_eq!(b.0 % DMA_PAGE_SIZE as u64, 100);
        assert_eq!(
            bus.resolve(a.offset(0x1010), 16),
            Ok(PhysAddr(0x20_0000 + 0x1010))
        );
        assert_eq!(bus.resolve(b.offset(10), 190), Ok(PhysAddr(0x30_0000 + 110)));
        assert!(bus.resolve(b.offset(10), 191).is_err());

        bus.unmap_page(b, 200, Access::DeviceToHost);
        bus.unmap_page(b, 200, Access::DeviceToHost);
        assert!(events.contains(&HwEvent::BadUnmap { bus: b }));
        assert_eq!(bus.mapping_count(), 1);
    }

    #[test]
    fn first_fit_reuses_holes() {
        let bus = SimBus::new(EventLog::new());
        let a = bus
            .map_page(PageFrame(0x300), 0, 16, Access::HostToDevice)
            .unwrap();
        let b = bus
            .map_page(PageFrame(0x301), 0, 16, Access::HostToDevice)
            .unwrap();
        assert_ne!(a, b);
        bus.unmap_page(a, 16, Access::HostToDevice);
        let c = bus
            .map_page(PageFrame(0x302), 0, 16, Access::HostToDevice)
            .unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn mask_limits_space() {
        let bus = SimBus::new(EventLog::new());
        bus.set_mask(0xffffff).unwrap();
        assert_eq!(
            bus.map_single(PhysAddr(0x20_0000), 32 << 20, Access::BiDirectional),
            Err(HwError::OutOfResources)
        );
    }

    #[test]
    fn nth_page_fault() {
        let bus = SimBus::new(EventLog::new());
        bus.inject(BusFaults {
            fail_map_page_at: Some(1),
            ..Default::default()
        });
        assert!(bus
            .map_page(PageFrame(0x300), 0, 16, Access::HostToDevice)
            .is_ok());
        assert_eq!(
            bus.map_page(PageFrame(0x301), 0, 16, Access::HostToDevice),
            Err(HwError::MappingFault)
        );
        assert!(bus
            .map_page(PageFrame(0x302), 0, 16, Access::HostToDevice)
            .is_ok());
    }
}
