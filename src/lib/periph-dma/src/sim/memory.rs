use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};

use super::{EventLog, HwEvent, PhysMemory};
use crate::{
    arch::page_align_down,
    dma::{MappingGrant, PageFrame, PhysAddr, UserAddr, DMA_PAGE_SIZE},
    error::HwError,
    hw::UserMemory,
};

#[derive(Debug, Clone, Copy)]
struct Pte {
    frame: PageFrame,
}

#[derive(Debug, Default)]
struct SpaceInner {
    /// Virtual page number to frame.
    pages: BTreeMap<usize, Pte>,
    /// Pin count per frame.
    pins: HashMap<u64, usize>,
    pin_limit: Option<usize>,
}

/// A simulated process address space backed by [PhysMemory].
#[derive(Debug)]
pub struct SimAddressSpace {
    phys: Arc<PhysMemory>,
    events: EventLog,
    mmap_lock: RwLock<()>,
    inner: Mutex<SpaceInner>,
}

fn vpn(addr: usize) -> usize {
    addr / DMA_PAGE_SIZE
}

impl SimAddressSpace {
    pub fn new(phys: Arc<PhysMemory>, events: EventLog) -> Self {
        Self {
            phys,
            events,
            mmap_lock: RwLock::new(()),
            inner: Mutex::new(SpaceInner::default()),
        }
    }

    /// Back `len` bytes at `addr` with fresh frames. Pages that are already present stay as they
    /// are.
    pub fn alloc(&self, addr: UserAddr, len: usize) {
        let _mm = self.mmap_lock.write();
        let mut inner = self.inner.lock();
        let first = vpn(addr.0);
        let last = vpn(addr.0 + len.max(1) - 1);
        for v in first..=last {
            if !inner.pages.contains_key(&v) {
                let frame = self.phys.alloc_frames(1);
                inner.pages.insert(v, Pte { frame });
            }
        }
    }

    /// Install a device mapping granted by the driver at `start`.
    pub fn map_device(&self, start: UserAddr, grant: MappingGrant) {
        let _mm = self.mmap_lock.write();
        let mut inner = self.inner.lock();
        let first = vpn(start.0);
        for i in 0..grant.len.div_ceil(DMA_PAGE_SIZE) {
            inner.pages.insert(
                first + i,
                Pte {
                    frame: PageFrame(grant.pfn.0 + i as u64),
                },
            );
        }
    }

    /// Remove the pages covering `len` bytes at `addr`.
    pub fn unmap(&self, addr: UserAddr, len: usize) {
        let _mm = self.mmap_lock.write();
        let mut inner = self.inner.lock();
        let first = vpn(addr.0);
        let last = vpn(addr.0 + len.max(1) - 1);
        for v in first..=last {
            inner.pages.remove(&v);
        }
    }

    /// Cap the number of pages a single pin call returns.
    pub fn set_pin_limit(&self, limit: Option<usize>) {
        self.inner.lock().pin_limit = limit;
    }

    /// Total outstanding pins over all frames.
    pub fn total_pins(&self) -> usize {
        self.inner.lock().pins.values().sum()
    }

    pub fn pin_count(&self, frame: PageFrame) -> usize {
        self.inner.lock().pins.get(&frame.0).copied().unwrap_or(0)
    }

    /// Returns true if nobody holds the address-space lock.
    pub fn lock_is_free(&self) -> bool {
        self.mmap_lock.try_write().is_some()
    }

    fn copy(
        &self,
        addr: UserAddr,
        len: usize,
        mut f: impl FnMut(PhysAddr, usize, usize) -> Result<(), HwError>,
    ) -> Result<(), HwError> {
        let _mm = self.mmap_lock.read();
        let mut done = 0;
        while done < len {
            let va = addr.0 + done;
            let frame = self
                .inner
                .lock()
                .pages
                .get(&vpn(va))
                .map(|p| p.frame)
                .ok_or(HwError::MappingFault)?;
            let off = va - page_align_down(va);
            let n = (DMA_PAGE_SIZE - off).min(len - done);
            f(frame.phys().offset(off), done, n)?;
            done += n;
        }
        Ok(())
    }

    /// Copy out of the address space, as the process would read its own memory.
    pub fn read(&self, addr: UserAddr, buf: &mut [u8]) -> Result<(), HwError> {
        let len = buf.len();
        self.copy(addr, len, |pa, done, n| {
            self.phys.read(pa, &mut buf[done..done + n])
        })
    }

    /// Copy into the address space.
    pub fn write(&self, addr: UserAddr, data: &[u8]) -> Result<(), HwError> {
        self.copy(addr, data.len(), |pa, done, n| {
            self.phys.write(pa, &data[done..done + n])
        })
    }
}

impl UserMemory for SimAddressSpace {
    fn pin_pages(
        &self,
        start: UserAddr,
        nr_pages: usize,
        write: bool,
        pages: &mut Vec<PageFrame>,
    ) -> Result<(), HwError> {
        let _mm = self.mmap_lock.read();
        let mut inner = self.inner.lock();
        let limit = inner.pin_limit.unwrap_or(usize::MAX).min(nr_pages);
        let first = vpn(start.0);
        let mut pinned = 0;
        for v in first..first + limit {
            let Some(pte) = inner.pages.get(&v).copied() else {
                break;
            };
            *inner.pins.entry(pte.frame.0).or_default() += 1;
            pages.push(pte.frame);
            pinned += 1;
            self.events.push(HwEvent::Pin {
                page: pte.frame,
                write,
            });
        }
        if pinned == 0 && nr_pages > 0 {
            return Err(HwError::MappingFault);
        }
        Ok(())
    }

    fn unpin_page(&self, page: PageFrame) {
        let mut inner = self.inner.lock();
        let remaining = inner
            .pins
            .get_mut(&page.0)
            .filter(|n| **n > 0)
            .map(|n| {
                *n -= 1;
                *n
            });
        if remaining == Some(0) {
            inner.pins.remove(&page.0);
        }
        drop(inner);
        if remaining.is_some() {
            self.events.push(HwEvent::Unpin { page });
        } else {
            tracing::warn!("unpin of unpinned page {:#x}", page.0);
            self.events.push(HwEvent::BadUnpin { page });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> SimAddressSpace {
        SimAddressSpace::new(Arc::new(PhysMemory::new()), EventLog::new())
    }

    #[test]
    fn read_write_across_pages() {
        let s = space();
        let addr = UserAddr(0x40_0000 + 4000);
        s.alloc(addr, 300);
        let data: Vec<u8> = (0..300).map(|i| i as u8).collect();
        s.write(addr, &data).unwrap();
        let mut back = vec![0; 300];
        s.read(addr, &mut back).unwrap();
        assert_eq!(back, data);
        assert!(s.read(UserAddr(0x80_0000), &mut back).is_err());
    }

    #[test]
    fn pin_counts() {
        let s = space();
        let addr = UserAddr(0x40_0000);
        s.alloc(addr, 3 * DMA_PAGE_SIZE);
        let mut pages = Vec::new();
        s.pin_pages(addr, 3, true, &mut pages).unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(s.total_pins(), 3);
        for p in pages {
            s.unpin_page(p);
        }
        assert_eq!(s.total_pins(), 0);
    }

    #[test]
    fn short_pins() {
        let s = space();
        let addr = UserAddr(0x40_0000);
        s.alloc(addr, 2 * DMA_PAGE_SIZE);
        let mut pages = Vec::new();
        s.pin_pages(addr, 3, false, &mut pages).unwrap();
        assert_eq!(pages.len(), 2);

        s.set_pin_limit(Some(1));
        let mut more = Vec::new();
        s.pin_pages(addr, 2, false, &mut more).unwrap();
        assert_eq!(more.len(), 1);

        let mut none = Vec::new();
        assert_eq!(
            s.pin_pages(UserAddr(0x90_0000), 1, false, &mut none),
            Err(HwError::MappingFault)
        );
    }

    #[test]
    fn double_unpin_is_recorded() {
        let events = EventLog::new();
        let s = SimAddressSpace::new(Arc::new(PhysMemory::new()), events.clone());
        s.alloc(UserAddr(0x40_0000), 1);
        let mut pages = Vec::new();
        s.pin_pages(UserAddr(0x40_0000), 1, false, &mut pages).unwrap();
        s.unpin_page(pages[0]);
        s.unpin_page(pages[0]);
        assert!(events.contains(&HwEvent::BadUnpin { page: pages[0] }));
    }
}
