use std::collections::HashMap;

use parking_lot::Mutex;

use crate::{
    dma::{PageFrame, PhysAddr, PhysRange, DMA_PAGE_SIZE},
    error::HwError,
};

/// First frame handed out. Keeps physical address zero unused.
const FIRST_PFN: u64 = 0x100;

/// Simulated physical memory: zero-filled page frames allocated on demand.
#[derive(Debug)]
pub struct PhysMemory {
    inner: Mutex<PhysInner>,
}

#[derive(Debug)]
struct PhysInner {
    frames: HashMap<u64, Box<[u8]>>,
    next_pfn: u64,
}

impl Default for PhysMemory {
    fn default() -> Self {
        Self {
            inner: Mutex::new(PhysInner {
                frames: HashMap::new(),
                next_pfn: FIRST_PFN,
            }),
        }
    }
}

impl PhysMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `nr` physically contiguous frames.
    pub fn alloc_frames(&self, nr: usize) -> PageFrame {
        let mut inner = self.inner.lock();
        let start = inner.next_pfn;
        for pfn in start..start + nr as u64 {
            inner
                .frames
                .insert(pfn, vec![0u8; DMA_PAGE_SIZE].into_boxed_slice());
        }
        inner.next_pfn += nr as u64;
        PageFrame(start)
    }

    /// Allocate a physically contiguous range covering `len` bytes.
    pub fn alloc_range(&self, len: usize) -> PhysRange {
        let frame = self.alloc_frames(len.div_ceil(DMA_PAGE_SIZE));
        PhysRange::new(frame.phys(), len)
    }

    pub fn nr_frames(&self) -> usize {
        self.inner.lock().frames.len()
    }

    fn access(
        &self,
        addr: PhysAddr,
        len: usize,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> Result<(), HwError> {
        let mut inner = self.inner.lock();
        let mut done = 0;
        while done < len {
            let pa = addr.0 + done as u64;
            let frame = inner
                .frames
                .get_mut(&(pa / DMA_PAGE_SIZE as u64))
                .ok_or(HwError::MappingFault)?;
            let off = (pa % DMA_PAGE_SIZE as u64) as usize;
            let n = (DMA_PAGE_SIZE - off).min(len - done);
            f(&mut frame[off..off + n], done);
            done += n;
        }
        Ok(())
    }

    pub fn read(&self, addr: PhysAddr, buf: &mut [u8]) -> Result<(), HwError> {
        let len = buf.len();
        self.access(addr, len, |frame, done| {
            buf[done..done + frame.len()].copy_from_slice(frame)
        })
    }

    pub fn write(&self, addr: PhysAddr, data: &[u8]) -> Result<(), HwError> {
        self.access(addr, data.len(), |frame, done| {
            let n = frame.len();
            frame.copy_from_slice(&data[done..done + n])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_and_spanning() {
        let mem = PhysMemory::new();
        let r = mem.alloc_range(3 * DMA_PAGE_SIZE);
        assert_eq!(mem.nr_frames(), 3);
        let data: Vec<u8> = (0..2 * DMA_PAGE_SIZE).map(|i| i as u8).collect();
        mem.write(r.start.offset(100), &data).unwrap();
        let mut back = vec![0; data.len()];
        mem.read(r.start.offset(100), &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn unallocated() {
        let mem = PhysMemory::new();
        let mut buf = [0u8; 4];
        assert_eq!(mem.read(PhysAddr(0), &mut buf), Err(HwError::MappingFault));
    }
}
