use crate::{
    arch::page_offset,
    error::{Error, Result},
    hw::{DeviceMapper, UserMemory},
};

use super::{Access, BusAddr, PageFrame, SgEntry, SyncMode, UserAddr, DMA_PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// How a user buffer falls onto pages.
pub struct PageSpan {
    /// In-page offset of the first byte.
    pub first_offset: usize,
    /// Number of pages touched.
    pub nr_pages: usize,
    /// Total length in bytes.
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// One physically contiguous piece of a pinned buffer, mapped for the device.
pub struct ScatterSegment {
    pub page: PageFrame,
    pub offset: usize,
    pub len: usize,
    pub bus: BusAddr,
}

/// Compute the pages covered by `len` bytes at `addr`. The first page may be partial, every interior
/// page is full, and the last page holds the remainder.
pub fn page_span(addr: UserAddr, len: usize) -> PageSpan {
    let first_offset = page_offset(addr.0);
    let nr_pages = if len == 0 {
        0
    } else {
        (first_offset + len).div_ceil(DMA_PAGE_SIZE)
    };
    PageSpan {
        first_offset,
        nr_pages,
        len,
    }
}

/// Yields the (in-page offset, length) of each segment of a span, in order.
pub fn segment_layout(span: PageSpan) -> impl Iterator<Item = (usize, usize)> {
    let mut remaining = span.len;
    (0..span.nr_pages).map(move |i| {
        let offset = if i == 0 { span.first_offset } else { 0 };
        let len = remaining.min(DMA_PAGE_SIZE - offset);
        remaining -= len;
        (offset, len)
    })
}

struct PinnedPages<'a> {
    memory: &'a dyn UserMemory,
    pages: Vec<PageFrame>,
}

impl Drop for PinnedPages<'_> {
    fn drop(&mut self) {
        for page in self.pages.drain(..).rev() {
            self.memory.unpin_page(page);
        }
    }
}

struct SegmentMappings<'a> {
    mapper: &'a dyn DeviceMapper,
    access: Access,
    segments: Vec<ScatterSegment>,
}

impl Drop for SegmentMappings<'_> {
    fn drop(&mut self) {
        for seg in self.segments.drain(..).rev() {
            self.mapper.unmap_page(seg.bus, seg.len, self.access);
        }
    }
}

/// A user buffer whose pages are pinned and whose segments are mapped for the device. Lives for one
/// transfer. Dropping it unmaps every segment and then unpins every page, each in reverse order.
pub struct PinnedBuffer<'a> {
    // Drop order matters: segment mappings are undone before the pages are released.
    mappings: SegmentMappings<'a>,
    _pages: PinnedPages<'a>,
}

impl<'a> PinnedBuffer<'a> {
    /// Pin the pages behind `len` bytes at `addr` and map each resulting segment for the device.
    ///
    /// A short pin is a failure of the whole call. On any failure everything acquired so far is
    /// released before returning.
    pub fn pin(
        memory: &'a dyn UserMemory,
        mapper: &'a dyn DeviceMapper,
        addr: UserAddr,
        len: usize,
        access: Access,
    ) -> Result<Self> {
        if len == 0 || addr.checked_add(len).is_none() {
            return Err(Error::InvalidAddress);
        }
        let span = page_span(addr, len);

        let mut pages = PinnedPages {
            memory,
            pages: Vec::new(),
        };
        pages.pages.try_reserve_exact(span.nr_pages).map_err(|_| {
            tracing::error!("failed to allocate page list for {} pages", span.nr_pages);
            Error::ResourceExhausted
        })?;

        memory
            .pin_pages(
                addr,
                span.nr_pages,
                access == Access::DeviceToHost,
                &mut pages.pages,
            )
            .map_err(|e| {
                tracing::error!("failed to pin user pages at {}: {}", addr, e);
                Error::ResourceExhausted
            })?;
        if pages.pages.len() != span.nr_pages {
            tracing::error!(
                "pinned {} of {} pages at {}",
                pages.pages.len(),
                span.nr_pages,
                addr
            );
            return Err(Error::ResourceExhausted);
        }

        let mut mappings = SegmentMappings {
            mapper,
            access,
            segments: Vec::new(),
        };
        mappings
            .segments
            .try_reserve_exact(span.nr_pages)
            .map_err(|_| {
                tracing::error!("failed to allocate segment list for {} pages", span.nr_pages);
                Error::ResourceExhausted
            })?;

        for (&page, (offset, len)) in pages.pages.iter().zip(segment_layout(span)) {
            let bus = mapper.map_page(page, offset, len, access).map_err(|e| {
                tracing::error!(
                    "failed to map segment {} (page {:#x}, offset {}, len {}): {}",
                    mappings.segments.len(),
                    page.0,
                    offset,
                    len,
                    e
                );
                Error::MappingFailed
            })?;
            mappings.segments.push(ScatterSegment {
                page,
                offset,
                len,
                bus,
            });
        }

        tracing::debug!(
            "pinned {} bytes at {} as {} segments",
            len,
            addr,
            mappings.segments.len()
        );
        Ok(Self {
            mappings,
            _pages: pages,
        })
    }

    pub fn segments(&self) -> &[ScatterSegment] {
        &self.mappings.segments
    }

    /// The device-visible segment list, in buffer order.
    pub fn sg_list(&self) -> Vec<SgEntry> {
        self.segments()
            .iter()
            .map(|s| SgEntry::new(s.bus, s.len))
            .collect()
    }

    /// Sync every segment.
    pub fn sync(&self, mode: SyncMode) {
        for seg in self.segments() {
            self.mappings
                .mapper
                .sync(seg.bus, seg.len, self.mappings.access, mode);
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{
        config::DriverConfig,
        sim::{HwEvent, SimPlatform},
    };

    #[test]
    fn pinned_buffer_releases_on_drop() {
        let plat = SimPlatform::new(&DriverConfig::default());
        let addr = UserAddr(0x20000 + 3000);
        plat.memory.alloc(addr, 2000);

        let buf = PinnedBuffer::pin(
            plat.memory.as_ref(),
            plat.bus.as_ref(),
            addr,
            2000,
            Access::HostToDevice,
        )
        .unwrap();
        let layout: Vec<_> = buf.segments().iter().map(|s| (s.offset, s.len)).collect();
        assert_eq!(layout, vec![(3000, 1096), (0, 904)]);
        let sg = buf.sg_list();
        assert_eq!(sg.len(), 2);
        assert_eq!(plat.memory.total_pins(), 2);
        assert_eq!(plat.bus.mapping_count(), 2);

        drop(buf);
        assert_eq!(plat.memory.total_pins(), 0);
        assert_eq!(plat.bus.mapping_count(), 0);
        let ev = plat.events.snapshot();
        let last_unmap = ev
            .iter()
            .rposition(|e| matches!(e, HwEvent::UnmapPage { .. }))
            .unwrap();
        let first_unpin = ev
            .iter()
            .position(|e| matches!(e, HwEvent::Unpin { .. }))
            .unwrap();
        assert!(last_unmap < first_unpin);
    }

    #[test]
    fn span_unaligned_two_pages() {
        let span = page_span(UserAddr(0x10000 + 3000), 2000);
        assert_eq!(span.nr_pages, 2);
        let segs: Vec<_> = segment_layout(span).collect();
        assert_eq!(segs, vec![(3000, 1096), (0, 904)]);
    }

    #[test]
    fn span_aligned() {
        let span = page_span(UserAddr(0x4000), 3 * DMA_PAGE_SIZE);
        assert_eq!(span.nr_pages, 3);
        assert!(segment_layout(span).all(|(o, l)| o == 0 && l == DMA_PAGE_SIZE));
    }

    #[test]
    fn span_within_one_page() {
        let span = page_span(UserAddr(0x4010), 16);
        assert_eq!(span.nr_pages, 1);
        assert_eq!(segment_layout(span).collect::<Vec<_>>(), vec![(0x10, 16)]);
    }

    #[test]
    fn span_ends_on_boundary() {
        let span = page_span(UserAddr(0x4000 + 96), DMA_PAGE_SIZE - 96);
        assert_eq!(span.nr_pages, 1);
        let span = page_span(UserAddr(0x4000 + 96), DMA_PAGE_SIZE - 95);
        assert_eq!(span.nr_pages, 2);
    }

    #[test]
    fn span_empty() {
        let span = page_span(UserAddr(0x4123), 0);
        assert_eq!(span.nr_pages, 0);
        assert_eq!(segment_layout(span).count(), 0);
    }

    proptest! {
        #[test]
        fn page_count_is_ceil(addr in 0usize..(1 << 40), len in 1usize..(1 << 22)) {
            let span = page_span(UserAddr(addr), len);
            let o = addr % DMA_PAGE_SIZE;
            prop_assert_eq!(span.nr_pages, (o + len + DMA_PAGE_SIZE - 1) / DMA_PAGE_SIZE);
        }

        #[test]
        fn segments_cover_length(addr in 0usize..(1 << 40), len in 1usize..(1 << 22)) {
            let span = page_span(UserAddr(addr), len);
            let segs: Vec<_> = segment_layout(span).collect();
            prop_assert_eq!(segs.len(), span.nr_pages);
            prop_assert_eq!(segs.iter().map(|s| s.1).sum::<usize>(), len);
            prop_assert_eq!(segs[0].0, addr % DMA_PAGE_SIZE);
            for (i, (off, l)) in segs.iter().enumerate() {
                prop_assert!(*l > 0);
                if i > 0 {
                    prop_assert_eq!(*off, 0);
                }
                if i > 0 && i + 1 < segs.len() {
                    prop_assert_eq!(*l, DMA_PAGE_SIZE);
                }
            }
        }
    }
}
