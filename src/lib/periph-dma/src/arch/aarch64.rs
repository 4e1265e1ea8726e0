// TODO: take the page size from the translation granule the bus mapper runs with (16K/64K).

/// Size of a page for this DMA system.
pub const DMA_PAGE_SIZE: usize = 0x1000;
