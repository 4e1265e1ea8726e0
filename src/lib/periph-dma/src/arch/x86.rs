/// Size of a page for this DMA system.
pub const DMA_PAGE_SIZE: usize = 0x1000;
