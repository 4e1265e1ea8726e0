#[cfg(target_arch = "x86_64")]
pub(crate) mod x86;

#[cfg(target_arch = "x86_64")]
pub use x86::*;

#[cfg(target_arch = "aarch64")]
pub(crate) mod aarch64;

#[cfg(target_arch = "aarch64")]
pub use aarch64::*;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod generic {
    /// Size of a page for this DMA system.
    pub const DMA_PAGE_SIZE: usize = 0x1000;
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub use generic::*;

/// Offset of `addr` within its DMA page.
#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (DMA_PAGE_SIZE - 1)
}

/// Round `addr` down to the start of its DMA page.
#[inline]
pub const fn page_align_down(addr: usize) -> usize {
    addr & !(DMA_PAGE_SIZE - 1)
}
