//! Driver configuration.

use serde::{Deserialize, Serialize};

use crate::{device::AddrMode, device::TransferMode, hw::BusWidth};

/// Size of the internal buffer that user space maps for contiguous transfers.
pub const DEFAULT_IOBUF_SIZE: usize = 4 * 1024 * 1024;

/// Burst length used for both the device and the memory side.
pub const DEFAULT_BURST_LEN: u32 = 16;

/// Name under which the platform describes the transfer channel.
pub const DEFAULT_CHANNEL: &str = "rxtx";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    /// Channel name passed to [crate::hw::DmaController::request_channel].
    pub channel: String,
    /// Size in bytes of the internal buffer. Bounds every mapping request.
    pub iobuf_size: usize,
    /// Width of one beat, on both sides of the transfer.
    pub bus_width: BusWidth,
    /// Burst length on the peripheral side.
    pub device_burst: u32,
    /// Burst length on the memory side.
    pub memory_burst: u32,
    /// Bus address mask applied to the channel's device at attach.
    pub dma_mask: Option<u64>,
    /// Transfer mode selected after attach.
    pub mode: TransferMode,
    /// Peripheral addressing selected after attach.
    pub addr_mode: AddrMode,
    /// Size of the peripheral register window. Only the simulated platform reads this; real
    /// platforms describe the window themselves.
    pub regs_size: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_owned(),
            iobuf_size: DEFAULT_IOBUF_SIZE,
            bus_width: BusWidth::Four,
            device_burst: DEFAULT_BURST_LEN,
            memory_burst: DEFAULT_BURST_LEN,
            dma_mask: None,
            mode: TransferMode::Contiguous,
            addr_mode: AddrMode::Fifo,
            regs_size: 64 * 1024,
        }
    }
}

impl DriverConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: DriverConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.is_empty() {
            return Err(ConfigError::Invalid("channel name is empty"));
        }
        if self.iobuf_size == 0 || self.iobuf_size % crate::dma::DMA_PAGE_SIZE != 0 {
            return Err(ConfigError::Invalid(
                "iobuf_size must be a nonzero multiple of the page size",
            ));
        }
        if self.regs_size == 0 {
            return Err(ConfigError::Invalid("regs_size must be nonzero"));
        }
        if self.device_burst == 0 || self.memory_burst == 0 {
            return Err(ConfigError::Invalid("burst lengths must be nonzero"));
        }
        Ok(())
    }
}
