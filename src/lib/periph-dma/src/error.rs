//! Definitions for errors returned by the transfer engine and by the hardware boundary.

/// Result type used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, thiserror::Error)]
/// Caller-visible failure of a transfer, a mapping request, attach or a control command. Exactly
/// one kind is reported per failure.
pub enum Error {
    /// The user address, peripheral offset or mapping request does not describe valid memory.
    #[error("invalid address")]
    InvalidAddress,
    /// Pinning user pages or allocating bookkeeping for them failed.
    #[error("resource exhausted")]
    ResourceExhausted,
    /// The channel refused the per-transfer slave configuration.
    #[error("hardware configuration rejected")]
    HardwareConfigRejected,
    /// The channel could not build a descriptor for the segment list.
    #[error("descriptor build failed")]
    DescriptorBuildFailed,
    /// The channel refused to accept the descriptor.
    #[error("submission rejected")]
    SubmissionRejected,
    /// A segment, the register window or the internal buffer could not be mapped for the device.
    #[error("device mapping failed")]
    MappingFailed,
    /// No channel with the required capabilities could be reserved.
    #[error("no DMA channel available")]
    ChannelUnavailable,
    /// The in-flight descriptor was discarded before it completed.
    #[error("transfer aborted")]
    TransferAborted,
    /// The channel has been torn down.
    #[error("device detached")]
    Detached,
    /// The selected transfer mode is unknown or has no implementation installed.
    #[error("unsupported transfer mode")]
    UnsupportedMode,
    /// The control command is not recognized.
    #[error("unknown control command")]
    UnknownCommand,
}

impl Error {
    /// The negative errno value reported to the caller of the character device.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidAddress => -22,        // EINVAL
            Error::ResourceExhausted => -12,     // ENOMEM
            Error::HardwareConfigRejected => -5, // EIO
            Error::DescriptorBuildFailed => -5,  // EIO
            Error::SubmissionRejected => -5,     // EIO
            Error::MappingFailed => -12,         // ENOMEM
            Error::ChannelUnavailable => -19,    // ENODEV
            Error::TransferAborted => -125,      // ECANCELED
            Error::Detached => -19,              // ENODEV
            Error::UnsupportedMode => -95,       // EOPNOTSUPP
            Error::UnknownCommand => -25,        // ENOTTY
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, thiserror::Error)]
/// Failure reported by an implementation of the hardware boundary traits.
pub enum HwError {
    /// The request is not supported by this controller or channel.
    #[error("operation not supported")]
    Unsupported,
    /// The arguments were rejected.
    #[error("invalid argument")]
    InvalidArgument,
    /// The hardware or the mapping layer ran out of resources.
    #[error("out of resources")]
    OutOfResources,
    /// The address could not be made visible to the device.
    #[error("mapping fault")]
    MappingFault,
    /// The channel is busy or has been shut down.
    #[error("channel busy")]
    Busy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values() {
        assert_eq!(Error::InvalidAddress.errno(), -22);
        assert_eq!(Error::ResourceExhausted.errno(), -12);
        assert_eq!(Error::SubmissionRejected.errno(), -5);
        assert_eq!(Error::UnknownCommand.errno(), -25);
    }

    #[test]
    fn display() {
        assert_eq!(Error::MappingFailed.to_string(), "device mapping failed");
        assert_eq!(HwError::Busy.to_string(), "channel busy");
    }
}
