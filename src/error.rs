use thiserror::Error;

/// Errors that can occur while recording to or reading back from the audio log. Marked as
/// non-exhaustive to allow for future additions without breaking the API. A caller would mostly
/// handle FlashError, as it latches the engine into a faulted state.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The partition offset has to be aligned to the size of a flash sector (4k)
    #[error("invalid partition offset")]
    InvalidPartitionOffset,

    /// The partition size has to be a multiple of the flash sector size (4k) and hold at least
    /// two data sectors next to the reserved ones.
    #[error("invalid partition size")]
    InvalidPartitionSize,

    /// The sector layout is fixed to 4k erase blocks.
    #[error("unsupported sector size")]
    UnsupportedSectorSize,

    /// Write and read granularity of the flash has to divide 16 bytes.
    #[error("unsupported flash alignment")]
    UnsupportedAlignment,

    /// The internal error value is returned from the provided `&mut impl NorFlash`, or the
    /// engine is latched after an earlier counter failure.
    #[error("internal flash error")]
    FlashError,

    /// A write succeeded according to the driver but the read-back differs.
    #[error("flash verify failed")]
    VerifyFailed,

    /// Every bit of the high counter sector has been consumed.
    #[error("sector counter exhausted")]
    CounterExhausted,

    /// Commands are 1, 5 or 9 bytes long.
    #[error("malformed command")]
    MalformedCommand,

    /// The 9-byte read command requires `start < end`.
    #[error("invalid read range")]
    InvalidReadRange,

    /// The opcode is not one of the known commands.
    #[error("unknown command: {0}")]
    UnknownCommand(u8),

    /// Both command slots are occupied, the producer has to retry later.
    #[error("command queue full")]
    CommandQueueFull,

    #[error("already recording")]
    AlreadyRecording,

    #[error("not recording")]
    NotRecording,
}
