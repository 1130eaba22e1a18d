//! Error types shared across the synthesizer.
use thiserror::Error;

/// Error type returned by configuration and loading operations.
///
/// Runtime event handling (`rt_*` methods, `generate`) is infallible by
/// construction: invalid MIDI data is ignored, voice exhaustion is a silent
/// drop, unknown SysEx messages are skipped. Only configuration changes and
/// bank/file loading can fail, and they fail synchronously.
#[derive(Debug, Error)]
pub enum SynthError {
    /// A configuration request was rejected.
    ///
    /// Raised for an unsupported emulator id, a chip count of zero, a sample
    /// rate of zero, or a 4-op channel count exceeding what the configured
    /// chips can offer.
    #[error("bad configuration: {0}")]
    BadConfiguration(String),

    /// A bank file or buffer could not be loaded.
    ///
    /// The previously active bank stays in effect when this is returned.
    #[error("bank load error: {0}")]
    BankLoad(#[from] BankError),

    /// No chip emulator could be instantiated for the requested id.
    #[error("out of resources: no chip emulator available for {0}")]
    OutOfResources(String),

    /// A song file handed to the sequencer could not be parsed.
    #[error("invalid file: {0}")]
    InvalidFile(String),
}

/// Error produced by the WOPL bank reader.
#[derive(Debug, Error)]
pub enum BankError {
    /// Input ended while the reader was expecting more bytes.
    #[error("unexpected end of bank data at offset 0x{offset:X} (needed {needed} bytes)")]
    UnexpectedEof { offset: usize, needed: usize },

    /// The magic bytes at the start of the file did not match.
    #[error("invalid bank magic: {0:?}")]
    InvalidMagic([u8; 11]),

    /// The bank file declares a version this reader does not support.
    #[error("unsupported bank version: {0}")]
    UnsupportedVersion(u16),

    /// Declared bank counts do not match the amount of instrument data.
    #[error("inconsistent instrument count: {0}")]
    InconsistentCounts(String),
}
