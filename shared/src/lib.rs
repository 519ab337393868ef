/*!
# Shared Types and Utilities

This crate contains the acquisition and image reconstruction pipeline shared
between the SEM capture components.

## Core Types

- [`AcquisitionWord`] - 16-bit ADC word (channel tag + intensity)
- [`CapturedChannels`] - Configured channel tags and their output slots
- [`ImageSession`] - One frame's raw lines and its materialized pixel buffers
- [`StereoImageSession`] - Red/blue composite of two sessions
- [`Message`] - Parsed transport message

## Modules

- [`word`] - Word decoding and tag translation
- [`channels`] - Channel demultiplexing and slot resolution
- [`contrast`] - Per-channel range estimation and auto-contrast
- [`grayscale`] - Pixel encodings (recombinable packing and live preview)
- [`session`] - Image sessions and pixel buffers
- [`assembler`] - Jitter-corrected line assembly
- [`stereo`] - Stereo pair combination
- [`message`] - Transport messages and their wire codec
- [`store`] - Disk-backed pixel storage for dehydrated sessions
- [`error`] - Common error types
*/

pub mod word;
pub mod channels;
pub mod contrast;
pub mod grayscale;
pub mod session;
pub mod assembler;
pub mod stereo;
pub mod message;
pub mod store;
pub mod error;

// Re-export commonly used types
pub use word::AcquisitionWord;
pub use channels::{CapturedChannels, ChannelSamples, SlotPolicy};
pub use contrast::{ChannelRange, ChannelRangeStats};
pub use grayscale::{GrayscalePacking, PixelEncoding, PreviewEncoding};
pub use session::{ImageSession, PixelBuffer, PixelState, RawLine, SessionGeometry, SessionStrategy};
pub use stereo::{StereoError, StereoImageSession};
pub use message::{Message, WireDecoder, WireError};
pub use store::{DirectoryStore, PixelStore};
pub use error::{SharedError, Result};

/// Version information for the shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants
pub mod protocol {
    /// Largest intensity a 12-bit ADC sample can carry
    pub const MAX_INTENSITY: u16 = 4095;

    /// Value every sample maps to when a channel's contrast range is flat
    pub const MID_GRAY: u16 = 2048;

    /// Tag-to-pin translation base: tag 7 is wired to A0
    pub const TAG_PIN_BASE: u8 = 7;

    /// Fraction of a frame's lines (numerator / denominator) used for range estimation
    pub const RANGE_PREFIX_NUMERATOR: usize = 3;
    pub const RANGE_PREFIX_DENOMINATOR: usize = 4;

    /// Fully opaque alpha lane of a packed ARGB pixel
    pub const OPAQUE: u32 = 0xFF00_0000;

    /// Sync marker opening every wire message
    pub const SYNC_MARKER: [u8; 2] = [0xA5, 0x5A];

    /// Sync marker + kind + 16-bit length
    pub const WIRE_HEADER_BYTES: usize = 5;

    /// Largest payload a single wire message can declare
    pub const MAX_WIRE_PAYLOAD: usize = u16::MAX as usize;
}
