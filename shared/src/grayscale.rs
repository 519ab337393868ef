/*!
Pixel encodings.

[`GrayscalePacking`] spreads a 12-bit sample over the three color lanes of an
ARGB pixel: the high six bits go into every lane, the low six bits are split
2+2+2 across red, green and blue. The image still looks gray, and the sample
can be recovered later for stereo recombination.

[`PreviewEncoding`] is the display-only variant used by live sessions. Its
pixels cannot be decoded back into intensities.
*/

use crate::protocol::{MAX_INTENSITY, OPAQUE};

/// Converts one sample into a packed ARGB pixel
pub trait PixelEncoding: Send + Sync {
    /// Encode `intensity` for the channel written to `slot`
    fn encode(&self, slot: usize, intensity: u16) -> u32;

    /// Whether pixels produced by this encoding can be fed to the stereo combiner
    fn is_recombinable(&self) -> bool;
}

/// Lossless 12-bit grayscale packing
#[derive(Debug, Clone, Copy, Default)]
pub struct GrayscalePacking;

impl PixelEncoding for GrayscalePacking {
    fn encode(&self, _slot: usize, intensity: u16) -> u32 {
        pack(intensity)
    }

    fn is_recombinable(&self) -> bool {
        true
    }
}

/// Pack a 12-bit intensity into an opaque gray-ish pixel
pub fn pack(intensity: u16) -> u32 {
    let intensity = u32::from(intensity.min(MAX_INTENSITY));

    let high = ((intensity >> 6) & 0x3F) << 2;
    let low = intensity & 0x3F;
    let r = low & 0x3;
    let g = (low >> 2) & 0x3;
    let b = (low >> 4) & 0x3;

    OPAQUE | ((high + r) << 16) | ((high + g) << 8) | (high + b)
}

/// Recover the 12-bit intensity from a pixel produced by [`pack`]
pub fn unpack(pixel: u32) -> u16 {
    let red = (pixel >> 16) & 0xFF;
    let green = (pixel >> 8) & 0xFF;
    let blue = pixel & 0xFF;

    let high = blue >> 2;
    let low = (red & 0x3) | ((green & 0x3) << 2) | ((blue & 0x3) << 4);
    ((high << 6) | low) as u16
}

/// Byte of a packed pixel carried over into a stereo composite (the blue lane)
#[inline]
pub fn stereo_byte(pixel: u32) -> u8 {
    (pixel & 0xFF) as u8
}

/// Fixed-calibration preview encoding for live sessions.
///
/// Calibration is a floor subtraction followed by a reduction to 8 bits. The
/// channel in slot 0 is drawn at full brightness, every other channel at 1/4.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreviewEncoding {
    pub floor: u16,
}

impl PreviewEncoding {
    pub fn new(floor: u16) -> Self {
        Self { floor }
    }

    /// Calibrated 8-bit value of a sample
    pub fn calibrate(&self, intensity: u16) -> u8 {
        (intensity.min(MAX_INTENSITY).saturating_sub(self.floor) >> 4) as u8
    }
}

impl PixelEncoding for PreviewEncoding {
    fn encode(&self, slot: usize, intensity: u16) -> u32 {
        let mut value = u32::from(self.calibrate(intensity));
        if slot != 0 {
            value /= 4;
        }
        OPAQUE | (value << 16) | (value << 8) | value
    }

    fn is_recombinable(&self) -> bool {
        false
    }
}
