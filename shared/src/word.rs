/*!
Acquisition word parsing and manipulation.

Every sample the scan controller emits is a 16-bit word: the top 4 bits carry
the ADC channel tag, the low 12 bits carry the raw intensity.
*/

use crate::protocol::{MAX_INTENSITY, TAG_PIN_BASE};

/// Number of bits used by the intensity field
pub const INTENSITY_BITS: u32 = 12;

/// Mask selecting the intensity field of a word
pub const INTENSITY_MASK: u16 = 0x0FFF;

/// A decoded acquisition word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionWord {
    /// Encoded channel tag (0-15)
    pub tag: u8,
    /// Raw ADC intensity (0-4095)
    pub intensity: u16,
}

impl AcquisitionWord {
    /// Split a raw word into tag and intensity. Total over all `u16` values.
    pub fn decode(word: u16) -> Self {
        Self {
            tag: tag_of(word),
            intensity: intensity_of(word),
        }
    }

    /// Pack tag and intensity back into a raw word. Out-of-range bits are masked.
    pub fn encode(self) -> u16 {
        encode(self.tag, self.intensity)
    }

    /// Physical channel this word was sampled from, if the tag is in the device's domain
    pub fn physical_channel(self) -> Option<u8> {
        translate_tag(self.tag)
    }
}

/// Extract the encoded channel tag from a word
#[inline]
pub fn tag_of(word: u16) -> u8 {
    (word >> INTENSITY_BITS) as u8
}

/// Extract the intensity from a word, clamped into the 12-bit range
#[inline]
pub fn intensity_of(word: u16) -> u16 {
    (word & INTENSITY_MASK).min(MAX_INTENSITY)
}

/// Build a word from a channel tag and an intensity
#[inline]
pub fn encode(tag: u8, intensity: u16) -> u16 {
    (u16::from(tag & 0x0F) << INTENSITY_BITS) | (intensity & INTENSITY_MASK)
}

/// Map an encoded ADC tag to the controller's analog input pin (7 -> A0, 6 -> A1, ...).
///
/// Tags above 7 do not correspond to a wired input and yield `None`.
#[inline]
pub fn translate_tag(tag: u8) -> Option<u8> {
    TAG_PIN_BASE.checked_sub(tag)
}

/// Inverse of [`translate_tag`], used when synthesizing device output
#[inline]
pub fn tag_for_channel(channel: u8) -> Option<u8> {
    TAG_PIN_BASE.checked_sub(channel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_splits_fields() {
        let word = AcquisitionWord::decode(0x7ABC);
        assert_eq!(word.tag, 7);
        assert_eq!(word.intensity, 0xABC);
    }

    #[test]
    fn test_intensity_always_in_range() {
        for raw in 0..=u16::MAX {
            let word = AcquisitionWord::decode(raw);
            assert!(word.intensity <= MAX_INTENSITY);
            assert!(word.tag <= 15);
        }
    }

    #[test]
    fn test_intensity_identity_on_low_bits() {
        for raw in (0..=u16::MAX).step_by(7) {
            let word = AcquisitionWord::decode(raw);
            assert_eq!(encode(0, word.intensity), raw & INTENSITY_MASK);
            assert_eq!(word.encode(), raw);
        }
    }

    #[test]
    fn test_encode_masks_out_of_range() {
        assert_eq!(encode(0x1F, 0xFFFF), 0xFFFF);
        assert_eq!(AcquisitionWord::decode(encode(0x13, 0x1234)).tag, 3);
        assert_eq!(AcquisitionWord::decode(encode(3, 0x1234)).intensity, 0x234);
    }

    #[test]
    fn test_translate_tag() {
        assert_eq!(translate_tag(7), Some(0));
        assert_eq!(translate_tag(6), Some(1));
        assert_eq!(translate_tag(0), Some(7));
        assert_eq!(translate_tag(8), None);
        assert_eq!(translate_tag(15), None);
        assert_eq!(tag_for_channel(2).and_then(translate_tag), Some(2));
    }
}
