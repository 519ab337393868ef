/*!
Channel demultiplexing.

A raw line interleaves the samples of every captured channel:
`[c0, c1, .., cN-1, c0, c1, ..]`. This module splits a line into one
intensity run per channel and decides which output slot each run belongs to.
*/

use crate::error::{Result, SharedError};
use crate::word::AcquisitionWord;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Ordered set of captured physical channels. A channel's slot is its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedChannels {
    channels: Vec<u8>,
}

impl CapturedChannels {
    /// Create a channel set; at least one channel is required
    pub fn new(channels: Vec<u8>) -> Result<Self> {
        if channels.is_empty() {
            return Err(SharedError::config("captured channel set must not be empty"));
        }
        Ok(Self { channels })
    }

    /// Number of captured channels
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channel is captured
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Physical channel ids in slot order
    pub fn as_slice(&self) -> &[u8] {
        &self.channels
    }

    /// Physical channel captured in `slot`
    pub fn channel_at(&self, slot: usize) -> Option<u8> {
        self.channels.get(slot).copied()
    }

    /// Slot whose physical channel equals `channel`
    pub fn slot_of(&self, channel: u8) -> Option<usize> {
        self.channels.iter().position(|&c| c == channel)
    }
}

/// What to do with a channel run whose physical channel is not captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPolicy {
    /// Write the run into slot 0 (the scan controller's historical behavior)
    #[default]
    FallbackToFirst,
    /// Drop the run
    Skip,
}

impl SlotPolicy {
    /// Apply the policy to a slot lookup result
    pub fn resolve(self, slot: Option<usize>) -> Option<usize> {
        match (slot, self) {
            (Some(slot), _) => Some(slot),
            (None, SlotPolicy::FallbackToFirst) => Some(0),
            (None, SlotPolicy::Skip) => None,
        }
    }
}

/// One channel's intensities taken out of a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSamples {
    /// Position of the channel inside the interleaved line
    pub logical: usize,
    /// Physical channel recovered from the line (None for an untranslatable tag)
    pub physical: Option<u8>,
    /// Output slot the samples are written to
    pub slot: usize,
    pub intensities: Vec<u16>,
}

/// Physical channel of the run starting at `logical`.
///
/// With a single captured channel the configured channel is used directly and
/// the tag bits in the data are not consulted.
pub fn physical_channel(words: &[u16], logical: usize, channels: &CapturedChannels) -> Option<u8> {
    if channels.len() == 1 {
        return channels.channel_at(0);
    }
    words
        .get(logical)
        .and_then(|&word| AcquisitionWord::decode(word).physical_channel())
}

/// Intensities of the run starting at `logical`, walking the line with stride `count`
pub fn channel_intensities(
    words: &[u16],
    logical: usize,
    count: usize,
) -> impl Iterator<Item = u16> + '_ {
    words
        .iter()
        .skip(logical)
        .step_by(count.max(1))
        .map(|&word| AcquisitionWord::decode(word).intensity)
}

/// Split a line into per-channel runs.
///
/// Runs whose slot cannot be resolved under `policy` are logged and left out.
pub fn demultiplex(words: &[u16], channels: &CapturedChannels, policy: SlotPolicy) -> Vec<ChannelSamples> {
    let count = channels.len();
    let mut runs = Vec::with_capacity(count);

    for logical in 0..count {
        let physical = physical_channel(words, logical, channels);
        let slot = match policy.resolve(physical.and_then(|p| channels.slot_of(p))) {
            Some(slot) => slot,
            None => {
                warn!(
                    "Dropping channel run {}: physical channel {:?} is not captured",
                    logical, physical
                );
                continue;
            }
        };

        runs.push(ChannelSamples {
            logical,
            physical,
            slot,
            intensities: channel_intensities(words, logical, count).collect(),
        });
    }

    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::word::{encode, tag_for_channel};

    fn word(channel: u8, intensity: u16) -> u16 {
        encode(tag_for_channel(channel).unwrap(), intensity)
    }

    #[test]
    fn test_empty_channel_set_rejected() {
        assert!(CapturedChannels::new(vec![]).is_err());
    }

    #[test]
    fn test_slot_lookup_non_contiguous() {
        let channels = CapturedChannels::new(vec![4, 0, 2]).unwrap();
        assert_eq!(channels.slot_of(0), Some(1));
        assert_eq!(channels.slot_of(2), Some(2));
        assert_eq!(channels.slot_of(4), Some(0));
        assert_eq!(channels.slot_of(3), None);
    }

    #[test]
    fn test_slot_policy() {
        assert_eq!(SlotPolicy::FallbackToFirst.resolve(None), Some(0));
        assert_eq!(SlotPolicy::Skip.resolve(None), None);
        assert_eq!(SlotPolicy::Skip.resolve(Some(2)), Some(2));
    }

    #[test]
    fn test_each_channel_gets_n_samples() {
        let channels = CapturedChannels::new(vec![0, 1, 2]).unwrap();
        let n = 5;
        let words: Vec<u16> = (0..n)
            .flat_map(|i| (0..3u8).map(move |c| word(c, (i * 10 + c as usize) as u16)))
            .collect();

        let runs = demultiplex(&words, &channels, SlotPolicy::Skip);
        assert_eq!(runs.len(), 3);
        for run in &runs {
            assert_eq!(run.intensities.len(), n);
            assert_eq!(run.slot, run.logical);
            assert_eq!(run.intensities[2], (20 + run.logical) as u16);
        }
    }

    #[test]
    fn test_routes_by_tag_not_position() {
        // Device interleaves channel 1 first, but slot 0 is channel 0
        let channels = CapturedChannels::new(vec![0, 1]).unwrap();
        let words = vec![word(1, 100), word(0, 200), word(1, 101), word(0, 201)];

        let runs = demultiplex(&words, &channels, SlotPolicy::Skip);
        assert_eq!(runs[0].physical, Some(1));
        assert_eq!(runs[0].slot, 1);
        assert_eq!(runs[0].intensities, vec![100, 101]);
        assert_eq!(runs[1].slot, 0);
        assert_eq!(runs[1].intensities, vec![200, 201]);
    }

    #[test]
    fn test_single_channel_uses_configured_channel() {
        // Tag bits claim channel 5, which is ignored for a single-channel capture
        let channels = CapturedChannels::new(vec![3]).unwrap();
        let words = vec![word(5, 1), word(5, 2), word(5, 3)];

        let runs = demultiplex(&words, &channels, SlotPolicy::Skip);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].physical, Some(3));
        assert_eq!(runs[0].slot, 0);
        assert_eq!(runs[0].intensities, vec![1, 2, 3]);
    }

    #[test]
    fn test_unknown_channel_policy() {
        let channels = CapturedChannels::new(vec![0, 1]).unwrap();
        // Tag 9 is outside the wired range, channel 6 is not captured
        let words = vec![encode(9, 7), word(6, 8)];

        let fallback = demultiplex(&words, &channels, SlotPolicy::FallbackToFirst);
        assert_eq!(fallback.len(), 2);
        assert!(fallback.iter().all(|run| run.slot == 0));
        assert_eq!(fallback[0].physical, None);

        let skipped = demultiplex(&words, &channels, SlotPolicy::Skip);
        assert!(skipped.is_empty());
    }

    #[test]
    fn test_short_line_emits_fewer_samples() {
        let channels = CapturedChannels::new(vec![0, 1]).unwrap();
        let words = vec![word(0, 1), word(1, 2), word(0, 3)];

        let runs = demultiplex(&words, &channels, SlotPolicy::Skip);
        assert_eq!(runs[0].intensities, vec![1, 3]);
        assert_eq!(runs[1].intensities, vec![2]);
    }
}
