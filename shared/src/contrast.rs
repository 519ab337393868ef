/*!
Per-channel contrast range estimation.

Ranges are estimated over the chronological first 75% of a frame's lines and
feed the linear auto-contrast stretch applied during assembly.
*/

use crate::channels::channel_intensities;
use crate::protocol::{MAX_INTENSITY, MID_GRAY, RANGE_PREFIX_DENOMINATOR, RANGE_PREFIX_NUMERATOR};
use crate::session::RawLine;

/// Observed intensity range of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRange {
    pub min: u16,
    pub max: u16,
    /// Line index at which `max` was first seen
    pub max_line: u32,
}

impl Default for ChannelRange {
    fn default() -> Self {
        Self {
            min: MAX_INTENSITY,
            max: 0,
            max_line: 0,
        }
    }
}

impl ChannelRange {
    /// True until at least one sample has been folded in
    pub fn is_unranged(&self) -> bool {
        self.max < self.min
    }

    /// True when every observed sample had the same intensity
    pub fn is_flat(&self) -> bool {
        self.max == self.min
    }

    /// Fold one sample taken from `line` into the range
    pub fn record(&mut self, line: u32, intensity: u16) {
        if intensity < self.min {
            self.min = intensity;
        }
        if intensity > self.max {
            self.max = intensity;
            self.max_line = line;
        }
    }

    /// Linear stretch of `value` from `[min, max]` onto the full 12-bit range.
    ///
    /// A flat range maps everything to mid-gray; an unranged channel passes
    /// values through untouched.
    pub fn stretch(&self, value: u16) -> u16 {
        if self.is_unranged() {
            return value.min(MAX_INTENSITY);
        }
        if self.is_flat() {
            return MID_GRAY;
        }

        let span = u32::from(self.max - self.min);
        let offset = u32::from(value.saturating_sub(self.min));
        (offset * u32::from(MAX_INTENSITY) / span).min(u32::from(MAX_INTENSITY)) as u16
    }
}

/// Ranges of every channel of one frame, indexed by interleave position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRangeStats {
    ranges: Vec<ChannelRange>,
}

impl ChannelRangeStats {
    /// Stats for `channel_count` channels with nothing recorded yet
    pub fn unranged(channel_count: usize) -> Self {
        Self {
            ranges: vec![ChannelRange::default(); channel_count],
        }
    }

    /// Range of the channel at interleave position `logical`
    pub fn get(&self, logical: usize) -> Option<&ChannelRange> {
        self.ranges.get(logical)
    }

    pub fn ranges(&self) -> &[ChannelRange] {
        &self.ranges
    }

    /// Stretch `value` with the range of channel `logical`; unknown channels pass through
    pub fn stretch(&self, logical: usize, value: u16) -> u16 {
        self.get(logical).map_or(value, |range| range.stretch(value))
    }

    /// Fold every sample of `line` into the per-channel ranges
    fn record_line(&mut self, line: &RawLine) {
        let count = self.ranges.len();
        for (logical, range) in self.ranges.iter_mut().enumerate() {
            for intensity in channel_intensities(&line.words, logical, count) {
                range.record(line.index, intensity);
            }
        }
    }
}

/// Number of leading lines considered for range estimation
pub fn range_prefix_len(line_count: usize) -> usize {
    line_count * RANGE_PREFIX_NUMERATOR / RANGE_PREFIX_DENOMINATOR
}

/// Estimate per-channel ranges over the first 75% of `lines` in arrival order.
///
/// A line whose index repeats the previous line's index is a retransmission and
/// is not counted again.
pub fn compute_ranges(lines: &[RawLine], channel_count: usize) -> ChannelRangeStats {
    let mut stats = ChannelRangeStats::unranged(channel_count);
    let mut previous: Option<u32> = None;

    for line in &lines[..range_prefix_len(lines.len())] {
        if previous != Some(line.index) {
            stats.record_line(line);
        }
        previous = Some(line.index);
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::word::encode;

    fn line(index: u32, intensities: &[u16]) -> RawLine {
        RawLine::new(index, intensities.iter().map(|&i| encode(7, i)).collect())
    }

    #[test]
    fn test_empty_session_leaves_stats_untouched() {
        let stats = compute_ranges(&[], 2);
        assert_eq!(stats, ChannelRangeStats::unranged(2));
        assert!(stats.get(0).unwrap().is_unranged());
    }

    #[test]
    fn test_only_first_three_quarters_ranged() {
        let lines = vec![
            line(0, &[100]),
            line(1, &[200]),
            line(2, &[300]),
            line(3, &[4000]),
        ];
        let stats = compute_ranges(&lines, 1);
        let range = stats.get(0).unwrap();
        assert_eq!(range.min, 100);
        assert_eq!(range.max, 300);
        assert_eq!(range.max_line, 2);
    }

    #[test]
    fn test_duplicate_lines_skipped() {
        // The retransmitted line 1 carries a spike that must not be counted
        let lines = vec![
            line(0, &[10]),
            line(1, &[20]),
            line(1, &[3000]),
            line(2, &[30]),
            line(3, &[40]),
            line(4, &[50]),
            line(5, &[60]),
            line(6, &[70]),
        ];
        let stats = compute_ranges(&lines, 1);
        let range = stats.get(0).unwrap();
        assert_eq!(range.min, 10);
        assert_eq!(range.max, 50);
        assert_eq!(range.max_line, 4);
    }

    #[test]
    fn test_ranges_per_interleave_position() {
        let lines = vec![
            line(0, &[5, 900, 6, 901]),
            line(1, &[7, 950, 8, 800]),
            line(2, &[0, 0, 0, 0]),
            line(3, &[0, 0, 0, 0]),
        ];
        let stats = compute_ranges(&lines, 2);
        assert_eq!(stats.get(0).unwrap().min, 0);
        assert_eq!(stats.get(0).unwrap().max, 8);
        assert_eq!(stats.get(1).unwrap().max, 950);
        assert_eq!(stats.get(1).unwrap().max_line, 1);
    }

    #[test]
    fn test_identical_intensities_give_flat_range() {
        let lines: Vec<RawLine> = (0..8).map(|i| line(i, &[1234, 1234, 1234])).collect();
        let stats = compute_ranges(&lines, 1);
        let range = stats.get(0).unwrap();
        assert_eq!(range.min, 1234);
        assert_eq!(range.max, 1234);
        assert!(range.is_flat());
        assert_eq!(range.stretch(1234), MID_GRAY);
        assert_eq!(range.stretch(0), MID_GRAY);
    }

    #[test]
    fn test_stretch() {
        let range = ChannelRange { min: 1000, max: 2000, max_line: 0 };
        assert_eq!(range.stretch(1000), 0);
        assert_eq!(range.stretch(2000), 4095);
        assert_eq!(range.stretch(1500), 2047);
        assert_eq!(range.stretch(500), 0);
        assert_eq!(range.stretch(3000), 4095);
    }

    #[test]
    fn test_unranged_passes_through() {
        let range = ChannelRange::default();
        assert_eq!(range.stretch(321), 321);
    }
}
