/*!
Jitter-corrected image assembly.

Lines are walked in arrival order. Each line is placed at
`index + (height - max_line + 1)`, which anchors the frame against the bottom
of the raster and absorbs vertical sync jitter. Rows skipped between two
lines are filled by repeating the current line, not by interpolation.
*/

use crate::channels::{demultiplex, CapturedChannels, SlotPolicy};
use crate::contrast::ChannelRangeStats;
use crate::grayscale::{GrayscalePacking, PixelEncoding};
use crate::session::{ImageSession, PixelBuffer, PixelState, RawLine};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failure writing one row of one channel. Never aborts assembly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("row {row} is outside an image of height {height}")]
    RowOutOfBounds { row: usize, height: usize },

    #[error("channel slot {slot} is outside the {channels} captured channels")]
    SlotOutOfRange { slot: usize, channels: usize },
}

/// Encoded pixels of one channel run, ready to be written into a row
struct EncodedRun {
    slot: usize,
    pixels: Vec<u32>,
}

/// Demultiplex, auto-contrast and encode one line
fn encode_line(
    line: &RawLine,
    channels: &CapturedChannels,
    policy: SlotPolicy,
    ranges: &ChannelRangeStats,
    encoding: &dyn PixelEncoding,
) -> Vec<EncodedRun> {
    demultiplex(&line.words, channels, policy)
        .into_iter()
        .map(|run| EncodedRun {
            slot: run.slot,
            pixels: run
                .intensities
                .iter()
                .map(|&value| encoding.encode(run.slot, ranges.stretch(run.logical, value)))
                .collect(),
        })
        .collect()
}

/// Write `pixels` into row `row` of the buffer for `slot`
pub fn write_run(
    buffers: &mut [PixelBuffer],
    slot: usize,
    row: usize,
    pixels: &[u32],
) -> Result<(), AssemblyError> {
    let channels = buffers.len();
    buffers
        .get_mut(slot)
        .ok_or(AssemblyError::SlotOutOfRange { slot, channels })?
        .write_row(row, pixels)
}

/// Turn a buffered session's raw lines into per-channel pixel buffers.
///
/// Idempotent: sessions that are already materialized (or dehydrated) are left alone.
pub fn materialize(session: &mut ImageSession) {
    if session.is_materialized() {
        return;
    }

    session.ensure_ranges();

    let Some(max_line) = session.max_line.map(|line| line as usize) else {
        debug!("Frame {} has no lines, materializing blank images", session.frame_id);
        session.buffers = (0..session.channels.len())
            .map(|_| Some(PixelBuffer::new(session.width, session.height)))
            .collect();
        session.state = PixelState::Ready;
        return;
    };

    if max_line + 1 > session.height {
        info!(
            "Frame {}: growing height from {} to {} lines",
            session.frame_id,
            session.height,
            max_line + 1
        );
        session.height = max_line + 1;
    }

    let width = session.width;
    let height = session.height;
    let mut buffers: Vec<PixelBuffer> = (0..session.channels.len())
        .map(|_| PixelBuffer::new(width, height))
        .collect();

    // height >= max_line + 1, so the offset is at least 2
    let offset = height + 1 - max_line;
    let encoding = GrayscalePacking;
    let fallback = ChannelRangeStats::unranged(session.channels.len());
    let ranges = session.ranges.as_ref().unwrap_or(&fallback);

    let mut failed_writes = 0usize;
    let mut previous_row: Option<usize> = None;

    for line in &session.lines {
        let target_row = line.index as usize + offset;
        let first_row = previous_row.map_or(0, |row| row + 1);

        if first_row <= target_row && first_row < height {
            let runs = encode_line(line, &session.channels, session.slot_policy, ranges, &encoding);

            for row in first_row..=target_row.min(height - 1) {
                for run in &runs {
                    if let Err(e) = write_run(&mut buffers, run.slot, row, &run.pixels) {
                        warn!("Write failed for frame {} row {}: {}", session.frame_id, row, e);
                        failed_writes += 1;
                    }
                }
            }
        }

        previous_row = Some(target_row);
    }

    debug!(
        "Materialized frame {}: {} lines into {}x{} ({} failed writes)",
        session.frame_id,
        session.lines.len(),
        width,
        height,
        failed_writes
    );

    session.buffers = buffers.into_iter().map(Some).collect();
    session.state = PixelState::Ready;
}
