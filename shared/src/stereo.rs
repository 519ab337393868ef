/*!
Stereo pair combination.

Two sessions of the same scan, taken from different detector positions, are
knitted into one red/blue composite per channel: the left image ends up in
the blue lane, the right image in the red lane.
*/

use crate::grayscale::stereo_byte;
use crate::protocol::OPAQUE;
use crate::session::{ImageSession, PixelBuffer};
use thiserror::Error;
use tracing::debug;

/// Reasons two sessions cannot be combined
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StereoError {
    #[error("{side} session of frame {frame_id} is not materialized")]
    NotMaterialized { side: &'static str, frame_id: u32 },

    #[error("{side} session of frame {frame_id} uses the preview encoding")]
    NotRecombinable { side: &'static str, frame_id: u32 },

    #[error("geometry mismatch: left {left:?}, right {right:?} (channels, width, height)")]
    GeometryMismatch {
        left: (usize, usize, usize),
        right: (usize, usize, usize),
    },
}

/// Build one stereo pixel out of a left and a right grayscale-packed pixel
#[inline]
pub fn combine_pixels(left: u32, right: u32) -> u32 {
    OPAQUE | (u32::from(stereo_byte(right)) << 16) | u32::from(stereo_byte(left))
}

fn geometry(session: &ImageSession) -> (usize, usize, usize) {
    (session.channel_count(), session.width(), session.height())
}

fn check_side(session: &ImageSession, side: &'static str) -> Result<(), StereoError> {
    let frame_id = session.frame_id();
    if !session.is_recombinable() {
        return Err(StereoError::NotRecombinable { side, frame_id });
    }
    let all_loaded = (0..session.channel_count()).all(|slot| session.buffer(slot).is_some());
    if !all_loaded {
        return Err(StereoError::NotMaterialized { side, frame_id });
    }
    Ok(())
}

fn combine_buffers(left: &PixelBuffer, right: &PixelBuffer) -> PixelBuffer {
    let pixels = left
        .pixels()
        .iter()
        .zip(right.pixels())
        .map(|(&l, &r)| combine_pixels(l, r))
        .collect();
    PixelBuffer {
        width: left.width(),
        height: left.height(),
        pixels,
    }
}

/// Combine every channel of `left` and `right` into new stereo buffers.
///
/// Both sessions must be materialized, use the grayscale packing and share
/// channel count, width and height. Neither input is modified.
pub fn combine(left: &ImageSession, right: &ImageSession) -> Result<Vec<PixelBuffer>, StereoError> {
    check_side(left, "left")?;
    check_side(right, "right")?;

    if geometry(left) != geometry(right) {
        return Err(StereoError::GeometryMismatch {
            left: geometry(left),
            right: geometry(right),
        });
    }

    let buffers = (0..left.channel_count())
        .filter_map(|slot| Some(combine_buffers(left.buffer(slot)?, right.buffer(slot)?)))
        .collect();

    debug!(
        "Combined frames {} and {} into stereo images",
        left.frame_id(),
        right.frame_id()
    );
    Ok(buffers)
}

/// A stereo composite borrowing its two source sessions
#[derive(Debug)]
pub struct StereoImageSession<'a> {
    left: &'a ImageSession,
    right: &'a ImageSession,
    buffers: Vec<PixelBuffer>,
}

impl<'a> StereoImageSession<'a> {
    /// Knit `left` and `right` together
    pub fn knit(left: &'a ImageSession, right: &'a ImageSession) -> Result<Self, StereoError> {
        let buffers = combine(left, right)?;
        Ok(Self { left, right, buffers })
    }

    pub fn left(&self) -> &ImageSession {
        self.left
    }

    pub fn right(&self) -> &ImageSession {
        self.right
    }

    pub fn width(&self) -> usize {
        self.left.width()
    }

    pub fn height(&self) -> usize {
        self.left.height()
    }

    /// Physical channel captured in each slot, taken from the left session
    pub fn channels(&self) -> &[u8] {
        self.left.channels().as_slice()
    }

    pub fn buffer(&self, slot: usize) -> Option<&PixelBuffer> {
        self.buffers.get(slot)
    }
}
