/*!
Image session data structures.

An [`ImageSession`] holds one frame: the raw lines in arrival order while the
frame is being acquired, and one [`PixelBuffer`] per captured channel once it
has been materialized.
*/

use crate::assembler::{self, AssemblyError};
use crate::channels::{demultiplex, CapturedChannels, SlotPolicy};
use crate::contrast::{compute_ranges, ChannelRangeStats};
use crate::error::{Result, SharedError};
use crate::grayscale::{PixelEncoding, PreviewEncoding};
use crate::store::PixelStore;
use tracing::{debug, info, warn};

/// One line of interleaved acquisition words as received from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    /// Scan line index reported by the device
    pub index: u32,
    pub words: Vec<u16>,
}

impl RawLine {
    pub fn new(index: u32, words: Vec<u16>) -> Self {
        Self { index, words }
    }
}

/// Channel layout and raster size a session is created with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGeometry {
    pub channels: CapturedChannels,
    pub width: usize,
    pub height: usize,
}

impl SessionGeometry {
    pub fn new(channels: CapturedChannels, width: usize, height: usize) -> Result<Self> {
        if width == 0 {
            return Err(SharedError::config("image width must be at least 1"));
        }
        Ok(Self { channels, width, height })
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// How a session turns lines into pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStrategy {
    /// Buffer all lines, then auto-contrast and jitter-correct at frame end
    Buffered,
    /// Render each line immediately with a fixed calibration
    LivePreview { floor: u16 },
}

/// Lifecycle of a session's pixel buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelState {
    /// Only raw lines are held
    Unmaterialized,
    /// Every channel has a pixel buffer
    Ready,
    /// Persisted buffers were dropped and must be reloaded before use
    Dehydrated,
}

/// Raster of packed ARGB pixels for one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub(crate) width: usize,
    pub(crate) height: usize,
    pub(crate) pixels: Vec<u32>,
}

impl PixelBuffer {
    /// Create a fully transparent buffer
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width * height],
        }
    }

    /// Wrap existing pixel data, checking it matches the raster size
    pub fn from_pixels(width: usize, height: usize, pixels: Vec<u32>) -> Result<Self> {
        let expected = width.checked_mul(height).ok_or_else(|| {
            SharedError::invalid_stored_image(format!("{}x{} raster is too large", width, height))
        })?;
        if pixels.len() != expected {
            return Err(SharedError::invalid_stored_image(format!(
                "expected {}x{} = {} pixels, got {}",
                width,
                height,
                expected,
                pixels.len()
            )));
        }
        Ok(Self { width, height, pixels })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    pub fn get(&self, x: usize, y: usize) -> Option<u32> {
        if x >= self.width {
            return None;
        }
        self.pixels.get(y * self.width + x).copied()
    }

    pub fn row(&self, y: usize) -> Option<&[u32]> {
        if y >= self.height {
            return None;
        }
        Some(&self.pixels[y * self.width..(y + 1) * self.width])
    }

    /// Write `samples` at the start of row `y`. Samples beyond the width are ignored.
    pub fn write_row(&mut self, y: usize, samples: &[u32]) -> std::result::Result<(), AssemblyError> {
        if y >= self.height {
            return Err(AssemblyError::RowOutOfBounds { row: y, height: self.height });
        }
        let start = y * self.width;
        let n = samples.len().min(self.width);
        self.pixels[start..start + n].copy_from_slice(&samples[..n]);
        Ok(())
    }
}

/// One acquired frame and its per-channel images
#[derive(Debug)]
pub struct ImageSession {
    pub(crate) frame_id: u32,
    pub(crate) channels: CapturedChannels,
    pub(crate) width: usize,
    pub(crate) declared_height: usize,
    pub(crate) height: usize,
    pub(crate) strategy: SessionStrategy,
    pub(crate) slot_policy: SlotPolicy,
    pub(crate) lines: Vec<RawLine>,
    pub(crate) lines_received: usize,
    pub(crate) max_line: Option<u32>,
    pub(crate) ranges: Option<ChannelRangeStats>,
    pub(crate) buffers: Vec<Option<PixelBuffer>>,
    pub(crate) state: PixelState,
    pub(crate) image_names: Vec<Option<String>>,
}

impl ImageSession {
    /// Start a new session for frame `frame_id`
    pub fn new(frame_id: u32, geometry: &SessionGeometry, strategy: SessionStrategy) -> Self {
        let count = geometry.channel_count();
        let (buffers, state) = match strategy {
            SessionStrategy::Buffered => (vec![None; count], PixelState::Unmaterialized),
            SessionStrategy::LivePreview { .. } => (
                (0..count)
                    .map(|_| Some(PixelBuffer::new(geometry.width, geometry.height)))
                    .collect(),
                PixelState::Ready,
            ),
        };

        Self {
            frame_id,
            channels: geometry.channels.clone(),
            width: geometry.width,
            declared_height: geometry.height,
            height: geometry.height,
            strategy,
            slot_policy: SlotPolicy::default(),
            lines: Vec::new(),
            lines_received: 0,
            max_line: None,
            ranges: None,
            buffers,
            state,
            image_names: vec![None; count],
        }
    }

    /// Override how lines with an uncaptured channel tag are routed
    pub fn with_slot_policy(mut self, policy: SlotPolicy) -> Self {
        self.slot_policy = policy;
        self
    }

    /// Append a line received from the device.
    ///
    /// Buffered sessions keep the line for assembly at frame end; live preview
    /// sessions render it straight into their buffers.
    pub fn file_line(&mut self, line: RawLine) {
        self.lines_received += 1;
        self.max_line = Some(self.max_line.map_or(line.index, |max| max.max(line.index)));

        match self.strategy {
            SessionStrategy::Buffered => self.lines.push(line),
            SessionStrategy::LivePreview { floor } => self.render_preview_line(&line, floor),
        }
    }

    fn render_preview_line(&mut self, line: &RawLine, floor: u16) {
        let row = line.index as usize;
        if row >= self.height {
            return;
        }

        let encoding = PreviewEncoding::new(floor);
        for run in demultiplex(&line.words, &self.channels, self.slot_policy) {
            let pixels: Vec<u32> = run
                .intensities
                .iter()
                .map(|&intensity| encoding.encode(run.slot, intensity))
                .collect();

            let written = match self.buffers.get_mut(run.slot).and_then(Option::as_mut) {
                Some(buffer) => buffer.write_row(row, &pixels),
                None => Err(AssemblyError::SlotOutOfRange {
                    slot: run.slot,
                    channels: self.channels.len(),
                }),
            };
            if let Err(e) = written {
                warn!("Preview write failed for frame {} line {}: {}", self.frame_id, row, e);
            }
        }
    }

    /// Compute the contrast ranges for this frame if that has not happened yet
    pub fn ensure_ranges(&mut self) -> &ChannelRangeStats {
        let channel_count = self.channels.len();
        let lines = &self.lines;
        self.ranges
            .get_or_insert_with(|| compute_ranges(lines, channel_count))
    }

    /// Build the per-channel pixel buffers. Calling it again is a no-op.
    pub fn materialize(&mut self) {
        assembler::materialize(self);
    }

    /// Drop every pixel buffer that has been persisted. Returns how many were dropped.
    pub fn dehydrate(&mut self) -> usize {
        if self.state != PixelState::Ready {
            return 0;
        }

        let mut dropped = 0;
        for (buffer, name) in self.buffers.iter_mut().zip(&self.image_names) {
            if name.is_some() && buffer.take().is_some() {
                dropped += 1;
            }
        }

        if dropped > 0 {
            self.state = PixelState::Dehydrated;
            debug!("Dehydrated frame {}: {} channel buffers released", self.frame_id, dropped);
        }
        dropped
    }

    /// Reload dropped pixel buffers from `store`
    pub fn rehydrate(&mut self, store: &dyn PixelStore) -> Result<()> {
        if self.state != PixelState::Dehydrated {
            return Ok(());
        }

        for slot in 0..self.buffers.len() {
            if self.buffers[slot].is_some() {
                continue;
            }
            let name = self.image_names[slot].as_deref().ok_or_else(|| {
                SharedError::invalid_session(format!(
                    "frame {} channel slot {} was dropped without being persisted",
                    self.frame_id, slot
                ))
            })?;

            let buffer = store.load(name)?;
            if buffer.width() != self.width || buffer.height() != self.height {
                return Err(SharedError::invalid_stored_image(format!(
                    "{} is {}x{}, session is {}x{}",
                    name,
                    buffer.width(),
                    buffer.height(),
                    self.width,
                    self.height
                )));
            }
            self.buffers[slot] = Some(buffer);
        }

        self.state = PixelState::Ready;
        debug!("Rehydrated frame {}", self.frame_id);
        Ok(())
    }

    /// Save every channel buffer to `store` and remember where it went
    pub fn persist(&mut self, store: &dyn PixelStore) -> Result<()> {
        if self.state != PixelState::Ready {
            return Err(SharedError::invalid_session(format!(
                "frame {} cannot be persisted in state {:?}",
                self.frame_id, self.state
            )));
        }

        let key = format!("{:08X}", self.frame_id);
        for (slot, buffer) in self.buffers.iter().enumerate() {
            let Some(buffer) = buffer else { continue };
            let channel = self.channels.channel_at(slot).unwrap_or_default();
            let name = store.save(&key, slot, channel, buffer)?;
            self.image_names[slot] = Some(name);
        }

        info!("Persisted frame {} ({} channels)", self.frame_id, self.buffers.len());
        Ok(())
    }

    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }

    pub fn channels(&self) -> &CapturedChannels {
        &self.channels
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Current height; grows at materialization when the device sent more lines than declared
    pub fn height(&self) -> usize {
        self.height
    }

    pub fn declared_height(&self) -> usize {
        self.declared_height
    }

    pub fn strategy(&self) -> SessionStrategy {
        self.strategy
    }

    pub fn slot_policy(&self) -> SlotPolicy {
        self.slot_policy
    }

    /// Buffered lines in arrival order
    pub fn lines(&self) -> &[RawLine] {
        &self.lines
    }

    /// Number of lines received, including retransmissions
    pub fn lines_received(&self) -> usize {
        self.lines_received
    }

    /// Highest line index seen so far
    pub fn max_line(&self) -> Option<u32> {
        self.max_line
    }

    pub fn ranges(&self) -> Option<&ChannelRangeStats> {
        self.ranges.as_ref()
    }

    pub fn state(&self) -> PixelState {
        self.state
    }

    pub fn is_materialized(&self) -> bool {
        self.state != PixelState::Unmaterialized
    }

    /// Whether the session's pixels carry the recombinable grayscale packing
    pub fn is_recombinable(&self) -> bool {
        matches!(self.strategy, SessionStrategy::Buffered)
    }

    /// Pixel buffer of `slot`, if it is currently in memory
    pub fn buffer(&self, slot: usize) -> Option<&PixelBuffer> {
        self.buffers.get(slot).and_then(Option::as_ref)
    }

    /// Name under which `slot` was persisted
    pub fn image_name(&self, slot: usize) -> Option<&str> {
        self.image_names.get(slot).and_then(|name| name.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DirectoryStore;
    use crate::word::{encode, tag_for_channel};
    use tempfile::TempDir;

    fn geometry(channels: Vec<u8>, width: usize, height: usize) -> SessionGeometry {
        SessionGeometry::new(CapturedChannels::new(channels).unwrap(), width, height).unwrap()
    }

    #[test]
    fn test_from_pixels_rejects_overflowing_size() {
        assert!(matches!(
            PixelBuffer::from_pixels(usize::MAX, 2, vec![0; 4]),
            Err(SharedError::InvalidStoredImage(_))
        ));
        assert!(PixelBuffer::from_pixels(2, 2, vec![0; 4]).is_ok());
    }

    fn ramp_line(index: u32, width: usize) -> RawLine {
        let tag = tag_for_channel(0).unwrap();
        RawLine::new(index, (0..width).map(|x| encode(tag, (index as u16) * 100 + x as u16)).collect())
    }

    #[test]
    fn test_session_creation() {
        let session = ImageSession::new(7, &geometry(vec![0, 1], 4, 3), SessionStrategy::Buffered);
        assert_eq!(session.frame_id(), 7);
        assert_eq!(session.channel_count(), 2);
        assert_eq!(session.state(), PixelState::Unmaterialized);
        assert!(session.buffer(0).is_none());
        assert!(session.lines().is_empty());
        assert_eq!(session.max_line(), None);
    }

    #[test]
    fn test_zero_width_rejected() {
        let channels = CapturedChannels::new(vec![0]).unwrap();
        assert!(SessionGeometry::new(channels, 0, 10).is_err());
    }

    #[test]
    fn test_file_line_tracks_max() {
        let mut session = ImageSession::new(0, &geometry(vec![0], 2, 4), SessionStrategy::Buffered);
        session.file_line(ramp_line(3, 2));
        session.file_line(ramp_line(1, 2));
        assert_eq!(session.max_line(), Some(3));
        assert_eq!(session.lines().len(), 2);
        assert_eq!(session.lines()[0].index, 3);
    }

    #[test]
    fn test_pixel_buffer_rows() {
        let mut buffer = PixelBuffer::new(3, 2);
        buffer.write_row(1, &[1, 2, 3, 4]).unwrap();
        assert_eq!(buffer.row(1), Some(&[1, 2, 3][..]));
        assert_eq!(buffer.get(2, 1), Some(3));
        assert_eq!(buffer.get(3, 1), None);

        buffer.write_row(0, &[9]).unwrap();
        assert_eq!(buffer.row(0), Some(&[9, 0, 0][..]));

        assert!(matches!(
            buffer.write_row(2, &[1]),
            Err(AssemblyError::RowOutOfBounds { row: 2, height: 2 })
        ));
        assert!(PixelBuffer::from_pixels(2, 2, vec![0; 3]).is_err());
    }

    #[test]
    fn test_live_preview_renders_immediately() {
        let strategy = SessionStrategy::LivePreview { floor: 0 };
        let mut session = ImageSession::new(1, &geometry(vec![0], 2, 4), strategy);
        assert!(session.is_materialized());
        assert!(!session.is_recombinable());

        session.file_line(ramp_line(2, 2));
        assert!(session.lines().is_empty());
        assert_eq!(session.lines_received(), 1);

        let buffer = session.buffer(0).unwrap();
        // intensity 200 -> 200 >> 4 = 12
        assert_eq!(buffer.get(0, 2), Some(0xFF0C_0C0C));
        assert_eq!(buffer.get(0, 0), Some(0));

        // Materializing a preview session leaves its pixels untouched
        session.materialize();
        assert_eq!(session.buffer(0).unwrap().get(0, 2), Some(0xFF0C_0C0C));
    }

    #[test]
    fn test_dehydrate_requires_persisted_buffers() {
        let mut session = ImageSession::new(2, &geometry(vec![0], 2, 2), SessionStrategy::Buffered);
        session.file_line(ramp_line(0, 2));
        session.materialize();

        assert_eq!(session.dehydrate(), 0);
        assert_eq!(session.state(), PixelState::Ready);
        assert!(session.buffer(0).is_some());
    }

    #[test]
    fn test_dehydrate_rehydrate_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path()).unwrap();

        let mut session = ImageSession::new(3, &geometry(vec![0, 1], 3, 4), SessionStrategy::Buffered);
        for i in 0..4 {
            let words = (0..6).map(|x| encode(7 - (x % 2) as u8, i * 10 + x)).collect();
            session.file_line(RawLine::new(u32::from(i), words));
        }
        session.materialize();
        let original: Vec<PixelBuffer> = (0..2).map(|s| session.buffer(s).unwrap().clone()).collect();

        assert!(session.persist(&store).is_ok());
        assert!(session.image_name(0).is_some());
        assert_eq!(session.dehydrate(), 2);
        assert_eq!(session.state(), PixelState::Dehydrated);
        assert!(session.buffer(0).is_none());

        // A second materialization must not rebuild dropped buffers
        session.materialize();
        assert!(session.buffer(0).is_none());

        session.rehydrate(&store).unwrap();
        assert_eq!(session.state(), PixelState::Ready);
        assert_eq!(session.buffer(0), Some(&original[0]));
        assert_eq!(session.buffer(1), Some(&original[1]));
    }

    #[test]
    fn test_persist_requires_ready() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path()).unwrap();
        let mut session = ImageSession::new(4, &geometry(vec![0], 2, 2), SessionStrategy::Buffered);
        assert!(session.persist(&store).is_err());
    }
}
