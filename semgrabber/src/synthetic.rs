/*!
Synthetic scan generator.

Produces wire-encoded frames that look like a real scan: every slot gets its
own test pattern, and each frame retransmits one line and skips another so
the jitter correction has something to do. The bytes go through the same
[`WireDecoder`] as real traffic.
*/

use crate::transport::{Transport, TransportError};
use shared::word::{encode, tag_for_channel};
use shared::{Message, RawLine, SessionGeometry, WireDecoder, WireError};
use std::io::Write;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

/// Sample value for one pixel of the test pattern
fn pattern(slot: usize, x: usize, y: usize, width: usize, height: usize, frame: u32) -> u16 {
    let shift = frame as usize * 8;
    let value = match slot % 3 {
        // Diagonal ramp scrolling one step per frame
        0 => ((x + y + shift) % (width + height)) as f32 / (width + height) as f32,
        // Concentric rings around the raster centre
        1 => {
            let dx = x as f32 - width as f32 / 2.0;
            let dy = y as f32 - height as f32 / 2.0;
            let r = (dx * dx + dy * dy).sqrt();
            0.5 + 0.5 * (r * 0.2 - frame as f32 * 0.3).sin()
        }
        // Checkerboard
        _ => {
            if ((x / 8) + (y / 8)) % 2 == 0 {
                0.8
            } else {
                0.2
            }
        }
    };
    // Keep clear of both rails so auto-contrast has a real range to stretch
    (300.0 + value * 3000.0) as u16
}

/// Line indices sent for one frame: line 1 is retransmitted and line 3 is lost
fn line_order(height: usize) -> Vec<u32> {
    let mut order = Vec::with_capacity(height + 1);
    for y in 0..height as u32 {
        if y == 3 && height > 5 {
            continue;
        }
        order.push(y);
        if y == 1 {
            order.push(y);
        }
    }
    order
}

/// One line of interleaved words for `geometry`
pub fn synthetic_line(geometry: &SessionGeometry, index: u32, frame: u32) -> RawLine {
    let count = geometry.channel_count();
    let mut words = Vec::with_capacity(geometry.width * count);
    for x in 0..geometry.width {
        for (slot, &channel) in geometry.channels.as_slice().iter().enumerate() {
            let tag = tag_for_channel(channel).unwrap_or(0);
            let intensity = pattern(slot, x, index as usize, geometry.width, geometry.height, frame);
            words.push(encode(tag, intensity));
        }
    }
    RawLine::new(index, words)
}

/// Messages making up one complete frame
pub fn synthetic_frame(geometry: &SessionGeometry, frame: u32) -> Vec<Message> {
    let mut messages = vec![Message::FrameStart];
    messages.extend(
        line_order(geometry.height)
            .into_iter()
            .map(|index| Message::DataLine(synthetic_line(geometry, index, frame))),
    );
    messages.push(Message::EndOfFrame);
    messages
}

/// Wire bytes for one complete frame
pub fn synthetic_frame_bytes(geometry: &SessionGeometry, frame: u32) -> Result<Vec<u8>, WireError> {
    let mut bytes = Vec::new();
    for message in synthetic_frame(geometry, frame) {
        bytes.extend_from_slice(&message.encode()?);
    }
    Ok(bytes)
}

/// Write a replayable dump: a connect acknowledgement followed by `frames` frames
pub fn write_recording<P: AsRef<Path>>(
    path: P,
    geometry: &SessionGeometry,
    frames: u32,
) -> anyhow::Result<()> {
    let file = std::fs::File::create(path.as_ref())?;
    let mut writer = std::io::BufWriter::new(file);
    writer.write_all(&Message::ConnectAck.encode()?)?;
    for frame in 0..frames {
        writer.write_all(&synthetic_frame_bytes(geometry, frame)?)?;
    }
    writer.flush()?;
    info!("🧪 Recorded {} synthetic frames to {}", frames, path.as_ref().display());
    Ok(())
}

/// Transport generating frames at a fixed interval
pub struct SyntheticTransport {
    geometry: SessionGeometry,
    frame_interval: Duration,
    frame_limit: Option<u32>,
    decoder: WireDecoder,
    frames_generated: u32,
    last_frame: Option<Instant>,
}

impl SyntheticTransport {
    pub fn new(geometry: SessionGeometry, frame_interval: Duration, frame_limit: Option<u32>) -> Self {
        Self {
            geometry,
            frame_interval,
            frame_limit,
            decoder: WireDecoder::new(),
            frames_generated: 0,
            last_frame: None,
        }
    }
}

impl Transport for SyntheticTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        info!("🧪 Starting synthetic scan generator");
        self.decoder.push(&Message::ConnectAck.encode()?);
        Ok(())
    }

    fn next_message(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        if let Some(message) = self.decoder.next_message() {
            return Ok(Some(message?));
        }
        if self.frame_limit.is_some_and(|limit| self.frames_generated >= limit) {
            return Err(TransportError::Closed);
        }

        if let Some(last) = self.last_frame {
            let elapsed = last.elapsed();
            if elapsed < self.frame_interval {
                thread::sleep(timeout.min(self.frame_interval - elapsed));
                return Ok(None);
            }
        }

        let bytes = synthetic_frame_bytes(&self.geometry, self.frames_generated)?;
        self.decoder.push(&bytes);
        self.frames_generated += 1;
        self.last_frame = Some(Instant::now());

        if self.frames_generated % 10 == 0 {
            info!("🧪 Generated {} synthetic frames", self.frames_generated);
        }

        Ok(self.decoder.next_message().transpose()?)
    }

    fn shutdown(&mut self) {
        info!("🧪 Synthetic generator stopped after {} frames", self.frames_generated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ReaderTransport;
    use shared::word::{intensity_of, translate_tag, tag_of};
    use shared::CapturedChannels;

    fn geometry(channels: Vec<u8>, width: usize, height: usize) -> SessionGeometry {
        SessionGeometry::new(CapturedChannels::new(channels).unwrap(), width, height).unwrap()
    }

    #[test]
    fn test_line_order_has_retransmission_and_gap() {
        assert_eq!(line_order(8), vec![0, 1, 1, 2, 4, 5, 6, 7]);
        assert_eq!(line_order(3), vec![0, 1, 1, 2]);
    }

    #[test]
    fn test_words_carry_configured_channels() {
        let geometry = geometry(vec![2, 5], 4, 6);
        let line = synthetic_line(&geometry, 2, 0);
        assert_eq!(line.words.len(), 8);
        for (i, &word) in line.words.iter().enumerate() {
            let expected = if i % 2 == 0 { 2 } else { 5 };
            assert_eq!(translate_tag(tag_of(word)), Some(expected));
            let intensity = intensity_of(word);
            assert!((300..=3300).contains(&intensity));
        }
    }

    #[test]
    fn test_transport_respects_frame_limit() {
        let geometry = geometry(vec![0], 4, 4);
        let mut transport = SyntheticTransport::new(geometry.clone(), Duration::ZERO, Some(2));
        transport.connect().unwrap();

        let mut messages = Vec::new();
        loop {
            match transport.next_message(Duration::from_millis(10)) {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => {}
                Err(TransportError::Closed) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        let per_frame = synthetic_frame(&geometry, 0).len();
        assert_eq!(messages.len(), 1 + 2 * per_frame);
        assert_eq!(messages[0], Message::ConnectAck);
        assert_eq!(messages[1], Message::FrameStart);
        assert_eq!(messages.last(), Some(&Message::EndOfFrame));
    }

    #[test]
    fn test_recording_replays() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("scan.bin");
        let geometry = geometry(vec![0, 1], 3, 4);
        write_recording(&path, &geometry, 2).unwrap();

        let mut replay = ReaderTransport::open(&path).unwrap();
        let mut frames = 0;
        loop {
            match replay.next_message(Duration::from_millis(10)) {
                Ok(Some(Message::EndOfFrame)) => frames += 1,
                Ok(_) => {}
                Err(TransportError::Closed) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(frames, 2);
    }
}
