/*!
Consumer side of the acquisition pipeline.

Completed sessions are persisted, paired into stereo composites when asked
to, and kept in a short history. Sessions in the history are dehydrated, so
only their on-disk images hold the pixels.
*/

use crate::acquisition::AcquisitionEvent;
use crate::config::OutputConfig;
use anyhow::{Context, Result};
use shared::{DirectoryStore, ImageSession, PixelStore, StereoImageSession};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Counters reported when the consumer finishes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub frames_received: u64,
    pub frames_saved: u64,
    pub stereo_pairs: u64,
    pub images_announced: u64,
    pub restarts_requested: u64,
}

pub struct ImageConsumer {
    store: Option<DirectoryStore>,
    stereo_pairs: bool,
    history_len: usize,
    pending_left: Option<ImageSession>,
    history: VecDeque<ImageSession>,
    stats: ConsumerStats,
}

impl ImageConsumer {
    /// `store` is `None` when images are not being saved
    pub fn new(store: Option<DirectoryStore>, output: &OutputConfig) -> Self {
        Self {
            store,
            stereo_pairs: output.stereo_pairs,
            history_len: output.history_len,
            pending_left: None,
            history: VecDeque::new(),
            stats: ConsumerStats::default(),
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Recently completed sessions, oldest first
    pub fn history(&self) -> impl Iterator<Item = &ImageSession> {
        self.history.iter()
    }

    pub fn handle_event(&mut self, event: &AcquisitionEvent) {
        match event {
            AcquisitionEvent::ImageAvailable { frame_id } => {
                debug!("Image available: frame {}", frame_id);
                self.stats.images_announced += 1;
            }
            AcquisitionEvent::RestartRequested { last_phase } => {
                warn!("Acquisition requested a restart (last phase {:?})", last_phase);
                self.stats.restarts_requested += 1;
            }
        }
    }

    /// Take ownership of a completed session
    pub fn handle_session(&mut self, mut session: ImageSession) -> Result<()> {
        self.stats.frames_received += 1;
        info!(
            "🖼️ Frame {:08X}: {} channels, {}x{} from {} lines",
            session.frame_id(),
            session.channel_count(),
            session.width(),
            session.height(),
            session.lines_received()
        );

        if let Some(store) = &self.store {
            session
                .persist(store)
                .with_context(|| format!("Failed to save frame {}", session.frame_id()))?;
            self.stats.frames_saved += 1;
        }

        if !self.stereo_pairs {
            self.retain(session);
            return Ok(());
        }

        if !session.is_recombinable() {
            warn!("Frame {} is a preview image, not pairing it", session.frame_id());
            self.retain(session);
            return Ok(());
        }

        match self.pending_left.take() {
            None => {
                session.dehydrate();
                self.pending_left = Some(session);
                Ok(())
            }
            Some(left) => self.write_pair(left, session),
        }
    }

    fn write_pair(&mut self, mut left: ImageSession, right: ImageSession) -> Result<()> {
        if let Some(store) = &self.store {
            left.rehydrate(store)
                .with_context(|| format!("Failed to reload frame {}", left.frame_id()))?;
        }

        let result = match StereoImageSession::knit(&left, &right) {
            Ok(stereo) => {
                if let Some(store) = &self.store {
                    let key = format!(
                        "stereo_{:08X}_{:08X}",
                        stereo.left().frame_id(),
                        stereo.right().frame_id()
                    );
                    for (slot, &channel) in stereo.channels().iter().enumerate() {
                        if let Some(buffer) = stereo.buffer(slot) {
                            store.save(&key, slot, channel, buffer)?;
                        }
                    }
                }
                info!(
                    "🕶️ Stereo pair: frames {} and {} ({}x{})",
                    stereo.left().frame_id(),
                    stereo.right().frame_id(),
                    stereo.width(),
                    stereo.height()
                );
                self.stats.stereo_pairs += 1;
                Ok(())
            }
            Err(e) => {
                warn!("Cannot pair frames {} and {}: {}", left.frame_id(), right.frame_id(), e);
                Ok(())
            }
        };

        self.retain(left);
        self.retain(right);
        result
    }

    fn retain(&mut self, mut session: ImageSession) {
        session.dehydrate();
        self.history.push_back(session);
        while self.history.len() > self.history_len {
            self.history.pop_front();
        }
    }

    /// Flush an unpaired frame and log the final counters
    pub fn finish(&mut self) -> ConsumerStats {
        if let Some(left) = self.pending_left.take() {
            info!("Frame {} has no stereo partner", left.frame_id());
            self.retain(left);
        }

        info!("📊 Consumer final stats:");
        info!("   Frames received: {}", self.stats.frames_received);
        info!("   Frames saved: {}", self.stats.frames_saved);
        info!("   Stereo pairs: {}", self.stats.stereo_pairs);
        info!("   Restarts requested: {}", self.stats.restarts_requested);
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::AcquisitionPhase;
    use shared::word::{encode, tag_for_channel};
    use shared::{CapturedChannels, PixelState, RawLine, SessionGeometry, SessionStrategy};
    use tempfile::TempDir;

    fn session(frame_id: u32, strategy: SessionStrategy) -> ImageSession {
        let geometry =
            SessionGeometry::new(CapturedChannels::new(vec![0, 1]).unwrap(), 3, 4).unwrap();
        let mut session = ImageSession::new(frame_id, &geometry, strategy);
        let tags = [tag_for_channel(0).unwrap(), tag_for_channel(1).unwrap()];
        for y in 0..4u16 {
            let words = (0..6).map(|i| encode(tags[i % 2], 200 * y + i as u16)).collect();
            session.file_line(RawLine::new(u32::from(y), words));
        }
        session.materialize();
        session
    }

    fn output(stereo_pairs: bool, history_len: usize) -> OutputConfig {
        OutputConfig {
            stereo_pairs,
            history_len,
            ..OutputConfig::default()
        }
    }

    #[test]
    fn test_sessions_saved_and_dehydrated() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path()).unwrap();
        let mut consumer = ImageConsumer::new(Some(store.clone()), &output(false, 2));

        for id in 0..3 {
            consumer.handle_session(session(id, SessionStrategy::Buffered)).unwrap();
        }

        let ids: Vec<u32> = consumer.history().map(ImageSession::frame_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(consumer.history().all(|s| s.state() == PixelState::Dehydrated));
        assert!(store.header("00000002_ch1").is_ok());
        assert_eq!(consumer.stats().frames_saved, 3);
    }

    #[test]
    fn test_without_store_sessions_stay_in_memory() {
        let mut consumer = ImageConsumer::new(None, &output(false, 4));
        consumer.handle_session(session(0, SessionStrategy::Buffered)).unwrap();

        let kept = consumer.history().next().unwrap();
        assert_eq!(kept.state(), PixelState::Ready);
        assert!(kept.buffer(0).is_some());
    }

    #[test]
    fn test_consecutive_frames_paired() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path()).unwrap();
        let mut consumer = ImageConsumer::new(Some(store.clone()), &output(true, 8));

        consumer.handle_session(session(4, SessionStrategy::Buffered)).unwrap();
        assert_eq!(consumer.stats().stereo_pairs, 0);
        consumer.handle_session(session(5, SessionStrategy::Buffered)).unwrap();
        assert_eq!(consumer.stats().stereo_pairs, 1);

        let name = "stereo_00000004_00000005_ch0";
        let stereo = store.load(name).unwrap();
        assert_eq!((stereo.width(), stereo.height()), (3, 4));
        // Same content on both sides: red lane equals blue lane
        let pixel = stereo.get(0, 0).unwrap();
        assert_eq!((pixel >> 16) & 0xFF, pixel & 0xFF);
        assert_eq!(pixel >> 24, 0xFF);

        let stats = consumer.finish();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(consumer.history().count(), 2);
    }

    #[test]
    fn test_preview_frames_not_paired() {
        let mut consumer = ImageConsumer::new(None, &output(true, 8));
        consumer
            .handle_session(session(0, SessionStrategy::LivePreview { floor: 0 }))
            .unwrap();
        consumer
            .handle_session(session(1, SessionStrategy::LivePreview { floor: 0 }))
            .unwrap();
        assert_eq!(consumer.stats().stereo_pairs, 0);
        assert_eq!(consumer.history().count(), 2);
    }

    #[test]
    fn test_events_counted() {
        let mut consumer = ImageConsumer::new(None, &output(false, 1));
        consumer.handle_event(&AcquisitionEvent::ImageAvailable { frame_id: 3 });
        consumer.handle_event(&AcquisitionEvent::RestartRequested {
            last_phase: AcquisitionPhase::WaitingForFrame,
        });
        let stats = consumer.stats();
        assert_eq!(stats.images_announced, 1);
        assert_eq!(stats.restarts_requested, 1);
    }
}
