/*!
Acquisition state machine and worker loop.

The machine follows the device through its connect / frame / line cycle:

```text
WaitingToConnect -> WaitingForFrame -> WaitingForBytesOrEFrame -> WaitingForFrame ...
                                                               \-> Finished | Aborted
```

Completed frames are materialized on the worker thread and handed to the
consumer through a [`Handoff`]. Protocol violations and transport failures
end the run in `Aborted`; the worker then emits a single
[`AcquisitionEvent::RestartRequested`] and leaves restarting to whoever
supervises it.
*/

use crate::config::AcquisitionConfig;
use crate::transport::{Transport, TransportError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use shared::{ImageSession, Message, RawLine, SessionGeometry, SessionStrategy, SlotPolicy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Acquisition phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionPhase {
    /// Waiting for the device to acknowledge the connection
    WaitingToConnect,
    /// Connected, between frames
    WaitingForFrame,
    /// Collecting the lines of a frame
    WaitingForBytesOrEFrame,
    /// Stopped cleanly
    Finished,
    /// Stopped on a transport failure or protocol violation
    Aborted,
}

impl AcquisitionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, AcquisitionPhase::Finished | AcquisitionPhase::Aborted)
    }
}

/// Notifications sent to the consumer alongside the sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionEvent {
    /// A completed session was published
    ImageAvailable { frame_id: u32 },
    /// The run aborted; `last_phase` is the last phase before the abort
    RestartRequested { last_phase: AcquisitionPhase },
}

/// Consumer side of the worker: completed sessions plus events
#[derive(Debug, Clone)]
pub struct Handoff {
    sessions: Sender<ImageSession>,
    events: Sender<AcquisitionEvent>,
}

impl Handoff {
    pub fn new(sessions: Sender<ImageSession>, events: Sender<AcquisitionEvent>) -> Self {
        Self { sessions, events }
    }

    /// Create a handoff over fresh unbounded channels
    pub fn channel() -> (Self, Receiver<ImageSession>, Receiver<AcquisitionEvent>) {
        let (sessions_tx, sessions_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        (Self::new(sessions_tx, events_tx), sessions_rx, events_rx)
    }

    /// Publish a completed session. Never blocks.
    fn publish(&self, session: ImageSession) -> bool {
        let frame_id = session.frame_id();
        if self.sessions.send(session).is_err() {
            warn!("No consumer attached, dropping frame {}", frame_id);
            return false;
        }
        if self
            .events
            .send(AcquisitionEvent::ImageAvailable { frame_id })
            .is_err()
        {
            warn!("No consumer attached to receive the event for frame {}", frame_id);
        }
        true
    }

    fn request_restart(&self, last_phase: AcquisitionPhase) {
        if self
            .events
            .send(AcquisitionEvent::RestartRequested { last_phase })
            .is_err()
        {
            warn!("No consumer attached to receive the restart request");
        }
    }
}

/// Everything a run needs to build sessions
#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    pub geometry: SessionGeometry,
    pub strategy: SessionStrategy,
    pub slot_policy: SlotPolicy,
    pub poll_interval: Duration,
}

impl AcquisitionSettings {
    pub fn new(geometry: SessionGeometry, strategy: SessionStrategy) -> Self {
        Self {
            geometry,
            strategy,
            slot_policy: SlotPolicy::default(),
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn from_config(config: &AcquisitionConfig) -> anyhow::Result<Self> {
        Ok(Self {
            geometry: config.geometry()?,
            strategy: config.strategy(),
            slot_policy: config.slot_policy,
            poll_interval: config.poll_interval(),
        })
    }
}

/// Counters kept over one run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionStats {
    pub frames_completed: u64,
    pub lines_received: u64,
    pub stray_messages: u64,
    pub frames_discarded: u64,
    pub frames_undelivered: u64,
}

/// The acquisition state machine
pub struct AcquisitionMachine {
    phase: AcquisitionPhase,
    settings: AcquisitionSettings,
    current: Option<ImageSession>,
    next_frame_id: u32,
    stats: AcquisitionStats,
    handoff: Handoff,
}

impl AcquisitionMachine {
    pub fn new(settings: AcquisitionSettings, handoff: Handoff) -> Self {
        Self {
            phase: AcquisitionPhase::WaitingToConnect,
            settings,
            current: None,
            next_frame_id: 0,
            stats: AcquisitionStats::default(),
            handoff,
        }
    }

    /// Continue frame numbering from a previous run
    pub fn starting_at(mut self, frame_id: u32) -> Self {
        self.next_frame_id = frame_id;
        self
    }

    pub fn phase(&self) -> AcquisitionPhase {
        self.phase
    }

    pub fn stats(&self) -> AcquisitionStats {
        self.stats
    }

    /// Id the next frame will get
    pub fn next_frame_id(&self) -> u32 {
        self.next_frame_id
    }

    pub fn poll_interval(&self) -> Duration {
        self.settings.poll_interval
    }

    /// Apply one message and return the resulting phase
    pub fn process_message(&mut self, message: Message) -> AcquisitionPhase {
        use AcquisitionPhase::*;

        match (self.phase, message) {
            (Finished | Aborted, message) => {
                debug!("Ignoring {} after the run ended", message.name());
            }

            (_, Message::Error(reason)) => {
                self.abort(&format!("device reported an error: {}", reason));
            }

            (WaitingToConnect, Message::ConnectAck) => {
                info!("🔒 Device acknowledged the connection");
                self.phase = WaitingForFrame;
            }
            // A restarted run can join a stream that never repeats its acknowledgement
            (WaitingToConnect, Message::FrameStart) => {
                info!("🔒 Device already streaming, joining at the next frame");
                self.start_frame();
            }
            (WaitingToConnect, message) => {
                debug!("Ignoring stray {} before the first frame", message.name());
                self.stats.stray_messages += 1;
            }

            (WaitingForFrame, Message::FrameStart) => self.start_frame(),
            (WaitingForFrame, Message::ConnectAck) => {
                debug!("Repeated connection acknowledgement");
            }
            (WaitingForFrame, message) => {
                debug!("Ignoring stray {} between frames", message.name());
                self.stats.stray_messages += 1;
            }

            (WaitingForBytesOrEFrame, Message::DataLine(line)) => self.file_line(line),
            (WaitingForBytesOrEFrame, Message::EndOfFrame) => self.finish_frame(),
            (WaitingForBytesOrEFrame, message) => {
                self.abort(&format!("unexpected {} inside a frame", message.name()));
            }
        }

        self.phase
    }

    /// The transport failed; the run cannot continue
    pub fn transport_failed(&mut self, error: &TransportError) -> AcquisitionPhase {
        self.abort(&format!("transport failure: {}", error));
        self.phase
    }

    /// Stop cleanly, on end of stream or external cancellation
    pub fn close(&mut self) -> AcquisitionPhase {
        if self.phase.is_terminal() {
            return self.phase;
        }
        if let Some(session) = self.current.take() {
            warn!(
                "⚠️ Incomplete frame {} at shutdown: {} lines discarded",
                session.frame_id(),
                session.lines_received()
            );
            self.stats.frames_discarded += 1;
        }
        self.phase = AcquisitionPhase::Finished;
        self.phase
    }

    fn abort(&mut self, reason: &str) {
        if self.phase.is_terminal() {
            return;
        }
        if let Some(session) = self.current.take() {
            warn!(
                "Discarding partial frame {} ({} lines)",
                session.frame_id(),
                session.lines_received()
            );
            self.stats.frames_discarded += 1;
        }
        error!("❌ Acquisition aborted in {:?}: {}", self.phase, reason);
        self.phase = AcquisitionPhase::Aborted;
    }

    fn start_frame(&mut self) {
        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);

        debug!("📦 Frame {} started", frame_id);
        let session = ImageSession::new(frame_id, &self.settings.geometry, self.settings.strategy)
            .with_slot_policy(self.settings.slot_policy);
        self.current = Some(session);
        self.phase = AcquisitionPhase::WaitingForBytesOrEFrame;
    }

    fn file_line(&mut self, line: RawLine) {
        if let Some(session) = self.current.as_mut() {
            session.file_line(line);
            self.stats.lines_received += 1;
        }
    }

    fn finish_frame(&mut self) {
        self.phase = AcquisitionPhase::WaitingForFrame;
        let Some(mut session) = self.current.take() else {
            return;
        };

        session.materialize();
        info!(
            "✅ Frame {} complete: {} lines, {}x{}",
            session.frame_id(),
            session.lines_received(),
            session.width(),
            session.height()
        );
        self.stats.frames_completed += 1;

        if !self.handoff.publish(session) {
            self.stats.frames_undelivered += 1;
        }
    }
}

/// Summary of a finished worker run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub phase: AcquisitionPhase,
    pub last_phase: AcquisitionPhase,
    pub stats: AcquisitionStats,
    pub next_frame_id: u32,
}

/// Shuts the transport down when dropped, whichever way the loop exits
struct TransportGuard<T: Transport>(T);

impl<T: Transport> Drop for TransportGuard<T> {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

/// Drives an [`AcquisitionMachine`] from a [`Transport`] on its own thread
pub struct AcquisitionWorker<T: Transport> {
    transport: T,
    machine: AcquisitionMachine,
    running: Arc<AtomicBool>,
}

impl<T: Transport + 'static> AcquisitionWorker<T> {
    pub fn new(transport: T, machine: AcquisitionMachine, running: Arc<AtomicBool>) -> Self {
        Self {
            transport,
            machine,
            running,
        }
    }

    /// Get a reference to the running flag for external control
    pub fn get_running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run the loop on a dedicated thread
    pub fn spawn(self) -> std::io::Result<JoinHandle<RunReport>> {
        thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || self.run())
    }

    /// Run until the machine reaches a terminal phase or the running flag is cleared
    pub fn run(self) -> RunReport {
        let Self {
            transport,
            mut machine,
            running,
        } = self;
        let mut transport = TransportGuard(transport);
        let poll_interval = machine.poll_interval();
        let mut last_phase = machine.phase();

        info!("🚀 Acquisition worker started");

        if let Err(e) = transport.0.connect() {
            machine.transport_failed(&e);
        }

        while running.load(Ordering::SeqCst) && !machine.phase().is_terminal() {
            last_phase = machine.phase();

            match transport.0.next_message(poll_interval) {
                Ok(Some(message)) => {
                    machine.process_message(message);
                }
                Ok(None) => {}
                Err(TransportError::Closed) => {
                    info!("Transport closed");
                    machine.close();
                }
                Err(e) => {
                    machine.transport_failed(&e);
                }
            }

            thread::yield_now();
        }

        if !machine.phase().is_terminal() {
            info!("🛑 Acquisition cancelled");
            machine.close();
        }

        drop(transport);

        let phase = machine.phase();
        if phase == AcquisitionPhase::Aborted {
            machine.handoff.request_restart(last_phase);
        }

        let stats = machine.stats();
        info!("📊 Acquisition worker final stats:");
        info!("   Final phase: {:?}", phase);
        info!("   Frames completed: {}", stats.frames_completed);
        info!("   Lines received: {}", stats.lines_received);
        info!("   Stray messages: {}", stats.stray_messages);
        info!("   Frames discarded: {}", stats.frames_discarded);
        if stats.frames_undelivered > 0 {
            warn!("   Frames undelivered: {}", stats.frames_undelivered);
        }

        RunReport {
            phase,
            last_phase,
            stats,
            next_frame_id: machine.next_frame_id(),
        }
    }
}
