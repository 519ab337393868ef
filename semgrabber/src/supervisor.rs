/*!
Supervised acquisition.

Runs the acquisition worker, feeds its sessions and events to an
[`ImageConsumer`] and starts a fresh run with a new transport whenever a run
ends in `Aborted`, up to a configured number of restarts.
*/

use crate::acquisition::{
    AcquisitionEvent, AcquisitionMachine, AcquisitionPhase, AcquisitionSettings, AcquisitionWorker,
    Handoff, RunReport,
};
use crate::consumer::ImageConsumer;
use crate::transport::Transport;
use anyhow::{anyhow, Result};
use crossbeam_channel::select;
use shared::ImageSession;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Outcome of a supervised acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSummary {
    pub runs: u32,
    pub restarts: u32,
    pub final_phase: AcquisitionPhase,
    pub frames_completed: u64,
}

pub struct Supervisor<F> {
    make_transport: F,
    settings: AcquisitionSettings,
    running: Arc<AtomicBool>,
    max_restarts: u32,
    restart_delay: Duration,
}

impl<F, T> Supervisor<F>
where
    F: FnMut() -> Result<T>,
    T: Transport + 'static,
{
    pub fn new(make_transport: F, settings: AcquisitionSettings, running: Arc<AtomicBool>) -> Self {
        Self {
            make_transport,
            settings,
            running,
            max_restarts: 0,
            restart_delay: Duration::ZERO,
        }
    }

    pub fn with_restarts(mut self, max_restarts: u32, restart_delay: Duration) -> Self {
        self.max_restarts = max_restarts;
        self.restart_delay = restart_delay;
        self
    }

    /// Run acquisitions until one ends without asking for a restart
    pub fn run(&mut self, consumer: &mut ImageConsumer) -> Result<SupervisorSummary> {
        let mut summary = SupervisorSummary {
            runs: 0,
            restarts: 0,
            final_phase: AcquisitionPhase::WaitingToConnect,
            frames_completed: 0,
        };
        let mut next_frame_id = 0;

        loop {
            let transport = (self.make_transport)()?;
            summary.runs += 1;

            let (report, restart) = self.run_once(transport, next_frame_id, consumer)?;
            next_frame_id = report.next_frame_id;
            summary.final_phase = report.phase;
            summary.frames_completed += report.stats.frames_completed;

            let Some(last_phase) = restart else {
                return Ok(summary);
            };
            if !self.running.load(Ordering::SeqCst) {
                return Ok(summary);
            }
            if summary.restarts >= self.max_restarts {
                error!(
                    "Giving up after {} restarts (last aborted in {:?})",
                    summary.restarts, last_phase
                );
                return Ok(summary);
            }

            summary.restarts += 1;
            warn!(
                "🔄 Restarting acquisition ({}/{}) after abort in {:?}",
                summary.restarts, self.max_restarts, last_phase
            );
            self.pause();
        }
    }

    fn run_once(
        &mut self,
        transport: T,
        first_frame_id: u32,
        consumer: &mut ImageConsumer,
    ) -> Result<(RunReport, Option<AcquisitionPhase>)> {
        let (handoff, sessions, events) = Handoff::channel();
        let machine = AcquisitionMachine::new(self.settings.clone(), handoff).starting_at(first_frame_id);
        let handle = AcquisitionWorker::new(transport, machine, Arc::clone(&self.running)).spawn()?;

        // Both channels disconnect together when the worker drops its handoff
        let mut restart = None;
        loop {
            select! {
                recv(sessions) -> session => match session {
                    Ok(session) => Self::deliver(session, consumer),
                    Err(_) => break,
                },
                recv(events) -> event => match event {
                    Ok(event) => Self::dispatch(event, consumer, &mut restart),
                    Err(_) => break,
                },
            }
        }

        let report = handle
            .join()
            .map_err(|_| anyhow!("Acquisition worker panicked"))?;
        for session in sessions.try_iter() {
            Self::deliver(session, consumer);
        }
        for event in events.try_iter() {
            Self::dispatch(event, consumer, &mut restart);
        }

        info!("Acquisition run ended in {:?}", report.phase);
        Ok((report, restart))
    }

    fn deliver(session: ImageSession, consumer: &mut ImageConsumer) {
        if let Err(e) = consumer.handle_session(session) {
            error!("Failed to handle frame: {:#}", e);
        }
    }

    fn dispatch(
        event: AcquisitionEvent,
        consumer: &mut ImageConsumer,
        restart: &mut Option<AcquisitionPhase>,
    ) {
        if let AcquisitionEvent::RestartRequested { last_phase } = event {
            *restart = Some(last_phase);
        }
        consumer.handle_event(&event);
    }

    /// Wait out the restart delay, returning early when cancelled
    fn pause(&self) {
        let deadline = Instant::now() + self.restart_delay;
        while self.running.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(self.settings.poll_interval.min(deadline - Instant::now()));
        }
    }
}
