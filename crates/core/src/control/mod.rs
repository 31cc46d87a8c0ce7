//! Output control over an already configured mode, and the single worker
//! thread that serialises every request touching the device session.

use std::{
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc, Mutex, MutexGuard, TryLockError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    device::{Channel, Command},
    error::StateError,
    sequencer::{DeviceSequencer, DeviceSession, ModeReport, SessionState, Step, StepOutcome},
    ModalError, Result,
};

/// Start, pause and stop for the mode currently loaded on the generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct OutputController;

impl OutputController {
    pub fn new() -> Self {
        Self
    }

    /// Switches both outputs on without touching the configuration.
    pub fn start(&self, session: &mut DeviceSession) -> Result<()> {
        Self::require_mode(session)?;
        if session.state() == SessionState::OutputEnabled {
            tracing::debug!("output already running");
            return Ok(());
        }
        session.execute(Step::Start, |dev| {
            for channel in Channel::BOTH {
                dev.write(&Command::Output(channel, true))?;
            }
            Ok(())
        })?;
        session.set_output(true);
        session.set_state(SessionState::OutputEnabled);
        tracing::info!("output started");
        Ok(())
    }

    /// Switches both outputs off, keeping the configuration for a later start.
    pub fn pause(&self, session: &mut DeviceSession) -> Result<()> {
        Self::require_mode(session)?;
        session.execute(Step::Pause, |dev| {
            for channel in Channel::BOTH {
                dev.write(&Command::Output(channel, false))?;
            }
            Ok(())
        })?;
        session.set_output(false);
        session.set_state(SessionState::Paused);
        tracing::info!("output paused");
        Ok(())
    }

    /// Pauses a running output or starts a paused one. Returns whether the
    /// output is running afterwards.
    pub fn toggle(&self, session: &mut DeviceSession) -> Result<bool> {
        if session.state() == SessionState::OutputEnabled {
            self.pause(session)?;
            Ok(false)
        } else {
            self.start(session)?;
            Ok(true)
        }
    }

    /// Outputs off, tracking off, and back to `Connected` with no mode.
    pub fn stop(&self, session: &mut DeviceSession) -> Result<Vec<StepOutcome>> {
        let steps = session.release_mode()?;
        tracing::info!("output stopped");
        Ok(steps)
    }

    fn require_mode(session: &DeviceSession) -> Result<()> {
        session.ensure_connected()?;
        if session.state().has_mode() && session.mode().is_some() {
            Ok(())
        } else {
            Err(StateError::NoModeConfigured.into())
        }
    }
}

/// The device session behind the lock that serialises all command sequences.
pub type SharedSession = Arc<Mutex<DeviceSession>>;

/// Puts a freshly connected session behind the shared lock.
pub fn share(session: DeviceSession) -> SharedSession {
    Arc::new(Mutex::new(session))
}

/// Locks the session, mapping a poisoned lock to [`StateError::Poisoned`].
pub fn lock_session(session: &SharedSession) -> Result<MutexGuard<'_, DeviceSession>> {
    session.lock().map_err(|_| StateError::Poisoned.into())
}

/// Point-in-time view of a session for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub mode_id: Option<u8>,
    pub mode_name: Option<String>,
    pub output_enabled: bool,
}

impl SessionStatus {
    fn of(session: &DeviceSession) -> Self {
        Self {
            state: session.state(),
            mode_id: session.mode().map(|mode| mode.id),
            mode_name: session.mode().map(|mode| mode.name.clone()),
            output_enabled: session.output_enabled(),
        }
    }
}

/// Work for the control thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    SelectMode(u8),
    Start,
    Pause,
    Toggle,
    Stop,
    Shutdown,
}

/// What the control thread reports back to the front end.
#[derive(Debug)]
pub enum Event {
    /// A mode switch has begun.
    Configuring { mode_id: u8 },
    ModeReady(Box<ModeReport>),
    OutputChanged { running: bool },
    Stopped(Vec<StepOutcome>),
    Failed { request: Request, error: ModalError },
    /// The session has been closed; no further events follow.
    Closed,
}

/// Owns the device session on a dedicated thread.
///
/// Front ends send [`Request`]s and read [`Event`]s; they never touch the
/// session directly, so long uploads never block the input loop and no two
/// command sequences interleave.
#[derive(Debug)]
pub struct ControlWorker {
    requests: Sender<Request>,
    events: Receiver<Event>,
    session: SharedSession,
    handle: Option<JoinHandle<()>>,
}

impl ControlWorker {
    /// Moves `session` onto a new control thread driven by `sequencer`.
    pub fn spawn(sequencer: DeviceSequencer, session: DeviceSession) -> Self {
        let session = share(session);
        let (request_tx, request_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let shared = session.clone();
        let handle = thread::Builder::new()
            .name("modal-control".to_string())
            .spawn(move || run(sequencer, shared, request_rx, event_tx))
            .ok();
        if handle.is_none() {
            tracing::error!("could not spawn control thread");
        }

        Self {
            requests: request_tx,
            events: event_rx,
            session,
            handle,
        }
    }

    /// Queues a request. Fails once the control thread has exited.
    pub fn send(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| StateError::NotConnected.into())
    }

    /// Waits for the next event. `None` once the worker has gone away.
    pub fn recv(&self) -> Option<Event> {
        self.events.recv().ok()
    }

    /// Like [`ControlWorker::recv`], giving up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Next event if one is already waiting.
    pub fn try_recv(&self) -> Option<Event> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Current session status, or `None` while a command sequence holds the
    /// session.
    pub fn status(&self) -> Option<SessionStatus> {
        match self.session.try_lock() {
            Ok(session) => Some(SessionStatus::of(&session)),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(poisoned)) => Some(SessionStatus::of(&poisoned.into_inner())),
        }
    }

    /// Closes the session and joins the worker thread.
    pub fn shutdown(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        let _ = self.requests.send(Request::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("control thread panicked");
            }
        }
    }
}

impl Drop for ControlWorker {
    fn drop(&mut self) {
        self.finish();
    }
}

fn run(
    sequencer: DeviceSequencer,
    session: SharedSession,
    requests: Receiver<Request>,
    events: Sender<Event>,
) {
    let controller = OutputController::new();
    tracing::debug!("control thread started");

    for request in requests.iter() {
        let outcome = match request {
            Request::Shutdown => break,
            Request::SelectMode(mode_id) => {
                let _ = events.send(Event::Configuring { mode_id });
                lock_session(&session).and_then(|mut guard| {
                    sequencer
                        .switch_mode(&mut guard, mode_id)
                        .map(|report| Event::ModeReady(Box::new(report)))
                })
            }
            Request::Start => lock_session(&session).and_then(|mut guard| {
                controller
                    .start(&mut guard)
                    .map(|()| Event::OutputChanged { running: true })
            }),
            Request::Pause => lock_session(&session).and_then(|mut guard| {
                controller
                    .pause(&mut guard)
                    .map(|()| Event::OutputChanged { running: false })
            }),
            Request::Toggle => lock_session(&session).and_then(|mut guard| {
                controller
                    .toggle(&mut guard)
                    .map(|running| Event::OutputChanged { running })
            }),
            Request::Stop => {
                lock_session(&session).and_then(|mut guard| controller.stop(&mut guard).map(Event::Stopped))
            }
        };

        let event = outcome.unwrap_or_else(|error| {
            tracing::warn!(?request, %error, "request failed");
            Event::Failed { request, error }
        });
        if events.send(event).is_err() {
            break;
        }
    }

    match lock_session(&session) {
        Ok(mut guard) => {
            if let Err(err) = guard.close() {
                tracing::warn!(error = %err, "closing session failed");
            }
        }
        Err(err) => tracing::error!(error = %err, "cannot close session"),
    }
    let _ = events.send(Event::Closed);
    tracing::debug!("control thread finished");
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use super::*;
    use crate::{
        catalog::{Mode, ModeCatalog, Polarity},
        config::{DeviceConfig, OutputConfig},
        device::SimulatedTransport,
        waveform::WaveformLoader,
    };

    const WAIT: Duration = Duration::from_secs(10);

    fn sequencer(dir: &Path) -> DeviceSequencer {
        for name in ["a.dat", "b.dat"] {
            let text: String = (0..16)
                .map(|i| format!("{} {}\n", i as f64 * 0.1, (i as f64 * 0.4).cos()))
                .collect();
            fs::write(dir.join(name), text).unwrap();
        }
        let modes = vec![
            Mode::new(1, "Forward", ("a.dat", "b.dat"), (Polarity::Normal, Polarity::Inverted)),
            Mode::new(3, "Backward", ("a.dat", "b.dat"), (Polarity::Inverted, Polarity::Normal)),
        ];
        DeviceSequencer::with_parts(
            ModeCatalog::from_modes(modes, dir).unwrap(),
            WaveformLoader::default(),
            DeviceConfig {
                display_status: false,
                ..DeviceConfig::default()
            },
            OutputConfig::default(),
        )
    }

    fn connected(dir: &Path) -> (SimulatedTransport, DeviceSequencer, DeviceSession) {
        let sequencer = sequencer(dir);
        let sim = SimulatedTransport::new();
        let session = sequencer.connect(Box::new(sim.clone())).unwrap();
        sim.clear_transcript();
        (sim, sequencer, session)
    }

    #[test]
    fn start_without_mode_is_a_state_error() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, _sequencer, mut session) = connected(dir.path());
        let controller = OutputController::new();

        let err = controller.start(&mut session).unwrap_err();
        assert!(matches!(err, ModalError::State(StateError::NoModeConfigured)));
        assert!(matches!(
            controller.pause(&mut session).unwrap_err(),
            ModalError::State(StateError::NoModeConfigured)
        ));
        assert!(sim.commands().is_empty());
    }

    #[test]
    fn pause_and_start_only_toggle_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, sequencer, mut session) = connected(dir.path());
        let controller = OutputController::new();
        sequencer.switch_mode(&mut session, 1).unwrap();
        sim.clear_transcript();

        controller.pause(&mut session).unwrap();
        assert_eq!(session.state(), SessionState::Paused);
        assert!(!session.output_enabled());

        controller.start(&mut session).unwrap();
        assert_eq!(session.state(), SessionState::OutputEnabled);
        assert!(session.output_enabled());

        assert_eq!(
            sim.commands(),
            vec!["OUTP1 OFF", "OUTP2 OFF", "OUTP1 ON", "OUTP2 ON"]
        );
    }

    #[test]
    fn toggle_alternates() {
        let dir = tempfile::tempdir().unwrap();
        let (_sim, sequencer, mut session) = connected(dir.path());
        let controller = OutputController::new();
        sequencer.switch_mode(&mut session, 1).unwrap();

        assert!(!controller.toggle(&mut session).unwrap());
        assert!(controller.toggle(&mut session).unwrap());
        assert!(!controller.toggle(&mut session).unwrap());
    }

    #[test]
    fn stop_returns_to_connected_from_any_state() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, sequencer, mut session) = connected(dir.path());
        let controller = OutputController::new();

        controller.stop(&mut session).unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        sequencer.switch_mode(&mut session, 1).unwrap();
        controller.stop(&mut session).unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.mode().is_none());

        sequencer.switch_mode(&mut session, 3).unwrap();
        controller.pause(&mut session).unwrap();
        sim.clear_transcript();
        let steps = controller.stop(&mut session).unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(
            sim.commands(),
            vec!["OUTP1 OFF", "OUTP2 OFF", "SOUR2:TRACK OFF", "*WAI"]
        );
        assert!(steps.iter().all(|step| !step.is_failed()));

        let err = controller.start(&mut session).unwrap_err();
        assert!(matches!(err, ModalError::State(StateError::NoModeConfigured)));
    }

    #[test]
    fn closed_session_rejects_control() {
        let dir = tempfile::tempdir().unwrap();
        let (_sim, _sequencer, mut session) = connected(dir.path());
        session.close().unwrap();

        let err = OutputController::new().stop(&mut session).unwrap_err();
        assert!(matches!(err, ModalError::State(StateError::NotConnected)));
    }

    #[test]
    fn worker_serialises_requests_and_reports_events() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, sequencer, session) = connected(dir.path());
        let worker = ControlWorker::spawn(sequencer, session);

        worker.send(Request::Start).unwrap();
        match worker.recv_timeout(WAIT) {
            Some(Event::Failed { request, error }) => {
                assert_eq!(request, Request::Start);
                assert!(matches!(error, ModalError::State(StateError::NoModeConfigured)));
            }
            other => panic!("unexpected event {other:?}"),
        }

        worker.send(Request::SelectMode(1)).unwrap();
        assert!(matches!(
            worker.recv_timeout(WAIT),
            Some(Event::Configuring { mode_id: 1 })
        ));
        match worker.recv_timeout(WAIT) {
            Some(Event::ModeReady(report)) => assert_eq!(report.mode.id, 1),
            other => panic!("unexpected event {other:?}"),
        }

        worker.send(Request::Toggle).unwrap();
        assert!(matches!(
            worker.recv_timeout(WAIT),
            Some(Event::OutputChanged { running: false })
        ));

        let status = worker.status().unwrap();
        assert_eq!(status.state, SessionState::Paused);
        assert_eq!(status.mode_id, Some(1));

        worker.send(Request::Stop).unwrap();
        assert!(matches!(worker.recv_timeout(WAIT), Some(Event::Stopped(_))));

        worker.shutdown();
        assert!(sim.is_closed());
    }

    #[test]
    fn worker_reports_unknown_mode() {
        let dir = tempfile::tempdir().unwrap();
        let (_sim, sequencer, session) = connected(dir.path());
        let worker = ControlWorker::spawn(sequencer, session);

        worker.send(Request::SelectMode(42)).unwrap();
        assert!(matches!(
            worker.recv_timeout(WAIT),
            Some(Event::Configuring { mode_id: 42 })
        ));
        assert!(matches!(
            worker.recv_timeout(WAIT),
            Some(Event::Failed {
                request: Request::SelectMode(42),
                error: ModalError::Config(_),
            })
        ));
    }

    #[test]
    fn dropping_worker_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, sequencer, session) = connected(dir.path());
        let worker = ControlWorker::spawn(sequencer, session);

        drop(worker);
        assert!(sim.is_closed());
    }
}
