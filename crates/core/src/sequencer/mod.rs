//! Mode switching protocol for the two-channel generator.
//!
//! The generator only phase-locks channel 2 to channel 1 when the
//! configuration arrives in a fixed order: outputs off, tracking off, both
//! uploads, channel setup, frequency and phase, tracking on, phase sync,
//! polarity, sync marker, outputs on. [`DeviceSequencer::switch_mode`] emits
//! exactly that order and reports every step in a [`ModeReport`].

use std::{fmt, io};

use serde::{Deserialize, Serialize};

use crate::{
    align::{AlignedPair, Aligner, Normalization},
    catalog::{Mode, ModeCatalog},
    config::{AppConfig, DeviceConfig, OutputConfig},
    device::{Channel, Command, Instrument, Transport},
    error::{DeviceError, StateError},
    waveform::WaveformLoader,
    Result,
};

/// Where a [`DeviceSession`] is in the connect / configure / run cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connected,
    Uploading,
    Configuring,
    Tracking,
    Synced,
    OutputEnabled,
    Paused,
}

impl SessionState {
    /// True once a full mode switch has completed and not been stopped.
    pub fn has_mode(self) -> bool {
        matches!(self, Self::Synced | Self::OutputEnabled | Self::Paused)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Named protocol steps, used in reports and device errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    Connect,
    DisableOutputs,
    DisableTracking,
    Align,
    UploadChannel1,
    UploadChannel2,
    ConfigureChannels,
    FrequencyPhase,
    EnableTracking,
    Coupling,
    PhaseSync,
    Polarity,
    SyncMarker,
    EnableOutputs,
    DisplayStatus,
    TrackStatus,
    Start,
    Pause,
    Stop,
    Close,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connect => "connect",
            Self::DisableOutputs => "disable outputs",
            Self::DisableTracking => "disable tracking",
            Self::Align => "align waveforms",
            Self::UploadChannel1 => "upload channel 1",
            Self::UploadChannel2 => "upload channel 2",
            Self::ConfigureChannels => "configure channels",
            Self::FrequencyPhase => "frequency and phase",
            Self::EnableTracking => "enable tracking",
            Self::Coupling => "frequency/phase coupling",
            Self::PhaseSync => "phase sync",
            Self::Polarity => "polarity",
            Self::SyncMarker => "sync marker output",
            Self::EnableOutputs => "enable outputs",
            Self::DisplayStatus => "display status",
            Self::TrackStatus => "track status",
            Self::Start => "start output",
            Self::Pause => "pause output",
            Self::Stop => "stop",
            Self::Close => "close",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Done,
    /// Not attempted, with the reason.
    Skipped(String),
    /// A best-effort step failed; the sequence carried on.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: Step,
    pub status: StepStatus,
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, StepStatus::Failed(_))
    }
}

/// Ordered record of the steps of one operation.
#[derive(Debug, Default)]
pub(crate) struct StepLog {
    steps: Vec<StepOutcome>,
}

impl StepLog {
    pub(crate) fn done(&mut self, step: Step) {
        self.push(step, StepStatus::Done);
    }

    pub(crate) fn skipped(&mut self, step: Step, reason: &str) {
        self.push(step, StepStatus::Skipped(reason.to_string()));
    }

    /// Runs an optional step. A failure is logged and recorded, never returned.
    pub(crate) fn best_effort<T>(
        &mut self,
        session: &mut DeviceSession,
        step: Step,
        action: impl FnOnce(&mut Instrument) -> io::Result<T>,
    ) -> Option<T> {
        match action(&mut session.instrument) {
            Ok(value) => {
                self.done(step);
                Some(value)
            }
            Err(err) => {
                tracing::warn!(%step, error = %err, "optional step failed, continuing");
                self.push(step, StepStatus::Failed(err.to_string()));
                None
            }
        }
    }

    pub(crate) fn into_steps(self) -> Vec<StepOutcome> {
        self.steps
    }

    fn push(&mut self, step: Step, status: StepStatus) {
        self.steps.push(StepOutcome { step, status });
    }
}

/// Result of a completed mode switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeReport {
    pub mode: Mode,
    pub frequency: f64,
    pub sample_rate: f64,
    pub point_count: usize,
    pub normalization: [Normalization; 2],
    /// Reply of the tracking query after outputs came on, if it succeeded.
    pub tracking_confirmed: Option<bool>,
    pub steps: Vec<StepOutcome>,
}

impl ModeReport {
    /// Best-effort steps that failed during the switch.
    pub fn degraded(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|outcome| outcome.is_failed())
    }
}

/// Open link to the generator plus the state machine around it.
///
/// Dropping a connected session switches both outputs off, disables
/// tracking and closes the link.
#[derive(Debug)]
pub struct DeviceSession {
    instrument: Instrument,
    identity: String,
    state: SessionState,
    mode: Option<Mode>,
    output_enabled: bool,
}

impl DeviceSession {
    /// Opens a session: identifies the instrument, forces both outputs off,
    /// creates the waveform directory and selects little-endian transfers.
    pub fn connect(transport: Box<dyn Transport>, device: &DeviceConfig) -> Result<Self> {
        let mut instrument = Instrument::new(transport, device.barrier);
        let identity = initialise(&mut instrument, device)
            .map_err(|err| DeviceError::io(Step::Connect, err))?;

        tracing::info!(%identity, "connected to generator");
        Ok(Self {
            instrument,
            identity,
            state: SessionState::Connected,
            mode: None,
            output_enabled: false,
        })
    }

    /// `*IDN?` reply recorded at connect.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Current position in the connect / configure / run cycle.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// False once the session has been closed.
    pub fn is_connected(&self) -> bool {
        self.state != SessionState::Disconnected
    }

    /// Mode configured by the last successful switch.
    pub fn mode(&self) -> Option<&Mode> {
        self.mode.as_ref()
    }

    /// Whether both outputs were last switched on.
    pub fn output_enabled(&self) -> bool {
        self.output_enabled
    }

    pub(crate) fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(StateError::NotConnected.into())
        }
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!(from = %self.state, to = %state, "session state");
            self.state = state;
        }
    }

    pub(crate) fn set_output(&mut self, enabled: bool) {
        self.output_enabled = enabled;
    }

    /// Runs a mandatory step, mapping link failures to a [`DeviceError`].
    pub(crate) fn execute<T>(
        &mut self,
        step: Step,
        action: impl FnOnce(&mut Instrument) -> io::Result<T>,
    ) -> Result<T> {
        action(&mut self.instrument).map_err(|err| {
            tracing::error!(%step, error = %err, "device step failed");
            DeviceError::io(step, err).into()
        })
    }

    /// Outputs off and tracking off, back to `Connected` with no mode.
    pub(crate) fn release_mode(&mut self) -> Result<Vec<StepOutcome>> {
        self.ensure_connected()?;
        let mut log = StepLog::default();
        self.execute(Step::Stop, |dev| {
            for channel in Channel::BOTH {
                dev.write(&Command::Output(channel, false))?;
            }
            Ok(())
        })?;
        self.output_enabled = false;
        log.done(Step::Stop);
        log.best_effort(self, Step::DisableTracking, |dev| {
            dev.write(&Command::Track(false))?;
            dev.barrier()
        });
        self.mode = None;
        self.set_state(SessionState::Connected);
        Ok(log.into_steps())
    }

    /// Leaves the session retryable after a failed switch.
    fn abandon(&mut self) {
        for channel in Channel::BOTH {
            if let Err(err) = self.instrument.write(&Command::Output(channel, false)) {
                tracing::warn!(%channel, error = %err, "could not force output off");
            }
        }
        self.output_enabled = false;
        self.mode = None;
        self.set_state(SessionState::Connected);
    }

    /// Forces outputs and tracking off and closes the link. Calling it on a
    /// closed session does nothing.
    pub fn close(&mut self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        for command in [
            Command::Output(Channel::One, false),
            Command::Output(Channel::Two, false),
            Command::Track(false),
        ] {
            if let Err(err) = self.instrument.write(&command) {
                tracing::warn!(%command, error = %err, "shutdown command failed");
            }
        }
        self.output_enabled = false;
        self.mode = None;
        self.set_state(SessionState::Disconnected);
        let closed = self.instrument.close();
        tracing::info!("device link closed");
        closed.map_err(|err| DeviceError::io(Step::Close, err).into())
    }
}

fn initialise(instrument: &mut Instrument, device: &DeviceConfig) -> io::Result<String> {
    let identity = instrument.query(&Command::Identify)?;
    let identity = identity.trim();
    if identity.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "empty identity reply",
        ));
    }
    for channel in Channel::BOTH {
        instrument.write(&Command::Output(channel, false))?;
    }
    instrument.write(&Command::MakeDirectory(device.remote_dir.clone()))?;
    instrument.write(&Command::ByteOrderSwap)?;
    Ok(identity.to_string())
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "closing device session on drop failed");
        }
    }
}

/// Drives a [`DeviceSession`] through mode switches.
#[derive(Debug, Clone)]
pub struct DeviceSequencer {
    catalog: ModeCatalog,
    loader: WaveformLoader,
    aligner: Aligner,
    device: DeviceConfig,
    output: OutputConfig,
}

impl DeviceSequencer {
    pub fn new(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_parts(
            config.catalog()?,
            WaveformLoader::new(config.waveform.parse_policy),
            config.device.clone(),
            config.output.clone(),
        ))
    }

    pub fn with_parts(
        catalog: ModeCatalog,
        loader: WaveformLoader,
        device: DeviceConfig,
        output: OutputConfig,
    ) -> Self {
        Self {
            catalog,
            loader,
            aligner: Aligner::new(),
            device,
            output,
        }
    }

    pub fn catalog(&self) -> &ModeCatalog {
        &self.catalog
    }

    pub fn connect(&self, transport: Box<dyn Transport>) -> Result<DeviceSession> {
        DeviceSession::connect(transport, &self.device)
    }

    /// Loads and aligns the mode's file pair. Channel 2 is always negated at
    /// the sample level; output polarity is applied separately on the device.
    pub fn prepare(&self, mode: &Mode) -> Result<AlignedPair> {
        let first = self.loader.load(&mode.channel1_file)?;
        let second = self.loader.load(&mode.channel2_file)?;
        self.aligner.align(&first, &second, true)
    }

    /// Reconfigures the generator for `mode_id`, stopping the current mode
    /// first. On a mandatory step failure the outputs are forced off and the
    /// session returns to `Connected`, ready for another attempt.
    pub fn switch_mode(&self, session: &mut DeviceSession, mode_id: u8) -> Result<ModeReport> {
        let mode = self.catalog.lookup(mode_id)?.clone();
        session.ensure_connected()?;

        if session.mode().is_some() || session.state() != SessionState::Connected {
            tracing::info!(current = ?session.mode().map(|m| m.id), "stopping current mode");
            session.release_mode()?;
        }

        tracing::info!(%mode, "switching mode");
        match self.run_sequence(session, mode) {
            Ok(report) => {
                tracing::info!(
                    mode = %report.mode,
                    frequency = report.frequency,
                    degraded = report.degraded().count(),
                    "mode active"
                );
                Ok(report)
            }
            Err(err) => {
                tracing::error!(error = %err, "mode switch aborted");
                session.abandon();
                Err(err)
            }
        }
    }

    fn run_sequence(&self, session: &mut DeviceSession, mode: Mode) -> Result<ModeReport> {
        let mut log = StepLog::default();
        let directory = self.device.remote_dir.clone();
        let names = [
            self.output.channel1_waveform.as_str(),
            self.output.channel2_waveform.as_str(),
        ];

        session.execute(Step::DisableOutputs, |dev| {
            for channel in Channel::BOTH {
                dev.write(&Command::Output(channel, false))?;
            }
            Ok(())
        })?;
        session.set_output(false);
        log.done(Step::DisableOutputs);

        log.best_effort(session, Step::DisableTracking, |dev| {
            dev.write(&Command::Track(false))?;
            dev.barrier()
        });

        let pair = self.prepare(&mode)?;
        log.done(Step::Align);

        session.set_state(SessionState::Uploading);
        for (channel, step, samples) in [
            (Channel::One, Step::UploadChannel1, &pair.channel1),
            (Channel::Two, Step::UploadChannel2, &pair.channel2),
        ] {
            let name = names[usize::from(channel.number() - 1)];
            self.display(session, &mut log, format!("Uploading {channel} Modal"));
            session.execute(step, |dev| {
                dev.write(&Command::ClearVolatile(channel))?;
                dev.upload_arb(channel, name, samples)?;
                dev.barrier()?;
                dev.write(&Command::StoreArb {
                    directory: directory.clone(),
                    name: name.to_string(),
                })
            })?;
            log.done(step);
        }

        session.set_state(SessionState::Configuring);
        let sample_rate = pair.sample_rate;
        session.execute(Step::ConfigureChannels, |dev| {
            for (channel, name) in Channel::BOTH.into_iter().zip(names) {
                dev.write(&Command::FunctionArb(channel))?;
                dev.write(&Command::SelectArb(channel, name.to_string()))?;
                dev.write(&Command::SampleRate(channel, sample_rate))?;
                dev.write(&Command::Amplitude(channel, self.output.amplitude_vpp))?;
                dev.write(&Command::Offset(channel, self.output.offset_v))?;
            }
            Ok(())
        })?;
        log.done(Step::ConfigureChannels);

        let frequency = pair.fundamental_frequency();
        session.execute(Step::FrequencyPhase, |dev| {
            for channel in Channel::BOTH {
                dev.write(&Command::Frequency(channel, frequency))?;
            }
            for channel in Channel::BOTH {
                dev.write(&Command::Phase(channel, 0.0))?;
            }
            dev.barrier()
        })?;
        log.done(Step::FrequencyPhase);

        session.set_state(SessionState::Tracking);
        log.best_effort(session, Step::EnableTracking, |dev| {
            dev.write(&Command::Track(true))?;
            dev.barrier()
        });

        if self.output.coupling {
            log.best_effort(session, Step::Coupling, |dev| {
                dev.write(&Command::PhaseReferenceInternal)?;
                dev.write(&Command::FrequencyCoupling(true))?;
                dev.write(&Command::PhaseCoupling(true))?;
                dev.barrier()
            });
        } else {
            log.skipped(Step::Coupling, "coupling disabled");
        }

        log.best_effort(session, Step::PhaseSync, |dev| {
            dev.write(&Command::PhaseSync)?;
            dev.write(&Command::Phase(Channel::Two, 0.0))?;
            dev.barrier()
        });

        let (first_polarity, second_polarity) = mode.polarities();
        session.execute(Step::Polarity, |dev| {
            dev.write(&Command::Polarity(Channel::One, first_polarity))?;
            dev.write(&Command::Polarity(Channel::Two, second_polarity))
        })?;
        log.done(Step::Polarity);
        session.set_state(SessionState::Synced);

        session.execute(Step::SyncMarker, |dev| {
            dev.write(&Command::SyncOutput(true))?;
            dev.write(&Command::SyncSource(Channel::One))?;
            dev.write(&Command::SyncMarkerMode)
        })?;
        log.done(Step::SyncMarker);

        session.execute(Step::EnableOutputs, |dev| {
            for channel in Channel::BOTH {
                dev.write(&Command::Output(channel, true))?;
            }
            dev.barrier()
        })?;
        log.done(Step::EnableOutputs);
        session.set_output(true);
        session.mode = Some(mode.clone());
        session.set_state(SessionState::OutputEnabled);

        self.display(session, &mut log, String::new());

        let tracking_confirmed = log
            .best_effort(session, Step::TrackStatus, |dev| dev.query(&Command::TrackQuery))
            .map(|reply| reply.trim() == "1");
        if tracking_confirmed == Some(false) {
            tracing::warn!("generator reports channel tracking off");
        }

        Ok(ModeReport {
            mode,
            frequency,
            sample_rate,
            point_count: pair.point_count,
            normalization: pair.normalization,
            tracking_confirmed,
            steps: log.into_steps(),
        })
    }

    fn display(&self, session: &mut DeviceSession, log: &mut StepLog, text: String) {
        if self.device.display_status {
            log.best_effort(session, Step::DisplayStatus, |dev| {
                dev.write(&Command::DisplayText(text))
            });
        }
    }
}
