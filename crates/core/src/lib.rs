//! Core library for the modal drive.
//!
//! Each module owns one stage of getting a pair of measured waveforms onto a
//! two-channel arbitrary waveform generator: parsing sample files
//! (`waveform`), resampling them onto a shared grid (`align`), the table of
//! available modes (`catalog`), the SCPI link (`device`), the ordered mode
//! switch (`sequencer`) and start/pause/stop from a front end (`control`).

pub mod align;
pub mod catalog;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod sequencer;
pub mod waveform;

pub use align::{AlignedPair, Aligner, Normalization};
pub use catalog::{Direction, Mode, ModeCatalog, Polarity};
pub use config::{AppConfig, DeviceConfig, OutputConfig, WaveformConfig};
pub use control::{
    ControlWorker, Event, OutputController, Request, SessionStatus, SharedSession,
};
pub use device::{BarrierMode, Channel, SimulatedTransport, TcpTransport, Transport};
pub use error::{ModalError, Result};
pub use sequencer::{DeviceSequencer, DeviceSession, ModeReport, SessionState, Step, StepOutcome, StepStatus};
pub use waveform::{ParsePolicy, Sample, SampleSeries, WaveformLoader};
