use std::path::PathBuf;

use crate::sequencer::Step;

/// Result alias that carries the custom [`ModalError`] type.
pub type Result<T> = std::result::Result<T, ModalError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum ModalError {
    /// Missing, malformed or unusable waveform data.
    #[error(transparent)]
    Data(#[from] DataError),
    /// Unknown mode or invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The instrument link failed or rejected a step.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// Operation requested in a session state that does not allow it.
    #[error(transparent)]
    State(#[from] StateError),
    /// Wrapper around standard IO errors outside the device link.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("cannot read waveform file `{}`: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{origin} line {line}: cannot parse `{content}` as `<time> <value>`")]
    Malformed {
        origin: String,
        line: usize,
        content: String,
    },
    #[error("{origin} line {line}: time {time} does not increase past {previous}")]
    NonIncreasing {
        origin: String,
        line: usize,
        time: f64,
        previous: f64,
    },
    #[error("{origin} contains no valid samples")]
    Empty { origin: String },
    #[error("{first} and {second} share no common time range (start {start}, end {end})")]
    NoCommonRange {
        first: String,
        second: String,
        start: f64,
        end: f64,
    },
    #[error("{first} and {second} give invalid sampling interval {interval}")]
    DegenerateInterval {
        first: String,
        second: String,
        interval: f64,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown mode {0}")]
    UnknownMode(u8),
    #[error("mode {0} is defined more than once")]
    DuplicateMode(u8),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("cannot read configuration `{}`: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse configuration `{}`: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure while talking to the generator, tagged with the protocol step.
#[derive(Debug, thiserror::Error)]
#[error("device step `{step}` failed: {detail}")]
pub struct DeviceError {
    pub step: Step,
    pub detail: String,
}

impl DeviceError {
    pub fn new(step: Step, detail: impl Into<String>) -> Self {
        Self {
            step,
            detail: detail.into(),
        }
    }

    pub fn io(step: Step, err: std::io::Error) -> Self {
        Self::new(step, err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("device is not connected")]
    NotConnected,
    #[error("no mode has been configured yet")]
    NoModeConfigured,
    #[error("device session lock has been poisoned")]
    Poisoned,
}

impl ModalError {
    /// Returns the protocol step when the error came from the device link.
    pub fn device_step(&self) -> Option<Step> {
        match self {
            Self::Device(err) => Some(err.step),
            _ => None,
        }
    }
}
