use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    catalog::{Mode, ModeCatalog},
    device::BarrierMode,
    error::ConfigError,
    waveform::ParsePolicy,
    Result,
};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub waveform: WaveformConfig,
    pub output: OutputConfig,
    pub modes: Vec<Mode>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            waveform: WaveformConfig::default(),
            output: OutputConfig::default(),
            modes: ModeCatalog::default_modes(),
        }
    }
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let output = &self.output;
        if !(output.amplitude_vpp.is_finite() && output.amplitude_vpp > 0.0) {
            return Err(invalid(format!(
                "amplitude must be positive, got {}",
                output.amplitude_vpp
            )));
        }
        if !output.offset_v.is_finite() {
            return Err(invalid("offset must be finite"));
        }
        for name in [&output.channel1_waveform, &output.channel2_waveform] {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(invalid(format!(
                    "waveform name `{name}` must be non-empty ASCII letters, digits or `_`"
                )));
            }
        }
        if output.channel1_waveform == output.channel2_waveform {
            return Err(invalid("channel waveforms need distinct names"));
        }
        if self.device.remote_dir.is_empty() {
            return Err(invalid("remote directory must not be empty"));
        }
        self.catalog().map(|_| ())
    }

    /// Mode table with file paths resolved against the data directory.
    pub fn catalog(&self) -> Result<ModeCatalog> {
        ModeCatalog::from_modes(self.modes.clone(), &self.waveform.data_dir)
    }
}

fn invalid(message: impl Into<String>) -> crate::ModalError {
    ConfigError::Invalid(message.into()).into()
}

/// Where and how to reach the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// `host` or `host:port` of the instrument's SCPI socket.
    pub address: String,
    /// Per read/write timeout. Unset means the socket blocks.
    pub timeout_ms: Option<u64>,
    /// Directory under `INT:\` where uploaded waveforms are stored.
    pub remote_dir: String,
    pub barrier: BarrierMode,
    /// Show upload progress on the instrument's front panel.
    pub display_status: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: "192.168.0.100:5025".to_string(),
            timeout_ms: None,
            remote_dir: "remoteAdded".to_string(),
            barrier: BarrierMode::Wait,
            display_status: true,
        }
    }
}

impl DeviceConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveformConfig {
    /// Base directory for relative mode file paths.
    pub data_dir: PathBuf,
    pub parse_policy: ParsePolicy,
}

impl Default for WaveformConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            parse_policy: ParsePolicy::Strict,
        }
    }
}

/// Analog output settings shared by both channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub amplitude_vpp: f64,
    pub offset_v: f64,
    pub channel1_waveform: String,
    pub channel2_waveform: String,
    /// Also couple frequency and phase after enabling tracking.
    pub coupling: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            amplitude_vpp: 2.0,
            offset_v: 0.0,
            channel1_waveform: "MODAL_CH1".to_string(),
            channel2_waveform: "MODAL_CH2".to_string(),
            coupling: false,
        }
    }
}
