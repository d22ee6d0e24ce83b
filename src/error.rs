use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::Status;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport i/o failed: {0}")]
    Transport(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("`{command}` returned an unreadable value: {reply:?}")]
    UnreadableValue { command: String, reply: Vec<String> },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid settings: {0}")]
    Invalid(String),
    #[error("missing credential `{0}`")]
    MissingCredentials(&'static str),
}

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("failed to read decision table {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("decision table is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),
    #[error("unsupported decision table version {found}, expected {expected}")]
    Version { found: u32, expected: u32 },
    #[error("decision table shape mismatch: {0}")]
    Shape(String),
    #[error("SNR value {0} cannot be quantised")]
    InvalidSnr(f64),
    #[error("power index {0} is outside 1..=5")]
    InvalidPowerIndex(u8),
    #[error("power level {0} dBm has no power index")]
    UnmappedPowerLevel(i32),
    #[error("action {action} (SF{spreading_factor}) has no datarate on this module")]
    UnmappableAction { action: usize, spreading_factor: u8 },
}

#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("telemetry payload is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("could not connect to broker {host}:{port} after {attempts} attempts: {reason}")]
    Connect {
        host: String,
        port: u16,
        attempts: u32,
        reason: String,
    },
    #[error("broker client failed: {0}")]
    Client(#[from] rumqttc::ClientError),
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("join failed with status {status:?}: {responses:?}")]
    JoinFailed {
        status: Status,
        responses: Vec<String>,
    },
    #[error("module rejected transmission parameters: {responses:?}")]
    TransmissionParameters { responses: Vec<String> },
    #[error("failed to encode uplink payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("audit log write failed: {0}")]
    Audit(#[from] io::Error),
}

impl From<EngineError> for ControlError {
    fn from(err: EngineError) -> Self {
        ControlError::Device(DeviceError::Engine(err))
    }
}
