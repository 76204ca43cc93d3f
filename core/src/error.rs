//! Error taxonomy (spec §7). Transient per-capture errors are absorbed by
//! the retry engine and surface only as fields of a `CaptureResult`;
//! batch-level errors (configuration, session directory) propagate to the
//! caller and abort the batch.

use std::path::PathBuf;

/// Fatal at startup: missing/invalid JSON, unknown serial referenced,
/// out-of-range default.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("configuration override references unknown serial {0:?}")]
    UnknownSerial(String),
    #[error("default parameter {field} out of range: {value}")]
    OutOfRangeDefault { field: &'static str, value: String },
}

/// SDK reports failure creating/opening/destroying a handle. Per-camera;
/// the camera is marked disconnected and excluded from capture.
#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("failed to open device at {address}: {reason}")]
    Open { address: String, reason: String },
    #[error("failed to set feature {name}: {reason}")]
    SetFeature { name: String, reason: String },
    #[error("failed to get feature {name}: {reason}")]
    GetFeature { name: String, reason: String },
    #[error("one-shot frame trigger failed: {0}")]
    Snap(String),
    #[error("color conversion failed: {0}")]
    Conversion(String),
    #[error("save to {path:?} failed: {reason}")]
    Save { path: PathBuf, reason: String },
    #[error("device handle teardown failed: {0}")]
    Teardown(String),
}

/// `set-parameter` with an out-of-range or type-mismatched value. Recovered:
/// caller gets a structured rejection, no state changes.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    #[error("{field} value {value} is outside the valid range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("unknown parameter field {0:?}")]
    UnknownField(String),
    #[error("type mismatch for field {field}: expected {expected}")]
    TypeMismatch { field: &'static str, expected: &'static str },
}

/// Errors that can terminate a single capture attempt inside the pipeline.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("admission timeout waiting for a capture slot")]
    AdmissionTimeout,
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("transport timeout waiting for buffer completion after {attempts} attempts")]
    TransportTimeout { attempts: u32 },
    #[error("validation failed: {0}")]
    Validation(String),
}

/// Batch-level failures abort the whole batch and are returned to the caller.
#[derive(thiserror::Error, Debug)]
pub enum BatchError {
    #[error("could not create session directory {path:?}: {source}")]
    SessionDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no cameras available for capture")]
    NoCameras,
}
