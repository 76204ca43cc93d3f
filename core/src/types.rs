//! Data model (spec §3): camera identity, parameter sets, camera records,
//! and capture results.

use crate::error::ParameterError;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use strum_macros::{EnumString, IntoStaticStr};

/// Valid bounds for a `ParameterSet`, named so error messages can reference
/// them without hard-coding the numbers twice.
pub mod limits {
    pub const EXPOSURE_MIN_US: i32 = 500;
    pub const EXPOSURE_MAX_US: i32 = 100_000;
    pub const EXPOSURE_MAX_DESPERATE_US: i32 = 150_000;
    pub const GAIN_MIN: f64 = 1.0;
    pub const GAIN_MAX_NOMINAL: f64 = 4.0;
    pub const GAIN_MAX_DESPERATE: f64 = 6.0;
    pub const BLACK_LEVEL_MIN: i32 = 0;
    pub const BLACK_LEVEL_MAX: i32 = 255;
    pub const WHITE_BALANCE_MIN: f64 = 0.0;
    pub const WHITE_BALANCE_MAX: f64 = 4.0;
}

/// Pixel encoding tag applied to the camera's genicam PixelFormat feature.
/// The original `OnyxCameraConfig` wraps `aravis::PixelFormat` with its own
/// serde visitor for exactly this reason: the upstream type does not derive
/// serde itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum PixelFormatTag {
    BayerRg8,
    Rgb8Packed,
    Rgb8Planar,
}

impl Default for PixelFormatTag {
    fn default() -> Self {
        PixelFormatTag::BayerRg8
    }
}

/// Output image container requested for a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    Tiff,
    Png,
    Jpg,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Tiff => "tiff",
            OutputFormat::Png => "png",
            OutputFormat::Jpg => "jpg",
        }
    }
}

/// Per-camera imaging parameters (spec §3 "Parameter Set"). A default
/// instance is held at the store level; per-camera overrides are layered on
/// top at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    /// Exposure time in microseconds, valid 500-100000 (150000 during
    /// desperate retries, see `retry`).
    pub exposure_time_us: i32,
    /// Analog gain, valid 1.0-4.0 nominal, extended to 6.0 during desperate
    /// retries.
    pub gain: f64,
    /// Black level offset, 0-255.
    pub black_level: i32,
    pub auto_exposure: bool,
    pub auto_gain: bool,
    pub pixel_format: PixelFormatTag,
    /// Red channel white-balance multiplier (supplemental to the distilled
    /// spec; present in the original acquisition parameter set).
    pub red_balance: f64,
    /// Blue channel white-balance multiplier.
    pub blue_balance: f64,
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self {
            exposure_time_us: 40_000,
            gain: 1.0,
            black_level: 40,
            auto_exposure: false,
            auto_gain: false,
            pixel_format: PixelFormatTag::default(),
            red_balance: 1.0,
            blue_balance: 1.0,
        }
    }
}

impl ParameterSet {
    /// Apply a named field update, validating against the bounds in spec
    /// §3. Desperate-retry strategies (spec §4.F) bypass this and write the
    /// field directly, since they are allowed to exceed the nominal gain
    /// bound up to the desperate ceiling.
    pub fn set_validated(&mut self, field: &str, value: ParameterValue) -> Result<(), ParameterError> {
        validate(field, &value)?;
        match (field, value) {
            ("exposure_time_us", ParameterValue::Int(v)) => self.exposure_time_us = v,
            ("gain", ParameterValue::Float(v)) => self.gain = v,
            ("black_level", ParameterValue::Int(v)) => self.black_level = v,
            ("auto_exposure", ParameterValue::Bool(v)) => self.auto_exposure = v,
            ("auto_gain", ParameterValue::Bool(v)) => self.auto_gain = v,
            ("red_balance", ParameterValue::Float(v)) => self.red_balance = v,
            ("blue_balance", ParameterValue::Float(v)) => self.blue_balance = v,
            (other, _) => return Err(ParameterError::UnknownField(other.to_string())),
        }
        Ok(())
    }
}

/// A typed value accepted by `ParameterStore::set`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterValue {
    Int(i32),
    Float(f64),
    Bool(bool),
}

/// Pure validation honoring the bounds in spec §3. Exposed standalone so the
/// store's `validate` operation does not need a live parameter set to check
/// a prospective value.
pub fn validate(field: &str, value: &ParameterValue) -> Result<(), ParameterError> {
    use limits::*;
    match (field, value) {
        ("exposure_time_us", ParameterValue::Int(v)) => {
            if (EXPOSURE_MIN_US..=EXPOSURE_MAX_US).contains(v) {
                Ok(())
            } else {
                Err(ParameterError::OutOfRange {
                    field: "exposure_time_us",
                    value: *v as f64,
                    min: EXPOSURE_MIN_US as f64,
                    max: EXPOSURE_MAX_US as f64,
                })
            }
        }
        ("gain", ParameterValue::Float(v)) => {
            if (GAIN_MIN..=GAIN_MAX_NOMINAL).contains(v) {
                Ok(())
            } else {
                Err(ParameterError::OutOfRange {
                    field: "gain",
                    value: *v,
                    min: GAIN_MIN,
                    max: GAIN_MAX_NOMINAL,
                })
            }
        }
        ("black_level", ParameterValue::Int(v)) => {
            if (BLACK_LEVEL_MIN..=BLACK_LEVEL_MAX).contains(v) {
                Ok(())
            } else {
                Err(ParameterError::OutOfRange {
                    field: "black_level",
                    value: *v as f64,
                    min: BLACK_LEVEL_MIN as f64,
                    max: BLACK_LEVEL_MAX as f64,
                })
            }
        }
        ("auto_exposure", ParameterValue::Bool(_)) | ("auto_gain", ParameterValue::Bool(_)) => Ok(()),
        ("red_balance", ParameterValue::Float(v)) | ("blue_balance", ParameterValue::Float(v)) => {
            if (WHITE_BALANCE_MIN..=WHITE_BALANCE_MAX).contains(v) {
                Ok(())
            } else {
                Err(ParameterError::OutOfRange {
                    field: "white_balance",
                    value: *v,
                    min: WHITE_BALANCE_MIN,
                    max: WHITE_BALANCE_MAX,
                })
            }
        }
        (
            field @ ("exposure_time_us" | "gain" | "black_level" | "red_balance" | "blue_balance"),
            _,
        ) => Err(ParameterError::TypeMismatch {
            field: match field {
                "exposure_time_us" => "exposure_time_us",
                "gain" => "gain",
                "black_level" => "black_level",
                "red_balance" => "red_balance",
                _ => "blue_balance",
            },
            expected: "numeric",
        }),
        (other, _) => Err(ParameterError::UnknownField(other.to_string())),
    }
}

/// Desperate-retry variant of `validate` (spec §3: exposure/gain are
/// "extended to 6.0 [gain] / 150000 [exposure]... during desperate
/// retries"). Only `exposure_time_us` and `gain` widen; every other field
/// validates at its normal bound. Used exclusively by the retry engine's
/// forced writes (spec §4.F retries 1, 3-5) — `set`/`set_bulk`'s own
/// validation stays nominal for every other caller.
pub fn validate_desperate(field: &str, value: &ParameterValue) -> Result<(), ParameterError> {
    use limits::*;
    match (field, value) {
        ("exposure_time_us", ParameterValue::Int(v)) => {
            if (EXPOSURE_MIN_US..=EXPOSURE_MAX_DESPERATE_US).contains(v) {
                Ok(())
            } else {
                Err(ParameterError::OutOfRange {
                    field: "exposure_time_us",
                    value: *v as f64,
                    min: EXPOSURE_MIN_US as f64,
                    max: EXPOSURE_MAX_DESPERATE_US as f64,
                })
            }
        }
        ("gain", ParameterValue::Float(v)) => {
            if (GAIN_MIN..=GAIN_MAX_DESPERATE).contains(v) {
                Ok(())
            } else {
                Err(ParameterError::OutOfRange {
                    field: "gain",
                    value: *v,
                    min: GAIN_MIN,
                    max: GAIN_MAX_DESPERATE,
                })
            }
        }
        _ => validate(field, value),
    }
}

/// Immutable identity of a physical camera (spec §3 "Camera Identity").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CameraIdentity {
    pub serial: String,
    pub position: u32,
}

impl CameraIdentity {
    /// Last 7 digits of the serial, used in filenames (spec §6.3).
    pub fn serial_suffix(&self) -> String {
        let digits: String = self.serial.chars().rev().take(7).collect();
        digits.chars().rev().collect()
    }
}

/// Priority level the bandwidth controller escalates a camera to after
/// repeated failures (spec §3 invariant iii: bounded sawtooth in [0, 2]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BandwidthPriority {
    Normal = 0,
    High = 1,
    Critical = 2,
}

impl BandwidthPriority {
    pub fn raise(self) -> Self {
        match self {
            BandwidthPriority::Normal => BandwidthPriority::High,
            _ => BandwidthPriority::Critical,
        }
    }

    pub fn lower(self) -> Self {
        match self {
            BandwidthPriority::Critical => BandwidthPriority::High,
            _ => BandwidthPriority::Normal,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Runtime health counters the bandwidth controller reads and mutates
/// (spec §3 "Camera Record").
#[derive(Debug, Clone)]
pub struct CameraHealth {
    pub last_capture_instant: Option<Instant>,
    pub rolling_average_capture_ms: f64,
    pub consecutive_bandwidth_failures: u32,
    pub bandwidth_priority: BandwidthPriority,
    pub needs_throttling: bool,
    pub black_image_count: u32,
    pub had_recent_black_image: bool,
}

impl Default for CameraHealth {
    fn default() -> Self {
        Self {
            last_capture_instant: None,
            rolling_average_capture_ms: 0.0,
            consecutive_bandwidth_failures: 0,
            bandwidth_priority: BandwidthPriority::Normal,
            needs_throttling: false,
            black_image_count: 0,
            had_recent_black_image: false,
        }
    }
}

/// One entry per capture attempt (spec §3 "Capture Result").
#[derive(Debug, Clone, Serialize)]
pub struct CaptureResult {
    pub success: bool,
    pub retry_count: u32,
    pub bright_percentage: u8,
    pub dark: bool,
    pub elapsed_ms: u64,
    pub error: Option<String>,
    pub output_path: Option<std::path::PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposure_boundaries_accepted_and_rejected() {
        assert!(validate("exposure_time_us", &ParameterValue::Int(500)).is_ok());
        assert!(validate("exposure_time_us", &ParameterValue::Int(100_000)).is_ok());
        assert!(validate("exposure_time_us", &ParameterValue::Int(499)).is_err());
        assert!(validate("exposure_time_us", &ParameterValue::Int(100_001)).is_err());
    }

    #[test]
    fn gain_boundaries_accepted() {
        assert!(validate("gain", &ParameterValue::Float(1.0)).is_ok());
        assert!(validate("gain", &ParameterValue::Float(4.0)).is_ok());
        assert!(validate("gain", &ParameterValue::Float(4.01)).is_err());
    }

    #[test]
    fn serial_suffix_takes_last_seven_digits() {
        let id = CameraIdentity {
            serial: "S1128470".to_string(),
            position: 3,
        };
        assert_eq!(id.serial_suffix(), "1128470");
    }

    #[test]
    fn set_validated_rejects_out_of_range_without_mutating() {
        let mut params = ParameterSet::default();
        let before = params.clone();
        let err = params.set_validated("gain", ParameterValue::Float(10.0));
        assert!(err.is_err());
        assert_eq!(params, before);
    }
}
