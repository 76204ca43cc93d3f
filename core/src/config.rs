//! Configuration document loading (spec §6.1). Mirrors the teacher's
//! `OnyxCameraConfig::from_file`/`CameraArrayConfig::from_file` builder
//! pattern, built on the same `config` crate, but sourced as JSON rather
//! than YAML because §6.1 specifies a JSON document.

use crate::error::ConfigError;
use crate::types::{ParameterSet, ParameterValue, PixelFormatTag};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;

/// One entry of `camera_positions`: a physical serial bound to a logical
/// rig position.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CameraPositionEntry {
    pub position: u32,
    pub full_serial: String,
}

/// Subset of `ParameterSet` fields that may be present in a default or
/// per-camera override block; an absent field falls back to the next layer
/// down (compiled default -> document default -> per-camera override).
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct PartialParameterSet {
    pub exposure_time: Option<i32>,
    pub gain: Option<f64>,
    pub black_level: Option<i32>,
    pub auto_exposure: Option<bool>,
    pub auto_gain: Option<bool>,
    pub pixel_format: Option<PixelFormatTag>,
    pub red_balance: Option<f64>,
    pub blue_balance: Option<f64>,
}

impl PartialParameterSet {
    /// Layer this partial set on top of `base`, overriding only the fields
    /// that are present.
    pub fn layer_onto(&self, base: &ParameterSet) -> ParameterSet {
        let mut out = base.clone();
        if let Some(v) = self.exposure_time {
            out.exposure_time_us = v;
        }
        if let Some(v) = self.gain {
            out.gain = v;
        }
        if let Some(v) = self.black_level {
            out.black_level = v;
        }
        if let Some(v) = self.auto_exposure {
            out.auto_exposure = v;
        }
        if let Some(v) = self.auto_gain {
            out.auto_gain = v;
        }
        if let Some(v) = self.pixel_format {
            out.pixel_format = v;
        }
        if let Some(v) = self.red_balance {
            out.red_balance = v;
        }
        if let Some(v) = self.blue_balance {
            out.blue_balance = v;
        }
        out
    }

    /// Validate every present field against spec §3's bounds, reporting the
    /// first violation. Used for document-level defaults, which are fatal
    /// at startup if out of range (spec §7 ConfigurationError).
    fn validate(&self) -> Result<(), ConfigError> {
        let checks: Vec<(&'static str, ParameterValue)> = vec![
            self.exposure_time.map(|v| ("exposure_time_us", ParameterValue::Int(v))),
            self.gain.map(|v| ("gain", ParameterValue::Float(v))),
            self.black_level.map(|v| ("black_level", ParameterValue::Int(v))),
            self.red_balance.map(|v| ("red_balance", ParameterValue::Float(v))),
            self.blue_balance.map(|v| ("blue_balance", ParameterValue::Float(v))),
        ]
        .into_iter()
        .flatten()
        .collect();

        for (field, value) in checks {
            if let Err(e) = crate::types::validate(field, &value) {
                return Err(ConfigError::OutOfRangeDefault {
                    field,
                    value: format!("{e}"),
                });
            }
        }
        Ok(())
    }
}

/// `camera_settings` block of the configuration document.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct CameraSettings {
    #[serde(default)]
    pub default: PartialParameterSet,
    #[serde(default)]
    pub overrides: HashMap<String, PartialParameterSet>,
}

/// Top-level configuration document (spec §6.1).
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct RigConfig {
    pub camera_positions: Vec<CameraPositionEntry>,
    pub camera_settings: CameraSettings,
}

impl RigConfig {
    /// Load and validate a configuration document from disk.
    pub fn from_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, ConfigError> {
        let file = Path::new(&filepath);
        if !file.is_file() {
            return Err(ConfigError::Io {
                path: file.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
            });
        }

        let built = config::Config::builder()
            .add_source(config::File::new(&file.to_string_lossy(), config::FileFormat::Json))
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        let doc: RigConfig = built
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        doc.camera_settings.default.validate()?;
        for partial in doc.camera_settings.overrides.values() {
            partial.validate()?;
        }
        for serial in doc.camera_settings.overrides.keys() {
            if !doc.camera_positions.iter().any(|p| &p.full_serial == serial) {
                return Err(ConfigError::UnknownSerial(serial.clone()));
            }
        }

        Ok(doc)
    }

    /// Logical position assigned to `serial`, or `None` if it is not listed
    /// in `camera_positions` (spec §3: "a serial not listed in configuration
    /// is ignored at discovery").
    pub fn position_for_serial(&self, serial: &str) -> Option<u32> {
        self.camera_positions
            .iter()
            .find(|p| p.full_serial == serial)
            .map(|p| p.position)
    }

    /// Resolve the effective `ParameterSet` for a serial: compiled defaults,
    /// then the document's `camera_settings.default`, then that camera's
    /// entry in `camera_settings.overrides`, each layer overriding only the
    /// fields it sets.
    pub fn parameter_set_for(&self, serial: &str) -> ParameterSet {
        let with_doc_default = self.camera_settings.default.layer_onto(&ParameterSet::default());
        match self.camera_settings.overrides.get(serial) {
            Some(over) => over.layer_onto(&with_doc_default),
            None => with_doc_default,
        }
    }

    /// All serials from `camera_positions`, regardless of whether they have
    /// an override entry.
    pub fn known_serials(&self) -> impl Iterator<Item = &str> {
        self.camera_positions.iter().map(|p| p.full_serial.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(json: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("create temp config file");
        f.write_all(json.as_bytes()).expect("write temp config");
        f
    }

    #[test]
    fn unlisted_serial_is_ignored_at_discovery() {
        let json = r#"{
            "camera_positions": [{"position": 3, "full_serial": "S1128470"}],
            "camera_settings": {"default": {}, "overrides": {}}
        }"#;
        let f = write_temp(json);
        let cfg = RigConfig::from_file(f.path()).expect("valid config");
        assert_eq!(cfg.position_for_serial("S1128470"), Some(3));
        assert_eq!(cfg.position_for_serial("S9999999"), None);
    }

    #[test]
    fn override_referencing_unknown_serial_is_fatal() {
        let json = r#"{
            "camera_positions": [{"position": 3, "full_serial": "S1128470"}],
            "camera_settings": {"default": {}, "overrides": {"S0000000": {"gain": 2.0}}}
        }"#;
        let f = write_temp(json);
        let err = RigConfig::from_file(f.path()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSerial(_)));
    }

    #[test]
    fn override_layers_on_top_of_document_default() {
        let json = r#"{
            "camera_positions": [{"position": 3, "full_serial": "S1128470"}],
            "camera_settings": {
                "default": {"exposure_time": 40000, "gain": 1.0},
                "overrides": {"S1128470": {"exposure_time": 500}}
            }
        }"#;
        let f = write_temp(json);
        let cfg = RigConfig::from_file(f.path()).expect("valid config");
        let params = cfg.parameter_set_for("S1128470");
        assert_eq!(params.exposure_time_us, 500);
        assert_eq!(params.gain, 1.0);
    }

    #[test]
    fn out_of_range_default_is_fatal() {
        let json = r#"{
            "camera_positions": [],
            "camera_settings": {"default": {"gain": 10.0}, "overrides": {}}
        }"#;
        let f = write_temp(json);
        let err = RigConfig::from_file(f.path()).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRangeDefault { .. }));
    }
}
