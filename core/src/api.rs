//! External-surface contract (spec §6.2). `CaptureApi` is the "declared but
//! not designed" interface between this crate and the out-of-scope HTTP
//! surface/request-router: the router translates HTTP verbs/paths onto
//! these calls. `RigController` is the one concrete, in-process implementer,
//! driven directly by the CLI (spec §6.4) rather than over HTTP.

use crate::bandwidth::BandwidthController;
use crate::config::RigConfig;
use crate::devices::hardware::camera::DeviceHandle;
use crate::error::{BatchError, ParameterError};
use crate::orchestrator::{BatchOrchestrator, BatchSummary, ConnectedCamera, ProgressEvent};
use crate::pipeline::PipelineServices;
use crate::retry;
use crate::store::{ParameterApplyCache, ParameterStore};
use crate::types::{CameraIdentity, CaptureResult, OutputFormat, ParameterSet, ParameterValue};
use crate::writer::FileWriter;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// One row of `list-cameras` (spec §6.2).
#[derive(Debug, Clone, Serialize)]
pub struct CameraSummary {
    pub serial: String,
    pub position: u32,
    pub connected: bool,
    pub model: String,
    pub params: ParameterSet,
}

/// Runtime-readable limit bounds, exposed alongside `get-parameters` (spec
/// §6.2) so clients don't need to hard-code them.
#[derive(Debug, Clone, Serialize)]
pub struct LimitBounds {
    pub exposure_min_us: i32,
    pub exposure_max_us: i32,
    pub gain_min: f64,
    pub gain_max_nominal: f64,
    pub black_level_min: i32,
    pub black_level_max: i32,
}

impl Default for LimitBounds {
    fn default() -> Self {
        use crate::types::limits;
        Self {
            exposure_min_us: limits::EXPOSURE_MIN_US,
            exposure_max_us: limits::EXPOSURE_MAX_US,
            gain_min: limits::GAIN_MIN,
            gain_max_nominal: limits::GAIN_MAX_NOMINAL,
            black_level_min: limits::BLACK_LEVEL_MIN,
            black_level_max: limits::BLACK_LEVEL_MAX,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParametersView {
    pub params: ParameterSet,
    pub limits: LimitBounds,
}

/// The contract the router consumes (spec §6.2 table, one method per row).
pub trait CaptureApi {
    fn list_cameras(&self) -> Vec<CameraSummary>;
    fn get_camera(&self, serial: &str) -> Option<CameraSummary>;
    fn get_parameters(&self, serial: &str) -> Option<ParametersView>;
    fn set_parameter(&self, serial: &str, name: &str, value: ParameterValue) -> Result<ParameterSet, ParameterError>;
    fn set_parameters(&self, serial: &str, partial: crate::config::PartialParameterSet) -> Result<ParameterSet, ParameterError>;
    fn capture_one(&self, serial: &str, output_dir: &Path, format: OutputFormat) -> Result<CaptureResult, BatchError>;
    fn capture_all(&self, shots: u32, output_dir: &Path, format: OutputFormat) -> Result<BatchSummary, BatchError>;
    fn get_defaults(&self) -> ParameterSet;
    fn set_defaults(&self, params: ParameterSet) -> ParameterSet;
}

struct CameraSlot {
    identity: CameraIdentity,
    model: String,
    device: Option<DeviceHandle>,
}

/// The in-process controller: owns the Parameter Store, Bandwidth
/// Controller, File Writer, and the discovered camera slots, and implements
/// `CaptureApi` directly against them.
pub struct RigController {
    store: Arc<ParameterStore>,
    bandwidth: Arc<BandwidthController>,
    apply_cache: Arc<ParameterApplyCache>,
    writer: Arc<FileWriter>,
    cameras: Mutex<Vec<CameraSlot>>,
}

impl RigController {
    /// Build a controller from a loaded configuration and a list of
    /// discovered `(handle, identity, model)` triples — connecting is the
    /// caller's job (it requires the vendor SDK's enumeration, which this
    /// crate does not perform on its own at construction time).
    pub fn new(config: &RigConfig, discovered: Vec<(DeviceHandle, String, String)>) -> Self {
        let store = Arc::new(ParameterStore::new(ParameterSet::default()));
        for serial in config.known_serials() {
            store.seed(serial, config.parameter_set_for(serial));
        }

        let mut cameras = Vec::new();
        for (device, serial, model) in discovered {
            let Some(position) = config.position_for_serial(&serial) else {
                warn!(camera = %serial, "discovered camera is not in the configuration; ignoring");
                continue;
            };
            cameras.push(CameraSlot {
                identity: CameraIdentity { serial, position },
                model,
                device: Some(device),
            });
        }

        Self {
            store,
            bandwidth: Arc::new(BandwidthController::new(cameras.len().max(1) as u32)),
            apply_cache: Arc::new(ParameterApplyCache::default()),
            writer: FileWriter::start(),
            cameras: Mutex::new(cameras),
        }
    }

    fn services(&self) -> PipelineServices {
        PipelineServices {
            bandwidth: self.bandwidth.clone(),
            store: self.store.clone(),
            apply_cache: self.apply_cache.clone(),
            writer: self.writer.clone(),
        }
    }

    pub fn shutdown(&self) {
        self.writer.shutdown();
    }
}

impl CaptureApi for RigController {
    fn list_cameras(&self) -> Vec<CameraSummary> {
        let cameras = self.cameras.lock().expect("camera table poisoned");
        cameras
            .iter()
            .map(|slot| CameraSummary {
                serial: slot.identity.serial.clone(),
                position: slot.identity.position,
                connected: slot.device.is_some(),
                model: slot.model.clone(),
                params: self.store.get(&slot.identity.serial),
            })
            .collect()
    }

    fn get_camera(&self, serial: &str) -> Option<CameraSummary> {
        self.list_cameras().into_iter().find(|c| c.serial == serial)
    }

    fn get_parameters(&self, serial: &str) -> Option<ParametersView> {
        let cameras = self.cameras.lock().expect("camera table poisoned");
        if !cameras.iter().any(|c| c.identity.serial == serial) {
            return None;
        }
        Some(ParametersView {
            params: self.store.get(serial),
            limits: LimitBounds::default(),
        })
    }

    fn set_parameter(&self, serial: &str, name: &str, value: ParameterValue) -> Result<ParameterSet, ParameterError> {
        self.store.set(serial, name, value, "api")
    }

    fn set_parameters(&self, serial: &str, partial: crate::config::PartialParameterSet) -> Result<ParameterSet, ParameterError> {
        let current = self.store.get(serial);
        let merged = partial.layer_onto(&current);
        self.store.set_bulk(serial, merged.clone())?;
        Ok(merged)
    }

    fn capture_one(&self, serial: &str, output_dir: &Path, format: OutputFormat) -> Result<CaptureResult, BatchError> {
        let mut cameras = self.cameras.lock().expect("camera table poisoned");
        let slot = cameras
            .iter_mut()
            .find(|c| c.identity.serial == serial)
            .ok_or(BatchError::NoCameras)?;
        let device = slot.device.as_mut().ok_or(BatchError::NoCameras)?;

        // Spec §8 Scenario 1 expects the file directly under `output_dir`
        // (`./out/pos03_1128470_shot01_01_<ts>.tiff`), not nested under a
        // session subdirectory — that grouping is `capture_all`'s job
        // (spec §6.3), not a single capture's.
        std::fs::create_dir_all(output_dir).map_err(|e| BatchError::SessionDirectory {
            path: output_dir.to_path_buf(),
            source: e,
        })?;
        let filename = format!(
            "pos{:02}_{}_shot01_01_{}.{}",
            slot.identity.position,
            slot.identity.serial_suffix(),
            chrono::Utc::now().format("%Y%m%d_%H%M%S"),
            format.extension(),
        );
        let path = output_dir.join(filename);

        let services = self.services();
        let result = retry::capture_with_retries(&services, &slot.identity, device, path, format);
        Ok(result)
    }

    fn capture_all(&self, shots: u32, output_dir: &Path, format: OutputFormat) -> Result<BatchSummary, BatchError> {
        let mut cameras = self.cameras.lock().expect("camera table poisoned");

        let mut disconnected_failures: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
        let mut connected: Vec<ConnectedCamera> = Vec::new();
        for slot in cameras.iter_mut() {
            match slot.device.take() {
                Some(device) => connected.push(ConnectedCamera {
                    identity: slot.identity.clone(),
                    device,
                }),
                None => crate::orchestrator::skip_disconnected(&slot.identity.serial, &mut disconnected_failures),
            }
        }

        let orchestrator = BatchOrchestrator::new(self.services());
        let mut summary = orchestrator.run(&mut connected, shots, output_dir, format, |event| match event {
            ProgressEvent::SubBatchStarted { shot, cameras } => {
                tracing::info!(shot, ?cameras, "sub-batch started")
            }
            ProgressEvent::SubBatchCompleted { shot, elapsed_ms } => {
                tracing::info!(shot, elapsed_ms, "sub-batch completed")
            }
        })?;

        for (serial, count) in disconnected_failures {
            *summary.per_camera_failures.entry(serial).or_insert(0) += count;
        }

        // Hand device handles back to their slots now that capture is done.
        let mut by_serial: std::collections::HashMap<String, DeviceHandle> =
            connected.into_iter().map(|c| (c.identity.serial, c.device)).collect();
        for slot in cameras.iter_mut() {
            if let Some(device) = by_serial.remove(&slot.identity.serial) {
                slot.device = Some(device);
            }
        }

        Ok(summary)
    }

    fn get_defaults(&self) -> ParameterSet {
        self.store.default_params()
    }

    fn set_defaults(&self, params: ParameterSet) -> ParameterSet {
        self.store.set_default_params(params.clone());
        params
    }
}
