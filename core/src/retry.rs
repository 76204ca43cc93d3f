//! Retry Engine (spec §4.F): wraps the Capture Pipeline with up to five
//! retries (six attempts total), reshaping exposure/gain in the Parameter
//! Store between attempts so the new values persist past the attempt.

use crate::devices::hardware::camera::DeviceHandle;
use crate::pipeline::{self, PipelineServices};
use crate::types::{limits, CameraIdentity, CaptureResult, OutputFormat};
use std::path::PathBuf;
use tracing::{info, warn};

pub const MAX_RETRIES: u32 = 5;

/// One row of the retry strategy table (spec §4.F). `ultra_conservative`
/// marks retries 4 and 5, which also widen the pipeline's own WAIT/CONVERT
/// timing.
struct RetryStrategy {
    settle: std::time::Duration,
    ultra_conservative: bool,
    apply: fn(&crate::store::ParameterStore, &str),
}

fn strategy_for(retry_number: u32) -> RetryStrategy {
    use std::time::Duration;
    match retry_number {
        1 => RetryStrategy {
            settle: Duration::from_millis(500),
            ultra_conservative: false,
            apply: |store, serial| {
                let current = store.get(serial).exposure_time_us;
                let doubled = (current * 2).min(limits::EXPOSURE_MAX_DESPERATE_US);
                force_set_exposure(store, serial, doubled);
            },
        },
        2 => RetryStrategy {
            settle: Duration::from_millis(300),
            ultra_conservative: false,
            apply: |store, serial| {
                let current = store.get(serial).gain;
                let scaled = (current * 1.5).min(limits::GAIN_MAX_DESPERATE);
                let _ = force_set_gain(store, serial, scaled);
            },
        },
        3 => RetryStrategy {
            settle: Duration::from_millis(750),
            ultra_conservative: false,
            apply: |store, serial| {
                force_set_exposure(store, serial, 100_000);
                let _ = force_set_gain(store, serial, 4.0);
            },
        },
        4 => RetryStrategy {
            settle: Duration::from_millis(1_000),
            ultra_conservative: true,
            apply: |store, serial| {
                force_set_exposure(store, serial, 120_000);
                let _ = force_set_gain(store, serial, 5.0);
            },
        },
        _ => RetryStrategy {
            settle: Duration::from_millis(1_500),
            ultra_conservative: true,
            apply: |store, serial| {
                force_set_exposure(store, serial, 150_000);
                let _ = force_set_gain(store, serial, 6.0);
            },
        },
    }
}

/// Retries 1, 3-5 force exposure/gain past the nominal ceiling (up to the
/// desperate ceiling of 150000µs / 6.0), so they bypass the nominal bound
/// and write through `set_bulk_desperate` with an already-valid full set.
fn force_set_exposure(store: &crate::store::ParameterStore, serial: &str, exposure_time_us: i32) {
    let mut params = store.get(serial);
    params.exposure_time_us = exposure_time_us;
    if let Err(e) = store.set_bulk_desperate(serial, params) {
        warn!(camera = serial, error = %e, "retry engine could not force exposure");
    }
}

fn force_set_gain(store: &crate::store::ParameterStore, serial: &str, gain: f64) -> Result<(), crate::error::ParameterError> {
    let mut params = store.get(serial);
    params.gain = gain;
    store.set_bulk_desperate(serial, params)
}

/// Run the pipeline up to six times for one shot of one camera, reshaping
/// parameters between failures per the strategy table, and return the final
/// `CaptureResult` (always `Ok` from the caller's point of view: exhaustion
/// is reported via `CaptureResult::success == false`, not an `Err`).
pub fn capture_with_retries(
    services: &PipelineServices,
    camera: &CameraIdentity,
    device: &mut DeviceHandle,
    output_path: PathBuf,
    format: OutputFormat,
) -> CaptureResult {
    let serial = camera.serial.as_str();
    let mut retry_count = 0u32;
    let mut ultra_conservative = false;
    let mut last_error: Option<String> = None;

    loop {
        let attempt = pipeline::run_attempt(
            services,
            serial,
            device,
            output_path.clone(),
            format,
            ultra_conservative,
            retry_count,
        );

        match attempt {
            Ok(result) if result.success => {
                if retry_count > 0 {
                    info!(camera = serial, retries = retry_count, "capture recovered after retry");
                }
                return result;
            }
            Ok(dark_result) => {
                // Dark and exhausted the pipeline's own inline re-snap.
                if retry_count >= MAX_RETRIES {
                    services.bandwidth.escalate(serial);
                    return dark_result;
                }
                retry_count += 1;
                let strategy = strategy_for(retry_count);
                (strategy.apply)(&services.store, serial);
                ultra_conservative = strategy.ultra_conservative;
                std::thread::sleep(strategy.settle);
            }
            Err(e) => {
                last_error = Some(e.to_string());
                if retry_count >= MAX_RETRIES {
                    if matches!(e, crate::error::PipelineError::TransportTimeout { .. }) {
                        services.bandwidth.escalate(serial);
                    }
                    return CaptureResult {
                        success: false,
                        retry_count,
                        bright_percentage: 0,
                        dark: false,
                        elapsed_ms: 0,
                        error: last_error,
                        output_path: None,
                    };
                }
                retry_count += 1;
                let strategy = strategy_for(retry_count);
                (strategy.apply)(&services.store, serial);
                ultra_conservative = strategy.ultra_conservative;
                std::thread::sleep(strategy.settle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ParameterStore;
    use crate::types::ParameterSet;

    #[test]
    fn retry_one_doubles_exposure_and_caps_at_desperate_ceiling() {
        let store = ParameterStore::new(ParameterSet {
            exposure_time_us: 90_000,
            ..ParameterSet::default()
        });
        store.seed("S1", store.get("S1"));
        let strategy = strategy_for(1);
        (strategy.apply)(&store, "S1");
        assert_eq!(store.get("S1").exposure_time_us, limits::EXPOSURE_MAX_DESPERATE_US);
    }

    #[test]
    fn retry_five_forces_last_resort_values() {
        let store = ParameterStore::new(ParameterSet::default());
        let strategy = strategy_for(5);
        (strategy.apply)(&store, "S1");
        let params = store.get("S1");
        assert_eq!(params.exposure_time_us, 150_000);
        assert_eq!(params.gain, 6.0);
    }
}
