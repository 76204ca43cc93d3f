//! Capture Pipeline (spec §4.E): one capture attempt, end to end, as a plain
//! state-machine function returning a `Result` — no `try`/`catch` across the
//! worker boundary, per spec §9's "exceptions across worker boundaries"
//! design note. Every stage is a private free function so the state order
//! reads top to bottom in `run_attempt`.

use crate::bandwidth::BandwidthController;
use crate::devices::hardware::camera::{ConvertedFrame, DeviceHandle, FeatureValue, GrabbedBuffer};
use crate::error::{DeviceError, PipelineError};
use crate::store::{ParameterApplyCache, ParameterStore};
use crate::types::{CaptureResult, ParameterSet};
use crate::writer::FileWriter;
use image::GenericImageView;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Bright-pixel threshold on an 8-bit channel (spec GLOSSARY).
const BRIGHT_CHANNEL_THRESHOLD: u8 = 30;
/// Below this bright-pixel percentage a frame is dark (spec GLOSSARY).
const DARK_THRESHOLD_PERCENT: u8 = 12;
const WAIT_MAX_RETRIES: u32 = 3;
const WAIT_RETRY_PAUSE: Duration = Duration::from_millis(200);
const WAIT_RETRY_EXTENSION: Duration = Duration::from_secs(5);
const CONVERT_RETRY_PAUSE: Duration = Duration::from_millis(50);
const THROTTLED_CONVERT_LEAD_PAUSE: Duration = Duration::from_millis(25);
const DARK_RESNAP_PAUSE: Duration = Duration::from_millis(300);

/// Shared services a capture worker needs for one attempt; cheap to clone
/// (everything inside is an `Arc`), so one instance is built once and handed
/// to every worker thread.
#[derive(Clone)]
pub struct PipelineServices {
    pub bandwidth: Arc<BandwidthController>,
    pub store: Arc<ParameterStore>,
    pub apply_cache: Arc<ParameterApplyCache>,
    pub writer: Arc<FileWriter>,
}

/// Run one capture attempt against `device` for `serial`, saving to
/// `output_path` in `format`. `ultra_conservative` reflects the retry
/// strategy currently in force (spec §4.F retries 4-5); `retry_count` is
/// copied verbatim into the result for the caller's bookkeeping.
pub fn run_attempt(
    services: &PipelineServices,
    serial: &str,
    device: &mut DeviceHandle,
    output_path: PathBuf,
    format: crate::types::OutputFormat,
    ultra_conservative: bool,
    retry_count: u32,
) -> Result<CaptureResult, PipelineError> {
    let attempt_start = Instant::now();

    // ADMIT. Per spec §7 AdmissionTimeout is non-fatal: on_start/on_end
    // still bracket the attempt even if the slot wait itself timed out.
    if services.bandwidth.await_slot(serial).is_err() {
        warn!(camera = serial, "proceeding past a missed admission slot");
    }
    services.bandwidth.on_start(serial);

    let body = run_body(services, serial, device, &output_path, ultra_conservative);
    let elapsed_ms = attempt_start.elapsed().as_millis() as u64;

    match body {
        Ok((converted, bright_percentage, dark)) => {
            services.writer.enqueue(converted, output_path.clone(), format);
            if dark {
                services.bandwidth.mark_dark_image(serial);
            } else {
                services.bandwidth.clear_dark_flag(serial);
            }
            let success = !dark;
            services.bandwidth.on_end(serial, success, elapsed_ms);
            Ok(CaptureResult {
                success,
                retry_count,
                bright_percentage,
                dark,
                elapsed_ms,
                error: None,
                output_path: success.then_some(output_path),
            })
        }
        Err(e) => {
            services.bandwidth.on_end(serial, false, elapsed_ms);
            Err(e)
        }
    }
}

fn run_body(
    services: &PipelineServices,
    serial: &str,
    device: &mut DeviceHandle,
    output_path: &Path,
    ultra_conservative: bool,
) -> Result<(ConvertedFrame, u8, bool), PipelineError> {
    let params = services.store.get(serial);

    // PARAM_APPLY, gated by the parameter-apply fast path (spec §4.B).
    if services.apply_cache.needs_apply(serial, &params) {
        apply_parameters(device, &params)?;
        std::thread::sleep(param_apply_settle_delay(params.exposure_time_us, ultra_conservative));
    }

    let _ = output_path; // path is only needed once the frame is enqueued, by the caller

    let throttled = services.bandwidth.is_throttled(serial);
    let (converted, bright_percentage, dark) =
        snap_wait_convert_validate(device, params.exposure_time_us, ultra_conservative, throttled)?;

    if !dark {
        return Ok((converted, bright_percentage, dark));
    }

    // Inline one-shot re-snap under ultra-conservative timing (spec §4.E
    // VALIDATE). Any failure here, including another dark result, keeps the
    // original frame.
    std::thread::sleep(DARK_RESNAP_PAUSE);
    match snap_wait_convert_validate(device, params.exposure_time_us, true, throttled) {
        Ok((retry_converted, retry_pct, false)) => Ok((retry_converted, retry_pct, false)),
        _ => Ok((converted, bright_percentage, dark)),
    }
}

/// Apply every field of `params` to the device via its named-feature
/// interface, then observe the Device Adapter's own settling contract for
/// that batch of writes (spec §4.A) before returning control to PARAM_APPLY,
/// which layers its own, longer settle on top (spec §4.E).
fn apply_parameters(device: &mut DeviceHandle, params: &ParameterSet) -> Result<(), DeviceError> {
    device.set_feature("ExposureTime", FeatureValue::Int(params.exposure_time_us as i64))?;
    device.set_feature("Gain", FeatureValue::Float(params.gain))?;
    device.set_feature("BlackLevel", FeatureValue::Int(params.black_level as i64))?;
    device.set_feature("ExposureAuto", FeatureValue::Bool(params.auto_exposure))?;
    device.set_feature("GainAuto", FeatureValue::Bool(params.auto_gain))?;
    device.set_feature("BalanceRatioRed", FeatureValue::Float(params.red_balance))?;
    device.set_feature("BalanceRatioBlue", FeatureValue::Float(params.blue_balance))?;
    device.set_pixel_format(params.pixel_format)?;
    std::thread::sleep(crate::devices::hardware::camera::settling_delay(params.exposure_time_us));
    Ok(())
}

/// 80ms normally, 120ms past 50ms exposure, 500-750ms under
/// ultra-conservative mode (spec §4.E PARAM_APPLY).
fn param_apply_settle_delay(exposure_time_us: i32, ultra_conservative: bool) -> Duration {
    if ultra_conservative {
        if exposure_time_us > 50_000 {
            Duration::from_millis(750)
        } else {
            Duration::from_millis(500)
        }
    } else if exposure_time_us > 50_000 {
        Duration::from_millis(120)
    } else {
        Duration::from_millis(80)
    }
}

/// WAIT deadline: `max(baseline, exposure_us/1000 + buffer_ms)`, doubled
/// again when the camera is currently throttled (spec §4.E WAIT).
fn wait_deadline(exposure_time_us: i32, ultra_conservative: bool, throttled: bool) -> Duration {
    let (baseline_ms, buffer_ms) = if ultra_conservative { (15_000, 12_000) } else { (10_000, 6_000) };
    let computed_ms = exposure_time_us as u64 / 1000 + buffer_ms;
    let mut deadline = Duration::from_millis(baseline_ms.max(computed_ms));
    if throttled {
        deadline *= 2;
    }
    deadline
}

fn snap_wait_convert_validate(
    device: &DeviceHandle,
    exposure_time_us: i32,
    ultra_conservative: bool,
    throttled: bool,
) -> Result<(ConvertedFrame, u8, bool), PipelineError> {
    // SNAP
    device.snap_one_frame()?;

    // WAIT, with up to three progressive-extension retries.
    let buffer = wait_with_retries(device, exposure_time_us, ultra_conservative, throttled)?;

    // CONVERT, retried once.
    let converted = convert_with_retry(device, &buffer, throttled)?;

    // VALIDATE
    let (bright_percentage, sampled) = sample_brightness(&converted.image);
    if sampled == 0 {
        return Err(PipelineError::Validation("buffer has zero-area dimensions".to_string()));
    }
    let dark = bright_percentage < DARK_THRESHOLD_PERCENT;
    Ok((converted, bright_percentage, dark))
}

fn wait_with_retries(
    device: &DeviceHandle,
    exposure_time_us: i32,
    ultra_conservative: bool,
    throttled: bool,
) -> Result<GrabbedBuffer, PipelineError> {
    let mut deadline = wait_deadline(exposure_time_us, ultra_conservative, throttled);
    let mut attempts = 0u32;
    loop {
        match device.wait_for_completion(deadline) {
            Ok(buffer) => return Ok(buffer),
            Err(_) => {
                attempts += 1;
                if attempts > WAIT_MAX_RETRIES {
                    device.abort_transfer();
                    return Err(PipelineError::TransportTimeout { attempts });
                }
                std::thread::sleep(WAIT_RETRY_PAUSE);
                device.abort_transfer();
                deadline += WAIT_RETRY_EXTENSION;
            }
        }
    }
}

fn convert_with_retry(
    device: &DeviceHandle,
    buffer: &GrabbedBuffer,
    throttled: bool,
) -> Result<ConvertedFrame, PipelineError> {
    if throttled {
        std::thread::sleep(THROTTLED_CONVERT_LEAD_PAUSE);
    }
    match device.color_convert(buffer) {
        Ok(frame) => Ok(frame),
        Err(_) => {
            std::thread::sleep(CONVERT_RETRY_PAUSE);
            Ok(device.color_convert(buffer)?)
        }
    }
}

/// Sample up to 1000 pixels at a fixed stride and compute the bright-pixel
/// percentage (spec §4.E VALIDATE). Returns `(percentage, sampled_count)`;
/// `sampled_count == 0` signals a zero-area buffer.
fn sample_brightness(image: &image::DynamicImage) -> (u8, usize) {
    let (width, height) = image.dimensions();
    let total = width as usize * height as usize;
    if total == 0 {
        return (0, 0);
    }
    let stride = (total / 1000).max(1);
    let mut bright = 0usize;
    let mut sampled = 0usize;
    let mut index = 0usize;
    while index < total {
        let x = (index % width as usize) as u32;
        let y = (index / width as usize) as u32;
        let pixel = image.get_pixel(x, y);
        if pixel[0] > BRIGHT_CHANNEL_THRESHOLD || pixel[1] > BRIGHT_CHANNEL_THRESHOLD || pixel[2] > BRIGHT_CHANNEL_THRESHOLD
        {
            bright += 1;
        }
        sampled += 1;
        index += stride;
    }
    (((bright * 100) / sampled) as u8, sampled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};

    #[test]
    fn all_dark_image_is_below_threshold() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(100, 100));
        let (pct, sampled) = sample_brightness(&image);
        assert_eq!(pct, 0);
        assert!(sampled > 0);
    }

    #[test]
    fn all_bright_image_is_above_threshold() {
        let mut buf = RgbImage::new(100, 100);
        for p in buf.pixels_mut() {
            *p = image::Rgb([200, 200, 200]);
        }
        let image = DynamicImage::ImageRgb8(buf);
        let (pct, _) = sample_brightness(&image);
        assert_eq!(pct, 100);
    }

    #[test]
    fn zero_area_buffer_reports_no_samples() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        let (_, sampled) = sample_brightness(&image);
        assert_eq!(sampled, 0);
    }

    #[test]
    fn settle_delay_escalates_under_ultra_conservative_mode() {
        assert_eq!(param_apply_settle_delay(10_000, false), Duration::from_millis(80));
        assert_eq!(param_apply_settle_delay(60_000, false), Duration::from_millis(120));
        assert_eq!(param_apply_settle_delay(10_000, true), Duration::from_millis(500));
        assert_eq!(param_apply_settle_delay(60_000, true), Duration::from_millis(750));
    }

    #[test]
    fn wait_deadline_doubles_when_throttled() {
        let normal = wait_deadline(40_000, false, false);
        let throttled = wait_deadline(40_000, false, true);
        assert_eq!(throttled, normal * 2);
    }

    #[test]
    fn wait_deadline_uses_the_larger_of_baseline_and_computed() {
        assert_eq!(wait_deadline(1_000_000, false, false), Duration::from_millis(1_000_000 / 1000 + 6_000));
        assert_eq!(wait_deadline(1_000, false, false), Duration::from_millis(10_000));
    }
}
