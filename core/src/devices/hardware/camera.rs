//! Device Adapter (spec §4.A): a thin facade over the vendor camera SDK.
//!
//! A connected camera is represented by a single owning resource, the
//! handle quadruple of spec §3/§9 (device, buffer ring, transfer,
//! color-converter), bound here to the concrete GenICam vendor binding this
//! rig uses, `aravis`. The rest of the crate never touches `aravis` types
//! directly; everything above this module goes through `DeviceHandle`.

use crate::error::DeviceError;
use crate::types::{OutputFormat, PixelFormatTag};
use aravis::{Camera, CameraExt, CameraExtManual, StreamExt};
use image::DynamicImage;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A named, typed feature value, mirroring the genicam set/get-feature
/// contract in spec §4.A. The teacher's camera builder already reaches for
/// the matching generic aravis calls (`set_float`, `set_string`, ...) for
/// exactly this kind of loosely-typed device feature.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

fn pixel_format_to_aravis(tag: PixelFormatTag) -> aravis::PixelFormat {
    match tag {
        PixelFormatTag::BayerRg8 => aravis::PixelFormat::BAYER_RG_8,
        PixelFormatTag::Rgb8Packed => aravis::PixelFormat::RGB_8_PACKED,
        PixelFormatTag::Rgb8Planar => aravis::PixelFormat::RGB_8_PLANAR,
    }
}

/// Identity discovered when opening a device: the bits the host
/// configuration keys off.
#[derive(Debug, Clone)]
pub struct DiscoveredIdentity {
    pub serial: String,
    pub model: String,
}

/// One converted frame, ready for brightness validation and/or save.
pub struct ConvertedFrame {
    pub image: DynamicImage,
}

/// An opaque, grabbed-but-not-yet-converted buffer. `aravis::Buffer` is a
/// refcounted GObject wrapper, so cloning it is cheap and only bumps a
/// refcount; this lets CONVERT retry against the same grabbed buffer (spec
/// §4.E) without re-triggering SNAP/WAIT.
#[derive(Clone)]
pub struct GrabbedBuffer(aravis::Buffer);

/// The owning resource for one connected camera: device handle, transfer
/// stream, and buffer ring. Destruction releases every sub-resource even if
/// construction only partially completed, per spec §4.A.
pub struct DeviceHandle {
    camera: Camera,
    stream: aravis::Stream,
    width: usize,
    height: usize,
    pixel_format: aravis::PixelFormat,
}

impl DeviceHandle {
    /// Open the device at `enumeration_index` as reported by the vendor
    /// SDK's device list, producing a connected handle plus the discovered
    /// serial/model, or a `DeviceError` (spec §4.A).
    pub fn discover(enumeration_index: u32) -> Result<(Self, DiscoveredIdentity), DeviceError> {
        aravis::update_device_list();
        let device_id = aravis::get_device_id(enumeration_index).ok_or_else(|| DeviceError::Open {
            address: format!("index {enumeration_index}"),
            reason: "no device at that enumeration index".to_string(),
        })?;

        let camera = Camera::new(Some(&device_id)).map_err(|e| DeviceError::Open {
            address: device_id.clone(),
            reason: e.to_string(),
        })?;

        let serial = aravis::get_device_serial_nbr(enumeration_index).unwrap_or_else(|| device_id.clone());
        let model = aravis::get_device_model(enumeration_index).unwrap_or_else(|| "unknown".to_string());

        let stream = camera.create_stream().map_err(|e| DeviceError::Open {
            address: device_id.clone(),
            reason: format!("failed to create transfer stream: {e}"),
        })?;

        let (_, _, w, h) = camera.region().map_err(|e| DeviceError::Open {
            address: device_id.clone(),
            reason: format!("failed to read sensor region: {e}"),
        })?;
        let pixel_format = camera.pixel_format().map_err(|e| DeviceError::Open {
            address: device_id,
            reason: format!("failed to read pixel format: {e}"),
        })?;

        let handle = Self {
            camera,
            stream,
            width: w as usize,
            height: h as usize,
            pixel_format,
        };

        Ok((handle, DiscoveredIdentity { serial, model }))
    }

    /// Set a named device feature, dispatching on the value's type.
    pub fn set_feature(&self, name: &str, value: FeatureValue) -> Result<(), DeviceError> {
        let result = match value {
            FeatureValue::Int(v) => self.camera.set_integer(name, v),
            FeatureValue::Float(v) => self.camera.set_float(name, v),
            FeatureValue::Str(ref v) => self.camera.set_string(name, v),
            FeatureValue::Bool(v) => self.camera.set_boolean(name, v),
        };
        result.map_err(|e| DeviceError::SetFeature {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Apply the camera's pixel format feature (used once at parameter
    /// application, not on the per-feature fast path).
    pub fn set_pixel_format(&mut self, tag: PixelFormatTag) -> Result<(), DeviceError> {
        let format = pixel_format_to_aravis(tag);
        self.camera.set_pixel_format(format).map_err(|e| DeviceError::SetFeature {
            name: "PixelFormat".to_string(),
            reason: e.to_string(),
        })?;
        self.pixel_format = format;
        Ok(())
    }

    /// Read a named device feature as a float (exposure/gain-style
    /// features); used by tests and diagnostics.
    pub fn get_feature_float(&self, name: &str) -> Result<f64, DeviceError> {
        self.camera.get_float(name).map_err(|e| DeviceError::GetFeature {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    fn build_buffer(&self) -> aravis::Buffer {
        aravis::Buffer::new_leaked_image(self.pixel_format, self.width, self.height)
    }

    /// One-shot frame trigger (spec §4.E SNAP). Pushes a fresh buffer into
    /// the ring, then issues a software trigger.
    pub fn snap_one_frame(&self) -> Result<(), DeviceError> {
        self.stream.push_buffer(&self.build_buffer());
        self.camera
            .software_trigger()
            .map_err(|e| DeviceError::Snap(e.to_string()))
    }

    /// Block until the triggered frame's buffer is ready or `deadline`
    /// elapses (spec §4.E WAIT). Polls rather than truly blocking because
    /// the underlying transfer stream only exposes a non-blocking pop.
    pub fn wait_for_completion(&self, deadline: Duration) -> Result<GrabbedBuffer, DeviceError> {
        let start = Instant::now();
        const POLL_INTERVAL: Duration = Duration::from_millis(10);
        loop {
            if let Some(buffer) = self.stream.try_pop_buffer() {
                return Ok(GrabbedBuffer(buffer));
            }
            if start.elapsed() >= deadline {
                return Err(DeviceError::Snap("buffer wait deadline exceeded".to_string()));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Abort the in-flight transfer and restart the stream thread so the
    /// next WAIT attempt starts clean (spec §4.E WAIT retry).
    pub fn abort_transfer(&self) {
        self.stream.stop_thread(true);
        self.stream.start_thread();
        self.stream.push_buffer(&self.build_buffer());
    }

    /// Bayer -> RGB color conversion of a grabbed buffer (spec §4.E
    /// CONVERT). Takes the buffer by reference so a failed conversion can be
    /// retried against the same grab. Safety: `into_image` assumes the
    /// buffer is backed by the leaked allocation `build_buffer` produces,
    /// which holds for every buffer this handle hands back from
    /// `wait_for_completion`.
    #[allow(unsafe_code)]
    pub fn color_convert(&self, buffer: &GrabbedBuffer) -> Result<ConvertedFrame, DeviceError> {
        let image = unsafe { buffer.0.clone().into_image() }.map_err(|e| DeviceError::Conversion(e.to_string()))?;
        Ok(ConvertedFrame { image })
    }

    /// Save a converted buffer to `path` in the requested container format
    /// (spec §4.A save-converted-buffer-to).
    pub fn save_to(frame: &ConvertedFrame, path: &Path, _format: OutputFormat) -> Result<(), DeviceError> {
        frame.image.save(path).map_err(|e| DeviceError::Save {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.stream.stop_thread(true);
        if let Err(e) = self.camera.stop_acquisition() {
            warn!("{}", DeviceError::Teardown(e.to_string()));
        }
        debug!("device handle torn down");
    }
}

/// Settling delay observed after a batch of feature writes, proportional to
/// the freshly-applied exposure time (spec §4.A Settling contract).
pub fn settling_delay(exposure_time_us: i32) -> Duration {
    if exposure_time_us > 50_000 {
        Duration::from_millis(50)
    } else if exposure_time_us > 30_000 {
        Duration::from_millis(35)
    } else {
        Duration::from_millis(25)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settling_delay_escalates_with_exposure() {
        assert_eq!(settling_delay(10_000), Duration::from_millis(25));
        assert_eq!(settling_delay(31_000), Duration::from_millis(35));
        assert_eq!(settling_delay(51_000), Duration::from_millis(50));
    }
}
