//! Capture device abstraction and slot-bound device array.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use image::{ImageBuffer, Luma};

use crate::config::CaptureConfig;
use crate::error::{DatasetError, Result};

/// Opaque identifier attached to a device and echoed in its grab results.
pub type DeviceContext = u32;

/// Per-device acquisition settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    pub gain: f64,
    pub pixel_format: String,
    pub exposure_us: f64,
}

/// Device-level error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("device {0} is not open")]
    NotOpen(String),

    #[error("device {serial} rejected configuration: {message}")]
    Configuration { serial: String, message: String },

    #[error("device {serial} could not start acquisition: {message}")]
    Start { serial: String, message: String },

    #[error("exposure on {serial}: requested {requested} us, device reports {actual} us")]
    ExposureMismatch {
        serial: String,
        requested: f64,
        actual: f64,
    },

    #[error("device serial {0} has no slot binding")]
    UnboundSerial(String),

    #[error("slot {0} has no attached device")]
    UnattachedSlot(usize),

    #[error("device serial {0} was enumerated more than once")]
    DuplicateSerial(String),
}

/// Why a single grab attempt produced no frame.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GrabFailure {
    /// Retrieval exceeded the timeout.
    #[error("timeout")]
    Timeout,
    /// Device reported an unsuccessful grab.
    #[error("grab failed: {0}")]
    Grab(String),
    /// Acquisition could not be started.
    #[error("start failed: {0}")]
    Start(String),
    /// Frame was grabbed but could not be written.
    #[error("persist failed: {0}")]
    Persist(String),
    /// Stimulus could not be presented.
    #[error("presentation failed: {0}")]
    Presentation(String),
}

/// Raw monochrome sensor frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Row-major samples, right-aligned (12-bit data occupies 0..4096).
    pub data: Vec<u16>,
}

impl RawFrame {
    /// (min, max, mean) of the samples.
    pub fn stats(&self) -> (u16, u16, f64) {
        if self.data.is_empty() {
            return (0, 0, 0.0);
        }
        let min = self.data.iter().copied().min().unwrap_or(0);
        let max = self.data.iter().copied().max().unwrap_or(0);
        let mean = self.data.iter().map(|&v| v as f64).sum::<f64>() / self.data.len() as f64;
        (min, max, mean)
    }

    /// Write as a 16-bit grayscale image; the format follows the extension.
    pub fn save(&self, path: &Path) -> Result<()> {
        let buffer: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_raw(self.width, self.height, self.data.clone()).ok_or(
                DatasetError::ShapeMismatch {
                    what: "raw frame buffer",
                    expected: (self.width, self.height),
                    found: (self.data.len() as u32, 1),
                },
            )?;
        buffer.save(path).map_err(|e| DatasetError::image(path, e))
    }
}

/// Result of one retrieval.
#[derive(Debug, Clone)]
pub struct GrabResult {
    /// Context of the device that produced the result.
    pub context: DeviceContext,
    pub outcome: std::result::Result<RawFrame, GrabFailure>,
}

/// A triggerable capture device.
pub trait CaptureDevice: Send {
    /// Serial number used for slot binding.
    fn serial(&self) -> &str;

    fn open(&mut self) -> std::result::Result<(), DeviceError>;

    fn close(&mut self);

    /// Attach the context echoed in every subsequent [`GrabResult`].
    fn set_context(&mut self, context: DeviceContext);

    fn configure(&mut self, settings: &DeviceSettings) -> std::result::Result<(), DeviceError>;

    /// Exposure currently applied by the device, in microseconds.
    fn exposure_us(&self) -> std::result::Result<f64, DeviceError>;

    fn start_grabbing(&mut self) -> std::result::Result<(), DeviceError>;

    /// Block for at most `timeout` waiting for one frame.
    fn retrieve(&mut self, timeout: Duration) -> GrabResult;

    fn stop_grabbing(&mut self);
}

/// Immutable mapping from device serial to logical slot.
#[derive(Debug, Clone, Default)]
pub struct SlotMap {
    slots: HashMap<String, usize>,
}

impl SlotMap {
    pub fn from_config(config: &CaptureConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            slots: config
                .devices
                .iter()
                .map(|b| (b.serial.clone(), b.slot))
                .collect(),
        })
    }

    pub fn slot_of(&self, serial: &str) -> Option<usize> {
        self.slots.get(serial).copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Exposure read-back tolerance in microseconds.
const EXPOSURE_TOLERANCE_US: f64 = 0.5;

/// Devices attached to their slots for one session.
pub struct DeviceArray {
    devices: Vec<Box<dyn CaptureDevice>>,
    /// Slot of each device, by position in `devices`.
    slots: Vec<usize>,
    contexts: HashMap<DeviceContext, usize>,
    open: bool,
}

impl DeviceArray {
    /// Bind every device to its slot. Each slot of `slot_map` must be
    /// covered by exactly one device.
    pub fn attach(
        mut devices: Vec<Box<dyn CaptureDevice>>,
        slot_map: &SlotMap,
    ) -> std::result::Result<Self, DeviceError> {
        let mut slots = Vec::with_capacity(devices.len());
        let mut contexts = HashMap::new();

        for device in devices.iter_mut() {
            let slot = slot_map
                .slot_of(device.serial())
                .ok_or_else(|| DeviceError::UnboundSerial(device.serial().to_string()))?;
            if slots.contains(&slot) {
                return Err(DeviceError::DuplicateSerial(device.serial().to_string()));
            }
            let context = slot as DeviceContext;
            device.set_context(context);
            contexts.insert(context, slot);
            slots.push(slot);
            log::info!("Set context {} for camera {}", context, device.serial());
        }

        if let Some(missing) = (0..slot_map.len()).find(|s| !slots.contains(s)) {
            return Err(DeviceError::UnattachedSlot(missing));
        }

        Ok(Self {
            devices,
            slots,
            contexts,
            open: false,
        })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn open(&mut self) -> std::result::Result<(), DeviceError> {
        for device in self.devices.iter_mut() {
            device.open()?;
        }
        self.open = true;
        Ok(())
    }

    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        for device in self.devices.iter_mut() {
            device.close();
        }
        self.open = false;
        log::info!("Closed {} capture device(s)", self.devices.len());
    }

    /// Apply gain, pixel format and per-slot exposure, then verify the
    /// exposure each device reports back.
    pub fn configure(&mut self, config: &CaptureConfig) -> Result<()> {
        for (device, &slot) in self.devices.iter_mut().zip(&self.slots) {
            let binding = config
                .binding_for_slot(slot)
                .ok_or(DeviceError::UnattachedSlot(slot))?;

            let settings = DeviceSettings {
                gain: config.gain,
                pixel_format: config.pixel_format.clone(),
                exposure_us: binding.exposure_us,
            };
            device.configure(&settings)?;

            let actual = device.exposure_us()?;
            if (actual - binding.exposure_us).abs() > EXPOSURE_TOLERANCE_US {
                return Err(DeviceError::ExposureMismatch {
                    serial: device.serial().to_string(),
                    requested: binding.exposure_us,
                    actual,
                }
                .into());
            }

            log::info!(
                "Configured camera {} (slot {}): gain {}, {}, exposure {} us",
                device.serial(),
                slot,
                settings.gain,
                settings.pixel_format,
                actual
            );
        }
        Ok(())
    }

    /// Slot bound to a result context.
    pub fn slot_for_context(&self, context: DeviceContext) -> Option<usize> {
        self.contexts.get(&context).copied()
    }

    /// Slot of the device at `index`.
    pub fn slot_of_device(&self, index: usize) -> usize {
        self.slots[index]
    }

    pub fn device_mut(&mut self, index: usize) -> &mut dyn CaptureDevice {
        self.devices[index].as_mut()
    }
}

impl Drop for DeviceArray {
    fn drop(&mut self) {
        self.close();
    }
}
