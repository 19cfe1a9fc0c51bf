//! Configuration and serialization module.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{DatasetError, Result};
use crate::recon::ReconConfig;

/// Physical role of a camera in the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraRole {
    /// Lensless diffuser sensor.
    #[serde(rename = "diffusercam")]
    DiffuserCam,
    /// Random microlens sensor.
    #[serde(rename = "rml")]
    Rml,
    /// Conventional lensed reference.
    #[serde(rename = "ground_truth")]
    GroundTruth,
}

impl CameraRole {
    /// Directory name used for this camera's frames inside a session.
    pub fn dir_name(&self) -> &'static str {
        match self {
            CameraRole::DiffuserCam => "diffusercam",
            CameraRole::Rml => "rml",
            CameraRole::GroundTruth => "ground_truth",
        }
    }
}

impl std::fmt::Display for CameraRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// Binding of a physical device to a logical slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceBinding {
    /// Device serial number.
    pub serial: String,
    /// Logical slot index.
    pub slot: usize,
    /// Role of the camera.
    pub role: CameraRole,
    /// Exposure time in microseconds.
    pub exposure_us: f64,
}

/// Capture session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Devices and their slot bindings.
    pub devices: Vec<DeviceBinding>,
    /// Analog gain applied to every device.
    pub gain: f64,
    /// Pixel format requested from every device.
    pub pixel_format: String,
    /// Wait after presenting a stimulus, in milliseconds.
    pub settle_ms: u64,
    /// Wait between starting acquisition and retrieval, in milliseconds.
    pub trigger_delay_ms: u64,
    /// Retrieval timeout per device, in milliseconds.
    pub grab_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            devices: vec![
                DeviceBinding {
                    serial: "12345678".to_string(),
                    slot: 0,
                    role: CameraRole::DiffuserCam,
                    exposure_us: 80_000.0,
                },
                DeviceBinding {
                    serial: "40270083".to_string(),
                    slot: 1,
                    role: CameraRole::Rml,
                    exposure_us: 80_000.0,
                },
                DeviceBinding {
                    serial: "40412531".to_string(),
                    slot: 2,
                    role: CameraRole::GroundTruth,
                    exposure_us: 1_500.0,
                },
            ],
            gain: 0.0,
            pixel_format: "Mono12".to_string(),
            settle_ms: 500,
            trigger_delay_ms: 200,
            grab_timeout_ms: 1000,
        }
    }
}

impl CaptureConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn trigger_delay(&self) -> Duration {
        Duration::from_millis(self.trigger_delay_ms)
    }

    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(self.grab_timeout_ms)
    }

    /// Check that serials and slots are unique and slots are contiguous from 0.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(DatasetError::Config("no capture devices configured".to_string()));
        }

        let mut serials = HashSet::new();
        let mut slots = HashSet::new();
        let mut roles = HashSet::new();
        for binding in &self.devices {
            if !serials.insert(binding.serial.as_str()) {
                return Err(DatasetError::Config(format!(
                    "serial {} is bound more than once",
                    binding.serial
                )));
            }
            if !slots.insert(binding.slot) {
                return Err(DatasetError::Config(format!(
                    "slot {} is bound more than once",
                    binding.slot
                )));
            }
            if !roles.insert(binding.role) {
                return Err(DatasetError::Config(format!(
                    "role {} is bound more than once",
                    binding.role
                )));
            }
            if binding.exposure_us <= 0.0 {
                return Err(DatasetError::Config(format!(
                    "exposure for serial {} must be positive",
                    binding.serial
                )));
            }
        }

        if let Some(missing) = (0..self.devices.len()).find(|s| !slots.contains(s)) {
            return Err(DatasetError::Config(format!(
                "slots must be contiguous from 0, slot {} is missing",
                missing
            )));
        }

        Ok(())
    }

    /// Binding for a slot, if configured.
    pub fn binding_for_slot(&self, slot: usize) -> Option<&DeviceBinding> {
        self.devices.iter().find(|b| b.slot == slot)
    }
}

/// Top-level configuration file covering capture and reconstruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Capture session settings.
    pub capture: CaptureConfig,
    /// Solver settings for lensless reconstruction.
    pub recon: ReconConfig,
    /// Cameras whose captures are reconstructed.
    pub recon_cameras: Vec<CameraRole>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            recon: ReconConfig::default(),
            recon_cameras: vec![CameraRole::DiffuserCam, CameraRole::Rml],
        }
    }
}

impl DatasetConfig {
    /// Load from a JSON file; absent fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let config: DatasetConfig = load_json(path)?;
        config.capture.validate()?;
        Ok(config)
    }
}

/// Read and deserialize a JSON file.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path).map_err(|e| DatasetError::io(path, e))?;
    serde_json::from_str(&contents).map_err(|e| DatasetError::json(path, e))
}

/// Serialize to pretty JSON and write to `path`.
pub fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| DatasetError::json(path, e))?;
    std::fs::write(path, json).map_err(|e| DatasetError::io(path, e))
}
