//! Emulated capture devices for dry runs and tests.

use std::collections::HashSet;
use std::time::Duration;

use super::device::{
    CaptureDevice, DeviceContext, DeviceError, DeviceSettings, GrabFailure, GrabResult, RawFrame,
};
use crate::config::CaptureConfig;

/// Largest 12-bit sample value.
const MONO12_MAX: u16 = 4095;

/// Software camera producing synthetic 12-bit frames.
///
/// Retrievals are numbered from 0; scripted failures and timeouts refer to
/// that number, which equals the stimulus ordinal when the device is grabbed
/// once per stimulus.
#[derive(Debug, Clone)]
pub struct EmulatedDevice {
    serial: String,
    context: DeviceContext,
    width: u32,
    height: u32,
    open: bool,
    grabbing: bool,
    settings: Option<DeviceSettings>,
    exposure_step: Option<f64>,
    retrievals: usize,
    failures: HashSet<usize>,
    timeouts: HashSet<usize>,
}

impl EmulatedDevice {
    pub fn new(serial: &str, width: u32, height: u32) -> Self {
        Self {
            serial: serial.to_string(),
            context: 0,
            width,
            height,
            open: false,
            grabbing: false,
            settings: None,
            exposure_step: None,
            retrievals: 0,
            failures: HashSet::new(),
            timeouts: HashSet::new(),
        }
    }

    /// Report a grab failure on these retrieval numbers.
    pub fn with_failures(mut self, retrievals: impl IntoIterator<Item = usize>) -> Self {
        self.failures.extend(retrievals);
        self
    }

    /// Report a timeout on these retrieval numbers.
    pub fn with_timeouts(mut self, retrievals: impl IntoIterator<Item = usize>) -> Self {
        self.timeouts.extend(retrievals);
        self
    }

    /// Quantize exposure like real sensors do.
    pub fn with_exposure_step(mut self, step_us: f64) -> Self {
        self.exposure_step = Some(step_us);
        self
    }

    pub fn retrievals(&self) -> usize {
        self.retrievals
    }

    fn synthesize(&self, n: usize) -> RawFrame {
        let exposure = self
            .settings
            .as_ref()
            .map(|s| s.exposure_us)
            .unwrap_or(1000.0);
        // Brighter with longer exposure, saturating at full scale.
        let scale = (exposure / 80_000.0).clamp(0.05, 1.0);
        let period = (self.width + self.height).max(1) as usize;

        let data = (0..self.height)
            .flat_map(|y| (0..self.width).map(move |x| (x, y)))
            .map(|(x, y)| {
                let phase = (x as usize + y as usize + n * 7) % period;
                let v = phase as f64 / period as f64 * MONO12_MAX as f64 * scale;
                v.round().min(MONO12_MAX as f64) as u16
            })
            .collect();

        RawFrame {
            width: self.width,
            height: self.height,
            data,
        }
    }
}

impl CaptureDevice for EmulatedDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn open(&mut self) -> Result<(), DeviceError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.grabbing = false;
        self.open = false;
    }

    fn set_context(&mut self, context: DeviceContext) {
        self.context = context;
    }

    fn configure(&mut self, settings: &DeviceSettings) -> Result<(), DeviceError> {
        if !self.open {
            return Err(DeviceError::NotOpen(self.serial.clone()));
        }
        if settings.pixel_format != "Mono12" && settings.pixel_format != "Mono8" {
            return Err(DeviceError::Configuration {
                serial: self.serial.clone(),
                message: format!("unsupported pixel format {}", settings.pixel_format),
            });
        }
        let mut applied = settings.clone();
        if let Some(step) = self.exposure_step {
            applied.exposure_us = (settings.exposure_us / step).round() * step;
        }
        self.settings = Some(applied);
        Ok(())
    }

    fn exposure_us(&self) -> Result<f64, DeviceError> {
        self.settings
            .as_ref()
            .map(|s| s.exposure_us)
            .ok_or_else(|| DeviceError::NotOpen(self.serial.clone()))
    }

    fn start_grabbing(&mut self) -> Result<(), DeviceError> {
        if !self.open {
            return Err(DeviceError::Start {
                serial: self.serial.clone(),
                message: "device closed".to_string(),
            });
        }
        self.grabbing = true;
        Ok(())
    }

    fn retrieve(&mut self, _timeout: Duration) -> GrabResult {
        let n = self.retrievals;
        self.retrievals += 1;

        let outcome = if !self.grabbing {
            Err(GrabFailure::Grab("acquisition not started".to_string()))
        } else if self.timeouts.contains(&n) {
            Err(GrabFailure::Timeout)
        } else if self.failures.contains(&n) {
            Err(GrabFailure::Grab(format!("emulated failure on retrieval {}", n)))
        } else {
            Ok(self.synthesize(n))
        };

        GrabResult {
            context: self.context,
            outcome,
        }
    }

    fn stop_grabbing(&mut self) {
        self.grabbing = false;
    }
}

/// One emulated device per configured binding.
pub fn emulated_devices(config: &CaptureConfig, width: u32, height: u32) -> Vec<Box<dyn CaptureDevice>> {
    config
        .devices
        .iter()
        .map(|b| Box::new(EmulatedDevice::new(&b.serial, width, height)) as Box<dyn CaptureDevice>)
        .collect()
}
