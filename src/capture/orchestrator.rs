//! Synchronized capture loop.
//!
//! For every stimulus the orchestrator presents the image, waits for the
//! display and sensors to settle, then services each device in turn:
//! start acquisition, wait the trigger delay, retrieve with a timeout,
//! classify the result and stop acquisition. Devices are never serviced
//! concurrently, so frame-to-stimulus correspondence is deterministic.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::device::{CaptureDevice, DeviceArray, GrabFailure, GrabResult, SlotMap};
use super::ledger::FrameLedger;
use super::session::{SessionLayout, SessionMetadata};
use crate::config::CaptureConfig;
use crate::error::Result;
use crate::imaging::list_images;

/// Error type returned by presenters.
pub type PresentError = Box<dyn std::error::Error + Send + Sync>;

/// Shows a stimulus on the display facing the rig.
pub trait StimulusPresenter {
    fn present(&mut self, stimulus: &Path) -> std::result::Result<(), PresentError>;
}

/// Presenter for headless runs; only logs what would be shown.
#[derive(Debug, Default, Clone)]
pub struct LoggingPresenter {
    pub display: usize,
}

impl StimulusPresenter for LoggingPresenter {
    fn present(&mut self, stimulus: &Path) -> std::result::Result<(), PresentError> {
        log::info!("Displaying {} on display {}", stimulus.display(), self.display);
        Ok(())
    }
}

/// Cooperative stop signal, polled once per stimulus.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Cancel when a line is typed on stdin. End of input is ignored so
    /// detached runs are not stopped.
    pub fn cancel_on_stdin_line(&self) -> std::io::Result<()> {
        let token = self.clone();
        std::thread::Builder::new()
            .name("capture-quit".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                let mut line = String::new();
                if let Ok(n) = stdin.lock().read_line(&mut line) {
                    if n > 0 {
                        log::info!("Quit requested, finishing current stimulus");
                        token.cancel();
                    }
                }
            })?;
        Ok(())
    }
}

/// Range of stimuli to capture.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub source_dir: PathBuf,
    pub start_index: usize,
    /// Exclusive end index.
    pub end_index: usize,
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Completed,
    Cancelled,
}

/// Final state of a session.
#[derive(Debug, Clone)]
pub struct CaptureSummary {
    pub outcome: CaptureOutcome,
    pub stimuli_processed: usize,
    pub ledger: FrameLedger,
    pub metadata: SessionMetadata,
}

/// Bind `devices` to their slots, then create the session tree. Nothing is
/// written under `destination_root` unless every device attaches.
pub fn prepare_session(
    devices: Vec<Box<dyn CaptureDevice>>,
    config: &CaptureConfig,
    destination_root: &Path,
    timestamp: &str,
) -> Result<(DeviceArray, SessionLayout)> {
    let slot_map = SlotMap::from_config(config)?;
    let devices = DeviceArray::attach(devices, &slot_map)?;
    let layout = SessionLayout::create(destination_root, timestamp, config)?;
    Ok((devices, layout))
}

/// Drives one capture session over a device array.
pub struct CaptureOrchestrator<P: StimulusPresenter> {
    config: CaptureConfig,
    devices: DeviceArray,
    presenter: P,
    layout: SessionLayout,
    ledger: FrameLedger,
    cancel: CancelToken,
}

impl<P: StimulusPresenter> CaptureOrchestrator<P> {
    pub fn new(
        config: CaptureConfig,
        devices: DeviceArray,
        presenter: P,
        layout: SessionLayout,
        cancel: CancelToken,
    ) -> Self {
        let ledger = FrameLedger::new(config.devices.len());
        Self {
            config,
            devices,
            presenter,
            layout,
            ledger,
            cancel,
        }
    }

    /// Run the session. Metadata is written on every exit path once the
    /// session directory exists, including errors and cancellation.
    pub fn run(mut self, request: &CaptureRequest) -> Result<CaptureSummary> {
        let mut metadata = SessionMetadata::new(
            &self.layout,
            &request.source_dir,
            request.end_index,
            request.start_index,
            &self.config,
        );

        let loop_result = self.run_loop(request);
        self.devices.close();

        let cancelled = !matches!(loop_result, Ok((CaptureOutcome::Completed, _)));
        metadata.record(&self.ledger, &self.config, cancelled);
        let write_result = metadata.write(&self.layout.metadata_path());

        let (outcome, stimuli_processed) = loop_result?;
        write_result?;

        log::info!(
            "Capture {}: {} stimuli, {} frames saved, {} failed grabs",
            if outcome == CaptureOutcome::Completed { "complete" } else { "cancelled" },
            stimuli_processed,
            self.ledger.total_saved(),
            self.ledger.failures().len()
        );

        Ok(CaptureSummary {
            outcome,
            stimuli_processed,
            ledger: self.ledger,
            metadata,
        })
    }

    fn run_loop(&mut self, request: &CaptureRequest) -> Result<(CaptureOutcome, usize)> {
        let sources = list_images(&request.source_dir)?;

        let end = if request.end_index > sources.len() {
            log::warn!(
                "End index {} exceeds the {} available stimuli, stopping at {}",
                request.end_index,
                sources.len(),
                sources.len()
            );
            sources.len()
        } else {
            request.end_index
        };

        self.devices.open()?;
        self.devices.configure(&self.config)?;

        let mut processed = 0;
        for index in request.start_index..end {
            let filename = &sources[index];
            if self.cancel.is_cancelled() {
                log::info!("Capture stopped before stimulus {}", index);
                return Ok((CaptureOutcome::Cancelled, processed));
            }

            log::info!("Index: {} ({})", index, filename);
            self.capture_stimulus(index, filename, &request.source_dir.join(filename));
            processed += 1;
        }

        Ok((CaptureOutcome::Completed, processed))
    }

    fn capture_stimulus(&mut self, index: usize, filename: &str, stimulus: &Path) {
        if let Err(e) = self.presenter.present(stimulus) {
            log::error!("Failed to present {}: {}", filename, e);
            for slot in 0..self.ledger.slot_count() {
                self.ledger.record_failure(
                    slot,
                    index,
                    filename,
                    GrabFailure::Presentation(e.to_string()),
                );
            }
            return;
        }
        sleep_if_nonzero(self.config.settle());

        for device_index in 0..self.devices.len() {
            self.capture_device(device_index, index, filename);
        }
    }

    fn capture_device(&mut self, device_index: usize, index: usize, filename: &str) {
        let device_slot = self.devices.slot_of_device(device_index);
        let trigger_delay = self.config.trigger_delay();
        let timeout = self.config.grab_timeout();

        let result = {
            let device = self.devices.device_mut(device_index);
            match device.start_grabbing() {
                Ok(()) => {
                    sleep_if_nonzero(trigger_delay);
                    let result = device.retrieve(timeout);
                    device.stop_grabbing();
                    result
                }
                Err(e) => GrabResult {
                    context: device_slot as u32,
                    outcome: Err(GrabFailure::Start(e.to_string())),
                },
            }
        };

        let slot = match self.devices.slot_for_context(result.context) {
            Some(slot) => slot,
            None => {
                log::warn!(
                    "Result context {} is unbound, attributing to slot {}",
                    result.context,
                    device_slot
                );
                device_slot
            }
        };

        self.classify(slot, index, filename, result);
    }

    fn classify(&mut self, slot: usize, index: usize, filename: &str, result: GrabResult) {
        let sequence = self.ledger.sequence_index_of(slot);

        let frame = match result.outcome {
            Ok(frame) => frame,
            Err(reason) => {
                log::warn!("Failed: image #{} of cam #{} ({})", sequence, slot, reason);
                self.ledger.record_failure(slot, index, filename, reason);
                return;
            }
        };

        let Some(path) = self.layout.frame_path(slot, index) else {
            self.ledger.record_failure(
                slot,
                index,
                filename,
                GrabFailure::Persist(format!("no directory for slot {}", slot)),
            );
            return;
        };

        match frame.save(&path) {
            Ok(()) => {
                let assigned = self.ledger.record_success(slot, index, path);
                let (min, max, mean) = frame.stats();
                log::info!("Captured image #{} using cam #{}", assigned, slot);
                log::debug!("Max value: {}, min value: {}, mean value: {:.1}", max, min, mean);
            }
            Err(e) => {
                log::error!("Could not save {}: {}", path.display(), e);
                self.ledger
                    .record_failure(slot, index, filename, GrabFailure::Persist(e.to_string()));
            }
        }
    }
}

fn sleep_if_nonzero(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{DeviceError, EmulatedDevice};
    use crate::error::DatasetError;

    fn fast_config() -> CaptureConfig {
        CaptureConfig {
            settle_ms: 0,
            trigger_delay_ms: 0,
            grab_timeout_ms: 10,
            ..CaptureConfig::default()
        }
    }

    fn write_stimuli(dir: &Path, count: usize) {
        for i in 0..count {
            std::fs::write(dir.join(format!("im{}.png", i + 1)), b"").unwrap();
        }
        std::fs::write(dir.join("notes.txt"), b"").unwrap();
    }

    fn orchestrator<P: StimulusPresenter>(
        devices: Vec<Box<dyn CaptureDevice>>,
        presenter: P,
        root: &Path,
        cancel: CancelToken,
    ) -> CaptureOrchestrator<P> {
        let config = fast_config();
        let (array, layout) = prepare_session(devices, &config, root, "session").unwrap();
        CaptureOrchestrator::new(config, array, presenter, layout, cancel)
    }

    #[test]
    fn test_failed_attach_leaves_no_session_tree() {
        let dest = tempfile::tempdir().unwrap();
        let devices: Vec<Box<dyn CaptureDevice>> = vec![
            Box::new(EmulatedDevice::new("12345678", 4, 4)),
            Box::new(EmulatedDevice::new("40270083", 4, 4)),
            Box::new(EmulatedDevice::new("40270083", 4, 4)),
        ];

        let err = prepare_session(devices, &fast_config(), dest.path(), "session").err();
        assert!(matches!(
            err,
            Some(DatasetError::Device(DeviceError::DuplicateSerial(_)))
        ));
        assert!(!dest.path().join("session").exists());
    }

    #[test]
    fn test_device_failing_on_one_stimulus() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        write_stimuli(source.path(), 5);

        let devices: Vec<Box<dyn CaptureDevice>> = vec![
            Box::new(EmulatedDevice::new("12345678", 8, 6)),
            Box::new(EmulatedDevice::new("40270083", 8, 6).with_failures([3])),
            Box::new(EmulatedDevice::new("40412531", 8, 6)),
        ];
        let request = CaptureRequest {
            source_dir: source.path().to_path_buf(),
            start_index: 0,
            end_index: 5,
        };

        let summary = orchestrator(devices, LoggingPresenter::default(), dest.path(), CancelToken::new())
            .run(&request)
            .unwrap();

        assert_eq!(summary.outcome, CaptureOutcome::Completed);
        assert_eq!(summary.stimuli_processed, 5);
        assert_eq!(summary.ledger.sequence_index_of(0), 5);
        assert_eq!(summary.ledger.sequence_index_of(1), 4);
        assert_eq!(summary.ledger.sequence_index_of(2), 5);

        let failures = summary.ledger.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].stimulus_index, 3);
        assert_eq!(failures[0].slot, 1);
        assert_eq!(failures[0].filename, "im4.png");

        let session = dest.path().join("session");
        assert!(!session.join("rml/img_3_cam_1.tiff").exists());
        assert!(session.join("rml/img_4_cam_1.tiff").exists());
        assert!(session.join("diffusercam/img_3_cam_0.tiff").exists());
        assert!(session.join("ground_truth/img_3_cam_2.tiff").exists());
        assert!(session.join("metadata.json").exists());
        assert_eq!(summary.metadata.failed_images.len(), 1);

        assert_eq!(summary.ledger.frames().len(), 14);
        let rml: Vec<_> = summary.ledger.frames_for_slot(1).collect();
        assert_eq!(rml.len(), 4);
        assert_eq!(rml[3].stimulus_index, 4);
        assert_eq!(rml[3].sequence, 3);
        assert_eq!(rml[3].path, session.join("rml/img_4_cam_1.tiff"));
        assert!(summary.ledger.frames().iter().all(|r| r.path.exists()));
    }

    /// Presenter that deletes a directory once a given stimulus is shown.
    struct RemoveDirOn {
        stimulus: &'static str,
        dir: PathBuf,
    }

    impl StimulusPresenter for RemoveDirOn {
        fn present(&mut self, stimulus: &Path) -> std::result::Result<(), PresentError> {
            if stimulus.ends_with(self.stimulus) {
                std::fs::remove_dir_all(&self.dir)?;
            }
            Ok(())
        }
    }

    #[test]
    fn test_unwritable_frame_is_a_persist_failure() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        write_stimuli(source.path(), 3);

        let config = fast_config();
        let presenter = RemoveDirOn {
            stimulus: "im2.png",
            dir: dest.path().join("session/ground_truth"),
        };
        let request = CaptureRequest {
            source_dir: source.path().to_path_buf(),
            start_index: 0,
            end_index: 3,
        };
        let summary = orchestrator(
            crate::capture::emulated_devices(&config, 4, 4),
            presenter,
            dest.path(),
            CancelToken::new(),
        )
        .run(&request)
        .unwrap();

        assert_eq!(summary.outcome, CaptureOutcome::Completed);
        assert_eq!(summary.ledger.sequence_index_of(2), 1);
        assert_eq!(summary.ledger.sequence_index_of(0), 3);

        let failures: Vec<_> = summary.ledger.failures_for_slot(2).collect();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].stimulus_index, 1);
        assert!(matches!(failures[0].reason, GrabFailure::Persist(_)));
        assert_eq!(summary.ledger.frames_for_slot(2).count(), 1);
    }

    #[test]
    fn test_timeouts_are_recorded_per_slot() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        write_stimuli(source.path(), 3);

        let devices: Vec<Box<dyn CaptureDevice>> = vec![
            Box::new(EmulatedDevice::new("12345678", 4, 4).with_timeouts([0, 2])),
            Box::new(EmulatedDevice::new("40270083", 4, 4)),
            Box::new(EmulatedDevice::new("40412531", 4, 4).with_failures([1])),
        ];
        let request = CaptureRequest {
            source_dir: source.path().to_path_buf(),
            start_index: 0,
            end_index: 3,
        };

        let summary = orchestrator(devices, LoggingPresenter::default(), dest.path(), CancelToken::new())
            .run(&request)
            .unwrap();

        assert_eq!(summary.ledger.sequence_index_of(0), 1);
        assert_eq!(summary.ledger.sequence_index_of(1), 3);
        assert_eq!(summary.ledger.sequence_index_of(2), 2);
        assert_eq!(summary.ledger.failures_for_slot(0).count(), 2);
        assert!(summary
            .ledger
            .failures_for_slot(0)
            .all(|r| r.reason == GrabFailure::Timeout));
    }

    #[test]
    fn test_start_index_and_end_clamp() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        write_stimuli(source.path(), 4);

        let config = fast_config();
        let request = CaptureRequest {
            source_dir: source.path().to_path_buf(),
            start_index: 2,
            end_index: 50,
        };
        let summary = orchestrator(
            crate::capture::emulated_devices(&config, 4, 4),
            LoggingPresenter::default(),
            dest.path(),
            CancelToken::new(),
        )
        .run(&request)
        .unwrap();

        assert_eq!(summary.stimuli_processed, 2);
        assert!(dest.path().join("session/rml/img_2_cam_1.tiff").exists());
        assert!(dest.path().join("session/rml/img_3_cam_1.tiff").exists());
        assert!(!dest.path().join("session/rml/img_1_cam_1.tiff").exists());
    }

    /// Presenter that requests a stop after a fixed number of stimuli.
    struct StopAfter {
        remaining: usize,
        cancel: CancelToken,
    }

    impl StimulusPresenter for StopAfter {
        fn present(&mut self, _stimulus: &Path) -> std::result::Result<(), PresentError> {
            self.remaining -= 1;
            if self.remaining == 0 {
                self.cancel.cancel();
            }
            Ok(())
        }
    }

    #[test]
    fn test_cancel_stops_cleanly_and_flushes_metadata() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        write_stimuli(source.path(), 5);

        let cancel = CancelToken::new();
        let presenter = StopAfter {
            remaining: 2,
            cancel: cancel.clone(),
        };
        let config = fast_config();
        let request = CaptureRequest {
            source_dir: source.path().to_path_buf(),
            start_index: 0,
            end_index: 5,
        };
        let summary = orchestrator(
            crate::capture::emulated_devices(&config, 4, 4),
            presenter,
            dest.path(),
            cancel,
        )
        .run(&request)
        .unwrap();

        assert_eq!(summary.outcome, CaptureOutcome::Cancelled);
        assert_eq!(summary.stimuli_processed, 2);
        assert_eq!(summary.ledger.sequence_index_of(0), 2);

        let text = std::fs::read_to_string(dest.path().join("session/metadata.json")).unwrap();
        let metadata: SessionMetadata = serde_json::from_str(&text).unwrap();
        assert!(metadata.cancelled);
        assert_eq!(metadata.frames_saved["ground_truth"], 2);
    }

    struct BrokenDisplay;

    impl StimulusPresenter for BrokenDisplay {
        fn present(&mut self, _stimulus: &Path) -> std::result::Result<(), PresentError> {
            Err("display disconnected".into())
        }
    }

    #[test]
    fn test_presentation_failure_marks_every_slot() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        write_stimuli(source.path(), 1);

        let config = fast_config();
        let request = CaptureRequest {
            source_dir: source.path().to_path_buf(),
            start_index: 0,
            end_index: 1,
        };
        let summary = orchestrator(
            crate::capture::emulated_devices(&config, 4, 4),
            BrokenDisplay,
            dest.path(),
            CancelToken::new(),
        )
        .run(&request)
        .unwrap();

        assert_eq!(summary.ledger.failures().len(), 3);
        assert_eq!(summary.ledger.total_saved(), 0);
    }
}
