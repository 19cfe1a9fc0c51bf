//! Session directory layout and metadata export.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};

use super::ledger::FrameLedger;
use crate::config::{save_json, CaptureConfig};
use crate::error::{DatasetError, Result};

/// Timestamp format of session directories.
pub const SESSION_TIMESTAMP_FORMAT: &str = "%d-%m-%Y_%H.%M.%S";

/// Session directory name for an acquisition time.
pub fn session_timestamp<Tz: TimeZone>(time: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    time.format(SESSION_TIMESTAMP_FORMAT).to_string()
}

/// Filename of a saved frame.
pub fn frame_filename(stimulus_index: usize, slot: usize) -> String {
    format!("img_{}_cam_{}.tiff", stimulus_index, slot)
}

/// Directory tree of one capture session:
/// `{destination_root}/{timestamp}/{role}/`.
#[derive(Debug, Clone)]
pub struct SessionLayout {
    root: PathBuf,
    timestamp: String,
    /// Frame directory per slot.
    slot_dirs: Vec<PathBuf>,
}

impl SessionLayout {
    /// Create the session tree. Fails if the session directory already
    /// exists so earlier captures are never overwritten.
    pub fn create(destination_root: &Path, timestamp: &str, config: &CaptureConfig) -> Result<Self> {
        config.validate()?;

        std::fs::create_dir_all(destination_root)
            .map_err(|e| DatasetError::io(destination_root, e))?;
        let root = destination_root.join(timestamp);
        std::fs::create_dir(&root).map_err(|e| DatasetError::io(&root, e))?;

        let mut slot_dirs = vec![PathBuf::new(); config.devices.len()];
        for binding in &config.devices {
            let dir = root.join(binding.role.dir_name());
            std::fs::create_dir(&dir).map_err(|e| DatasetError::io(&dir, e))?;
            slot_dirs[binding.slot] = dir;
        }

        log::info!("Created session directory {}", root.display());

        Ok(Self {
            root,
            timestamp: timestamp.to_string(),
            slot_dirs,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn slot_dir(&self, slot: usize) -> Option<&Path> {
        self.slot_dirs.get(slot).map(|p| p.as_path())
    }

    pub fn frame_path(&self, slot: usize, stimulus_index: usize) -> Option<PathBuf> {
        self.slot_dir(slot)
            .map(|dir| dir.join(frame_filename(stimulus_index, slot)))
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join("metadata.json")
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("log.txt")
    }
}

/// Metadata written once at the end of a capture session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub acquisition_time: String,
    pub destination: PathBuf,
    pub source: PathBuf,
    /// Requested end index of the stimulus range.
    pub image_count: usize,
    pub start_index: usize,
    pub capture_format: String,
    /// Exposure in microseconds per camera role.
    pub exposures: BTreeMap<String, f64>,
    /// Saved frames per camera role.
    pub frames_saved: BTreeMap<String, usize>,
    /// `("Image: i", filename, "Camera: slot")` per failed grab.
    pub failed_images: Vec<(String, String, String)>,
    /// True if the session was stopped before the end index.
    pub cancelled: bool,
}

impl SessionMetadata {
    pub fn new(
        layout: &SessionLayout,
        source: &Path,
        image_count: usize,
        start_index: usize,
        config: &CaptureConfig,
    ) -> Self {
        let exposures = config
            .devices
            .iter()
            .map(|b| (b.role.dir_name().to_string(), b.exposure_us))
            .collect();

        Self {
            acquisition_time: layout.timestamp().to_string(),
            destination: layout.root().to_path_buf(),
            source: source.to_path_buf(),
            image_count,
            start_index,
            capture_format: config.pixel_format.clone(),
            exposures,
            frames_saved: BTreeMap::new(),
            failed_images: Vec::new(),
            cancelled: false,
        }
    }

    /// Copy the ledger's final state into the metadata.
    pub fn record(&mut self, ledger: &FrameLedger, config: &CaptureConfig, cancelled: bool) {
        self.frames_saved = config
            .devices
            .iter()
            .map(|b| (b.role.dir_name().to_string(), ledger.sequence_index_of(b.slot)))
            .collect();
        self.failed_images = ledger
            .failures()
            .iter()
            .map(|r| {
                (
                    format!("Image: {}", r.stimulus_index),
                    r.filename.clone(),
                    format!("Camera: {}", r.slot),
                )
            })
            .collect();
        self.cancelled = cancelled;
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        save_json(self, path)?;
        log::info!("Wrote session metadata to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::GrabFailure;
    use chrono::Utc;

    #[test]
    fn test_timestamp_format() {
        let t = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap();
        assert_eq!(session_timestamp(&t), "07-03-2024_09.05.01");
    }

    #[test]
    fn test_layout_creates_role_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = CaptureConfig::default();
        let layout = SessionLayout::create(dir.path(), "01-01-2024_00.00.00", &config).unwrap();

        assert!(dir.path().join("01-01-2024_00.00.00/diffusercam").is_dir());
        assert!(dir.path().join("01-01-2024_00.00.00/rml").is_dir());
        assert!(dir.path().join("01-01-2024_00.00.00/ground_truth").is_dir());
        assert_eq!(
            layout.frame_path(2, 14).unwrap(),
            dir.path().join("01-01-2024_00.00.00/ground_truth/img_14_cam_2.tiff")
        );
        assert!(layout.frame_path(3, 0).is_none());

        // A second session with the same timestamp must not reuse the tree.
        assert!(SessionLayout::create(dir.path(), "01-01-2024_00.00.00", &config).is_err());
    }

    #[test]
    fn test_metadata_records_failures_as_triples() {
        let dir = tempfile::tempdir().unwrap();
        let config = CaptureConfig::default();
        let layout = SessionLayout::create(dir.path(), "t", &config).unwrap();

        let mut ledger = FrameLedger::new(3);
        ledger.record_success(0, 0, layout.root().join("diffusercam/img_0_cam_0.tiff"));
        ledger.record_failure(1, 3, "im3.png", GrabFailure::Timeout);

        let mut metadata = SessionMetadata::new(&layout, Path::new("/src"), 5, 0, &config);
        metadata.record(&ledger, &config, false);
        metadata.write(&layout.metadata_path()).unwrap();

        let text = std::fs::read_to_string(layout.metadata_path()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["capture_format"], "Mono12");
        assert_eq!(parsed["exposures"]["ground_truth"], 1500.0);
        assert_eq!(parsed["frames_saved"]["diffusercam"], 1);
        assert_eq!(
            parsed["failed_images"][0],
            serde_json::json!(["Image: 3", "im3.png", "Camera: 1"])
        );
    }
}
