//! Session-level reconstruction runner.
//!
//! Each configured camera of a capture session is reconstructed
//! independently: a missing or ambiguous PSF/mask only fails that camera.

use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::config::{CameraRole, DatasetConfig};
use crate::error::{DatasetError, Result};
use crate::imaging::{list_images, Image};
use crate::recon::{normalize_for_display, prepare_measurement, ReconConfig, Reconstructor};

/// Calibration artifact used by the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Psf,
    Mask,
}

impl ArtifactKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ArtifactKind::Psf => "psf",
            ArtifactKind::Mask => "mask",
        }
    }

    /// Fallback file inside the camera directory.
    pub fn fallback_name(&self) -> &'static str {
        match self {
            ArtifactKind::Psf => "psf.tiff",
            ArtifactKind::Mask => "mask.tiff",
        }
    }
}

/// Label used to match artifacts to a camera slot.
pub fn camera_label(slot: usize) -> String {
    format!("cam_{}", slot)
}

/// Find the artifact of `kind` for camera `label`.
///
/// In `calibration_dir`, an image whose stem starts with the kind's prefix
/// and ends with `_{label}` matches. Exactly one match is required; with
/// none, `{camera_dir}/psf.tiff` or `{camera_dir}/mask.tiff` is used.
pub fn resolve_artifact(
    kind: ArtifactKind,
    calibration_dir: Option<&Path>,
    camera_dir: &Path,
    label: &str,
) -> Result<PathBuf> {
    let suffix = format!("_{}", label);

    if let Some(dir) = calibration_dir.filter(|d| d.is_dir()) {
        let candidates: Vec<PathBuf> = list_images(dir)?
            .into_iter()
            .filter(|name| {
                Path::new(name)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(|stem| stem.starts_with(kind.prefix()) && stem.ends_with(&suffix))
                    .unwrap_or(false)
            })
            .map(|name| dir.join(name))
            .collect();

        if candidates.len() > 1 {
            return Err(DatasetError::AmbiguousArtifact {
                kind: kind.prefix(),
                camera: label.to_string(),
                candidates,
            });
        }
        if let Some(found) = candidates.into_iter().next() {
            return Ok(found);
        }
    }

    let fallback = camera_dir.join(kind.fallback_name());
    if fallback.is_file() {
        Ok(fallback)
    } else {
        Err(DatasetError::MissingArtifact {
            kind: kind.prefix(),
            camera: label.to_string(),
        })
    }
}

/// True for captured frames, excluding calibration artifacts stored
/// alongside them.
fn is_capture(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !lower.contains("psf") && !lower.contains("mask")
}

/// Outcome for one camera.
#[derive(Debug, Clone, Default)]
pub struct CameraReport {
    pub label: String,
    pub psf: PathBuf,
    pub mask: PathBuf,
    pub reconstructed: Vec<PathBuf>,
    /// `(filename, error)` for frames that could not be reconstructed.
    pub failed: Vec<(String, String)>,
}

/// Reconstruct every capture in `camera_dir` into
/// `{camera_dir}/results/reconned_{filename}`.
pub fn reconstruct_camera(
    camera_dir: &Path,
    calibration_dir: Option<&Path>,
    slot: usize,
    config: &ReconConfig,
) -> Result<CameraReport> {
    let label = camera_label(slot);
    let psf_path = resolve_artifact(ArtifactKind::Psf, calibration_dir, camera_dir, &label)?;
    let mask_path = resolve_artifact(ArtifactKind::Mask, calibration_dir, camera_dir, &label)?;
    log::info!("Using PSF {} and mask {} for {}", psf_path.display(), mask_path.display(), label);

    let psf = Image::load(&psf_path)?;
    let mask = Image::load(&mask_path)?;
    let solver = Reconstructor::from_calibration(&psf, &mask, config.clone())?;

    let frames: Vec<String> = list_images(camera_dir)?
        .into_iter()
        .filter(|name| is_capture(name))
        .collect();

    let results_dir = camera_dir.join("results");
    std::fs::create_dir_all(&results_dir).map_err(|e| DatasetError::io(&results_dir, e))?;

    let outcomes: Vec<(String, Result<PathBuf>)> = frames
        .par_iter()
        .map(|name| {
            let src = camera_dir.join(name);
            let dst = results_dir.join(format!("reconned_{}", name));
            let outcome = reconstruct_frame(&solver, &src)
                .and_then(|image| image.save(&dst))
                .map(|()| dst);
            (name.clone(), outcome)
        })
        .collect();

    let mut report = CameraReport {
        label,
        psf: psf_path,
        mask: mask_path,
        ..CameraReport::default()
    };
    for (name, outcome) in outcomes {
        match outcome {
            Ok(path) => report.reconstructed.push(path),
            Err(e) => {
                log::warn!("Skipping {} of {}: {}", name, report.label, e);
                report.failed.push((name, e.to_string()));
            }
        }
    }

    log::info!(
        "Reconstructed {} of {} frames for {}",
        report.reconstructed.len(),
        frames.len(),
        report.label
    );
    Ok(report)
}

/// Load, preprocess and reconstruct one frame, scaled for display.
pub fn reconstruct_frame(solver: &Reconstructor, frame_path: &Path) -> Result<Image> {
    let config = solver.config();
    let frame = Image::load(frame_path)?;
    let measurement = prepare_measurement(&frame, config.channel, config.downsample)?;
    let estimate = solver.reconstruct(&measurement)?;
    Ok(normalize_for_display(&estimate))
}

/// Per-camera outcomes of a session run.
#[derive(Debug, Default)]
pub struct SessionReport {
    pub cameras: Vec<(CameraRole, Result<CameraReport>)>,
}

impl SessionReport {
    pub fn succeeded(&self) -> usize {
        self.cameras.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn reconstructed_frames(&self) -> usize {
        self.cameras
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok())
            .map(|r| r.reconstructed.len())
            .sum()
    }
}

/// Reconstruct the configured cameras of a capture session. Failures are
/// isolated per camera and collected in the report.
pub fn reconstruct_session(
    session_dir: &Path,
    calibration_dir: Option<&Path>,
    config: &DatasetConfig,
) -> SessionReport {
    let mut report = SessionReport::default();

    for &role in &config.recon_cameras {
        let camera_dir = session_dir.join(role.dir_name());
        let result = match config.capture.devices.iter().find(|b| b.role == role) {
            Some(binding) => reconstruct_camera(&camera_dir, calibration_dir, binding.slot, &config.recon),
            None => Err(DatasetError::Config(format!("camera {} has no slot binding", role))),
        };

        if let Err(e) = &result {
            log::error!("Reconstruction of {} failed: {}", role, e);
        }
        report.cameras.push((role, result));
    }

    log::info!(
        "Session reconstruction finished: {}/{} cameras, {} frames",
        report.succeeded(),
        report.cameras.len(),
        report.reconstructed_frames()
    );
    report
}
