//! Lens distortion correction.
//!
//! Pinhole camera with Brown-Conrady radial/tangential distortion and the
//! rational k4..k6 terms. Correction resamples every output pixel through
//! the distortion model into the raw frame, using a new camera matrix
//! chosen so the corrected view is free of invalid border pixels.

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::load_json;
use crate::error::{DatasetError, Result};
use crate::imaging::{list_images, ChannelOrder, Image};

/// 3x3 matrix, row-major.
pub type Mat3 = [[f64; 3]; 3];

/// Grid size used to sample the frame border when fitting the new matrix.
const BORDER_GRID: usize = 9;

/// Accepted coefficient counts.
const COEFF_COUNTS: [usize; 5] = [4, 5, 8, 12, 14];

/// Camera intrinsics and distortion coefficients in OpenCV order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBundle {
    pub camera_matrix: Mat3,
    pub dist_coeffs: Vec<f64>,
}

impl CalibrationBundle {
    pub fn load(path: &Path) -> Result<Self> {
        let bundle: CalibrationBundle = load_json(path)?;
        bundle.validate()?;
        Ok(bundle)
    }

    pub fn validate(&self) -> Result<()> {
        if !COEFF_COUNTS.contains(&self.dist_coeffs.len()) {
            return Err(DatasetError::Config(format!(
                "expected 4, 5, 8, 12 or 14 distortion coefficients, got {}",
                self.dist_coeffs.len()
            )));
        }
        let k = &self.camera_matrix;
        if k[0][0].abs() < f64::EPSILON || k[1][1].abs() < f64::EPSILON {
            return Err(DatasetError::Singular("camera matrix has a zero focal length"));
        }
        Ok(())
    }

    pub fn distortion(&self) -> DistortionModel {
        DistortionModel::from_coeffs(&self.dist_coeffs)
    }
}

/// Radial, tangential and rational distortion terms.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DistortionModel {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
    pub k4: f64,
    pub k5: f64,
    pub k6: f64,
}

impl DistortionModel {
    /// Build from an OpenCV coefficient vector. Missing terms are zero and
    /// anything past k6 (thin prism, tilt) is ignored.
    pub fn from_coeffs(coeffs: &[f64]) -> Self {
        let c = |i: usize| coeffs.get(i).copied().unwrap_or(0.0);
        Self {
            k1: c(0),
            k2: c(1),
            p1: c(2),
            p2: c(3),
            k3: c(4),
            k4: c(5),
            k5: c(6),
            k6: c(7),
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    /// Map an ideal normalized point to its distorted position.
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let num = 1.0 + ((self.k3 * r2 + self.k2) * r2 + self.k1) * r2;
        let den = 1.0 + ((self.k6 * r2 + self.k5) * r2 + self.k4) * r2;
        let radial = num / den;
        let x_t = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let y_t = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (x * radial + x_t, y * radial + y_t)
    }

    /// Invert [`distort`](Self::distort) by fixed-point iteration.
    pub fn undistort(&self, x_d: f64, y_d: f64) -> (f64, f64) {
        let max_iters = 20;
        let tol = 1e-12;

        let mut x = x_d;
        let mut y = y_d;
        for _ in 0..max_iters {
            let r2 = x * x + y * y;
            let num = 1.0 + ((self.k3 * r2 + self.k2) * r2 + self.k1) * r2;
            let den = 1.0 + ((self.k6 * r2 + self.k5) * r2 + self.k4) * r2;
            let inv_radial = den / num;
            if !inv_radial.is_finite() || inv_radial < 0.0 {
                return (x_d, y_d);
            }
            let x_t = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let y_t = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;

            let x_new = (x_d - x_t) * inv_radial;
            let y_new = (y_d - y_t) * inv_radial;
            let step = (x_new - x).abs().max((y_new - y).abs());
            x = x_new;
            y = y_new;
            if step < tol {
                break;
            }
        }
        (x, y)
    }
}

/// Pinhole intrinsics read from a camera matrix. Skew is ignored.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Pinhole {
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
}

impl Pinhole {
    fn from_matrix(k: &Mat3) -> Self {
        Self {
            fx: k[0][0],
            fy: k[1][1],
            cx: k[0][2],
            cy: k[1][2],
        }
    }

    fn to_matrix(self) -> Mat3 {
        [
            [self.fx, 0.0, self.cx],
            [0.0, self.fy, self.cy],
            [0.0, 0.0, 1.0],
        ]
    }

    fn normalize(&self, u: f64, v: f64) -> (f64, f64) {
        ((u - self.cx) / self.fx, (v - self.cy) / self.fy)
    }

    fn project(&self, x: f64, y: f64) -> (f64, f64) {
        (self.fx * x + self.cx, self.fy * y + self.cy)
    }
}

/// Axis-aligned rectangle in normalized coordinates.
#[derive(Debug, Clone, Copy)]
struct Rect {
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
}

/// Camera matrix for the corrected view of a `width x height` frame.
///
/// `alpha = 0` keeps only pixels that are valid everywhere (no black
/// border); `alpha = 1` keeps every source pixel. Values in between blend
/// the two. With no distortion the result equals the input matrix.
pub fn optimal_new_camera_matrix(
    camera_matrix: &Mat3,
    distortion: &DistortionModel,
    width: u32,
    height: u32,
    alpha: f64,
) -> Mat3 {
    let k = Pinhole::from_matrix(camera_matrix);
    let (inner, outer) = border_rectangles(&k, distortion, width, height);
    let alpha = alpha.clamp(0.0, 1.0);

    let w = (width.max(2) - 1) as f64;
    let h = (height.max(2) - 1) as f64;
    let fit = |r: &Rect| {
        let fx = w / (r.x1 - r.x0);
        let fy = h / (r.y1 - r.y0);
        (fx, fy, -fx * r.x0, -fy * r.y0)
    };
    let (fx0, fy0, cx0, cy0) = fit(&inner);
    let (fx1, fy1, cx1, cy1) = fit(&outer);

    Pinhole {
        fx: fx0 * (1.0 - alpha) + fx1 * alpha,
        fy: fy0 * (1.0 - alpha) + fy1 * alpha,
        cx: cx0 * (1.0 - alpha) + cx1 * alpha,
        cy: cy0 * (1.0 - alpha) + cy1 * alpha,
    }
    .to_matrix()
}

/// Inner and outer rectangles of the undistorted frame border.
fn border_rectangles(k: &Pinhole, distortion: &DistortionModel, width: u32, height: u32) -> (Rect, Rect) {
    let n = BORDER_GRID;
    let w = (width.max(2) - 1) as f64;
    let h = (height.max(2) - 1) as f64;

    let mut inner = Rect {
        x0: f64::NEG_INFINITY,
        y0: f64::NEG_INFINITY,
        x1: f64::INFINITY,
        y1: f64::INFINITY,
    };
    let mut outer = Rect {
        x0: f64::INFINITY,
        y0: f64::INFINITY,
        x1: f64::NEG_INFINITY,
        y1: f64::NEG_INFINITY,
    };

    for i in 0..n {
        for j in 0..n {
            let u = j as f64 * w / (n - 1) as f64;
            let v = i as f64 * h / (n - 1) as f64;
            let (xd, yd) = k.normalize(u, v);
            let (x, y) = distortion.undistort(xd, yd);

            outer.x0 = outer.x0.min(x);
            outer.x1 = outer.x1.max(x);
            outer.y0 = outer.y0.min(y);
            outer.y1 = outer.y1.max(y);

            if j == 0 {
                inner.x0 = inner.x0.max(x);
            }
            if j == n - 1 {
                inner.x1 = inner.x1.min(x);
            }
            if i == 0 {
                inner.y0 = inner.y0.max(y);
            }
            if i == n - 1 {
                inner.y1 = inner.y1.min(y);
            }
        }
    }

    (inner, outer)
}

/// Options applied around the geometric correction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UndistortOptions {
    /// Free scaling parameter of the new camera matrix, in `[0, 1]`.
    pub alpha: f64,
    /// Mirror the corrected frame left-right.
    pub mirror: bool,
    /// Channel order of the input frame.
    pub input_order: ChannelOrder,
}

impl Default for UndistortOptions {
    fn default() -> Self {
        Self {
            alpha: 0.0,
            mirror: true,
            input_order: ChannelOrder::Rgb,
        }
    }
}

/// Corrector for one calibrated camera.
#[derive(Debug, Clone)]
pub struct LensCorrector {
    camera: Mat3,
    distortion: DistortionModel,
    options: UndistortOptions,
}

impl LensCorrector {
    pub fn new(bundle: &CalibrationBundle, options: UndistortOptions) -> Result<Self> {
        bundle.validate()?;
        Ok(Self {
            camera: bundle.camera_matrix,
            distortion: bundle.distortion(),
            options,
        })
    }

    /// Geometric correction only; same size as the input.
    pub fn rectify(&self, raw: &Image) -> Image {
        let (width, height) = raw.dimensions();
        let k = Pinhole::from_matrix(&self.camera);
        let new_k = Pinhole::from_matrix(&optimal_new_camera_matrix(
            &self.camera,
            &self.distortion,
            width,
            height,
            self.options.alpha,
        ));
        let distortion = self.distortion;

        raw.remap(width, height, |u, v| {
            let (x, y) = new_k.normalize(u as f64, v as f64);
            let (xd, yd) = distortion.distort(x, y);
            k.project(xd, yd)
        })
    }

    /// Full correction: rectify, mirror, reorder channels to RGB and clamp
    /// to unit range.
    pub fn undistort(&self, raw: &Image) -> Image {
        let mut out = self.rectify(raw);
        if self.options.mirror {
            out.flip_horizontal();
        }
        out.to_rgb_order(self.options.input_order);
        for v in &mut out.data {
            *v = v.clamp(0.0, 1.0);
        }
        out
    }
}

/// Undistort one frame with a calibration bundle.
pub fn undistort(raw: &Image, bundle: &CalibrationBundle, options: UndistortOptions) -> Result<Image> {
    Ok(LensCorrector::new(bundle, options)?.undistort(raw))
}

/// Undistort every image of `input_dir` into `output_dir` as
/// `undistorted_{name}`. Unreadable images are skipped with a warning.
/// Returns the written paths.
pub fn undistort_directory(
    input_dir: &Path,
    output_dir: &Path,
    corrector: &LensCorrector,
) -> Result<Vec<PathBuf>> {
    let names = list_images(input_dir)?;
    std::fs::create_dir_all(output_dir).map_err(|e| DatasetError::io(output_dir, e))?;

    let written: Vec<PathBuf> = names
        .par_iter()
        .filter_map(|name| {
            let src = input_dir.join(name);
            let dst = output_dir.join(format!("undistorted_{}", name));
            let result = Image::load(&src).and_then(|raw| corrector.undistort(&raw).save(&dst));
            match result {
                Ok(()) => Some(dst),
                Err(e) => {
                    log::warn!("Skipping {}: {}", src.display(), e);
                    None
                }
            }
        })
        .collect();

    log::info!(
        "Undistorted {} of {} images into {}",
        written.len(),
        names.len(),
        output_dir.display()
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(coeffs: Vec<f64>) -> CalibrationBundle {
        CalibrationBundle {
            camera_matrix: [[40.0, 0.0, 15.5], [0.0, 42.0, 11.5], [0.0, 0.0, 1.0]],
            dist_coeffs: coeffs,
        }
    }

    fn pattern(w: u32, h: u32) -> Image {
        Image::from_fn(w, h, 1, |x, y, _| ((x * 7 + y * 3) % 17) as f32 / 16.0)
    }

    #[test]
    fn test_distort_undistort_inverse() {
        let model = DistortionModel::from_coeffs(&[-0.2, 0.05, 0.001, -0.002, 0.01]);
        for &(x, y) in &[(0.1, -0.2), (-0.3, 0.25), (0.0, 0.0)] {
            let (xd, yd) = model.distort(x, y);
            let (xu, yu) = model.undistort(xd, yd);
            assert!((xu - x).abs() < 1e-9);
            assert!((yu - y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_zero_distortion_keeps_matrix() {
        let b = bundle(vec![0.0; 5]);
        let new_k = optimal_new_camera_matrix(&b.camera_matrix, &b.distortion(), 32, 24, 0.0);
        for r in 0..3 {
            for c in 0..3 {
                assert!((new_k[r][c] - b.camera_matrix[r][c]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_zero_distortion_is_idempotent() {
        let corrector = LensCorrector::new(
            &bundle(vec![0.0; 4]),
            UndistortOptions {
                mirror: false,
                ..UndistortOptions::default()
            },
        )
        .unwrap();
        let img = pattern(32, 24);
        let once = corrector.undistort(&img);
        let twice = corrector.undistort(&once);
        for (a, b) in img.data.iter().zip(&twice.data) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_mirror_applied_after_rectification() {
        let corrector = LensCorrector::new(&bundle(vec![0.0; 5]), UndistortOptions::default()).unwrap();
        let img = pattern(32, 24);
        let out = corrector.undistort(&img);
        assert!((out.get(0, 5, 0) - img.get(31, 5, 0)).abs() < 1e-4);
        assert!((out.get(31, 5, 0) - img.get(0, 5, 0)).abs() < 1e-4);
    }

    #[test]
    fn test_barrel_distortion_alpha_zero_has_no_black_border() {
        let b = bundle(vec![-0.3, 0.0, 0.0, 0.0, 0.0]);
        let corrector = LensCorrector::new(
            &b,
            UndistortOptions {
                mirror: false,
                ..UndistortOptions::default()
            },
        )
        .unwrap();
        let white = Image::from_fn(32, 24, 1, |_, _, _| 1.0);
        let out = corrector.undistort(&white);
        // Corners of the inner rectangle map inside the raw frame.
        assert!(out.get(0, 0, 0) > 0.5);
        assert!(out.get(31, 23, 0) > 0.5);
        assert!(out.get(16, 12, 0) > 0.99);

        // Alpha 1 keeps all source pixels and so zooms out.
        let full = optimal_new_camera_matrix(&b.camera_matrix, &b.distortion(), 32, 24, 1.0);
        let tight = optimal_new_camera_matrix(&b.camera_matrix, &b.distortion(), 32, 24, 0.0);
        assert!(full[0][0] < tight[0][0]);
    }

    #[test]
    fn test_bgr_input_is_reordered() {
        let corrector = LensCorrector::new(
            &bundle(vec![0.0; 4]),
            UndistortOptions {
                mirror: false,
                input_order: ChannelOrder::Bgr,
                ..UndistortOptions::default()
            },
        )
        .unwrap();
        let img = Image::from_fn(32, 24, 3, |_, _, c| [0.1, 0.5, 0.9][c]);
        let out = corrector.undistort(&img);
        assert!((out.get(10, 10, 0) - 0.9).abs() < 1e-4);
        assert!((out.get(10, 10, 2) - 0.1).abs() < 1e-4);
    }

    #[test]
    fn test_rejects_bad_coefficient_count() {
        assert!(bundle(vec![0.0; 6]).validate().is_err());
        assert!(bundle(vec![0.0; 14]).validate().is_ok());
    }

    #[test]
    fn test_load_bundle_and_batch() {
        let dir = tempfile::tempdir().unwrap();
        let calib = dir.path().join("calib.json");
        std::fs::write(
            &calib,
            r#"{ "camera_matrix": [[40,0,15.5],[0,42,11.5],[0,0,1]], "dist_coeffs": [0,0,0,0,0] }"#,
        )
        .unwrap();
        let b = CalibrationBundle::load(&calib).unwrap();

        let input = dir.path().join("raw");
        std::fs::create_dir(&input).unwrap();
        pattern(32, 24).save(&input.join("img_0_cam_2.tiff")).unwrap();
        std::fs::write(input.join("broken.png"), b"not an image").unwrap();

        let corrector = LensCorrector::new(&b, UndistortOptions::default()).unwrap();
        let out_dir = dir.path().join("undistorted_images");
        let written = undistort_directory(&input, &out_dir, &corrector).unwrap();
        assert_eq!(written, vec![out_dir.join("undistorted_img_0_cam_2.tiff")]);
    }
}
