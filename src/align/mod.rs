//! Homography alignment into the reference camera's frame.

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::load_json;
use crate::error::{DatasetError, Result};
use crate::imaging::{list_images, Image};

/// Determinant below which a homography is treated as singular.
const SINGULAR_EPS: f64 = 1e-10;

/// Projective transform from a source camera to the reference camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Homography {
    /// 3x3 matrix (row-major).
    pub matrix: [[f64; 3]; 3],
}

/// On-disk forms of a homography artifact.
#[derive(Deserialize)]
#[serde(untagged)]
enum HomographyFile {
    Wrapped { matrix: [[f64; 3]; 3] },
    Bare([[f64; 3]; 3]),
}

impl Default for Homography {
    fn default() -> Self {
        Self::identity()
    }
}

impl Homography {
    pub fn new(matrix: [[f64; 3]; 3]) -> Self {
        Self { matrix }
    }

    pub fn identity() -> Self {
        Self::new([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]])
    }

    /// Load `{"matrix": [[..]]}` or a bare 3x3 array.
    pub fn load(path: &Path) -> Result<Self> {
        let matrix = match load_json::<HomographyFile>(path)? {
            HomographyFile::Wrapped { matrix } => matrix,
            HomographyFile::Bare(matrix) => matrix,
        };
        let homography = Self::new(matrix);
        homography.inverse()?;
        Ok(homography)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::config::save_json(self, path)
    }

    pub fn determinant(&self) -> f64 {
        let h = &self.matrix;
        h[0][0] * (h[1][1] * h[2][2] - h[1][2] * h[2][1])
            - h[0][1] * (h[1][0] * h[2][2] - h[1][2] * h[2][0])
            + h[0][2] * (h[1][0] * h[2][1] - h[1][1] * h[2][0])
    }

    /// Apply to a point. Points mapped to infinity come back as NaN.
    pub fn transform_point(&self, x: f64, y: f64) -> (f64, f64) {
        let h = &self.matrix;
        let w = h[2][0] * x + h[2][1] * y + h[2][2];
        if w.abs() < SINGULAR_EPS {
            return (f64::NAN, f64::NAN);
        }
        let tx = (h[0][0] * x + h[0][1] * y + h[0][2]) / w;
        let ty = (h[1][0] * x + h[1][1] * y + h[1][2]) / w;
        (tx, ty)
    }

    pub fn inverse(&self) -> Result<Homography> {
        let h = &self.matrix;
        let det = self.determinant();
        if det.abs() < SINGULAR_EPS {
            return Err(DatasetError::Singular("homography"));
        }

        let inv_det = 1.0 / det;
        Ok(Homography::new([
            [
                (h[1][1] * h[2][2] - h[1][2] * h[2][1]) * inv_det,
                (h[0][2] * h[2][1] - h[0][1] * h[2][2]) * inv_det,
                (h[0][1] * h[1][2] - h[0][2] * h[1][1]) * inv_det,
            ],
            [
                (h[1][2] * h[2][0] - h[1][0] * h[2][2]) * inv_det,
                (h[0][0] * h[2][2] - h[0][2] * h[2][0]) * inv_det,
                (h[0][2] * h[1][0] - h[0][0] * h[1][2]) * inv_det,
            ],
            [
                (h[1][0] * h[2][1] - h[1][1] * h[2][0]) * inv_det,
                (h[0][1] * h[2][0] - h[0][0] * h[2][1]) * inv_det,
                (h[0][0] * h[1][1] - h[0][1] * h[1][0]) * inv_det,
            ],
        ]))
    }
}

/// Warp `image` by `homography` into a `width x height` canvas. Each output
/// pixel is pulled from the source through the inverse transform; pixels
/// falling outside the source are zero.
pub fn warp_perspective(image: &Image, homography: &Homography, width: u32, height: u32) -> Result<Image> {
    let inverse = homography.inverse()?;
    Ok(image.remap(width, height, |x, y| {
        inverse.transform_point(x as f64, y as f64)
    }))
}

/// Normalize by the image's maximum, resample to `target` if needed and
/// warp into the reference frame.
pub fn align(image: &Image, homography: &Homography, target: (u32, u32)) -> Result<Image> {
    let mut normalized = image.clone();
    normalized.normalize_max();

    let resized = if normalized.dimensions() == target {
        normalized
    } else {
        normalized.resize(target.0, target.1)
    };

    warp_perspective(&resized, homography, target.0, target.1)
}

/// Align every image of `input_dir` into `output_dir` as `warped_{name}`.
/// Without a `target` size each image keeps its own. Unreadable images are
/// skipped with a warning.
pub fn align_directory(
    input_dir: &Path,
    output_dir: &Path,
    homography: &Homography,
    target: Option<(u32, u32)>,
) -> Result<Vec<PathBuf>> {
    homography.inverse()?;
    let names = list_images(input_dir)?;
    std::fs::create_dir_all(output_dir).map_err(|e| DatasetError::io(output_dir, e))?;

    let written: Vec<PathBuf> = names
        .par_iter()
        .filter_map(|name| {
            let src = input_dir.join(name);
            let dst = output_dir.join(format!("warped_{}", name));
            let result = Image::load(&src)
                .and_then(|img| {
                    let size = target.unwrap_or_else(|| img.dimensions());
                    align(&img, homography, size)
                })
                .and_then(|warped| warped.save(&dst));
            match result {
                Ok(()) => Some(dst),
                Err(e) => {
                    log::warn!("Skipping {}: {}", src.display(), e);
                    None
                }
            }
        })
        .collect();

    log::info!("Saved {} warped images to {}", written.len(), output_dir.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(w: u32, h: u32) -> Image {
        Image::from_fn(w, h, 1, |x, y, _| {
            let dx = x as f32 - w as f32 / 2.0;
            let dy = y as f32 - h as f32 / 2.0;
            (-(dx * dx + dy * dy) / 40.0).exp()
        })
    }

    #[test]
    fn test_identity_transform() {
        let (tx, ty) = Homography::identity().transform_point(100.0, 200.0);
        assert!((tx - 100.0).abs() < 1e-9);
        assert!((ty - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_matrix_invert() {
        let h = Homography::new([[2.0, 0.0, 0.0], [0.0, 3.0, 0.0], [0.0, 0.0, 1.0]]);
        let inv = h.inverse().unwrap();
        assert!((inv.matrix[0][0] - 0.5).abs() < 1e-9);
        assert!((inv.matrix[1][1] - 1.0 / 3.0).abs() < 1e-9);

        let singular = Homography::new([[1.0, 2.0, 0.0], [2.0, 4.0, 0.0], [0.0, 0.0, 1.0]]);
        assert!(matches!(singular.inverse(), Err(DatasetError::Singular(_))));
    }

    #[test]
    fn test_forward_then_inverse_round_trip() {
        let h = Homography::new([[1.02, 0.03, 1.5], [-0.02, 0.98, -1.0], [1e-4, -5e-5, 1.0]]);
        let img = blob(40, 32);

        let warped = warp_perspective(&img, &h, 40, 32).unwrap();
        let back = warp_perspective(&warped, &h.inverse().unwrap(), 40, 32).unwrap();

        // Compare away from the border, where content was never cut off.
        for y in 8..24 {
            for x in 10..30 {
                assert!((back.get(x, y, 0) - img.get(x, y, 0)).abs() < 0.05);
            }
        }
    }

    #[test]
    fn test_align_normalizes_and_resizes() {
        let mut img = blob(20, 16);
        for v in &mut img.data {
            *v *= 0.25;
        }
        let out = align(&img, &Homography::identity(), (20, 16)).unwrap();
        assert_eq!(out.dimensions(), (20, 16));
        assert!((out.max() - 1.0).abs() < 1e-5);

        let resized = align(&img, &Homography::identity(), (10, 8)).unwrap();
        assert_eq!(resized.dimensions(), (10, 8));
    }

    #[test]
    fn test_translation_leaves_zero_border() {
        let img = Image::from_fn(8, 8, 1, |_, _, _| 1.0);
        let shift = Homography::new([[1.0, 0.0, 3.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        let out = warp_perspective(&img, &shift, 8, 8).unwrap();
        assert_eq!(out.get(0, 4, 0), 0.0);
        assert_eq!(out.get(2, 4, 0), 0.0);
        assert!((out.get(5, 4, 0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_both_artifact_forms() {
        let dir = tempfile::tempdir().unwrap();
        let wrapped = dir.path().join("h.json");
        let bare = dir.path().join("bare.json");
        std::fs::write(&wrapped, r#"{"matrix": [[1,0,2],[0,1,0],[0,0,1]]}"#).unwrap();
        std::fs::write(&bare, "[[1,0,2],[0,1,0],[0,0,1]]").unwrap();

        assert_eq!(Homography::load(&wrapped).unwrap(), Homography::load(&bare).unwrap());
    }

    #[test]
    fn test_align_directory_prefixes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("recons");
        std::fs::create_dir(&input).unwrap();
        blob(12, 10).save(&input.join("a.png")).unwrap();

        let out = dir.path().join("aligned");
        let written = align_directory(&input, &out, &Homography::identity(), None).unwrap();
        assert_eq!(written, vec![out.join("warped_a.png")]);

        let warped = Image::load(&out.join("warped_a.png")).unwrap();
        assert_eq!(warped.dimensions(), (12, 10));
    }
}
