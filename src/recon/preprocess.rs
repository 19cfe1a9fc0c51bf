//! Preparation of PSF, mask and measurement for the solver.

use crate::error::{DatasetError, Result};
use crate::imaging::Image;

/// Mask values at or above this become 1.
const MASK_THRESHOLD: f32 = 0.5;

/// Channel `channel` of a color image; grayscale images pass through.
pub fn select_channel(image: &Image, channel: usize) -> Result<Image> {
    if image.channels == 1 {
        Ok(image.clone())
    } else {
        image.channel(channel)
    }
}

/// Remove the background level and scale to unit L2 norm.
pub fn prepare_psf(psf: &Image, channel: usize, factor: u32) -> Result<Image> {
    let mut out = select_channel(psf, channel)?.downsample(factor);
    let background = out.min();
    for v in &mut out.data {
        *v = (*v - background).max(0.0);
    }

    let norm = out.data.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm <= 0.0 || !norm.is_finite() {
        return Err(DatasetError::Config("PSF is blank after background removal".to_string()));
    }
    for v in &mut out.data {
        *v /= norm;
    }
    Ok(out)
}

/// Binarize after downsampling.
pub fn prepare_mask(mask: &Image, channel: usize, factor: u32) -> Result<Image> {
    let mut out = select_channel(mask, channel)?.downsample(factor);
    for v in &mut out.data {
        *v = if *v >= MASK_THRESHOLD { 1.0 } else { 0.0 };
    }
    Ok(out)
}

/// Scale to unit maximum after downsampling.
pub fn prepare_measurement(measurement: &Image, channel: usize, factor: u32) -> Result<Image> {
    let mut out = select_channel(measurement, channel)?.downsample(factor);
    out.normalize_max();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psf_background_removed_and_unit_norm() {
        let psf = Image::from_fn(8, 8, 3, |x, y, c| {
            let peak = if (x, y) == (4, 4) { 0.8 } else { 0.0 };
            0.1 + peak + c as f32 * 0.01
        });
        let out = prepare_psf(&psf, 1, 1).unwrap();
        assert_eq!(out.channels, 1);
        assert!(out.min().abs() < 1e-7);
        let norm: f32 = out.data.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!((out.get(4, 4, 0) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_blank_psf_rejected() {
        let psf = Image::from_fn(4, 4, 1, |_, _, _| 0.3);
        assert!(prepare_psf(&psf, 0, 1).is_err());
    }

    #[test]
    fn test_mask_binarized() {
        let mask = Image::from_fn(4, 2, 1, |x, _, _| x as f32 / 4.0);
        let out = prepare_mask(&mask, 0, 2).unwrap();
        assert_eq!(out.dimensions(), (2, 1));
        // Blocks average to 0.125 and 0.625.
        assert_eq!(out.data, vec![0.0, 1.0]);
    }
}
