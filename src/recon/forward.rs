//! FFT-based lensless forward model.
//!
//! The latent scene lives on a zero-padded grid twice the sensor size in
//! each dimension. The sensor sees the central crop of the scene convolved
//! with the PSF, multiplied by a binary mask.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::error::{DatasetError, Result};
use crate::imaging::Image;

/// Convolution with a fixed PSF followed by crop and mask, and its adjoint.
pub struct ForwardModel {
    /// Sensor size as (rows, cols).
    sensor: (usize, usize),
    /// Padded grid size as (rows, cols).
    padded: (usize, usize),
    /// Top-left corner of the sensor crop inside the padded grid.
    offset: (usize, usize),
    /// Spectrum of the PSF placed with wraparound about its center.
    kernel_hat: Vec<Complex<f32>>,
    mask: Vec<f32>,
    row_fft: Arc<dyn Fft<f32>>,
    row_ifft: Arc<dyn Fft<f32>>,
    col_fft: Arc<dyn Fft<f32>>,
    col_ifft: Arc<dyn Fft<f32>>,
    lipschitz: f32,
}

impl ForwardModel {
    /// Build from a single-channel PSF and mask of the sensor size.
    pub fn new(psf: &Image, mask: &Image) -> Result<Self> {
        if psf.channels != 1 || mask.channels != 1 {
            return Err(DatasetError::Config(
                "forward model needs single-channel PSF and mask".to_string(),
            ));
        }
        if psf.dimensions() != mask.dimensions() {
            return Err(DatasetError::ShapeMismatch {
                what: "mask",
                expected: psf.dimensions(),
                found: mask.dimensions(),
            });
        }
        if psf.width == 0 || psf.height == 0 {
            return Err(DatasetError::Config("PSF is empty".to_string()));
        }

        let h = psf.height as usize;
        let w = psf.width as usize;
        let (ph, pw) = (2 * h, 2 * w);
        let offset = ((ph - h) / 2, (pw - w) / 2);

        let mut planner = FftPlanner::<f32>::new();
        let row_fft = planner.plan_fft_forward(pw);
        let row_ifft = planner.plan_fft_inverse(pw);
        let col_fft = planner.plan_fft_forward(ph);
        let col_ifft = planner.plan_fft_inverse(ph);

        // Kernel centered on the PSF's (H/2, W/2) pixel, wrapped so that
        // center lands on the origin.
        let (cy, cx) = (h / 2, w / 2);
        let mut kernel = vec![Complex::new(0.0, 0.0); ph * pw];
        for r in 0..h {
            for c in 0..w {
                let kr = (r + ph - cy) % ph;
                let kc = (c + pw - cx) % pw;
                kernel[kr * pw + kc] = Complex::new(psf.get(c as u32, r as u32, 0), 0.0);
            }
        }

        let mut model = Self {
            sensor: (h, w),
            padded: (ph, pw),
            offset,
            kernel_hat: Vec::new(),
            mask: mask.data.clone(),
            row_fft,
            row_ifft,
            col_fft,
            col_ifft,
            lipschitz: 0.0,
        };

        model.fft2(&mut kernel, false);
        model.lipschitz = kernel.iter().map(|k| k.norm_sqr()).fold(0.0, f32::max);
        model.kernel_hat = kernel;

        Ok(model)
    }

    pub fn sensor_shape(&self) -> (usize, usize) {
        self.sensor
    }

    pub fn padded_shape(&self) -> (usize, usize) {
        self.padded
    }

    pub fn padded_len(&self) -> usize {
        self.padded.0 * self.padded.1
    }

    /// Upper bound on the operator norm squared.
    pub fn lipschitz(&self) -> f32 {
        self.lipschitz
    }

    /// `A x`: padded-grid scene to masked sensor measurement.
    pub fn apply(&self, x: &[f32]) -> Vec<f32> {
        let mut buf: Vec<Complex<f32>> = x.iter().map(|&v| Complex::new(v, 0.0)).collect();
        self.convolve(&mut buf, false);

        let (h, w) = self.sensor;
        let (oy, ox) = self.offset;
        let pw = self.padded.1;
        let mut out = vec![0.0; h * w];
        for r in 0..h {
            for c in 0..w {
                out[r * w + c] = self.mask[r * w + c] * buf[(r + oy) * pw + ox + c].re;
            }
        }
        out
    }

    /// `Aᵀ r`: masked sensor residual back onto the padded grid.
    pub fn adjoint(&self, residual: &[f32]) -> Vec<f32> {
        let (h, w) = self.sensor;
        let (oy, ox) = self.offset;
        let pw = self.padded.1;

        let mut buf = vec![Complex::new(0.0, 0.0); self.padded_len()];
        for r in 0..h {
            for c in 0..w {
                buf[(r + oy) * pw + ox + c].re = self.mask[r * w + c] * residual[r * w + c];
            }
        }
        self.convolve(&mut buf, true);
        buf.iter().map(|v| v.re).collect()
    }

    /// Sensor-sized crop of a padded-grid image.
    pub fn crop(&self, x: &[f32]) -> Vec<f32> {
        let (h, w) = self.sensor;
        let (oy, ox) = self.offset;
        let pw = self.padded.1;
        let mut out = Vec::with_capacity(h * w);
        for r in 0..h {
            let start = (r + oy) * pw + ox;
            out.extend_from_slice(&x[start..start + w]);
        }
        out
    }

    /// Circular convolution with the PSF, or correlation when `adjoint`.
    fn convolve(&self, buf: &mut [Complex<f32>], adjoint: bool) {
        self.fft2(buf, false);
        for (v, k) in buf.iter_mut().zip(&self.kernel_hat) {
            *v *= if adjoint { k.conj() } else { *k };
        }
        self.fft2(buf, true);

        let scale = 1.0 / self.padded_len() as f32;
        for v in buf.iter_mut() {
            *v *= scale;
        }
    }

    /// Unnormalized 2D transform: rows, then columns.
    fn fft2(&self, buf: &mut [Complex<f32>], inverse: bool) {
        let (ph, pw) = self.padded;
        let (rows, cols) = if inverse {
            (&self.row_ifft, &self.col_ifft)
        } else {
            (&self.row_fft, &self.col_fft)
        };

        rows.process(buf);

        let mut transposed = vec![Complex::new(0.0, 0.0); ph * pw];
        for r in 0..ph {
            for c in 0..pw {
                transposed[c * ph + r] = buf[r * pw + c];
            }
        }
        cols.process(&mut transposed);
        for c in 0..pw {
            for r in 0..ph {
                buf[r * pw + c] = transposed[c * ph + r];
            }
        }
    }
}
