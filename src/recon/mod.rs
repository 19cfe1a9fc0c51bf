//! Lensless reconstruction by FISTA.
//!
//! Solves `min_x ½‖A x − b‖² + g(x)` where `A` is the masked, cropped PSF
//! convolution of [`ForwardModel`] and `g` is one of the regularizers of
//! [`RegularizerMode`]. The optional monotone variant (MFISTA) never accepts
//! an iterate with a larger objective than the previous one.

mod forward;
mod preprocess;
mod prox;

pub use forward::ForwardModel;
pub use preprocess::{prepare_mask, prepare_measurement, prepare_psf, select_channel};
pub use prox::{non_negative, soft_threshold_non_negative, total_variation, tv_denoise};

use serde::{Deserialize, Serialize};

use crate::error::{DatasetError, Result};
use crate::imaging::Image;

/// Regularizer applied by the proximal step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RegularizerMode {
    /// Isotropic total variation plus non-negativity.
    #[default]
    #[serde(rename = "tv")]
    Tv,
    /// L1 sparsity plus non-negativity.
    #[serde(rename = "native")]
    Native,
    /// Non-negativity only.
    #[serde(rename = "non-neg")]
    NonNeg,
}

/// Solver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconConfig {
    pub iterations: usize,
    pub mode: RegularizerMode,
    pub tv_lambda: f32,
    pub native_lambda: f32,
    /// Dual iterations per TV proximal step.
    pub tv_inner_iterations: usize,
    /// Use MFISTA.
    pub monotone: bool,
    /// Log progress every this many iterations; 0 disables.
    pub log_every: usize,
    /// Integer block-average downsampling applied before solving.
    pub downsample: u32,
    /// Channel solved for color inputs.
    pub channel: usize,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            iterations: 200,
            mode: RegularizerMode::Tv,
            tv_lambda: 1e-2,
            native_lambda: 1e-3,
            tv_inner_iterations: 20,
            monotone: false,
            log_every: 20,
            downsample: 8,
            channel: 1,
        }
    }
}

impl ReconConfig {
    pub fn validate(&self) -> Result<()> {
        if self.downsample == 0 {
            return Err(DatasetError::Config("downsample factor must be at least 1".to_string()));
        }
        if self.tv_lambda < 0.0 || self.native_lambda < 0.0 {
            return Err(DatasetError::Config("regularization weights must be non-negative".to_string()));
        }
        Ok(())
    }
}

/// Iterate state on the padded grid.
#[derive(Debug, Clone)]
pub struct ReconState {
    /// Current estimate `x_k`.
    pub x: Vec<f32>,
    /// Previous estimate `x_{k-1}`.
    pub x_prev: Vec<f32>,
    /// Momentum point `y_k`.
    pub y: Vec<f32>,
    /// Momentum scalar `t_k`.
    pub t: f32,
    pub step: f32,
    pub iteration: usize,
    /// Data fidelity of `x`.
    pub fidelity: f32,
    /// Full objective of `x`.
    pub objective: f32,
}

/// Objective values after one iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationStats {
    pub iteration: usize,
    pub fidelity: f32,
    pub objective: f32,
}

/// Result of a solve.
#[derive(Debug, Clone)]
pub struct ReconOutput {
    /// Estimate cropped to the sensor region, not normalized.
    pub image: Image,
    /// Per-iteration objective values, if requested.
    pub history: Vec<IterationStats>,
}

/// FISTA solver for one PSF/mask pair.
pub struct Reconstructor {
    model: ForwardModel,
    config: ReconConfig,
}

impl Reconstructor {
    pub fn new(psf: &Image, mask: &Image, config: ReconConfig) -> Result<Self> {
        config.validate()?;
        let model = ForwardModel::new(psf, mask)?;
        if model.lipschitz() <= 0.0 || !model.lipschitz().is_finite() {
            return Err(DatasetError::Singular("PSF spectrum"));
        }
        Ok(Self { model, config })
    }

    /// Build from a raw PSF and mask, selecting the configured channel and
    /// downsampling both before the forward model is formed.
    pub fn from_calibration(psf: &Image, mask: &Image, config: ReconConfig) -> Result<Self> {
        config.validate()?;
        let psf = prepare_psf(psf, config.channel, config.downsample)?;
        let mask = prepare_mask(mask, config.channel, config.downsample)?;
        Self::new(&psf, &mask, config)
    }

    pub fn config(&self) -> &ReconConfig {
        &self.config
    }

    pub fn model(&self) -> &ForwardModel {
        &self.model
    }

    /// Zero estimate with step `1/L`.
    pub fn initial_state(&self, b: &[f32]) -> ReconState {
        let n = self.model.padded_len();
        let zero = vec![0.0; n];
        let (fidelity, objective) = self.evaluate(&zero, b);
        ReconState {
            x: zero.clone(),
            x_prev: zero.clone(),
            y: zero,
            t: 1.0,
            step: 1.0 / self.model.lipschitz(),
            iteration: 0,
            fidelity,
            objective,
        }
    }

    /// `½‖A x − b‖²` and that plus the regularizer.
    pub fn evaluate(&self, x: &[f32], b: &[f32]) -> (f32, f32) {
        let fidelity = 0.5
            * self
                .model
                .apply(x)
                .iter()
                .zip(b)
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>();
        (fidelity, fidelity + self.regularizer(x))
    }

    fn regularizer(&self, x: &[f32]) -> f32 {
        match self.config.mode {
            RegularizerMode::Tv => {
                let (ph, pw) = self.model.padded_shape();
                self.config.tv_lambda * total_variation(x, pw, ph)
            }
            RegularizerMode::Native => self.config.native_lambda * x.iter().map(|v| v.abs()).sum::<f32>(),
            RegularizerMode::NonNeg => 0.0,
        }
    }

    fn prox(&self, v: &mut [f32], step: f32) {
        match self.config.mode {
            RegularizerMode::Tv => {
                let (ph, pw) = self.model.padded_shape();
                tv_denoise(v, pw, ph, step * self.config.tv_lambda, self.config.tv_inner_iterations);
                non_negative(v);
            }
            RegularizerMode::Native => soft_threshold_non_negative(v, step * self.config.native_lambda),
            RegularizerMode::NonNeg => non_negative(v),
        }
    }

    /// One proximal-gradient step with momentum.
    pub fn step(&self, state: &mut ReconState, b: &[f32]) {
        let residual: Vec<f32> = self
            .model
            .apply(&state.y)
            .iter()
            .zip(b)
            .map(|(a, b)| a - b)
            .collect();
        let grad = self.model.adjoint(&residual);

        let mut z: Vec<f32> = state
            .y
            .iter()
            .zip(&grad)
            .map(|(y, g)| y - state.step * g)
            .collect();
        self.prox(&mut z, state.step);

        let t = state.t;
        let t_next = (1.0 + (1.0 + 4.0 * t * t).sqrt()) / 2.0;
        let momentum = (t - 1.0) / t_next;

        if self.config.monotone {
            let (fz, oz) = self.evaluate(&z, b);
            let x_new = if oz <= state.objective {
                state.fidelity = fz;
                state.objective = oz;
                z.clone()
            } else {
                state.x.clone()
            };
            let pull = t / t_next;
            state.y = x_new
                .iter()
                .zip(&z)
                .zip(&state.x)
                .map(|((xn, z), x)| xn + pull * (z - xn) + momentum * (xn - x))
                .collect();
            state.x_prev = std::mem::replace(&mut state.x, x_new);
        } else {
            state.y = z
                .iter()
                .zip(&state.x)
                .map(|(xn, x)| xn + momentum * (xn - x))
                .collect();
            state.x_prev = std::mem::replace(&mut state.x, z);
        }

        state.t = t_next;
        state.iteration += 1;
    }

    /// Run the configured number of iterations on a prepared measurement.
    pub fn solve(&self, measurement: &Image, record_history: bool) -> Result<ReconOutput> {
        let (h, w) = self.model.sensor_shape();
        if measurement.channels != 1 {
            return Err(DatasetError::Config(
                "reconstruction needs a single-channel measurement".to_string(),
            ));
        }
        if measurement.dimensions() != (w as u32, h as u32) {
            return Err(DatasetError::ShapeMismatch {
                what: "measurement",
                expected: (w as u32, h as u32),
                found: measurement.dimensions(),
            });
        }

        let b = &measurement.data;
        let mut state = self.initial_state(b);
        let mut history = Vec::new();
        let log_every = self.config.log_every;

        for k in 0..self.config.iterations {
            self.step(&mut state, b);

            let logging = log_every > 0 && (k + 1) % log_every == 0;
            if !(record_history || logging) {
                continue;
            }
            let (fidelity, objective) = if self.config.monotone {
                (state.fidelity, state.objective)
            } else {
                self.evaluate(&state.x, b)
            };
            if logging {
                log::info!(
                    "Iteration {}/{}: data fidelity {:.4e}, objective {:.4e}",
                    k + 1,
                    self.config.iterations,
                    fidelity,
                    objective
                );
            }
            if record_history {
                history.push(IterationStats {
                    iteration: k + 1,
                    fidelity,
                    objective,
                });
            }
        }

        let image = Image::from_vec(w as u32, h as u32, 1, self.model.crop(&state.x))?;
        Ok(ReconOutput { image, history })
    }

    pub fn reconstruct(&self, measurement: &Image) -> Result<Image> {
        Ok(self.solve(measurement, false)?.image)
    }
}

/// Clamp to non-negative and scale to unit maximum.
pub fn normalize_for_display(image: &Image) -> Image {
    let mut out = image.clone();
    for v in &mut out.data {
        *v = v.max(0.0);
    }
    out.normalize_max();
    out
}
