//! Lensless Dataset Capture and Reconstruction
//!
//! Tooling for building paired lensless / lensed image datasets:
//! - Synchronized capture from a three-camera rig (DiffuserCam, RML, ground truth)
//! - Lens distortion correction for the lensed cameras
//! - Homography alignment into the reference camera's frame
//! - FISTA reconstruction of lensless captures

pub mod align;
pub mod capture;
pub mod config;
pub mod error;
pub mod imaging;
pub mod pipeline;
pub mod recon;
pub mod undistort;

pub use error::{DatasetError, Result};
