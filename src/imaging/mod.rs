//! Floating-point image buffers shared by the offline stages.
//!
//! Pixels are stored interleaved, row-major, with an arbitrary channel
//! count. Values loaded from disk are scaled to `[0, 1]` by the source
//! sample type's maximum.

mod listing;

pub use listing::{is_image_file, list_images, natural_cmp, IMAGE_EXTENSIONS};

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageBuffer, Luma, Rgb};
use rayon::prelude::*;

use crate::error::{DatasetError, Result};

/// Channel order of a color frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Bgr,
}

/// Interleaved `f32` image.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub channels: usize,
    pub data: Vec<f32>,
}

impl Image {
    /// Create a zero-filled image.
    pub fn new(width: u32, height: u32, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
            data: vec![0.0; width as usize * height as usize * channels],
        }
    }

    pub fn from_vec(width: u32, height: u32, channels: usize, data: Vec<f32>) -> Result<Self> {
        let expected = width as usize * height as usize * channels;
        if data.len() != expected {
            return Err(DatasetError::Config(format!(
                "buffer of {} samples does not fit a {}x{}x{} image",
                data.len(),
                width,
                height,
                channels
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    pub fn from_fn<F>(width: u32, height: u32, channels: usize, mut f: F) -> Self
    where
        F: FnMut(u32, u32, usize) -> f32,
    {
        let mut img = Self::new(width, height, channels);
        for y in 0..height {
            for x in 0..width {
                for c in 0..channels {
                    let idx = img.index(x, y, c);
                    img.data[idx] = f(x, y, c);
                }
            }
        }
        img
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[inline]
    pub fn index(&self, x: u32, y: u32, c: usize) -> usize {
        (y as usize * self.width as usize + x as usize) * self.channels + c
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32, c: usize) -> f32 {
        self.data[self.index(x, y, c)]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, c: usize, value: f32) {
        let idx = self.index(x, y, c);
        self.data[idx] = value;
    }

    /// Sample with out-of-bounds pixels reading as zero.
    fn sample_or_zero(&self, x: i64, y: i64, c: usize) -> f32 {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            0.0
        } else {
            self.get(x as u32, y as u32, c)
        }
    }

    /// Bilinear interpolation at a sub-pixel position, black outside the frame.
    pub fn sample_bilinear(&self, x: f64, y: f64, c: usize) -> f32 {
        if !x.is_finite() || !y.is_finite() {
            return 0.0;
        }
        if x <= -1.0 || y <= -1.0 || x >= self.width as f64 || y >= self.height as f64 {
            return 0.0;
        }

        let x0 = x.floor() as i64;
        let y0 = y.floor() as i64;
        let fx = (x - x0 as f64) as f32;
        let fy = (y - y0 as f64) as f32;

        let v00 = self.sample_or_zero(x0, y0, c);
        let v10 = self.sample_or_zero(x0 + 1, y0, c);
        let v01 = self.sample_or_zero(x0, y0 + 1, c);
        let v11 = self.sample_or_zero(x0 + 1, y0 + 1, c);

        let v0 = v00 * (1.0 - fx) + v10 * fx;
        let v1 = v01 * (1.0 - fx) + v11 * fx;
        v0 * (1.0 - fy) + v1 * fy
    }

    /// Inverse-map resampling into a `width x height` canvas. `map` gives the
    /// source position of each destination pixel; rows run in parallel.
    pub fn remap<F>(&self, width: u32, height: u32, map: F) -> Image
    where
        F: Fn(u32, u32) -> (f64, f64) + Sync,
    {
        let mut out = Image::new(width, height, self.channels);
        let ch = self.channels;
        let row_len = width as usize * ch;
        if row_len == 0 {
            return out;
        }

        out.data
            .par_chunks_mut(row_len)
            .enumerate()
            .for_each(|(y, row)| {
                let y = y as u32;
                for x in 0..width {
                    let (sx, sy) = map(x, y);
                    for c in 0..ch {
                        row[x as usize * ch + c] = self.sample_bilinear(sx, sy, c);
                    }
                }
            });
        out
    }

    /// Extract a single channel as a one-channel image.
    pub fn channel(&self, c: usize) -> Result<Image> {
        if c >= self.channels {
            return Err(DatasetError::Config(format!(
                "channel {} requested from a {}-channel image",
                c, self.channels
            )));
        }
        let data = self
            .data
            .chunks_exact(self.channels)
            .map(|px| px[c])
            .collect();
        Image::from_vec(self.width, self.height, 1, data)
    }

    /// Mirror left-right in place.
    pub fn flip_horizontal(&mut self) {
        let w = self.width as usize;
        let ch = self.channels;
        for row in self.data.chunks_exact_mut(w * ch) {
            for x in 0..w / 2 {
                let mirror = w - 1 - x;
                for c in 0..ch {
                    row.swap(x * ch + c, mirror * ch + c);
                }
            }
        }
    }

    /// Reorder a three-channel frame to RGB.
    pub fn to_rgb_order(&mut self, order: ChannelOrder) {
        if order == ChannelOrder::Bgr && self.channels >= 3 {
            for px in self.data.chunks_exact_mut(self.channels) {
                px.swap(0, 2);
            }
        }
    }

    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn min(&self) -> f32 {
        self.data.iter().copied().fold(f32::INFINITY, f32::min)
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        (self.data.iter().map(|&v| v as f64).sum::<f64>() / self.data.len() as f64) as f32
    }

    /// Divide by the image's own maximum. All-zero images are left untouched.
    pub fn normalize_max(&mut self) {
        let max = self.max();
        if max > 0.0 && max.is_finite() {
            for v in &mut self.data {
                *v /= max;
            }
        }
    }

    /// Resample to `width x height` with an anti-aliasing filter.
    ///
    /// Values are expected in `[0, 1]`; the filter clamps to that range.
    pub fn resize(&self, width: u32, height: u32) -> Image {
        if (width, height) == (self.width, self.height) {
            return self.clone();
        }

        let mut out = Image::new(width, height, self.channels);
        for c in 0..self.channels {
            let plane: ImageBuffer<Luma<f32>, Vec<f32>> =
                ImageBuffer::from_fn(self.width, self.height, |x, y| Luma([self.get(x, y, c)]));
            let resized = imageops::resize(&plane, width, height, FilterType::Triangle);
            for (x, y, px) in resized.enumerate_pixels() {
                out.set(x, y, c, px.0[0]);
            }
        }
        out
    }

    /// Block-average downsampling by an integer factor. Trailing rows and
    /// columns that do not fill a whole block are dropped.
    pub fn downsample(&self, factor: u32) -> Image {
        if factor <= 1 {
            return self.clone();
        }
        let width = self.width / factor;
        let height = self.height / factor;
        let norm = 1.0 / (factor * factor) as f32;

        Image::from_fn(width, height, self.channels, |x, y, c| {
            let mut sum = 0.0;
            for dy in 0..factor {
                for dx in 0..factor {
                    sum += self.get(x * factor + dx, y * factor + dy, c);
                }
            }
            sum * norm
        })
    }

    /// Load an image from disk, keeping one channel for grayscale sources
    /// and three for color sources. Alpha is dropped.
    pub fn load(path: &Path) -> Result<Image> {
        let dynamic = image::open(path).map_err(|e| DatasetError::image(path, e))?;
        Ok(Self::from_dynamic(dynamic))
    }

    pub fn from_dynamic(dynamic: DynamicImage) -> Image {
        if dynamic.color().has_color() {
            let rgb = dynamic.into_rgb32f();
            let (w, h) = rgb.dimensions();
            Image {
                width: w,
                height: h,
                channels: 3,
                data: rgb.into_raw(),
            }
        } else {
            let luma = dynamic.to_luma32f();
            let (w, h) = luma.dimensions();
            Image {
                width: w,
                height: h,
                channels: 1,
                data: luma.into_raw(),
            }
        }
    }

    /// Save to disk. JPEG targets are written as 8-bit, everything else as
    /// 16-bit. Values are clamped to `[0, 1]`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let eight_bit = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg"))
            .unwrap_or(false);

        let dynamic = match (self.channels, eight_bit) {
            (1, false) => DynamicImage::ImageLuma16(ImageBuffer::from_fn(
                self.width,
                self.height,
                |x, y| Luma([to_u16(self.get(x, y, 0))]),
            )),
            (1, true) => DynamicImage::ImageLuma8(ImageBuffer::from_fn(
                self.width,
                self.height,
                |x, y| Luma([to_u8(self.get(x, y, 0))]),
            )),
            (3, false) => DynamicImage::ImageRgb16(ImageBuffer::from_fn(
                self.width,
                self.height,
                |x, y| {
                    Rgb([
                        to_u16(self.get(x, y, 0)),
                        to_u16(self.get(x, y, 1)),
                        to_u16(self.get(x, y, 2)),
                    ])
                },
            )),
            (3, true) => DynamicImage::ImageRgb8(ImageBuffer::from_fn(
                self.width,
                self.height,
                |x, y| {
                    Rgb([
                        to_u8(self.get(x, y, 0)),
                        to_u8(self.get(x, y, 1)),
                        to_u8(self.get(x, y, 2)),
                    ])
                },
            )),
            (n, _) => {
                return Err(DatasetError::Config(format!(
                    "cannot save a {}-channel image",
                    n
                )))
            }
        };

        dynamic.save(path).map_err(|e| DatasetError::image(path, e))
    }
}

fn to_u16(v: f32) -> u16 {
    (v.clamp(0.0, 1.0) * 65535.0).round() as u16
}

fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}
