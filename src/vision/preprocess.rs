//! Image preprocessing for the vision-language model
//!
//! Decodes a photo, resizes it to the model's input size, normalizes it and
//! lays it out as a flat tensor.

use image::RgbImage;
use ndarray::{Array3, Array4};
use tracing::debug;

use crate::config::{ChannelOrder, InputSettings, TensorLayout};
use crate::error::PipelineError;

/// Flat input tensor ready for the model
///
/// Produced once per request and consumed by the inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedImage {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
    pub channels: usize,
    pub layout: TensorLayout,
}

impl PreprocessedImage {
    /// Tensor shape with a batch dimension of 1
    pub fn shape(&self) -> Vec<usize> {
        let (h, w, c) = (self.height as usize, self.width as usize, self.channels);
        match self.layout {
            TensorLayout::Planar => vec![1, c, h, w],
            TensorLayout::Interleaved => vec![1, h, w, c],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Turns encoded photos into input tensors
#[derive(Debug, Clone)]
pub struct TensorPreprocessor {
    input: InputSettings,
}

impl TensorPreprocessor {
    pub fn new(input: InputSettings) -> Self {
        Self { input }
    }

    pub fn settings(&self) -> &InputSettings {
        &self.input
    }

    /// Decode, resize, normalize and lay out `bytes`
    pub fn transform(&self, bytes: &[u8]) -> Result<PreprocessedImage, PipelineError> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| PipelineError::ImageDecode(e.to_string()))?;
        let (src_w, src_h) = (decoded.width(), decoded.height());
        let (dst_w, dst_h) = (self.input.width, self.input.height);

        if src_w == 0 || src_h == 0 {
            return Err(PipelineError::ImageResize(format!(
                "source image has zero area ({src_w}x{src_h})"
            )));
        }
        if dst_w == 0 || dst_h == 0 {
            return Err(PipelineError::ImageResize(format!(
                "target size has zero area ({dst_w}x{dst_h})"
            )));
        }

        // 1. RGB f32 in [0, 1]
        let rgb = rgb_to_f32(&decoded.to_rgb8());
        drop(decoded);

        // 2. Stretch to the model's input size
        let resized = resize_bilinear(&rgb, dst_w as usize, dst_h as usize);
        drop(rgb);

        // 3. Channel order, then mean/std
        let ordered = match self.input.channel_order {
            ChannelOrder::Rgb => resized,
            ChannelOrder::Bgr => swap_red_blue(resized),
        };
        let (mean, std) = match self.input.channel_order {
            ChannelOrder::Rgb => (self.input.mean, self.input.std),
            ChannelOrder::Bgr => (reversed(self.input.mean), reversed(self.input.std)),
        };
        let normalized = normalize(&ordered, &mean, &std);

        // 4. Flatten in the expected layout
        let data = match self.input.layout {
            TensorLayout::Planar => hwc_to_nchw(&normalized).into_iter().collect(),
            TensorLayout::Interleaved => normalized.into_iter().collect(),
        };

        debug!(
            "Preprocessed {}x{} photo into {}x{} tensor",
            src_w, src_h, dst_w, dst_h
        );

        Ok(PreprocessedImage {
            data,
            width: dst_w,
            height: dst_h,
            channels: 3,
            layout: self.input.layout,
        })
    }
}

/// Convert an RGB image to an HWC f32 array scaled to [0, 1]
pub fn rgb_to_f32(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    let mut rgb = Array3::<f32>::zeros((height as usize, width as usize, 3));

    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            rgb[[y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
        }
    }

    rgb
}

/// Bilinear resize to exactly `new_w` x `new_h` (aspect ratio is not kept)
///
/// Sample positions are aligned on pixel centers.
pub fn resize_bilinear(image: &Array3<f32>, new_w: usize, new_h: usize) -> Array3<f32> {
    let (h, w, c) = image.dim();
    let scale_y = h as f32 / new_h as f32;
    let scale_x = w as f32 / new_w as f32;

    let mut resized = Array3::<f32>::zeros((new_h, new_w, c));

    for y in 0..new_h {
        let src_y = ((y as f32 + 0.5) * scale_y - 0.5).clamp(0.0, (h - 1) as f32);
        let y0 = src_y.floor() as usize;
        let y1 = (y0 + 1).min(h - 1);
        let fy = src_y - y0 as f32;

        for x in 0..new_w {
            let src_x = ((x as f32 + 0.5) * scale_x - 0.5).clamp(0.0, (w - 1) as f32);
            let x0 = src_x.floor() as usize;
            let x1 = (x0 + 1).min(w - 1);
            let fx = src_x - x0 as f32;

            for ch in 0..c {
                let v00 = image[[y0, x0, ch]];
                let v01 = image[[y0, x1, ch]];
                let v10 = image[[y1, x0, ch]];
                let v11 = image[[y1, x1, ch]];

                let v0 = v00 * (1.0 - fx) + v01 * fx;
                let v1 = v10 * (1.0 - fx) + v11 * fx;
                resized[[y, x, ch]] = v0 * (1.0 - fy) + v1 * fy;
            }
        }
    }

    resized
}

/// Normalize image with mean and std
pub fn normalize(image: &Array3<f32>, mean: &[f32; 3], std: &[f32; 3]) -> Array3<f32> {
    let mut normalized = image.clone();
    for ((_, _, c), value) in normalized.indexed_iter_mut() {
        *value = (*value - mean[c]) / std[c];
    }
    normalized
}

/// Convert HWC image to NCHW tensor (batch size 1)
pub fn hwc_to_nchw(image: &Array3<f32>) -> Array4<f32> {
    let (h, w, c) = image.dim();
    let mut tensor = Array4::<f32>::zeros((1, c, h, w));

    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                tensor[[0, ch, y, x]] = image[[y, x, ch]];
            }
        }
    }

    tensor
}

fn swap_red_blue(mut image: Array3<f32>) -> Array3<f32> {
    let (h, w, _) = image.dim();
    for y in 0..h {
        for x in 0..w {
            image.swap([y, x, 0], [y, x, 2]);
        }
    }
    image
}

fn reversed(values: [f32; 3]) -> [f32; 3] {
    [values[2], values[1], values[0]]
}
