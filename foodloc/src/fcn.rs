//! Fully convolutional heatmap models.
//!
//! An FCN slides a classifier with a fixed receptive field (`kernel_size`)
//! over its input with a stride of [`FCN_STRIDE`] pixels, yielding one class
//! distribution per window. The grid formulas here relate input sizes to
//! output grid sizes for any such network.

use anyhow::Result;
use image::DynamicImage;
use ort::{session::Session, value::Value};
use std::path::Path;
use std::time::Instant;

use crate::heatmap::{Heatmap, TensorLayout};
use crate::onnx_session::{create_onnx_session, io_names, SessionConfig};
use crate::preprocessing::{image_to_tensor, resize_exact, Preprocessing};

/// Output stride, in input pixels, of every supported backbone.
pub const FCN_STRIDE: u32 = 32;

/// Input dimensions requested from a predictor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSize {
    pub height: u32,
    pub width: u32,
}

/// Heatmap grid dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSize {
    pub rows: usize,
    pub cols: usize,
}

/// Output cells along one axis for an input of `input_dim` pixels.
///
/// Uses floor division, so inputs smaller than the kernel yield zero or a
/// negative count.
pub fn output_grid_dim(input_dim: i64, kernel_size: u32, stride: u32) -> i64 {
    (input_dim - i64::from(kernel_size)).div_euclid(i64::from(stride)) + 1
}

/// Smallest input along one axis that produces exactly `grid_dim` cells.
pub fn input_dim_for_grid(grid_dim: usize, kernel_size: u32, stride: u32) -> u32 {
    kernel_size + (grid_dim.saturating_sub(1) as u32) * stride
}

/// Input size for a network with `kernel_size` so that it outputs `grid`.
pub fn input_size_for_grid(grid: GridSize, kernel_size: u32) -> InputSize {
    InputSize {
        height: input_dim_for_grid(grid.rows, kernel_size, FCN_STRIDE),
        width: input_dim_for_grid(grid.cols, kernel_size, FCN_STRIDE),
    }
}

/// Anything that can turn an image into a class-probability heatmap.
pub trait HeatmapPredictor {
    /// Resize `image` to `input_size`, run the network and return its grid.
    fn predict(&mut self, image: &DynamicImage, input_size: InputSize) -> Result<Heatmap>;
}

/// ONNX-exported FCN.
pub struct OnnxFcn {
    session: Session,
    input_name: String,
    output_name: String,
    preprocessing: Preprocessing,
    layout: TensorLayout,
}

impl OnnxFcn {
    pub fn load(
        model_path: &Path,
        preprocessing: Preprocessing,
        layout: TensorLayout,
        device: &str,
    ) -> Result<Self> {
        let (session, info) = create_onnx_session(model_path, &SessionConfig { device })?;
        let (input_name, output_name) = io_names(&session)?;
        log::debug!(
            "Loaded FCN {} ({} bytes) in {:.1}ms",
            info.model_path,
            info.model_size_bytes,
            info.load_time_ms
        );

        Ok(Self {
            session,
            input_name,
            output_name,
            preprocessing,
            layout,
        })
    }
}

impl HeatmapPredictor for OnnxFcn {
    fn predict(&mut self, image: &DynamicImage, input_size: InputSize) -> Result<Heatmap> {
        let resized = resize_exact(image, input_size.width, input_size.height);
        let tensor = image_to_tensor(&resized, self.preprocessing, self.layout)?;

        let inference_start = Instant::now();
        let input_value = Value::from_array(tensor)
            .map_err(|e| anyhow::anyhow!("Failed to create input value: {}", e))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input_value])
            .map_err(|e| anyhow::anyhow!("Failed to run inference: {}", e))?;

        let output_view = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| anyhow::anyhow!("Failed to extract output array: {}", e))?;
        let heatmap = Heatmap::from_model_output(output_view, self.layout)?;

        log::trace!(
            "FCN inference at {}x{} -> {:?} in {:.1}ms",
            input_size.height,
            input_size.width,
            heatmap.grid_shape(),
            inference_start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(heatmap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_grid_dim_floor_division() {
        assert_eq!(output_grid_dim(288, 288, 32), 1);
        assert_eq!(output_grid_dim(319, 288, 32), 1);
        assert_eq!(output_grid_dim(320, 288, 32), 2);
        assert_eq!(output_grid_dim(442, 288, 32), 5);
        // Below the kernel the grid collapses
        assert_eq!(output_grid_dim(287, 288, 32), 0);
        assert_eq!(output_grid_dim(200, 288, 32), -2);
    }

    #[test]
    fn test_input_dim_inverts_grid_dim() {
        for kernel in [288u32, 295, 299] {
            for grid in 1..8usize {
                let input = input_dim_for_grid(grid, kernel, FCN_STRIDE);
                assert_eq!(output_grid_dim(i64::from(input), kernel, FCN_STRIDE), grid as i64);
            }
        }
    }

    #[test]
    fn test_input_size_for_grid_per_kernel() {
        let grid = GridSize { rows: 5, cols: 1 };
        assert_eq!(
            input_size_for_grid(grid, 299),
            InputSize {
                height: 299 + 4 * 32,
                width: 299
            }
        );
    }
}
