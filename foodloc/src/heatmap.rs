//! Class-probability heatmaps produced by fully convolutional networks.
//!
//! A heatmap is a `rows × cols × classes` grid. Every cell holds the class
//! distribution the network predicts for the receptive field anchored at that
//! cell.

use anyhow::Result;
use image::{imageops::FilterType, GrayImage, Luma};
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, ArrayViewD, Axis};
use serde::{Deserialize, Serialize};

/// Memory layout of the tensor returned by an ONNX model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// Batch, height, width, channels (Keras / TensorFlow exports)
    #[default]
    Nhwc,
    /// Batch, channels, height, width (PyTorch exports)
    Nchw,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Heatmap {
    probs: Array3<f32>,
}

impl Heatmap {
    /// Wrap a `rows × cols × classes` probability array.
    pub fn new(probs: Array3<f32>) -> Self {
        Self { probs }
    }

    /// Build a heatmap from a raw model output with a leading batch axis of 1.
    pub fn from_model_output(output: ArrayViewD<'_, f32>, layout: TensorLayout) -> Result<Self> {
        let shape = output.shape().to_vec();
        if shape.len() != 4 || shape[0] != 1 {
            return Err(anyhow::anyhow!(
                "Expected a [1, _, _, _] heatmap tensor, got shape {shape:?}"
            ));
        }

        let grid = output.index_axis(Axis(0), 0);
        let grid = grid
            .into_dimensionality::<ndarray::Ix3>()
            .map_err(|e| anyhow::anyhow!("Failed to reshape heatmap tensor: {}", e))?;

        let probs = match layout {
            TensorLayout::Nhwc => grid.to_owned(),
            TensorLayout::Nchw => grid.permuted_axes([1, 2, 0]).as_standard_layout().to_owned(),
        };

        Ok(Self { probs })
    }

    /// Grid dimensions as `(rows, cols)`.
    pub fn grid_shape(&self) -> (usize, usize) {
        let shape = self.probs.shape();
        (shape[0], shape[1])
    }

    pub fn num_classes(&self) -> usize {
        self.probs.shape()[2]
    }

    pub fn probability(&self, row: usize, col: usize, class: usize) -> f32 {
        self.probs[[row, col, class]]
    }

    /// Class distribution at one cell.
    pub fn cell(&self, row: usize, col: usize) -> ArrayView1<'_, f32> {
        self.probs.slice(ndarray::s![row, col, ..])
    }

    /// Probability of `class` across the whole grid.
    pub fn class_plane(&self, class: usize) -> ArrayView2<'_, f32> {
        self.probs.index_axis(Axis(2), class)
    }

    /// Most probable class at one cell.
    pub fn top_class(&self, row: usize, col: usize) -> usize {
        argmax_first(self.cell(row, col))
    }

    /// Most probable class for every cell.
    pub fn top_class_map(&self) -> Array2<usize> {
        let (rows, cols) = self.grid_shape();
        Array2::from_shape_fn((rows, cols), |(r, c)| self.top_class(r, c))
    }

    /// The `n` classes with the highest peak probability anywhere in the
    /// grid, as `(class, peak)`, highest first. Ties keep the lower index.
    pub fn top_classes_by_peak(&self, n: usize) -> Vec<(usize, f32)> {
        let mut ranked: Vec<(usize, f32)> = (0..self.num_classes())
            .map(|class| {
                let peak = self
                    .class_plane(class)
                    .iter()
                    .fold(f32::NEG_INFINITY, |acc, &p| acc.max(p));
                (class, peak)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(n);
        ranked
    }

    /// Render one class plane as a grayscale image, dark where the class is
    /// probable, scaled with nearest-neighbour sampling to `(width, height)`.
    pub fn render_class(&self, class: usize, width: u32, height: u32) -> GrayImage {
        let plane = self.class_plane(class);
        let (rows, cols) = self.grid_shape();
        let mut small = GrayImage::new(cols as u32, rows as u32);
        for ((r, c), &p) in plane.indexed_iter() {
            let value = (255.0 * (1.0 - p.clamp(0.0, 1.0))) as u8;
            small.put_pixel(c as u32, r as u32, Luma([value]));
        }
        image::imageops::resize(&small, width, height, FilterType::Nearest)
    }
}

/// Index of the largest value; the lowest index wins ties. A NaN counts as
/// the maximum, so the first NaN is returned when there is one.
pub fn argmax_first(values: ArrayView1<'_, f32>) -> usize {
    let mut best_idx = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (idx, &v) in values.iter().enumerate() {
        if v.is_nan() {
            return idx;
        }
        if v > best_val {
            best_val = v;
            best_idx = idx;
        }
    }
    best_idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array4};

    #[test]
    fn test_argmax_first_prefers_lowest_index_on_ties() {
        assert_eq!(argmax_first(arr1(&[0.2, 0.4, 0.4]).view()), 1);
        assert_eq!(argmax_first(arr1(&[0.5, 0.5]).view()), 0);
        assert_eq!(argmax_first(arr1(&[0.1, 0.2, 0.7]).view()), 2);
    }

    #[test]
    fn test_top_classes_by_peak() {
        // Class 2 peaks highest in one cell; classes 0 and 1 tie at 0.5
        let probs = Array3::from_shape_vec(
            (1, 2, 3),
            vec![0.5, 0.4, 0.1, 0.1, 0.5, 0.9],
        )
        .unwrap();
        let heatmap = Heatmap::new(probs);

        assert_eq!(
            heatmap.top_classes_by_peak(3),
            vec![(2, 0.9), (0, 0.5), (1, 0.5)]
        );
        assert_eq!(heatmap.top_classes_by_peak(1), vec![(2, 0.9)]);
        assert_eq!(heatmap.top_classes_by_peak(10).len(), 3);
    }

    #[test]
    fn test_argmax_first_returns_first_nan() {
        assert_eq!(argmax_first(arr1(&[0.9, f32::NAN, 0.1, f32::NAN]).view()), 1);
        assert_eq!(argmax_first(arr1(&[f32::NAN, 0.5]).view()), 0);
        assert_eq!(argmax_first(arr1(&[f32::NEG_INFINITY, f32::NEG_INFINITY]).view()), 0);
    }

    #[test]
    fn test_top_class_map() {
        let mut probs = Array3::<f32>::zeros((2, 3, 4));
        probs[[0, 0, 1]] = 0.9;
        probs[[1, 2, 3]] = 0.6;
        let heatmap = Heatmap::new(probs);

        let top = heatmap.top_class_map();
        assert_eq!(top[[0, 0]], 1);
        assert_eq!(top[[1, 2]], 3);
        // All-zero cells fall back to class 0
        assert_eq!(top[[0, 1]], 0);
        assert_eq!(heatmap.grid_shape(), (2, 3));
        assert_eq!(heatmap.num_classes(), 4);
    }

    #[test]
    fn test_from_model_output_nchw_matches_nhwc() {
        let nhwc = Array4::from_shape_fn((1, 2, 3, 5), |(_, r, c, k)| (r * 100 + c * 10 + k) as f32);
        let nchw = nhwc.clone().permuted_axes([0, 3, 1, 2]).as_standard_layout().to_owned();

        let a = Heatmap::from_model_output(nhwc.view().into_dyn(), TensorLayout::Nhwc).unwrap();
        let b = Heatmap::from_model_output(nchw.view().into_dyn(), TensorLayout::Nchw).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.probability(1, 2, 4), 124.0);
    }

    #[test]
    fn test_from_model_output_rejects_batches() {
        let output = Array4::<f32>::zeros((2, 1, 1, 3));
        assert!(Heatmap::from_model_output(output.view().into_dyn(), TensorLayout::Nhwc).is_err());
    }

    #[test]
    fn test_render_class_inverts_probability() {
        let mut probs = Array3::<f32>::zeros((1, 2, 2));
        probs[[0, 0, 1]] = 1.0;
        let img = Heatmap::new(probs).render_class(1, 4, 2);

        assert_eq!(img.dimensions(), (4, 2));
        assert_eq!(img.get_pixel(0, 0)[0], 0);
        assert_eq!(img.get_pixel(3, 1)[0], 255);
    }
}
