//! Mapping heatmap cells back to square crops in the original image.

use serde::{Deserialize, Serialize};

use crate::fcn::FCN_STRIDE;
use crate::localization::{select_best_crop, LocalizationError, ScaleCandidate};

/// Square crop in original image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub top: u32,
    pub left: u32,
    pub side: u32,
}

/// Pixel offset of a grid cell in the original frame.
pub fn grid_to_pixel(cell: usize, scale_factor: f64) -> u32 {
    (f64::from(FCN_STRIDE) * cell as f64 / scale_factor).floor() as u32
}

/// Edge of the receptive field in the original frame.
pub fn crop_edge(reference_kernel: u32, scale_factor: f64) -> u32 {
    (f64::from(reference_kernel) / scale_factor).floor() as u32
}

/// Rectangle covered by the candidate's best cell. The result is not clamped
/// to the image.
pub fn back_map(candidate: &ScaleCandidate, reference_kernel: u32) -> CropRect {
    let (row, col) = candidate.best_cell;
    CropRect {
        top: grid_to_pixel(row, candidate.scale_factor),
        left: grid_to_pixel(col, candidate.scale_factor),
        side: crop_edge(reference_kernel, candidate.scale_factor),
    }
}

impl CropRect {
    pub fn bottom(&self) -> u64 {
        u64::from(self.top) + u64::from(self.side)
    }

    pub fn right(&self) -> u64 {
        u64::from(self.left) + u64::from(self.side)
    }

    /// Corners as `(row, col)`: top-left, top-right, bottom-left, bottom-right.
    pub fn corners(&self) -> [(u64, u64); 4] {
        let (top, left) = (u64::from(self.top), u64::from(self.left));
        [
            (top, left),
            (top, self.right()),
            (self.bottom(), left),
            (self.bottom(), self.right()),
        ]
    }

    /// Whether every corner lies within `[0, width] × [0, height]`.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.corners()
            .iter()
            .all(|&(row, col)| row <= u64::from(height) && col <= u64::from(width))
    }

    /// Part of the rectangle inside a `width × height` image, as
    /// `(x, y, w, h)`. `None` when nothing overlaps.
    pub fn clipped(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        if self.left >= width || self.top >= height || self.side == 0 {
            return None;
        }
        let w = self.side.min(width - self.left);
        let h = self.side.min(height - self.top);
        Some((self.left, self.top, w, h))
    }
}

/// Selected scale and its crop rectangle.
#[derive(Debug, Clone, PartialEq)]
pub struct BestCrop {
    pub candidate: ScaleCandidate,
    pub rect: CropRect,
}

impl BestCrop {
    /// Pick the best candidate and map it to the original frame.
    pub fn select(
        candidates: &[ScaleCandidate],
        reference_kernel: u32,
    ) -> Result<Self, LocalizationError> {
        let candidate = select_best_crop(candidates)?.clone();
        let rect = back_map(&candidate, reference_kernel);
        Ok(Self { candidate, rect })
    }
}
