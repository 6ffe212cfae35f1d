//! Multi-scale ensemble crop localization.
//!
//! Starting from the scale at which the reference receptive field just covers
//! the image's short side, the image is upsampled step by step. At every
//! scale each ensemble member produces a heatmap on a shared grid, cells are
//! ranked by how many members classify them as the target class, and the
//! best cell becomes a [`ScaleCandidate`]. The best candidate over all
//! scales is finally picked by agreement, then by mean target probability.

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView};
use ndarray::Array2;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::DEFAULT_REFERENCE_KERNEL;
use crate::ensemble::Ensemble;
use crate::fcn::{input_size_for_grid, output_grid_dim, GridSize, FCN_STRIDE};
use crate::heatmap::Heatmap;

/// Failure modes of a localization query.
#[derive(Debug)]
pub enum LocalizationError {
    ImageNotFound(PathBuf),
    ImageDecode {
        path: PathBuf,
        source: image::ImageError,
    },
    EmptyImage,
    InvalidParams(String),
    DegenerateGrid {
        scale_factor: f64,
        rows: i64,
        cols: i64,
    },
    HeatmapShapeMismatch {
        member: String,
        expected: (usize, usize),
        actual: (usize, usize),
    },
    TargetClassOutOfRange {
        member: String,
        target: usize,
        num_classes: usize,
    },
    NoHeatmaps,
    NoCandidates,
}

impl fmt::Display for LocalizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalizationError::ImageNotFound(path) => {
                write!(f, "The image file {} does not exist", path.display())
            }
            LocalizationError::ImageDecode { path, source } => {
                write!(f, "Failed to decode {}: {source}", path.display())
            }
            LocalizationError::EmptyImage => write!(f, "Image has zero width or height"),
            LocalizationError::InvalidParams(msg) => write!(f, "Invalid search parameters: {msg}"),
            LocalizationError::DegenerateGrid {
                scale_factor,
                rows,
                cols,
            } => write!(
                f,
                "Heatmap grid {rows}x{cols} at scale {scale_factor:.4} has no cells"
            ),
            LocalizationError::HeatmapShapeMismatch {
                member,
                expected,
                actual,
            } => write!(
                f,
                "Member '{member}' produced a {}x{} heatmap, expected {}x{}",
                actual.0, actual.1, expected.0, expected.1
            ),
            LocalizationError::TargetClassOutOfRange {
                member,
                target,
                num_classes,
            } => write!(
                f,
                "Target class {target} out of range for member '{member}' ({num_classes} classes)"
            ),
            LocalizationError::NoHeatmaps => write!(f, "No heatmaps to score"),
            LocalizationError::NoCandidates => write!(f, "No scale candidates to select from"),
        }
    }
}

impl std::error::Error for LocalizationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LocalizationError::ImageDecode { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Scale search parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalizationParams {
    /// Receptive field that sets the initial scale and the crop edge
    pub reference_kernel: u32,
    /// Multiplier applied to the scale factor after each step
    pub upsampling_step: f64,
    /// The search stops once the scale factor reaches this value
    pub max_scale_factor: f64,
    /// Hard cap on evaluated scales
    pub max_steps: usize,
}

impl Default for LocalizationParams {
    fn default() -> Self {
        Self {
            reference_kernel: DEFAULT_REFERENCE_KERNEL,
            upsampling_step: 1.2,
            max_scale_factor: 3.0,
            max_steps: 4,
        }
    }
}

impl LocalizationParams {
    pub fn validate(&self) -> Result<(), LocalizationError> {
        if self.reference_kernel == 0 {
            return Err(LocalizationError::InvalidParams(
                "reference kernel must be positive".to_string(),
            ));
        }
        if !self.upsampling_step.is_finite() || self.upsampling_step <= 0.0 {
            return Err(LocalizationError::InvalidParams(format!(
                "upsampling step must be positive, got {}",
                self.upsampling_step
            )));
        }
        if self.max_scale_factor.is_nan() {
            return Err(LocalizationError::InvalidParams(
                "max scale factor is NaN".to_string(),
            ));
        }
        if self.max_steps == 0 {
            return Err(LocalizationError::InvalidParams(
                "at least one step is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Scale at which the reference kernel spans the image's short side.
    pub fn initial_scale_factor(&self, image_height: u32, image_width: u32) -> f64 {
        f64::from(self.reference_kernel) / f64::from(image_height.min(image_width))
    }
}

/// Best cell found at one scale
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaleCandidate {
    pub scale_factor: f64,
    /// Heatmap grid `(rows, cols)`
    pub heatmap_shape: (usize, usize),
    /// Winning cell `(row, col)`
    pub best_cell: (usize, usize),
    /// Mean target-class probability over all members at the winning cell
    pub aggregate_score: f32,
    /// Number of members whose top class is the target at the winning cell
    pub agreement_count: usize,
    /// Whether each member's top class is the target at the winning cell
    pub per_model_agreement: Vec<bool>,
}

/// Result of scoring one stack of heatmaps
#[derive(Debug, Clone, PartialEq)]
pub struct CellSelection {
    pub cell: (usize, usize),
    /// Sum over members of the target-class probability at `cell`
    pub score_sum: f32,
    pub agreement_count: usize,
    pub per_model_agreement: Vec<bool>,
}

/// Per-cell count of members whose top class is `target`.
pub fn agreement_map(heatmaps: &[Heatmap], target: usize) -> Array2<usize> {
    let (rows, cols) = heatmaps.first().map(Heatmap::grid_shape).unwrap_or((0, 0));
    let mut counts = Array2::<usize>::zeros((rows, cols));
    for heatmap in heatmaps {
        let top = heatmap.top_class_map();
        counts.zip_mut_with(&top, |count, &class| {
            if class == target {
                *count += 1;
            }
        });
    }
    counts
}

/// Pick the cell with the highest agreement, breaking ties by the summed
/// target-class probability.
///
/// Cells are visited in row-major order; on an exact score tie the first
/// visited cell is kept. All heatmaps must share one grid.
pub fn select_cell(heatmaps: &[Heatmap], target: usize) -> Result<CellSelection, LocalizationError> {
    if heatmaps.is_empty() {
        return Err(LocalizationError::NoHeatmaps);
    }

    let counts = agreement_map(heatmaps, target);
    let max_count = counts.iter().copied().max().unwrap_or(0);

    let score_at = |r: usize, c: usize| -> f32 {
        heatmaps
            .iter()
            .map(|h| h.probability(r, c, target))
            .sum()
    };

    let mut best: Option<((usize, usize), f32)> = None;
    for ((r, c), &count) in counts.indexed_iter() {
        if count != max_count {
            continue;
        }
        let score = score_at(r, c);
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some(((r, c), score));
        }
    }

    let (cell, score_sum) = best.ok_or(LocalizationError::NoHeatmaps)?;
    let per_model_agreement = heatmaps
        .iter()
        .map(|h| h.top_class(cell.0, cell.1) == target)
        .collect();

    Ok(CellSelection {
        cell,
        score_sum,
        agreement_count: max_count,
        per_model_agreement,
    })
}

/// Heatmap grid of a network with `kernel_size` on the image scaled by
/// `scale_factor`.
pub fn heatmap_grid_for_scale(
    image_height: u32,
    image_width: u32,
    scale_factor: f64,
    kernel_size: u32,
) -> Result<GridSize, LocalizationError> {
    let scaled = |dim: u32| (f64::from(dim) * scale_factor).round_ties_even() as i64;
    let rows = output_grid_dim(scaled(image_height), kernel_size, FCN_STRIDE);
    let cols = output_grid_dim(scaled(image_width), kernel_size, FCN_STRIDE);

    if rows < 1 || cols < 1 {
        return Err(LocalizationError::DegenerateGrid {
            scale_factor,
            rows,
            cols,
        });
    }
    Ok(GridSize {
        rows: rows as usize,
        cols: cols as usize,
    })
}

/// Drive the scale search, calling `evaluate` once per scale.
///
/// The first scale is always evaluated. After each step the search stops when
/// the scale factor reaches `max_scale_factor`, when every member agreed, or
/// when `max_steps` scales have been evaluated.
pub fn run_scale_schedule<F>(
    image_height: u32,
    image_width: u32,
    grid_kernel: u32,
    ensemble_size: usize,
    params: &LocalizationParams,
    mut evaluate: F,
) -> Result<Vec<ScaleCandidate>>
where
    F: FnMut(f64, GridSize) -> Result<ScaleCandidate>,
{
    params.validate()?;
    if image_height == 0 || image_width == 0 {
        return Err(LocalizationError::EmptyImage.into());
    }

    let mut scale_factor = params.initial_scale_factor(image_height, image_width);
    let mut candidates = Vec::new();

    loop {
        let grid = heatmap_grid_for_scale(image_height, image_width, scale_factor, grid_kernel)?;
        log::trace!(
            "Scale {:.4}: heatmap grid {}x{}",
            scale_factor,
            grid.rows,
            grid.cols
        );

        let candidate = evaluate(scale_factor, grid)?;
        let full_agreement = candidate.agreement_count >= ensemble_size;
        candidates.push(candidate);

        scale_factor *= params.upsampling_step;
        if scale_factor >= params.max_scale_factor
            || full_agreement
            || candidates.len() >= params.max_steps
        {
            break;
        }
    }

    Ok(candidates)
}

/// Run every ensemble member at one scale and keep the best cell.
pub fn evaluate_scale(
    ensemble: &mut Ensemble,
    image: &DynamicImage,
    grid: GridSize,
    scale_factor: f64,
    target: usize,
) -> Result<ScaleCandidate> {
    let mut heatmaps = Vec::with_capacity(ensemble.len());

    for member in ensemble.members_mut() {
        let input_size = input_size_for_grid(grid, member.kernel_size);
        let heatmap = member
            .predictor
            .predict(image, input_size)
            .with_context(|| format!("Member '{}' failed to predict", member.name))?;

        if heatmap.grid_shape() != (grid.rows, grid.cols) {
            return Err(LocalizationError::HeatmapShapeMismatch {
                member: member.name.clone(),
                expected: (grid.rows, grid.cols),
                actual: heatmap.grid_shape(),
            }
            .into());
        }
        if target >= heatmap.num_classes() {
            return Err(LocalizationError::TargetClassOutOfRange {
                member: member.name.clone(),
                target,
                num_classes: heatmap.num_classes(),
            }
            .into());
        }
        heatmaps.push(heatmap);
    }

    let selection = select_cell(&heatmaps, target)?;
    Ok(ScaleCandidate {
        scale_factor,
        heatmap_shape: (grid.rows, grid.cols),
        best_cell: selection.cell,
        aggregate_score: selection.score_sum / heatmaps.len() as f32,
        agreement_count: selection.agreement_count,
        per_model_agreement: selection.per_model_agreement,
    })
}

/// Search all scales of `image` for the crop best classified as `target`.
pub fn localize(
    ensemble: &mut Ensemble,
    image: &DynamicImage,
    target: usize,
    params: &LocalizationParams,
) -> Result<Vec<ScaleCandidate>> {
    let (width, height) = image.dimensions();
    let grid_kernel = ensemble.grid_kernel();
    let ensemble_size = ensemble.len();

    run_scale_schedule(
        height,
        width,
        grid_kernel,
        ensemble_size,
        params,
        |scale_factor, grid| evaluate_scale(ensemble, image, grid, scale_factor, target),
    )
}

/// Candidates of one image together with its original dimensions
#[derive(Debug, Clone)]
pub struct Localization {
    pub image_width: u32,
    pub image_height: u32,
    pub candidates: Vec<ScaleCandidate>,
}

/// Load the image at `path` and run [`localize`] on it.
///
/// A missing file yields [`LocalizationError::ImageNotFound`].
pub fn localize_file(
    ensemble: &mut Ensemble,
    path: &Path,
    target: usize,
    params: &LocalizationParams,
) -> Result<Localization> {
    if !path.exists() {
        return Err(LocalizationError::ImageNotFound(path.to_path_buf()).into());
    }
    let image = image::open(path).map_err(|source| LocalizationError::ImageDecode {
        path: path.to_path_buf(),
        source,
    })?;

    let (image_width, image_height) = image.dimensions();
    let candidates = localize(ensemble, &image, target, params)?;
    Ok(Localization {
        image_width,
        image_height,
        candidates,
    })
}

/// Best candidate by agreement count, then aggregate score. Among equal
/// keys the earliest scale wins.
pub fn select_best_crop(candidates: &[ScaleCandidate]) -> Result<&ScaleCandidate, LocalizationError> {
    let mut iter = candidates.iter();
    let mut best = iter.next().ok_or(LocalizationError::NoCandidates)?;
    for candidate in iter {
        let better = candidate.agreement_count > best.agreement_count
            || (candidate.agreement_count == best.agreement_count
                && candidate.aggregate_score > best.aggregate_score);
        if better {
            best = candidate;
        }
    }
    Ok(best)
}
