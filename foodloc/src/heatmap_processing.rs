//! The `heatmap` command: one member's target-class heatmap as a PNG.

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView, GrayImage};
use std::path::{Path, PathBuf};

use crate::class_labels::ClassLabels;
use crate::color_utils::symbols;
use crate::config::{EnsembleConfig, HeatmapConfig};
use crate::ensemble::EnsembleMember;
use crate::fcn::{input_size_for_grid, HeatmapPredictor};
use crate::heatmap::Heatmap;
use crate::localization::heatmap_grid_for_scale;
use crate::onnx_session::determine_optimal_device;

fn predict_at_scale(
    predictor: &mut dyn HeatmapPredictor,
    kernel_size: u32,
    image: &DynamicImage,
    scale_factor: f64,
) -> Result<Heatmap> {
    let (width, height) = image.dimensions();
    let grid = heatmap_grid_for_scale(height, width, scale_factor, kernel_size)?;
    let heatmap = predictor.predict(image, input_size_for_grid(grid, kernel_size))?;
    log::debug!(
        "Heatmap grid {:?} at scale {:.4}",
        heatmap.grid_shape(),
        scale_factor
    );
    Ok(heatmap)
}

/// Predict at `scale_factor` and render `class` at the image's own size.
pub fn render_heatmap(
    predictor: &mut dyn HeatmapPredictor,
    kernel_size: u32,
    image: &DynamicImage,
    class: usize,
    scale_factor: f64,
) -> Result<GrayImage> {
    let heatmap = predict_at_scale(predictor, kernel_size, image, scale_factor)?;
    if class >= heatmap.num_classes() {
        return Err(anyhow::anyhow!(
            "Class {class} out of range ({} classes in heatmap)",
            heatmap.num_classes()
        ));
    }
    let (width, height) = image.dimensions();
    Ok(heatmap.render_class(class, width, height))
}

/// One rendered class from [`render_top_classes`].
#[derive(Debug)]
pub struct RankedHeatmap {
    pub class: usize,
    pub peak: f32,
    pub image: GrayImage,
}

/// Predict once at `scale_factor` and render the `n` classes whose heatmap
/// peaks highest, best first.
pub fn render_top_classes(
    predictor: &mut dyn HeatmapPredictor,
    kernel_size: u32,
    image: &DynamicImage,
    scale_factor: f64,
    n: usize,
) -> Result<Vec<RankedHeatmap>> {
    let heatmap = predict_at_scale(predictor, kernel_size, image, scale_factor)?;
    let (width, height) = image.dimensions();
    Ok(heatmap
        .top_classes_by_peak(n)
        .into_iter()
        .map(|(class, peak)| RankedHeatmap {
            class,
            peak,
            image: heatmap.render_class(class, width, height),
        })
        .collect())
}

/// Path for the `rank`-th top class, next to the main output.
fn ranked_output_path(output: &Path, rank: usize, label: &str) -> PathBuf {
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("heatmap");
    output.with_file_name(format!("{stem}_top{rank}_{label}.png"))
}

pub fn run_heatmap(config: HeatmapConfig) -> Result<PathBuf> {
    let ensemble_config = EnsembleConfig::load(config.base.ensemble_path.as_deref())?;
    let member_config = ensemble_config.member(&config.member).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown ensemble member '{}' (available: {})",
            config.member,
            ensemble_config
                .members
                .iter()
                .map(|m| m.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )
    })?;

    let labels = ClassLabels::from_file(&config.classes_path)?;
    let class = labels.index_of(&config.label)?;
    let image = image::open(&config.image_path)
        .with_context(|| format!("Failed to open image: {}", config.image_path.display()))?;

    let device = determine_optimal_device(&config.base.device);
    let mut member = EnsembleMember::from_config(member_config, &device.device)?;

    let rendered = render_heatmap(
        member.predictor.as_mut(),
        member.kernel_size,
        &image,
        class,
        config.scale,
    )?;
    rendered
        .save(&config.output)
        .with_context(|| format!("Failed to save heatmap: {}", config.output.display()))?;

    if config.top_n > 0 {
        let ranked = render_top_classes(
            member.predictor.as_mut(),
            member.kernel_size,
            &image,
            config.scale,
            config.top_n,
        )?;
        for (rank, entry) in ranked.iter().enumerate() {
            let label = labels.label_of(entry.class)?;
            let path = ranked_output_path(&config.output, rank + 1, label);
            entry
                .image
                .save(&path)
                .with_context(|| format!("Failed to save heatmap: {}", path.display()))?;
            log::info!(
                "Top {} class '{}' (peak {:.4}) written to {}",
                rank + 1,
                label,
                entry.peak,
                path.display()
            );
        }
    }

    log::info!(
        "{} Heatmap for '{}' from {} written to {}",
        symbols::completed_successfully(),
        config.label,
        member.name,
        config.output.display()
    );
    Ok(config.output)
}
