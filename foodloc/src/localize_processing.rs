//! Batch crop localization over a dataset split.

use anyhow::Result;
use chrono::Local;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Instant;

use crate::class_labels::ClassLabels;
use crate::color_utils::symbols;
use crate::config::{EnsembleConfig, LocalizeConfig};
use crate::crop::BestCrop;
use crate::dataset::{collect_dataset_entries, DatasetEntry};
use crate::ensemble::Ensemble;
use crate::localization::{localize_file, LocalizationParams};
use crate::onnx_session::determine_optimal_device;
use crate::progress::BatchProgress;
use crate::results::{write_records, CropRecord};

/// Result of localizing a batch of images
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub records: Vec<CropRecord>,
    pub failed: usize,
    pub out_of_bounds: usize,
}

/// Localize one dataset entry and build its record.
fn process_entry(
    ensemble: &mut Ensemble,
    entry: &DatasetEntry,
    labels: &ClassLabels,
    params: &LocalizationParams,
    dataset_root: &Path,
) -> Result<CropRecord> {
    let target = labels.index_of(&entry.label)?;
    let localization = localize_file(ensemble, &entry.path, target, params)?;
    let best = BestCrop::select(&localization.candidates, params.reference_kernel)?;

    let in_bounds = best
        .rect
        .fits_within(localization.image_width, localization.image_height);
    if !in_bounds {
        log::warn!(
            "{} Crop {:?} exceeds {}x{} image {}",
            symbols::warning(),
            best.rect,
            localization.image_width,
            localization.image_height,
            entry.path.display()
        );
    }

    let filename = entry
        .path
        .strip_prefix(dataset_root)
        .unwrap_or(&entry.path)
        .to_path_buf();
    Ok(CropRecord::new(
        filename,
        entry.label.clone(),
        &best,
        in_bounds,
    ))
}

/// Localize every entry in order. Failing images are logged and skipped.
pub fn localize_entries(
    ensemble: &mut Ensemble,
    entries: &[DatasetEntry],
    labels: &ClassLabels,
    params: &LocalizationParams,
    dataset_root: &Path,
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    let mut progress = BatchProgress::new(entries.len());

    for (index, entry) in entries.iter().enumerate() {
        let image_start = Instant::now();
        match process_entry(ensemble, entry, labels, params, dataset_root) {
            Ok(record) => {
                log::debug!(
                    "Localized {} ({}/{}) in {:.1}ms: scale {:.4}, cell ({}, {}), agreement {}",
                    entry.path.display(),
                    index + 1,
                    entries.len(),
                    image_start.elapsed().as_secs_f64() * 1000.0,
                    record.ensemble.factor,
                    record.ensemble.crop_row,
                    record.ensemble.crop_col,
                    record.ensemble.agreement
                );
                if !record.in_bounds {
                    outcome.out_of_bounds += 1;
                }
                outcome.records.push(record);
            }
            Err(e) => {
                outcome.failed += 1;
                log::warn!(
                    "{} Failed to localize {} ({}/{}): {:#}",
                    symbols::warning(),
                    entry.path.display(),
                    index + 1,
                    entries.len(),
                    e
                );
            }
        }

        if progress.advance(&entry.label) {
            log::info!(
                "[{}] {} of {} images processed",
                Local::now().format("%H:%M:%S"),
                progress.done(),
                progress.total()
            );
        }
    }

    progress.finish();
    outcome
}

/// Run the `localize` command: load everything, process the split and write
/// the crop list. Returns the number of localized images.
pub fn run_localization(config: LocalizeConfig) -> Result<usize> {
    let run_start = Instant::now();

    let ensemble_config = EnsembleConfig::load(config.base.ensemble_path.as_deref())?;
    let params = config.localization_params(&ensemble_config);
    params.validate()?;
    log::debug!(
        "Search: reference kernel {}, step {}, max scale {}, max steps {}",
        params.reference_kernel,
        params.upsampling_step,
        params.max_scale_factor,
        params.max_steps
    );

    let labels = ClassLabels::from_file(&config.dataset.classes_file())?;
    let entries = collect_dataset_entries(&config.dataset)?;
    if entries.is_empty() {
        log::warn!("No valid images found to process");
        write_records(&config.output, &[])?;
        return Ok(0);
    }
    let class_count = entries
        .iter()
        .map(|e| e.label.as_str())
        .collect::<BTreeSet<_>>()
        .len();
    log::info!(
        "{} Found {} image(s) in {} class folder(s)",
        symbols::resources_found(),
        entries.len(),
        class_count
    );

    let device = determine_optimal_device(&config.base.device);
    log::debug!("{} {}", symbols::system_setup(), device.reason);
    let mut ensemble = Ensemble::load(&ensemble_config, &device.device)?;

    let outcome = localize_entries(
        &mut ensemble,
        &entries,
        &labels,
        &params,
        &config.dataset.root,
    );
    write_records(&config.output, &outcome.records)?;

    let localized = outcome.records.len();
    if outcome.failed == 0 {
        log::info!(
            "{} Localized {} images in {:.1}s, crops written to {}",
            symbols::completed_successfully(),
            localized,
            run_start.elapsed().as_secs_f64(),
            config.output.display()
        );
    } else {
        log::warn!(
            "{} {} of {} images failed to localize",
            symbols::completed_partially_successfully(),
            outcome.failed,
            entries.len()
        );
    }
    if outcome.out_of_bounds > 0 {
        log::warn!(
            "{} {} crop(s) extend beyond their image",
            symbols::warning(),
            outcome.out_of_bounds
        );
    }

    Ok(localized)
}
