//! Classifier accuracy on original images versus their localized crops.

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView};
use ndarray::ArrayView1;
use ort::{session::Session, value::Value};
use serde::Serialize;
use std::path::Path;

use crate::class_labels::ClassLabels;
use crate::color_utils::symbols;
use crate::config::EvaluateConfig;
use crate::crop::CropRect;
use crate::dataset::classes_file;
use crate::heatmap::{argmax_first, TensorLayout};
use crate::onnx_session::{create_onnx_session, determine_optimal_device, io_names, SessionConfig};
use crate::preprocessing::{image_to_tensor, resize_exact, Preprocessing};
use crate::progress::BatchProgress;
use crate::results::{read_records, CropRecord};

/// Whole-image classifier returning one probability per class.
pub trait Classifier {
    fn classify(&mut self, image: &DynamicImage) -> Result<Vec<f32>>;
}

/// ONNX classifier with a fixed square input.
pub struct OnnxClassifier {
    session: Session,
    input_name: String,
    output_name: String,
    input_size: u32,
    preprocessing: Preprocessing,
    layout: TensorLayout,
}

impl OnnxClassifier {
    pub fn load(
        model_path: &Path,
        input_size: u32,
        preprocessing: Preprocessing,
        layout: TensorLayout,
        device: &str,
    ) -> Result<Self> {
        let (session, info) = create_onnx_session(model_path, &SessionConfig { device })?;
        let (input_name, output_name) = io_names(&session)?;
        log::info!(
            "{} Loaded classifier {} in {:.1}ms",
            symbols::model_loaded(),
            info.model_path,
            info.load_time_ms
        );

        Ok(Self {
            session,
            input_name,
            output_name,
            input_size,
            preprocessing,
            layout,
        })
    }
}

impl Classifier for OnnxClassifier {
    fn classify(&mut self, image: &DynamicImage) -> Result<Vec<f32>> {
        let resized = resize_exact(image, self.input_size, self.input_size);
        let tensor = image_to_tensor(&resized, self.preprocessing, self.layout)?;

        let input_value = Value::from_array(tensor)
            .map_err(|e| anyhow::anyhow!("Failed to create input value: {}", e))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input_value])
            .map_err(|e| anyhow::anyhow!("Failed to run inference: {}", e))?;
        let probs = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| anyhow::anyhow!("Failed to extract output array: {}", e))?;

        Ok(probs.iter().copied().collect())
    }
}

/// Index of the most probable class; ties resolve to the lowest index.
pub fn top1(probs: &[f32]) -> Option<usize> {
    if probs.is_empty() {
        None
    } else {
        Some(argmax_first(ArrayView1::from(probs)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Accuracy {
    pub correct: usize,
    pub total: usize,
}

impl Accuracy {
    pub fn record(&mut self, hit: bool) {
        self.total += 1;
        if hit {
            self.correct += 1;
        }
    }

    /// Fraction of hits, 0 when nothing was recorded.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccuracyReport {
    pub original: Accuracy,
    pub cropped: Accuracy,
    pub skipped: usize,
}

/// Cut `rect` out of `image`, clipped to the image. Falls back to the whole
/// image when the rectangle lies entirely outside it.
pub fn crop_image(image: &DynamicImage, rect: &CropRect) -> DynamicImage {
    let (width, height) = image.dimensions();
    match rect.clipped(width, height) {
        Some((x, y, w, h)) => image.crop_imm(x, y, w, h),
        None => image.clone(),
    }
}

/// Top-1 hits on the original image and on the crop.
fn evaluate_record<C: Classifier + ?Sized>(
    classifier: &mut C,
    record: &CropRecord,
    labels: &ClassLabels,
    dataset_root: &Path,
) -> Result<(bool, bool)> {
    let target = labels.index_of(&record.label)?;
    let path = dataset_root.join(&record.filename);
    let image = image::open(&path)
        .with_context(|| format!("Failed to open image: {}", path.display()))?;

    let original = top1(&classifier.classify(&image)?);
    let cropped = top1(&classifier.classify(&crop_image(&image, &record.rect))?);
    Ok((original == Some(target), cropped == Some(target)))
}

/// Classify every recorded image before and after cropping.
pub fn evaluate_records<C: Classifier + ?Sized>(
    classifier: &mut C,
    records: &[CropRecord],
    labels: &ClassLabels,
    dataset_root: &Path,
) -> AccuracyReport {
    let mut report = AccuracyReport::default();
    let mut progress = BatchProgress::new(records.len());

    for record in records {
        match evaluate_record(classifier, record, labels, dataset_root) {
            Ok((original_hit, cropped_hit)) => {
                report.original.record(original_hit);
                report.cropped.record(cropped_hit);
            }
            Err(e) => {
                report.skipped += 1;
                log::warn!(
                    "{} Skipping {}: {:#}",
                    symbols::warning(),
                    record.filename.display(),
                    e
                );
            }
        }
        if progress.advance(&record.label) {
            log::info!(
                "{} of {} images evaluated",
                progress.done(),
                progress.total()
            );
        }
    }

    progress.finish();
    report
}

/// Run the `evaluate` command and print both accuracies.
pub fn run_evaluation(config: EvaluateConfig) -> Result<AccuracyReport> {
    let labels = ClassLabels::from_file(&classes_file(&config.dataset_root))?;
    let records = read_records(&config.crops_path)?;
    if records.is_empty() {
        return Err(anyhow::anyhow!(
            "No crop records in {}",
            config.crops_path.display()
        ));
    }
    log::info!(
        "{} Evaluating {} on {} crop(s)",
        symbols::evaluation_start(),
        config.model_path.display(),
        records.len()
    );

    let device = determine_optimal_device(&config.base.device);
    let mut classifier = OnnxClassifier::load(
        &config.model_path,
        config.input_size,
        config.preprocessing,
        config.layout,
        &device.device,
    )?;

    let report = evaluate_records(&mut classifier, &records, &labels, &config.dataset_root);
    if report.skipped > 0 {
        log::warn!(
            "{} {} of {} images could not be evaluated",
            symbols::completed_partially_successfully(),
            report.skipped,
            records.len()
        );
    }

    println!(
        "Original classification accuracy: {:.4}%",
        report.original.ratio() * 100.0
    );
    println!(
        "Crop classification accuracy: {:.4}%",
        report.cropped.ratio() * 100.0
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    /// Predicts class 1 for images wider than 50 pixels, class 0 otherwise.
    struct WidthClassifier;

    impl Classifier for WidthClassifier {
        fn classify(&mut self, image: &DynamicImage) -> Result<Vec<f32>> {
            if image.width() > 50 {
                Ok(vec![0.1, 0.9])
            } else {
                Ok(vec![0.8, 0.2])
            }
        }
    }

    #[test]
    fn test_top1_first_max_wins() {
        assert_eq!(top1(&[0.2, 0.4, 0.4]), Some(1));
        assert_eq!(top1(&[]), None);
    }

    #[test]
    fn test_accuracy_ratio() {
        let mut acc = Accuracy::default();
        assert_eq!(acc.ratio(), 0.0);
        acc.record(true);
        acc.record(false);
        acc.record(true);
        acc.record(true);
        assert_eq!(acc.ratio(), 0.75);
    }

    #[test]
    fn test_crop_image_clips_to_bounds() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(100, 80, Rgb([1, 2, 3])));
        let rect = CropRect {
            top: 40,
            left: 60,
            side: 100,
        };
        let cropped = crop_image(&image, &rect);
        assert_eq!(cropped.dimensions(), (40, 40));

        let outside = CropRect {
            top: 200,
            left: 0,
            side: 10,
        };
        assert_eq!(crop_image(&image, &outside).dimensions(), (100, 80));
    }

    #[test]
    fn test_evaluate_records_compares_original_and_crop() {
        let dir = tempfile::tempdir().unwrap();
        let image_dir = dir.path().join("test").join("pizza");
        std::fs::create_dir_all(&image_dir).unwrap();
        RgbImage::from_pixel(100, 100, Rgb([200, 50, 50]))
            .save(image_dir.join("1.png"))
            .unwrap();

        let labels = ClassLabels::parse("apple_pie\npizza\n");
        let record = CropRecord {
            filename: "test/pizza/1.png".into(),
            label: "pizza".to_string(),
            ensemble: crate::results::EnsembleSummary {
                factor: 1.0,
                heat_h: 1,
                heat_w: 1,
                crop_row: 0,
                crop_col: 0,
                score: 0.9,
                agreement: 1,
                per_model_agreement: vec![true],
            },
            rect: CropRect {
                top: 0,
                left: 0,
                side: 40,
            },
            in_bounds: true,
        };
        let mut missing = record.clone();
        missing.filename = "test/pizza/2.png".into();

        let report = evaluate_records(
            &mut WidthClassifier,
            &[record, missing],
            &labels,
            dir.path(),
        );
        assert_eq!(report.original, Accuracy { correct: 1, total: 1 });
        assert_eq!(report.cropped, Accuracy { correct: 0, total: 1 });
        assert_eq!(report.skipped, 1);
    }
}
