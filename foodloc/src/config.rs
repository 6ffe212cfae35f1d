//! Configuration layer separating CLI arguments from internal configurations.
//!
//! - `GlobalArgs` and the per-command structs are parsed by clap.
//! - `LocalizeConfig`, `EvaluateConfig` and `HeatmapConfig` are what the
//!   processing code consumes; they are built with `from_args`.
//! - `EnsembleConfig` describes the FCN ensemble and is read from a TOML file.

use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::Verbosity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::dataset::DatasetConfig;
use crate::heatmap::TensorLayout;
use crate::localization::LocalizationParams;
use crate::preprocessing::Preprocessing;

/// Reference receptive field used when neither the CLI nor the ensemble
/// file provides one.
pub const DEFAULT_REFERENCE_KERNEL: u32 = 295;

/// Parse a strictly positive, finite floating point value
pub fn parse_positive_f64(s: &str) -> Result<f64, String> {
    let val = s
        .parse::<f64>()
        .map_err(|_| format!("Invalid number: '{s}'"))?;
    if !val.is_finite() || val <= 0.0 {
        return Err(format!("Must be a positive number, got {val}"));
    }
    Ok(val)
}

/// Global CLI arguments that apply to all commands
#[derive(Parser, Debug, Clone)]
pub struct GlobalArgs {
    /// Verbosity level (-q/--quiet, -v/-vv/-vvv/-vvvv for info/debug/trace)
    #[command(flatten)]
    pub verbosity: Verbosity,

    /// Device to use for inference (auto, cpu, coreml)
    #[arg(long, default_value = "auto", global = true)]
    pub device: String,

    /// Disable colored output (also respects NO_COLOR and FOODLOC_NO_COLOR env vars)
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Ensemble description (TOML). Defaults to the built-in Food-101 ensemble
    #[arg(long, global = true, value_name = "TOML")]
    pub ensemble: Option<String>,
}

/// Base configuration shared by all commands
#[derive(Debug, Clone, Serialize)]
pub struct BaseConfig {
    /// Device for inference
    pub device: String,
    /// Ensemble description file, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ensemble_path: Option<PathBuf>,
}

impl From<GlobalArgs> for BaseConfig {
    fn from(global: GlobalArgs) -> Self {
        Self {
            device: global.device,
            ensemble_path: global.ensemble.map(PathBuf::from),
        }
    }
}

/// CLI command for batch crop localization
#[derive(Parser, Debug, Clone)]
pub struct LocalizeCommand {
    /// Dataset root containing `meta/classes.txt` and one folder per split
    #[arg(value_name = "DATASET_ROOT")]
    pub dataset_root: String,

    /// Dataset split to scan
    #[arg(long, default_value = "test")]
    pub split: String,

    /// Number of class folders to scan
    #[arg(long, default_value = "101")]
    pub max_classes: usize,

    /// Number of images taken from each class folder
    #[arg(long, default_value = "250")]
    pub instances_per_class: usize,

    /// Multiplier applied to the scale factor after every step
    #[arg(long, default_value = "1.2", value_parser = parse_positive_f64)]
    pub upsampling_step: f64,

    /// Scale factor at which the search stops
    #[arg(long, default_value = "3.0", value_parser = parse_positive_f64)]
    pub max_scale_factor: f64,

    /// Maximum number of scales evaluated per image
    #[arg(long, default_value = "4")]
    pub max_steps: usize,

    /// Receptive field used for the initial scale and the crop size
    #[arg(long)]
    pub reference_kernel: Option<u32>,

    /// Where to write the JSON list of crops
    #[arg(short, long, default_value = "crops.json")]
    pub output: String,
}

/// Internal configuration for batch localization
#[derive(Debug, Clone, Serialize)]
pub struct LocalizeConfig {
    #[serde(skip)]
    pub base: BaseConfig,
    pub dataset: DatasetConfig,
    /// CLI override of the ensemble's reference kernel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_kernel: Option<u32>,
    pub upsampling_step: f64,
    pub max_scale_factor: f64,
    pub max_steps: usize,
    pub output: PathBuf,
}

impl LocalizeConfig {
    /// Create configuration from global args and command-specific args
    pub fn from_args(global: GlobalArgs, cmd: LocalizeCommand) -> Result<Self, String> {
        if cmd.max_steps == 0 {
            return Err("--max-steps must be at least 1".to_string());
        }
        if cmd.upsampling_step <= 1.0 {
            return Err(format!(
                "--upsampling-step must be greater than 1.0, got {}",
                cmd.upsampling_step
            ));
        }
        if cmd.reference_kernel == Some(0) {
            return Err("--reference-kernel must be positive".to_string());
        }

        Ok(Self {
            base: global.into(),
            dataset: DatasetConfig {
                root: PathBuf::from(cmd.dataset_root),
                split: cmd.split,
                max_classes: cmd.max_classes,
                instances_per_class: cmd.instances_per_class,
            },
            reference_kernel: cmd.reference_kernel,
            upsampling_step: cmd.upsampling_step,
            max_scale_factor: cmd.max_scale_factor,
            max_steps: cmd.max_steps,
            output: PathBuf::from(cmd.output),
        })
    }

    /// Search parameters, resolving the reference kernel against the ensemble.
    pub fn localization_params(&self, ensemble: &EnsembleConfig) -> LocalizationParams {
        LocalizationParams {
            reference_kernel: self
                .reference_kernel
                .unwrap_or_else(|| ensemble.reference_kernel()),
            upsampling_step: self.upsampling_step,
            max_scale_factor: self.max_scale_factor,
            max_steps: self.max_steps,
        }
    }
}

/// CLI command for classifier evaluation on original vs. cropped images
#[derive(Parser, Debug, Clone)]
pub struct EvaluateCommand {
    /// Dataset root containing `meta/classes.txt`
    #[arg(value_name = "DATASET_ROOT")]
    pub dataset_root: String,

    /// ONNX classifier to evaluate
    #[arg(long)]
    pub model: String,

    /// Square input size of the classifier
    #[arg(long, default_value = "224")]
    pub input_size: u32,

    /// Input normalization of the classifier
    #[arg(long, value_enum, default_value = "caffe")]
    pub preprocessing: Preprocessing,

    /// Tensor layout of the classifier
    #[arg(long, value_enum, default_value = "nhwc")]
    pub layout: TensorLayout,

    /// JSON crop list written by `localize`
    #[arg(long, default_value = "crops.json")]
    pub crops: String,
}

/// Internal configuration for classifier evaluation
#[derive(Debug, Clone, Serialize)]
pub struct EvaluateConfig {
    #[serde(skip)]
    pub base: BaseConfig,
    pub dataset_root: PathBuf,
    pub model_path: PathBuf,
    pub input_size: u32,
    pub preprocessing: Preprocessing,
    pub layout: TensorLayout,
    pub crops_path: PathBuf,
}

impl EvaluateConfig {
    pub fn from_args(global: GlobalArgs, cmd: EvaluateCommand) -> Result<Self, String> {
        if cmd.input_size == 0 {
            return Err("--input-size must be positive".to_string());
        }

        Ok(Self {
            base: global.into(),
            dataset_root: PathBuf::from(cmd.dataset_root),
            model_path: PathBuf::from(cmd.model),
            input_size: cmd.input_size,
            preprocessing: cmd.preprocessing,
            layout: cmd.layout,
            crops_path: PathBuf::from(cmd.crops),
        })
    }
}

/// CLI command that renders one member's heatmap for an image
#[derive(Parser, Debug, Clone)]
pub struct HeatmapCommand {
    /// Input image
    #[arg(value_name = "IMAGE")]
    pub image: String,

    /// Ensemble member to run
    #[arg(long)]
    pub member: String,

    /// Class label whose probability is rendered
    #[arg(long)]
    pub label: String,

    /// Class list, one label per line
    #[arg(long, default_value = "meta/classes.txt")]
    pub classes: String,

    /// Scale applied to the image before running the network
    #[arg(long, default_value = "1.0", value_parser = parse_positive_f64)]
    pub scale: f64,

    /// Output PNG path (defaults to `<image>_heatmap.png`)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Also render the N classes with the highest peak probability
    #[arg(long, default_value = "0")]
    pub top_n: usize,
}

/// Internal configuration for heatmap rendering
#[derive(Debug, Clone, Serialize)]
pub struct HeatmapConfig {
    #[serde(skip)]
    pub base: BaseConfig,
    pub image_path: PathBuf,
    pub member: String,
    pub label: String,
    pub classes_path: PathBuf,
    pub scale: f64,
    pub output: PathBuf,
    pub top_n: usize,
}

impl HeatmapConfig {
    pub fn from_args(global: GlobalArgs, cmd: HeatmapCommand) -> Result<Self, String> {
        let image_path = PathBuf::from(&cmd.image);
        let output = match cmd.output {
            Some(output) => PathBuf::from(output),
            None => {
                let stem = image_path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("output");
                image_path
                    .parent()
                    .unwrap_or(Path::new("."))
                    .join(format!("{stem}_heatmap.png"))
            }
        };

        Ok(Self {
            base: global.into(),
            image_path,
            member: cmd.member,
            label: cmd.label,
            classes_path: PathBuf::from(cmd.classes),
            scale: cmd.scale,
            output,
            top_n: cmd.top_n,
        })
    }
}

/// One FCN of the ensemble
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub name: String,
    /// ONNX model; relative paths resolve against the ensemble file
    pub path: PathBuf,
    /// Receptive field of one heatmap cell, in input pixels
    pub kernel_size: u32,
    pub preprocessing: Preprocessing,
    #[serde(default)]
    pub layout: TensorLayout,
}

/// Ordered list of FCNs voting on each crop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_kernel: Option<u32>,
    pub members: Vec<MemberConfig>,
}

impl Default for EnsembleConfig {
    /// VGG16, Xception, Inception-ResNet-v2 and Inception-v3 FCNs fine-tuned
    /// on Food-101, expected under `models/`.
    fn default() -> Self {
        let member = |name: &str, kernel_size, preprocessing| MemberConfig {
            name: name.to_string(),
            path: PathBuf::from(format!("models/{name}_fcn.onnx")),
            kernel_size,
            preprocessing,
            layout: TensorLayout::Nhwc,
        };

        Self {
            reference_kernel: Some(DEFAULT_REFERENCE_KERNEL),
            members: vec![
                member("vgg16", 288, Preprocessing::Caffe),
                member("xception", 295, Preprocessing::Tf),
                member("inception_resnet_v2", 299, Preprocessing::Tf),
                member("inception_v3", 299, Preprocessing::Tf),
            ],
        }
    }
}

impl EnsembleConfig {
    /// Parse an ensemble description and check it is usable.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EnsembleConfig =
            toml::from_str(text).context("Failed to parse ensemble configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load an ensemble description, or the built-in one when `path` is `None`.
    ///
    /// Relative member paths are resolved against the file's directory.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            log::debug!("Using built-in Food-101 ensemble");
            return Ok(Self::default());
        };

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read ensemble file: {}", path.display()))?;
        let mut config = Self::from_toml_str(&text)
            .with_context(|| format!("Invalid ensemble file: {}", path.display()))?;

        let base_dir = path.parent().unwrap_or(Path::new("."));
        for member in &mut config.members {
            if member.path.is_relative() {
                member.path = base_dir.join(&member.path);
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.members.is_empty() {
            return Err(anyhow::anyhow!("Ensemble must contain at least one member"));
        }
        for member in &self.members {
            if member.kernel_size == 0 {
                return Err(anyhow::anyhow!(
                    "Member '{}' has a zero kernel size",
                    member.name
                ));
            }
        }
        for (i, member) in self.members.iter().enumerate() {
            if self.members[..i].iter().any(|m| m.name == member.name) {
                return Err(anyhow::anyhow!(
                    "Duplicate ensemble member name: {}",
                    member.name
                ));
            }
        }
        if self.reference_kernel == Some(0) {
            return Err(anyhow::anyhow!("reference_kernel must be positive"));
        }
        Ok(())
    }

    /// Reference kernel, falling back to the first member's kernel.
    pub fn reference_kernel(&self) -> u32 {
        self.reference_kernel
            .or_else(|| self.members.first().map(|m| m.kernel_size))
            .unwrap_or(DEFAULT_REFERENCE_KERNEL)
    }

    pub fn member(&self, name: &str) -> Option<&MemberConfig> {
        self.members.iter().find(|m| m.name == name)
    }
}
