pub mod class_labels;
pub mod color_utils;
pub mod config;
pub mod crop;
pub mod dataset;
pub mod ensemble;
pub mod evaluation;
pub mod fcn;
pub mod heatmap;
pub mod heatmap_processing;
pub mod localization;
pub mod localize_processing;
pub mod onnx_session;
pub mod preprocessing;
pub mod progress;
pub mod results;
