//! Food-101 style dataset enumeration.
//!
//! Layout: `<root>/meta/classes.txt` plus `<root>/<split>/<class>/<image>`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Which part of the dataset to enumerate
#[derive(Debug, Clone, Serialize)]
pub struct DatasetConfig {
    pub root: PathBuf,
    pub split: String,
    pub max_classes: usize,
    pub instances_per_class: usize,
}

impl DatasetConfig {
    pub fn split_dir(&self) -> PathBuf {
        self.root.join(&self.split)
    }

    pub fn classes_file(&self) -> PathBuf {
        classes_file(&self.root)
    }
}

/// Location of the class list inside a dataset root.
pub fn classes_file(root: &Path) -> PathBuf {
    root.join("meta").join("classes.txt")
}

/// One image together with its ground-truth class folder name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetEntry {
    pub path: PathBuf,
    pub label: String,
}

/// Check if a file is a supported image format
/// Supports: jpg, jpeg, png, webp, bmp, tiff, tif
pub fn is_supported_image_file(path: &Path) -> bool {
    if let Some(ext) = path.extension() {
        let ext_lower = ext.to_string_lossy().to_lowercase();
        matches!(
            ext_lower.as_str(),
            "jpg" | "jpeg" | "png" | "webp" | "bmp" | "tiff" | "tif"
        )
    } else {
        false
    }
}

/// Find all image files in a directory (non-recursive), sorted by name
pub fn find_images_in_directory(dir_path: &Path) -> Result<Vec<PathBuf>> {
    let mut image_files = Vec::new();

    for entry in fs::read_dir(dir_path)
        .with_context(|| format!("Failed to read directory: {}", dir_path.display()))?
    {
        let path = entry?.path();
        if path.is_file() && is_supported_image_file(&path) {
            image_files.push(path);
        }
    }

    image_files.sort();
    Ok(image_files)
}

/// Names of the class folders in a split directory, sorted
pub fn list_class_folders(split_dir: &Path) -> Result<Vec<String>> {
    let mut folders = Vec::new();

    for entry in fs::read_dir(split_dir)
        .with_context(|| format!("Failed to read split directory: {}", split_dir.display()))?
    {
        let entry = entry?;
        if entry.path().is_dir() {
            folders.push(entry.file_name().to_string_lossy().to_string());
        }
    }

    folders.sort();
    Ok(folders)
}

/// Enumerate `(image, label)` pairs, class by class.
///
/// Takes the first `max_classes` folders and the first `instances_per_class`
/// images of each, in name order.
pub fn collect_dataset_entries(config: &DatasetConfig) -> Result<Vec<DatasetEntry>> {
    let split_dir = config.split_dir();
    let folders = list_class_folders(&split_dir)?;

    let mut entries = Vec::new();
    for folder in folders.into_iter().take(config.max_classes) {
        let images = find_images_in_directory(&split_dir.join(&folder))?;
        log::debug!("Class '{}': {} image(s)", folder, images.len());

        entries.extend(
            images
                .into_iter()
                .take(config.instances_per_class)
                .map(|path| DatasetEntry {
                    path,
                    label: folder.clone(),
                }),
        );
    }

    Ok(entries)
}
