use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

/// Ordered class names; a label's line number is its model output index.
#[derive(Debug, Clone)]
pub struct ClassLabels {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

impl ClassLabels {
    /// Parse one label per line. Every line keeps its position, blank ones
    /// included, so indices match the model's output order. Only trailing
    /// blank lines are dropped.
    pub fn parse(text: &str) -> Self {
        let mut labels: Vec<String> = text.lines().map(str::to_string).collect();
        while labels.last().is_some_and(|label| label.is_empty()) {
            labels.pop();
        }

        let mut index = HashMap::with_capacity(labels.len());
        for (i, label) in labels.iter().enumerate() {
            if label.is_empty() {
                continue;
            }
            // First occurrence wins
            index.entry(label.clone()).or_insert(i);
        }

        Self { labels, index }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read class list: {}", path.display()))?;
        let labels = Self::parse(&text);
        if labels.is_empty() {
            return Err(anyhow::anyhow!("Class list is empty: {}", path.display()));
        }
        log::debug!("Loaded {} class labels from {}", labels.len(), path.display());
        Ok(labels)
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Class index not found for label '{name}'"))
    }

    pub fn label_of(&self, idx: usize) -> Result<&str> {
        self.labels
            .get(idx)
            .map(String::as_str)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Class index {idx} out of range ({} classes)",
                    self.labels.len()
                )
            })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
