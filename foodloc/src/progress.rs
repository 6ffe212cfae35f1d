//! Global progress bar management
//!
//! A single `MultiProgress` is shared so log lines and bars do not overwrite
//! each other.

use indicatif::{MultiProgress, ProgressBar};
use once_cell::sync::Lazy;
use std::sync::Arc;

use crate::color_utils::progress::create_batch_progress_bar;

static MULTI: Lazy<Arc<MultiProgress>> = Lazy::new(|| Arc::new(MultiProgress::new()));

/// Cheap handle to the global multi-progress instance.
pub fn global_mp() -> Arc<MultiProgress> {
    MULTI.clone()
}

pub fn add_progress_bar(pb: ProgressBar) -> ProgressBar {
    global_mp().add(pb)
}

pub fn remove_progress_bar(pb: &ProgressBar) {
    global_mp().remove(pb);
}

/// Images between two progress log lines
pub const LOG_EVERY: usize = 101;

/// Progress of a batch: an optional bar plus periodic log lines.
pub struct BatchProgress {
    bar: Option<ProgressBar>,
    total: usize,
    done: usize,
}

impl BatchProgress {
    pub fn new(total: usize) -> Self {
        Self {
            bar: create_batch_progress_bar(total),
            total,
            done: 0,
        }
    }

    /// Record one finished item. Returns true when a log line is due.
    pub fn advance(&mut self, message: &str) -> bool {
        self.done += 1;
        if let Some(bar) = &self.bar {
            bar.set_message(message.to_string());
            bar.inc(1);
        }
        self.done % LOG_EVERY == 0
    }

    pub fn done(&self) -> usize {
        self.done
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn finish(self) {
        if let Some(bar) = self.bar {
            bar.finish_and_clear();
            remove_progress_bar(&bar);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_line_every_101_items() {
        let mut progress = BatchProgress {
            bar: None,
            total: 250,
            done: 0,
        };
        let due: Vec<usize> = (1..=250)
            .filter(|_| progress.advance("img"))
            .collect();
        assert_eq!(due, vec![101, 202]);
        assert_eq!(progress.done(), 250);
        progress.finish();
    }
}
