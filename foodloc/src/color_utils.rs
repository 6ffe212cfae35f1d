//! Color and styling utilities with support for NO_COLOR and TERM environment variables.
//!
//! Colors are disabled by:
//! - `--no-color` CLI flag
//! - `NO_COLOR` environment variable (https://no-color.org/)
//! - `FOODLOC_NO_COLOR` environment variable
//! - `TERM=dumb`
//! - stderr not being a TTY

use colored::ColoredString;
use std::io::{stderr, IsTerminal};
use std::sync::OnceLock;

static COLOR_CONFIG: OnceLock<ColorConfig> = OnceLock::new();

fn should_disable_colors_from_env() -> bool {
    !std::env::var("NO_COLOR").unwrap_or_default().is_empty()
        || !std::env::var("FOODLOC_NO_COLOR").unwrap_or_default().is_empty()
        || std::env::var("TERM").unwrap_or_default() == "dumb"
        // Log messages go to stderr
        || !stderr().is_terminal()
}

#[derive(Debug, Clone)]
struct ColorConfig {
    colors_enabled: bool,
}

impl ColorConfig {
    fn new(no_color_flag: bool) -> Self {
        let colors_enabled = !no_color_flag && !should_disable_colors_from_env();
        Self { colors_enabled }
    }

    fn is_enabled(&self) -> bool {
        self.colors_enabled
    }
}

/// Initialize the color configuration with the CLI flag state.
/// Call once at startup, after parsing CLI arguments.
pub fn init_color_config(no_color_flag: bool) {
    let config = ColorConfig::new(no_color_flag);
    COLOR_CONFIG.set(config).unwrap_or_else(|_| {
        eprintln!("Warning: Color configuration already initialized");
    });
}

pub fn colors_enabled() -> bool {
    COLOR_CONFIG
        .get()
        .map(|config| config.is_enabled())
        .unwrap_or_else(|| !should_disable_colors_from_env())
}

/// Apply color to a string only if colors are enabled for stderr output
pub fn maybe_color_stderr<F>(text: &str, color_fn: F) -> String
where
    F: FnOnce(&str) -> ColoredString,
{
    if colors_enabled() {
        color_fn(text).to_string()
    } else {
        text.to_string()
    }
}

/// Level tags used by the logger
pub mod colors {
    use super::maybe_color_stderr;
    use colored::Colorize;

    pub fn error_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.red().bold())
    }

    pub fn warning_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.yellow())
    }

    pub fn info_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.green())
    }

    pub fn debug_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.blue())
    }

    pub fn trace_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.magenta())
    }
}

/// Semantic symbols for different operation types and states
pub mod symbols {
    use super::colors_enabled;

    pub fn model_loaded() -> &'static str {
        if colors_enabled() {
            "✅"
        } else {
            "  "
        }
    }

    /// Symbol for starting a localization run
    pub fn localization_start() -> &'static str {
        if colors_enabled() {
            "🍽️ "
        } else {
            "[LOCALIZE]"
        }
    }

    /// Symbol for starting an evaluation run
    pub fn evaluation_start() -> &'static str {
        if colors_enabled() {
            "📊"
        } else {
            "[EVALUATE]"
        }
    }

    pub fn operation_failed() -> &'static str {
        if colors_enabled() {
            "❌"
        } else {
            "[FAILED]"
        }
    }

    /// Symbol for technical setup and configuration
    pub fn system_setup() -> &'static str {
        if colors_enabled() {
            "⚙️ "
        } else {
            ""
        }
    }

    pub fn resources_found() -> &'static str {
        if colors_enabled() {
            "🎯"
        } else {
            ""
        }
    }

    pub fn completed_successfully() -> &'static str {
        if colors_enabled() {
            "✅"
        } else {
            "[SUCCESS]"
        }
    }

    /// Some items succeeded, some failed
    pub fn completed_partially_successfully() -> &'static str {
        if colors_enabled() {
            "⚠️ "
        } else {
            "[PARTIAL-SUCCESS]"
        }
    }

    pub fn warning() -> &'static str {
        if colors_enabled() {
            "⚠️ "
        } else {
            ""
        }
    }
}

/// Progress bar utilities that respect TTY state
pub mod progress {
    use crate::progress::add_progress_bar;

    use super::colors_enabled;
    use indicatif::{ProgressBar, ProgressStyle};
    use std::io::{stderr, IsTerminal};

    /// Create a progress bar for batch processing, only if stderr is interactive
    pub fn create_batch_progress_bar(total: usize) -> Option<ProgressBar> {
        if total <= 1 || !stderr().is_terminal() {
            return None;
        }

        let (template, chars) = if colors_enabled() {
            (
                "[{elapsed_precise}] [{bar:30.green/black}] {pos}/{len} ({percent}%) {msg}",
                "█▓▒░",
            )
        } else {
            (
                "[{elapsed_precise}] [{bar:30}] {pos}/{len} ({percent}%) {msg}",
                "#> ",
            )
        };
        let style = ProgressStyle::default_bar()
            .template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars(chars);

        let pb = add_progress_bar(ProgressBar::new(total as u64));
        pb.set_style(style);
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Some(pb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_config_respects_no_color_flag() {
        let config = ColorConfig::new(true);
        assert!(!config.is_enabled());
    }

    #[test]
    fn test_color_config_respects_no_color_env() {
        std::env::set_var("NO_COLOR", "1");
        let config = ColorConfig::new(false);
        assert!(!config.is_enabled());
        std::env::remove_var("NO_COLOR");
    }

    #[test]
    fn test_color_config_respects_term_dumb() {
        std::env::set_var("TERM", "dumb");
        let config = ColorConfig::new(false);
        assert!(!config.is_enabled());
        std::env::remove_var("TERM");
    }

    #[test]
    fn test_color_config_respects_foodloc_no_color() {
        std::env::set_var("FOODLOC_NO_COLOR", "1");
        let config = ColorConfig::new(false);
        assert!(!config.is_enabled());
        std::env::remove_var("FOODLOC_NO_COLOR");
    }

    #[test]
    fn test_maybe_color_with_colors_disabled() {
        use colored::Colorize;

        COLOR_CONFIG
            .set(ColorConfig {
                colors_enabled: false,
            })
            .ok();

        let result = maybe_color_stderr("test", |s| s.red());
        assert_eq!(result, "test");
        assert_eq!(symbols::operation_failed(), "[FAILED]");
    }
}
