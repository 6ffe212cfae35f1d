use clap::Parser;
use env_logger::Builder;
use env_logger::Env;
use log::{error, info, Level};
use std::io::Write;

use foodloc::color_utils::{colors, init_color_config, symbols};
use foodloc::config::{
    EnsembleConfig, EvaluateCommand, EvaluateConfig, GlobalArgs, HeatmapCommand, HeatmapConfig,
    LocalizeCommand, LocalizeConfig,
};
use foodloc::evaluation::run_evaluation;
use foodloc::heatmap_processing::run_heatmap;
use foodloc::localize_processing::run_localization;

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Find the best square crop of every image in a dataset split
    Localize(LocalizeCommand),

    /// Compare classifier accuracy on original images and their crops
    Evaluate(EvaluateCommand),

    /// Render one ensemble member's class heatmap for an image
    Heatmap(HeatmapCommand),

    /// Show version information
    Version,
}

#[derive(Parser)]
#[command(name = "foodloc")]
#[command(about = "Multi-scale ensemble crop localization for food images")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn get_log_level_from_verbosity(
    verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::ErrorLevel>,
) -> log::LevelFilter {
    // clap-verbosity-flag cannot tell the default apart from -q
    if verbosity.is_silent() {
        return log::LevelFilter::Error;
    }
    match verbosity.log_level_filter() {
        log::LevelFilter::Off => log::LevelFilter::Off,     // -qq
        log::LevelFilter::Error => log::LevelFilter::Warn,  // default
        log::LevelFilter::Warn => log::LevelFilter::Info,   // -v
        log::LevelFilter::Info => log::LevelFilter::Debug,  // -vv
        log::LevelFilter::Debug => log::LevelFilter::Trace, // -vvv
        log::LevelFilter::Trace => log::LevelFilter::Trace,
    }
}

fn init_logger(global: &GlobalArgs) {
    // Honor RUST_LOG unless -v/-q was given
    let use_env = !global.verbosity.is_present() && std::env::var_os("RUST_LOG").is_some();

    let mut logger = if use_env {
        Builder::from_env(Env::default())
    } else {
        let mut b = Builder::new();
        b.filter_level(get_log_level_from_verbosity(global.verbosity.clone()));
        b
    };

    logger
        .format(|buf, record| {
            let level_str = match record.level() {
                Level::Error => colors::error_level("ERROR"),
                Level::Warn => colors::warning_level("WARN"),
                Level::Info => colors::info_level("INFO"),
                Level::Debug => colors::debug_level("DEBUG"),
                Level::Trace => colors::trace_level("TRACE"),
            };
            writeln!(buf, "[{}] {}", level_str, record.args())
        })
        .init();
}

fn fail(what: &str, e: impl std::fmt::Display) -> ! {
    error!("{} {what}: {e}", symbols::operation_failed());
    std::process::exit(1);
}

fn main() {
    let cli = Cli::parse();
    init_color_config(cli.global.no_color);
    init_logger(&cli.global);

    match cli.command {
        Some(Commands::Localize(cmd)) => {
            info!(
                "{} Localization: {} ({}) | step: {} | max scale: {} | max steps: {} | device: {}",
                symbols::localization_start(),
                cmd.dataset_root,
                cmd.split,
                cmd.upsampling_step,
                cmd.max_scale_factor,
                cmd.max_steps,
                cli.global.device
            );
            let config = LocalizeConfig::from_args(cli.global, cmd)
                .unwrap_or_else(|e| fail("Invalid arguments", e));
            if let Err(e) = run_localization(config) {
                fail("Localization failed", format!("{e:#}"));
            }
        }
        Some(Commands::Evaluate(cmd)) => {
            let config = EvaluateConfig::from_args(cli.global, cmd)
                .unwrap_or_else(|e| fail("Invalid arguments", e));
            if let Err(e) = run_evaluation(config) {
                fail("Evaluation failed", format!("{e:#}"));
            }
        }
        Some(Commands::Heatmap(cmd)) => {
            let config = HeatmapConfig::from_args(cli.global, cmd)
                .unwrap_or_else(|e| fail("Invalid arguments", e));
            if let Err(e) = run_heatmap(config) {
                fail("Heatmap rendering failed", format!("{e:#}"));
            }
        }
        Some(Commands::Version) => {
            println!("foodloc v{}", env!("CARGO_PKG_VERSION"));
            let ensemble_path = cli.global.ensemble.as_deref().map(std::path::Path::new);
            match EnsembleConfig::load(ensemble_path) {
                Ok(ensemble) => {
                    println!("Reference kernel: {}", ensemble.reference_kernel());
                    for member in &ensemble.members {
                        println!(
                            "Member: {} (kernel {}, {:?}) {}",
                            member.name,
                            member.kernel_size,
                            member.preprocessing,
                            member.path.display()
                        );
                    }
                }
                Err(e) => println!("Ensemble: unavailable ({e:#})"),
            }
        }
        None => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            if let Err(e) = cmd.print_help() {
                fail("Failed to print help", e);
            }
        }
    }
}
