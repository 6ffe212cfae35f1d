use crate::color_utils::symbols;
use anyhow::{Context, Result};
use log::Level;
use ort::{
    execution_providers::{CPUExecutionProvider, CoreMLExecutionProvider, ExecutionProvider},
    logging::LogLevel,
    session::Session,
};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Instant;

fn log_level_from_ort(level: LogLevel) -> Level {
    match level {
        LogLevel::Verbose => Level::Trace,
        LogLevel::Info => Level::Trace,
        LogLevel::Warning => Level::Debug,
        LogLevel::Error => Level::Info,
        LogLevel::Fatal => Level::Error,
    }
}

fn ort_level_from_log(level: Level) -> LogLevel {
    match level {
        // ONNX's info level is closer to our trace
        Level::Trace => LogLevel::Verbose,
        Level::Debug => LogLevel::Warning,
        Level::Info => LogLevel::Error,
        Level::Warn => LogLevel::Error,
        Level::Error => LogLevel::Fatal,
    }
}

/// Configuration for creating ONNX sessions
pub struct SessionConfig<'a> {
    pub device: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_path: String,
    pub model_size_bytes: usize,
    pub execution_providers: Vec<String>,
    pub load_time_ms: f64,
}

/// Device selection result
#[derive(Debug, Clone)]
pub struct DeviceSelection {
    pub device: String,
    pub reason: String,
}

/// Determine optimal device based on user preference
pub fn determine_optimal_device(requested_device: &str) -> DeviceSelection {
    match requested_device {
        "auto" => {
            let coreml = CoreMLExecutionProvider::default();
            match coreml.is_available() {
                Ok(true) => DeviceSelection {
                    device: "coreml".to_string(),
                    reason: "Auto-selected CoreML (available)".to_string(),
                },
                _ => DeviceSelection {
                    device: "cpu".to_string(),
                    reason: "Auto-selected CPU (CoreML not available)".to_string(),
                },
            }
        }
        other => DeviceSelection {
            device: other.to_string(),
            reason: format!("User explicitly chose {other}"),
        },
    }
}

/// Reject model files that cannot possibly hold a network.
fn validate_model_file(path: &Path) -> Result<()> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Model file does not exist: {}", path.display()))?;

    if metadata.len() == 0 {
        return Err(anyhow::anyhow!(
            "Model file is empty (0 bytes): {}",
            path.display()
        ));
    }

    log::debug!(
        "✓ Model file size: {:.2} MB",
        metadata.len() as f64 / (1024.0 * 1024.0)
    );
    Ok(())
}

/// Create an ONNX Runtime session for the model stored at `model_path`.
pub fn create_onnx_session(
    model_path: &Path,
    config: &SessionConfig,
) -> Result<(Session, ModelInfo)> {
    let start = Instant::now();
    validate_model_file(model_path)?;
    let bytes = fs::read(model_path)
        .with_context(|| format!("Failed to read model file: {}", model_path.display()))?;

    let execution_providers = match config.device {
        "coreml" => match CoreMLExecutionProvider::default().is_available() {
            Ok(true) => vec![
                CoreMLExecutionProvider::default().build(),
                CPUExecutionProvider::default().build(),
            ],
            _ => {
                log::warn!(
                    "{}CoreML not available, falling back to CPU",
                    symbols::warning()
                );
                vec![CPUExecutionProvider::default().build()]
            }
        },
        "cpu" => vec![CPUExecutionProvider::default().build()],
        _ => {
            log::warn!(
                "{}Unknown device '{}', using CPU",
                symbols::warning(),
                config.device
            );
            vec![CPUExecutionProvider::default().build()]
        }
    };

    let ep_names: Vec<String> = execution_providers
        .iter()
        .map(|ep| format!("{ep:?}"))
        .collect();

    // Choose the ORT log level based on what is enabled for us
    let ort_log_level = [
        Level::Trace,
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
    ]
    .into_iter()
    .find(|&lvl| log::log_enabled!(lvl))
    .map(ort_level_from_log)
    .unwrap_or(LogLevel::Fatal);

    let session = Session::builder()
        .map_err(|e| anyhow::anyhow!("Failed to create session builder: {}", e))?
        .with_logger(Box::new(|level, _, _, _, msg| {
            let log_level = log_level_from_ort(level);
            log::log!(log_level, "[onnx] {msg}")
        }))
        .map_err(|e| anyhow::anyhow!("Failed to set logger: {}", e))?
        .with_log_level(ort_log_level)
        .map_err(|e| anyhow::anyhow!("Failed to set log level: {}", e))?
        .with_execution_providers(execution_providers)
        .map_err(|e| anyhow::anyhow!("Failed to set execution providers: {}", e))?
        .commit_from_memory(&bytes)
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to load model {}: {}",
                model_path.display(),
                e
            )
        })?;

    let model_info = ModelInfo {
        model_path: model_path.display().to_string(),
        model_size_bytes: bytes.len(),
        execution_providers: ep_names,
        load_time_ms: start.elapsed().as_secs_f64() * 1000.0,
    };

    log::debug!(
        "{} Execution providers registered: {}",
        symbols::system_setup(),
        model_info.execution_providers.join(" -> ")
    );

    Ok((session, model_info))
}

/// First input and output names of a session.
pub fn io_names(session: &Session) -> Result<(String, String)> {
    let input = session
        .inputs
        .first()
        .ok_or_else(|| anyhow::anyhow!("Model declares no inputs"))?;
    let output = session
        .outputs
        .first()
        .ok_or_else(|| anyhow::anyhow!("Model declares no outputs"))?;
    Ok((input.name.clone(), output.name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_explicit_device_is_respected() {
        let selection = determine_optimal_device("cpu");
        assert_eq!(selection.device, "cpu");
        assert!(selection.reason.contains("explicitly"));
    }

    #[test]
    fn test_log_level_mapping_is_quieter_than_ort() {
        assert_eq!(log_level_from_ort(LogLevel::Info), Level::Trace);
        assert_eq!(ort_level_from_log(Level::Info), LogLevel::Error);
    }

    #[test]
    fn test_missing_model_file_is_reported() {
        let err = validate_model_file(Path::new("/non/existent/model.onnx")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_empty_model_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.onnx");
        fs::write(&path, b"").unwrap();
        let err = validate_model_file(&path).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
