use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// Log level filter (e.g., "debug", "info", "dap_probe::dap=trace")
    pub level: String,
    /// Optional log file path. If None, logs only to stderr
    pub file_path: Option<PathBuf>,
    /// Whether to use structured JSON format for logs
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Create LogConfig from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`LogConfig::from_env`] with an injectable variable source
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let level = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());

        let file_path = lookup("DAP_PROBE_LOG_FILE").map(|path| {
            let mut path_buf = PathBuf::from(path);

            // One file per probe run when DAP_PROBE_LOG_UNIQUE is set
            if lookup("DAP_PROBE_LOG_UNIQUE").as_deref() == Some("true") {
                if let Some(filename) = path_buf.file_stem() {
                    let extension = path_buf
                        .extension()
                        .and_then(|ext| ext.to_str())
                        .unwrap_or("");

                    let pid = std::process::id();
                    let unique_filename = if extension.is_empty() {
                        format!("{}.{}", filename.to_string_lossy(), pid)
                    } else {
                        format!("{}.{}.{}", filename.to_string_lossy(), pid, extension)
                    };

                    path_buf.set_file_name(unique_filename);
                }
            }

            path_buf
        });

        let json_format = lookup("DAP_PROBE_LOG_JSON").as_deref() == Some("true");

        Self {
            level,
            file_path,
            json_format,
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

/// Initialize the logging system based on configuration
///
/// Logs go to stderr or a file, never stdout, which carries probe output.
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;

    let subscriber = tracing_subscriber::registry().with(env_filter);

    match (&config.file_path, config.json_format) {
        (Some(file_path), true) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;

            let file_layer = fmt::layer().json().with_writer(file).with_ansi(false);

            subscriber.with(file_layer).try_init()?;
        }
        (Some(file_path), false) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;

            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);

            subscriber.with(file_layer).try_init()?;
        }
        (None, true) => {
            let stderr_layer = fmt::layer().json().with_writer(io::stderr).with_ansi(false);

            subscriber.with(stderr_layer).try_init()?;
        }
        (None, false) => {
            let stderr_layer = fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);

            subscriber.with(stderr_layer).try_init()?;
        }
    }

    Ok(())
}

/// Log one DAP frame as a single structured line
#[macro_export]
macro_rules! log_dap_message {
    ($level:expr, $direction:expr, $kind:expr, $name:expr, $seq:expr) => {
        tracing::event!(
            $level,
            direction = $direction,
            kind = $kind,
            name = %$name,
            seq = $seq,
            pid = std::process::id(),
            "DAP message"
        );
    };
}

/// Log how long an operation took
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis() as u64,
            pid = std::process::id(),
            "Performance timing"
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        assert_eq!(LogConfig::from_lookup(lookup(&[])), LogConfig::default());
    }

    #[test]
    fn test_environment_values() {
        let config = LogConfig::from_lookup(lookup(&[
            ("RUST_LOG", "dap_probe=trace"),
            ("DAP_PROBE_LOG_FILE", "/tmp/probe.log"),
            ("DAP_PROBE_LOG_JSON", "true"),
        ]));

        assert_eq!(config.level, "dap_probe=trace");
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/probe.log")));
        assert!(config.json_format);
    }

    #[test]
    fn test_unique_log_file_gets_pid() {
        let config = LogConfig::from_lookup(lookup(&[
            ("DAP_PROBE_LOG_FILE", "/tmp/probe.log"),
            ("DAP_PROBE_LOG_UNIQUE", "true"),
        ]));

        let expected = format!("/tmp/probe.{}.log", std::process::id());
        assert_eq!(config.file_path, Some(PathBuf::from(expected)));
    }

    #[test]
    fn test_cli_overrides_win() {
        let config = LogConfig::from_lookup(lookup(&[("RUST_LOG", "warn")]))
            .with_overrides(Some("debug".to_string()), Some(PathBuf::from("probe.log")));

        assert_eq!(config.level, "debug");
        assert_eq!(config.file_path, Some(PathBuf::from("probe.log")));
    }
}
