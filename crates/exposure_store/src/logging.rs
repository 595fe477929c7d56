//! Store logging bootstrap.
//!
//! # Responsibility
//! - Start rotating file logs from the `[logging]` section of a store config.
//! - Keep report log lines metadata-only: owner ids, counts, durations.
//!
//! # Invariants
//! - The logger starts at most once per process. Repeating the same
//!   settings is a no-op; different settings are rejected.
//! - A config without a log directory leaves logging off.
//! - Startup failures are returned, never panicked.

use crate::config::LoggingConfig;
use crate::db::Dialect;
use flexi_logger::{
    Cleanup, Criterion, FileSpec, FlexiLoggerError, Logger, LoggerHandle, Naming, WriteMode,
};
use log::{error, info, LevelFilter};
use once_cell::sync::OnceCell;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

const LOG_FILE_BASENAME: &str = "exposure_store";
const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;
const KEEP_ROTATED_FILES: usize = 5;
const PANIC_SUMMARY_CHARS: usize = 160;

static ACTIVE: OnceCell<ActiveLogger> = OnceCell::new();
static PANIC_HOOK: OnceCell<()> = OnceCell::new();

struct ActiveLogger {
    settings: LogSettings,
    _handle: LoggerHandle,
}

/// Validated logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub dir: PathBuf,
}

#[derive(Debug)]
pub enum LoggingError {
    UnsupportedLevel(String),
    InvalidDirectory(String),
    CreateDirectory {
        dir: PathBuf,
        source: std::io::Error,
    },
    Backend(FlexiLoggerError),
    /// Logging already runs with other settings.
    Conflict {
        active: LogSettings,
        requested: LogSettings,
    },
}

impl Display for LoggingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedLevel(level) => write!(
                f,
                "unsupported log level `{level}`; expected trace|debug|info|warn|error"
            ),
            Self::InvalidDirectory(message) => write!(f, "invalid log directory: {message}"),
            Self::CreateDirectory { dir, source } => write!(
                f,
                "failed to create log directory `{}`: {source}",
                dir.display()
            ),
            Self::Backend(err) => write!(f, "failed to start logger: {err}"),
            Self::Conflict { active, requested } => write!(
                f,
                "logging already runs at level {} in `{}`; refusing level {} in `{}`",
                active.level,
                active.dir.display(),
                requested.level,
                requested.dir.display()
            ),
        }
    }
}

impl Error for LoggingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::CreateDirectory { source, .. } => Some(source),
            Self::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl LogSettings {
    /// Settings from a config section. `None` when no directory is set.
    pub fn from_config(config: &LoggingConfig) -> Result<Option<Self>, LoggingError> {
        let Some(dir) = config.dir.as_deref() else {
            return Ok(None);
        };
        let level = match config.level.as_deref() {
            Some(level) => parse_level(level)?,
            None => default_level(),
        };
        Ok(Some(Self {
            level,
            dir: parse_dir(dir)?,
        }))
    }
}

/// Applies a `[logging]` section. Returns whether logging is active.
pub fn init_logging_from_config(config: &LoggingConfig) -> Result<bool, LoggingError> {
    match LogSettings::from_config(config)? {
        Some(settings) => {
            start(settings)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Starts logging with an explicit level and absolute directory.
pub fn init_logging(level: &str, log_dir: &str) -> Result<(), LoggingError> {
    start(LogSettings {
        level: parse_level(level)?,
        dir: parse_dir(log_dir)?,
    })
}

/// Settings of the running logger, if any.
pub fn logging_status() -> Option<LogSettings> {
    ACTIVE.get().map(|active| active.settings.clone())
}

/// `debug` in debug builds, `info` in release builds.
pub fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Logs one `event=store_open` line for a finished bootstrap.
pub(crate) fn log_store_open<T, E: Display>(
    dialect: Dialect,
    duration_ms: u128,
    result: &Result<T, E>,
) {
    match result {
        Ok(_) => info!(
            "event=store_open module=store status=ok backend={dialect} duration_ms={duration_ms}"
        ),
        Err(err) => error!(
            "event=store_open module=store status=error backend={dialect} duration_ms={duration_ms} error={err}"
        ),
    }
}

fn start(settings: LogSettings) -> Result<(), LoggingError> {
    let active = ACTIVE.get_or_try_init(|| -> Result<ActiveLogger, LoggingError> {
        std::fs::create_dir_all(&settings.dir).map_err(|source| {
            LoggingError::CreateDirectory {
                dir: settings.dir.clone(),
                source,
            }
        })?;

        let handle = Logger::with(settings.level)
            .log_to_file(
                FileSpec::default()
                    .directory(settings.dir.as_path())
                    .basename(LOG_FILE_BASENAME),
            )
            .rotate(
                Criterion::Size(ROTATE_AT_BYTES),
                Naming::Numbers,
                Cleanup::KeepLogFiles(KEEP_ROTATED_FILES),
            )
            .write_mode(WriteMode::BufferAndFlush)
            .append()
            .format_for_files(flexi_logger::detailed_format)
            .start()
            .map_err(LoggingError::Backend)?;

        install_panic_hook();
        info!(
            "event=logging_start module=logging status=ok version={} level={} log_dir={}",
            env!("CARGO_PKG_VERSION"),
            settings.level,
            settings.dir.display()
        );

        Ok(ActiveLogger {
            settings: settings.clone(),
            _handle: handle,
        })
    })?;

    if active.settings != settings {
        return Err(LoggingError::Conflict {
            active: active.settings.clone(),
            requested: settings,
        });
    }
    Ok(())
}

fn parse_level(level: &str) -> Result<LevelFilter, LoggingError> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::Trace),
        "debug" => Ok(LevelFilter::Debug),
        "info" => Ok(LevelFilter::Info),
        "warn" | "warning" => Ok(LevelFilter::Warn),
        "error" => Ok(LevelFilter::Error),
        _ => Err(LoggingError::UnsupportedLevel(level.to_string())),
    }
}

fn parse_dir(dir: &str) -> Result<PathBuf, LoggingError> {
    let trimmed = dir.trim();
    if trimmed.is_empty() {
        return Err(LoggingError::InvalidDirectory("path is empty".to_string()));
    }
    let path = Path::new(trimmed);
    if !path.is_absolute() {
        return Err(LoggingError::InvalidDirectory(format!(
            "`{trimmed}` is not absolute"
        )));
    }
    Ok(path.to_path_buf())
}

fn install_panic_hook() {
    if PANIC_HOOK.set(()).is_err() {
        return;
    }

    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info.location().map_or_else(
            || "unknown".to_string(),
            |loc| format!("{}:{}", loc.file(), loc.line()),
        );
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(|message| (*message).to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(
            "event=panic_captured module=logging status=error location={location} payload={}",
            single_line(&payload, PANIC_SUMMARY_CHARS)
        );
        previous(info);
    }));
}

/// Flattens `value` to one line of at most `max_chars` characters.
fn single_line(value: &str, max_chars: usize) -> String {
    let flat = value.replace(['\n', '\r'], " ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut: String = flat.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::{
        default_level, init_logging_from_config, logging_status, parse_dir, parse_level,
        single_line, LogSettings, LoggingError,
    };
    use crate::config::LoggingConfig;
    use log::LevelFilter;

    #[test]
    fn level_names_are_case_insensitive() {
        assert_eq!(parse_level("INFO").unwrap(), LevelFilter::Info);
        assert_eq!(parse_level(" warning ").unwrap(), LevelFilter::Warn);
        assert!(matches!(
            parse_level("verbose"),
            Err(LoggingError::UnsupportedLevel(_))
        ));
    }

    #[test]
    fn relative_directory_is_rejected() {
        assert!(matches!(
            parse_dir("logs/dev"),
            Err(LoggingError::InvalidDirectory(_))
        ));
    }

    #[test]
    fn single_line_flattens_and_truncates() {
        let flat = single_line("line1\nline2\rline3", 8);
        assert!(!flat.contains('\n'));
        assert!(!flat.contains('\r'));
        assert!(flat.ends_with("..."));
        assert_eq!(single_line("short", 8), "short");
    }

    #[test]
    fn config_without_dir_leaves_logging_off() {
        let config = LoggingConfig {
            level: Some("debug".to_string()),
            dir: None,
        };
        assert!(LogSettings::from_config(&config).unwrap().is_none());
        assert!(!init_logging_from_config(&config).unwrap());
    }

    #[test]
    fn config_without_level_uses_build_default() {
        let config = LoggingConfig {
            level: None,
            dir: Some("/var/log/exposure-store".to_string()),
        };
        let settings = LogSettings::from_config(&config).unwrap().unwrap();
        assert_eq!(settings.level, default_level());
    }

    #[test]
    fn config_with_bad_level_is_rejected_before_start() {
        let config = LoggingConfig {
            level: Some("verbose".to_string()),
            dir: Some("/tmp/exposure-store-never-created".to_string()),
        };
        assert!(matches!(
            init_logging_from_config(&config),
            Err(LoggingError::UnsupportedLevel(_))
        ));
    }

    #[test]
    fn start_is_idempotent_and_rejects_other_settings() {
        let dir = tempfile::tempdir().unwrap().keep();
        let other = tempfile::tempdir().unwrap().keep();
        let config = LoggingConfig {
            level: Some("info".to_string()),
            dir: Some(dir.to_str().unwrap().to_string()),
        };

        assert!(init_logging_from_config(&config).unwrap());
        assert!(init_logging_from_config(&config).unwrap());

        let louder = LoggingConfig {
            level: Some("debug".to_string()),
            ..config.clone()
        };
        assert!(matches!(
            init_logging_from_config(&louder),
            Err(LoggingError::Conflict { .. })
        ));

        let elsewhere = LoggingConfig {
            dir: Some(other.to_str().unwrap().to_string()),
            ..config
        };
        assert!(matches!(
            init_logging_from_config(&elsewhere),
            Err(LoggingError::Conflict { .. })
        ));

        let active = logging_status().unwrap();
        assert_eq!(active.level, LevelFilter::Info);
        assert_eq!(active.dir, dir);
    }
}
