use crate::common::config::LoggerConfig;
use log::{info, LevelFilter, SetLoggerError};
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::filter::threshold::ThresholdFilter;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

const FILE_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}\n";
const CONSOLE_PATTERN: &str = "{d(%H:%M:%S)} {h({l:<5})} {m}\n";

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Invalid archive pattern '{0}': {1}")]
    ArchivePattern(String, String),
    #[error("Invalid logger configuration: {0}")]
    InvalidConfig(String),
    #[error("A logger is already installed: {0}")]
    AlreadySet(#[from] SetLoggerError),
}

/// Unknown level names fall back to `Info`.
pub fn level_filter(level: &str) -> LevelFilter {
    LevelFilter::from_str(level).unwrap_or(LevelFilter::Info)
}

/// Installs the global logger: every record goes to the rolling log file,
/// records at or above the configured level also go to stderr.
pub fn setup_logger(config: &LoggerConfig) -> Result<log4rs::Handle, LoggerError> {
    let level = level_filter(&config.level);

    let runtime_config = Config::builder()
        .appender(Appender::builder().build("logfile", Box::new(file_appender(config)?)))
        .appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(level)))
                .build("stderr", Box::new(console_appender())),
        )
        .build(
            Root::builder()
                .appender("logfile")
                .appender("stderr")
                .build(level),
        )
        .map_err(|e| LoggerError::InvalidConfig(e.to_string()))?;

    let handle = log4rs::init_config(runtime_config)?;

    info!(
        "Logging at {} to '{}' ({} x {} MB, archive '{}')",
        level, config.path, config.file_count, config.file_size, config.archive_pattern
    );
    Ok(handle)
}

fn console_appender() -> ConsoleAppender {
    ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(CONSOLE_PATTERN)))
        .build()
}

/// Size-triggered rotation into `archive_pattern`, keeping `file_count` archives.
fn file_appender(config: &LoggerConfig) -> Result<RollingFileAppender, LoggerError> {
    let roller = FixedWindowRoller::builder()
        .base(0)
        .build(&config.archive_pattern, config.file_count)
        .map_err(|e| LoggerError::ArchivePattern(config.archive_pattern.clone(), e.to_string()))?;
    let policy = CompoundPolicy::new(
        Box::new(SizeTrigger::new(config.file_size * BYTES_PER_MB)),
        Box::new(roller),
    );

    if let Some(parent) = Path::new(&config.path).parent() {
        fs::create_dir_all(parent)?;
    }

    Ok(RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(FILE_PATTERN)))
        .build(&config.path, Box::new(policy))?)
}
