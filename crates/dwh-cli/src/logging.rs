//! Subscriber setup for the controller process.
//!
//! The level comes from `--log-level`, then `DWH_LOG`, then defaults to `info`.
//! Output goes to stderr so the JSON printed by one-shot commands stays clean.

use clap::ValueEnum;
use tracing::Level;

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init_logging(cli_level: Option<LogLevel>) {
    let env_level = std::env::var("DWH_LOG").ok();
    tracing_subscriber::fmt()
        .with_max_level(resolve_level(cli_level, env_level.as_deref()))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_level(cli_level: Option<LogLevel>, env_level: Option<&str>) -> Level {
    match cli_level {
        Some(level) => level.into(),
        None => env_level.and_then(parse_level).unwrap_or(Level::INFO),
    }
}

fn parse_level(raw: &str) -> Option<Level> {
    match raw.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}
