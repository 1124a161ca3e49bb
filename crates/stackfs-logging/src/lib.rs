// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging setup for StackFS binaries
//!
//! Libraries in the workspace only emit `tracing` events; binaries pick where
//! they go with [`CliLoggingArgs`] or one of the `init*` functions below.
//! `RUST_LOG` always overrides the default level.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Re-exported so binaries flattening CliLoggingArgs share our clap version
pub use clap;

pub use tracing::Level;

/// Output format for log messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines, with file and line numbers in debug builds
    #[default]
    Plaintext,
    /// One JSON object per event, fields included
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Plaintext => write!(f, "plaintext"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plaintext" => Ok(LogFormat::Plaintext),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Invalid log format: {s}. Use 'plaintext' or 'json'")),
        }
    }
}

/// Log level accepted by `--log-level`
///
/// Converts into [`Level`]; the level only sets the default filter, so
/// `RUST_LOG` still takes precedence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CliLogLevel {
    /// Only error conditions, including fd consistency faults
    Error,
    /// Errors and warnings
    Warn,
    /// Errors, warnings, and informational messages
    #[default]
    Info,
    /// All above plus table growth and lookup misses
    Debug,
    /// All above plus per-fd lifecycle events
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

/// Logging flags for `#[command(flatten)]`.
///
/// Output goes to stdout unless `--log-file` or `--log-dir` is given.
#[derive(Clone, Debug, Default, clap::Args, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CliLoggingArgs {
    /// Log verbosity level
    #[arg(long, value_enum, help = "Log verbosity level (default: info)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<CliLogLevel>,

    /// Log output format
    #[arg(long, value_enum, help = "Log output format (default: plaintext)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<LogFormat>,

    /// Directory for log files
    #[arg(long, help = "Directory for log files")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,

    /// Log filename, absolute or relative to `log_dir`
    #[arg(long, help = "Log filename")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

impl CliLoggingArgs {
    /// Install the global subscriber described by these flags.
    ///
    /// `component` names the log file and the crate target that gets the
    /// default level, e.g. `"stackfs-fd-stress"`. Fails if a global
    /// subscriber is already set or the log file cannot be opened.
    ///
    /// ```no_run
    /// use clap::Parser;
    /// use stackfs_logging::CliLoggingArgs;
    ///
    /// #[derive(Parser)]
    /// struct Args {
    ///     #[command(flatten)]
    ///     logging: CliLoggingArgs,
    /// }
    ///
    /// fn main() -> anyhow::Result<()> {
    ///     let args = Args::parse();
    ///     args.logging.init("my-tool")?;
    ///     Ok(())
    /// }
    /// ```
    pub fn init(self, component: &str) -> anyhow::Result<()> {
        let level = self.log_level.unwrap_or_default().into();
        let format = self.log_format.unwrap_or_default();
        if self.logs_to_file() {
            let path = self.resolve_log_path(component);
            init_to_file(component, level, format, &path)
        } else {
            init(component, level, format)
        }
    }

    /// Whether [`init`](Self::init) will write to a file rather than stdout.
    pub fn logs_to_file(&self) -> bool {
        self.log_file.is_some() || self.log_dir.is_some()
    }

    /// Absolute `--log-file` wins; otherwise the file name is placed under
    /// `--log-dir`, falling back to the platform log directory.
    pub fn resolve_log_path(&self, component: &str) -> PathBuf {
        let file = match &self.log_file {
            Some(file) if Path::new(file).is_absolute() => return PathBuf::from(file),
            Some(file) => PathBuf::from(file),
            None => PathBuf::from(format!("{component}.log")),
        };
        match &self.log_dir {
            Some(dir) => Path::new(dir).join(file),
            None if self.log_file.is_some() => file,
            None => get_standard_log_path_for_component(component),
        }
    }
}

/// Platform log location:
/// - macOS: ~/Library/Logs/stackfs.log
/// - Linux: ~/.local/share/stackfs/stackfs.log
/// - other: ~/stackfs.log
pub fn get_standard_log_path() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        path.push("Library");
        path.push("Logs");
        path.push("stackfs.log");
        path
    }

    #[cfg(target_os = "linux")]
    {
        let mut path = dirs::data_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp")));
        path.push("stackfs");
        path.push("stackfs.log");
        path
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        path.push("stackfs.log");
        path
    }
}

/// `<component>.log` next to [`get_standard_log_path`].
pub fn get_standard_log_path_for_component(component: &str) -> PathBuf {
    let base = get_standard_log_path();
    let parent = base.parent().unwrap_or(Path::new("/tmp"));
    parent.join(format!("{component}.log"))
}

/// Log to stdout.
pub fn init(component: &str, default_level: Level, format: LogFormat) -> anyhow::Result<()> {
    init_with_writer(component, default_level, format, io::stdout)
}

/// Log to `log_path`, creating parent directories and appending to an
/// existing file.
pub fn init_to_file(
    component: &str,
    default_level: Level,
    format: LogFormat,
    log_path: &Path,
) -> anyhow::Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::OpenOptions::new().create(true).append(true).open(log_path)?;
    init_with_writer(component, default_level, format, log_file)
}

/// Install a global subscriber that writes through `writer`.
///
/// Every `init*` entry point ends here.
pub fn init_with_writer<W>(
    component: &str,
    default_level: Level,
    format: LogFormat,
    writer: W,
) -> anyhow::Result<()>
where
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = default_filter(component, default_level);

    match format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).json();
            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer);
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);
            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
    }

    Ok(())
}

fn default_filter(component: &str, default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Crate targets use underscores even when the component name has dashes.
        let target = component.replace('-', "_");
        EnvFilter::new(format!(
            "{default_level},{target}={default_level},stackfs_fd={default_level}"
        ))
    })
}
