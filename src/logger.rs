//! Session logger: routes `tracing` output to a single file in the OS data
//! directory.
//!
//! The file is **truncated at each launch**, so it only ever contains output
//! from the most recent session.
//!
//! Log location:
//!   Windows:  `%APPDATA%\layerbrush\layerbrush.log`
//!   Linux:    `~/.local/share/layerbrush/layerbrush.log`
//!   macOS:    `~/Library/Application Support/layerbrush/layerbrush.log`
//!
//! The filter comes from `LAYERBRUSH_LOG` when set (standard `EnvFilter`
//! syntax), otherwise from the configured level.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

pub const LOG_ENV: &str = "LAYERBRUSH_LOG";

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

#[derive(Clone, Debug)]
pub struct LogOptions {
    /// Default filter directive, e.g. `info` or `layerbrush=debug`.
    pub level: String,
    /// Also print to stderr.
    pub stderr: bool,
    /// Override the log file location.
    pub file: Option<PathBuf>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self { level: "info".to_string(), stderr: false, file: None }
    }
}

/// Returns the path to the current session log file.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

/// Install the global subscriber. Safe to call more than once; only the
/// first call takes effect.
///
/// * Creates (or truncates) the log file. If it cannot be opened, logging
///   goes to stderr only.
/// * Installs a panic hook that records the panic before the default
///   handler runs.
pub fn init(options: &LogOptions) {
    let path = options.file.clone().unwrap_or_else(log_file_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let file = OpenOptions::new().create(true).write(true).truncate(true).open(&path);
    let (file_layer, open_error) = match file {
        Ok(f) => (Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(f))), None),
        Err(e) => (None, Some(e)),
    };
    let stderr_layer = (options.stderr || open_error.is_some())
        .then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(&options.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .is_ok();
    if !installed {
        return;
    }

    match open_error {
        None => {
            let _ = LOG_PATH.set(path.clone());
            info!(file = %path.display(), "layerbrush session started");
        }
        Some(e) => error!(file = %path.display(), error = %e, "cannot open log file"),
    }

    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("PANIC: {}", info);
        prev(info);
    }));
}

fn log_file_path() -> PathBuf {
    data_dir().join("layerbrush").join("layerbrush.log")
}

/// Platform data directory (without the app sub-folder).
pub fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata);
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library").join("Application Support");
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    PathBuf::from(".")
}
