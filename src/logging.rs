//! File logging with rotation and console-mirrored warnings.
//!
//! Log output goes to a rotating file so scenario stdout stays clean for the
//! rendered document; warnings are additionally echoed to stderr so authors
//! see them without tailing the log.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

pub const DEFAULT_LOG_FILE: &str = "ie.log";
const MAX_LOG_SNAPSHOTS: usize = 5;

/// Logging levels accepted by `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    fn filter(self) -> log::LevelFilter {
        match self {
            Level::Trace => log::LevelFilter::Trace,
            Level::Debug => log::LevelFilter::Debug,
            Level::Info => log::LevelFilter::Info,
            Level::Warn => log::LevelFilter::Warn,
            // `log` has no fatal level; both map to error.
            Level::Error | Level::Fatal => log::LevelFilter::Error,
        }
    }
}

/// Install the global logger. Failure to open the log file downgrades to
/// stderr logging with a warning instead of aborting the run.
pub fn init(level: Level, log_path: &str) {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level.filter())
        .format_timestamp_millis();

    let mut fallback_warning = None;
    match configure_log_writer(log_path) {
        Ok(Some(file)) => {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
        Ok(None) => {}
        Err(err) => {
            fallback_warning = Some(format!(
                "Failed to configure log file '{log_path}', using stderr: {err:#}"
            ));
        }
    }

    let inner = builder.build();
    let max_level = inner.filter();
    if log::set_boxed_logger(Box::new(WarnMirror { inner })).is_ok() {
        log::set_max_level(max_level);
    }

    if let Some(warning) = fallback_warning {
        log::warn!("{warning}");
    }
}

fn configure_log_writer(log_path: &str) -> Result<Option<File>> {
    let path = log_path.trim();
    if path.is_empty() {
        return Ok(None);
    }

    ensure_log_directory(path)?;
    rotate_logs(path, MAX_LOG_SNAPSHOTS)?;

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("open log file '{path}'"))?;
    Ok(Some(file))
}

fn ensure_log_directory(path: &str) -> Result<()> {
    if let Some(dir) = Path::new(path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log directory '{}'", dir.display()))?;
        }
    }
    Ok(())
}

/// Shift `base`, `base.1`, ... down one slot, dropping the oldest snapshot.
fn rotate_logs(base_path: &str, max_snapshots: usize) -> Result<()> {
    if max_snapshots <= 1 {
        return Ok(());
    }

    let oldest = format!("{}.{}", base_path, max_snapshots - 1);
    remove_if_present(&oldest)?;

    for index in (1..=max_snapshots.saturating_sub(2)).rev() {
        let src = format!("{base_path}.{index}");
        let dst = format!("{}.{}", base_path, index + 1);
        rename_if_present(&src, &dst)?;
    }

    rename_if_present(base_path, &format!("{base_path}.1"))?;
    Ok(())
}

fn remove_if_present(path: &str) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove log snapshot '{path}'")),
    }
}

fn rename_if_present(src: &str, dst: &str) -> Result<()> {
    match std::fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("rotate log '{src}' to '{dst}'")),
    }
}

/// Delegates to env_logger for filtering and file output while echoing
/// warnings to stderr in orange (yellow when 256 colors are unlikely).
struct WarnMirror {
    inner: env_logger::Logger,
}

impl log::Log for WarnMirror {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if record.level() == log::Level::Warn && self.inner.matches(record) {
            let color = if supports_256_color() {
                "\x1b[38;5;208m"
            } else {
                "\x1b[33m"
            };
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{color}WARNING: {}\x1b[0m", record.args());
        }
        self.inner.log(record);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

fn supports_256_color() -> bool {
    let term = std::env::var("TERM").unwrap_or_default();
    let colorterm = std::env::var("COLORTERM").unwrap_or_default();
    term.contains("256color") || colorterm.contains("truecolor")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_shifts_snapshots_and_drops_the_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("ie.log");
        let base_str = base.to_str().unwrap();

        std::fs::write(&base, "current").unwrap();
        std::fs::write(format!("{base_str}.1"), "one").unwrap();
        std::fs::write(format!("{base_str}.4"), "four").unwrap();

        rotate_logs(base_str, MAX_LOG_SNAPSHOTS).unwrap();

        assert!(!base.exists());
        assert_eq!(
            std::fs::read_to_string(format!("{base_str}.1")).unwrap(),
            "current"
        );
        assert_eq!(
            std::fs::read_to_string(format!("{base_str}.2")).unwrap(),
            "one"
        );
        // The oldest slot was deleted, not shifted further.
        assert!(!Path::new(&format!("{base_str}.5")).exists());
        assert!(!Path::new(&format!("{base_str}.4")).exists());
    }

    #[test]
    fn rotation_handles_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("ie.log");
        rotate_logs(base.to_str().unwrap(), MAX_LOG_SNAPSHOTS).unwrap();
        assert!(!base.exists());
    }
}
