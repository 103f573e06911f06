//! Shared logging setup and directory layout for Atlas binaries.
//!
//! Layout under `atlas_home()` (default `~/.atlas`, override with `ATLAS_HOME`):
//!
//! ```text
//! ~/.atlas/
//!   atlas.sqlite3      evidence store
//!   logs/<app>.log     rolling tracing output (5 x 10 MiB)
//! ```

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "atlas=info,atlas_server=info,atlas_engine=info,atlas_db=info";
const VERBOSE_LOG_FILTER: &str = "atlas=debug,atlas_server=debug,atlas_engine=debug,atlas_db=debug";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration shared by Atlas binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Mirror debug output to stderr.
    pub verbose: bool,
}

/// Initialize tracing with a rolling file writer and stderr output.
///
/// `RUST_LOG` wins over the defaults for both layers.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = SharedRollingWriter::open(&log_dir, config.app_name)
        .with_context(|| format!("Failed to open log file for {}", config.app_name))?;

    let file_filter = env_filter_or(DEFAULT_LOG_FILTER);
    let console_filter = if config.verbose {
        env_filter_or(VERBOSE_LOG_FILTER)
    } else {
        env_filter_or(DEFAULT_LOG_FILTER)
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Tracing subscriber already installed")?;

    Ok(())
}

fn env_filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Atlas home directory: `$ATLAS_HOME` or `~/.atlas`.
pub fn atlas_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("ATLAS_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".atlas")
}

/// Logs directory: `~/.atlas/logs`
pub fn logs_dir() -> PathBuf {
    atlas_home().join("logs")
}

/// Default evidence store location: `~/.atlas/atlas.sqlite3`
pub fn default_database_path() -> PathBuf {
    atlas_home().join("atlas.sqlite3")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Size-capped log file. On overflow `<app>.log` becomes `<app>.log.1`,
/// older generations shift up and the oldest beyond `keep` is dropped.
struct RotatingFile {
    dir: PathBuf,
    stem: String,
    keep: usize,
    limit: u64,
    file: Option<File>,
    written: u64,
}

impl RotatingFile {
    fn open(dir: &Path, app_name: &str, keep: usize, limit: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut rotating = Self {
            dir: dir.to_path_buf(),
            stem: sanitize_name(app_name),
            keep: keep.max(1),
            limit,
            file: None,
            written: 0,
        };
        rotating.reopen()?;
        if rotating.written > rotating.limit {
            rotating.rotate()?;
        }
        Ok(rotating)
    }

    fn generation(&self, index: usize) -> PathBuf {
        if index == 0 {
            self.dir.join(format!("{}.log", self.stem))
        } else {
            self.dir.join(format!("{}.log.{}", self.stem, index))
        }
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.generation(0))?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }

        let last = self.keep - 1;
        if last > 0 {
            let oldest = self.generation(last);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for index in (0..last).rev() {
                let from = self.generation(index);
                if from.exists() {
                    fs::rename(&from, self.generation(index + 1))?;
                }
            }
        }

        self.reopen()
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.limit {
            self.rotate()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// `MakeWriter` handing out cheap handles to one shared rotating file.
#[derive(Clone)]
struct SharedRollingWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl SharedRollingWriter {
    fn open(dir: &Path, app_name: &str) -> io::Result<Self> {
        let file = RotatingFile::open(dir, app_name, MAX_LOG_FILES, MAX_LOG_FILE_SIZE)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }

    fn with_file<T>(&self, f: impl FnOnce(&mut RotatingFile) -> io::Result<T>) -> io::Result<T> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        f(&mut guard)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedRollingWriter {
    type Writer = SharedRollingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for SharedRollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_file(|file| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_file(|file| file.flush())
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}
