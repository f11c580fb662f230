//! Shared tracing setup for Fileflow binaries.
//!
//! Logs go to a size-rotated file under the fileflow home directory and
//! to stderr. Library crates only emit `tracing` events; this is the one
//! place a subscriber is installed.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "fileflow=info";
const KEPT_ROTATIONS: usize = 4;
const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Logging options for a binary.
pub struct LogOptions<'a> {
    pub app_name: &'a str,
    /// Mirror the file-level filter to stderr instead of warn-and-up.
    pub verbose: bool,
}

/// Install the global subscriber: rotating file layer plus stderr layer.
pub fn init(options: LogOptions<'_>) -> Result<()> {
    let dir = ensure_log_dir().context("failed to create log directory")?;
    let writer = RollingWriter::open(dir.join(format!("{}.log", options.app_name)))
        .context("failed to open log file")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let stderr_filter = if options.verbose {
        file_filter.to_string()
    } else {
        "warn".to_string()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(EnvFilter::new(stderr_filter)),
        )
        .init();

    Ok(())
}

/// Home directory for logs and local state: `~/.fileflow`, or
/// `FILEFLOW_HOME` when set.
pub fn fileflow_home() -> PathBuf {
    if let Ok(overridden) = std::env::var("FILEFLOW_HOME") {
        return PathBuf::from(overridden);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fileflow")
}

fn ensure_log_dir() -> Result<PathBuf> {
    let dir = fileflow_home().join("logs");
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    Ok(dir)
}

struct RollingState {
    path: PathBuf,
    file: File,
    written: u64,
}

impl RollingState {
    fn open(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            written,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        let _ = self.file.flush();
        for index in (1..KEPT_ROTATIONS).rev() {
            let from = self.rotation_path(index);
            if from.exists() {
                fs::rename(&from, self.rotation_path(index + 1))?;
            }
        }
        if self.path.exists() {
            fs::rename(&self.path, self.rotation_path(1))?;
        }
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }

    fn rotation_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }
}

/// Size-rotated log writer shared across subscriber layers.
#[derive(Clone)]
pub struct RollingWriter {
    state: Arc<Mutex<RollingState>>,
}

impl RollingWriter {
    pub fn open(path: PathBuf) -> Result<Self> {
        let state = RollingState::open(path).context("failed to open rolling log")?;
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }
}

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        if state.written + buf.len() as u64 > MAX_LOG_BYTES {
            state.rotate()?;
        }
        let bytes = state.file.write(buf)?;
        state.written += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        state.file.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RollingWriter {
    type Writer = RollingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_land_in_the_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fileflow.log");
        let mut writer = RollingWriter::open(path.clone()).unwrap();
        writer.write_all(b"hello\n").unwrap();
        writer.flush().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello\n");
    }

    #[test]
    fn rotation_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fileflow.log");
        let writer = RollingWriter::open(path.clone()).unwrap();
        {
            let mut state = writer.state.lock().unwrap();
            state.file.write_all(b"old contents\n").unwrap();
            state.rotate().unwrap();
        }
        assert!(path.exists());
        assert!(dir.path().join("fileflow.log.1").exists());
    }
}
