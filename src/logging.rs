//! Tracing initialization: stderr output plus a daily rolling file under
//! the data directory (`logs/nightshift_YYYYMMDD.log`).

use crate::{NightshiftError, Result};
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Append-mode writer that reopens `nightshift_YYYYMMDD.log` when the UTC
/// date changes.
struct DailyLogFile {
    dir: PathBuf,
    current_date: String,
    file: File,
}

impl DailyLogFile {
    fn open(dir: &Path) -> io::Result<Self> {
        let date = Utc::now().format("%Y%m%d").to_string();
        let file = Self::open_dated(dir, &date)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            current_date: date,
            file,
        })
    }

    fn open_dated(dir: &Path, date: &str) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("nightshift_{date}.log")))
    }
}

impl Write for DailyLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let date = Utc::now().format("%Y%m%d").to_string();
        if date != self.current_date {
            self.file = Self::open_dated(&self.dir, &date)?;
            self.current_date = date;
        }
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Install the global subscriber. The returned guard must be held for the
/// life of the process or buffered file output is lost.
pub fn init(logs_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)
        .map_err(|e| NightshiftError::Configuration(format!("logs dir: {e}")))?;
    let daily = DailyLogFile::open(logs_dir)
        .map_err(|e| NightshiftError::Configuration(format!("log file: {e}")))?;
    let (file_writer, guard) = tracing_appender::non_blocking(daily);

    let filter = EnvFilter::try_from_env("NIGHTSHIFT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();

    Ok(guard)
}
