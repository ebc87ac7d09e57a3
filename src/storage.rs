//! Reading storage.
//!
//! [`CsvReadingStore`] appends one CSV line per reading to a file created at
//! session start. Every line is flushed so a crash loses at most the reading
//! being written.

use chrono::Local;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::data::Reading;
use crate::error::{Error, Result};
use crate::session::ReadingConsumer;

/// CSV file of readings, usable as a session consumer.
pub struct CsvReadingStore {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl CsvReadingStore {
    /// Create `readings_<local timestamp>.txt` in `dir` and write the header.
    pub fn create_in(dir: impl AsRef<Path>) -> Result<Self> {
        let stamp = Local::now()
            .format("%Y-%m-%dT%H:%M:%S%.6f")
            .to_string()
            .replace(':', "-");
        Self::create(dir.as_ref().join(format!("readings_{}.txt", stamp)))
    }

    /// Open the file at `path` for appending, creating it if needed.
    ///
    /// The header is written only when the file is empty; existing lines are
    /// never truncated.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let is_empty = file.metadata()?.len() == 0;

        let mut writer = BufWriter::new(file);
        if is_empty {
            writeln!(writer, "{}", Reading::csv_header())?;
            writer.flush()?;
        }

        info!("Recording readings to {}", path.display());

        Ok(Self {
            path,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the store has been closed.
    pub fn is_closed(&self) -> bool {
        self.writer.lock().is_none()
    }

    /// Append one reading and flush it.
    pub fn append(&self, reading: &Reading) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(Error::StorageClosed)?;
        writeln!(writer, "{}", reading.csv_line())?;
        writer.flush()?;
        Ok(())
    }

    /// Flush and release the file. Later appends fail with
    /// [`Error::StorageClosed`]; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().take() {
            writer.flush()?;
            debug!("Closed {}", self.path.display());
        }
        Ok(())
    }
}

impl ReadingConsumer for CsvReadingStore {
    fn consume(&self, reading: &Reading) -> Result<()> {
        self.append(reading)
    }

    fn close(&self) -> Result<()> {
        CsvReadingStore::close(self)
    }

    fn name(&self) -> &'static str {
        "csv-store"
    }
}
