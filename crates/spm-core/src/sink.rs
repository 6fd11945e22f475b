//! Append-only record of published command batches.
//!
//! The CSV sink writes one row per command with the columns
//! `tick,siteId,vehicleId,powerInKW,extra`, where `extra` holds any other
//! fields of the command as compact JSON. The file is opened lazily at the
//! first non-empty batch, and the header is written only if the file is
//! empty at that point, so a restarted run keeps appending to one table.
//!
//! Sink failures never stop a federate; the coordinator logs and moves on.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use spm_types::{CommandBatch, Tick};
use tracing::{debug, info};

/// Column header of the command table.
pub const HEADER: [&str; 5] = ["tick", "siteId", "vehicleId", "powerInKW", "extra"];

/// Errors raised while recording a batch.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The output file could not be created or written.
    #[error("sink I/O error on {path}: {source}")]
    Io {
        /// File being written.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The CSV writer failed.
    #[error("CSV write failed: {0}")]
    Csv(#[from] csv::Error),

    /// A command's extra fields could not be serialized.
    #[error("failed to encode extra fields: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for every non-empty batch a federate publishes.
pub trait CommandSink: Send {
    /// Record `batch` as the output of `tick`. Empty batches are ignored.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] if the batch could not be written.
    fn append(&mut self, tick: Tick, batch: &CommandBatch) -> Result<(), SinkError>;
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl CommandSink for NullSink {
    fn append(&mut self, _tick: Tick, _batch: &CommandBatch) -> Result<(), SinkError> {
        Ok(())
    }
}

/// CSV file sink for one federate.
#[derive(Debug)]
pub struct CsvCommandSink {
    path: PathBuf,
    writer: Option<csv::Writer<BufWriter<File>>>,
    rows: u64,
}

impl CsvCommandSink {
    /// Create a sink writing to `path`. Nothing touches the filesystem
    /// until the first non-empty batch.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            rows: 0,
        }
    }

    /// Path of the output file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written by this sink instance.
    pub const fn rows_written(&self) -> u64 {
        self.rows
    }
}

impl CommandSink for CsvCommandSink {
    fn append(&mut self, tick: Tick, batch: &CommandBatch) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => open(&self.path)?,
        };
        let writer = self.writer.insert(writer);
        write_rows(writer, tick, batch)?;
        writer.flush().map_err(|source| SinkError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.rows = self
            .rows
            .saturating_add(u64::try_from(batch.len()).unwrap_or(u64::MAX));
        debug!(tick, rows = batch.len(), path = %self.path.display(), "recorded batch");
        Ok(())
    }
}

fn open(path: &Path) -> Result<csv::Writer<BufWriter<File>>, SinkError> {
    let io_err = |source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    let fresh = file.metadata().map_err(io_err)?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(BufWriter::new(file));
    if fresh {
        writer.write_record(HEADER)?;
    }
    info!(path = %path.display(), fresh, "opened command sink");
    Ok(writer)
}

/// Write one row per command of `batch` to `writer`.
///
/// # Errors
///
/// Returns a [`SinkError`] if a row cannot be encoded or written.
pub fn write_rows<W: Write>(
    writer: &mut csv::Writer<W>,
    tick: Tick,
    batch: &CommandBatch,
) -> Result<(), SinkError> {
    let tick = tick.to_string();
    for command in batch.records() {
        let extra = serde_json::to_string(&command.extra)?;
        writer.write_record([
            tick.as_str(),
            command.site_id.as_str(),
            command.vehicle_id.as_str(),
            command.power_in_kw.to_string().as_str(),
            extra.as_str(),
        ])?;
    }
    Ok(())
}
