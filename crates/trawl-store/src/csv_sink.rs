use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::SecondsFormat;
use trawl_core::error::AppError;
use trawl_core::models::Record;
use trawl_core::traits::ResultSink;

const LEADING_COLUMNS: [&str; 2] = ["target", "url"];
const TRAILING_COLUMNS: [&str; 2] = ["content_hash", "extracted_at"];

/// Byte storage under a [`CsvSink`].
trait RowFile: Write + Send {
    fn size(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl RowFile for File {
    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

type SharedFile = Arc<Mutex<Box<dyn RowFile>>>;

/// Append-only CSV output with a header fixed for the lifetime of the sink.
///
/// Columns are `target,url,<fields...>,content_hash,extracted_at`. A field
/// missing from a record is written empty; fields not in the header are
/// dropped.
///
/// Each append is written and synced on the blocking pool before it
/// returns. A failed write is cut back to the previous file length, so the
/// file only ever holds whole rows.
pub struct CsvSink {
    path: PathBuf,
    fields: Vec<String>,
    file: SharedFile,
    rows: AtomicU64,
}

impl CsvSink {
    /// Open `path` for appending, writing the header if the file is new or
    /// empty. An existing file with a different header is rejected.
    pub fn create(path: impl Into<PathBuf>, fields: &[&str]) -> Result<Self, AppError> {
        let path = path.into();
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        let header = header_for(&fields);

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| sink_error(&path, e))?;
        }

        let existing = match std::fs::metadata(&path) {
            Ok(meta) => meta.len() > 0,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(sink_error(&path, e)),
        };
        if existing {
            check_header(&path, &header)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| sink_error(&path, e))?;

        if !existing {
            let bytes = encode_row(&header)?;
            append_whole(&mut file, &bytes).map_err(|e| sink_error(&path, e))?;
        }

        tracing::info!(path = %path.display(), appending = existing, "CSV sink opened");
        Ok(Self {
            path,
            fields,
            file: Arc::new(Mutex::new(Box::new(file))),
            rows: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full header row, in column order.
    pub fn header(&self) -> Vec<String> {
        header_for(&self.fields)
    }

    /// Rows appended through this sink (the header excluded).
    pub fn rows_written(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    fn row_for(&self, record: &Record) -> Vec<String> {
        let mut row = Vec::with_capacity(self.fields.len() + 4);
        row.push(record.target.clone());
        row.push(record.url.clone());
        for field in &self.fields {
            row.push(record.fields.get(field).cloned().unwrap_or_default());
        }
        row.push(record.content_hash.clone());
        row.push(
            record
                .extracted_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        row
    }

    /// Run `op` against the file on the blocking pool.
    async fn with_file<T, F>(&self, op: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn RowFile) -> io::Result<T> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock_file(&file);
            op(&mut **guard)
        })
        .await
        .map_err(|e| AppError::SinkError(format!("CSV write task failed: {e}")))?
        .map_err(|e| sink_error(&self.path, e))
    }

    #[cfg(test)]
    fn with_row_file(mut self, file: impl RowFile + 'static) -> Self {
        self.file = Arc::new(Mutex::new(Box::new(file)));
        self
    }
}

impl ResultSink for CsvSink {
    async fn append(&self, record: &Record) -> Result<(), AppError> {
        let bytes = encode_row(&self.row_for(record))?;
        self.with_file(move |file| append_whole(file, &bytes))
            .await?;
        self.rows.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn finish(&self) -> Result<(), AppError> {
        self.with_file(|file| {
            file.flush()?;
            file.sync()
        })
        .await?;
        tracing::info!(path = %self.path.display(), rows = self.rows_written(), "CSV output synced");
        Ok(())
    }
}

fn lock_file(file: &SharedFile) -> MutexGuard<'_, Box<dyn RowFile>> {
    file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write `bytes` and sync, or leave the file at its previous length.
fn append_whole(file: &mut dyn RowFile, bytes: &[u8]) -> io::Result<()> {
    let before = file.size()?;
    let written = file
        .write_all(bytes)
        .and_then(|()| file.flush())
        .and_then(|()| file.sync());

    if let Err(e) = written {
        if let Err(cut) = file.truncate(before) {
            tracing::error!(error = %cut, "Failed to remove partial CSV row");
        }
        return Err(e);
    }
    Ok(())
}

fn header_for(fields: &[String]) -> Vec<String> {
    LEADING_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(fields.iter().cloned())
        .chain(TRAILING_COLUMNS.iter().map(|c| c.to_string()))
        .collect()
}

fn check_header(path: &Path, expected: &[String]) -> Result<(), AppError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(|e| AppError::SinkError(format!("{}: {e}", path.display())))?;

    let mut first = csv::StringRecord::new();
    let found = reader
        .read_record(&mut first)
        .map_err(|e| AppError::SinkError(format!("{}: {e}", path.display())))?;

    if !found || first.iter().ne(expected.iter().map(String::as_str)) {
        return Err(AppError::SinkError(format!(
            "{} has header [{}], expected [{}]",
            path.display(),
            first.iter().collect::<Vec<_>>().join(","),
            expected.join(",")
        )));
    }
    Ok(())
}

fn encode_row(row: &[String]) -> Result<Vec<u8>, AppError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(row)
        .map_err(|e| AppError::SinkError(e.to_string()))?;
    writer
        .into_inner()
        .map_err(|e| AppError::SinkError(e.to_string()))
}

fn sink_error(path: &Path, e: std::io::Error) -> AppError {
    AppError::SinkError(format!("{}: {e}", path.display()))
}
