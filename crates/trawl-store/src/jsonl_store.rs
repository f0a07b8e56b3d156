use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use trawl_core::error::AppError;
use trawl_core::models::CacheEntry;
use trawl_core::traits::CacheStore;

/// Dedup cache persisted as JSON lines, one [`CacheEntry`] per line.
///
/// Batches are appended; a snapshot rewrites the file through a sibling
/// temp file and a rename, so a crash mid-snapshot leaves the old file.
#[derive(Debug, Clone)]
pub struct JsonlCacheStore {
    path: PathBuf,
}

impl JsonlCacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "cache.jsonl".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn ensure_parent(&self) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl CacheStore for JsonlCacheStore {
    fn load(&self) -> Result<Vec<CacheEntry>, AppError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: CacheEntry = serde_json::from_str(&line).map_err(|e| {
                AppError::CacheIo(format!(
                    "{} line {}: {e}",
                    self.path.display(),
                    index + 1
                ))
            })?;
            entries.push(entry);
        }

        tracing::debug!(path = %self.path.display(), lines = entries.len(), "Cache file read");
        Ok(entries)
    }

    fn append(&self, entries: &[CacheEntry]) -> Result<(), AppError> {
        if entries.is_empty() {
            return Ok(());
        }
        let buf = encode_lines(entries)?;
        self.ensure_parent()?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }

    fn snapshot(&self, entries: &[CacheEntry]) -> Result<(), AppError> {
        let buf = encode_lines(entries)?;
        self.ensure_parent()?;

        let tmp = self.temp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        tracing::debug!(path = %self.path.display(), entries = entries.len(), "Cache snapshot written");
        Ok(())
    }
}

fn encode_lines(entries: &[CacheEntry]) -> Result<Vec<u8>, AppError> {
    let mut buf = Vec::with_capacity(entries.len() * 256);
    for entry in entries {
        serde_json::to_writer(&mut buf, entry)?;
        buf.push(b'\n');
    }
    Ok(buf)
}
