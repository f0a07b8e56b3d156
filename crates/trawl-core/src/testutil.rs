//! Hand-written fakes for every collaborator trait of the pool.
//!
//! Clones share their state through `Arc`, so a test keeps one handle for
//! assertions and gives the other to the code under test.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::error::AppError;
use crate::models::{CacheEntry, Identity, Record, Target, compute_hash};
use crate::traits::{CacheStore, FetcherFactory, PageFetcher, RecordExtractor, ResultSink};
use crate::worker::{WorkerEvent, WorkerReporter};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

type Script = VecDeque<Result<String, AppError>>;

/// Mock fetcher with per-target scripted responses.
///
/// Each call for a target pops the next scripted result; once a target's
/// script is empty (or it never had one) the default HTML is returned.
/// Clones share scripts and call counts.
#[derive(Clone)]
pub struct MockFetcher {
    default_html: String,
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    calls: Arc<Mutex<HashMap<String, usize>>>,
    identities: Arc<Mutex<Vec<Identity>>>,
    delay: Option<Duration>,
}

impl MockFetcher {
    pub fn new(html: &str) -> Self {
        Self {
            default_html: html.to_string(),
            scripts: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(HashMap::new())),
            identities: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }

    /// Script the results for one target key.
    pub fn with_script(self, key: &str, responses: Vec<Result<String, AppError>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(key.to_string(), responses.into());
        self
    }

    /// Make every fetch take `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    /// Identities presented, in call order.
    pub fn identities(&self) -> Vec<Identity> {
        self.identities.lock().unwrap().clone()
    }
}

impl PageFetcher for MockFetcher {
    async fn fetch(
        &self,
        target: &Target,
        identity: &Identity,
        _timeout: Duration,
    ) -> Result<String, AppError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(target.key().to_string())
            .or_default() += 1;
        self.identities.lock().unwrap().push(identity.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(target.key())
            .and_then(|script| script.pop_front());
        scripted.unwrap_or_else(|| Ok(self.default_html.clone()))
    }
}

// ---------------------------------------------------------------------------
// MockFetcherFactory
// ---------------------------------------------------------------------------

/// Factory handing out clones of one MockFetcher and counting creations.
#[derive(Clone)]
pub struct MockFetcherFactory {
    fetcher: MockFetcher,
    created: Arc<AtomicUsize>,
    create_error: Option<String>,
}

impl MockFetcherFactory {
    pub fn new(fetcher: MockFetcher) -> Self {
        Self {
            fetcher,
            created: Arc::new(AtomicUsize::new(0)),
            create_error: None,
        }
    }

    /// Factory whose every `create` fails with `FetcherFatal`.
    pub fn failing(message: &str) -> Self {
        Self {
            fetcher: MockFetcher::new(""),
            created: Arc::new(AtomicUsize::new(0)),
            create_error: Some(message.to_string()),
        }
    }

    /// Number of fetchers handed out so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl FetcherFactory for MockFetcherFactory {
    type Fetcher = MockFetcher;

    async fn create(&self) -> Result<MockFetcher, AppError> {
        if let Some(message) = &self.create_error {
            return Err(AppError::FetcherFatal(message.clone()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.fetcher.clone())
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Mock extractor that stores the raw content as the `body` field.
#[derive(Clone, Default)]
pub struct MockExtractor {
    failing_keys: Arc<Vec<String>>,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extraction fails for the given target key.
    pub fn failing_for(key: &str) -> Self {
        Self {
            failing_keys: Arc::new(vec![key.to_string()]),
        }
    }
}

impl RecordExtractor for MockExtractor {
    fn extract(&self, target: &Target, raw_content: &str) -> Result<Record, AppError> {
        if self.failing_keys.iter().any(|k| k == target.key()) {
            return Err(AppError::ExtractionError(format!(
                "no title found for {}",
                target.key()
            )));
        }
        Ok(Record::new(target, raw_content).with_field("body", raw_content))
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// Sink that keeps records in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<Record>>>,
    finished: Arc<AtomicUsize>,
    append_error: Arc<Mutex<Option<AppError>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink whose next append fails.
    pub fn with_append_error(error: AppError) -> Self {
        Self {
            append_error: Arc::new(Mutex::new(Some(error))),
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    pub fn finish_calls(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl ResultSink for MemorySink {
    async fn append(&self, record: &Record) -> Result<(), AppError> {
        if let Some(e) = self.append_error.lock().unwrap().take() {
            return Err(e);
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn finish(&self) -> Result<(), AppError> {
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Cache store backed by a Vec, with write-failure injection.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<Vec<CacheEntry>>>,
    load_error: Arc<Mutex<Option<AppError>>>,
    failing_writes: Arc<AtomicUsize>,
    append_calls: Arc<AtomicUsize>,
    snapshot_calls: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn with_entries(entries: Vec<CacheEntry>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(entries)),
            ..Self::default()
        }
    }

    /// Store whose `load` fails once.
    pub fn with_load_error(error: AppError) -> Self {
        Self {
            load_error: Arc::new(Mutex::new(Some(error))),
            ..Self::default()
        }
    }

    /// Make the next `n` writes (append or snapshot) fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Everything currently persisted, in write order.
    pub fn persisted(&self) -> Vec<CacheEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    pub fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    fn injected_failure(&self) -> Result<(), AppError> {
        let failed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(AppError::CacheIo("injected write failure".into()))
        } else {
            Ok(())
        }
    }
}

impl CacheStore for MemoryStore {
    fn load(&self) -> Result<Vec<CacheEntry>, AppError> {
        if let Some(e) = self.load_error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(self.entries.lock().unwrap().clone())
    }

    fn append(&self, entries: &[CacheEntry]) -> Result<(), AppError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        self.entries.lock().unwrap().extend_from_slice(entries);
        Ok(())
    }

    fn snapshot(&self, entries: &[CacheEntry]) -> Result<(), AppError> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        *self.entries.lock().unwrap() = entries.to_vec();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock worker reporter that records event labels.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let label = match &event {
            WorkerEvent::Started { .. } => "Started",
            WorkerEvent::JobSkipped { .. } => "JobSkipped",
            WorkerEvent::JobStarted { .. } => "JobStarted",
            WorkerEvent::JobSucceeded { .. } => "JobSucceeded",
            WorkerEvent::RetryScheduled { .. } => "RetryScheduled",
            WorkerEvent::JobFailed { .. } => "JobFailed",
            WorkerEvent::JobReleased { .. } => "JobReleased",
            WorkerEvent::FetcherRestarted { .. } => "FetcherRestarted",
            WorkerEvent::Stopped { .. } => "Stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Create a dummy Record for the given target key.
pub fn make_test_record(key: &str) -> Record {
    Record {
        target: key.to_string(),
        url: format!("https://github.com/{key}"),
        fields: [("name".to_string(), key.to_string())].into_iter().collect(),
        content_hash: compute_hash(key),
        extracted_at: Utc::now(),
    }
}
