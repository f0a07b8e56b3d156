use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::AppError;

/// Base URL project references are resolved against.
pub const DEFAULT_BASE_URL: &str = "https://github.com/";

/// One entity to fetch. Identity is the `key`; the URL is derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    key: String,
    url: Url,
}

impl Target {
    /// Parse a target identifier.
    ///
    /// Absolute `http(s)` URLs are used as-is. Anything else is treated as a
    /// project reference (`owner/name`) and joined onto `base`.
    pub fn parse(raw: &str, base: &Url) -> Result<Self, AppError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AppError::InvalidTarget(raw.to_string()));
        }

        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            let url = Url::parse(trimmed)
                .map_err(|e| AppError::InvalidTarget(format!("{trimmed}: {e}")))?;
            return Ok(Self {
                key: trimmed.trim_end_matches('/').to_string(),
                url,
            });
        }

        let reference = trimmed.trim_matches('/');
        let url = base
            .join(reference)
            .map_err(|e| AppError::InvalidTarget(format!("{trimmed}: {e}")))?;
        Ok(Self {
            key: reference.to_string(),
            url,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Network identity presented for a single fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub proxy: Option<String>,
    pub user_agent: String,
}

/// Outcome recorded for a target in the dedup cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Success,
    PermanentFailure,
    TransientFailure,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Success => "success",
            CacheStatus::PermanentFailure => "permanent_failure",
            CacheStatus::TransientFailure => "transient_failure",
        }
    }

    /// Resolved targets are never fetched again, in this run or a later one.
    pub fn is_resolved(&self) -> bool {
        matches!(self, CacheStatus::Success | CacheStatus::PermanentFailure)
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CacheStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "success" => Ok(CacheStatus::Success),
            "permanent_failure" | "permanent" => Ok(CacheStatus::PermanentFailure),
            "transient_failure" | "transient" => Ok(CacheStatus::TransientFailure),
            _ => Err(format!("Unknown cache status: {s}")),
        }
    }
}

/// A single dedup cache row. One per target key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub status: CacheStatus,
    /// Present iff `status` is `Success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn success(record: Record, attempts: u32) -> Self {
        Self {
            key: record.target.clone(),
            status: CacheStatus::Success,
            record: Some(record),
            error: None,
            attempts,
            updated_at: Utc::now(),
        }
    }

    pub fn failure(
        key: impl Into<String>,
        status: CacheStatus,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        debug_assert!(status != CacheStatus::Success);
        Self {
            key: key.into(),
            status,
            record: None,
            error: Some(error.into()),
            attempts,
            updated_at: Utc::now(),
        }
    }
}

/// Structured fields extracted from one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Target key the record was extracted for.
    pub target: String,
    pub url: String,
    pub fields: BTreeMap<String, String>,
    /// SHA-256 of the raw page content
    pub content_hash: String,
    pub extracted_at: DateTime<Utc>,
}

impl Record {
    pub fn new(target: &Target, raw_content: &str) -> Self {
        Self {
            target: target.key().to_string(),
            url: target.url().to_string(),
            fields: BTreeMap::new(),
            content_hash: compute_hash(raw_content),
            extracted_at: Utc::now(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
