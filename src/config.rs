//! Persisted operator preferences: the last scanned port range and worker count.
//!
//! Stored as pretty JSON:
//!
//! ```json
//! { "range": { "low": 1, "high": 1024 }, "thread": { "count": 500 } }
//! ```
//!
//! Bounds written as strings (`"low": "1"`) are accepted on load.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::ports::DEFAULT_RANGE;
use crate::scanner::DEFAULT_CONCURRENCY;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Preferences {
    pub range: RangePreference,
    pub thread: ThreadPreference,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangePreference {
    #[serde(deserialize_with = "loose_int")]
    pub low: i64,
    #[serde(deserialize_with = "loose_int")]
    pub high: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPreference {
    #[serde(deserialize_with = "loose_int")]
    pub count: i64,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            range: RangePreference {
                low: i64::from(DEFAULT_RANGE.0),
                high: i64::from(DEFAULT_RANGE.1),
            },
            thread: ThreadPreference {
                count: DEFAULT_CONCURRENCY as i64,
            },
        }
    }
}

/// Accept an integer given either as a JSON number or a numeric string.
pub fn loose_int<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Loose {
        Int(i64),
        Text(String),
    }

    match Loose::deserialize(deserializer)? {
        Loose::Int(n) => Ok(n),
        Loose::Text(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| serde::de::Error::custom(format!("invalid integer {s:?}: {e}"))),
    }
}

/// Optional variant of [`loose_int`] for use with `#[serde(default)]`.
pub fn loose_int_opt<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    loose_int(deserializer).map(Some)
}

/// Read preferences from `path`.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Preferences> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;
    let prefs = serde_json::from_str(&content)
        .with_context(|| format!("invalid config file: {}", path.as_ref().display()))?;
    Ok(prefs)
}

/// Read preferences, falling back to defaults when the file is missing or invalid.
pub fn load_or_default(path: impl AsRef<Path>) -> Preferences {
    match load_from_path(&path) {
        Ok(p) => p,
        Err(e) => {
            debug!("using default preferences: {e:#}");
            Preferences::default()
        }
    }
}

/// Shared handle to the preferences file.
#[derive(Clone, Debug)]
pub struct PreferenceStore {
    path: PathBuf,
    current: Arc<RwLock<Preferences>>,
}

impl PreferenceStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = load_or_default(&path);
        Self {
            path,
            current: Arc::new(RwLock::new(current)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self) -> Preferences {
        self.current.read().await.clone()
    }

    /// Remember the last requested range and write the file.
    ///
    /// The write lock is held until the file is replaced, so concurrent
    /// callers never share the temporary file and the file on disk always
    /// matches the last in-memory update.
    pub async fn record_range(&self, low: u16, high: u16) -> Result<()> {
        let mut p = self.current.write().await;
        p.range = RangePreference {
            low: i64::from(low),
            high: i64::from(high),
        };
        self.save(&p).await
    }

    /// Same as [`record_range`](Self::record_range) but only logs failures.
    pub async fn record_range_logged(&self, low: u16, high: u16) {
        if let Err(e) = self.record_range(low, high).await {
            warn!("failed to persist port range to {}: {e:#}", self.path.display());
        }
    }

    async fn save(&self, prefs: &Preferences) -> Result<()> {
        let json = serde_json::to_string_pretty(prefs)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
