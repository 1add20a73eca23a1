//! Probe cache: memoizes media metadata from the external probe
//! collaborator, keyed by `(absolute path, mtime in nanoseconds)`.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Metadata the probe collaborator reports for a media file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProbeInfo {
    pub duration_secs: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(default)]
    pub audio_channels: Option<u32>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub bitrate: Option<u64>,
}

/// A probe result. `None` is a legitimate, memoized "probe produced no
/// usable info" outcome — distinct from "not yet probed".
pub type ProbeResult = Option<ProbeInfo>;

fn cache_key(abs_path: &Path, mtime_ns: i128) -> (std::path::PathBuf, i128) {
    (abs_path.to_path_buf(), mtime_ns)
}

fn mtime_ns(path: &Path) -> std::io::Result<i128> {
    let meta = std::fs::metadata(path)?;
    let modified = meta.modified()?;
    Ok(modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i128)
        .unwrap_or(0))
}

/// External probe collaborator: `probe <path>` -> JSON on stdout
/// describing format and streams (`SPEC_FULL.md` 6).
#[async_trait]
pub trait ProbeCollaborator: Send + Sync {
    async fn probe(&self, abs_path: &Path) -> anyhow::Result<ProbeResult>;
}

/// Invokes an external `probe` binary and parses its stdout as JSON.
pub struct ProcessProbe {
    pub program: String,
}

#[async_trait]
impl ProbeCollaborator for ProcessProbe {
    async fn probe(&self, abs_path: &Path) -> anyhow::Result<ProbeResult> {
        let output = Command::new(&self.program)
            .arg(abs_path)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            // Benign probe failures (malformed metadata, unsupported
            // container) are suppressed to a memoized `None` rather than
            // surfaced as an error that would defeat caching.
            debug!(
                path = %abs_path.display(),
                status = ?output.status,
                "probe collaborator exited non-zero"
            );
            return Ok(None);
        }

        match serde_json::from_slice::<ProbeInfo>(&output.stdout) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                debug!(path = %abs_path.display(), error = %e, "probe output did not parse, treating as no info");
                Ok(None)
            }
        }
    }
}

/// A no-op probe collaborator, for deployments or tests with no available
/// probe binary. Always returns `None`.
pub struct NullProbe;

#[async_trait]
impl ProbeCollaborator for NullProbe {
    async fn probe(&self, _abs_path: &Path) -> anyhow::Result<ProbeResult> {
        Ok(None)
    }
}

/// Thread-safe memoization cache in front of a [`ProbeCollaborator`].
pub struct ProbeCache {
    collaborator: Arc<dyn ProbeCollaborator>,
    entries: Mutex<HashMap<(std::path::PathBuf, i128), ProbeResult>>,
}

impl ProbeCache {
    pub fn new(collaborator: Arc<dyn ProbeCollaborator>) -> Self {
        Self {
            collaborator,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Looks up `abs_path`'s metadata, probing and memoizing on a miss.
    /// Filesystem errors reading mtime propagate (they indicate the file
    /// itself is unavailable, not a probe failure).
    pub async fn get(&self, abs_path: &Path) -> anyhow::Result<ProbeResult> {
        let mtime = mtime_ns(abs_path)?;
        let key = cache_key(abs_path, mtime);

        {
            let guard = self.entries.lock().await;
            if let Some(value) = guard.get(&key) {
                trace!(path = %abs_path.display(), "probe cache hit");
                return Ok(value.clone());
            }
        }

        trace!(path = %abs_path.display(), "probe cache miss, invoking collaborator");
        let result = match self.collaborator.probe(abs_path).await {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %abs_path.display(), error = %e, "probe collaborator failed, caching as no info");
                None
            }
        };

        self.entries.lock().await.insert(key, result.clone());
        Ok(result)
    }

    #[cfg(test)]
    pub async fn set_for_test(&self, abs_path: &Path, value: ProbeResult) {
        let mtime = mtime_ns(abs_path).unwrap_or(0);
        self.entries
            .lock()
            .await
            .insert(cache_key(abs_path, mtime), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProbe {
        calls: AtomicUsize,
        result: ProbeResult,
    }

    #[async_trait]
    impl ProbeCollaborator for CountingProbe {
        async fn probe(&self, _abs_path: &Path) -> anyhow::Result<ProbeResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result.clone())
        }
    }

    #[tokio::test]
    async fn repeated_get_invokes_collaborator_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp4");
        std::fs::write(&path, b"data").unwrap();

        let probe = Arc::new(CountingProbe {
            calls: AtomicUsize::new(0),
            result: Some(ProbeInfo {
                duration_secs: Some(10.0),
                width: Some(1920),
                height: Some(1080),
                audio_channels: None,
                sample_rate: None,
                bitrate: None,
            }),
        });
        let cache = ProbeCache::new(probe.clone());

        let first = cache.get(&path).await.unwrap();
        let second = cache.get(&path).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn negative_results_are_memoized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp4");
        std::fs::write(&path, b"data").unwrap();

        let probe = Arc::new(CountingProbe {
            calls: AtomicUsize::new(0),
            result: None,
        });
        let cache = ProbeCache::new(probe.clone());

        assert_eq!(cache.get(&path).await.unwrap(), None);
        assert_eq!(cache.get(&path).await.unwrap(), None);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }
}
