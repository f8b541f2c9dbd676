use compact_str::CompactString;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Per-user cumulative GPU-seconds, feeding the fair-share factor.
///
/// All mutations are serialized by the mutex; the lock is held only for the
/// map operation, never across file I/O. Persistence is best-effort: a
/// write failure degrades fair-share durability, it never fails a job.
pub struct UsageLedger {
    entries: Mutex<HashMap<CompactString, f64>>,
    path: Option<PathBuf>,
}

impl UsageLedger {
    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            path: None,
        }
    }

    /// File-backed ledger. An unreadable or corrupt file is logged and
    /// replaced with an empty ledger (fair-share resets, nothing else).
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<HashMap<CompactString, f64>>(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        "Usage ledger is corrupt ({}); starting from an empty ledger",
                        e
                    );
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    "Failed to read usage ledger ({}); starting from an empty ledger",
                    e
                );
                HashMap::new()
            }
        };

        Self {
            entries: Mutex::new(entries),
            path: Some(path),
        }
    }

    /// Charge `duration_sec * gpu_count` GPU-seconds to `user`.
    pub async fn add_usage(&self, user: &str, duration_sec: f64, gpu_count: u32) {
        let snapshot = {
            let mut entries = self.entries.lock().await;
            let entry = entries.entry(CompactString::from(user)).or_insert(0.0);
            *entry += duration_sec * f64::from(gpu_count);
            self.path.as_ref().map(|_| entries.clone())
        };
        if let Some(entries) = snapshot {
            self.persist(&entries);
        }
    }

    /// Cumulative GPU-seconds for `user`; unknown users have consumed none.
    pub async fn get_usage(&self, user: &str) -> f64 {
        self.entries.lock().await.get(user).copied().unwrap_or(0.0)
    }

    pub async fn get_total_usage(&self) -> f64 {
        self.entries.lock().await.values().sum()
    }

    /// Multiply every entry by `factor` (exponential aging). Factors outside
    /// (0, 1) are rejected so a misconfigured sweep can never inflate usage.
    pub async fn decay(&self, factor: f64) {
        if !(factor > 0.0 && factor < 1.0) {
            tracing::warn!(factor, "Ignoring decay with factor outside (0, 1)");
            return;
        }
        let snapshot = {
            let mut entries = self.entries.lock().await;
            for value in entries.values_mut() {
                *value *= factor;
            }
            self.path.as_ref().map(|_| entries.clone())
        };
        if let Some(entries) = snapshot {
            self.persist(&entries);
        }
    }

    /// Consistent copy of the ledger for ranking one admission pass: the
    /// ordering within a pass never flips because of a concurrent charge.
    pub async fn snapshot(&self) -> HashMap<CompactString, f64> {
        self.entries.lock().await.clone()
    }

    fn persist(&self, entries: &HashMap<CompactString, f64>) {
        let Some(path) = &self.path else { return };
        let result = serde_json::to_vec(entries).map_err(anyhow::Error::from).and_then(|bytes| {
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, bytes)?;
            std::fs::rename(&tmp, path)?;
            Ok(())
        });
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), "Failed to persist usage ledger: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_add_and_get_usage() {
        let ledger = UsageLedger::in_memory();
        assert_eq!(ledger.get_usage("alice").await, 0.0);

        ledger.add_usage("alice", 10.0, 1).await;
        ledger.add_usage("alice", 5.0, 2).await;
        ledger.add_usage("bob", 1.5, 1).await;

        assert_eq!(ledger.get_usage("alice").await, 20.0);
        assert_eq!(ledger.get_usage("bob").await, 1.5);
        assert_eq!(ledger.get_total_usage().await, 21.5);
    }

    #[tokio::test]
    async fn test_decay_halves_everyone() {
        let ledger = UsageLedger::in_memory();
        ledger.add_usage("alice", 100.0, 1).await;
        ledger.add_usage("bob", 40.0, 1).await;

        ledger.decay(0.5).await;

        assert_eq!(ledger.get_usage("alice").await, 50.0);
        assert_eq!(ledger.get_usage("bob").await, 20.0);
    }

    #[tokio::test]
    async fn test_decay_rejects_bad_factor() {
        let ledger = UsageLedger::in_memory();
        ledger.add_usage("alice", 100.0, 1).await;

        ledger.decay(0.0).await;
        ledger.decay(1.0).await;
        ledger.decay(2.0).await;

        assert_eq!(ledger.get_usage("alice").await, 100.0);
    }

    #[tokio::test]
    async fn test_concurrent_charges_all_land() {
        let ledger = Arc::new(UsageLedger::in_memory());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    ledger.add_usage("alice", 1.0, 1).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(ledger.get_usage("alice").await, 800.0);
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("usage.json");

        {
            let ledger = UsageLedger::with_path(&path);
            ledger.add_usage("alice", 3600.0, 1).await;
        }

        let reloaded = UsageLedger::with_path(&path);
        assert_eq!(reloaded.get_usage("alice").await, 3600.0);
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("usage.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let ledger = UsageLedger::with_path(&path);
        assert_eq!(ledger.get_total_usage().await, 0.0);
    }
}
