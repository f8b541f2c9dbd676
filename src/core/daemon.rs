use crate::config::DaemonConfig;
use crate::core::job::JobStatus;
use crate::core::priority::{rank_order, Candidate, PriorityEngine};
use crate::core::usage::UsageLedger;
use crate::core::GIB;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// One job as persisted by the mock-SLURM deployment: a single JSON
/// document per job, timestamps in ISO-8601 UTC with a trailing `Z`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDocument {
    pub job_id: String,
    #[serde(default)]
    pub job_name: String,
    #[serde(default)]
    pub user: String,
    /// Inline script text; scanned for physics keywords alongside the name.
    #[serde(default)]
    pub script: String,
    pub status: JobStatus,
    #[serde(default = "default_qos")]
    pub qos: String,
    #[serde(default = "default_partition")]
    pub partition: String,
    #[serde(default = "default_gpu_count")]
    pub gpu_count: u32,
    #[serde(default = "default_vram_gb")]
    pub vram_gb: u64,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority_score: f64,
}

fn default_qos() -> String {
    "standard".to_string()
}

fn default_partition() -> String {
    "normal".to_string()
}

fn default_gpu_count() -> u32 {
    1
}

fn default_vram_gb() -> u64 {
    2
}

/// Mock-SLURM daemon: the same non-preemptive, priority-sorted admission as
/// the process supervisor, but driven by wall-clock quanta over JSON job
/// documents instead of child processes. Nothing is ever spawned or killed.
pub struct MockSlurmDaemon {
    jobs_dir: PathBuf,
    quantum: Duration,
    max_concurrent: usize,
    engine: PriorityEngine,
    ledger: Arc<UsageLedger>,
}

impl MockSlurmDaemon {
    pub fn new(
        config: DaemonConfig,
        engine: PriorityEngine,
        ledger: Arc<UsageLedger>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.jobs_dir)
            .with_context(|| format!("Failed to create jobs directory {:?}", config.jobs_dir))?;
        Ok(Self {
            jobs_dir: config.jobs_dir,
            quantum: Duration::from_secs(config.quantum_sec),
            max_concurrent: config.max_concurrent,
            engine,
            ledger,
        })
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    /// Load every job document. Dotfiles are skipped (editors and partial
    /// writers leave them behind); unreadable documents are logged and
    /// skipped rather than failing the tick.
    pub fn load_jobs(&self) -> Vec<(JobDocument, PathBuf)> {
        let entries = match std::fs::read_dir(&self.jobs_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(dir = %self.jobs_dir.display(), "cannot read jobs directory: {}", e);
                return Vec::new();
            }
        };

        let mut jobs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            match std::fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(anyhow::Error::from))
            {
                Ok(doc) => jobs.push((doc, path)),
                Err(e) => tracing::warn!(file = %path.display(), "skipping unreadable job: {:#}", e),
            }
        }
        jobs.sort_by(|a, b| a.1.cmp(&b.1));
        jobs
    }

    fn save(&self, doc: &JobDocument, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        std::fs::write(path, bytes)
            .with_context(|| format!("Failed to write job document {:?}", path))?;
        Ok(())
    }

    /// One pass over the jobs directory:
    /// 1. RUNNING documents past their quantum become COMPLETED and their
    ///    occupied time is charged to the ledger.
    /// 2. PENDING documents are ranked against one ledger snapshot and
    ///    promoted into the remaining slots, highest score first.
    pub async fn tick(&self) -> Result<()> {
        let mut entries = self.load_jobs();
        if entries.is_empty() {
            return Ok(());
        }

        let now = Utc::now();

        for (doc, path) in &mut entries {
            if doc.status != JobStatus::Running {
                continue;
            }
            let Some(started_at) = doc.started_at else {
                continue;
            };
            let elapsed = (now - started_at).to_std().unwrap_or_default();
            if elapsed < self.quantum {
                continue;
            }

            doc.status = JobStatus::Completed;
            doc.completed_at = Some(now);
            self.ledger
                .add_usage(&doc.user, elapsed.as_secs_f64(), doc.gpu_count)
                .await;
            if let Err(e) = self.save(doc, path) {
                tracing::error!(job = %doc.job_id, "failed to persist completion: {:#}", e);
                continue;
            }
            tracing::info!(
                job = %doc.job_id,
                user = %doc.user,
                elapsed = %crate::utils::format_duration(elapsed),
                "completed job"
            );
        }

        let running = entries
            .iter()
            .filter(|(doc, _)| doc.status == JobStatus::Running)
            .count();
        let mut slots = self.max_concurrent.saturating_sub(running);
        if slots == 0 {
            return Ok(());
        }

        let usage = self.ledger.snapshot().await;
        let now_sys = SystemTime::now();
        let mut ranked: Vec<usize> = Vec::new();
        for (idx, (doc, _)) in entries.iter_mut().enumerate() {
            if doc.status != JobStatus::Pending {
                continue;
            }
            let text = format!("{} {}", doc.job_name, doc.script).to_lowercase();
            let candidate = Candidate {
                user: &doc.user,
                vram_required: doc.vram_gb.saturating_mul(GIB),
                partition: &doc.partition,
                qos: &doc.qos,
                created_at: doc
                    .submitted_at
                    .map(SystemTime::from)
                    .unwrap_or(now_sys),
                text: &text,
            };
            let user_usage = usage.get(doc.user.as_str()).copied().unwrap_or(0.0);
            let (score, _) = self.engine.score(&candidate, user_usage, now_sys);
            doc.priority_score = score;
            ranked.push(idx);
        }
        ranked.sort_by(|&a, &b| {
            let (doc_a, _) = &entries[a];
            let (doc_b, _) = &entries[b];
            rank_order(
                (
                    doc_a.priority_score,
                    doc_a.submitted_at.map(SystemTime::from).unwrap_or(now_sys),
                    doc_a.job_id.as_str(),
                ),
                (
                    doc_b.priority_score,
                    doc_b.submitted_at.map(SystemTime::from).unwrap_or(now_sys),
                    doc_b.job_id.as_str(),
                ),
            )
        });

        for idx in ranked {
            if slots == 0 {
                break;
            }
            let (doc, path) = &mut entries[idx];
            doc.status = JobStatus::Running;
            doc.started_at = Some(now);
            if let Err(e) = self.save(doc, path) {
                tracing::error!(job = %doc.job_id, "failed to persist promotion: {:#}", e);
                continue;
            }
            tracing::info!(
                job = %doc.job_id,
                qos = %doc.qos,
                score = doc.priority_score,
                "started job"
            );
            slots -= 1;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PriorityConfig;

    fn daemon(dir: &Path, max_concurrent: usize, quantum_sec: u64) -> MockSlurmDaemon {
        let config = DaemonConfig {
            jobs_dir: dir.to_path_buf(),
            quantum_sec,
            check_interval_sec: 1,
            max_concurrent,
        };
        MockSlurmDaemon::new(
            config,
            PriorityEngine::new(PriorityConfig::default()),
            Arc::new(UsageLedger::in_memory()),
        )
        .unwrap()
    }

    fn doc(id: &str, user: &str, qos: &str, status: JobStatus) -> JobDocument {
        JobDocument {
            job_id: id.to_string(),
            job_name: format!("job-{id}"),
            user: user.to_string(),
            script: "python train.py".to_string(),
            status,
            qos: qos.to_string(),
            partition: "normal".to_string(),
            gpu_count: 1,
            vram_gb: 2,
            submitted_at: Some(Utc::now()),
            started_at: None,
            completed_at: None,
            priority_score: 0.0,
        }
    }

    fn write_doc(dir: &Path, doc: &JobDocument) -> PathBuf {
        let path = dir.join(format!("{}.json", doc.job_id));
        std::fs::write(&path, serde_json::to_vec_pretty(doc).unwrap()).unwrap();
        path
    }

    fn read_doc(path: &Path) -> JobDocument {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[test]
    fn test_document_timestamps_keep_trailing_z() {
        let mut d = doc("j1", "alice", "standard", JobStatus::Running);
        d.started_at = Some("2025-03-01T08:30:00Z".parse().unwrap());
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("\"started_at\":\"2025-03-01T08:30:00Z\""));

        let back: JobDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back.started_at, d.started_at);
    }

    #[test]
    fn test_document_defaults_for_sparse_files() {
        let back: JobDocument =
            serde_json::from_str(r#"{"job_id": "j9", "status": "PENDING"}"#).unwrap();
        assert_eq!(back.qos, "standard");
        assert_eq!(back.partition, "normal");
        assert_eq!(back.gpu_count, 1);
        assert_eq!(back.vram_gb, 2);
        assert!(back.submitted_at.is_none());
    }

    #[tokio::test]
    async fn test_tick_promotes_by_qos() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = daemon(tmp.path(), 1, 30);

        let standard = write_doc(tmp.path(), &doc("aaa", "alice", "standard", JobStatus::Pending));
        let hil = write_doc(tmp.path(), &doc("bbb", "bob", "hil", JobStatus::Pending));

        daemon.tick().await.unwrap();

        assert_eq!(read_doc(&hil).status, JobStatus::Running);
        assert!(read_doc(&hil).started_at.is_some());
        assert_eq!(read_doc(&standard).status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_tick_physics_bonus_breaks_ties() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = daemon(tmp.path(), 1, 30);

        let plain = write_doc(tmp.path(), &doc("aaa", "alice", "standard", JobStatus::Pending));
        let mut sim = doc("bbb", "bob", "standard", JobStatus::Pending);
        sim.job_name = "isaac-locomotion".to_string();
        let sim = write_doc(tmp.path(), &sim);

        daemon.tick().await.unwrap();

        assert_eq!(read_doc(&sim).status, JobStatus::Running);
        assert_eq!(read_doc(&plain).status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_tick_respects_max_concurrent() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = daemon(tmp.path(), 2, 30);

        for id in ["aaa", "bbb", "ccc"] {
            write_doc(tmp.path(), &doc(id, "alice", "standard", JobStatus::Pending));
        }

        daemon.tick().await.unwrap();

        let running = daemon
            .load_jobs()
            .iter()
            .filter(|(d, _)| d.status == JobStatus::Running)
            .count();
        assert_eq!(running, 2);
    }

    #[tokio::test]
    async fn test_tick_completes_after_quantum_and_charges_ledger() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = daemon(tmp.path(), 2, 30);

        let mut d = doc("aaa", "alice", "standard", JobStatus::Running);
        d.started_at = Some(Utc::now() - chrono::Duration::seconds(60));
        let path = write_doc(tmp.path(), &d);

        daemon.tick().await.unwrap();

        let back = read_doc(&path);
        assert_eq!(back.status, JobStatus::Completed);
        assert!(back.completed_at.is_some());
        assert!(daemon.ledger.get_usage("alice").await >= 60.0);

        // Raw file keeps the Z-suffixed timestamps.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains('Z'));
    }

    #[tokio::test]
    async fn test_tick_keeps_fresh_running_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = daemon(tmp.path(), 2, 3600);

        let mut d = doc("aaa", "alice", "standard", JobStatus::Running);
        d.started_at = Some(Utc::now() - chrono::Duration::seconds(10));
        let path = write_doc(tmp.path(), &d);

        daemon.tick().await.unwrap();
        assert_eq!(read_doc(&path).status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_load_jobs_skips_dotfiles_and_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = daemon(tmp.path(), 2, 30);

        write_doc(tmp.path(), &doc("aaa", "alice", "standard", JobStatus::Pending));
        std::fs::write(tmp.path().join(".partial.json"), b"{").unwrap();
        std::fs::write(tmp.path().join("broken.json"), b"not json").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"ignore me").unwrap();

        let jobs = daemon.load_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].0.job_id, "aaa");
        // And a tick over this mess still succeeds.
        daemon.tick().await.unwrap();
    }
}
