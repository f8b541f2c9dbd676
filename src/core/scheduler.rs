use crate::config::{PriorityConfig, SchedulerConfig};
use crate::core::gpu::{self, GpuInventory, GpuMetrics};
use crate::core::job::{Job, JobStatus, PriorityFactors, SubmitError, DEFAULT_VRAM_REQUEST};
use crate::core::layout::{safe_rename, DirLayout};
use crate::core::priority::{rank_order, Candidate, PriorityEngine};
use crate::core::store::JobStore;
use crate::core::usage::UsageLedger;
use crate::core::GIB;
use anyhow::{Context, Result};
use compact_str::CompactString;
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// A GPU whose observed memory usage is at or above this threshold is
/// considered occupied, whatever its free capacity says.
const IDLE_MEMORY_THRESHOLD: u64 = GIB;

/// How long `tail_log` sleeps between polls once it has drained the file.
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Non-preemptive GPU job scheduler over a directory-based queue.
///
/// One cooperative admission loop promotes pending scripts into child
/// processes pinned to a GPU; one detached supervisor task per child waits
/// for it to exit, charges the usage ledger, and files the script under
/// `complete/` or `fail/`.
pub struct GpuScheduler {
    layout: DirLayout,
    inventory: Box<dyn GpuInventory>,
    jobs: Arc<JobStore>,
    ledger: Arc<UsageLedger>,
    engine: PriorityEngine,
    config: SchedulerConfig,
    shutdown: Notify,
    stopped: AtomicBool,
}

impl GpuScheduler {
    /// Build a scheduler with auto-detected inventory (NVML if available,
    /// virtual devices otherwise).
    pub fn new(config: SchedulerConfig, priority: PriorityConfig) -> Result<Arc<Self>> {
        let inventory = gpu::detect(config.virtual_gpus, config.virtual_gpu_memory_gib);
        Self::with_inventory(config, priority, inventory)
    }

    /// Build a scheduler with an explicit inventory (tests, embedders).
    pub fn with_inventory(
        config: SchedulerConfig,
        priority: PriorityConfig,
        inventory: Box<dyn GpuInventory>,
    ) -> Result<Arc<Self>> {
        let layout = DirLayout::new(&config.root_dir);
        layout.setup()?;

        let ledger = match &config.ledger_path {
            Some(path) => UsageLedger::with_path(path),
            None => UsageLedger::in_memory(),
        };

        Ok(Arc::new(Self {
            layout,
            inventory,
            jobs: Arc::new(JobStore::new()),
            ledger: Arc::new(ledger),
            engine: PriorityEngine::new(priority),
            config,
            shutdown: Notify::new(),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn layout(&self) -> &DirLayout {
        &self.layout
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    /// Persist a script under `to_run/` and queue a job record for it.
    /// Input validation is the only error surfaced to the submitter; from
    /// here on the job reports through its status and log file.
    pub async fn submit(
        &self,
        script: &[u8],
        user: &str,
        vram_required: u64,
        partition: &str,
        qos: &str,
    ) -> Result<CompactString> {
        self.submit_named(None, script, user, vram_required, partition, qos)
            .await
    }

    pub async fn submit_named(
        &self,
        name: Option<&str>,
        script: &[u8],
        user: &str,
        vram_required: u64,
        partition: &str,
        qos: &str,
    ) -> Result<CompactString> {
        if script.is_empty() {
            return Err(SubmitError::EmptyScript.into());
        }
        if user.is_empty()
            || !user
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
        {
            return Err(SubmitError::InvalidUser(user.to_string()).into());
        }
        if vram_required == 0 {
            return Err(SubmitError::ZeroVram.into());
        }

        let id = CompactString::from(Uuid::new_v4().to_string());

        // Stage next to the queue so the final hop into to_run/ is one
        // atomic rename on the same filesystem.
        let staged = self.layout.root().join(format!(".{id}.staging"));
        tokio::fs::write(&staged, script)
            .await
            .with_context(|| format!("Failed to stage script for job {id}"))?;
        let script_path = safe_rename(
            &staged,
            self.layout.dir(JobStatus::Pending),
            Some(&format!("{id}.py")),
        )?;

        let job = Job {
            id: id.clone(),
            name: name.map(CompactString::from),
            script_path,
            user: CompactString::from(user),
            vram_required,
            partition: CompactString::from(if partition.is_empty() { "normal" } else { partition }),
            qos: CompactString::from(if qos.is_empty() { "standard" } else { qos }),
            created_at: SystemTime::now(),
            status: JobStatus::Pending,
            assigned_gpu: None,
            pid: None,
            started_at: None,
            finished_at: None,
            priority_score: 0.0,
            factors: PriorityFactors::default(),
        };
        self.jobs.add(job).await;

        tracing::info!(job = %id, user, vram = vram_required, partition, qos, "queued job");
        Ok(id)
    }

    pub async fn list_jobs(&self) -> Vec<Job> {
        self.jobs.list().await
    }

    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        self.jobs.get(job_id).await
    }

    /// Stream the job's log file. Polls while the file grows; the channel
    /// closes once the job is terminal and the file has been drained.
    pub fn tail_log(&self, job_id: &str) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(16);
        let jobs = Arc::clone(&self.jobs);
        let path = self.layout.log_path(job_id);
        let job_id = CompactString::from(job_id);

        tokio::spawn(async move {
            let mut offset: u64 = 0;

            loop {
                // Order matters: observe the status before reading, so bytes
                // written right before the terminal transition still land.
                let terminal = match jobs.get(&job_id).await {
                    Some(job) => job.status.is_final(),
                    None => true,
                };

                let chunk = read_from_offset(&path, offset).await;
                if chunk.is_empty() {
                    if terminal {
                        break;
                    }
                    tokio::time::sleep(TAIL_POLL_INTERVAL).await;
                    continue;
                }

                offset += chunk.len() as u64;
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        rx
    }

    /// Run admission passes until `stop()` is called. Running children are
    /// never touched by shutdown; the loop merely stops admitting.
    pub async fn run(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            root = %self.layout.root().display(),
            max_concurrent = self.config.max_concurrent,
            "scheduler loop started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shutdown.notified() => {}
            }
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.tick().await;
        }

        tracing::info!("scheduler loop stopped; running jobs are left to finish");
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// One admission pass: rank the pending queue against a single ledger
    /// snapshot, then fill free slots in rank order wherever a compatible
    /// GPU is idle.
    pub async fn tick(&self) {
        let jobs = self.jobs.list().await;
        let running: Vec<&Job> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .collect();

        let mut slots = self.config.max_concurrent.saturating_sub(running.len());
        if slots == 0 {
            return;
        }

        let mut pending: Vec<Job> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        if pending.is_empty() {
            return;
        }

        // One snapshot per pass: a supervisor charging the ledger mid-pass
        // must not flip the ordering under us.
        let usage = self.ledger.snapshot().await;
        let now = SystemTime::now();
        for job in &mut pending {
            let text = job.name.as_deref().unwrap_or_default().to_lowercase();
            let candidate = Candidate {
                user: &job.user,
                vram_required: job.vram_required,
                partition: &job.partition,
                qos: &job.qos,
                created_at: job.created_at,
                text: &text,
            };
            let user_usage = usage.get(job.user.as_str()).copied().unwrap_or(0.0);
            let (score, factors) = self.engine.score(&candidate, user_usage, now);
            job.priority_score = score;
            job.factors = factors;
            self.jobs
                .update_with(&job.id, |j| {
                    j.priority_score = score;
                    j.factors = factors;
                })
                .await;
        }
        pending.sort_by(|a, b| {
            rank_order(
                (a.priority_score, a.created_at, a.id.as_str()),
                (b.priority_score, b.created_at, b.id.as_str()),
            )
        });

        let gpus = self.inventory.list_gpus();
        let mut busy: HashSet<u32> = running.iter().filter_map(|j| j.assigned_gpu).collect();

        for job in pending {
            if slots == 0 {
                break;
            }
            let Some(gpu_id) = find_available_gpu(&gpus, job.vram_required, &busy) else {
                tracing::debug!(
                    job = %job.id,
                    waiting = %crate::utils::format_duration(job.time_waiting(now)),
                    "no compatible GPU free; job stays pending"
                );
                continue;
            };
            let job_id = job.id.clone();
            match self.admit(job, gpu_id).await {
                Ok(()) => {
                    busy.insert(gpu_id);
                    slots -= 1;
                }
                Err(e) => {
                    tracing::error!(job = %job_id, "admission failed: {:#}", e);
                }
            }
        }
    }

    /// Move the script into `running/`, launch the child pinned to the GPU,
    /// and detach its supervisor. Any failure here files the job as FAILED
    /// with the cause in its log; the caller keeps the slot and the GPU.
    async fn admit(&self, mut job: Job, gpu_id: u32) -> Result<()> {
        let moved = safe_rename(&job.script_path, self.layout.dir(JobStatus::Running), None);
        let script_path = match moved {
            Ok(path) => path,
            Err(e) => {
                self.fail_job(job, &format!("could not move script into running/: {e:#}"))
                    .await;
                return Err(e);
            }
        };
        job.script_path = script_path;

        let start = SystemTime::now();
        job.status = JobStatus::Running;
        job.assigned_gpu = Some(gpu_id);
        job.started_at = Some(start);

        match self.spawn_child(&job, gpu_id) {
            Ok(child) => {
                job.pid = child.id();
                tracing::info!(
                    job = %job.id,
                    gpu = gpu_id,
                    pid = job.pid,
                    score = job.priority_score,
                    "launched job"
                );
                self.jobs.update(job.clone()).await;
                tokio::spawn(supervise(
                    self.layout.clone(),
                    Arc::clone(&self.jobs),
                    Arc::clone(&self.ledger),
                    job,
                    child,
                    start,
                ));
                Ok(())
            }
            Err(e) => {
                let reason = format!("failed to launch: {e:#}");
                self.fail_job(job, &reason).await;
                Err(e)
            }
        }
    }

    fn spawn_child(&self, job: &Job, gpu_id: u32) -> Result<Child> {
        let log_path = self.layout.log_path(&job.id);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file {:?}", log_path))?;
        // stderr shares the descriptor so interleaving matches arrival order.
        let log_err = log.try_clone().context("Failed to clone log handle")?;

        let child = Command::new(&self.config.interpreter)
            .arg(&job.script_path)
            .env("CUDA_DEVICE_ORDER", "PCI_BUS_ID")
            .env("CUDA_VISIBLE_DEVICES", gpu_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to spawn {} {:?}",
                    self.config.interpreter, job.script_path
                )
            })?;
        Ok(child)
    }

    /// File a job as FAILED outside the normal child-exit path (launch and
    /// state errors). Best effort: the record is updated even when the
    /// script cannot be moved.
    async fn fail_job(&self, mut job: Job, reason: &str) {
        tracing::error!(job = %job.id, "{reason}");
        self.append_to_log(&job.id, reason);

        match safe_rename(&job.script_path, self.layout.dir(JobStatus::Failed), None) {
            Ok(path) => job.script_path = path,
            Err(e) => {
                tracing::warn!(job = %job.id, "could not file script under fail/: {:#}", e);
            }
        }
        job.try_transition(JobStatus::Failed);
        job.pid = None;
        self.jobs.update(job).await;
    }

    fn append_to_log(&self, job_id: &str, line: &str) {
        let log_path = self.layout.log_path(job_id);
        let opened = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path);
        if let Ok(mut log) = opened {
            let _ = writeln!(log, "[gschedd] {line}");
        }
    }

    /// One-shot recovery after a restart, driven purely by the directory
    /// tree: orphaned `running/` scripts are reconciled to FAILED, and
    /// unknown `to_run/` scripts are re-queued.
    pub async fn recover(&self) -> Result<()> {
        let running_dir = self.layout.dir(JobStatus::Running).to_path_buf();
        for path in list_scripts(&running_dir)? {
            let stem = file_stem(&path);
            let job = self.jobs.get(&stem).await;
            let alive = job
                .as_ref()
                .and_then(|j| j.pid)
                .map(pid_alive)
                .unwrap_or(false);
            if alive {
                continue;
            }

            tracing::warn!(job = %stem, "reconciling orphaned running script to FAILED");
            let final_path = match safe_rename(&path, self.layout.dir(JobStatus::Failed), None) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(job = %stem, "could not move orphaned script: {:#}", e);
                    path
                }
            };

            match job {
                Some(mut job) => {
                    job.script_path = final_path;
                    job.status = JobStatus::Failed;
                    job.pid = None;
                    job.finished_at = Some(SystemTime::now());
                    self.jobs.update(job).await;
                }
                None => {
                    self.jobs
                        .add(self.recovered_job(stem, final_path, JobStatus::Failed))
                        .await;
                }
            }
        }

        let to_run_dir = self.layout.dir(JobStatus::Pending).to_path_buf();
        for path in list_scripts(&to_run_dir)? {
            let stem = file_stem(&path);
            if self.jobs.get(&stem).await.is_some() {
                continue;
            }
            tracing::info!(job = %stem, "re-queueing script found in to_run/");
            self.jobs
                .add(self.recovered_job(stem, path, JobStatus::Pending))
                .await;
        }

        Ok(())
    }

    fn recovered_job(
        &self,
        id: CompactString,
        script_path: std::path::PathBuf,
        status: JobStatus,
    ) -> Job {
        let created_at = script_path
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());
        Job {
            id,
            name: None,
            script_path,
            user: CompactString::const_new("recovered"),
            vram_required: DEFAULT_VRAM_REQUEST,
            partition: CompactString::const_new("normal"),
            qos: CompactString::const_new("standard"),
            created_at,
            status,
            assigned_gpu: None,
            pid: None,
            started_at: None,
            finished_at: if status.is_final() {
                Some(SystemTime::now())
            } else {
                None
            },
            priority_score: 0.0,
            factors: PriorityFactors::default(),
        }
    }
}

/// Detached per-job supervisor: wait for the child, charge the ledger for
/// the occupied time whatever the exit status, and file the script under
/// its terminal directory.
async fn supervise(
    layout: DirLayout,
    jobs: Arc<JobStore>,
    ledger: Arc<UsageLedger>,
    mut job: Job,
    mut child: Child,
    start: SystemTime,
) {
    let wait = child.wait().await;
    let duration = SystemTime::now().duration_since(start).unwrap_or_default();

    // The user consumed the GPU-time whether or not the job succeeded.
    ledger.add_usage(&job.user, duration.as_secs_f64(), 1).await;

    let target = match &wait {
        Ok(status) if status.success() => {
            tracing::info!(
                job = %job.id,
                elapsed = %crate::utils::format_duration(duration),
                "job completed"
            );
            JobStatus::Completed
        }
        Ok(status) => {
            tracing::warn!(
                job = %job.id,
                code = status.code(),
                elapsed = %crate::utils::format_duration(duration),
                "job failed"
            );
            JobStatus::Failed
        }
        Err(e) => {
            tracing::error!(job = %job.id, "failed to reap child: {}", e);
            JobStatus::Failed
        }
    };

    match safe_rename(&job.script_path, layout.dir(target), None) {
        Ok(path) => job.script_path = path,
        Err(e) => {
            // The on-disk layout stays canonical; record the state we
            // decided on and leave the tree to the operator.
            tracing::warn!(job = %job.id, "script move after exit failed: {:#}", e);
        }
    }
    job.try_transition(target);
    job.pid = None;
    jobs.update(job).await;
}

/// First healthy GPU that can hold `vram_required` and looks idle: enough
/// free memory, under the idle threshold, and not pinned by a running job
/// or an earlier admission in the same pass. On virtual devices (observed
/// usage always 0) the pin check is the entire occupancy signal.
fn find_available_gpu(gpus: &[GpuMetrics], vram_required: u64, busy: &HashSet<u32>) -> Option<u32> {
    gpus.iter()
        .find(|gpu| {
            gpu.healthy
                && !busy.contains(&gpu.index)
                && gpu.free_memory() >= vram_required
                && gpu.memory_used < IDLE_MEMORY_THRESHOLD
        })
        .map(|gpu| gpu.index)
}

fn list_scripts(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut scripts = Vec::new();
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("Failed to read directory {:?}", dir))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_file() {
            scripts.push(path);
        }
    }
    scripts.sort();
    Ok(scripts)
}

fn file_stem(path: &Path) -> CompactString {
    path.file_stem()
        .map(|s| CompactString::from(s.to_string_lossy()))
        .unwrap_or_default()
}

fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without touching the process.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

async fn read_from_offset(path: &Path, offset: u64) -> Vec<u8> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return Vec::new();
    };
    if file.seek(std::io::SeekFrom::Start(offset)).await.is_err() {
        return Vec::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).await.is_err() {
        return Vec::new();
    }
    buf
}
