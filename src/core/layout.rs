use crate::core::job::JobStatus;
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

/// Directory-based persistent state machine.
///
/// ```text
/// root/
///   to_run/   : pending job scripts
///   running/  : scripts of currently executing jobs
///   complete/ : scripts of jobs that exited 0
///   fail/     : scripts of jobs that crashed or were reconciled
///   out/      : captured stdout/stderr, one log per job
/// ```
///
/// The directory a script resides in is the durable job status; everything
/// in memory is a cache that must agree with it.
#[derive(Debug, Clone)]
pub struct DirLayout {
    root: PathBuf,
    to_run: PathBuf,
    running: PathBuf,
    complete: PathBuf,
    fail: PathBuf,
    out: PathBuf,
}

impl DirLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            to_run: root.join(JobStatus::Pending.dir_name()),
            running: root.join(JobStatus::Running.dir_name()),
            complete: root.join(JobStatus::Completed.dir_name()),
            fail: root.join(JobStatus::Failed.dir_name()),
            out: root.join("out"),
            root,
        }
    }

    /// Create all five directories. Idempotent.
    pub fn setup(&self) -> Result<()> {
        for dir in [&self.to_run, &self.running, &self.complete, &self.fail, &self.out] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create layout directory {:?}", dir))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// State directory a script with the given status lives in.
    pub fn dir(&self, status: JobStatus) -> &Path {
        match status {
            JobStatus::Pending => &self.to_run,
            JobStatus::Running => &self.running,
            JobStatus::Completed => &self.complete,
            JobStatus::Failed => &self.fail,
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out
    }

    pub fn log_path(&self, job_id: &str) -> PathBuf {
        self.out.join(format!("{job_id}.log"))
    }
}

/// Atomically move `src` into `dst_dir`, dodging name collisions.
///
/// The target name is `new_name` if given, otherwise `src`'s file name. If
/// that name is taken, `_1`, `_2`, … are appended to the stem until a free
/// name is found. Returns the final path; callers must update any record
/// holding the old one.
pub fn safe_rename(src: &Path, dst_dir: &Path, new_name: Option<&str>) -> Result<PathBuf> {
    std::fs::create_dir_all(dst_dir)
        .with_context(|| format!("Failed to create destination directory {:?}", dst_dir))?;

    let name = match new_name {
        Some(name) => name.to_string(),
        None => src
            .file_name()
            .ok_or_else(|| anyhow!("Source path {:?} has no file name", src))?
            .to_string_lossy()
            .into_owned(),
    };

    let mut target = dst_dir.join(&name);
    if target.exists() {
        let as_path = Path::new(&name);
        let stem = as_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        let ext = as_path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let mut counter = 1u32;
        loop {
            let candidate = dst_dir.join(format!("{stem}_{counter}{ext}"));
            if !candidate.exists() {
                target = candidate;
                break;
            }
            counter += 1;
        }
    }

    std::fs::rename(src, &target)
        .with_context(|| format!("Failed to move {:?} to {:?}", src, target))?;
    Ok(target)
}
