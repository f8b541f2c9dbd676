use crate::core::get_config_dir;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub priority: PriorityConfig,
    /// Optional periodic fair-share decay sweep
    #[serde(default)]
    pub decay: DecayConfig,
    /// Settings for the mock-SLURM daemon (slurmletd)
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SchedulerConfig {
    /// Base of the work directory layout (to_run/running/complete/fail/out)
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Cap on simultaneously running jobs
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Admission loop cadence in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Program used to execute submitted scripts
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Where to persist the usage ledger (None = in-memory only)
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    /// Synthetic device count when no NVML probe is available
    #[serde(default = "default_virtual_gpus")]
    pub virtual_gpus: u32,
    /// Capacity of each synthetic device in GiB
    #[serde(default = "default_virtual_gpu_memory_gib")]
    pub virtual_gpu_memory_gib: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            max_concurrent: default_max_concurrent(),
            poll_interval_ms: default_poll_interval_ms(),
            interpreter: default_interpreter(),
            ledger_path: None,
            virtual_gpus: default_virtual_gpus(),
            virtual_gpu_memory_gib: default_virtual_gpu_memory_gib(),
        }
    }
}

/// SLURM-style multi-factor priority weights. Each weight multiplies a
/// factor in [0, 1] (the physics bonus factor is 0 or 1 as well).
#[derive(Deserialize, Debug, Clone)]
pub struct PriorityConfig {
    #[serde(default = "default_weight_age")]
    pub weight_age: f64,
    /// Fair-share weight, the dominant factor
    #[serde(default = "default_weight_fairshare")]
    pub weight_fairshare: f64,
    #[serde(default = "default_weight_job_size")]
    pub weight_job_size: f64,
    #[serde(default = "default_weight_partition")]
    pub weight_partition: f64,
    /// QoS weight. 1000 by default; HIL-dominant daemon deployments raise
    /// this to 10000 so `qos = "hil"` outranks everything but fair-share.
    #[serde(default = "default_weight_qos")]
    pub weight_qos: f64,
    /// Weight of the physics-workload bonus (0 disables the keyword scan)
    #[serde(default = "default_weight_physics")]
    pub weight_physics: f64,
    /// Waiting time at which the age factor saturates at 1.0
    #[serde(default = "default_max_age_sec")]
    pub max_age_sec: u64,
    /// GPU-seconds of usage at which the fair-share factor halves
    #[serde(default = "default_fairshare_decay_norm")]
    pub fairshare_decay_norm: f64,
    /// VRAM request (GiB) at which the job-size factor saturates at 1.0
    #[serde(default = "default_max_vram_ref_gib")]
    pub max_vram_ref_gib: u64,
    /// Keywords marking physics/simulation workloads in job name or script
    #[serde(default = "default_physics_keywords")]
    pub physics_keywords: Vec<String>,
    /// Partition name -> factor in [0, 1]; unknown names score 0.5
    #[serde(default = "default_partitions")]
    pub partitions: HashMap<String, f64>,
    /// QoS name -> factor in [0, 1]; unknown names score 0.5
    #[serde(default = "default_qos_levels")]
    pub qos_levels: HashMap<String, f64>,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            weight_age: default_weight_age(),
            weight_fairshare: default_weight_fairshare(),
            weight_job_size: default_weight_job_size(),
            weight_partition: default_weight_partition(),
            weight_qos: default_weight_qos(),
            weight_physics: default_weight_physics(),
            max_age_sec: default_max_age_sec(),
            fairshare_decay_norm: default_fairshare_decay_norm(),
            max_vram_ref_gib: default_max_vram_ref_gib(),
            physics_keywords: default_physics_keywords(),
            partitions: default_partitions(),
            qos_levels: default_qos_levels(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct DecayConfig {
    /// Multiplier applied to every ledger entry per sweep
    #[serde(default = "default_decay_factor")]
    pub factor: f64,
    /// Sweep cadence in seconds; 0 disables the sweep entirely
    #[serde(default)]
    pub interval_sec: u64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            factor: default_decay_factor(),
            interval_sec: 0,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct DaemonConfig {
    /// Directory of per-job JSON documents
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: PathBuf,
    /// Wall-clock runtime after which a RUNNING document completes
    #[serde(default = "default_quantum_sec")]
    pub quantum_sec: u64,
    #[serde(default = "default_check_interval_sec")]
    pub check_interval_sec: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            jobs_dir: default_jobs_dir(),
            quantum_sec: default_quantum_sec(),
            check_interval_sec: default_check_interval_sec(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("work")
}

fn default_max_concurrent() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_virtual_gpus() -> u32 {
    1
}

fn default_virtual_gpu_memory_gib() -> u64 {
    16
}

fn default_weight_age() -> f64 {
    1000.0
}

fn default_weight_fairshare() -> f64 {
    10000.0
}

fn default_weight_job_size() -> f64 {
    500.0
}

fn default_weight_partition() -> f64 {
    1000.0
}

fn default_weight_qos() -> f64 {
    1000.0
}

fn default_weight_physics() -> f64 {
    2.0
}

fn default_max_age_sec() -> u64 {
    7 * 24 * 3600
}

fn default_fairshare_decay_norm() -> f64 {
    3600.0 * 10.0
}

fn default_max_vram_ref_gib() -> u64 {
    80
}

fn default_physics_keywords() -> Vec<String> {
    ["physics", "sim", "simulation", "isaac", "robot", "mujoco"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_partitions() -> HashMap<String, f64> {
    HashMap::from([
        ("debug".to_string(), 1.0),
        ("normal".to_string(), 0.5),
        ("batch".to_string(), 0.2),
    ])
}

fn default_qos_levels() -> HashMap<String, f64> {
    HashMap::from([
        ("hil".to_string(), 1.0),
        ("admin".to_string(), 1.0),
        ("high".to_string(), 0.8),
        ("premium".to_string(), 0.8),
        ("standard".to_string(), 0.5),
        ("low".to_string(), 0.1),
        ("guest".to_string(), 0.1),
    ])
}

fn default_decay_factor() -> f64 {
    0.95
}

fn default_jobs_dir() -> PathBuf {
    PathBuf::from("/slurm/jobs")
}

fn default_quantum_sec() -> u64 {
    30
}

fn default_check_interval_sec() -> u64 {
    2
}

pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config, config::ConfigError> {
    let mut config_vec = vec![];

    // User-provided config file
    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            eprintln!("Warning: Config file {config_path:?} not found.");
        }
    }

    // Default config file
    if let Ok(default_config_path) = get_config_dir().map(|d| d.join("gsched.toml")) {
        if default_config_path.exists() {
            config_vec.push(default_config_path);
        }
    }

    let settings = config::Config::builder();
    let settings = config_vec.iter().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    settings
        .add_source(
            config::Environment::with_prefix("GSCHED")
                .separator("_")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.scheduler.max_concurrent, 2);
        assert_eq!(config.scheduler.virtual_gpus, 1);
        assert_eq!(config.priority.weight_fairshare, 10000.0);
        assert_eq!(config.priority.max_age_sec, 7 * 24 * 3600);
        assert_eq!(config.priority.partitions["debug"], 1.0);
        assert_eq!(config.priority.qos_levels["hil"], 1.0);
        assert_eq!(config.daemon.quantum_sec, 30);
        assert_eq!(config.decay.interval_sec, 0);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let toml = r#"
            [scheduler]
            max_concurrent = 4

            [priority]
            weight_qos = 10000.0
        "#;
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.scheduler.max_concurrent, 4);
        assert_eq!(config.scheduler.poll_interval_ms, 1000);
        assert_eq!(config.priority.weight_qos, 10000.0);
        assert_eq!(config.priority.weight_age, 1000.0);
    }
}
