use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "slurmletd",
    author,
    version,
    about = "Mock-SLURM daemon driving JSON job documents",
    styles = gsched::utils::STYLES
)]
pub struct Slurmletd {
    /// The configuration file to use
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory of per-job JSON documents (overrides config)
    #[arg(short, long)]
    pub jobs_dir: Option<PathBuf>,

    /// Seconds a RUNNING job takes to complete (overrides config)
    #[arg(long)]
    pub quantum: Option<u64>,

    /// Cap on simultaneously running jobs (overrides config)
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    #[command(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}
