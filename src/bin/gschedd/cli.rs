use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "gschedd",
    author,
    version,
    about = "Single-node GPU job scheduler daemon",
    styles = gsched::utils::STYLES
)]
pub struct GSchedd {
    /// The configuration file to use
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Root of the work directory layout (overrides config)
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    /// Cap on simultaneously running jobs (overrides config)
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Write daily-rotated logs into this directory instead of stderr
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    #[command(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}
