pub mod daemon;
pub mod gpu;
pub mod job;
pub mod layout;
pub mod priority;
pub mod scheduler;
pub mod store;
pub mod usage;

use std::path::PathBuf;

pub const GIB: u64 = 1024 * 1024 * 1024;

pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))
        .map(|p| p.join("gsched"))
}
