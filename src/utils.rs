use clap::builder::{
    styling::{AnsiColor, Effects},
    Styles,
};
use std::time::Duration;

/// Format duration for display (e.g., `"2h 30m 45s"`, `"45m 30s"`, `"30s"`).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use gsched::utils::format_duration;
///
/// assert_eq!(format_duration(Duration::from_secs(45)), "45s");
/// assert_eq!(format_duration(Duration::from_secs(1845)), "30m 45s");
/// assert_eq!(format_duration(Duration::from_secs(9045)), "2h 30m 45s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

pub const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());
