/// CLI utilities for consistent output formatting
use std::io::IsTerminal;
use std::time::Duration;

/// Get a colored prefix
///
/// Returns bright cyan if stderr is a TTY, plain text otherwise.
pub fn strata_prefix() -> &'static str {
    if std::io::stderr().is_terminal() {
        "\x1b[96m[strata]\x1b[0m"
    } else {
        "[strata]"
    }
}

/// Seconds with two decimals, as shown in step summaries
pub fn format_duration(duration: Duration) -> String {
    format!("{:.2}s", duration.as_secs_f64())
}

/// Human-readable byte count
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1000.0 && unit < UNITS.len() - 1 {
        size /= 1000.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}
