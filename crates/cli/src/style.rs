//! Shared styling utilities for terminal output.

use console::Style;

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Create a header-styled string (bold).
pub fn header(msg: &str) -> String {
    let style = Style::new().bold();
    style.apply_to(msg).to_string()
}

/// Create a dim-styled string.
pub fn dim(msg: &str) -> String {
    let style = Style::new().dim();
    style.apply_to(msg).to_string()
}

/// Shorten a commit hash for display.
pub fn short_sha(sha: &str) -> &str {
    &sha[..sha.len().min(10)]
}

/// Colored label for a recorded attempt state.
pub fn attempt_state(state: &str) -> String {
    let style = match state {
        "succeeded" => Style::new().green(),
        "failed_with_conflicts" => Style::new().yellow(),
        "rolled_back" => Style::new().red().bold(),
        _ => Style::new().red(),
    };
    style.apply_to(state).to_string()
}
