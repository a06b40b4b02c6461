//! Utility functions and helpers

use std::path::PathBuf;

/// Expand a leading `~/` to the user's home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// File name stem for a session key.
///
/// Percent-encodes everything outside `[A-Za-z0-9-_.~]`, `%` included, so
/// distinct keys never share a file.
pub fn session_file_stem(key: &str) -> String {
    urlencoding::encode(key).into_owned()
}

/// Truncate a string to a maximum number of characters for log previews
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let keep = max_chars.saturating_sub(3);
        format!("{}...", s.chars().take(keep).collect::<String>())
    }
}
