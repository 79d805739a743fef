/// Helper utilities for the dbctl CLI

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Search `start` and its parents for a file named `file_name`
pub fn find_upwards(start: &Path, file_name: &str) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(current) = dir {
        let candidate = current.join(file_name);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = current.parent();
    }
    None
}

/// Format bytes to human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Truncate string with ellipsis
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Keep only the last `max_lines` non-empty lines of tool output
pub fn tail_lines(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .collect();

    if lines.len() <= max_lines {
        return lines.join("\n");
    }

    let skipped = lines.len() - max_lines;
    format!(
        "... ({} earlier lines omitted)\n{}",
        skipped,
        lines[skipped..].join("\n")
    )
}

/// Mask sensitive data (show only first and last N characters)
pub fn mask_sensitive(value: &str, visible_chars: usize) -> String {
    let len = value.chars().count();
    if len <= visible_chars * 2 {
        "*".repeat(len)
    } else {
        let start: String = value.chars().take(visible_chars).collect();
        let end: String = value.chars().skip(len - visible_chars).collect();
        format!("{}...{}", start, end)
    }
}

/// Whether a dotenv key looks like it holds a credential
pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_uppercase();
    ["PASSWORD", "SECRET", "KEY", "TOKEN"]
        .iter()
        .any(|marker| key.contains(marker))
}

/// Validate a plain or schema-qualified SQL identifier (`users`, `public.users`)
pub fn is_valid_table_name(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*(\.[A-Za-z_][A-Za-z0-9_$]*)?$")
            .expect("table name pattern is valid")
    });
    pattern.is_match(name)
}
