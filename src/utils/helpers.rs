/// Helper utilities for the backup CLI

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use regex::Regex;
use std::io::{BufRead, Write};
use std::sync::OnceLock;

use crate::utils::{ARCHIVE_PREFIX, ARCHIVE_SUFFIX, MARKDOWN_V2_SPECIAL, STAMP_FORMAT};

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

/// Format duration to human-readable string
pub fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Escape text for Telegram MarkdownV2.
///
/// Backslash is escaped first so the escapes added for markup characters are
/// not doubled.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() * 2);
    for ch in text.chars() {
        if ch == '\\' || MARKDOWN_V2_SPECIAL.contains(&ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Last `max_chars` characters of `text`, marked with a leading ellipsis when cut
pub fn tail_excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().rev().nth(max_chars.saturating_sub(1)) {
        Some((start, _)) if start > 0 && max_chars > 0 => format!("…{}", &text[start..]),
        _ => text.to_string(),
    }
}

/// Mask sensitive data (show only first and last N characters)
pub fn mask_sensitive(value: &str, visible_chars: usize) -> String {
    let count = value.chars().count();
    if count <= visible_chars * 2 {
        "*".repeat(count)
    } else {
        let start: String = value.chars().take(visible_chars).collect();
        let end: String = value.chars().skip(count - visible_chars).collect();
        format!("{}...{}", start, end)
    }
}

/// Archive file name for a run stamp
pub fn archive_file_name(stamp: &NaiveDateTime) -> String {
    format!("{}{}{}", ARCHIVE_PREFIX, stamp.format(STAMP_FORMAT), ARCHIVE_SUFFIX)
}

fn archive_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!(
            r"^{}(\d{{4}}-\d{{2}}-\d{{2}}_\d{{2}}_\d{{2}}_\d{{2}}){}$",
            regex::escape(ARCHIVE_PREFIX),
            regex::escape(ARCHIVE_SUFFIX)
        ))
        .expect("archive name pattern is valid")
    })
}

/// Recover the run stamp from an archive file name, if it matches the pattern
pub fn parse_archive_stamp(file_name: &str) -> Option<NaiveDateTime> {
    let captures = archive_name_pattern().captures(file_name)?;
    NaiveDateTime::parse_from_str(&captures[1], STAMP_FORMAT).ok()
}

/// Print a prompt and read one trimmed line from the given input
pub fn prompt_line<R: BufRead, W: Write>(input: &mut R, output: &mut W, prompt: &str) -> Result<String> {
    write!(output, "{}", prompt).context("Failed to write prompt")?;
    output.flush().context("Failed to flush prompt")?;

    let mut line = String::new();
    input.read_line(&mut line).context("Failed to read user input")?;
    Ok(line.trim().to_string())
}

/// Whether an answer counts as an explicit yes. Empty input is a no.
pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim(), "y" | "Y" | "yes" | "Yes" | "YES")
}

/// Simplified container state as reported by `docker inspect`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Created,
    Stopped,
    Paused,
    Restarting,
    Dead,
    /// No container with that name exists
    Missing,
    Unknown,
}

impl From<&str> for ContainerState {
    fn from(status: &str) -> Self {
        match status.trim().to_lowercase().as_str() {
            "running" => ContainerState::Running,
            "created" => ContainerState::Created,
            "exited" | "stopped" => ContainerState::Stopped,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "dead" | "removing" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Running => "running",
            ContainerState::Created => "created",
            ContainerState::Stopped => "stopped",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Dead => "dead",
            ContainerState::Missing => "missing",
            ContainerState::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3661), "1h 1m");
        assert_eq!(format_duration(86400), "1d 0h");
    }

    #[test]
    fn test_mask_sensitive() {
        let token = "1234567890:AAFakeTokenValue";
        assert_eq!(mask_sensitive(token, 4), "1234...alue");
        assert_eq!(mask_sensitive("abc", 4), "***");
    }

    #[test]
    fn test_mask_sensitive_counts_characters() {
        assert_eq!(mask_sensitive("1ééééééééééé", 4), "1ééé...éééé");
        assert_eq!(mask_sensitive("éééé", 2), "****");
    }

    #[test]
    fn test_tail_excerpt() {
        assert_eq!(tail_excerpt("short", 10), "short");
        assert_eq!(tail_excerpt("exactly", 7), "exactly");
        assert_eq!(tail_excerpt("abcdef", 3), "…def");
        assert_eq!(tail_excerpt("ééééé", 2), "…éé");

        let long = "x".repeat(5000);
        assert_eq!(tail_excerpt(&long, 900).chars().count(), 901);
    }

    #[test]
    fn test_escape_every_special_character() {
        let raw = "\\_*[]()~`>#+-=|{}.!";
        let escaped = escape_markdown_v2(raw);
        assert_eq!(escaped, "\\\\\\_\\*\\[\\]\\(\\)\\~\\`\\>\\#\\+\\-\\=\\|\\{\\}\\.\\!");

        // Stripping one backslash before every escaped char yields the literal text
        let mut unescaped = String::new();
        let mut chars = escaped.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                unescaped.push(chars.next().unwrap());
            } else {
                unescaped.push(c);
            }
        }
        assert_eq!(unescaped, raw);
    }

    #[test]
    fn test_escape_leaves_plain_text() {
        assert_eq!(escape_markdown_v2("Remnawave 2"), "Remnawave 2");
        assert_eq!(escape_markdown_v2("v1.6.2"), "v1\\.6\\.2");
    }

    #[test]
    fn test_archive_name_round_trip() {
        let stamp = NaiveDate::from_ymd_opt(2025, 3, 9)
            .unwrap()
            .and_hms_opt(4, 5, 6)
            .unwrap();
        let name = archive_file_name(&stamp);
        assert_eq!(name, "remnawave_backup_2025-03-09_04_05_06.tar.gz");
        assert_eq!(parse_archive_stamp(&name), Some(stamp));
    }

    #[test]
    fn test_parse_archive_stamp_rejects_foreign_names() {
        assert_eq!(parse_archive_stamp("remnawave_backup_latest.tar.gz"), None);
        assert_eq!(parse_archive_stamp("remnawave_backup_2025-03-09_04_05_06.tar.gz.partial"), None);
        assert_eq!(parse_archive_stamp("dump_2025-03-09_04_05_06.sql.gz"), None);
    }

    #[test]
    fn test_prompt_line_and_affirmative() {
        let mut input = std::io::Cursor::new(b"  Y \n".to_vec());
        let mut output = Vec::new();
        let answer = prompt_line(&mut input, &mut output, "Continue? ").unwrap();
        assert_eq!(answer, "Y");
        assert_eq!(String::from_utf8(output).unwrap(), "Continue? ");
        assert!(is_affirmative(&answer));
        assert!(!is_affirmative(""));
        assert!(!is_affirmative("n"));
    }

    #[test]
    fn test_container_state() {
        assert_eq!(ContainerState::from("running"), ContainerState::Running);
        assert_eq!(ContainerState::from("exited"), ContainerState::Stopped);
        assert_eq!(ContainerState::from("removing"), ContainerState::Dead);
        assert_eq!(ContainerState::from("bogus"), ContainerState::Unknown);
        assert!(ContainerState::Running.is_running());
        assert!(!ContainerState::Restarting.is_running());
        assert_eq!(ContainerState::Missing.as_str(), "missing");
    }
}
