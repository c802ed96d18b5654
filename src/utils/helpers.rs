/// Helper utilities for the backup agent

use chrono::{DateTime, Utc};
use nix::unistd::{Gid, Uid};
use regex::Regex;
use std::path::{Component, Path, PathBuf};

use super::constants::BACKUPS_DIR;

/// Session tag for `now`: ISO-8601 UTC, second precision
pub fn session_tag(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Every path one backup or restore session touches
///
/// All of them are derived from the tag, so two sessions with different
/// tags never share a scratch directory or an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub backups_root: PathBuf,
    pub session_dir: PathBuf,
    pub archive: PathBuf,
    pub legacy_archive: PathBuf,
}

/// Whether `name` can be used as a single path component of a session
///
/// Accepts timestamp-style names only: letters, digits and `_.:+-`, not
/// starting with a dot and never containing `..`.
pub fn is_valid_session_name(name: &str) -> bool {
    let Ok(pattern) = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:+-]*$") else {
        return false;
    };
    pattern.is_match(name) && !name.contains("..")
}

/// `name` joined onto `root` as exactly one normal component
fn child_of(root: &Path, name: &str) -> Option<PathBuf> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(root.join(name)),
        _ => None,
    }
}

impl SessionPaths {
    /// Paths for one session, `None` if the tag or hostname would leave
    /// the backups directory
    pub fn new(data_path: &Path, hostname: &str, tag: &str) -> Option<Self> {
        if !is_valid_session_name(tag) || !is_valid_session_name(hostname) {
            return None;
        }

        let backups_root = data_path.join(BACKUPS_DIR);
        Some(Self {
            session_dir: child_of(&backups_root, tag)?,
            archive: child_of(&backups_root, &archive_name(hostname, tag))?,
            legacy_archive: child_of(&backups_root, &legacy_archive_name(hostname, tag))?,
            backups_root,
        })
    }
}

pub fn archive_name(hostname: &str, tag: &str) -> String {
    format!("{}_{}.tar.gz", hostname, tag)
}

pub fn legacy_archive_name(hostname: &str, tag: &str) -> String {
    format!("{}_{}.tar", hostname, tag)
}

/// Host name from /etc/hostname, falling back to the kernel's
pub fn hostname() -> String {
    if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

pub fn is_root() -> bool {
    Uid::effective().is_root()
}

/// Owner to hand data directories to before touching them from the host
///
/// `None` when running as root, which can write anywhere.
pub fn host_owner() -> Option<(u32, u32)> {
    if is_root() {
        None
    } else {
        Some((Uid::current().as_raw(), Gid::current().as_raw()))
    }
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

/// Format duration to human-readable string
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Mask a credential for logging (first and last N characters)
pub fn mask_sensitive(value: &str, visible_chars: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= visible_chars * 2 {
        "*".repeat(chars.len())
    } else {
        let start: String = chars[..visible_chars].iter().collect();
        let end: String = chars[chars.len() - visible_chars..].iter().collect();
        format!("{}...{}", start, end)
    }
}
