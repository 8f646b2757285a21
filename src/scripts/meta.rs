//! Script catalog metadata
//!
//! Scripts may describe themselves in a comment block near the top:
//!
//! ```text
//! # mm_meta:
//! #   name: Weather Lookup
//! #   emoji: 🌤️
//! #   language: Python
//! ```
//!
//! `//` comments are accepted as well for JavaScript.

use super::sandbox::ScriptSandbox;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Only this many leading lines are searched for a header
const HEADER_SCAN_LINES: usize = 20;

const HEADER_MARKER: &str = "mm_meta:";

/// Self-description parsed from a script header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScriptMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl ScriptMeta {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.emoji.is_none() && self.language.is_none()
    }
}

/// A script found in the scripts directory
#[derive(Debug, Clone, Serialize)]
pub struct ScriptEntry {
    /// Path relative to the scripts directory
    pub path: PathBuf,
    #[serde(flatten)]
    pub meta: ScriptMeta,
}

fn strip_comment(line: &str) -> Option<&str> {
    let line = line.trim_start();
    line.strip_prefix('#')
        .or_else(|| line.strip_prefix("//"))
        .map(str::trim)
}

/// Parse the `mm_meta:` block out of script source
pub fn parse_header(source: &str) -> ScriptMeta {
    let mut meta = ScriptMeta::default();
    let mut in_block = false;

    for line in source.lines().take(HEADER_SCAN_LINES) {
        let Some(comment) = strip_comment(line) else {
            if in_block {
                break;
            }
            continue;
        };

        if !in_block {
            in_block = comment == HEADER_MARKER;
            continue;
        }

        let Some((key, value)) = comment.split_once(':') else {
            break;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "name" => meta.name = Some(value.to_string()),
            "emoji" => meta.emoji = Some(value.to_string()),
            "language" => meta.language = Some(value.to_string()),
            _ => {}
        }
    }

    meta
}

/// List scripts with allowed extensions under the sandbox root, sorted by path.
///
/// Subdirectories are walked; unreadable entries are skipped.
pub fn scan(sandbox: &ScriptSandbox) -> std::io::Result<Vec<ScriptEntry>> {
    let root = sandbox.root();
    let mut entries = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !file_type.is_file() || !sandbox.is_allowed_extension(&path) {
                continue;
            }
            entries.push(ScriptEntry {
                path: relative_to(&path, root),
                meta: read_meta(&path),
            });
        }
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn read_meta(path: &Path) -> ScriptMeta {
    match std::fs::read(path) {
        Ok(bytes) => parse_header(&String::from_utf8_lossy(&bytes)),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "cannot read script header");
            ScriptMeta::default()
        }
    }
}

fn relative_to(path: &Path, root: &Path) -> PathBuf {
    path.strip_prefix(root).unwrap_or(path).to_path_buf()
}
