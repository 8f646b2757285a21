//! Script path validation.
//!
//! A script target must resolve, after following symlinks, to a regular file
//! strictly inside the configured scripts directory, and carry an allowed
//! extension. Nothing is spawned for a target that fails these checks.

use super::{Result, ScriptError};
use std::path::{Component, Path, PathBuf};

/// Extensions accepted when none are configured
pub const DEFAULT_EXTENSIONS: &[&str] = &[".js", ".mjs", ".py", ".sh"];

/// Interpreter used to launch a script with the given extension.
///
/// Scripts with an allowed extension but no known interpreter are executed
/// directly and need the executable bit.
pub fn interpreter_for(extension: &str) -> Option<&'static str> {
    match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "py" => Some("python3"),
        "js" | "mjs" => Some("node"),
        "sh" => Some("sh"),
        _ => None,
    }
}

/// A script that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedScript {
    path: PathBuf,
    interpreter: Option<&'static str>,
}

impl ResolvedScript {
    /// Canonical path of the script
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Interpreter program, if the script is not executed directly
    pub fn interpreter(&self) -> Option<&'static str> {
        self.interpreter
    }
}

/// Scripts directory plus extension allowlist
#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    root: PathBuf,
    allowed_extensions: Vec<String>,
}

impl ScriptSandbox {
    /// Create a sandbox rooted at `dir`, which must exist.
    pub fn new(dir: impl AsRef<Path>, allowed_extensions: &[String]) -> Result<Self> {
        let dir = dir.as_ref();
        let root = dir
            .canonicalize()
            .map_err(|_| ScriptError::NotFound(dir.to_path_buf()))?;
        if !root.is_dir() {
            return Err(ScriptError::Security(format!(
                "scripts directory '{}' is not a directory",
                root.display()
            )));
        }

        let allowed_extensions = allowed_extensions
            .iter()
            .map(|e| normalize_extension(e))
            .filter(|e| !e.is_empty())
            .collect();

        Ok(Self {
            root,
            allowed_extensions,
        })
    }

    /// Canonical scripts directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a file name carries an allowed extension
    pub fn is_allowed_extension(&self, path: &Path) -> bool {
        extension_of(path).is_some_and(|ext| self.allowed_extensions.contains(&ext))
    }

    /// Validate a script target and resolve it to a canonical path.
    ///
    /// `target` may be relative to the scripts directory or absolute.
    pub fn resolve(&self, target: &str) -> Result<ResolvedScript> {
        let target = target.trim();
        if target.is_empty() {
            return Err(ScriptError::Security("empty script path".to_string()));
        }

        let requested = Path::new(target);
        if requested
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(ScriptError::Security(format!(
                "path traversal in script path '{}'",
                target
            )));
        }
        if !self.is_allowed_extension(requested) {
            return Err(ScriptError::Security(format!(
                "extension of '{}' is not allowed",
                target
            )));
        }

        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };

        let canonical = match joined.canonicalize() {
            Ok(path) => path,
            Err(_) => {
                // Only report "not found" for paths that would have been inside
                if joined.starts_with(&self.root) {
                    return Err(ScriptError::NotFound(joined));
                }
                return Err(ScriptError::Security(format!(
                    "script path '{}' is outside the scripts directory",
                    target
                )));
            }
        };

        if canonical == self.root || !canonical.starts_with(&self.root) {
            return Err(ScriptError::Security(format!(
                "script path '{}' resolves outside the scripts directory",
                target
            )));
        }
        if !canonical.is_file() {
            return Err(ScriptError::Security(format!(
                "script path '{}' is not a regular file",
                target
            )));
        }
        // A symlink inside the directory must not retarget to another type
        if !self.is_allowed_extension(&canonical) {
            return Err(ScriptError::Security(format!(
                "script '{}' resolves to a file with a disallowed extension",
                target
            )));
        }

        let interpreter = extension_of(&canonical).and_then(|ext| interpreter_for(&ext));
        Ok(ResolvedScript {
            path: canonical,
            interpreter,
        })
    }
}

fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
    if ext.is_empty() {
        ext
    } else {
        format!(".{}", ext)
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(normalize_extension)
}
