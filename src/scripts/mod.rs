//! Reply script sandbox
//!
//! Resolves, validates and runs external reply scripts with a constructed
//! environment and bounded time and output, then decodes their JSON output
//! into reply text.

pub mod args;
pub mod context;
pub mod executor;
pub mod meta;
pub mod output;
pub mod sandbox;

pub use context::{ExecutionContext, Position};
pub use executor::{ExecutorLimits, ScriptExecutor, ScriptInvocation, ScriptResult, ScriptRunner};
pub use output::{interpret, OversizePolicy, ParseError, ReplyPolicy};
pub use sandbox::{ResolvedScript, ScriptSandbox};

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors from resolving, running or decoding a script
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Script rejected by sandbox: {0}")]
    Security(String),

    #[error("Script not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Script timed out after {0:?}")]
    Timeout(Duration),

    #[error("Script was cancelled")]
    Cancelled,

    #[error("Failed to run script: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Script failed with exit code {code:?}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("Script reported failure: {0}")]
    Reported(String),

    #[error("Invalid script output: {0}")]
    Parse(#[from] ParseError),
}

impl ScriptError {
    /// Soft failures are expected script behaviour: logged, nothing sent.
    /// Everything else points at a broken trigger or host setup.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Cancelled | Self::Reported(_) | Self::Parse(_)
        )
    }
}

/// Result type for script operations
pub type Result<T> = std::result::Result<T, ScriptError>;
