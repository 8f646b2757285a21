//! Auto-reply Module
//!
//! Matches incoming mesh messages against trigger patterns and produces
//! replies from static text or sandboxed scripts.

pub mod config;
pub mod engine;
pub mod pattern;
pub mod responder;
pub mod tokens;
pub mod watcher;

pub use config::{validate_definitions, ResponseType, TriggerDefinition};
pub use engine::{CompiledTrigger, MatchResult, RejectedTrigger, TriggerSet, TriggerStore};
pub use pattern::{Bindings, CompileError, CompiledPattern, PatternSpec};
pub use responder::{
    AutoResponder, IncomingMessage, MeshContext, ResponderError, ResponseOutcome, ScriptRequest,
};
pub use tokens::{expand, TokenValues};
pub use watcher::TriggerWatcher;
