//! Auto-responder match engine
//!
//! Compiles an ordered trigger list into an immutable [`TriggerSet`] and
//! matches incoming text against it. Matching is pure: first trigger, then
//! first pattern within that trigger, wins.

use super::config::TriggerDefinition;
use super::pattern::{compile_alternatives, Bindings, CompileError, CompiledPattern};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of matching a message against the trigger set
#[derive(Debug, Clone)]
pub struct MatchResult {
    /// The trigger that fired
    pub trigger: Arc<TriggerDefinition>,
    /// Index of the pattern alternative that matched
    pub pattern_index: usize,
    /// Text of the pattern alternative that matched
    pub pattern: String,
    /// Slot values captured by that pattern
    pub bindings: Bindings,
}

impl MatchResult {
    pub fn trigger_id(&self) -> &str {
        &self.trigger.id
    }
}

/// A trigger with its compiled patterns
#[derive(Debug, Clone)]
pub struct CompiledTrigger {
    definition: Arc<TriggerDefinition>,
    patterns: Vec<CompiledPattern>,
}

impl CompiledTrigger {
    /// Compile a trigger definition
    pub fn compile(definition: TriggerDefinition) -> Result<Self, CompileError> {
        let patterns = compile_alternatives(&definition.pattern)?;
        Ok(Self {
            definition: Arc::new(definition),
            patterns,
        })
    }

    pub fn definition(&self) -> &Arc<TriggerDefinition> {
        &self.definition
    }

    pub fn patterns(&self) -> &[CompiledPattern] {
        &self.patterns
    }

    /// Try each pattern in declaration order; the first success wins
    pub fn match_text(&self, text: &str) -> Option<MatchResult> {
        self.patterns
            .iter()
            .enumerate()
            .find_map(|(index, pattern)| {
                pattern.captures(text).map(|bindings| MatchResult {
                    trigger: self.definition.clone(),
                    pattern_index: index,
                    pattern: pattern.source().to_string(),
                    bindings,
                })
            })
    }
}

/// A trigger that failed to compile and will never match
#[derive(Debug, Clone)]
pub struct RejectedTrigger {
    pub id: String,
    pub error: CompileError,
}

/// Immutable, ordered set of compiled triggers
#[derive(Debug, Clone, Default)]
pub struct TriggerSet {
    triggers: Vec<CompiledTrigger>,
    rejected: Vec<RejectedTrigger>,
}

impl TriggerSet {
    /// Compile an ordered trigger list.
    ///
    /// Disabled triggers are skipped. Triggers whose patterns fail to compile
    /// are logged and recorded in [`TriggerSet::rejected`].
    pub fn compile(definitions: impl IntoIterator<Item = TriggerDefinition>) -> Self {
        let mut triggers = Vec::new();
        let mut rejected = Vec::new();

        for definition in definitions {
            if !definition.enabled {
                continue;
            }
            let id = definition.id.clone();
            match CompiledTrigger::compile(definition) {
                Ok(trigger) => triggers.push(trigger),
                Err(error) => {
                    warn!(trigger_id = %id, error = %error, "trigger pattern rejected, trigger disabled");
                    rejected.push(RejectedTrigger { id, error });
                }
            }
        }

        Self { triggers, rejected }
    }

    /// Find the first trigger whose pattern matches the entire text
    pub fn find_match(&self, text: &str) -> Option<MatchResult> {
        let result = self.triggers.iter().find_map(|t| t.match_text(text));
        if let Some(m) = &result {
            debug!(
                trigger_id = %m.trigger_id(),
                pattern_index = m.pattern_index,
                "message matched trigger"
            );
        }
        result
    }

    /// Active triggers in evaluation order
    pub fn triggers(&self) -> &[CompiledTrigger] {
        &self.triggers
    }

    /// Triggers disabled by compile errors
    pub fn rejected(&self) -> &[RejectedTrigger] {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}

/// Holder of the current trigger snapshot.
///
/// Readers take an `Arc` of the current set and match against it without
/// holding the lock; a reload swaps in a freshly compiled set.
#[derive(Debug, Default)]
pub struct TriggerStore {
    current: RwLock<Arc<TriggerSet>>,
}

impl TriggerStore {
    /// Create a store from an initial trigger list
    pub fn new(definitions: impl IntoIterator<Item = TriggerDefinition>) -> Self {
        Self {
            current: RwLock::new(Arc::new(TriggerSet::compile(definitions))),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<TriggerSet> {
        self.current.read().clone()
    }

    /// Compile a new trigger list and swap it in, returning the new snapshot
    pub fn reload(&self, definitions: impl IntoIterator<Item = TriggerDefinition>) -> Arc<TriggerSet> {
        let compiled = Arc::new(TriggerSet::compile(definitions));
        *self.current.write() = compiled.clone();
        compiled
    }
}
