//! Trigger definitions
//!
//! Triggers are owned by an external store and handed to the engine as an
//! ordered list. Order matters: the first trigger that matches a message is
//! the only one that fires.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What a trigger does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    /// Run a script from the scripts directory and send its output
    Script,
    /// Send the response text, after token expansion
    #[default]
    #[serde(rename = "text")]
    StaticText,
}

impl std::fmt::Display for ResponseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Script => write!(f, "script"),
            Self::StaticText => write!(f, "text"),
        }
    }
}

/// Auto-responder trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDefinition {
    /// Trigger ID (unique identifier)
    pub id: String,
    /// Pattern text; comma-separated alternatives tried left to right
    pub pattern: String,
    /// Response kind
    #[serde(default)]
    pub response_type: ResponseType,
    /// Script path (relative to the scripts directory) or literal reply text
    pub response: String,
    /// Script argument template with `{TOKEN}` placeholders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    /// Whether the trigger is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl TriggerDefinition {
    /// Create a trigger that replies with static text
    pub fn text(
        id: impl Into<String>,
        pattern: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            pattern: pattern.into(),
            response_type: ResponseType::StaticText,
            response: response.into(),
            arguments: None,
            enabled: true,
        }
    }

    /// Create a trigger that runs a script
    pub fn script(
        id: impl Into<String>,
        pattern: impl Into<String>,
        script: impl Into<String>,
    ) -> Self {
        Self {
            response_type: ResponseType::Script,
            ..Self::text(id, pattern, script)
        }
    }

    /// Set the argument template
    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = Some(arguments.into());
        self
    }

    /// Set enabled flag
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Check an ordered trigger list for structural problems.
///
/// Pattern errors are not reported here; they are found (and the trigger
/// disabled) when the list is compiled.
pub fn validate_definitions(triggers: &[TriggerDefinition]) -> Result<(), String> {
    let mut seen_ids = HashSet::new();
    for trigger in triggers {
        if trigger.id.trim().is_empty() {
            return Err("Trigger ID must not be empty".to_string());
        }
        if !seen_ids.insert(trigger.id.as_str()) {
            return Err(format!("Duplicate trigger ID: {}", trigger.id));
        }
        if trigger.response_type == ResponseType::Script && trigger.response.trim().is_empty() {
            return Err(format!("Trigger {} has no script path", trigger.id));
        }
    }
    Ok(())
}
