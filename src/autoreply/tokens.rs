//! `{TOKEN}` expansion for script arguments and reply text
//!
//! A single left-to-right pass. Registered tokens are replaced by their value
//! (or by nothing when the value is unknown); any other `{...}` text is left
//! verbatim, so pattern syntax pasted into an argument field survives.

use super::pattern::Bindings;

/// Built-in token names
pub const BUILTIN_TOKENS: &[&str] = &[
    "IP",
    "PORT",
    "NODE_ID",
    "GEOFENCE_NAME",
    "EVENT",
    "VERSION",
    "NODECOUNT",
];

/// Values available to the expander
#[derive(Debug, Clone, Default)]
pub struct TokenValues {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub node_id: Option<String>,
    pub geofence_name: Option<String>,
    pub event: Option<String>,
    pub version: Option<String>,
    pub node_count: Option<usize>,
    /// Captured slot values; each slot name is a token
    pub params: Bindings,
}

impl TokenValues {
    pub fn new() -> Self {
        Self {
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            ..Self::default()
        }
    }

    /// Value for a token.
    ///
    /// `None` means the name is not a token; `Some("")` means a known token
    /// without a value. Built-in names take precedence over slot names.
    fn lookup(&self, name: &str) -> Option<String> {
        let builtin = match name {
            "IP" => Some(self.ip.clone()),
            "PORT" => Some(self.port.map(|p| p.to_string())),
            "NODE_ID" => Some(self.node_id.clone()),
            "GEOFENCE_NAME" => Some(self.geofence_name.clone()),
            "EVENT" => Some(self.event.clone()),
            "VERSION" => Some(self.version.clone()),
            "NODECOUNT" => Some(self.node_count.map(|n| n.to_string())),
            _ => None,
        };
        match builtin {
            Some(value) => Some(value.unwrap_or_default()),
            None => self.params.get(name).map(str::to_string),
        }
    }
}

/// Expand `{TOKEN}` placeholders in `template`.
pub fn expand(template: &str, values: &TokenValues) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let replaced = after.find('}').and_then(|close| {
            let name = &after[..close];
            values.lookup(name).map(|value| (value, close))
        });

        match replaced {
            Some((value, close)) => {
                out.push_str(&value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
