//! Trigger pattern compiler
//!
//! Turns trigger pattern text such as `weather {location:[\w\s]+}` or
//! `hello {name}` into whole-string anchored regular expressions with one
//! named capture per slot.
//!
//! Grammar, scanned left to right:
//! - `{` opens a slot. The text up to an optional `:` is the slot name, the
//!   text after it up to the matching `}` is a regex fragment. Braces inside
//!   the fragment nest, so quantifiers like `\d{5}` are fine.
//! - A slot without a fragment matches one run of non-whitespace characters.
//! - Everything outside a slot is literal and matched case-sensitively.
//!
//! A trigger's pattern text may list several alternatives separated by commas
//! at the top level; see [`split_alternatives`].

use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;

/// Fragment used for slots that do not carry their own regex
pub const DEFAULT_SLOT_FRAGMENT: &str = r"\S+";

/// Pattern compilation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("Pattern is empty")]
    EmptyPattern,

    #[error("Unclosed slot starting at byte {0}")]
    UnclosedSlot(usize),

    #[error("Invalid slot name: '{0}'")]
    InvalidSlotName(String),

    #[error("Duplicate slot name: '{0}'")]
    DuplicateSlot(String),

    #[error("Invalid regex for slot '{slot}': {reason}")]
    InvalidFragment { slot: String, reason: String },

    #[error("Pattern failed to compile: {0}")]
    Regex(String),
}

/// One piece of a parsed pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Text matched verbatim
    Literal(String),
    /// Named capture point
    Slot {
        name: String,
        /// Author-supplied regex fragment (`None` = one non-whitespace run)
        fragment: Option<String>,
    },
}

/// A parsed (not yet compiled) pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternSpec {
    source: String,
    segments: Vec<Segment>,
}

impl PatternSpec {
    /// Parse a single pattern alternative.
    pub fn parse(text: &str) -> Result<Self, CompileError> {
        if text.trim().is_empty() {
            return Err(CompileError::EmptyPattern);
        }

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut seen = HashSet::new();
        let mut chars = text.char_indices();

        while let Some((start, c)) = chars.next() {
            if c != '{' {
                literal.push(c);
                continue;
            }

            let mut body = String::new();
            let mut depth = 1usize;
            let mut closed = false;
            while let Some((_, c)) = chars.next() {
                match c {
                    '\\' => {
                        body.push(c);
                        if let Some((_, escaped)) = chars.next() {
                            body.push(escaped);
                        }
                    }
                    '{' => {
                        depth += 1;
                        body.push(c);
                    }
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            closed = true;
                            break;
                        }
                        body.push(c);
                    }
                    _ => body.push(c),
                }
            }
            if !closed {
                return Err(CompileError::UnclosedSlot(start));
            }

            let (name, fragment) = match body.split_once(':') {
                Some((name, fragment)) => (name.trim(), Some(fragment)),
                None => (body.trim(), None),
            };
            if !is_valid_slot_name(name) {
                return Err(CompileError::InvalidSlotName(name.to_string()));
            }
            if !seen.insert(name.to_string()) {
                return Err(CompileError::DuplicateSlot(name.to_string()));
            }

            let fragment = fragment.filter(|f| !f.is_empty()).map(str::to_string);
            if let Some(f) = &fragment {
                // Validate on its own so a fragment cannot unbalance the
                // surrounding expression (e.g. `a)(b`).
                Regex::new(f).map_err(|e| CompileError::InvalidFragment {
                    slot: name.to_string(),
                    reason: e.to_string(),
                })?;
            }

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Slot {
                name: name.to_string(),
                fragment,
            });
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: text.to_string(),
            segments,
        })
    }

    /// Original pattern text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Parsed segments in pattern order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Slot names in pattern order
    pub fn slot_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Slot { name, .. } => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Render the anchored regular expression for this pattern
    pub fn to_regex_source(&self) -> String {
        let mut expr = String::from("^(?:");
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => expr.push_str(&regex::escape(text)),
                Segment::Slot { name, fragment } => {
                    let fragment = fragment.as_deref().unwrap_or(DEFAULT_SLOT_FRAGMENT);
                    expr.push_str(&format!("(?P<{}>{})", name, fragment));
                }
            }
        }
        expr.push_str(")$");
        expr
    }
}

/// Slot values captured by a match, in pattern order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings(Vec<(String, String)>);

impl Bindings {
    /// Create an empty binding set
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a binding
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Look up a captured value by slot name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate `(name, value)` pairs in pattern order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A pattern compiled to an anchored matcher
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    spec: PatternSpec,
    regex: Regex,
}

impl CompiledPattern {
    /// Parse and compile a single pattern alternative
    pub fn compile(text: &str) -> Result<Self, CompileError> {
        Self::from_spec(PatternSpec::parse(text)?)
    }

    /// Compile an already parsed pattern
    pub fn from_spec(spec: PatternSpec) -> Result<Self, CompileError> {
        let regex =
            Regex::new(&spec.to_regex_source()).map_err(|e| CompileError::Regex(e.to_string()))?;
        Ok(Self { spec, regex })
    }

    /// Original pattern text
    pub fn source(&self) -> &str {
        self.spec.source()
    }

    /// Parsed form of the pattern
    pub fn spec(&self) -> &PatternSpec {
        &self.spec
    }

    /// Match the whole of `text`, returning slot bindings on success
    pub fn captures(&self, text: &str) -> Option<Bindings> {
        let caps = self.regex.captures(text)?;
        let mut bindings = Bindings::new();
        for name in self.spec.slot_names() {
            if let Some(m) = caps.name(name) {
                bindings.insert(name, m.as_str());
            }
        }
        Some(bindings)
    }

    /// Whether the whole of `text` matches
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Split trigger pattern text into its comma-separated alternatives.
///
/// Commas inside a slot (e.g. `{n:\d{1,3}}`) do not split. Alternatives are
/// trimmed and empty ones are dropped.
pub fn split_alternatives(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if depth > 0 => escaped = true,
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);

    parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Compile every alternative of a trigger's pattern text, in declaration order.
///
/// Fails if any alternative fails; a trigger is accepted whole or not at all.
pub fn compile_alternatives(text: &str) -> Result<Vec<CompiledPattern>, CompileError> {
    let alternatives = split_alternatives(text);
    if alternatives.is_empty() {
        return Err(CompileError::EmptyPattern);
    }
    alternatives.into_iter().map(CompiledPattern::compile).collect()
}

fn is_valid_slot_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
