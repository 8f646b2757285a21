//! Reply envelopes and mesh node addressing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Numeric mesh node address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeNum(pub u32);

impl NodeNum {
    /// Display form used on the mesh, e.g. `!abcd1234`
    pub fn node_id(&self) -> String {
        format!("!{:08x}", self.0)
    }
}

impl fmt::Display for NodeNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

impl From<u32> for NodeNum {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Accepts `!abcd1234`, `0xabcd1234` or a decimal number
impl FromStr for NodeNum {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = if let Some(hex) = s.strip_prefix('!') {
            u32::from_str_radix(hex, 16)
        } else if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16)
        } else {
            s.parse::<u32>()
        };
        parsed
            .map(NodeNum)
            .map_err(|e| format!("invalid node number '{}': {}", s, e))
    }
}

/// Unique identifier for a queued reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(pub Uuid);

impl EnvelopeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One reply waiting for delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyEnvelope {
    pub id: EnvelopeId,
    pub destination: NodeNum,
    pub text: String,
    /// Position within its batch, starting at 0
    pub sequence: usize,
    pub batch_size: usize,
    /// Trigger that produced the reply, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    /// Send attempts made so far
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ReplyEnvelope {
    pub fn new(destination: NodeNum, text: impl Into<String>) -> Self {
        Self {
            id: EnvelopeId::new(),
            destination,
            text: text.into(),
            sequence: 0,
            batch_size: 1,
            trigger_id: None,
            attempts: 0,
            created_at: Utc::now(),
            last_error: None,
        }
    }

    /// Envelopes for an ordered batch of replies to one destination
    pub fn batch(destination: NodeNum, replies: Vec<String>, trigger_id: Option<&str>) -> Vec<Self> {
        let batch_size = replies.len();
        replies
            .into_iter()
            .enumerate()
            .map(|(sequence, text)| Self {
                sequence,
                batch_size,
                trigger_id: trigger_id.map(str::to_string),
                ..Self::new(destination, text)
            })
            .collect()
    }

    /// Record a failed attempt
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.attempts += 1;
        self.last_error = Some(error.into());
    }

    pub fn can_retry(&self, max_attempts: u32) -> bool {
        self.attempts < max_attempts
    }
}
