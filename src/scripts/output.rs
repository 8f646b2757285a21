//! Script output decoding
//!
//! Scripts print one JSON object on stdout, either
//! `{"response": "text"}` or `{"responses": ["a", "b"]}`. Extra fields such as
//! `actions` or `details` are ignored. `"success": false`, or an `"error"`
//! string without any response field, marks a reported failure.

use super::executor::ScriptResult;
use super::ScriptError;
use crate::logging::preview;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

/// Maximum reply length used by the mesh transport framing
pub const DEFAULT_MAX_REPLY_CHARS: usize = 200;

/// Output decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("stdout is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("stdout JSON is not an object")]
    NotAnObject,

    #[error("output has neither 'response' nor 'responses'")]
    MissingResponse,

    #[error("'{0}' has the wrong type")]
    WrongType(&'static str),

    #[error("stdout exceeded {0} bytes")]
    Oversized(usize),
}

/// What to do with a reply longer than the limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OversizePolicy {
    /// Cut the reply to the limit
    #[default]
    Truncate,
    /// Drop the offending reply, keep the rest of the batch
    Reject,
}

/// Per-reply validation rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyPolicy {
    pub max_chars: usize,
    pub oversize: OversizePolicy,
}

impl Default for ReplyPolicy {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_MAX_REPLY_CHARS,
            oversize: OversizePolicy::Truncate,
        }
    }
}

impl ReplyPolicy {
    /// Apply length rules to candidate replies, preserving order.
    ///
    /// Empty replies are skipped.
    pub fn apply(&self, replies: Vec<String>) -> Vec<String> {
        replies
            .into_iter()
            .filter(|r| !r.is_empty())
            .filter_map(|reply| {
                let len = reply.chars().count();
                if len <= self.max_chars {
                    return Some(reply);
                }
                match self.oversize {
                    OversizePolicy::Truncate => Some(reply.chars().take(self.max_chars).collect()),
                    OversizePolicy::Reject => {
                        warn!(
                            chars = len,
                            max = self.max_chars,
                            reply = %preview(&reply, 40),
                            "reply exceeds length limit, dropped"
                        );
                        None
                    }
                }
            })
            .collect()
    }
}

/// Decode stdout into a JSON object
pub fn decode(stdout: &[u8]) -> Result<Map<String, Value>, ParseError> {
    let text = String::from_utf8_lossy(stdout);
    let value: Value = serde_json::from_str(text.trim())
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ParseError::NotAnObject),
    }
}

/// Failure reason if the output reports one
pub fn failure_indicator(output: &Map<String, Value>) -> Option<String> {
    let error = output.get("error").and_then(Value::as_str);
    if output.get("success").and_then(Value::as_bool) == Some(false) {
        return Some(error.unwrap_or("script reported success=false").to_string());
    }
    let has_response = output.contains_key("response") || output.contains_key("responses");
    match error {
        Some(error) if !has_response => Some(error.to_string()),
        _ => None,
    }
}

/// Extract candidate replies; `responses` wins over `response`
pub fn replies(output: &Map<String, Value>) -> Result<Vec<String>, ParseError> {
    if let Some(value) = output.get("responses") {
        let items = value.as_array().ok_or(ParseError::WrongType("responses"))?;
        return items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or(ParseError::WrongType("responses"))
            })
            .collect();
    }
    if let Some(value) = output.get("response") {
        let text = value.as_str().ok_or(ParseError::WrongType("response"))?;
        return Ok(vec![text.to_string()]);
    }
    Err(ParseError::MissingResponse)
}

/// Turn a finished script run into reply text.
///
/// - exit 0 and a valid reply object: replies, after `policy`
/// - exit 0 or non-zero with a failure indicator: [`ScriptError::Reported`]
/// - non-zero without parseable JSON: [`ScriptError::Failed`]
/// - exit 0 with undecodable or truncated output: [`ScriptError::Parse`]
pub fn interpret(result: &ScriptResult, policy: &ReplyPolicy) -> Result<Vec<String>, ScriptError> {
    let decoded = if result.truncated {
        Err(ParseError::Oversized(result.stdout.len()))
    } else {
        decode(&result.stdout)
    };

    if !result.success {
        return match decoded {
            Ok(output) => Err(ScriptError::Reported(
                failure_indicator(&output).unwrap_or_else(|| match result.exit_code {
                    Some(code) => format!("exit code {}", code),
                    None => "terminated by signal".to_string(),
                }),
            )),
            Err(_) => Err(ScriptError::Failed {
                code: result.exit_code,
                stderr: preview(&String::from_utf8_lossy(&result.stderr), 200),
            }),
        };
    }

    let output = decoded?;
    if let Some(reason) = failure_indicator(&output) {
        return Err(ScriptError::Reported(reason));
    }
    Ok(policy.apply(replies(&output)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn result(exit_code: i32, stdout: &str) -> ScriptResult {
        ScriptResult {
            exit_code: Some(exit_code),
            success: exit_code == 0,
            stdout: stdout.as_bytes().to_vec(),
            stderr: b"trace".to_vec(),
            duration: Duration::from_millis(5),
            truncated: false,
        }
    }

    #[test]
    fn test_single_response() {
        let out = interpret(&result(0, r#"{"response":"Sunny, 72F"}"#), &ReplyPolicy::default())
            .unwrap();
        assert_eq!(out, vec!["Sunny, 72F"]);
    }

    #[test]
    fn test_multi_response_keeps_order() {
        let out = interpret(
            &result(0, "{\"responses\":[\"a\",\"b\",\"c\"]}\n"),
            &ReplyPolicy::default(),
        )
        .unwrap();
        assert_eq!(out, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_responses_wins_and_extras_ignored() {
        let out = interpret(
            &result(0, r#"{"response":"x","responses":["y"],"actions":{"log":true}}"#),
            &ReplyPolicy::default(),
        )
        .unwrap();
        assert_eq!(out, vec!["y"]);
    }

    #[test]
    fn test_wrong_shapes_are_parse_errors() {
        let policy = ReplyPolicy::default();
        for (stdout, expected) in [
            ("not json", None),
            ("[\"a\"]", Some(ParseError::NotAnObject)),
            ("{}", Some(ParseError::MissingResponse)),
            (r#"{"response":5}"#, Some(ParseError::WrongType("response"))),
            (r#"{"responses":["a",1]}"#, Some(ParseError::WrongType("responses"))),
            (r#"{"responses":"a"}"#, Some(ParseError::WrongType("responses"))),
        ] {
            match interpret(&result(0, stdout), &policy) {
                Err(ScriptError::Parse(e)) => {
                    if let Some(expected) = expected {
                        assert_eq!(e, expected);
                    }
                }
                other => panic!("{}: expected parse error, got {:?}", stdout, other),
            }
        }
    }

    #[test]
    fn test_nonzero_exit_without_json_is_hard_failure() {
        let err = interpret(&result(3, "Traceback..."), &ReplyPolicy::default()).unwrap_err();
        assert!(matches!(err, ScriptError::Failed { code: Some(3), ref stderr } if stderr == "trace"));
        assert!(!err.is_soft());
    }

    #[test]
    fn test_nonzero_exit_with_failure_json_is_soft() {
        let err = interpret(
            &result(1, r#"{"success":false,"error":"No Meshtastic host"}"#),
            &ReplyPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ScriptError::Reported(ref r) if r == "No Meshtastic host"));
        assert!(err.is_soft());

        // Non-zero exit never produces replies, even with a response field
        let err = interpret(&result(1, r#"{"response":"hi"}"#), &ReplyPolicy::default())
            .unwrap_err();
        assert!(matches!(err, ScriptError::Reported(_)));
    }

    #[test]
    fn test_zero_exit_failure_indicator() {
        let err = interpret(
            &result(0, r#"{"success":false,"response":"partial"}"#),
            &ReplyPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ScriptError::Reported(_)));

        let err = interpret(&result(0, r#"{"error":"boom"}"#), &ReplyPolicy::default()).unwrap_err();
        assert!(matches!(err, ScriptError::Reported(ref r) if r == "boom"));

        // An error field next to a response is informational
        let out = interpret(
            &result(0, r#"{"error":"minor","response":"ok"}"#),
            &ReplyPolicy::default(),
        )
        .unwrap();
        assert_eq!(out, vec!["ok"]);
    }

    #[test]
    fn test_truncated_output_is_oversized() {
        let mut r = result(0, r#"{"response":"#);
        r.truncated = true;
        let err = interpret(&r, &ReplyPolicy::default()).unwrap_err();
        assert!(matches!(err, ScriptError::Parse(ParseError::Oversized(_))));
    }

    #[test]
    fn test_truncate_policy() {
        let long = "é".repeat(250);
        let out = ReplyPolicy::default().apply(vec![long, "short".to_string()]);
        assert_eq!(out[0].chars().count(), 200);
        assert_eq!(out[1], "short");
    }

    #[test]
    fn test_reject_policy_drops_only_offender() {
        let policy = ReplyPolicy {
            max_chars: 5,
            oversize: OversizePolicy::Reject,
        };
        let out = policy.apply(vec![
            "one".to_string(),
            "far too long".to_string(),
            "".to_string(),
            "three".to_string(),
        ]);
        assert_eq!(out, vec!["one", "three"]);
    }
}
