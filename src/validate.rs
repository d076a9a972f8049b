//! Argument schemas checked by the permission table before a resolver runs.

use serde_json::Value;

use crate::error::{AppError, ValidationIssue};

/// Constraint attached to a single argument.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgSchema {
    /// Required string whose length in characters lies in `min..=max`.
    Text {
        label: &'static str,
        min: usize,
        max: usize,
    },
    /// Optional integer (absent or null passes) bounded below and optionally above.
    Int {
        label: &'static str,
        min: i64,
        max: Option<i64>,
    },
}

impl ArgSchema {
    /// Question bounds for the chatbot.
    pub const fn question() -> Self {
        ArgSchema::Text {
            label: "Question",
            min: 2,
            max: 500,
        }
    }

    /// Check the value found at `path` inside `args`.
    pub fn check(&self, args: &Value, path: &str) -> Result<(), AppError> {
        let value = lookup(args, path);
        match self.issue(value) {
            Some(message) => Err(AppError::bad_input(vec![ValidationIssue {
                path: path.to_string(),
                message,
            }])),
            None => Ok(()),
        }
    }

    fn issue(&self, value: Option<&Value>) -> Option<String> {
        match self {
            ArgSchema::Text { label, min, max } => {
                let text = match value {
                    Some(Value::String(s)) => s,
                    None | Some(Value::Null) => return Some(format!("{} is required", label)),
                    Some(_) => return Some(format!("{} must be a string", label)),
                };
                // Unicode scalar values, so one emoji counts once.
                let len = text.chars().count();
                if len < *min {
                    Some(format!("{} must be at least {} characters", label, min))
                } else if len > *max {
                    Some(format!("{} cannot exceed {} characters", label, max))
                } else {
                    None
                }
            }
            ArgSchema::Int { label, min, max } => {
                let n = match value {
                    None | Some(Value::Null) => return None,
                    Some(v) => match v.as_i64() {
                        Some(n) => n,
                        None => return Some(format!("{} must be an integer", label)),
                    },
                };
                if n < *min {
                    return Some(format!("{} must be at least {}", label, min));
                }
                match max {
                    Some(max) if n > *max => Some(format!("{} cannot exceed {}", label, max)),
                    _ => None,
                }
            }
        }
    }
}

/// Resolve a dotted argument path (`input.title`) inside a JSON object.
fn lookup<'a>(args: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|seg| !seg.is_empty())
        .try_fold(args, |node, seg| node.get(seg))
}
