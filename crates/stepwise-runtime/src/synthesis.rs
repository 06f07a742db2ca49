//! Final response synthesis
//!
//! Built only from values read back through the memory gateway, never
//! from raw skill responses.

use serde_json::Value;
use std::collections::BTreeMap;

/// Field a step may use to carry user-facing text
pub const RESPONSE_FIELD: &str = "response_text";

/// Compose the user response from step outputs, in step order
///
/// The last output's non-blank `response_text` wins; otherwise the last
/// output is echoed as key-sorted JSON.
#[must_use]
pub fn synthesize(outputs: &[Value], any_completed: bool) -> String {
    let Some(last) = outputs.last() else {
        return if any_completed {
            "Execution complete.".to_string()
        } else {
            "No steps completed.".to_string()
        };
    };
    if let Some(text) = last
        .get(RESPONSE_FIELD)
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())
    {
        return text.to_string();
    }
    format!("Execution complete. {}", canonical(last))
}

fn canonical(value: &Value) -> String {
    serde_json::to_string(&Sorted(value)).unwrap_or_else(|_| value.to_string())
}

/// Serializes objects with keys in lexical order regardless of map flavor
struct Sorted<'a>(&'a Value);

impl serde::Serialize for Sorted<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Sorted<'_>> =
                    map.iter().map(|(k, v)| (k, Sorted(v))).collect();
                sorted.serialize(serializer)
            }
            Value::Array(items) => {
                let items: Vec<Sorted<'_>> = items.iter().map(Sorted).collect();
                items.serialize(serializer)
            }
            other => other.serialize(serializer),
        }
    }
}
