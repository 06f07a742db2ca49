//! Content-length gate
//!
//! Responses under the threshold go to the step directly. Anything at or
//! above it is staged, sampled and reduced by an extraction procedure
//! derived from the step's return contract, so the step only ever sees
//! the contract's fields.

use serde_json::Value;
use stepwise_core::{FieldShape, ReturnSpec, StepwiseConfig};
use stepwise_sandbox::{ExtractionProcedure, FieldRule, InputFormat, Reduce};

/// Where a response goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Used as is
    Direct,
    /// Staged and extracted
    Extract,
}

/// Size gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentGate {
    /// Responses of this many bytes or more are extracted
    pub threshold_bytes: usize,
    /// Lines sampled from a staged payload
    pub sample_lines: usize,
}

impl ContentGate {
    /// Gate from configuration
    #[must_use]
    pub fn from_config(cfg: &StepwiseConfig) -> Self {
        Self {
            threshold_bytes: cfg.gate.threshold_bytes,
            sample_lines: cfg.gate.sample_lines,
        }
    }

    /// Route a response of `len` bytes
    #[inline]
    #[must_use]
    pub fn route(&self, len: usize) -> Route {
        if len >= self.threshold_bytes {
            Route::Extract
        } else {
            Route::Direct
        }
    }
}

impl Default for ContentGate {
    fn default() -> Self {
        Self::from_config(&StepwiseConfig::default())
    }
}

/// Derives an extraction procedure from a payload sample
pub trait ProcedureDeriver: Send + Sync {
    /// Procedure producing exactly the contract's fields
    fn derive(&self, sample: &[String], spec: &ReturnSpec) -> ExtractionProcedure;
}

/// Default deriver: one rule per contract field, shaped by the field type
#[derive(Debug, Clone, Copy, Default)]
pub struct ContractProjection;

impl ProcedureDeriver for ContractProjection {
    fn derive(&self, sample: &[String], spec: &ReturnSpec) -> ExtractionProcedure {
        let format = infer_format(sample);
        let mut procedure = ExtractionProcedure::over_artifact(format);
        for (name, shape) in &spec.shape {
            procedure = procedure.with_field(name.clone(), rule_for(format, sample, name, *shape));
        }
        procedure
    }
}

/// Guess the payload format from its first lines
#[must_use]
pub fn infer_format(sample: &[String]) -> InputFormat {
    let lines: Vec<&str> = sample
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();
    let Some(first) = lines.first() else {
        return InputFormat::Lines;
    };
    let complete_rows = lines
        .iter()
        .take_while(|l| serde_json::from_str::<Value>(l).is_ok_and(|v| v.is_object()))
        .count();
    if lines.len() > 1 && complete_rows == lines.len() {
        InputFormat::JsonLines
    } else if first.starts_with('{') || first.starts_with('[') {
        InputFormat::Json
    } else {
        InputFormat::Lines
    }
}

fn rule_for(format: InputFormat, sample: &[String], field: &str, shape: FieldShape) -> FieldRule {
    let top_level_array = sample
        .iter()
        .map(|l| l.trim_start())
        .find(|l| !l.is_empty())
        .is_some_and(|l| l.starts_with('['));
    match format {
        InputFormat::Json if !top_level_array => match shape {
            FieldShape::Array => FieldRule::new(format!("{field}.*"), Reduce::Collect),
            _ => FieldRule::new(field, Reduce::Value),
        },
        InputFormat::Json | InputFormat::JsonLines => {
            let path = format!("*.{field}");
            match shape {
                FieldShape::Array => FieldRule::new(path, Reduce::Collect),
                FieldShape::Integer | FieldShape::Number if field_looks_countable(field) => {
                    FieldRule::new("*", Reduce::Count)
                }
                _ => FieldRule::new(path, Reduce::First),
            }
        }
        InputFormat::Lines => match shape {
            FieldShape::Array => FieldRule::new("*", Reduce::Collect),
            FieldShape::Integer | FieldShape::Number => FieldRule::new("*", Reduce::Count),
            _ => FieldRule::new("*", Reduce::Join),
        },
    }
}

fn field_looks_countable(field: &str) -> bool {
    let lower = field.to_ascii_lowercase();
    lower == "count" || lower == "total" || lower.ends_with("_count")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    #[test]
    fn threshold_is_inclusive() {
        let gate = ContentGate {
            threshold_bytes: 50_000,
            sample_lines: 20,
        };
        assert_eq!(gate.route(49_999), Route::Direct);
        assert_eq!(gate.route(50_000), Route::Extract);
        assert_eq!(gate.route(50_001), Route::Extract);
    }

    #[test]
    fn default_threshold_is_fifty_kib() {
        let gate = ContentGate::default();
        assert_eq!(gate.route(51_199), Route::Direct);
        assert_eq!(gate.route(51_201), Route::Extract);
    }

    #[test]
    fn formats_are_inferred() {
        assert_eq!(infer_format(&lines("{\"a\":1}\n{\"a\":2}")), InputFormat::JsonLines);
        assert_eq!(infer_format(&lines("{\n  \"a\": [")), InputFormat::Json);
        assert_eq!(infer_format(&lines("[{\"a\":1},")), InputFormat::Json);
        assert_eq!(infer_format(&lines("plain text\nmore")), InputFormat::Lines);
        assert_eq!(infer_format(&[]), InputFormat::Lines);
    }

    #[test]
    fn object_payload_projects_fields() {
        let spec = ReturnSpec::new()
            .with_field("outlets", FieldShape::Array)
            .with_field("total", FieldShape::Integer);
        let proc = ContractProjection.derive(&lines("{\"outlets\": ["), &spec);
        assert_eq!(proc.format, InputFormat::Json);
        assert_eq!(proc.fields["outlets"], FieldRule::new("outlets.*", Reduce::Collect));
        assert_eq!(proc.fields["total"], FieldRule::new("total", Reduce::Value));
    }

    #[test]
    fn object_payload_arrays_can_be_narrowed() {
        let spec = ReturnSpec::new().with_field("outlets", FieldShape::Array);
        let proc = ContractProjection.derive(&lines("{\"outlets\": ["), &spec);
        let narrowed = proc.narrowed().expect("array field narrows");
        assert_eq!(
            narrowed.fields["outlets"].limit,
            Some(stepwise_sandbox::DEFAULT_NARROW_LIMIT)
        );
    }

    #[test]
    fn row_payload_collects_and_counts() {
        let spec = ReturnSpec::new()
            .with_field("outlet", FieldShape::Array)
            .with_field("count", FieldShape::Integer)
            .with_field("region", FieldShape::String);
        let proc = ContractProjection.derive(&lines("{\"outlet\":\"a\"}\n{\"outlet\":\"b\"}"), &spec);
        assert_eq!(proc.format, InputFormat::JsonLines);
        assert_eq!(proc.fields["outlet"], FieldRule::new("*.outlet", Reduce::Collect));
        assert_eq!(proc.fields["count"], FieldRule::new("*", Reduce::Count));
        assert_eq!(proc.fields["region"], FieldRule::new("*.region", Reduce::First));
    }
}
