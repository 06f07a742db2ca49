//! Extraction procedures
//!
//! A procedure is a declarative data-reduction program: where to read, how
//! to parse, and for each output field a path, an optional filter, a limit
//! and a reduction. Procedures carry no code, so they can only touch what
//! the runner hands them.

use crate::error::SandboxError;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::path::PathBuf;
use stepwise_core::ContentHash;

/// Multi-valued rules without an explicit limit start narrowing from here
pub const DEFAULT_NARROW_LIMIT: usize = 1_000;

/// Where the procedure reads from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "location")]
pub enum Source {
    /// The staged artifact handed to the runner
    Artifact,
    /// A remote location (always denied)
    Url(String),
    /// A local path (allowed only inside the artifact's scope)
    File(PathBuf),
}

/// How the input is parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    /// One JSON document
    Json,
    /// One JSON value per line
    JsonLines,
    /// Plain text, one string per line
    Lines,
}

/// How matched values collapse into a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduce {
    /// Single value for plain paths, array for wildcard paths
    Value,
    /// Array of all matches
    Collect,
    /// Number of matches
    Count,
    /// First match or null
    First,
    /// Numeric sum
    Sum,
    /// Numeric maximum
    Max,
    /// Numeric minimum
    Min,
    /// Matches joined with newlines
    Join,
    /// Array of distinct matches, first occurrence order
    Unique,
}

impl Reduce {
    /// Reductions that treat a single array match as its elements
    fn spreads_arrays(self) -> bool {
        matches!(self, Self::Collect | Self::Join | Self::Unique)
    }
}

/// Extraction rule for one output field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    /// Dot path; `*` iterates arrays, digits index them, empty is the root
    pub path: String,
    /// Regex a match must satisfy (strings as-is, other values as JSON text)
    #[serde(default)]
    pub filter: Option<String>,
    /// Cap on matches before reduction
    #[serde(default)]
    pub limit: Option<usize>,
    /// Reduction
    pub reduce: Reduce,
}

impl FieldRule {
    /// Rule taking the value at a path
    #[inline]
    #[must_use]
    pub fn new(path: impl Into<String>, reduce: Reduce) -> Self {
        Self {
            path: path.into(),
            filter: None,
            limit: None,
            reduce,
        }
    }

    /// With filter
    #[inline]
    #[must_use]
    pub fn with_filter(mut self, pattern: impl Into<String>) -> Self {
        self.filter = Some(pattern.into());
        self
    }

    /// With match limit
    #[inline]
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn is_multi_valued(&self) -> bool {
        match self.reduce {
            Reduce::Collect | Reduce::Join | Reduce::Unique => true,
            Reduce::Value => self.path.split('.').any(|s| s == "*"),
            _ => false,
        }
    }
}

/// A complete extraction program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionProcedure {
    /// Input location
    pub source: Source,
    /// Input format
    pub format: InputFormat,
    /// Output field name to rule
    pub fields: IndexMap<String, FieldRule>,
}

impl ExtractionProcedure {
    /// Procedure over the staged artifact
    #[inline]
    #[must_use]
    pub fn over_artifact(format: InputFormat) -> Self {
        Self {
            source: Source::Artifact,
            format,
            fields: IndexMap::new(),
        }
    }

    /// Add a field rule
    #[inline]
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, rule: FieldRule) -> Self {
        self.fields.insert(name.into(), rule);
        self
    }

    /// Audit hash over the canonical JSON form
    #[must_use]
    pub fn hash(&self) -> ContentHash {
        ContentHash::compute_serializable(self).unwrap_or_default()
    }

    /// A copy whose multi-valued rules keep half as many matches
    ///
    /// Returns `None` when nothing can be narrowed further.
    #[must_use]
    pub fn narrowed(&self) -> Option<Self> {
        let mut next = self.clone();
        let mut changed = false;
        for rule in next.fields.values_mut() {
            if !rule.is_multi_valued() {
                continue;
            }
            let current = rule.limit.unwrap_or(DEFAULT_NARROW_LIMIT * 2);
            let halved = current / 2;
            if halved >= 1 && halved < current {
                rule.limit = Some(halved);
                changed = true;
            }
        }
        changed.then_some(next)
    }

    /// Compile filters and check the program is well formed
    ///
    /// # Errors
    /// Returns `SandboxError::InvalidProcedure` on an empty program or a bad regex
    pub(crate) fn compile(&self) -> Result<CompiledProcedure, SandboxError> {
        if self.fields.is_empty() {
            return Err(SandboxError::InvalidProcedure("no fields".to_string()));
        }
        let mut rules = Vec::with_capacity(self.fields.len());
        for (name, rule) in &self.fields {
            let filter = rule
                .filter
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|e| SandboxError::InvalidProcedure(format!("{name}: {e}")))?;
            if rule.limit == Some(0) {
                return Err(SandboxError::InvalidProcedure(format!("{name}: limit must be positive")));
            }
            let segments = rule
                .path
                .split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            rules.push(CompiledRule {
                name: name.clone(),
                segments,
                filter,
                limit: rule.limit,
                reduce: rule.reduce,
                wildcard: rule.path.split('.').any(|s| s == "*"),
            });
        }
        Ok(CompiledProcedure {
            format: self.format,
            rules,
        })
    }
}

#[derive(Debug)]
pub(crate) struct CompiledRule {
    name: String,
    segments: Vec<String>,
    filter: Option<Regex>,
    limit: Option<usize>,
    reduce: Reduce,
    wildcard: bool,
}

#[derive(Debug)]
pub(crate) struct CompiledProcedure {
    pub(crate) format: InputFormat,
    rules: Vec<CompiledRule>,
}

impl CompiledProcedure {
    /// Parse raw input into the document the rules walk
    pub(crate) fn parse(&self, raw: &str, checkpoint: &dyn Fn() -> Result<(), SandboxError>) -> Result<Value, SandboxError> {
        match self.format {
            InputFormat::Json => serde_json::from_str(raw)
                .map_err(|e| SandboxError::InvalidInput(e.to_string())),
            InputFormat::JsonLines => {
                let mut rows = Vec::new();
                for (n, line) in raw.lines().enumerate() {
                    if n % 1024 == 0 {
                        checkpoint()?;
                    }
                    if line.trim().is_empty() {
                        continue;
                    }
                    let row = serde_json::from_str(line)
                        .map_err(|e| SandboxError::InvalidInput(format!("line {}: {e}", n + 1)))?;
                    rows.push(row);
                }
                Ok(Value::Array(rows))
            }
            InputFormat::Lines => Ok(Value::Array(
                raw.lines().map(|l| Value::String(l.to_string())).collect(),
            )),
        }
    }

    /// Apply every rule to the document
    pub(crate) fn evaluate(&self, doc: &Value, checkpoint: &dyn Fn() -> Result<(), SandboxError>) -> Result<Value, SandboxError> {
        let mut out = Map::new();
        for rule in &self.rules {
            checkpoint()?;
            let mut matches = Vec::new();
            select(doc, &rule.segments, &mut matches);
            if !rule.wildcard && rule.reduce.spreads_arrays() && matches.len() == 1 {
                if let Some(Value::Array(items)) = matches.first().copied() {
                    matches = items.iter().collect();
                }
            }
            if let Some(filter) = &rule.filter {
                matches.retain(|v| match v {
                    Value::String(s) => filter.is_match(s),
                    other => filter.is_match(&other.to_string()),
                });
            }
            if let Some(limit) = rule.limit {
                matches.truncate(limit);
            }
            out.insert(rule.name.clone(), reduce(rule, matches));
        }
        Ok(Value::Object(out))
    }
}

fn select<'a>(value: &'a Value, segments: &[String], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };
    match (head.as_str(), value) {
        ("*", Value::Array(items)) => {
            for item in items {
                select(item, rest, out);
            }
        }
        ("*", Value::Object(map)) => {
            for item in map.values() {
                select(item, rest, out);
            }
        }
        (key, Value::Object(map)) => {
            if let Some(next) = map.get(key) {
                select(next, rest, out);
            }
        }
        (key, Value::Array(items)) => {
            if let Some(next) = key.parse::<usize>().ok().and_then(|i| items.get(i)) {
                select(next, rest, out);
            }
        }
        _ => {}
    }
}

fn reduce(rule: &CompiledRule, matches: Vec<&Value>) -> Value {
    match rule.reduce {
        Reduce::Value if rule.wildcard => Value::Array(matches.into_iter().cloned().collect()),
        Reduce::Value | Reduce::First => matches.first().map_or(Value::Null, |v| (*v).clone()),
        Reduce::Collect => Value::Array(matches.into_iter().cloned().collect()),
        Reduce::Count => Value::from(matches.len()),
        Reduce::Sum => numeric(&matches, |acc, x| acc + x),
        Reduce::Max => numeric(&matches, f64::max),
        Reduce::Min => numeric(&matches, f64::min),
        Reduce::Join => Value::String(
            matches
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        Reduce::Unique => {
            let mut seen: Vec<Value> = Vec::new();
            for v in matches {
                if !seen.contains(v) {
                    seen.push(v.clone());
                }
            }
            Value::Array(seen)
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn numeric(matches: &[&Value], fold: impl Fn(f64, f64) -> f64) -> Value {
    let numbers: Vec<&Number> = matches
        .iter()
        .filter_map(|v| match v {
            Value::Number(n) => Some(n),
            _ => None,
        })
        .collect();
    let Some((first, rest)) = numbers.split_first() else {
        return Value::Null;
    };
    let all_integers = numbers.iter().all(|n| n.is_i64());
    let start = first.as_f64().unwrap_or(0.0);
    let total = rest
        .iter()
        .fold(start, |acc, n| fold(acc, n.as_f64().unwrap_or(0.0)));
    if all_integers && total.fract() == 0.0 && total.abs() < 9.0e15 {
        Value::from(total as i64)
    } else {
        Number::from_f64(total).map_or(Value::Null, Value::Number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(proc: &ExtractionProcedure, raw: &str) -> Value {
        let compiled = proc.compile().unwrap();
        let ok = || Ok(());
        let doc = compiled.parse(raw, &ok).unwrap();
        compiled.evaluate(&doc, &ok).unwrap()
    }

    #[test]
    fn projects_top_level_fields() {
        let proc = ExtractionProcedure::over_artifact(InputFormat::Json)
            .with_field("total", FieldRule::new("total", Reduce::Value));
        let out = run(&proc, r#"{"total": 3, "items": [1, 2, 3]}"#);
        assert_eq!(out, json!({"total": 3}));
    }

    #[test]
    fn wildcard_collects_nested_values() {
        let proc = ExtractionProcedure::over_artifact(InputFormat::Json)
            .with_field("names", FieldRule::new("items.*.name", Reduce::Value))
            .with_field("n", FieldRule::new("items.*", Reduce::Count));
        let out = run(&proc, r#"{"items": [{"name": "a"}, {"name": "b"}]}"#);
        assert_eq!(out, json!({"names": ["a", "b"], "n": 2}));
    }

    #[test]
    fn json_lines_with_filter_and_sum() {
        let proc = ExtractionProcedure::over_artifact(InputFormat::JsonLines)
            .with_field("tech", FieldRule::new("*.outlet", Reduce::Collect).with_filter("^tech"))
            .with_field("reach", FieldRule::new("*.reach", Reduce::Sum))
            .with_field("top", FieldRule::new("*.reach", Reduce::Max));
        let raw = "{\"outlet\":\"techcrunch\",\"reach\":10}\n{\"outlet\":\"bbc\",\"reach\":5}\n";
        let out = run(&proc, raw);
        assert_eq!(out, json!({"tech": ["techcrunch"], "reach": 15, "top": 10}));
    }

    #[test]
    fn lines_join_with_limit() {
        let proc = ExtractionProcedure::over_artifact(InputFormat::Lines)
            .with_field("head", FieldRule::new("*", Reduce::Join).with_limit(2));
        assert_eq!(run(&proc, "a\nb\nc"), json!({"head": "a\nb"}));
    }

    #[test]
    fn narrowing_halves_multi_valued_rules() {
        let proc = ExtractionProcedure::over_artifact(InputFormat::Json)
            .with_field("all", FieldRule::new("items.*", Reduce::Value))
            .with_field("n", FieldRule::new("items.*", Reduce::Count));
        let once = proc.narrowed().unwrap();
        assert_eq!(once.fields["all"].limit, Some(DEFAULT_NARROW_LIMIT));
        assert_eq!(once.fields["n"].limit, None);
        let twice = once.narrowed().unwrap();
        assert_eq!(twice.fields["all"].limit, Some(DEFAULT_NARROW_LIMIT / 2));
    }

    #[test]
    fn collect_on_plain_path_limits_elements() {
        let proc = ExtractionProcedure::over_artifact(InputFormat::Json)
            .with_field("items", FieldRule::new("items", Reduce::Collect).with_limit(2))
            .with_field("tags", FieldRule::new("tags", Reduce::Unique));
        let out = run(&proc, r#"{"items": [1, 2, 3], "tags": ["a", "b", "a"]}"#);
        assert_eq!(out, json!({"items": [1, 2], "tags": ["a", "b"]}));
    }

    #[test]
    fn nothing_to_narrow() {
        let proc = ExtractionProcedure::over_artifact(InputFormat::Json)
            .with_field("n", FieldRule::new("items.*", Reduce::Count));
        assert!(proc.narrowed().is_none());
    }

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let a = ExtractionProcedure::over_artifact(InputFormat::Json)
            .with_field("x", FieldRule::new("x", Reduce::Value));
        let b = a.clone().with_field("y", FieldRule::new("y", Reduce::Value));
        assert_eq!(a.hash(), a.clone().hash());
        assert_ne!(a.hash(), b.hash());
    }

    proptest::proptest! {
        #[test]
        fn count_matches_item_total(items in proptest::collection::vec(0i64..1000, 0..50)) {
            let proc = ExtractionProcedure::over_artifact(InputFormat::Json)
                .with_field("n", FieldRule::new("items.*", Reduce::Count))
                .with_field("sum", FieldRule::new("items.*", Reduce::Sum));
            let out = run(&proc, &json!({ "items": items }).to_string());
            proptest::prop_assert_eq!(&out["n"], &json!(items.len()));
            if items.is_empty() {
                proptest::prop_assert!(out["sum"].is_null());
            } else {
                proptest::prop_assert_eq!(&out["sum"], &json!(items.iter().sum::<i64>()));
            }
        }

        #[test]
        fn narrowing_never_widens(limit in 1usize..5000) {
            let proc = ExtractionProcedure::over_artifact(InputFormat::Json)
                .with_field("all", FieldRule::new("items", Reduce::Collect).with_limit(limit));
            if let Some(next) = proc.narrowed() {
                proptest::prop_assert!(next.fields["all"].limit.unwrap() < limit);
            } else {
                proptest::prop_assert_eq!(limit, 1);
            }
        }
    }

    #[test]
    fn bad_regex_is_invalid() {
        let proc = ExtractionProcedure::over_artifact(InputFormat::Json)
            .with_field("x", FieldRule::new("x", Reduce::Collect).with_filter("("));
        assert!(matches!(proc.compile(), Err(SandboxError::InvalidProcedure(_))));
    }
}
