//! Return contract validation
//!
//! The single shape validator shared by the step self-check, the memory
//! gateway and the extraction pipeline. Contracts are compiled to JSON
//! Schema and checked with `jsonschema`.

use crate::error::ContractViolation;
use crate::types::{FieldShape, ReturnSpec};
use jsonschema::JSONSchema;
use serde_json::{json, Map, Value};

/// Build the JSON Schema for a contract
///
/// `exact` forbids fields the contract does not name.
#[must_use]
pub fn schema_for(spec: &ReturnSpec, exact: bool) -> Value {
    let properties: Map<String, Value> = spec
        .shape
        .iter()
        .map(|(name, shape)| (name.clone(), shape_schema(*shape)))
        .collect();
    let required: Vec<&str> = spec.field_names().collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": !exact,
    })
}

fn shape_schema(shape: FieldShape) -> Value {
    match shape {
        FieldShape::Any => json!({}),
        other => json!({ "type": other.as_str() }),
    }
}

/// Validate data against a contract, tolerating extra fields
///
/// # Errors
/// Returns `ContractViolation` with expected and actual shapes on mismatch
pub fn validate(data: &Value, spec: &ReturnSpec) -> Result<(), ContractViolation> {
    check(data, spec, false)
}

/// Validate data carries exactly the contract's fields
///
/// # Errors
/// Returns `ContractViolation` on a type mismatch, a missing field, or an extra field
pub fn validate_exact(data: &Value, spec: &ReturnSpec) -> Result<(), ContractViolation> {
    check(data, spec, true)
}

fn check(data: &Value, spec: &ReturnSpec, exact: bool) -> Result<(), ContractViolation> {
    let schema = schema_for(spec, exact);
    let details: Vec<String> = match JSONSchema::compile(&schema) {
        Ok(compiled) => match compiled.validate(data) {
            Ok(()) => return Ok(()),
            Err(errors) => errors.map(|e| e.to_string()).collect(),
        },
        Err(e) => vec![format!("contract did not compile: {e}")],
    };
    Err(ContractViolation {
        expected: spec.expected_shape(),
        actual: describe_shape(data),
        details,
    })
}

/// Describe the shape of a value: objects map keys to type names
#[must_use]
pub fn describe_shape(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), Value::from(type_name(v))))
                .collect(),
        ),
        other => Value::from(type_name(other)),
    }
}

/// Contract matching the current field types of an object
///
/// Null fields are unconstrained; non-objects give an empty contract.
#[must_use]
pub fn infer_spec(value: &Value) -> ReturnSpec {
    match value {
        Value::Object(map) => map.iter().fold(ReturnSpec::new(), |spec, (name, v)| {
            spec.with_field(name.clone(), FieldShape::parse(type_name(v)))
        }),
        _ => ReturnSpec::new(),
    }
}

/// JSON type name of a value
#[must_use]
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Project an object onto the contract's fields, dropping everything else
///
/// Non-object input maps onto a single-field contract as that field's value.
#[must_use]
pub fn project(data: &Value, spec: &ReturnSpec) -> Value {
    match data {
        Value::Object(map) => Value::Object(
            spec.field_names()
                .filter_map(|name| map.get(name).map(|v| (name.to_string(), v.clone())))
                .collect(),
        ),
        other if spec.len() == 1 => {
            let mut out = Map::new();
            if let Some(name) = spec.field_names().next() {
                out.insert(name.to_string(), other.clone());
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}
