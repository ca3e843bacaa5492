use ipnetwork::IpNetwork;
use rebac_models::ParameterType;
use serde_json::Value;
use std::cmp::Ordering;

use crate::error::{CaveatError, Result};

/// A typed runtime value bound to a caveat parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum CaveatValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    StringList(Vec<String>),
    IpNetwork(IpNetwork),
}

impl CaveatValue {
    /// Convert a JSON context value according to the declared type.
    pub fn from_json(parameter: &str, declared: ParameterType, value: &Value) -> Result<Self> {
        let mismatch = || CaveatError::TypeMismatch {
            parameter: parameter.to_string(),
            expected: declared.to_string(),
            found: json_kind(value).to_string(),
        };
        match declared {
            ParameterType::String => value
                .as_str()
                .map(|s| CaveatValue::String(s.to_string()))
                .ok_or_else(mismatch),
            ParameterType::Int => value
                .as_i64()
                .map(CaveatValue::Int)
                .ok_or_else(mismatch),
            ParameterType::Double => value
                .as_f64()
                .map(CaveatValue::Double)
                .ok_or_else(mismatch),
            ParameterType::Bool => value
                .as_bool()
                .map(CaveatValue::Bool)
                .ok_or_else(mismatch),
            ParameterType::StringList => {
                let items = value.as_array().ok_or_else(mismatch)?;
                let mut list = Vec::with_capacity(items.len());
                for item in items {
                    list.push(item.as_str().ok_or_else(mismatch)?.to_string());
                }
                Ok(CaveatValue::StringList(list))
            }
            ParameterType::IpNetwork => {
                let text = value.as_str().ok_or_else(mismatch)?;
                text.parse::<IpNetwork>()
                    .map(CaveatValue::IpNetwork)
                    .map_err(|_| mismatch())
            }
        }
    }

    /// Ordering for comparison operators; `None` when the kinds are not
    /// comparable.
    pub fn partial_cmp_value(&self, other: &CaveatValue) -> Option<Ordering> {
        match (self, other) {
            (CaveatValue::String(a), CaveatValue::String(b)) => Some(a.cmp(b)),
            (CaveatValue::Int(a), CaveatValue::Int(b)) => Some(a.cmp(b)),
            (CaveatValue::Double(a), CaveatValue::Double(b)) => a.partial_cmp(b),
            (CaveatValue::Int(a), CaveatValue::Double(b)) => (*a as f64).partial_cmp(b),
            (CaveatValue::Double(a), CaveatValue::Int(b)) => a.partial_cmp(&(*b as f64)),
            (CaveatValue::Bool(a), CaveatValue::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CaveatValue::String(_) => "string",
            CaveatValue::Int(_) => "int",
            CaveatValue::Double(_) => "double",
            CaveatValue::Bool(_) => "bool",
            CaveatValue::StringList(_) => "string_list",
            CaveatValue::IpNetwork(_) => "ip_network",
        }
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
