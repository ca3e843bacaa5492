use crate::error::{ModelError, Result};
use crate::object::validate_relation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A named caveat declaration: a pre-compiled boolean expression over typed
/// named parameters. The expression bytes are opaque to the data model and
/// interpreted by the caveat evaluator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaveatDefinition {
    pub name: String,
    pub serialized_expression: Vec<u8>,
    pub parameter_types: BTreeMap<String, ParameterType>,
}

impl CaveatDefinition {
    pub fn new(
        name: &str,
        serialized_expression: Vec<u8>,
        parameter_types: BTreeMap<String, ParameterType>,
    ) -> Result<Self> {
        validate_relation(name).map_err(|_| ModelError::InvalidCaveatName(name.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            serialized_expression,
            parameter_types,
        })
    }
}

/// Declared type of a caveat parameter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Int,
    Double,
    Bool,
    StringList,
    IpNetwork,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParameterType::String => "string",
            ParameterType::Int => "int",
            ParameterType::Double => "double",
            ParameterType::Bool => "bool",
            ParameterType::StringList => "string_list",
            ParameterType::IpNetwork => "ip_network",
        };
        f.write_str(name)
    }
}

/// A caveat reference attached to a relationship edge, with the context
/// captured when the edge was written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextualizedCaveat {
    pub caveat_name: String,
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl ContextualizedCaveat {
    pub fn named(caveat_name: &str) -> Self {
        Self {
            caveat_name: caveat_name.to_string(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: &str, value: serde_json::Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }
}

impl fmt::Display for ContextualizedCaveat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}]", self.caveat_name)
        } else {
            let ctx = serde_json::to_string(&self.context).map_err(|_| fmt::Error)?;
            write!(f, "[{}:{}]", self.caveat_name, ctx)
        }
    }
}

/// Boolean operator combining caveat expressions during traversal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaveatOperator {
    Or,
    And,
    Not,
}

/// A boolean-algebra tree over contextualized caveats. Single leaves are
/// attached to stored tuples; interior operations are accumulated while
/// combining conditional branches of a permission evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaveatExpression {
    Caveat(ContextualizedCaveat),
    Operation {
        op: CaveatOperator,
        children: Vec<CaveatExpression>,
    },
}

impl CaveatExpression {
    pub fn caveat(caveat: ContextualizedCaveat) -> Self {
        CaveatExpression::Caveat(caveat)
    }

    /// `a OR b`, flattening nested ORs to keep trees shallow.
    pub fn or(a: CaveatExpression, b: CaveatExpression) -> Self {
        Self::flatten(CaveatOperator::Or, a, b)
    }

    /// `a AND b`, flattening nested ANDs.
    pub fn and(a: CaveatExpression, b: CaveatExpression) -> Self {
        Self::flatten(CaveatOperator::And, a, b)
    }

    pub fn not(a: CaveatExpression) -> Self {
        CaveatExpression::Operation {
            op: CaveatOperator::Not,
            children: vec![a],
        }
    }

    /// OR over any number of branches; `None` when empty.
    pub fn any(mut branches: Vec<CaveatExpression>) -> Option<Self> {
        match branches.len() {
            0 => None,
            1 => branches.pop(),
            _ => {
                let mut iter = branches.into_iter();
                let first = iter.next().unwrap();
                Some(iter.fold(first, Self::or))
            }
        }
    }

    /// AND over any number of branches; `None` when empty.
    pub fn all(mut branches: Vec<CaveatExpression>) -> Option<Self> {
        match branches.len() {
            0 => None,
            1 => branches.pop(),
            _ => {
                let mut iter = branches.into_iter();
                let first = iter.next().unwrap();
                Some(iter.fold(first, Self::and))
            }
        }
    }

    fn flatten(op: CaveatOperator, a: CaveatExpression, b: CaveatExpression) -> Self {
        let mut children = Vec::new();
        for expr in [a, b] {
            match expr {
                CaveatExpression::Operation {
                    op: child_op,
                    children: sub,
                } if child_op == op => children.extend(sub),
                other => children.push(other),
            }
        }
        CaveatExpression::Operation { op, children }
    }
}
