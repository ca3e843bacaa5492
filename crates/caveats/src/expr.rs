use ipnetwork::IpNetwork;
use rebac_models::{CaveatDefinition, ParameterType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::error::{CaveatError, Result};
use crate::value::{json_kind, CaveatValue};

/// The serialized form of a caveat predicate: a boolean expression over
/// declared parameters and literals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BoolExpr {
    And(Vec<BoolExpr>),
    Or(Vec<BoolExpr>),
    Not(Box<BoolExpr>),
    Cmp {
        left: Operand,
        op: CmpOp,
        right: Operand,
    },
    /// Whether an IP address falls inside a network.
    InRange { address: Operand, network: Operand },
    /// Whether a string list contains an item.
    Contains { list: Operand, item: Operand },
}

impl BoolExpr {
    /// Convenience for building `param op literal` leaves.
    pub fn cmp(param: &str, op: CmpOp, literal: Value) -> Self {
        BoolExpr::Cmp {
            left: Operand::Param(param.to_string()),
            op,
            right: Operand::Literal(literal),
        }
    }

    pub fn in_range(address_param: &str, network_param: &str) -> Self {
        BoolExpr::InRange {
            address: Operand::Param(address_param.to_string()),
            network: Operand::Param(network_param.to_string()),
        }
    }

    /// Serialize for storage in a caveat definition.
    pub fn serialize_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Param(String),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Three-valued result of evaluating a caveat predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    True,
    False,
    /// The simplified residual with unresolved parameters still free.
    Partial(BoolExpr),
}

/// A caveat definition with its expression deserialized and type-checked.
#[derive(Debug, Clone)]
pub struct CompiledCaveat {
    pub name: String,
    expression: BoolExpr,
    parameter_types: BTreeMap<String, ParameterType>,
}

impl CompiledCaveat {
    pub fn compile(definition: &CaveatDefinition) -> Result<Self> {
        let expression: BoolExpr = serde_json::from_slice(&definition.serialized_expression)
            .map_err(|_| CaveatError::MalformedExpression(definition.name.clone()))?;
        let compiled = Self {
            name: definition.name.clone(),
            expression,
            parameter_types: definition.parameter_types.clone(),
        };
        compiled.typecheck(&compiled.expression)?;
        Ok(compiled)
    }

    fn typecheck(&self, expr: &BoolExpr) -> Result<()> {
        match expr {
            BoolExpr::And(children) | BoolExpr::Or(children) => {
                children.iter().try_for_each(|c| self.typecheck(c))
            }
            BoolExpr::Not(child) => self.typecheck(child),
            BoolExpr::Cmp { left, right, .. } => {
                self.check_operand(left)?;
                self.check_operand(right)
            }
            BoolExpr::InRange { address, network } => {
                self.check_operand(address)?;
                self.check_operand(network)
            }
            BoolExpr::Contains { list, item } => {
                self.check_operand(list)?;
                self.check_operand(item)
            }
        }
    }

    fn check_operand(&self, operand: &Operand) -> Result<()> {
        if let Operand::Param(name) = operand {
            if !self.parameter_types.contains_key(name) {
                return Err(CaveatError::UnknownParameter {
                    caveat: self.name.clone(),
                    parameter: name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Evaluate against a context of parameter bindings. Missing parameters
    /// leave a partial residual; bindings of the wrong type are an error.
    pub fn evaluate(&self, context: &BTreeMap<String, Value>) -> Result<Outcome> {
        self.eval_expr(&self.expression, context)
    }

    fn eval_expr(&self, expr: &BoolExpr, context: &BTreeMap<String, Value>) -> Result<Outcome> {
        match expr {
            BoolExpr::And(children) => {
                let mut residual = Vec::new();
                for child in children {
                    match self.eval_expr(child, context)? {
                        Outcome::False => return Ok(Outcome::False),
                        Outcome::True => {}
                        Outcome::Partial(partial) => residual.push(partial),
                    }
                }
                Ok(match residual.len() {
                    0 => Outcome::True,
                    1 => Outcome::Partial(residual.into_iter().next().unwrap()),
                    _ => Outcome::Partial(BoolExpr::And(residual)),
                })
            }
            BoolExpr::Or(children) => {
                let mut residual = Vec::new();
                for child in children {
                    match self.eval_expr(child, context)? {
                        Outcome::True => return Ok(Outcome::True),
                        Outcome::False => {}
                        Outcome::Partial(partial) => residual.push(partial),
                    }
                }
                Ok(match residual.len() {
                    0 => Outcome::False,
                    1 => Outcome::Partial(residual.into_iter().next().unwrap()),
                    _ => Outcome::Partial(BoolExpr::Or(residual)),
                })
            }
            BoolExpr::Not(child) => Ok(match self.eval_expr(child, context)? {
                Outcome::True => Outcome::False,
                Outcome::False => Outcome::True,
                Outcome::Partial(partial) => Outcome::Partial(BoolExpr::Not(Box::new(partial))),
            }),
            BoolExpr::Cmp { left, op, right } => {
                let (left, right) = match (
                    self.resolve(left, context)?,
                    self.resolve(right, context)?,
                ) {
                    (Some(l), Some(r)) => (l, r),
                    _ => return Ok(Outcome::Partial(expr.clone())),
                };
                let ordering = left.partial_cmp_value(&right).ok_or_else(|| {
                    CaveatError::TypeMismatch {
                        parameter: self.name.clone(),
                        expected: left.kind().to_string(),
                        found: right.kind().to_string(),
                    }
                })?;
                let satisfied = match op {
                    CmpOp::Eq => ordering.is_eq(),
                    CmpOp::Ne => !ordering.is_eq(),
                    CmpOp::Lt => ordering.is_lt(),
                    CmpOp::Le => ordering.is_le(),
                    CmpOp::Gt => ordering.is_gt(),
                    CmpOp::Ge => ordering.is_ge(),
                };
                Ok(if satisfied { Outcome::True } else { Outcome::False })
            }
            BoolExpr::InRange { address, network } => {
                let (address, network) = match (
                    self.resolve(address, context)?,
                    self.resolve(network, context)?,
                ) {
                    (Some(a), Some(n)) => (a, n),
                    _ => return Ok(Outcome::Partial(expr.clone())),
                };
                let address: IpAddr = match &address {
                    CaveatValue::String(text) => {
                        text.parse().map_err(|_| CaveatError::InvalidLiteral {
                            caveat: self.name.clone(),
                            literal: text.clone(),
                        })?
                    }
                    other => {
                        return Err(CaveatError::TypeMismatch {
                            parameter: self.name.clone(),
                            expected: "string".to_string(),
                            found: other.kind().to_string(),
                        })
                    }
                };
                let network: IpNetwork = match &network {
                    CaveatValue::IpNetwork(net) => *net,
                    CaveatValue::String(text) => {
                        text.parse().map_err(|_| CaveatError::InvalidLiteral {
                            caveat: self.name.clone(),
                            literal: text.clone(),
                        })?
                    }
                    other => {
                        return Err(CaveatError::TypeMismatch {
                            parameter: self.name.clone(),
                            expected: "ip_network".to_string(),
                            found: other.kind().to_string(),
                        })
                    }
                };
                Ok(if network.contains(address) {
                    Outcome::True
                } else {
                    Outcome::False
                })
            }
            BoolExpr::Contains { list, item } => {
                let (list, item) = match (
                    self.resolve(list, context)?,
                    self.resolve(item, context)?,
                ) {
                    (Some(l), Some(i)) => (l, i),
                    _ => return Ok(Outcome::Partial(expr.clone())),
                };
                match (&list, &item) {
                    (CaveatValue::StringList(items), CaveatValue::String(needle)) => {
                        Ok(if items.contains(needle) {
                            Outcome::True
                        } else {
                            Outcome::False
                        })
                    }
                    _ => Err(CaveatError::TypeMismatch {
                        parameter: self.name.clone(),
                        expected: "string_list".to_string(),
                        found: list.kind().to_string(),
                    }),
                }
            }
        }
    }

    /// Resolve an operand to a typed value; `None` when the parameter is
    /// unbound in the context.
    fn resolve(
        &self,
        operand: &Operand,
        context: &BTreeMap<String, Value>,
    ) -> Result<Option<CaveatValue>> {
        match operand {
            Operand::Param(name) => {
                let declared =
                    self.parameter_types
                        .get(name)
                        .ok_or_else(|| CaveatError::UnknownParameter {
                            caveat: self.name.clone(),
                            parameter: name.clone(),
                        })?;
                match context.get(name) {
                    Some(value) => CaveatValue::from_json(name, *declared, value).map(Some),
                    None => Ok(None),
                }
            }
            Operand::Literal(value) => {
                // Literals carry their own type.
                let value = match value {
                    Value::String(s) => CaveatValue::String(s.clone()),
                    Value::Bool(b) => CaveatValue::Bool(*b),
                    Value::Number(n) => {
                        if let Some(i) = n.as_i64() {
                            CaveatValue::Int(i)
                        } else if let Some(f) = n.as_f64() {
                            CaveatValue::Double(f)
                        } else {
                            return Err(CaveatError::InvalidLiteral {
                                caveat: self.name.clone(),
                                literal: n.to_string(),
                            });
                        }
                    }
                    Value::Array(items) => {
                        let mut list = Vec::with_capacity(items.len());
                        for item in items {
                            match item.as_str() {
                                Some(s) => list.push(s.to_string()),
                                None => {
                                    return Err(CaveatError::InvalidLiteral {
                                        caveat: self.name.clone(),
                                        literal: item.to_string(),
                                    })
                                }
                            }
                        }
                        CaveatValue::StringList(list)
                    }
                    other => {
                        return Err(CaveatError::InvalidLiteral {
                            caveat: self.name.clone(),
                            literal: json_kind(other).to_string(),
                        })
                    }
                };
                Ok(Some(value))
            }
        }
    }
}
