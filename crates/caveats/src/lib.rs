//! Caveat evaluation
//!
//! Caveats are named boolean predicates over typed parameters, attached to
//! relationship edges and resolved with context supplied at check time.
//! The stored form is a serialized [`BoolExpr`]; evaluation is three-valued:
//! true, false, or a partial residual when parameters are still unbound.

pub mod error;
mod eval;
mod expr;
mod value;

pub use error::{CaveatError, Result};
pub use eval::{evaluate_expression, ExpressionResult};
pub use expr::{BoolExpr, CmpOp, CompiledCaveat, Operand, Outcome};
pub use value::CaveatValue;
