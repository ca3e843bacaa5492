use rebac_models::{CaveatDefinition, CaveatExpression, CaveatOperator, ContextualizedCaveat};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::expr::{CompiledCaveat, Outcome};

/// Result of folding a traversal caveat expression with request context.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionResult {
    True,
    False,
    /// The simplified residual, to be re-evaluated with more context.
    Partial(CaveatExpression),
}

/// Evaluate a caveat expression tree accumulated during traversal.
///
/// Leaves are looked up by name, compiled, and evaluated against the edge
/// context merged with the request context (edge context wins on
/// conflicts). A leaf whose evaluation fails is kept in the residual
/// rather than failing the whole evaluation; the caller sees it as still
/// conditional and decides how to proceed.
pub fn evaluate_expression<L>(
    expression: &CaveatExpression,
    lookup: &L,
    request_context: &BTreeMap<String, Value>,
) -> Result<ExpressionResult>
where
    L: Fn(&str) -> Option<Arc<CaveatDefinition>>,
{
    match expression {
        CaveatExpression::Caveat(leaf) => evaluate_leaf(leaf, lookup, request_context),
        CaveatExpression::Operation { op, children } => match op {
            CaveatOperator::Or => {
                let mut residual = Vec::new();
                for child in children {
                    match evaluate_expression(child, lookup, request_context)? {
                        ExpressionResult::True => return Ok(ExpressionResult::True),
                        ExpressionResult::False => {}
                        ExpressionResult::Partial(partial) => residual.push(partial),
                    }
                }
                Ok(fold_residual(residual, CaveatOperator::Or, ExpressionResult::False))
            }
            CaveatOperator::And => {
                let mut residual = Vec::new();
                for child in children {
                    match evaluate_expression(child, lookup, request_context)? {
                        ExpressionResult::False => return Ok(ExpressionResult::False),
                        ExpressionResult::True => {}
                        ExpressionResult::Partial(partial) => residual.push(partial),
                    }
                }
                Ok(fold_residual(residual, CaveatOperator::And, ExpressionResult::True))
            }
            CaveatOperator::Not => {
                let child = match children.first() {
                    Some(child) => child,
                    None => {
                        // Malformed negation; keep the branch unresolved
                        // like the other degenerate inputs.
                        tracing::warn!("Negation without an operand left unresolved");
                        return Ok(ExpressionResult::Partial(expression.clone()));
                    }
                };
                Ok(match evaluate_expression(child, lookup, request_context)? {
                    ExpressionResult::True => ExpressionResult::False,
                    ExpressionResult::False => ExpressionResult::True,
                    ExpressionResult::Partial(partial) => {
                        ExpressionResult::Partial(CaveatExpression::not(partial))
                    }
                })
            }
        },
    }
}

fn evaluate_leaf<L>(
    leaf: &ContextualizedCaveat,
    lookup: &L,
    request_context: &BTreeMap<String, Value>,
) -> Result<ExpressionResult>
where
    L: Fn(&str) -> Option<Arc<CaveatDefinition>>,
{
    let definition = match lookup(&leaf.caveat_name) {
        Some(definition) => definition,
        None => {
            tracing::warn!("Unknown caveat {} left unresolved", leaf.caveat_name);
            return Ok(ExpressionResult::Partial(CaveatExpression::caveat(
                leaf.clone(),
            )));
        }
    };

    // Edge context overrides request context: what was captured at write
    // time is authoritative for those parameters.
    let mut context = request_context.clone();
    for (key, value) in &leaf.context {
        context.insert(key.clone(), value.clone());
    }

    let outcome = CompiledCaveat::compile(&definition).and_then(|c| c.evaluate(&context));
    match outcome {
        Ok(Outcome::True) => Ok(ExpressionResult::True),
        Ok(Outcome::False) => Ok(ExpressionResult::False),
        Ok(Outcome::Partial(_)) => Ok(ExpressionResult::Partial(CaveatExpression::caveat(
            leaf.clone(),
        ))),
        Err(err) => {
            // The branch stays conditional; the caller sees the unresolved
            // leaf and can supply corrected context.
            tracing::warn!("Caveat {} failed to evaluate: {}", leaf.caveat_name, err);
            Ok(ExpressionResult::Partial(CaveatExpression::caveat(
                leaf.clone(),
            )))
        }
    }
}

fn fold_residual(
    mut residual: Vec<CaveatExpression>,
    op: CaveatOperator,
    empty: ExpressionResult,
) -> ExpressionResult {
    match residual.len() {
        0 => empty,
        1 => ExpressionResult::Partial(residual.pop().unwrap()),
        _ => ExpressionResult::Partial(CaveatExpression::Operation { op, children: residual }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{BoolExpr, CmpOp};
    use rebac_models::ParameterType;

    fn definitions() -> BTreeMap<String, Arc<CaveatDefinition>> {
        let tier = CaveatDefinition::new(
            "is_pro",
            BoolExpr::cmp("tier", CmpOp::Eq, serde_json::json!("pro")).serialize_bytes(),
            BTreeMap::from([("tier".to_string(), ParameterType::String)]),
        )
        .unwrap();
        let region = CaveatDefinition::new(
            "in_region",
            BoolExpr::cmp("region", CmpOp::Eq, serde_json::json!("eu")).serialize_bytes(),
            BTreeMap::from([("region".to_string(), ParameterType::String)]),
        )
        .unwrap();
        BTreeMap::from([
            ("is_pro".to_string(), Arc::new(tier)),
            ("in_region".to_string(), Arc::new(region)),
        ])
    }

    fn lookup(defs: &BTreeMap<String, Arc<CaveatDefinition>>) -> impl Fn(&str) -> Option<Arc<CaveatDefinition>> + '_ {
        move |name| defs.get(name).cloned()
    }

    fn ctx(entries: &[(&str, &str)]) -> BTreeMap<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
            .collect()
    }

    #[test]
    fn test_and_over_leaves() {
        let defs = definitions();
        let expr = CaveatExpression::and(
            CaveatExpression::caveat(ContextualizedCaveat::named("is_pro")),
            CaveatExpression::caveat(ContextualizedCaveat::named("in_region")),
        );

        let satisfied = evaluate_expression(
            &expr,
            &lookup(&defs),
            &ctx(&[("tier", "pro"), ("region", "eu")]),
        )
        .unwrap();
        assert_eq!(satisfied, ExpressionResult::True);

        let falsified = evaluate_expression(
            &expr,
            &lookup(&defs),
            &ctx(&[("tier", "free"), ("region", "eu")]),
        )
        .unwrap();
        assert_eq!(falsified, ExpressionResult::False);

        // One leaf unbound: residual keeps only that leaf.
        let partial = evaluate_expression(&expr, &lookup(&defs), &ctx(&[("tier", "pro")])).unwrap();
        assert_eq!(
            partial,
            ExpressionResult::Partial(CaveatExpression::caveat(ContextualizedCaveat::named(
                "in_region"
            )))
        );
    }

    #[test]
    fn test_edge_context_overrides_request_context() {
        let defs = definitions();
        let leaf = ContextualizedCaveat::named("is_pro")
            .with_context("tier", serde_json::json!("free"));
        let expr = CaveatExpression::caveat(leaf);

        // The request claims pro, the edge pinned free at write time.
        let result =
            evaluate_expression(&expr, &lookup(&defs), &ctx(&[("tier", "pro")])).unwrap();
        assert_eq!(result, ExpressionResult::False);
    }

    #[test]
    fn test_not_partial_stays_partial() {
        let defs = definitions();
        let expr = CaveatExpression::not(CaveatExpression::caveat(ContextualizedCaveat::named(
            "is_pro",
        )));
        let result = evaluate_expression(&expr, &lookup(&defs), &BTreeMap::new()).unwrap();
        assert!(matches!(result, ExpressionResult::Partial(_)));
    }

    #[test]
    fn test_unknown_caveat_left_unresolved() {
        let defs = definitions();
        let expr = CaveatExpression::caveat(ContextualizedCaveat::named("unheard_of"));
        let result = evaluate_expression(&expr, &lookup(&defs), &BTreeMap::new()).unwrap();
        assert!(matches!(result, ExpressionResult::Partial(_)));
    }

    #[test]
    fn test_negation_without_operand_left_unresolved() {
        let defs = definitions();
        // Expression trees cross the API boundary; a caller-built negation
        // with no operand must stay conditional rather than fail.
        let expr = CaveatExpression::Operation {
            op: CaveatOperator::Not,
            children: Vec::new(),
        };
        let result =
            evaluate_expression(&expr, &lookup(&defs), &ctx(&[("tier", "pro")])).unwrap();
        assert_eq!(result, ExpressionResult::Partial(expr));
    }
}
