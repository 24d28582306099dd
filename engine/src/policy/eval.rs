//! Tree evaluation.
//!
//! A pure interpreter over exact rationals. Evaluating a tree on a
//! context yields exactly one [`Outcome`]; identical context in, identical
//! outcome out. Conditions short-circuit: `and` stops at the first false,
//! `or` at the first true.

use crate::num::{ArithmeticError, Ratio};
use crate::policy::ast::{ActionKind, Computation, Expression, TreeNode, ValueExpr};
use crate::policy::context::EvalContext;
use std::collections::BTreeMap;
use thiserror::Error;

/// Traversal depth cap; validation enforces the same bound statically.
const MAX_DEPTH: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("field not found in context: {0}")]
    FieldNotFound(String),

    #[error("parameter not found: {0}")]
    ParameterNotFound(String),

    #[error("division by zero in computation")]
    DivisionByZero,

    #[error("empty value list for min/max")]
    EmptyValueList,

    #[error("tree traversal exceeded maximum depth {MAX_DEPTH}")]
    MaxDepthExceeded,

    #[error("arithmetic failure: {0}")]
    Arithmetic(ArithmeticError),
}

impl From<ArithmeticError> for EvalError {
    fn from(e: ArithmeticError) -> Self {
        match e {
            ArithmeticError::DivisionByZero => EvalError::DivisionByZero,
            other => EvalError::Arithmetic(other),
        }
    }
}

/// The single action a tree evaluation produces.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub node_id: String,
    pub action: ActionKind,
    /// Register name, for `SetStateRegister`.
    pub register: Option<String>,
    /// Evaluated numeric action arguments.
    pub args: BTreeMap<String, Ratio>,
}

impl Outcome {
    /// Fetch an argument as an integer, truncating toward zero.
    pub fn int_arg(&self, name: &str) -> Option<i64> {
        self.args.get(name).map(|r| {
            if r.is_negative() {
                r.ceil()
            } else {
                r.floor()
            }
        })
    }
}

pub fn evaluate_value(
    value: &ValueExpr,
    ctx: &EvalContext,
    params: &BTreeMap<String, Ratio>,
) -> Result<Ratio, EvalError> {
    match value {
        ValueExpr::Field { field } => ctx
            .get(field)
            .ok_or_else(|| EvalError::FieldNotFound(field.clone())),
        ValueExpr::Param { param } => params
            .get(param)
            .copied()
            .ok_or_else(|| EvalError::ParameterNotFound(param.clone())),
        ValueExpr::Literal { value } => Ok(*value),
        ValueExpr::Compute { compute } => evaluate_computation(compute, ctx, params),
    }
}

pub fn evaluate_computation(
    computation: &Computation,
    ctx: &EvalContext,
    params: &BTreeMap<String, Ratio>,
) -> Result<Ratio, EvalError> {
    match computation {
        Computation::Add { left, right } => Ok(evaluate_value(left, ctx, params)?
            .checked_add(evaluate_value(right, ctx, params)?)?),
        Computation::Subtract { left, right } => Ok(evaluate_value(left, ctx, params)?
            .checked_sub(evaluate_value(right, ctx, params)?)?),
        Computation::Multiply { left, right } => Ok(evaluate_value(left, ctx, params)?
            .checked_mul(evaluate_value(right, ctx, params)?)?),
        Computation::Divide { left, right } => {
            let denom = evaluate_value(right, ctx, params)?;
            if denom.is_zero() {
                return Err(EvalError::DivisionByZero);
            }
            Ok(evaluate_value(left, ctx, params)?.checked_div(denom)?)
        }
        Computation::Max { values } => fold_extremum(values, ctx, params, Ratio::max),
        Computation::Min { values } => fold_extremum(values, ctx, params, Ratio::min),
        Computation::Floor { value } => {
            Ok(Ratio::from_int(evaluate_value(value, ctx, params)?.floor()))
        }
        Computation::Ceil { value } => {
            Ok(Ratio::from_int(evaluate_value(value, ctx, params)?.ceil()))
        }
        Computation::Abs { value } => Ok(evaluate_value(value, ctx, params)?.abs()),
        Computation::Clamp { value, min, max } => {
            let v = evaluate_value(value, ctx, params)?;
            let lo = evaluate_value(min, ctx, params)?;
            let hi = evaluate_value(max, ctx, params)?;
            Ok(v.max(lo).min(hi))
        }
        Computation::SafeDiv {
            numerator,
            denominator,
            default,
        } => {
            let denom = evaluate_value(denominator, ctx, params)?;
            if denom.is_zero() {
                evaluate_value(default, ctx, params)
            } else {
                Ok(evaluate_value(numerator, ctx, params)?.checked_div(denom)?)
            }
        }
    }
}

fn fold_extremum(
    values: &[ValueExpr],
    ctx: &EvalContext,
    params: &BTreeMap<String, Ratio>,
    pick: fn(Ratio, Ratio) -> Ratio,
) -> Result<Ratio, EvalError> {
    let mut iter = values.iter();
    let first = iter.next().ok_or(EvalError::EmptyValueList)?;
    let mut acc = evaluate_value(first, ctx, params)?;
    for v in iter {
        acc = pick(acc, evaluate_value(v, ctx, params)?);
    }
    Ok(acc)
}

pub fn evaluate_expression(
    expr: &Expression,
    ctx: &EvalContext,
    params: &BTreeMap<String, Ratio>,
) -> Result<bool, EvalError> {
    match expr {
        Expression::Equal { left, right } => {
            Ok(evaluate_value(left, ctx, params)? == evaluate_value(right, ctx, params)?)
        }
        Expression::NotEqual { left, right } => {
            Ok(evaluate_value(left, ctx, params)? != evaluate_value(right, ctx, params)?)
        }
        Expression::LessThan { left, right } => {
            Ok(evaluate_value(left, ctx, params)? < evaluate_value(right, ctx, params)?)
        }
        Expression::LessOrEqual { left, right } => {
            Ok(evaluate_value(left, ctx, params)? <= evaluate_value(right, ctx, params)?)
        }
        Expression::GreaterThan { left, right } => {
            Ok(evaluate_value(left, ctx, params)? > evaluate_value(right, ctx, params)?)
        }
        Expression::GreaterOrEqual { left, right } => {
            Ok(evaluate_value(left, ctx, params)? >= evaluate_value(right, ctx, params)?)
        }
        Expression::And { conditions } => {
            for c in conditions {
                if !evaluate_expression(c, ctx, params)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Expression::Or { conditions } => {
            for c in conditions {
                if evaluate_expression(c, ctx, params)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Expression::Not { condition } => Ok(!evaluate_expression(condition, ctx, params)?),
    }
}

/// Walk the tree to a terminal action and evaluate its arguments.
pub fn evaluate_tree(
    root: &TreeNode,
    ctx: &EvalContext,
    params: &BTreeMap<String, Ratio>,
) -> Result<Outcome, EvalError> {
    let mut node = root;
    for _ in 0..MAX_DEPTH {
        match node {
            TreeNode::Condition {
                condition,
                on_true,
                on_false,
                ..
            } => {
                node = if evaluate_expression(condition, ctx, params)? {
                    on_true.as_ref()
                } else {
                    on_false.as_ref()
                };
            }
            TreeNode::Action {
                node_id,
                action,
                register,
                parameters,
            } => {
                let mut args = BTreeMap::new();
                for (name, value) in parameters {
                    args.insert(name.clone(), evaluate_value(value, ctx, params)?);
                }
                return Ok(Outcome {
                    node_id: node_id.clone(),
                    action: *action,
                    register: register.clone(),
                    args,
                });
            }
        }
    }
    Err(EvalError::MaxDepthExceeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use crate::model::agent::Agent;
    use crate::model::transaction::Transaction;
    use crate::policy::context::AgentSnapshot;

    fn ctx() -> EvalContext {
        let tx = Transaction::new(
            "tx_1".to_string(),
            "A".to_string(),
            "B".to_string(),
            100_000,
            0,
            20,
        );
        let agent = Agent::new("A".to_string(), 500_000, 0);
        let clock = SimClock::new(100, 1);
        EvalContext::for_payment(
            &tx,
            &agent,
            AgentSnapshot {
                q2_count: 0,
                pending_outflows: 0,
            },
            &clock,
            Ratio::new(4, 5).unwrap(),
        )
    }

    fn no_params() -> BTreeMap<String, Ratio> {
        BTreeMap::new()
    }

    fn field(name: &str) -> ValueExpr {
        ValueExpr::Field {
            field: name.to_string(),
        }
    }

    fn lit(v: i64) -> ValueExpr {
        ValueExpr::Literal {
            value: Ratio::from_int(v),
        }
    }

    #[test]
    fn field_and_literal_resolution() {
        let c = ctx();
        assert_eq!(
            evaluate_value(&field("balance"), &c, &no_params()).unwrap(),
            Ratio::from_int(500_000)
        );
        assert_eq!(
            evaluate_value(&lit(7), &c, &no_params()).unwrap(),
            Ratio::from_int(7)
        );
        assert_eq!(
            evaluate_value(&field("missing"), &c, &no_params()),
            Err(EvalError::FieldNotFound("missing".to_string()))
        );
    }

    #[test]
    fn param_resolution() {
        let c = ctx();
        let mut params = BTreeMap::new();
        params.insert("threshold".to_string(), Ratio::new(1, 2).unwrap());
        let v = ValueExpr::Param {
            param: "threshold".to_string(),
        };
        assert_eq!(
            evaluate_value(&v, &c, &params).unwrap(),
            Ratio::new(1, 2).unwrap()
        );
        assert!(matches!(
            evaluate_value(&v, &c, &no_params()),
            Err(EvalError::ParameterNotFound(_))
        ));
    }

    #[test]
    fn division_is_exact_and_guarded() {
        let c = ctx();
        let expr = Computation::Divide {
            left: lit(1),
            right: lit(3),
        };
        assert_eq!(
            evaluate_computation(&expr, &c, &no_params()).unwrap(),
            Ratio::new(1, 3).unwrap()
        );
        let bad = Computation::Divide {
            left: lit(1),
            right: lit(0),
        };
        assert_eq!(
            evaluate_computation(&bad, &c, &no_params()),
            Err(EvalError::DivisionByZero)
        );
        let safe = Computation::SafeDiv {
            numerator: lit(1),
            denominator: lit(0),
            default: lit(42),
        };
        assert_eq!(
            evaluate_computation(&safe, &c, &no_params()).unwrap(),
            Ratio::from_int(42)
        );
    }

    #[test]
    fn short_circuit_and() {
        // Second condition divides by zero; `and` must not reach it.
        let c = ctx();
        let expr = Expression::And {
            conditions: vec![
                Expression::GreaterThan {
                    left: lit(0),
                    right: lit(1),
                },
                Expression::GreaterThan {
                    left: ValueExpr::Compute {
                        compute: Box::new(Computation::Divide {
                            left: lit(1),
                            right: lit(0),
                        }),
                    },
                    right: lit(0),
                },
            ],
        };
        assert_eq!(evaluate_expression(&expr, &c, &no_params()), Ok(false));
    }

    #[test]
    fn short_circuit_or() {
        let c = ctx();
        let expr = Expression::Or {
            conditions: vec![
                Expression::LessThan {
                    left: lit(0),
                    right: lit(1),
                },
                Expression::GreaterThan {
                    left: ValueExpr::Compute {
                        compute: Box::new(Computation::Divide {
                            left: lit(1),
                            right: lit(0),
                        }),
                    },
                    right: lit(0),
                },
            ],
        };
        assert_eq!(evaluate_expression(&expr, &c, &no_params()), Ok(true));
    }

    #[test]
    fn traversal_reaches_the_right_leaf() {
        let c = ctx();
        let tree = TreeNode::Condition {
            node_id: "N1".to_string(),
            description: String::new(),
            condition: Expression::GreaterOrEqual {
                left: field("balance"),
                right: field("amount"),
            },
            on_true: Box::new(TreeNode::Action {
                node_id: "A1".to_string(),
                action: ActionKind::Release,
                register: None,
                parameters: BTreeMap::new(),
            }),
            on_false: Box::new(TreeNode::Action {
                node_id: "A2".to_string(),
                action: ActionKind::Hold,
                register: None,
                parameters: BTreeMap::new(),
            }),
        };
        let outcome = evaluate_tree(&tree, &c, &no_params()).unwrap();
        assert_eq!(outcome.action, ActionKind::Release);
        assert_eq!(outcome.node_id, "A1");
    }

    #[test]
    fn identical_context_identical_outcome() {
        let c = ctx();
        let mut params = BTreeMap::new();
        params.insert("n".to_string(), Ratio::from_int(3));
        let tree = TreeNode::Action {
            node_id: "A1".to_string(),
            action: ActionKind::Split,
            register: None,
            parameters: vec![(
                "num_splits".to_string(),
                ValueExpr::Param {
                    param: "n".to_string(),
                },
            )]
            .into_iter()
            .collect(),
        };
        let a = evaluate_tree(&tree, &c, &params).unwrap();
        let b = evaluate_tree(&tree, &c, &params).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.int_arg("num_splits"), Some(3));
    }
}
