//! Pre-execution policy validation.
//!
//! Every tree is type-checked before the first tick: node ids unique
//! across the whole policy, every parameter reference declared, every
//! field reference valid for its tree, every action permitted for its
//! tree, required action arguments present, depth bounded. All
//! violations are collected and reported together.

use crate::policy::ast::{
    ActionKind, Computation, Expression, PolicyDef, TreeKind, TreeNode, ValueExpr,
};
use crate::policy::context::is_field_valid;
use std::collections::BTreeSet;
use thiserror::Error;

const MAX_TREE_DEPTH: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyValidationError {
    #[error("duplicate node id: {0}")]
    DuplicateNodeId(String),

    #[error("{tree}: field reference '{field}' is not valid in this tree")]
    InvalidFieldReference { tree: &'static str, field: String },

    #[error("{tree}: parameter reference '{param}' is not declared")]
    UnknownParameter { tree: &'static str, param: String },

    #[error("{tree}: action {action} is not permitted in this tree (node {node_id})")]
    ActionNotPermitted {
        tree: &'static str,
        action: ActionKind,
        node_id: String,
    },

    #[error("{tree}: action {action} at node {node_id} is missing required argument '{arg}'")]
    MissingActionArgument {
        tree: &'static str,
        action: ActionKind,
        node_id: String,
        arg: &'static str,
    },

    #[error("tree depth {actual} exceeds maximum {MAX_TREE_DEPTH}")]
    ExcessiveDepth { actual: usize },
}

/// Validate a whole policy; returns every violation found.
pub fn validate_policy(def: &PolicyDef) -> Result<(), Vec<PolicyValidationError>> {
    let mut errors = Vec::new();
    let mut seen_ids = BTreeSet::new();

    for kind in TreeKind::ALL {
        if let Some(root) = def.tree(kind) {
            let depth = max_depth(root);
            if depth > MAX_TREE_DEPTH {
                errors.push(PolicyValidationError::ExcessiveDepth { actual: depth });
            }
            walk(root, kind, def, &mut seen_ids, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn max_depth(node: &TreeNode) -> usize {
    match node {
        TreeNode::Action { .. } => 1,
        TreeNode::Condition {
            on_true, on_false, ..
        } => 1 + max_depth(on_true).max(max_depth(on_false)),
    }
}

fn walk(
    node: &TreeNode,
    kind: TreeKind,
    def: &PolicyDef,
    seen_ids: &mut BTreeSet<String>,
    errors: &mut Vec<PolicyValidationError>,
) {
    if !seen_ids.insert(node.node_id().to_string()) {
        errors.push(PolicyValidationError::DuplicateNodeId(
            node.node_id().to_string(),
        ));
    }

    match node {
        TreeNode::Condition {
            condition,
            on_true,
            on_false,
            ..
        } => {
            check_expression(condition, kind, def, errors);
            walk(on_true, kind, def, seen_ids, errors);
            walk(on_false, kind, def, seen_ids, errors);
        }
        TreeNode::Action {
            node_id,
            action,
            register,
            parameters,
        } => {
            if !kind.permits(*action) {
                errors.push(PolicyValidationError::ActionNotPermitted {
                    tree: kind.name(),
                    action: *action,
                    node_id: node_id.clone(),
                });
            }
            for value in parameters.values() {
                check_value(value, kind, def, errors);
            }
            for arg in required_args(*action) {
                let present = match *arg {
                    "register" => register.is_some(),
                    name => parameters.contains_key(name),
                };
                if !present {
                    errors.push(PolicyValidationError::MissingActionArgument {
                        tree: kind.name(),
                        action: *action,
                        node_id: node_id.clone(),
                        arg,
                    });
                }
            }
        }
    }
}

fn required_args(action: ActionKind) -> &'static [&'static str] {
    match action {
        ActionKind::Split => &["num_splits"],
        ActionKind::StaggerSplit => &["num_splits", "stagger_gap_ticks"],
        ActionKind::SetReleaseBudget => &["budget"],
        ActionKind::SetStateRegister => &["register", "value"],
        ActionKind::PostCollateral | ActionKind::WithdrawCollateral => &["amount"],
        _ => &[],
    }
}

fn check_expression(
    expr: &Expression,
    kind: TreeKind,
    def: &PolicyDef,
    errors: &mut Vec<PolicyValidationError>,
) {
    match expr {
        Expression::Equal { left, right }
        | Expression::NotEqual { left, right }
        | Expression::LessThan { left, right }
        | Expression::LessOrEqual { left, right }
        | Expression::GreaterThan { left, right }
        | Expression::GreaterOrEqual { left, right } => {
            check_value(left, kind, def, errors);
            check_value(right, kind, def, errors);
        }
        Expression::And { conditions } | Expression::Or { conditions } => {
            for c in conditions {
                check_expression(c, kind, def, errors);
            }
        }
        Expression::Not { condition } => check_expression(condition, kind, def, errors),
    }
}

fn check_value(
    value: &ValueExpr,
    kind: TreeKind,
    def: &PolicyDef,
    errors: &mut Vec<PolicyValidationError>,
) {
    match value {
        ValueExpr::Field { field } => {
            if !is_field_valid(kind, field) {
                errors.push(PolicyValidationError::InvalidFieldReference {
                    tree: kind.name(),
                    field: field.clone(),
                });
            }
        }
        ValueExpr::Param { param } => {
            if !def.parameters.contains_key(param) {
                errors.push(PolicyValidationError::UnknownParameter {
                    tree: kind.name(),
                    param: param.clone(),
                });
            }
        }
        ValueExpr::Literal { .. } => {}
        ValueExpr::Compute { compute } => check_computation(compute, kind, def, errors),
    }
}

fn check_computation(
    computation: &Computation,
    kind: TreeKind,
    def: &PolicyDef,
    errors: &mut Vec<PolicyValidationError>,
) {
    match computation {
        Computation::Add { left, right }
        | Computation::Subtract { left, right }
        | Computation::Multiply { left, right }
        | Computation::Divide { left, right } => {
            check_value(left, kind, def, errors);
            check_value(right, kind, def, errors);
        }
        Computation::Max { values } | Computation::Min { values } => {
            for v in values {
                check_value(v, kind, def, errors);
            }
        }
        Computation::Floor { value }
        | Computation::Ceil { value }
        | Computation::Abs { value } => check_value(value, kind, def, errors),
        Computation::Clamp { value, min, max } => {
            check_value(value, kind, def, errors);
            check_value(min, kind, def, errors);
            check_value(max, kind, def, errors);
        }
        Computation::SafeDiv {
            numerator,
            denominator,
            default,
        } => {
            check_value(numerator, kind, def, errors);
            check_value(denominator, kind, def, errors);
            check_value(default, kind, def, errors);
        }
    }
}
