//! Decision-tree definitions, deserialized from the JSON DSL.
//!
//! Trees and nodes are plain sum types; the evaluator is a small
//! recursive interpreter, with no dynamic dispatch. Built-in behaviors
//! ("always release", "release near deadline") are just small trees.

use crate::num::Ratio;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A complete policy: up to four trees plus named parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDef {
    pub policy_id: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Q1 release decisions, evaluated per transaction.
    #[serde(default)]
    pub payment_tree: Option<TreeNode>,

    /// Per-tick bank-level decisions (budgets, registers).
    #[serde(default)]
    pub bank_tree: Option<TreeNode>,

    /// Forward-looking collateral decisions, before settlements.
    #[serde(default)]
    pub strategic_collateral_tree: Option<TreeNode>,

    /// Reactive collateral cleanup, after settlements.
    #[serde(default)]
    pub end_of_tick_collateral_tree: Option<TreeNode>,

    /// Named constants and thresholds referenced via `{"param": ..}`.
    #[serde(default)]
    pub parameters: BTreeMap<String, Ratio>,
}

impl PolicyDef {
    /// A payment tree consisting of a single action leaf. The built-in
    /// FIFO behavior is `always("Release")`.
    pub fn always(action: ActionKind) -> Self {
        Self {
            policy_id: format!("always_{}", action),
            description: None,
            payment_tree: Some(TreeNode::Action {
                node_id: "A1".to_string(),
                action,
                register: None,
                parameters: BTreeMap::new(),
            }),
            bank_tree: None,
            strategic_collateral_tree: None,
            end_of_tick_collateral_tree: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn tree(&self, kind: TreeKind) -> Option<&TreeNode> {
        match kind {
            TreeKind::Payment => self.payment_tree.as_ref(),
            TreeKind::Bank => self.bank_tree.as_ref(),
            TreeKind::StrategicCollateral => self.strategic_collateral_tree.as_ref(),
            TreeKind::EndOfTickCollateral => self.end_of_tick_collateral_tree.as_ref(),
        }
    }
}

/// Which of the four trees a node belongs to. Determines the visible
/// field vocabulary and the permitted actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeKind {
    Payment,
    Bank,
    StrategicCollateral,
    EndOfTickCollateral,
}

impl TreeKind {
    pub const ALL: [TreeKind; 4] = [
        TreeKind::Payment,
        TreeKind::Bank,
        TreeKind::StrategicCollateral,
        TreeKind::EndOfTickCollateral,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TreeKind::Payment => "payment_tree",
            TreeKind::Bank => "bank_tree",
            TreeKind::StrategicCollateral => "strategic_collateral_tree",
            TreeKind::EndOfTickCollateral => "end_of_tick_collateral_tree",
        }
    }

    pub fn permits(&self, action: ActionKind) -> bool {
        use ActionKind::*;
        match self {
            TreeKind::Payment => {
                matches!(action, Release | Hold | Drop | Split | StaggerSplit)
            }
            TreeKind::Bank => matches!(action, SetReleaseBudget | SetStateRegister | Hold),
            TreeKind::StrategicCollateral | TreeKind::EndOfTickCollateral => {
                matches!(action, PostCollateral | WithdrawCollateral | HoldCollateral)
            }
        }
    }
}

/// A node: either a condition with two children, or a terminal action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TreeNode {
    Condition {
        node_id: String,

        #[serde(default)]
        description: String,

        condition: Expression,

        on_true: Box<TreeNode>,
        on_false: Box<TreeNode>,
    },

    Action {
        node_id: String,

        action: ActionKind,

        /// Register name for `SetStateRegister`.
        #[serde(default)]
        register: Option<String>,

        /// Numeric action arguments (e.g. `num_splits`, `amount`,
        /// `budget`, `value`), each a value expression.
        #[serde(default)]
        parameters: BTreeMap<String, ValueExpr>,
    },
}

impl TreeNode {
    pub fn node_id(&self) -> &str {
        match self {
            TreeNode::Condition { node_id, .. } | TreeNode::Action { node_id, .. } => node_id,
        }
    }

    pub fn is_action(&self) -> bool {
        matches!(self, TreeNode::Action { .. })
    }
}

/// Boolean expression over the evaluation context. `and`/`or`
/// short-circuit; comparisons are exact rational comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Expression {
    #[serde(rename = "==")]
    Equal { left: ValueExpr, right: ValueExpr },

    #[serde(rename = "!=")]
    NotEqual { left: ValueExpr, right: ValueExpr },

    #[serde(rename = "<")]
    LessThan { left: ValueExpr, right: ValueExpr },

    #[serde(rename = "<=")]
    LessOrEqual { left: ValueExpr, right: ValueExpr },

    #[serde(rename = ">")]
    GreaterThan { left: ValueExpr, right: ValueExpr },

    #[serde(rename = ">=")]
    GreaterOrEqual { left: ValueExpr, right: ValueExpr },

    #[serde(rename = "and")]
    And { conditions: Vec<Expression> },

    #[serde(rename = "or")]
    Or { conditions: Vec<Expression> },

    #[serde(rename = "not")]
    Not { condition: Box<Expression> },
}

/// A value leaf: context field, named parameter, literal, or computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueExpr {
    Field { field: String },
    Param { param: String },
    Literal { value: Ratio },
    Compute { compute: Box<Computation> },
}

/// Arithmetic over exact rationals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Computation {
    #[serde(rename = "+")]
    Add { left: ValueExpr, right: ValueExpr },

    #[serde(rename = "-")]
    Subtract { left: ValueExpr, right: ValueExpr },

    #[serde(rename = "*")]
    Multiply { left: ValueExpr, right: ValueExpr },

    #[serde(rename = "/")]
    Divide { left: ValueExpr, right: ValueExpr },

    #[serde(rename = "max")]
    Max { values: Vec<ValueExpr> },

    #[serde(rename = "min")]
    Min { values: Vec<ValueExpr> },

    #[serde(rename = "floor")]
    Floor { value: ValueExpr },

    #[serde(rename = "ceil")]
    Ceil { value: ValueExpr },

    #[serde(rename = "abs")]
    Abs { value: ValueExpr },

    #[serde(rename = "clamp")]
    Clamp {
        value: ValueExpr,
        min: ValueExpr,
        max: ValueExpr,
    },

    /// Division that yields `default` when the denominator is zero.
    #[serde(rename = "div0")]
    SafeDiv {
        numerator: ValueExpr,
        denominator: ValueExpr,
        default: ValueExpr,
    },
}

/// Terminal directives, restricted per tree by [`TreeKind::permits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    /// Submit the transaction to RTGS (payment tree); no-op (bank tree).
    Release,
    /// Keep the transaction in Q1.
    Hold,
    /// Terminally remove the transaction.
    Drop,
    /// Split into `num_splits` children, submitted this tick.
    Split,
    /// Split and pace children across subsequent ticks.
    StaggerSplit,
    /// Cap the number of releases this agent makes this tick.
    SetReleaseBudget,
    /// Write a named per-agent register.
    SetStateRegister,
    /// Post collateral (gated by hysteresis).
    PostCollateral,
    /// Withdraw collateral (gated by hysteresis + holding period).
    WithdrawCollateral,
    /// Leave collateral unchanged.
    HoldCollateral,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Release => "Release",
            ActionKind::Hold => "Hold",
            ActionKind::Drop => "Drop",
            ActionKind::Split => "Split",
            ActionKind::StaggerSplit => "StaggerSplit",
            ActionKind::SetReleaseBudget => "SetReleaseBudget",
            ActionKind::SetStateRegister => "SetStateRegister",
            ActionKind::PostCollateral => "PostCollateral",
            ActionKind::WithdrawCollateral => "WithdrawCollateral",
            ActionKind::HoldCollateral => "HoldCollateral",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_tree_parses() {
        let json = r#"{
            "policy_id": "minimal",
            "payment_tree": {
                "node_id": "N1",
                "type": "condition",
                "condition": {
                    "op": ">",
                    "left": {"field": "balance"},
                    "right": {"field": "amount"}
                },
                "on_true": {"node_id": "A1", "type": "action", "action": "Release"},
                "on_false": {"node_id": "A2", "type": "action", "action": "Hold"}
            }
        }"#;
        let def: PolicyDef = serde_json::from_str(json).unwrap();
        assert_eq!(def.policy_id, "minimal");
        assert!(matches!(
            def.payment_tree.as_ref().unwrap(),
            TreeNode::Condition { .. }
        ));
    }

    #[test]
    fn literal_values_accept_decimals_and_fractions() {
        let json = r#"{"value": 0.75}"#;
        let v: ValueExpr = serde_json::from_str(json).unwrap();
        match v {
            ValueExpr::Literal { value } => assert_eq!(value, Ratio::new(3, 4).unwrap()),
            other => panic!("expected literal, got {:?}", other),
        }
        let v: ValueExpr = serde_json::from_str(r#"{"value": {"num": 1, "den": 3}}"#).unwrap();
        assert!(matches!(v, ValueExpr::Literal { .. }));
    }

    #[test]
    fn action_with_parameters_parses() {
        let json = r#"{
            "node_id": "A1",
            "type": "action",
            "action": "Split",
            "parameters": {"num_splits": {"value": 3}}
        }"#;
        let node: TreeNode = serde_json::from_str(json).unwrap();
        match node {
            TreeNode::Action {
                action, parameters, ..
            } => {
                assert_eq!(action, ActionKind::Split);
                assert!(parameters.contains_key("num_splits"));
            }
            other => panic!("expected action, got {:?}", other),
        }
    }

    #[test]
    fn always_release_is_a_single_leaf() {
        let def = PolicyDef::always(ActionKind::Release);
        assert!(def.payment_tree.as_ref().unwrap().is_action());
        assert!(crate::policy::validate_policy(&def).is_ok());
    }

    #[test]
    fn permission_tables() {
        assert!(TreeKind::Payment.permits(ActionKind::StaggerSplit));
        assert!(!TreeKind::Payment.permits(ActionKind::PostCollateral));
        assert!(TreeKind::Bank.permits(ActionKind::Hold));
        assert!(!TreeKind::Bank.permits(ActionKind::Release));
        assert!(TreeKind::StrategicCollateral.permits(ActionKind::WithdrawCollateral));
        assert!(!TreeKind::EndOfTickCollateral.permits(ActionKind::Drop));
    }

    #[test]
    fn all_expression_ops_parse() {
        for op in ["==", "!=", "<", "<=", ">", ">="] {
            let json = format!(
                r#"{{"op": "{}", "left": {{"field": "balance"}}, "right": {{"value": 0}}}}"#,
                op
            );
            let parsed: Result<Expression, _> = serde_json::from_str(&json);
            assert!(parsed.is_ok(), "operator {} failed to parse", op);
        }
        let logical = r#"{
            "op": "and",
            "conditions": [
                {"op": ">", "left": {"field": "balance"}, "right": {"value": 0}},
                {"op": "not", "condition":
                    {"op": "==", "left": {"field": "q1_size"}, "right": {"value": 0}}}
            ]
        }"#;
        assert!(serde_json::from_str::<Expression>(logical).is_ok());
    }
}
