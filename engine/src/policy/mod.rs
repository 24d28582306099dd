//! Policy DSL: JSON decision trees evaluated per transaction and per tick.
//!
//! A policy is four optional trees:
//!
//! | tree | evaluated once per | actions |
//! |---|---|---|
//! | `payment_tree` | transaction in Q1 | Release, Hold, Drop, Split, StaggerSplit |
//! | `bank_tree` | agent per tick | SetReleaseBudget, SetStateRegister, Hold |
//! | `strategic_collateral_tree` | agent, before settlements | PostCollateral, WithdrawCollateral, HoldCollateral |
//! | `end_of_tick_collateral_tree` | agent, after settlements | same |
//!
//! Evaluation is a pure function of (tree, context, parameters) over exact
//! rationals — no floating point. Trees are fully type-checked before the
//! first tick; see [`validate`].

pub mod ast;
pub mod context;
pub mod eval;
pub mod validate;

pub use ast::{ActionKind, Computation, Expression, PolicyDef, TreeKind, TreeNode, ValueExpr};
pub use context::EvalContext;
pub use eval::{evaluate_tree, EvalError, Outcome};
pub use validate::{validate_policy, PolicyValidationError};
