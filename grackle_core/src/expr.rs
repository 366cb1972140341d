//! The expression-evaluator seam.
//!
//! Calculated lengths, Size-relation get/set expressions and When conditions
//! all hand an opaque expression string plus a name→value scope to an
//! injected [`Evaluator`]. The engine defines only this contract; the
//! expression language itself lives in a collaborator.

use crate::value::Variant;
use std::collections::HashMap;

/// Named values visible to an expression.
pub type Scope = HashMap<String, Variant>;

/// Evaluates an expression against a scope, returning the resulting value.
///
/// Failures (bad expression, missing scope variable) propagate as evaluation
/// errors of whatever value computation triggered the call.
pub trait Evaluator {
    fn evaluate(&self, expression: &str, scope: &Scope) -> Result<Variant, anyhow::Error>;
}

/// Adapts a plain closure into an [`Evaluator`].
///
/// Mainly a convenience for tests and small embeddings.
pub struct FnEvaluator<F>(pub F);

impl<F> Evaluator for FnEvaluator<F>
where
    F: Fn(&str, &Scope) -> Result<Variant, anyhow::Error>,
{
    fn evaluate(&self, expression: &str, scope: &Scope) -> Result<Variant, anyhow::Error> {
        (self.0)(expression, scope)
    }
}
