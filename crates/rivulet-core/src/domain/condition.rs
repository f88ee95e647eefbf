//! Condition evaluation for conditioned sequence flows

use crate::CoreError;
use serde_json::Value;

/// Evaluates a sequence-flow condition against the process data
#[cfg_attr(test, mockall::automock)]
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate `expression` within `process_data`
    fn evaluate(&self, expression: &str, process_data: &Value) -> Result<bool, CoreError>;
}

/// Default evaluator: conditions are JMESPath expressions and the result's
/// truthiness decides the flow
///
/// `rejected == \`true\`` selects a flow when the process data carries
/// `{"rejected": true}`; a missing field evaluates to `null`, which is falsy.
#[derive(Debug, Clone, Copy, Default)]
pub struct JmesPathEvaluator;

impl ExpressionEvaluator for JmesPathEvaluator {
    fn evaluate(&self, expression: &str, process_data: &Value) -> Result<bool, CoreError> {
        let compiled = jmespath::compile(expression).map_err(|e| {
            CoreError::ExpressionError(format!(
                "Failed to compile JMESPath expression: {}: {}",
                expression, e
            ))
        })?;
        let result = compiled.search(process_data).map_err(|e| {
            CoreError::ExpressionError(format!(
                "Failed to evaluate JMESPath expression: {}: {}",
                expression, e
            ))
        })?;
        Ok(result.is_truthy())
    }
}
