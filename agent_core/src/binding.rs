//! Runtime evaluation of parameter bindings against live telemetry.
//!
//! Evaluation never fails: an expression that cannot produce a value of the
//! expected type yields to the binding's literal, and a non-finite literal
//! yields zero. Each recovery logs a warning on `rover::engine`.

use program_runtime::{BooleanBinding, Expression, LiteralValue, NumberBinding, OperatorKind, ValueKind};
use tracing::warn;

use crate::telemetry::TelemetrySnapshot;

pub fn evaluate_number(binding: &NumberBinding, telemetry: &TelemetrySnapshot) -> f64 {
    if let Some(expression) = &binding.expression {
        if let Some(value) = number_expression(expression, telemetry) {
            return value;
        }
        warn!(target: "rover::engine", literal = binding.literal, "binding.number_fallback");
    }
    if binding.literal.is_finite() {
        binding.literal
    } else {
        warn!(target: "rover::engine", "binding.non_finite_literal");
        0.0
    }
}

pub fn evaluate_boolean(binding: &BooleanBinding, telemetry: &TelemetrySnapshot) -> bool {
    if let Some(expression) = &binding.expression {
        if let Some(value) = boolean_expression(expression, telemetry) {
            return value;
        }
        warn!(target: "rover::engine", literal = binding.literal, "binding.boolean_fallback");
    }
    binding.literal
}

fn number_expression(expression: &Expression, telemetry: &TelemetrySnapshot) -> Option<f64> {
    match expression {
        Expression::Literal {
            value: LiteralValue::Number(value),
        } => value.is_finite().then_some(*value),
        Expression::Literal { .. } => None,
        Expression::Signal { signal, fallback } => {
            if signal.expected != ValueKind::Number {
                return None;
            }
            telemetry
                .number(&signal.module_id, &signal.signal_id)
                .or_else(|| {
                    let fallback = fallback.as_deref()?;
                    number_expression(fallback, telemetry)
                })
                .or_else(|| {
                    warn!(target: "rover::engine", signal = %signal, "binding.signal_unavailable");
                    None
                })
        }
        Expression::Operator {
            operator: OperatorKind::Add,
            inputs,
        } => {
            let values: Vec<f64> = inputs
                .iter()
                .filter_map(|input| number_expression(input, telemetry))
                .collect();
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum())
            }
        }
        Expression::Operator { operator, .. } => {
            warn!(target: "rover::engine", ?operator, expected = %ValueKind::Number, "binding.operator_unsupported");
            None
        }
    }
}

fn boolean_expression(expression: &Expression, telemetry: &TelemetrySnapshot) -> Option<bool> {
    match expression {
        Expression::Literal {
            value: LiteralValue::Boolean(value),
        } => Some(*value),
        Expression::Literal { .. } => None,
        Expression::Signal { signal, fallback } => {
            if signal.expected != ValueKind::Boolean {
                return None;
            }
            telemetry
                .boolean(&signal.module_id, &signal.signal_id)
                .or_else(|| {
                    let fallback = fallback.as_deref()?;
                    boolean_expression(fallback, telemetry)
                })
                .or_else(|| {
                    warn!(target: "rover::engine", signal = %signal, "binding.signal_unavailable");
                    None
                })
        }
        Expression::Operator {
            operator: OperatorKind::And,
            inputs,
        } => {
            if inputs.is_empty() {
                return None;
            }
            Some(
                inputs
                    .iter()
                    .all(|input| boolean_expression(input, telemetry).unwrap_or(false)),
            )
        }
        Expression::Operator {
            operator: OperatorKind::GreaterThan,
            inputs,
        } => {
            let left = number_expression(inputs.first()?, telemetry)?;
            let right = number_expression(inputs.get(1)?, telemetry)?;
            Some(left > right)
        }
        Expression::Operator { operator, .. } => {
            warn!(target: "rover::engine", ?operator, expected = %ValueKind::Boolean, "binding.operator_unsupported");
            None
        }
    }
}
