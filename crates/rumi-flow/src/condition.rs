// SPDX-License-Identifier: MIT OR Apache-2.0
//! `when` / `exit_when` condition evaluation.

use crate::resolver::VariableResolver;
use serde_json::{Map, Value};

/// Evaluate a condition string against the context.
///
/// `lhs op rhs` with `op ∈ {==, !=}` compares both sides after variable
/// resolution (string forms, so `$ctx.n == 7` matches a numeric context
/// value). Anything else falls back to the truthiness of the resolved
/// expression: `null`, `false`, `0`, `""`, and empty containers are false.
pub fn eval_condition(
    expr: &str,
    ctx: &Map<String, Value>,
    resolver: &VariableResolver,
) -> bool {
    if let Some((lhs, rhs)) = expr.split_once("==") {
        if let Some((_, _)) = lhs.split_once("!=") {
            // Degenerate "a != b == c": not a recognized operator shape.
            return truthy(&resolver.resolve_value(&Value::String(expr.to_string()), ctx));
        }
        return compare(lhs, rhs, ctx, resolver);
    }
    if let Some((lhs, rhs)) = expr.split_once("!=") {
        return !compare(lhs, rhs, ctx, resolver);
    }
    truthy(&resolver.resolve_value(&Value::String(expr.trim().to_string()), ctx))
}

fn compare(lhs: &str, rhs: &str, ctx: &Map<String, Value>, resolver: &VariableResolver) -> bool {
    comparable(lhs, ctx, resolver) == comparable(rhs, ctx, resolver)
}

fn comparable(side: &str, ctx: &Map<String, Value>, resolver: &VariableResolver) -> String {
    let resolved = resolver.resolve_value(&Value::String(side.trim().to_string()), ctx);
    match resolved {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
