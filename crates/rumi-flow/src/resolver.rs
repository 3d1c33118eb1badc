// SPDX-License-Identifier: MIT OR Apache-2.0
//! `$ctx` / `$flow` / `$env` variable resolution.

use serde_json::{Map, Value};

/// Default recursion bound for nested resolution.
pub const MAX_RESOLVE_DEPTH: usize = 20;

/// Resolves variable references in step arguments.
///
/// Three namespaces are recognized:
/// - `$ctx.a.b`: path lookup in the flow context;
/// - `$flow.step.out`: path lookup in the same context (step outputs are
///   stored under their step id);
/// - `$env.NAME`: process environment.
///
/// A string that is exactly one reference resolves to the referenced value
/// with its type preserved; references embedded in a larger string are
/// substituted in stringified form. Unresolvable references stay literal.
#[derive(Debug, Clone)]
pub struct VariableResolver {
    max_depth: usize,
}

impl Default for VariableResolver {
    fn default() -> Self {
        Self {
            max_depth: MAX_RESOLVE_DEPTH,
        }
    }
}

impl VariableResolver {
    /// Resolver with the default depth bound.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver with an explicit depth bound.
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Resolve one value (recursing into maps and lists).
    pub fn resolve_value(&self, value: &Value, ctx: &Map<String, Value>) -> Value {
        self.resolve_at(value, ctx, 0)
    }

    /// Resolve a handler argument map. Non-object values pass through.
    pub fn resolve_args(&self, args: &Value, ctx: &Map<String, Value>) -> Value {
        match args {
            Value::Object(_) => self.resolve_at(args, ctx, 0),
            other => other.clone(),
        }
    }

    fn resolve_at(&self, value: &Value, ctx: &Map<String, Value>, depth: usize) -> Value {
        if depth >= self.max_depth {
            return value.clone();
        }
        match value {
            Value::String(s) => self.resolve_string(s, ctx, depth),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_at(v, ctx, depth + 1)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.resolve_at(v, ctx, depth + 1))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve_string(&self, s: &str, ctx: &Map<String, Value>, depth: usize) -> Value {
        // Whole-token references keep the referenced value's type.
        if let Some((namespace, path)) = parse_token(s)
            && token_len(s) == s.len()
        {
            return match self.lookup(namespace, path, ctx) {
                Some(found) => self.resolve_at(&found, ctx, depth + 1),
                None => Value::String(s.to_string()),
            };
        }

        // Otherwise substitute each embedded reference in string form.
        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        let mut changed = false;
        while let Some(idx) = rest.find('$') {
            out.push_str(&rest[..idx]);
            let tail = &rest[idx..];
            match parse_token(tail) {
                Some((namespace, path)) => {
                    let len = token_len(tail);
                    match self.lookup(namespace, path, ctx) {
                        Some(found) => {
                            out.push_str(&stringify(&found));
                            changed = true;
                        }
                        None => out.push_str(&tail[..len]),
                    }
                    rest = &tail[len..];
                }
                None => {
                    out.push('$');
                    rest = &tail[1..];
                }
            }
        }
        out.push_str(rest);

        if changed {
            // Substituted text may itself contain references.
            self.resolve_at(&Value::String(out), ctx, depth + 1)
        } else {
            Value::String(out)
        }
    }

    fn lookup(&self, namespace: &str, path: &str, ctx: &Map<String, Value>) -> Option<Value> {
        match namespace {
            "env" => std::env::var(path).ok().map(Value::String),
            "ctx" | "flow" => {
                let mut current = Value::Object(ctx.clone());
                for part in path.split('.') {
                    current = current.get(part)?.clone();
                }
                Some(current)
            }
            _ => None,
        }
    }
}

// Parses "$ctx.a.b…" at the start of `s`, returning (namespace, path).
fn parse_token(s: &str) -> Option<(&str, &str)> {
    let rest = s.strip_prefix('$')?;
    let namespace = ["ctx", "flow", "env"]
        .into_iter()
        .find(|ns| rest.starts_with(ns) && rest[ns.len()..].starts_with('.'))?;
    let path_with_tail = &rest[namespace.len() + 1..];
    let end = path_with_tail
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
        .unwrap_or(path_with_tail.len());
    let path = path_with_tail[..end].trim_end_matches('.');
    if path.is_empty() {
        return None;
    }
    Some((namespace, path))
}

// Byte length of the token at the start of `s` (which must parse).
fn token_len(s: &str) -> usize {
    match parse_token(s) {
        Some((namespace, path)) => 1 + namespace.len() + 1 + path.len(),
        None => 0,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
