// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-call handler context.

use rumi_core::Principal;
use serde_json::{Map, Value};

/// What a handler learns about its caller: the principal and the effective
/// grant config after chain intersection. Never the raw request transport.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Calling principal.
    pub principal: Principal,
    /// Effective grant configuration.
    pub grant_config: Map<String, Value>,
}

impl HandlerContext {
    /// Convenience accessor: a list-valued config key as strings.
    pub fn config_strings(&self, key: &str) -> Option<Vec<String>> {
        self.grant_config.get(key)?.as_array().map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
    }

    /// Convenience accessor: a numeric config key.
    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.grant_config.get(key)?.as_u64()
    }
}
