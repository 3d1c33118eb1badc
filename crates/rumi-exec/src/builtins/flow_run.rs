// SPDX-License-Identifier: MIT OR Apache-2.0
//! `flow.run`: always intercepted and executed in-process by the flow
//! executor. Handler steps dispatch back through the capability pipeline
//! under the calling principal, so every step is re-authorized.

use crate::context::HandlerContext;
use crate::executor::CapabilityExecutor;
use async_trait::async_trait;
use rumi_core::{CapError, CapResult, Principal};
use rumi_flow::{CancellationFlag, FlowDef, FlowExecutor, StepHandler};
use serde_json::{Map, Value, json};
use std::sync::Arc;

pub(crate) async fn execute(
    ctx: &HandlerContext,
    executor: &Arc<CapabilityExecutor>,
    args: &Value,
    chain_depth: usize,
) -> CapResult {
    let flow: FlowDef = match args.get("flow") {
        Some(raw) => serde_json::from_value(raw.clone())
            .map_err(|e| CapError::validation(format!("Invalid flow definition: {e}")))?,
        None => return Err(CapError::validation("Missing flow")),
    };
    let initial_ctx: Map<String, Value> = match args.get("ctx") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(CapError::validation("Invalid ctx: must be an object")),
    };

    let handler: Arc<dyn StepHandler> = Arc::new(PrincipalStepHandler {
        executor: Arc::clone(executor),
        principal: ctx.principal.clone(),
        chain_depth: chain_depth + 1,
    });
    let flow_executor = FlowExecutor::new(handler);
    let outcome = flow_executor
        .execute(&flow, initial_ctx, CancellationFlag::new(), chain_depth)
        .await;

    match outcome.error {
        None => Ok(json!({"completed": outcome.completed, "ctx": outcome.ctx})),
        Some(e) => Err(e),
    }
}

// Routes flow handler steps back through the authorization pipeline.
struct PrincipalStepHandler {
    executor: Arc<CapabilityExecutor>,
    principal: Principal,
    chain_depth: usize,
}

#[async_trait]
impl StepHandler for PrincipalStepHandler {
    async fn invoke(&self, permission_id: &str, args: Value) -> CapResult {
        self.executor
            .execute_inner(&self.principal, permission_id, &args, self.chain_depth)
            .await
    }
}
