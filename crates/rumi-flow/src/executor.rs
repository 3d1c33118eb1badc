// SPDX-License-Identifier: MIT OR Apache-2.0
//! The step engine.

use crate::cancel::CancellationFlag;
use crate::condition::eval_condition;
use crate::model::{FlowDef, OnError, Step, StepKind};
use crate::order::execution_order;
use crate::resolver::VariableResolver;
use crate::{FLOW_TIMEOUT_KEY, MAX_FLOW_CHAIN_DEPTH, PARALLEL_RESULTS_KEY, RETRY_ERROR_KEY};
use async_trait::async_trait;
use futures::future::BoxFuture;
use rumi_core::{CapError, CapResult, ErrorKind};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Dispatch seam for `handler` steps.
///
/// The capability executor implements this for real flows; tests provide
/// in-memory fakes.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Invoke the handler behind `permission_id` with resolved `args`.
    async fn invoke(&self, permission_id: &str, args: Value) -> CapResult;
}

/// Final state of a flow run.
#[derive(Debug)]
pub struct FlowOutcome {
    /// Context after the last executed step.
    pub ctx: Map<String, Value>,
    /// Whether the flow ran to completion (no abort, no cancellation).
    pub completed: bool,
    /// The error that stopped the flow, when it did not complete.
    pub error: Option<CapError>,
}

struct StepsResult {
    ctx: Map<String, Value>,
    aborted: Option<CapError>,
}

/// Executes flows against a [`StepHandler`].
pub struct FlowExecutor {
    handler: Arc<dyn StepHandler>,
    resolver: VariableResolver,
    max_chain_depth: usize,
}

impl FlowExecutor {
    /// Executor with the default chain-depth bound.
    pub fn new(handler: Arc<dyn StepHandler>) -> Arc<Self> {
        Arc::new(Self {
            handler,
            resolver: VariableResolver::new(),
            max_chain_depth: MAX_FLOW_CHAIN_DEPTH,
        })
    }

    /// Run a flow.
    ///
    /// `chain_depth` counts nested `flow.run` invocations; depth at or past
    /// the bound refuses to run.
    pub async fn execute(
        self: &Arc<Self>,
        flow: &FlowDef,
        initial_ctx: Map<String, Value>,
        cancel: CancellationFlag,
        chain_depth: usize,
    ) -> FlowOutcome {
        if chain_depth >= self.max_chain_depth {
            return FlowOutcome {
                ctx: initial_ctx,
                completed: false,
                error: Some(CapError::new(
                    ErrorKind::ValidationError,
                    format!("Flow chain depth exceeds {}", self.max_chain_depth),
                )),
            };
        }
        debug!(target: "rumi.flow", flow_id = %flow.flow_id, steps = flow.steps.len(), "flow start");
        let result = Arc::clone(self)
            .run_steps(flow.steps.clone(), initial_ctx, cancel, flow.on_error)
            .await;
        debug!(
            target: "rumi.flow",
            flow_id = %flow.flow_id,
            completed = result.aborted.is_none(),
            "flow end"
        );
        FlowOutcome {
            ctx: result.ctx,
            completed: result.aborted.is_none(),
            error: result.aborted,
        }
    }

    fn run_steps(
        self: Arc<Self>,
        steps: Vec<Step>,
        mut ctx: Map<String, Value>,
        cancel: CancellationFlag,
        on_error: OnError,
    ) -> BoxFuture<'static, StepsResult> {
        Box::pin(async move {
            let order = execution_order(&steps);
            for idx in order {
                let step = &steps[idx];

                if let Some(err) = interrupt_reason(&ctx, &cancel) {
                    return StepsResult {
                        ctx,
                        aborted: Some(err),
                    };
                }

                // `branch` consumes `when` as its selector; everything else
                // treats it as a gate.
                if step.kind != StepKind::Branch
                    && let Some(condition) = &step.when
                    && !eval_condition(condition, &ctx, &self.resolver)
                {
                    debug!(target: "rumi.flow", step = %step.id, "skipped by when");
                    continue;
                }

                // Every step boundary is a suspension point.
                tokio::task::yield_now().await;

                let aborted = match step.kind {
                    StepKind::Handler => self.run_handler_step(step, &mut ctx, on_error).await,
                    StepKind::Retry => self.run_retry_step(step, &mut ctx, on_error).await,
                    StepKind::Loop => {
                        self.run_loop_step(step, &mut ctx, &cancel, on_error).await
                    }
                    StepKind::Branch => {
                        self.run_branch_step(step, &mut ctx, &cancel, on_error).await
                    }
                    StepKind::Group => {
                        self.run_children(step.children.clone(), &mut ctx, &cancel, on_error)
                            .await
                    }
                    StepKind::Parallel => {
                        self.run_parallel_step(step, &mut ctx, &cancel, on_error).await
                    }
                };
                if let Some(err) = aborted {
                    return StepsResult {
                        ctx,
                        aborted: Some(err),
                    };
                }
            }
            StepsResult { ctx, aborted: None }
        })
    }

    async fn run_handler_step(
        &self,
        step: &Step,
        ctx: &mut Map<String, Value>,
        on_error: OnError,
    ) -> Option<CapError> {
        let result = self.invoke_step_handler(step, ctx).await;
        self.record_result(step, ctx, result, on_error)
    }

    async fn run_retry_step(
        &self,
        step: &Step,
        ctx: &mut Map<String, Value>,
        on_error: OnError,
    ) -> Option<CapError> {
        let attempts = step.max_attempts.unwrap_or(1).max(1);
        let delay = Duration::from_millis(step.delay_ms.unwrap_or(0));
        let mut last = self.invoke_step_handler(step, ctx).await;
        for attempt in 1..attempts {
            match &last {
                Ok(_) => break,
                Err(e) => {
                    ctx.insert(
                        RETRY_ERROR_KEY.to_string(),
                        json!({"error": e.message, "error_type": e.kind.as_str(), "attempt": attempt}),
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    last = self.invoke_step_handler(step, ctx).await;
                }
            }
        }
        self.record_result(step, ctx, last, on_error)
    }

    async fn run_loop_step(
        &self,
        step: &Step,
        ctx: &mut Map<String, Value>,
        cancel: &CancellationFlag,
        on_error: OnError,
    ) -> Option<CapError> {
        let max_iterations = step.max_iterations.unwrap_or(1);
        for _ in 0..max_iterations {
            if let Some(err) = interrupt_reason(ctx, cancel) {
                return Some(err);
            }
            if let Some(err) = self
                .run_children(step.children.clone(), ctx, cancel, on_error)
                .await
            {
                return Some(err);
            }
            if let Some(exit) = &step.exit_when
                && eval_condition(exit, ctx, &self.resolver)
            {
                break;
            }
        }
        None
    }

    async fn run_branch_step(
        &self,
        step: &Step,
        ctx: &mut Map<String, Value>,
        cancel: &CancellationFlag,
        on_error: OnError,
    ) -> Option<CapError> {
        let take_then = step
            .when
            .as_deref()
            .map(|c| eval_condition(c, ctx, &self.resolver))
            .unwrap_or(true);
        let children = if take_then {
            step.then_steps.clone()
        } else {
            step.else_steps.clone()
        };
        self.run_children(children, ctx, cancel, on_error).await
    }

    async fn run_parallel_step(
        &self,
        step: &Step,
        ctx: &mut Map<String, Value>,
        cancel: &CancellationFlag,
        on_error: OnError,
    ) -> Option<CapError> {
        let snapshot = ctx.clone();
        let mut handles = Vec::with_capacity(step.branches.len());
        for branch in step.branches.clone() {
            let this = Arc::new(self.clone_shallow());
            let branch_ctx = snapshot.clone();
            let branch_cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                this.run_steps(branch, branch_ctx, branch_cancel, on_error)
                    .await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(result) => {
                    if first_error.is_none() {
                        first_error = result.aborted;
                    }
                    results.push(Value::Object(ctx_delta(&snapshot, &result.ctx)));
                }
                Err(_) => {
                    first_error.get_or_insert_with(|| {
                        CapError::new(ErrorKind::InternalError, "Parallel branch panicked")
                    });
                    results.push(Value::Null);
                }
            }
        }
        ctx.insert(PARALLEL_RESULTS_KEY.to_string(), Value::Array(results));
        match on_error {
            OnError::Abort => first_error,
            OnError::Continue => None,
        }
    }

    async fn run_children(
        &self,
        children: Vec<Step>,
        ctx: &mut Map<String, Value>,
        cancel: &CancellationFlag,
        on_error: OnError,
    ) -> Option<CapError> {
        let this = Arc::new(self.clone_shallow());
        let result = this
            .run_steps(children, std::mem::take(ctx), cancel.clone(), on_error)
            .await;
        *ctx = result.ctx;
        result.aborted
    }

    async fn invoke_step_handler(&self, step: &Step, ctx: &Map<String, Value>) -> CapResult {
        let Some(permission_id) = step.handler.as_deref() else {
            return Err(CapError::validation(format!(
                "Step {} has no handler",
                step.id
            )));
        };
        let args = self.resolver.resolve_args(&step.args, ctx);
        self.handler.invoke(permission_id, args).await
    }

    fn record_result(
        &self,
        step: &Step,
        ctx: &mut Map<String, Value>,
        result: CapResult,
        on_error: OnError,
    ) -> Option<CapError> {
        match result {
            Ok(output) => {
                ctx.insert(step.id.clone(), output);
                None
            }
            Err(e) => {
                warn!(target: "rumi.flow", step = %step.id, error = %e, "step failed");
                ctx.insert(
                    step.id.clone(),
                    json!({"error": e.message, "error_type": e.kind.as_str()}),
                );
                match on_error {
                    OnError::Abort => Some(e),
                    OnError::Continue => None,
                }
            }
        }
    }

    fn clone_shallow(&self) -> FlowExecutor {
        FlowExecutor {
            handler: Arc::clone(&self.handler),
            resolver: self.resolver.clone(),
            max_chain_depth: self.max_chain_depth,
        }
    }
}

fn interrupt_reason(ctx: &Map<String, Value>, cancel: &CancellationFlag) -> Option<CapError> {
    if cancel.is_cancelled() {
        return Some(CapError::new(ErrorKind::Timeout, "Flow cancelled"));
    }
    if ctx.get(FLOW_TIMEOUT_KEY).is_some_and(truthy_flag) {
        return Some(CapError::new(ErrorKind::Timeout, "Flow timed out"));
    }
    None
}

fn truthy_flag(value: &Value) -> bool {
    matches!(value, Value::Bool(true))
}

// Entries added or changed relative to `before`.
fn ctx_delta(before: &Map<String, Value>, after: &Map<String, Value>) -> Map<String, Value> {
    after
        .iter()
        .filter(|(k, v)| before.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    // Records invocations; `fail.*` permissions fail, `flaky.*` fail until
    // the third call.
    struct FakeHandler {
        calls: AtomicU32,
    }

    impl FakeHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl StepHandler for FakeHandler {
        async fn invoke(&self, permission_id: &str, args: Value) -> CapResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if permission_id.starts_with("fail.") {
                return Err(CapError::new(ErrorKind::InternalError, "boom"));
            }
            if permission_id.starts_with("flaky.") && call < 3 {
                return Err(CapError::new(ErrorKind::Timeout, "not yet"));
            }
            Ok(json!({"permission": permission_id, "args": args, "call": call}))
        }
    }

    fn flow(steps: Vec<Step>, on_error: OnError) -> FlowDef {
        FlowDef {
            flow_id: "test-flow".to_string(),
            steps,
            on_error,
        }
    }

    #[tokio::test]
    async fn handler_output_lands_under_step_id() {
        let exec = FlowExecutor::new(FakeHandler::new());
        let outcome = exec
            .execute(
                &flow(
                    vec![Step::handler("fetch", "store.get", json!({"key": "k"}))],
                    OnError::Continue,
                ),
                Map::new(),
                CancellationFlag::new(),
                0,
            )
            .await;
        assert!(outcome.completed);
        assert_eq!(outcome.ctx["fetch"]["permission"], json!("store.get"));
    }

    #[tokio::test]
    async fn args_resolve_against_prior_outputs() {
        let exec = FlowExecutor::new(FakeHandler::new());
        let steps = vec![
            Step::handler("first", "seed.value", json!({})),
            Step::handler("second", "use.value", json!({"prev": "$flow.first.call"})).after("first"),
        ];
        let outcome = exec
            .execute(
                &flow(steps, OnError::Continue),
                Map::new(),
                CancellationFlag::new(),
                0,
            )
            .await;
        assert_eq!(outcome.ctx["second"]["args"]["prev"], json!(1));
    }

    #[tokio::test]
    async fn failed_step_records_error_and_continues() {
        let exec = FlowExecutor::new(FakeHandler::new());
        let steps = vec![
            Step::handler("bad", "fail.op", json!({})),
            Step::handler("good", "ok.op", json!({})),
        ];
        let outcome = exec
            .execute(
                &flow(steps, OnError::Continue),
                Map::new(),
                CancellationFlag::new(),
                0,
            )
            .await;
        assert!(outcome.completed);
        assert_eq!(outcome.ctx["bad"]["error_type"], json!("internal_error"));
        assert!(outcome.ctx.contains_key("good"));
    }

    #[tokio::test]
    async fn abort_policy_stops_at_first_error() {
        let exec = FlowExecutor::new(FakeHandler::new());
        let steps = vec![
            Step::handler("bad", "fail.op", json!({})),
            Step::handler("never", "ok.op", json!({})),
        ];
        let outcome = exec
            .execute(
                &flow(steps, OnError::Abort),
                Map::new(),
                CancellationFlag::new(),
                0,
            )
            .await;
        assert!(!outcome.completed);
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::InternalError);
        assert!(!outcome.ctx.contains_key("never"));
    }

    #[tokio::test]
    async fn when_gate_skips_step() {
        let exec = FlowExecutor::new(FakeHandler::new());
        let mut ctx = Map::new();
        ctx.insert("mode".to_string(), json!("slow"));
        let steps = vec![
            Step::handler("gated", "ok.op", json!({})).when("$ctx.mode == fast"),
            Step::handler("always", "ok.op", json!({})),
        ];
        let outcome = exec
            .execute(
                &flow(steps, OnError::Continue),
                ctx,
                CancellationFlag::new(),
                0,
            )
            .await;
        assert!(!outcome.ctx.contains_key("gated"));
        assert!(outcome.ctx.contains_key("always"));
    }

    #[tokio::test]
    async fn branch_picks_then_or_else() {
        let exec = FlowExecutor::new(FakeHandler::new());
        let mut branch = Step::handler("route", "unused.x", json!({}));
        branch.kind = StepKind::Branch;
        branch.handler = None;
        branch.when = Some("$ctx.mode == fast".to_string());
        branch.then_steps = vec![Step::handler("fast_path", "ok.fast", json!({}))];
        branch.else_steps = vec![Step::handler("slow_path", "ok.slow", json!({}))];

        let mut ctx = Map::new();
        ctx.insert("mode".to_string(), json!("fast"));
        let outcome = exec
            .execute(
                &flow(vec![branch.clone()], OnError::Continue),
                ctx,
                CancellationFlag::new(),
                0,
            )
            .await;
        assert!(outcome.ctx.contains_key("fast_path"));
        assert!(!outcome.ctx.contains_key("slow_path"));

        let mut ctx = Map::new();
        ctx.insert("mode".to_string(), json!("slow"));
        let outcome = exec
            .execute(
                &flow(vec![branch], OnError::Continue),
                ctx,
                CancellationFlag::new(),
                0,
            )
            .await;
        assert!(outcome.ctx.contains_key("slow_path"));
    }

    #[tokio::test]
    async fn loop_runs_until_exit_when() {
        let exec = FlowExecutor::new(FakeHandler::new());
        let mut lp = Step::handler("lp", "unused.x", json!({}));
        lp.kind = StepKind::Loop;
        lp.handler = None;
        lp.max_iterations = Some(10);
        lp.exit_when = Some("$ctx.tick.call == 3".to_string());
        lp.children = vec![Step::handler("tick", "ok.tick", json!({}))];

        let outcome = exec
            .execute(
                &flow(vec![lp], OnError::Continue),
                Map::new(),
                CancellationFlag::new(),
                0,
            )
            .await;
        assert!(outcome.completed);
        assert_eq!(outcome.ctx["tick"]["call"], json!(3));
    }

    #[tokio::test]
    async fn loop_respects_max_iterations() {
        let handler = FakeHandler::new();
        let exec = FlowExecutor::new(handler.clone());
        let mut lp = Step::handler("lp", "unused.x", json!({}));
        lp.kind = StepKind::Loop;
        lp.handler = None;
        lp.max_iterations = Some(4);
        lp.children = vec![Step::handler("tick", "ok.tick", json!({}))];

        exec.execute(
            &flow(vec![lp], OnError::Continue),
            Map::new(),
            CancellationFlag::new(),
            0,
        )
        .await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn parallel_merges_branch_results() {
        let exec = FlowExecutor::new(FakeHandler::new());
        let mut par = Step::handler("par", "unused.x", json!({}));
        par.kind = StepKind::Parallel;
        par.handler = None;
        par.branches = vec![
            vec![Step::handler("left", "ok.left", json!({}))],
            vec![Step::handler("right", "ok.right", json!({}))],
        ];

        let outcome = exec
            .execute(
                &flow(vec![par], OnError::Continue),
                Map::new(),
                CancellationFlag::new(),
                0,
            )
            .await;
        assert!(outcome.completed);
        let results = outcome.ctx[PARALLEL_RESULTS_KEY].as_array().unwrap();
        assert_eq!(results.len(), 2);
        let merged: Vec<&Value> = results.iter().collect();
        assert!(merged.iter().any(|r| r.get("left").is_some()));
        assert!(merged.iter().any(|r| r.get("right").is_some()));
    }

    #[tokio::test]
    async fn retry_records_error_then_succeeds() {
        let exec = FlowExecutor::new(FakeHandler::new());
        let mut retry = Step::handler("eventually", "flaky.op", json!({}));
        retry.kind = StepKind::Retry;
        retry.max_attempts = Some(5);
        retry.delay_ms = Some(1);

        let outcome = exec
            .execute(
                &flow(vec![retry], OnError::Abort),
                Map::new(),
                CancellationFlag::new(),
                0,
            )
            .await;
        assert!(outcome.completed);
        assert_eq!(outcome.ctx["eventually"]["call"], json!(3));
        assert_eq!(outcome.ctx[RETRY_ERROR_KEY]["error_type"], json!("timeout"));
    }

    #[tokio::test]
    async fn retry_exhaustion_fails_step() {
        let exec = FlowExecutor::new(FakeHandler::new());
        let mut retry = Step::handler("doomed", "fail.op", json!({}));
        retry.kind = StepKind::Retry;
        retry.max_attempts = Some(2);

        let outcome = exec
            .execute(
                &flow(vec![retry], OnError::Abort),
                Map::new(),
                CancellationFlag::new(),
                0,
            )
            .await;
        assert!(!outcome.completed);
        assert_eq!(outcome.ctx["doomed"]["error_type"], json!("internal_error"));
    }

    #[tokio::test]
    async fn cancellation_aborts_between_steps() {
        let exec = FlowExecutor::new(FakeHandler::new());
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let outcome = exec
            .execute(
                &flow(
                    vec![Step::handler("never", "ok.op", json!({}))],
                    OnError::Continue,
                ),
                Map::new(),
                cancel,
                0,
            )
            .await;
        assert!(!outcome.completed);
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::Timeout);
        assert!(!outcome.ctx.contains_key("never"));
    }

    #[tokio::test]
    async fn flow_timeout_flag_aborts() {
        let exec = FlowExecutor::new(FakeHandler::new());
        let mut ctx = Map::new();
        ctx.insert(FLOW_TIMEOUT_KEY.to_string(), json!(true));
        let outcome = exec
            .execute(
                &flow(
                    vec![Step::handler("never", "ok.op", json!({}))],
                    OnError::Continue,
                ),
                ctx,
                CancellationFlag::new(),
                0,
            )
            .await;
        assert!(!outcome.completed);
        assert!(!outcome.ctx.contains_key("never"));
    }

    #[tokio::test]
    async fn chain_depth_is_bounded() {
        let exec = FlowExecutor::new(FakeHandler::new());
        let outcome = exec
            .execute(
                &flow(vec![], OnError::Continue),
                Map::new(),
                CancellationFlag::new(),
                MAX_FLOW_CHAIN_DEPTH,
            )
            .await;
        assert!(!outcome.completed);
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn dependencies_order_execution() {
        let exec = FlowExecutor::new(FakeHandler::new());
        let steps = vec![
            Step::handler("late", "ok.late", json!({})).after("early"),
            Step::handler("early", "ok.early", json!({})),
        ];
        let outcome = exec
            .execute(
                &flow(steps, OnError::Continue),
                Map::new(),
                CancellationFlag::new(),
                0,
            )
            .await;
        // "early" ran first, so it got the lower call number.
        assert_eq!(outcome.ctx["early"]["call"], json!(1));
        assert_eq!(outcome.ctx["late"]["call"], json!(2));
    }
}
