//! ST-060: Executor, the orchestration loop for deploy and destroy.
//!
//! validate hooks -> build graph -> run-level pre hooks -> walk graph ->
//! run-level post hooks -> events.
//!
//! The walk keeps at most `settings.concurrency` stacks in flight. A node is
//! dispatched once every dependency settled successfully; when a node fails,
//! every transitive dependent that has not started is skipped. Destroy walks
//! the reversed graph. On cancellation no further nodes are dispatched and
//! in-flight nodes stop at their next poll tick.

use super::context::RunContext;
use super::eventlog::EventLog;
use super::graph::{NodeId, StackGraph, StackNode};
use super::report::{RunReport, StackReport};
use super::template::{load_template, parameters_from, render_template};
use super::types::{
    LifecyclePhase, ProvenanceEvent, RunAction, SkipReason, StackStatus, StrataConfig,
};
use crate::error::{ConfigError, ProviderError, StrataError};
use crate::hooks::{HookPipeline, HookRegistry, HookReport, PipelineResult};
use crate::lookups::{LookupRegistry, LookupScope, Resolver};
use crate::provider::{PollSettings, Provider, ProviderClient, StackRequest, StackResult};
use futures::FutureExt;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{Id as TaskId, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// Configuration for one deploy or destroy run.
pub struct RunConfig<'a> {
    pub config: &'a StrataConfig,
    pub action: RunAction,
    pub provider: Arc<dyn Provider>,
    pub lookups: Arc<LookupRegistry>,
    pub hooks: Arc<HookRegistry>,
    pub ctx: Arc<RunContext>,
    pub events: EventLog,
    pub cancel: CancellationToken,
}

impl<'a> RunConfig<'a> {
    /// Builtin registries with the config's lookup aliases, the process
    /// environment, and no event log.
    pub fn new(
        config: &'a StrataConfig,
        action: RunAction,
        provider: Arc<dyn Provider>,
    ) -> Result<Self, ConfigError> {
        let mut lookups = LookupRegistry::with_builtins();
        lookups.load_aliases(&config.lookups, &config.search_path)?;
        Ok(Self {
            config,
            action,
            provider,
            lookups: Arc::new(lookups),
            hooks: Arc::new(HookRegistry::with_builtins(&config.search_path)),
            ctx: Arc::new(RunContext::from_config(config)),
            events: EventLog::disabled(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_context(mut self, ctx: RunContext) -> Self {
        self.ctx = Arc::new(ctx);
        self
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn with_lookups(mut self, lookups: LookupRegistry) -> Self {
        self.lookups = Arc::new(lookups);
        self
    }
}

/// Every hook declared anywhere in the config.
pub fn all_hook_decls(config: &StrataConfig) -> impl Iterator<Item = &super::types::HookDecl> {
    config
        .pre_deploy
        .iter()
        .chain(&config.post_deploy)
        .chain(&config.pre_destroy)
        .chain(&config.post_destroy)
        .chain(config.stacks.iter().flat_map(|s| s.hooks.all()))
}

/// Execute a deploy or destroy.
pub async fn run(cfg: &RunConfig<'_>) -> Result<RunReport, StrataError> {
    let start = Instant::now();
    let config = cfg.config;
    let action = cfg.action;

    cfg.hooks.validate(all_hook_decls(config))?;
    let resolver = Resolver::new(Arc::clone(&cfg.lookups), config.settings.max_lookup_depth);
    let graph = StackGraph::build(&config.stacks, &resolver, &cfg.ctx).await?;
    let graph = match action {
        RunAction::Deploy => graph,
        RunAction::Destroy => graph.reversed(),
    };

    info!(%action, stacks = graph.len(), run_id = cfg.events.run_id(), "run started");
    cfg.events.record(ProvenanceEvent::RunStarted {
        action,
        namespace: cfg.ctx.namespace().to_string(),
        strata_version: env!("CARGO_PKG_VERSION").to_string(),
    });

    let client = ProviderClient::new(
        Arc::clone(&cfg.provider),
        PollSettings::from(&config.settings),
    );
    let engine = Arc::new(Engine {
        ctx: Arc::clone(&cfg.ctx),
        client,
        resolver: resolver.clone(),
        pipeline: HookPipeline::new(Arc::clone(&cfg.hooks), resolver),
        base_dir: config.base_dir.clone(),
        action,
        cancel: cfg.cancel.clone(),
    });

    let pre = engine.run_hooks(action.pre_phase(), config.hooks(action.pre_phase()), None).await;
    record_hook_failures(&cfg.events, &pre.reports);
    let mut hooks = pre.reports.clone();

    let results: Vec<StackReport> = match pre.failure() {
        Some(failure) => {
            warn!(hook = %failure.path, "required {} hook failed, skipping all stacks", action.pre_phase());
            graph
                .nodes()
                .iter()
                .map(|node| {
                    let report = StackReport::skipped(
                        &node.name,
                        &node.fqn,
                        action,
                        SkipReason::HookAborted(failure.path.clone()),
                    );
                    record_stack(&cfg.events, &report);
                    report
                })
                .collect()
        }
        None => {
            let concurrency = config.settings.concurrency.max(1);
            schedule(&engine, &graph, concurrency, &cfg.events).await?
        }
    };

    let cancelled = cfg.cancel.is_cancelled();
    if !cancelled && pre.failure().is_none() && results.iter().all(StackReport::is_ok) {
        let post = engine
            .run_hooks(action.post_phase(), config.hooks(action.post_phase()), None)
            .await;
        record_hook_failures(&cfg.events, &post.reports);
        hooks.extend(post.reports);
    }

    let mut stacks = Vec::with_capacity(config.stacks.len());
    let mut by_id: Vec<Option<StackReport>> = results.into_iter().map(Some).collect();
    for stack in &config.stacks {
        match graph.id_of(&stack.name) {
            Some(id) => {
                if let Some(report) = by_id[id].take() {
                    stacks.push(report);
                }
            }
            None => {
                let report = StackReport::skipped(
                    &stack.name,
                    &cfg.ctx.fqn(&stack.name),
                    action,
                    SkipReason::Disabled,
                );
                record_stack(&cfg.events, &report);
                stacks.push(report);
            }
        }
    }

    let report = RunReport {
        action,
        run_id: cfg.events.run_id().to_string(),
        stacks,
        hooks,
        cancelled,
        duration: start.elapsed(),
    };
    let (succeeded, failed, skipped) = report.counts();
    cfg.events.record(ProvenanceEvent::RunCompleted {
        succeeded,
        failed,
        skipped,
        total_seconds: report.duration.as_secs_f64(),
    });
    info!(%action, succeeded, failed, skipped, exit_code = report.exit_code(), "run finished");
    Ok(report)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
    Done,
}

/// Walk the graph. Returns one report per node, indexed by node id.
async fn schedule(
    engine: &Arc<Engine>,
    graph: &StackGraph,
    concurrency: usize,
    events: &EventLog,
) -> Result<Vec<StackReport>, StrataError> {
    let n = graph.len();
    let action = engine.action;
    let mut state = vec![NodeState::Pending; n];
    let mut remaining: Vec<usize> = (0..n).map(|id| graph.dependencies(id).count()).collect();
    let mut reports: Vec<Option<StackReport>> = vec![None; n];
    let mut ready: BTreeSet<(String, NodeId)> = (0..n)
        .filter(|&id| remaining[id] == 0)
        .map(|id| (graph.node(id).name.clone(), id))
        .collect();
    if ready.is_empty() && n > 0 {
        return Err(ConfigError::CyclicGraph {
            path: graph.find_cycle().unwrap_or_default(),
        }
        .into());
    }

    let mut workers: JoinSet<StackReport> = JoinSet::new();
    let mut tasks: HashMap<TaskId, NodeId> = HashMap::new();
    let mut running = 0usize;

    loop {
        while running < concurrency && !engine.cancel.is_cancelled() {
            let Some((_, id)) = ready.pop_first() else {
                break;
            };
            let node = graph.node(id).clone();
            state[id] = NodeState::Running;
            running += 1;
            events.record(ProvenanceEvent::StackStarted {
                stack: node.name.clone(),
                action,
            });

            let engine = Arc::clone(engine);
            let span = info_span!("stack", name = %node.name);
            let handle = workers.spawn(
                async move {
                    let outcome = AssertUnwindSafe(engine.process(&node)).catch_unwind().await;
                    outcome.unwrap_or_else(|panic| {
                        StackReport::failed(
                            &node.name,
                            &node.fqn,
                            action,
                            format!("worker panicked: {}", panic_message(panic.as_ref())),
                        )
                    })
                }
                .instrument(span),
            );
            tasks.insert(handle.id(), id);
        }

        if running == 0 {
            break;
        }
        let Some(joined) = workers.join_next_with_id().await else {
            break;
        };
        running -= 1;
        let (task, report) = match joined {
            Ok((task, report)) => (task, Some(report)),
            Err(e) => {
                error!(error = %e, "stack worker was lost");
                (e.id(), None)
            }
        };
        let Some(id) = tasks.remove(&task) else {
            continue;
        };
        let report = report.unwrap_or_else(|| {
            let node = graph.node(id);
            StackReport::failed(&node.name, &node.fqn, action, "stack worker was lost")
        });

        state[id] = NodeState::Done;
        record_stack(events, &report);
        if report.status.is_success() {
            for dependent in graph.dependents(id) {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 && state[dependent] == NodeState::Pending {
                    ready.insert((graph.node(dependent).name.clone(), dependent));
                }
            }
        } else {
            skip_dependents(graph, id, &mut state, &mut reports, action, events);
        }
        reports[id] = Some(report);
    }

    let cancelled = engine.cancel.is_cancelled();
    Ok((0..n)
        .map(|id| {
            reports[id].take().unwrap_or_else(|| {
                let node = graph.node(id);
                let report = match state[id] {
                    NodeState::Running => {
                        StackReport::failed(&node.name, &node.fqn, action, "stack worker was lost")
                    }
                    _ if cancelled => StackReport::skipped(
                        &node.name,
                        &node.fqn,
                        action,
                        SkipReason::Cancelled,
                    ),
                    _ => StackReport::failed(&node.name, &node.fqn, action, "never scheduled"),
                };
                record_stack(events, &report);
                report
            })
        })
        .collect())
}

/// Skip every pending transitive dependent of a node that did not settle.
fn skip_dependents(
    graph: &StackGraph,
    failed: NodeId,
    state: &mut [NodeState],
    reports: &mut [Option<StackReport>],
    action: RunAction,
    events: &EventLog,
) {
    let mut queue = vec![failed];
    while let Some(current) = queue.pop() {
        let blamed = graph.node(current).name.clone();
        for dependent in graph.dependents(current) {
            if state[dependent] != NodeState::Pending {
                continue;
            }
            state[dependent] = NodeState::Done;
            let node = graph.node(dependent);
            let report = StackReport::skipped(
                &node.name,
                &node.fqn,
                action,
                SkipReason::DependencyFailed(blamed.clone()),
            );
            info!(stack = %node.name, dependency = %blamed, "skipping");
            record_stack(events, &report);
            reports[dependent] = Some(report);
            queue.push(dependent);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn record_stack(events: &EventLog, report: &StackReport) {
    record_hook_failures(events, &report.hooks);
    let event = match report.status {
        StackStatus::Failed => ProvenanceEvent::StackFailed {
            stack: report.name.clone(),
            error: report.reason.clone().unwrap_or_default(),
            cancelled: report.cancelled,
        },
        StackStatus::Skipped => ProvenanceEvent::StackSkipped {
            stack: report.name.clone(),
            reason: report.skip.clone().unwrap_or(SkipReason::Cancelled),
        },
        status => ProvenanceEvent::StackFinished {
            stack: report.name.clone(),
            status,
            remote_status: report.remote_status,
            duration_seconds: report.duration.as_secs_f64(),
        },
    };
    events.record(event);
}

fn record_hook_failures(events: &EventLog, hooks: &[HookReport]) {
    for hook in hooks {
        if let crate::hooks::HookStatus::Failed(error) = &hook.status {
            events.record(ProvenanceEvent::HookFailed {
                hook: hook.path.clone(),
                phase: hook.phase,
                stack: hook.stack.clone(),
                error: error.clone(),
            });
        }
    }
}

/// Resolve a stack's variables and render its template into a request.
pub async fn prepare_request(
    node: &StackNode,
    resolver: &Resolver,
    ctx: &RunContext,
    client: &ProviderClient,
    base_dir: &Path,
) -> Result<StackRequest, StrataError> {
    let scope = LookupScope::execute(ctx)
        .for_stack(&node.name)
        .with_provider(client);
    let variables = resolver.resolve_variables(&node.stack.variables, &scope).await?;
    let template = load_template(&node.stack, base_dir)?;
    let body = render_template(&template, &variables, ctx, &node.name)?;
    Ok(StackRequest {
        name: node.fqn.clone(),
        template_body: body,
        parameters: parameters_from(&variables),
        tags: node.stack.tags.clone(),
    })
}

/// Everything a worker needs, shared across workers.
struct Engine {
    ctx: Arc<RunContext>,
    client: ProviderClient,
    resolver: Resolver,
    pipeline: HookPipeline,
    base_dir: PathBuf,
    action: RunAction,
    cancel: CancellationToken,
}

impl Engine {
    async fn run_hooks(
        &self,
        phase: LifecyclePhase,
        decls: &[super::types::HookDecl],
        stack: Option<&str>,
    ) -> PipelineResult {
        self.pipeline
            .run(phase, decls, &self.ctx, stack, Some(&self.client))
            .await
    }

    async fn process(&self, node: &StackNode) -> StackReport {
        let start = Instant::now();
        let mut report = if self.cancel.is_cancelled() {
            StackReport::skipped(&node.name, &node.fqn, self.action, SkipReason::Cancelled)
        } else {
            self.lifecycle(node).await
        };
        report.duration = start.elapsed();
        report
    }

    /// Stack hooks around the provider operation.
    async fn lifecycle(&self, node: &StackNode) -> StackReport {
        let action = self.action;
        let mut hooks = Vec::new();

        let pre_phase = action.pre_phase();
        let pre = self
            .run_hooks(pre_phase, node.stack.hooks.for_phase(pre_phase), Some(&node.name))
            .await;
        hooks.extend(pre.reports.iter().cloned());
        if let Some(failure) = pre.failure() {
            let mut report = StackReport::failed(
                &node.name,
                &node.fqn,
                action,
                format!("{} hook '{}' failed", pre_phase, failure.path),
            );
            report.hooks = hooks;
            return report;
        }
        if self.cancel.is_cancelled() {
            let mut report = self.cancelled(node);
            report.hooks = hooks;
            return report;
        }

        let mut report = match action {
            RunAction::Deploy => self.deploy(node).await,
            RunAction::Destroy => self.destroy(node).await,
        };

        if report.status.is_success() {
            let post_phase = action.post_phase();
            let post = self
                .run_hooks(post_phase, node.stack.hooks.for_phase(post_phase), Some(&node.name))
                .await;
            if let Some(failure) = post.failure() {
                report.status = StackStatus::Failed;
                report.reason = Some(format!("{} hook '{}' failed", post_phase, failure.path));
            }
            hooks.extend(post.reports);
        }
        report.hooks = hooks;
        report
    }

    async fn deploy(&self, node: &StackNode) -> StackReport {
        let request =
            match prepare_request(node, &self.resolver, &self.ctx, &self.client, &self.base_dir)
                .await
            {
                Ok(request) => request,
                Err(e) => return StackReport::failed(&node.name, &node.fqn, self.action, e.to_string()),
            };
        if self.cancel.is_cancelled() {
            return self.cancelled(node);
        }

        let result = if node.stack.locked {
            self.deploy_locked(&request).await
        } else {
            self.client.apply(&request, &self.cancel).await
        };
        let report = self.settle(node, result);
        if report.status.is_success() {
            self.ctx.record_outputs(&node.fqn, report.outputs.clone());
        }
        report
    }

    /// Locked stacks are created when missing and never updated.
    async fn deploy_locked(&self, request: &StackRequest) -> Result<StackResult, ProviderError> {
        match self.client.describe(&request.name).await? {
            None => self.client.apply(request, &self.cancel).await,
            Some(state) if state.status.is_in_progress() || state.status.is_failed() => {
                Ok(StackResult {
                    status: StackStatus::Failed,
                    remote_status: Some(state.status),
                    reason: Some(format!("locked stack is in {}", state.status)),
                    outputs: state.outputs,
                })
            }
            Some(state) => Ok(StackResult {
                status: StackStatus::NoChange,
                remote_status: Some(state.status),
                reason: Some("locked".to_string()),
                outputs: state.outputs,
            }),
        }
    }

    async fn destroy(&self, node: &StackNode) -> StackReport {
        let result = self.client.destroy(&node.fqn, &self.cancel).await;
        let report = self.settle(node, result);
        if report.status == StackStatus::Destroyed {
            self.ctx.forget_outputs(&node.fqn);
        }
        report
    }

    fn settle(&self, node: &StackNode, result: Result<StackResult, ProviderError>) -> StackReport {
        match result {
            Ok(result) => {
                let mut report =
                    StackReport::new(&node.name, &node.fqn, self.action, result.status);
                report.remote_status = result.remote_status;
                report.reason = result.reason;
                report.outputs = result.outputs;
                report
            }
            Err(ProviderError::Cancelled(_)) => self.cancelled(node),
            Err(e) => StackReport::failed(&node.name, &node.fqn, self.action, e.to_string()),
        }
    }

    fn cancelled(&self, node: &StackNode) -> StackReport {
        let mut report = StackReport::failed(&node.name, &node.fqn, self.action, "cancelled");
        report.cancelled = true;
        report
    }
}
