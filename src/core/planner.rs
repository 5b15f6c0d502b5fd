//! ST-061: Plan generation: diff declared stacks against remote state.
//!
//! Read-only. Variables are resolved against live outputs, so a stack whose
//! inputs come from a dependency that does not exist yet plans as UNRESOLVED.

use super::executor::{prepare_request, RunConfig};
use super::graph::{StackGraph, StackNode};
use super::types::{ExecutionPlan, PlanAction, PlannedChange, RunAction};
use crate::error::StrataError;
use crate::lookups::Resolver;
use crate::provider::{ChangeKind, PollSettings, ProviderClient};
use std::fmt;
use std::sync::Arc;

/// Generate an execution plan for a deploy or destroy.
pub async fn plan(cfg: &RunConfig<'_>) -> Result<ExecutionPlan, StrataError> {
    let config = cfg.config;
    let resolver = Resolver::new(Arc::clone(&cfg.lookups), config.settings.max_lookup_depth);
    let graph = StackGraph::build(&config.stacks, &resolver, &cfg.ctx).await?;
    let graph = match cfg.action {
        RunAction::Deploy => graph,
        RunAction::Destroy => graph.reversed(),
    };
    let client = ProviderClient::new(
        Arc::clone(&cfg.provider),
        PollSettings::from(&config.settings),
    );

    let mut changes = Vec::with_capacity(graph.len());
    let mut to_create = 0u32;
    let mut to_update = 0u32;
    let mut to_destroy = 0u32;
    let mut unchanged = 0u32;
    let mut unresolved = 0u32;

    for id in graph.topological_order()? {
        let node = graph.node(id);
        let (action, description) = match cfg.action {
            RunAction::Deploy => plan_deploy(node, &resolver, cfg, &client).await,
            RunAction::Destroy => plan_destroy(node, &client).await,
        };

        match action {
            PlanAction::Create => to_create += 1,
            PlanAction::Update => to_update += 1,
            PlanAction::Destroy => to_destroy += 1,
            PlanAction::NoOp | PlanAction::Locked => unchanged += 1,
            PlanAction::Unresolved(_) => unresolved += 1,
        }

        changes.push(PlannedChange {
            stack: node.name.clone(),
            fqn: node.fqn.clone(),
            action,
            description,
        });
    }

    Ok(ExecutionPlan {
        action: cfg.action,
        changes,
        to_create,
        to_update,
        to_destroy,
        unchanged,
        unresolved,
    })
}

async fn plan_deploy(
    node: &StackNode,
    resolver: &Resolver,
    cfg: &RunConfig<'_>,
    client: &ProviderClient,
) -> (PlanAction, String) {
    if node.stack.locked {
        return match client.describe(&node.fqn).await {
            Ok(Some(state)) => (PlanAction::Locked, format!("locked ({})", state.status)),
            Ok(None) => (PlanAction::Create, "create locked stack".to_string()),
            Err(e) => unresolved(e.into()),
        };
    }

    let request =
        match prepare_request(node, resolver, &cfg.ctx, client, &cfg.config.base_dir).await {
            Ok(request) => request,
            Err(e) => return unresolved(e),
        };
    match client.plan(&request).await {
        Ok(diff) => {
            let action = match diff.action {
                ChangeKind::Create => PlanAction::Create,
                ChangeKind::Update | ChangeKind::Recreate => PlanAction::Update,
                ChangeKind::NoChange => PlanAction::NoOp,
            };
            let mut description = diff.summary();
            for change in diff.parameters.iter().chain(&diff.tags) {
                description.push_str(&format!("\n      {}", change));
            }
            (action, description)
        }
        Err(e) => unresolved(e.into()),
    }
}

async fn plan_destroy(node: &StackNode, client: &ProviderClient) -> (PlanAction, String) {
    match client.describe(&node.fqn).await {
        Ok(Some(state)) => (PlanAction::Destroy, format!("delete ({})", state.status)),
        Ok(None) => (PlanAction::NoOp, "does not exist".to_string()),
        Err(e) => unresolved(e.into()),
    }
}

fn unresolved(error: StrataError) -> (PlanAction, String) {
    let reason = error.to_string();
    (PlanAction::Unresolved(reason.clone()), reason)
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Planning {} ({} stacks)", self.action, self.changes.len())?;
        for change in &self.changes {
            writeln!(
                f,
                "  {:<11} {:<32} {}",
                change.action.to_string(),
                change.fqn,
                change.description
            )?;
        }
        write!(
            f,
            "Plan: {} to create, {} to update, {} to destroy, {} unchanged",
            self.to_create, self.to_update, self.to_destroy, self.unchanged
        )?;
        if self.unresolved > 0 {
            write!(f, ", {} unresolved", self.unresolved)?;
        }
        Ok(())
    }
}
