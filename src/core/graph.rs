//! ST-041: Stack dependency graph.
//!
//! Nodes are enabled stacks in declaration order, edges point from a
//! dependency to its dependents. Edges come from explicit `requires` /
//! `required_by` declarations and from a discovery pass over stack variables
//! that records every `output` lookup. Cycles are reported with their full
//! path. Topological order uses Kahn's algorithm with deterministic
//! (alphabetical) tie-breaking.

use super::context::RunContext;
use super::types::StackDef;
use crate::error::ConfigError;
use crate::lookups::{LookupScope, Resolver};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub type NodeId = usize;

/// Where an edge came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Explicit,
    Discovered,
}

#[derive(Debug, Clone)]
pub struct StackNode {
    pub id: NodeId,
    pub name: String,
    pub fqn: String,
    pub stack: Arc<StackDef>,
}

#[derive(Debug, Clone)]
pub struct StackGraph {
    nodes: Vec<StackNode>,
    index: HashMap<String, NodeId>,
    dependencies: Vec<BTreeSet<NodeId>>,
    dependents: Vec<BTreeSet<NodeId>>,
    kinds: HashMap<(NodeId, NodeId), EdgeKind>,
    disabled: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl StackGraph {
    /// Graph from explicit declarations only.
    pub fn from_explicit(stacks: &[StackDef], ctx: &RunContext) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for stack in stacks {
            if !seen.insert(stack.name.as_str()) {
                return Err(ConfigError::DuplicateStack(stack.name.clone()));
            }
        }

        let mut graph = StackGraph {
            nodes: Vec::new(),
            index: HashMap::new(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
            kinds: HashMap::new(),
            disabled: Vec::new(),
        };
        for stack in stacks {
            if !stack.enabled {
                graph.disabled.push(stack.name.clone());
                continue;
            }
            let id = graph.nodes.len();
            graph.nodes.push(StackNode {
                id,
                name: stack.name.clone(),
                fqn: ctx.fqn(&stack.name),
                stack: Arc::new(stack.clone()),
            });
            graph.index.insert(stack.name.clone(), id);
            graph.dependencies.push(BTreeSet::new());
            graph.dependents.push(BTreeSet::new());
        }

        for stack in stacks.iter().filter(|s| s.enabled) {
            let id = graph.index[&stack.name];
            for dep in &stack.requires {
                let dep_id = graph.resolve_reference(&stack.name, dep)?;
                graph.add_edge(dep_id, id, EdgeKind::Explicit);
            }
            for dependent in &stack.required_by {
                let dependent_id = graph.resolve_reference(&stack.name, dependent)?;
                graph.add_edge(id, dependent_id, EdgeKind::Explicit);
            }
        }
        Ok(graph)
    }

    /// Full graph: explicit edges plus those discovered from lookups, checked
    /// for cycles.
    pub async fn build(
        stacks: &[StackDef],
        resolver: &Resolver,
        ctx: &RunContext,
    ) -> Result<Self, ConfigError> {
        let mut graph = Self::from_explicit(stacks, ctx)?;

        for id in 0..graph.nodes.len() {
            let stack = Arc::clone(&graph.nodes[id].stack);
            let scope = LookupScope::discovery(ctx, &stack.name);
            let lookup_err = |source| ConfigError::Lookup {
                stack: stack.name.clone(),
                source,
            };

            let mut references = resolver
                .discover(&stack.variables, &scope)
                .await
                .map_err(lookup_err)?;
            for hook in &stack.hooks.pre_deploy {
                references.extend(
                    resolver
                        .discover(&hook.args, &scope)
                        .await
                        .map_err(lookup_err)?,
                );
            }
            // Hooks that run once the stack exists may read its own outputs.
            let later = stack
                .hooks
                .post_deploy
                .iter()
                .chain(&stack.hooks.pre_destroy)
                .chain(&stack.hooks.post_destroy);
            for hook in later {
                let found = resolver
                    .discover(&hook.args, &scope)
                    .await
                    .map_err(lookup_err)?;
                references.extend(found.into_iter().filter(|r| *r != stack.name));
            }

            for reference in references {
                if reference == stack.name {
                    return Err(ConfigError::CyclicGraph {
                        path: vec![stack.name.clone(), stack.name.clone()],
                    });
                }
                let dep_id = graph.resolve_reference(&stack.name, &reference)?;
                if !graph.dependencies[id].contains(&dep_id) {
                    debug!(stack = %stack.name, dependency = %reference, "discovered dependency");
                    graph.add_edge(dep_id, id, EdgeKind::Discovered);
                }
            }
        }

        graph.ensure_acyclic()?;
        Ok(graph)
    }

    fn resolve_reference(&self, from: &str, reference: &str) -> Result<NodeId, ConfigError> {
        if let Some(&id) = self.index.get(reference) {
            return Ok(id);
        }
        if self.disabled.iter().any(|d| d == reference) {
            return Err(ConfigError::DisabledStack {
                stack: from.to_string(),
                reference: reference.to_string(),
            });
        }
        Err(ConfigError::UnknownStack {
            stack: from.to_string(),
            reference: reference.to_string(),
        })
    }

    /// `dependency` must settle before `dependent` starts.
    pub fn add_edge(&mut self, dependency: NodeId, dependent: NodeId, kind: EdgeKind) {
        self.dependencies[dependent].insert(dependency);
        self.dependents[dependency].insert(dependent);
        self.kinds.entry((dependency, dependent)).or_insert(kind);
    }

    pub fn ensure_acyclic(&self) -> Result<(), ConfigError> {
        match self.find_cycle() {
            Some(path) => Err(ConfigError::CyclicGraph { path }),
            None => Ok(()),
        }
    }

    /// A cycle as stack names, first name repeated at the end. Follows
    /// dependency edges, so `a -> b` reads "a requires b".
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut color = vec![Color::White; self.nodes.len()];
        for root in 0..self.nodes.len() {
            if color[root] != Color::White {
                continue;
            }
            color[root] = Color::Gray;
            let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];

            while let Some(&(node, next_idx)) = stack.last() {
                match self.dependencies[node].iter().nth(next_idx).copied() {
                    Some(next) => {
                        if let Some(top) = stack.last_mut() {
                            top.1 += 1;
                        }
                        match color[next] {
                            Color::White => {
                                color[next] = Color::Gray;
                                stack.push((next, 0));
                            }
                            Color::Gray => {
                                let pos = stack.iter().position(|&(n, _)| n == next)?;
                                let mut path: Vec<String> = stack[pos..]
                                    .iter()
                                    .map(|&(n, _)| self.nodes[n].name.clone())
                                    .collect();
                                path.push(self.nodes[next].name.clone());
                                return Some(path);
                            }
                            Color::Black => {}
                        }
                    }
                    None => {
                        color[node] = Color::Black;
                        stack.pop();
                    }
                }
            }
        }
        None
    }

    /// Kahn's algorithm with alphabetical tie-breaking for determinism.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, ConfigError> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<(&str, NodeId)> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(id, _)| (self.nodes[id].name.as_str(), id))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(entry) = ready.pop_first() {
            let (_, current) = entry;
            order.push(current);
            for &next in &self.dependents[current] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert((self.nodes[next].name.as_str(), next));
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(ConfigError::CyclicGraph {
                path: self.find_cycle().unwrap_or_default(),
            });
        }
        Ok(order)
    }

    /// Same nodes with every edge flipped, for destroy.
    pub fn reversed(&self) -> Self {
        StackGraph {
            nodes: self.nodes.clone(),
            index: self.index.clone(),
            dependencies: self.dependents.clone(),
            dependents: self.dependencies.clone(),
            kinds: self.kinds.iter().map(|(&(a, b), &k)| ((b, a), k)).collect(),
            disabled: self.disabled.clone(),
        }
    }

    pub fn nodes(&self) -> &[StackNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &StackNode {
        &self.nodes[id]
    }

    pub fn id_of(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    pub fn dependencies(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.dependencies[id].iter().copied()
    }

    pub fn dependents(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.dependents[id].iter().copied()
    }

    pub fn edge_kind(&self, dependency: NodeId, dependent: NodeId) -> Option<EdgeKind> {
        self.kinds.get(&(dependency, dependent)).copied()
    }

    /// `(dependency, dependent, kind)` by name, sorted.
    pub fn edges(&self) -> Vec<(&str, &str, EdgeKind)> {
        let mut edges: Vec<_> = self
            .kinds
            .iter()
            .map(|(&(a, b), &k)| (self.nodes[a].name.as_str(), self.nodes[b].name.as_str(), k))
            .collect();
        edges.sort_by(|x, y| (x.0, x.1).cmp(&(y.0, y.1)));
        edges
    }

    /// Declared but disabled stacks, excluded from the graph.
    pub fn disabled(&self) -> &[String] {
        &self.disabled
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookups::LookupRegistry;
    use proptest::prelude::*;
    use serde_json::json;

    fn stack(name: &str, requires: &[&str]) -> StackDef {
        let mut s = StackDef::new(name, "");
        s.requires = requires.iter().map(|r| r.to_string()).collect();
        s
    }

    fn names(graph: &StackGraph, order: &[NodeId]) -> Vec<String> {
        order.iter().map(|&id| graph.node(id).name.clone()).collect()
    }

    fn resolver() -> Resolver {
        Resolver::new(Arc::new(LookupRegistry::with_builtins()), 10)
    }

    #[test]
    fn test_st041_chain_order() {
        let stacks = vec![stack("c", &["b"]), stack("b", &["a"]), stack("a", &[])];
        let ctx = RunContext::default();
        let g = StackGraph::from_explicit(&stacks, &ctx).unwrap();
        let order = g.topological_order().unwrap();
        assert_eq!(names(&g, &order), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_st041_alphabetical_tie_break() {
        let stacks = vec![stack("zeta", &[]), stack("alpha", &[]), stack("mid", &["zeta"])];
        let ctx = RunContext::default();
        let g = StackGraph::from_explicit(&stacks, &ctx).unwrap();
        let order = g.topological_order().unwrap();
        assert_eq!(names(&g, &order), vec!["alpha", "zeta", "mid"]);
    }

    #[test]
    fn test_st041_required_by() {
        let mut a = stack("a", &[]);
        a.required_by = vec!["b".into()];
        let stacks = vec![stack("b", &[]), a];
        let ctx = RunContext::default();
        let g = StackGraph::from_explicit(&stacks, &ctx).unwrap();
        let a_id = g.id_of("a").unwrap();
        let b_id = g.id_of("b").unwrap();
        assert_eq!(g.dependencies(b_id).collect::<Vec<_>>(), vec![a_id]);
        assert_eq!(g.edge_kind(a_id, b_id), Some(EdgeKind::Explicit));
    }

    #[test]
    fn test_st041_duplicate_unknown_disabled() {
        let ctx = RunContext::default();
        let err = StackGraph::from_explicit(&[stack("a", &[]), stack("a", &[])], &ctx).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateStack(n) if n == "a"));

        let err = StackGraph::from_explicit(&[stack("a", &["ghost"])], &ctx).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownStack { reference, .. } if reference == "ghost"));

        let mut off = stack("off", &[]);
        off.enabled = false;
        let err = StackGraph::from_explicit(&[off.clone(), stack("a", &["off"])], &ctx).unwrap_err();
        assert!(matches!(err, ConfigError::DisabledStack { .. }));

        let g = StackGraph::from_explicit(&[off, stack("a", &[])], &ctx).unwrap();
        assert_eq!(g.len(), 1);
        assert_eq!(g.disabled(), &["off".to_string()]);
    }

    #[test]
    fn test_st041_cycle_path_reported() {
        let stacks = vec![stack("a", &["b"]), stack("b", &["c"]), stack("c", &["a"])];
        let ctx = RunContext::default();
        let g = StackGraph::from_explicit(&stacks, &ctx).unwrap();
        let path = g.find_cycle().unwrap();
        assert_eq!(path, vec!["a", "b", "c", "a"]);
        let err = g.ensure_acyclic().unwrap_err();
        assert_eq!(
            err.to_string(),
            "dependency cycle detected: a -> b -> c -> a"
        );
        assert!(g.topological_order().is_err());
    }

    #[tokio::test]
    async fn test_st041_discovered_edges() {
        let mut app = stack("app", &[]);
        app.variables
            .insert("Vpc".into(), json!("${output vpc.VpcId}"));
        app.variables
            .insert("Mixed".into(), json!("db=${output db.Endpoint}"));
        let stacks = vec![app, stack("vpc", &[]), stack("db", &["vpc"])];
        let ctx = RunContext::new("ns", "dev", "");
        let g = StackGraph::build(&stacks, &resolver(), &ctx).await.unwrap();
        let app_id = g.id_of("app").unwrap();
        let vpc_id = g.id_of("vpc").unwrap();
        assert_eq!(g.edge_kind(vpc_id, app_id), Some(EdgeKind::Discovered));
        let order = g.topological_order().unwrap();
        assert_eq!(names(&g, &order), vec!["vpc", "db", "app"]);
        assert_eq!(g.node(app_id).fqn, "ns-app");
    }

    #[tokio::test]
    async fn test_st041_discovered_cycle() {
        let mut a = stack("a", &["b"]);
        a.variables.insert("X".into(), json!("${output b.Out}"));
        let mut b = stack("b", &[]);
        b.variables.insert("Y".into(), json!("${output a.Out}"));
        let ctx = RunContext::default();
        let err = StackGraph::build(&[a, b], &resolver(), &ctx).await.unwrap_err();
        assert!(matches!(err, ConfigError::CyclicGraph { .. }));
    }

    #[tokio::test]
    async fn test_st041_self_reference() {
        let mut a = stack("a", &[]);
        a.variables.insert("X".into(), json!("${output a.Out}"));
        let ctx = RunContext::default();
        let err = StackGraph::build(&[a], &resolver(), &ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "dependency cycle detected: a -> a");
    }

    #[tokio::test]
    async fn test_st041_discovered_unknown_stack() {
        let mut a = stack("a", &[]);
        a.variables.insert("X".into(), json!("${output ghost.Out}"));
        let ctx = RunContext::default();
        let err = StackGraph::build(&[a], &resolver(), &ctx).await.unwrap_err();
        assert!(matches!(err, ConfigError::UnknownStack { .. }));
    }

    #[tokio::test]
    async fn test_st041_discovery_in_hook_args() {
        let mut a = stack("a", &[]);
        let mut hook = crate::core::types::HookDecl::new("command");
        hook.args.insert("command".into(), json!("echo ${output b.Url}"));
        a.hooks.post_deploy.push(hook);
        let ctx = RunContext::default();
        let g = StackGraph::build(&[a, stack("b", &[])], &resolver(), &ctx)
            .await
            .unwrap();
        let (a_id, b_id) = (g.id_of("a").unwrap(), g.id_of("b").unwrap());
        assert_eq!(g.edge_kind(b_id, a_id), Some(EdgeKind::Discovered));
    }

    #[tokio::test]
    async fn test_st041_post_hook_reads_own_outputs() {
        let mut a = stack("a", &[]);
        let mut hook = crate::core::types::HookDecl::new("command");
        hook.args.insert("command".into(), json!("echo ${output a.Url}"));
        a.hooks.post_deploy.push(hook.clone());
        a.hooks.pre_destroy.push(hook.clone());
        let ctx = RunContext::default();
        let g = StackGraph::build(&[a.clone()], &resolver(), &ctx).await.unwrap();
        assert_eq!(g.len(), 1);
        assert_eq!(g.dependencies(0).count(), 0);

        a.hooks.pre_deploy.push(hook);
        let err = StackGraph::build(&[a], &resolver(), &ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "dependency cycle detected: a -> a");
    }

    #[test]
    fn test_st041_reversed() {
        let stacks = vec![stack("a", &[]), stack("b", &["a"]), stack("c", &["b"])];
        let ctx = RunContext::default();
        let g = StackGraph::from_explicit(&stacks, &ctx).unwrap().reversed();
        let order = g.topological_order().unwrap();
        assert_eq!(names(&g, &order), vec!["c", "b", "a"]);
    }

    proptest! {
        /// Random DAGs: every edge is respected by the order.
        #[test]
        fn test_st041_topo_respects_edges(
            n in 1usize..12,
            raw_edges in proptest::collection::vec((0usize..12, 0usize..12), 0..40),
        ) {
            let mut stacks: Vec<StackDef> = (0..n).map(|i| stack(&format!("s{i:02}"), &[])).collect();
            for (x, y) in raw_edges {
                let (x, y) = (x % n, y % n);
                if x < y {
                    let dep = format!("s{x:02}");
                    if !stacks[y].requires.contains(&dep) {
                        stacks[y].requires.push(dep);
                    }
                }
            }
            let ctx = RunContext::default();
            let g = StackGraph::from_explicit(&stacks, &ctx).unwrap();
            prop_assert!(g.find_cycle().is_none());
            let order = g.topological_order().unwrap();
            prop_assert_eq!(order.len(), n);
            let pos: HashMap<NodeId, usize> = order.iter().enumerate().map(|(i, &id)| (id, i)).collect();
            for id in 0..g.len() {
                for dep in g.dependencies(id) {
                    prop_assert!(pos[&dep] < pos[&id]);
                }
            }
        }

        /// Closing any chain into a loop is always detected.
        #[test]
        fn test_st041_cycle_always_detected(n in 2usize..10) {
            let mut stacks: Vec<StackDef> = (0..n)
                .map(|i| stack(&format!("s{i}"), &[]))
                .collect();
            for i in 1..n {
                let dep = format!("s{}", i - 1);
                stacks[i].requires.push(dep);
            }
            let last = format!("s{}", n - 1);
            stacks[0].requires.push(last);
            let ctx = RunContext::default();
            let g = StackGraph::from_explicit(&stacks, &ctx).unwrap();
            let path = g.find_cycle().unwrap();
            prop_assert_eq!(path.len(), n + 1);
            prop_assert_eq!(path.first(), path.last());
        }
    }
}
