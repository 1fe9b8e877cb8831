//! Lowers a node/edge dependency graph into a step sequence.
//!
//! Unconditional edges fix the order of the nodes. Conditional edges become
//! guard steps that jump to an anchor placed in front of their target, which
//! lets a graph express both optional skips and guarded cycles.

use crate::step::Step;
use crate::workflow::{Workflow, WorkflowBuilder};
use async_trait::async_trait;
use hataori_core::{
    Action, ActionRef, AnchorName, Context, GraphError, Params, StepConfig, StepName, StepOutput,
    WorkflowError,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

const ANCHOR_PREFIX: &str = "graph:";

struct Node {
    name: StepName,
    action: ActionRef,
    config: StepConfig,
}

struct Edge {
    from: StepName,
    to: StepName,
    condition: Option<ActionRef<bool>>,
}

/// Declarative workflow description compiled by [`Graph::compile`].
///
/// # Examples
///
/// ```
/// use hataori::prelude::*;
///
/// # tokio_test::block_on(async {
/// let mark = |name: &'static str| {
///     action_fn(move |ctx, _| {
///         ctx.insert(name, true);
///         Ok(StepOutput::Next)
///     })
/// };
///
/// let workflow = Graph::new()
///     .add_node("A", mark("A"))
///     .add_node("B", mark("B"))
///     .add_node("C", mark("C"))
///     .add_edge("A", "B")
///     .add_edge("B", "C")
///     .add_conditional_edge("A", "C", action_fn(|ctx, _| {
///         Ok(ctx.get_as::<bool>("skip").unwrap_or(false))
///     }))
///     .compile()
///     .expect("acyclic graph");
///
/// let mut ctx = Context::new();
/// ctx.insert("skip", true);
/// workflow.run(&mut ctx, &Params::new()).await?;
/// assert!(!ctx.contains_key("B"));
/// # Ok::<(), WorkflowError>(())
/// # }).expect("example runs");
/// ```
#[derive(Default)]
pub struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

impl Graph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node with the default step config.
    pub fn add_node<A: Action + 'static>(self, name: impl Into<StepName>, action: A) -> Self {
        self.add_node_with(name, action, StepConfig::default())
    }

    /// Adds a node with a custom step config.
    pub fn add_node_with<A: Action + 'static>(
        mut self,
        name: impl Into<StepName>,
        action: A,
        config: StepConfig,
    ) -> Self {
        self.nodes.push(Node {
            name: name.into(),
            action: Arc::new(action),
            config,
        });
        self
    }

    /// Requires `from` to run before `to`.
    pub fn add_edge(mut self, from: impl Into<StepName>, to: impl Into<StepName>) -> Self {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            condition: None,
        });
        self
    }

    /// Jumps from `from` to `to` when `condition` holds after `from` ran.
    pub fn add_conditional_edge<C>(
        mut self,
        from: impl Into<StepName>,
        to: impl Into<StepName>,
        condition: C,
    ) -> Self
    where
        C: Action<bool> + 'static,
    {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            condition: Some(Arc::new(condition)),
        });
        self
    }

    /// Compiles the graph into a workflow.
    ///
    /// Fails if node names repeat, an edge names an unknown node, or the
    /// unconditional edges contain a cycle.
    pub fn compile(self) -> Result<Workflow, GraphError> {
        let mut positions: HashMap<StepName, usize> = HashMap::with_capacity(self.nodes.len());
        for (index, node) in self.nodes.iter().enumerate() {
            if positions.insert(node.name.clone(), index).is_some() {
                return Err(GraphError::DuplicateNode(node.name.clone()));
            }
        }

        let mut required = Vec::new();
        let mut guarded = Vec::new();
        for edge in &self.edges {
            let from = lookup(&positions, edge, &edge.from)?;
            let to = lookup(&positions, edge, &edge.to)?;
            match &edge.condition {
                None => required.push((from, to)),
                Some(condition) => guarded.push((from, to, Arc::clone(condition))),
            }
        }

        let order = self.topological_order(&required)?;
        let mut rank = vec![0; self.nodes.len()];
        for (position, &node) in order.iter().enumerate() {
            rank[node] = position;
        }

        let mut skips: Vec<Vec<(usize, ActionRef<bool>)>> = vec![Vec::new(); self.nodes.len()];
        let mut back_edges: Vec<Vec<(usize, ActionRef<bool>)>> =
            vec![Vec::new(); self.nodes.len()];
        let mut targets = HashSet::new();
        for (from, to, condition) in guarded {
            targets.insert(to);
            if rank[to] <= rank[from] {
                back_edges[from].push((to, condition));
            } else {
                skips[from].push((to, condition));
            }
        }

        let mut nodes: Vec<Option<Node>> = self.nodes.into_iter().map(Some).collect();
        let names: Vec<StepName> = nodes
            .iter()
            .flatten()
            .map(|node| node.name.clone())
            .collect();

        let mut builder = WorkflowBuilder::new();
        for &index in &order {
            let Some(node) = nodes[index].take() else {
                continue;
            };
            if targets.contains(&index) {
                builder = builder.anchor(anchor_for(&node.name));
            }
            builder = builder.step(Step::Function {
                name: Some(node.name.clone()),
                action: node.action,
                config: node.config,
            });

            let guards = skips[index].drain(..).chain(back_edges[index].drain(..));
            for (target, condition) in guards {
                let target_name = &names[target];
                builder = builder.step(Step::Function {
                    name: Some(StepName::new(format!("{}->{}", node.name, target_name))),
                    action: Arc::new(Guard {
                        condition,
                        target: anchor_for(target_name),
                    }),
                    config: StepConfig::default(),
                });
            }
        }

        let workflow = builder.finish();
        debug!(
            nodes = order.len(),
            steps = workflow.len(),
            "Graph compiled"
        );
        Ok(workflow)
    }

    /// In-degree sort over unconditional edges, ties broken by insertion order.
    fn topological_order(&self, edges: &[(usize, usize)]) -> Result<Vec<usize>, GraphError> {
        let mut in_degree = vec![0usize; self.nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for &(from, to) in edges {
            in_degree[to] += 1;
            dependents[from].push(to);
        }

        let mut queue: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&node| in_degree[node] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &dependent in &dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() == self.nodes.len() {
            return Ok(order);
        }

        let nodes = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree > 0)
            .map(|(node, _)| self.nodes[node].name.clone())
            .collect();
        Err(GraphError::Cycle { nodes })
    }
}

fn lookup(
    positions: &HashMap<StepName, usize>,
    edge: &Edge,
    endpoint: &StepName,
) -> Result<usize, GraphError> {
    positions
        .get(endpoint)
        .copied()
        .ok_or_else(|| GraphError::UnknownNode {
            from: edge.from.clone(),
            to: edge.to.clone(),
            missing: endpoint.clone(),
        })
}

fn anchor_for(node: &StepName) -> AnchorName {
    AnchorName::new(format!("{ANCHOR_PREFIX}{node}"))
}

/// Jumps to `target` when `condition` holds.
struct Guard {
    condition: ActionRef<bool>,
    target: AnchorName,
}

#[async_trait]
impl Action for Guard {
    async fn call(&self, ctx: &mut Context, params: &Params) -> Result<StepOutput, WorkflowError> {
        if self.condition.as_ref().call(ctx, params).await? {
            Ok(StepOutput::Jump(self.target.clone()))
        } else {
            Ok(StepOutput::Next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hataori_core::{action_fn, StepKind};

    fn record(tag: &'static str) -> impl Action {
        action_fn(move |ctx, _| {
            let mut visited = ctx.get_as::<Vec<String>>("visited").unwrap_or_default();
            visited.push(tag.to_string());
            ctx.insert("visited", visited);
            Ok(StepOutput::Next)
        })
    }

    fn flag(key: &'static str) -> impl Action<bool> {
        action_fn(move |ctx, _| Ok(ctx.get_as::<bool>(key).unwrap_or(false)))
    }

    async fn visited_with(workflow: &Workflow, ctx: &mut Context) -> Vec<String> {
        workflow
            .run(ctx, &Params::new())
            .await
            .expect("workflow runs");
        ctx.get_as("visited").unwrap_or_default()
    }

    fn skip_graph() -> Workflow {
        Graph::new()
            .add_node("A", record("A"))
            .add_node("B", record("B"))
            .add_node("C", record("C"))
            .add_edge("A", "B")
            .add_edge("B", "C")
            .add_conditional_edge("A", "C", flag("skip"))
            .compile()
            .expect("acyclic graph")
    }

    #[tokio::test]
    async fn test_forward_skip_taken() {
        let workflow = skip_graph();
        let mut ctx = Context::new();
        ctx.insert("skip", true);
        assert_eq!(visited_with(&workflow, &mut ctx).await, vec!["A", "C"]);
    }

    #[tokio::test]
    async fn test_forward_skip_not_taken() {
        let workflow = skip_graph();
        let mut ctx = Context::new();
        assert_eq!(visited_with(&workflow, &mut ctx).await, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_compiled_layout() {
        let workflow = skip_graph();
        let layout: Vec<(StepKind, Option<String>)> = workflow
            .steps()
            .map(|step| (step.kind, step.name.map(|n| n.to_string())))
            .collect();
        assert_eq!(
            layout,
            vec![
                (StepKind::Function, Some("A".to_string())),
                (StepKind::Function, Some("A->C".to_string())),
                (StepKind::Function, Some("B".to_string())),
                (StepKind::Anchor, Some("graph:C".to_string())),
                (StepKind::Function, Some("C".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_back_edge_repeats_until_condition_fails() {
        let workflow = Graph::new()
            .add_node(
                "count",
                action_fn(|ctx, _| {
                    let n = ctx.get_as::<i64>("n").unwrap_or(0) + 1;
                    ctx.insert("n", n);
                    ctx.insert("again", n < 3);
                    Ok(StepOutput::Next)
                }),
            )
            .add_node("done", record("done"))
            .add_edge("count", "done")
            .add_conditional_edge("done", "count", flag("again"))
            .compile()
            .expect("guarded cycle compiles");

        let mut ctx = Context::new();
        let visited = visited_with(&workflow, &mut ctx).await;
        assert_eq!(ctx.get_as::<i64>("n"), Some(3));
        assert_eq!(visited, vec!["done", "done", "done"]);
    }

    #[test]
    fn test_unconditional_cycle_is_rejected() {
        let result = Graph::new()
            .add_node("A", record("A"))
            .add_node("B", record("B"))
            .add_edge("A", "B")
            .add_edge("B", "A")
            .compile();

        let error = result.err().expect("cycle is rejected");
        assert_eq!(
            error,
            GraphError::Cycle {
                nodes: vec![StepName::new("A"), StepName::new("B")]
            }
        );
        assert!(error.to_string().contains("A, B"));
    }

    #[test]
    fn test_duplicate_and_unknown_nodes() {
        let duplicate = Graph::new()
            .add_node("A", record("A"))
            .add_node("A", record("A"))
            .compile();
        assert!(matches!(duplicate, Err(GraphError::DuplicateNode(name)) if name.as_str() == "A"));

        let unknown = Graph::new()
            .add_node("A", record("A"))
            .add_edge("A", "Z")
            .compile();
        assert!(matches!(
            unknown,
            Err(GraphError::UnknownNode { missing, .. }) if missing.as_str() == "Z"
        ));
    }

    #[test]
    fn test_insertion_order_breaks_ties() {
        let workflow = Graph::new()
            .add_node("second", record("second"))
            .add_node("first", record("first"))
            .add_node("last", record("last"))
            .add_edge("first", "last")
            .compile()
            .expect("acyclic graph");
        let names: Vec<String> = workflow
            .steps()
            .filter_map(|step| step.name.map(|n| n.to_string()))
            .collect();
        assert_eq!(names, vec!["second", "first", "last"]);
    }
}
