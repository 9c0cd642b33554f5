//! Desired resource graph and dependency ordering

use crate::error::{Error, Result};
use crate::reference;
use crate::types::ResourceType;
use petgraph::Direction;
use petgraph::algo;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

/// One resource as declared by the current run
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub id: String,
    pub resource_type: ResourceType,
    /// Desired props, possibly containing instance references
    pub props: Value,
    /// Per-invocation timeout overriding definition and run defaults
    pub timeout: Option<Duration>,
}

impl Declaration {
    pub fn new(id: impl Into<String>, resource_type: &str, props: Value) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            resource_type: ResourceType::new(resource_type)?,
            props,
            timeout: None,
        })
    }

    /// Limit every invocation for this resource
    ///
    /// The timeout is recorded with the instance, so a later delete of a
    /// resource that is no longer declared still honours it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Ids referenced from the props
    pub fn dependencies(&self) -> Vec<String> {
        reference::collect_targets(&self.props)
    }
}

/// Resources declared by the current run, in declaration order
#[derive(Debug, Clone, Default)]
pub struct DesiredGraph {
    resources: Vec<Declaration>,
}

impl DesiredGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a declaration; ids must be unique
    pub fn add(&mut self, declaration: Declaration) -> Result<()> {
        if self.get(&declaration.id).is_some() {
            return Err(Error::DuplicateId {
                id: declaration.id,
                within: "desired graph".to_string(),
            });
        }
        self.resources.push(declaration);
        Ok(())
    }

    /// Builder-style [`add`](Self::add)
    pub fn with(mut self, declaration: Declaration) -> Result<Self> {
        self.add(declaration)?;
        Ok(self)
    }

    pub fn get(&self, id: &str) -> Option<&Declaration> {
        self.resources.iter().find(|d| d.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn resources(&self) -> &[Declaration] {
        &self.resources
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Dependency graph over the declarations
    ///
    /// Fails with [`Error::UnknownReference`] if a reference targets an id
    /// that is not declared.
    pub fn dependency_graph(&self) -> Result<DependencyGraph> {
        let mut graph = DependencyGraph::new();
        for decl in &self.resources {
            graph.add_node(&decl.id);
        }
        for decl in &self.resources {
            for target in decl.dependencies() {
                if !self.contains(&target) {
                    return Err(Error::UnknownReference {
                        id: decl.id.clone(),
                        target,
                    });
                }
                graph.add_edge(&decl.id, &target);
            }
        }
        Ok(graph)
    }
}

/// Directed graph where an edge `a -> b` means `a` depends on `b`
///
/// Node order is insertion order and is used to break ties.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index_map: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: &str) {
        self.index(id);
    }

    /// Record that `from` depends on `to`; both nodes are added if missing
    pub fn add_edge(&mut self, from: &str, to: &str) {
        let from = self.index(from);
        let to = self.index(to);
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_map.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Direct dependencies of `id`, in the order the edges were added
    pub fn dependencies(&self, id: &str) -> Vec<String> {
        self.names(id, Direction::Outgoing)
    }

    /// Direct dependents of `id`, in the order the edges were added
    pub fn dependents(&self, id: &str) -> Vec<String> {
        self.names(id, Direction::Incoming)
    }

    /// Dependencies before dependents, ties broken by insertion order
    ///
    /// Fails with [`Error::CyclicDependency`] naming the ids of one cycle.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        if algo::is_cyclic_directed(&self.graph) {
            return Err(Error::CyclicDependency {
                cycle: self.find_cycle(),
            });
        }

        // Kahn's pass so equal-level nodes keep insertion order
        let mut waiting: Vec<usize> = self
            .graph
            .node_indices()
            .map(|idx| self.graph.neighbors_directed(idx, Direction::Outgoing).count())
            .collect();
        let mut ready: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|idx| waiting[idx.index()] == 0)
            .collect();

        let mut sorted = Vec::with_capacity(self.graph.node_count());
        while let Some(idx) = ready.pop_front() {
            sorted.push(self.graph[idx].clone());
            for dependent in self.adjacent(idx, Direction::Incoming) {
                let count = &mut waiting[dependent.index()];
                *count -= 1;
                if *count == 0 {
                    ready.push_back(dependent);
                }
            }
        }
        if sorted.len() != self.graph.node_count() {
            return Err(Error::CyclicDependency {
                cycle: self.find_cycle(),
            });
        }
        Ok(sorted)
    }

    /// Dependents before dependencies
    pub fn reverse_topological_order(&self) -> Result<Vec<String>> {
        let mut order = self.topological_order()?;
        order.reverse();
        Ok(order)
    }

    fn index(&mut self, id: &str) -> NodeIndex {
        if let Some(&idx) = self.index_map.get(id) {
            return idx;
        }
        let idx = self.graph.add_node(id.to_string());
        self.index_map.insert(id.to_string(), idx);
        idx
    }

    /// Neighbours of `idx` ordered by edge insertion
    fn adjacent(&self, idx: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut edges: Vec<_> = self.graph.edges_directed(idx, direction).collect();
        edges.sort_by_key(EdgeRef::id);
        edges
            .into_iter()
            .map(|e| if e.source() == idx { e.target() } else { e.source() })
            .collect()
    }

    fn names(&self, id: &str, direction: Direction) -> Vec<String> {
        self.index_map.get(id).map_or_else(Vec::new, |&idx| {
            self.adjacent(idx, direction)
                .into_iter()
                .map(|n| self.graph[n].clone())
                .collect()
        })
    }

    /// One cycle as a path whose first id is repeated at the end
    ///
    /// Picks the strongly connected component holding the earliest inserted
    /// node that sits on a cycle, then follows dependencies inside it.
    fn find_cycle(&self) -> Vec<String> {
        let component: HashSet<NodeIndex> = algo::tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || self.graph.find_edge(scc[0], scc[0]).is_some()
            })
            .min_by_key(|scc| scc.iter().min().copied())
            .unwrap_or_default()
            .into_iter()
            .collect();
        let Some(&start) = component.iter().min() else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut current = start;
        while let Some(next) = self
            .adjacent(current, Direction::Outgoing)
            .into_iter()
            .find(|n| component.contains(n))
        {
            if let Some(pos) = path.iter().position(|&n| n == next) {
                path.drain(..pos);
                path.push(next);
                break;
            }
            path.push(next);
            current = next;
        }
        path.into_iter().map(|idx| self.graph[idx].clone()).collect()
    }
}
