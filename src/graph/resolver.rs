//! Dependency graph construction and cycle detection.
//!
//! The resolver turns the declared nodes into a [`Graph`] whose edges come
//! from property references and explicit `depends_on` entries. Traversal
//! always follows declaration order, so every derived ordering is stable
//! across runs.

use indexmap::IndexMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use tracing::{debug, info};

use crate::config::StackConfig;
use crate::error::{GraphError, Result, StackError};

use super::node::{ResourceNode, build_nodes};

/// An acyclic graph of resource nodes.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// Nodes in declaration order.
    nodes: IndexMap<String, ResourceNode>,
    /// Node id to the ids it depends on.
    dependencies: HashMap<String, Vec<String>>,
    /// Node id to the ids that depend on it, in declaration order.
    dependents: HashMap<String, Vec<String>>,
}

/// Resolver that builds a [`Graph`] from declared nodes.
#[derive(Debug, Default)]
pub struct ReferenceResolver;

/// DFS marks.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

impl ReferenceResolver {
    /// Creates a new resolver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds the graph for a stack definition.
    ///
    /// # Errors
    ///
    /// Returns an error if node construction fails, a reference dangles, or
    /// the graph has a cycle.
    pub fn resolve_config(&self, config: &StackConfig) -> Result<Graph> {
        let nodes = build_nodes(config)?;
        self.resolve(nodes)
    }

    /// Builds the graph from declared nodes.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateId`], [`GraphError::DanglingReference`]
    /// or [`GraphError::CyclicDependency`].
    pub fn resolve(&self, nodes: Vec<ResourceNode>) -> Result<Graph> {
        let mut map: IndexMap<String, ResourceNode> = IndexMap::with_capacity(nodes.len());
        for node in nodes {
            if map.contains_key(&node.id) {
                return Err(StackError::Graph(GraphError::DuplicateId { id: node.id }));
            }
            map.insert(node.id.clone(), node);
        }

        let known: HashSet<&str> = map.keys().map(String::as_str).collect();
        for node in map.values() {
            node.validate_references(&known)?;
        }

        let mut dependencies: HashMap<String, Vec<String>> = HashMap::with_capacity(map.len());
        let mut dependents: HashMap<String, Vec<String>> = HashMap::with_capacity(map.len());

        for node in map.values() {
            // Sorting by declaration index keeps traversal independent of
            // property names.
            let mut deps: Vec<&str> = node.dependency_ids();
            deps.sort_by_key(|id| map.get_index_of(*id));
            for dep in &deps {
                dependents
                    .entry((*dep).to_string())
                    .or_default()
                    .push(node.id.clone());
            }
            dependencies.insert(
                node.id.clone(),
                deps.into_iter().map(str::to_string).collect(),
            );
        }

        let graph = Graph {
            nodes: map,
            dependencies,
            dependents,
        };

        if let Some(cycle) = graph.find_cycle() {
            return Err(StackError::Graph(GraphError::CyclicDependency { cycle }));
        }

        info!("Resolved graph with {} nodes", graph.len());
        Ok(graph)
    }
}

impl Graph {
    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns true if the graph holds `id`.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Gets a node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    /// Iterates nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Returns the declaration index of a node.
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.nodes.get_index_of(id)
    }

    /// Returns the direct dependencies of a node.
    #[must_use]
    pub fn dependencies(&self, id: &str) -> &[String] {
        self.dependencies.get(id).map_or(&[], Vec::as_slice)
    }

    /// Returns the direct dependents of a node.
    #[must_use]
    pub fn dependents(&self, id: &str) -> &[String] {
        self.dependents.get(id).map_or(&[], Vec::as_slice)
    }

    /// Returns every node that depends on `id`, directly or not, in
    /// declaration order.
    #[must_use]
    pub fn transitive_dependents(&self, id: &str) -> Vec<&str> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);

        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(current) {
                if seen.insert(dependent.as_str()) {
                    queue.push_back(dependent.as_str());
                }
            }
        }

        let mut result: Vec<&str> = seen.into_iter().collect();
        result.sort_by_key(|n| self.position(n));
        result
    }

    /// Returns node ids in dependency order. Among nodes whose dependencies
    /// are all placed, the earliest declared comes first.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&str> {
        let mut remaining: HashMap<&str, usize> = self
            .nodes
            .keys()
            .map(|id| (id.as_str(), self.dependencies(id).len()))
            .collect();
        let mut ready: std::collections::BTreeSet<usize> = self
            .nodes
            .keys()
            .enumerate()
            .filter(|(_, id)| self.dependencies(id).is_empty())
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(index) = ready.pop_first() {
            let Some((id, _)) = self.nodes.get_index(index) else {
                continue;
            };
            order.push(id.as_str());
            for dependent in self.dependents(id) {
                if let Some(count) = remaining.get_mut(dependent.as_str()) {
                    *count -= 1;
                    if *count == 0
                        && let Some(pos) = self.position(dependent)
                    {
                        ready.insert(pos);
                    }
                }
            }
        }

        order
    }

    /// Renders the graph in Graphviz DOT format. Edges point from a node to
    /// the nodes it depends on.
    #[must_use]
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph stack {\n    rankdir=LR;\n    node [shape=box];\n");
        for node in self.nodes.values() {
            let _ = writeln!(
                out,
                "    \"{}\" [label=\"{}\\n{}\"];",
                node.id, node.id, node.type_tag
            );
        }
        for node in self.nodes.values() {
            for dep in self.dependencies(&node.id) {
                let _ = writeln!(out, "    \"{}\" -> \"{dep}\";", node.id);
            }
        }
        out.push_str("}\n");
        out
    }

    /// Depth-first search with a recursion stack; returns the first cycle
    /// found, members in traversal order.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut stack: Vec<usize> = Vec::new();

        for start in 0..self.nodes.len() {
            if marks[start] == Mark::Unvisited
                && let Some(cycle) = self.visit(start, &mut marks, &mut stack)
            {
                debug!("Cycle found: {}", cycle.join(" -> "));
                return Some(cycle);
            }
        }
        None
    }

    fn visit(&self, index: usize, marks: &mut [Mark], stack: &mut Vec<usize>) -> Option<Vec<String>> {
        marks[index] = Mark::OnStack;
        stack.push(index);

        let (id, _) = self.nodes.get_index(index)?;
        for dep in self.dependencies(id) {
            let Some(dep_index) = self.position(dep) else {
                continue;
            };
            match marks[dep_index] {
                Mark::OnStack => {
                    let start = stack.iter().position(|&i| i == dep_index)?;
                    return Some(
                        stack[start..]
                            .iter()
                            .filter_map(|&i| self.nodes.get_index(i).map(|(k, _)| k.clone()))
                            .collect(),
                    );
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(dep_index, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks[index] = Mark::Done;
        None
    }
}
