//! Dependency graph over expanded job instances.

use crate::matrix::MatrixExpander;
use lattice_core::job::JobInstance;
use lattice_core::pipeline::PipelineDefinition;
use lattice_core::{Error, JobId, Result};
use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// A node in the job DAG.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub job: JobInstance,
    /// Longest distance from a root.
    pub rank: usize,
}

impl DagNode {
    pub fn id(&self) -> &JobId {
        &self.job.id
    }
}

/// Directed acyclic graph of job instances. Edges point from a job to the
/// jobs that need it.
#[derive(Debug)]
pub struct JobDag {
    graph: DiGraph<DagNode, ()>,
    id_to_index: HashMap<JobId, NodeIndex>,
    order: Vec<NodeIndex>,
}

impl JobDag {
    pub fn get(&self, id: &JobId) -> Option<&DagNode> {
        self.id_to_index
            .get(id)
            .and_then(|&idx| self.graph.node_weight(idx))
    }

    pub fn rank(&self, id: &JobId) -> Option<usize> {
        self.get(id).map(|node| node.rank)
    }

    /// Jobs with no dependencies.
    pub fn roots(&self) -> Vec<&DagNode> {
        self.order
            .iter()
            .filter(|&&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|&idx| &self.graph[idx])
            .collect()
    }

    /// Jobs that need the given job.
    pub fn successors(&self, id: &JobId) -> Vec<&DagNode> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Jobs the given job needs.
    pub fn predecessors(&self, id: &JobId) -> Vec<&DagNode> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: &JobId, direction: Direction) -> Vec<&DagNode> {
        let Some(&idx) = self.id_to_index.get(id) else {
            return Vec::new();
        };
        let mut nodes: Vec<&DagNode> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| &self.graph[n])
            .collect();
        nodes.sort_by_key(|node| node.job.index);
        nodes
    }

    /// Jobs sorted by (rank, declaration index), a valid topological order.
    pub fn topological_order(&self) -> Vec<&DagNode> {
        self.order.iter().map(|&idx| &self.graph[idx]).collect()
    }

    /// Jobs in declaration order.
    pub fn jobs(&self) -> Vec<&DagNode> {
        let mut nodes: Vec<&DagNode> = self.graph.node_weights().collect();
        nodes.sort_by_key(|node| node.job.index);
        nodes
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

/// Builder for constructing job DAGs.
#[derive(Default)]
pub struct DagBuilder {
    declared: HashSet<String>,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical job names that exist even when they expanded to no instances.
    pub fn with_declared_jobs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared.extend(names.into_iter().map(Into::into));
        self
    }

    /// Expand a pipeline's matrices and build its DAG.
    pub fn build_pipeline(pipeline: &PipelineDefinition) -> Result<JobDag> {
        let instances = MatrixExpander::new().expand_pipeline(pipeline)?;
        DagBuilder::new()
            .with_declared_jobs(pipeline.jobs.keys().cloned())
            .build(instances)
    }

    /// Build a DAG from expanded job instances.
    pub fn build(&self, jobs: Vec<JobInstance>) -> Result<JobDag> {
        let mut graph = DiGraph::with_capacity(jobs.len(), jobs.len());
        let mut id_to_index = HashMap::with_capacity(jobs.len());
        let mut by_name: HashMap<String, Vec<NodeIndex>> = HashMap::new();

        for job in jobs {
            if id_to_index.contains_key(&job.id) {
                return Err(Error::DuplicateJob(job.id.to_string()));
            }
            let id = job.id.clone();
            let name = job.name.clone();
            let idx = graph.add_node(DagNode { job, rank: 0 });
            id_to_index.insert(id, idx);
            by_name.entry(name).or_default().push(idx);
        }

        // Add edges for dependencies
        let indices: Vec<NodeIndex> = graph.node_indices().collect();
        for idx in indices {
            let needs = graph[idx].job.needs.clone();
            for dep in &needs {
                let sources: Vec<NodeIndex> = if let Some(instances) = by_name.get(dep) {
                    instances.clone()
                } else if let Some(&instance) = id_to_index.get(&JobId::new(dep.as_str())) {
                    vec![instance]
                } else if self.declared.contains(dep) {
                    Vec::new()
                } else {
                    return Err(Error::UnknownDependency {
                        job: graph[idx].job.id.to_string(),
                        dependency: dep.clone(),
                    });
                };
                for source in sources {
                    graph.update_edge(source, idx, ());
                }
            }
        }

        let order = rank_nodes(&mut graph)?;
        debug!(jobs = graph.node_count(), edges = graph.edge_count(), "Built job DAG");

        Ok(JobDag {
            graph,
            id_to_index,
            order,
        })
    }
}

/// Kahn's algorithm: assigns ranks and returns the (rank, index) ordering,
/// or the members of a cycle when not every node can be reached.
fn rank_nodes(graph: &mut DiGraph<DagNode, ()>) -> Result<Vec<NodeIndex>> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|idx| {
            (
                idx,
                graph.neighbors_directed(idx, Direction::Incoming).count(),
            )
        })
        .collect();

    let mut queue: VecDeque<NodeIndex> = graph
        .node_indices()
        .filter(|idx| in_degree[idx] == 0)
        .collect();
    let mut visited = Vec::with_capacity(graph.node_count());

    while let Some(idx) = queue.pop_front() {
        visited.push(idx);
        let rank = graph[idx].rank;
        let successors: Vec<NodeIndex> = graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        for succ in successors {
            let node = &mut graph[succ];
            node.rank = node.rank.max(rank + 1);
            if let Some(degree) = in_degree.get_mut(&succ) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(succ);
                }
            }
        }
    }

    if visited.len() < graph.node_count() {
        return Err(Error::CyclicDependency {
            cycle: find_cycle(graph),
        });
    }

    visited.sort_by_key(|&idx| (graph[idx].rank, graph[idx].job.index));
    Ok(visited)
}

/// Members of the cycle containing the earliest-declared cyclic job.
fn find_cycle(graph: &DiGraph<DagNode, ()>) -> Vec<String> {
    let mut cycle = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .min_by_key(|scc| scc.iter().map(|&idx| graph[idx].job.index).min())
        .unwrap_or_default();
    cycle.sort_by_key(|&idx| graph[idx].job.index);
    cycle
        .into_iter()
        .map(|idx| graph[idx].job.id.to_string())
        .collect()
}
