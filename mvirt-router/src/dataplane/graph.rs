//! Packet processing graph
//!
//! A graph is a static set of named stages. Each stage declares its output
//! edges by name; `GraphBuilder::build` resolves every edge name to a stage
//! index once, so the hot path only deals in dense indices.
//!
//! - `Stage`: one unit of processing with named output edges
//! - `Enqueue`: hands a packet to the stage behind one of those edges
//! - Drop sinks: terminal stages that count and release what they receive
//!
//! A stage owns every packet of the batch it is given and must either
//! enqueue it on exactly one edge or drop it. Error conditions are edges
//! that lead to drop sinks, so they stay visible in `GraphStats`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, trace};

use super::packet::Packet;

/// Maximum packets handed to a stage in one call
pub const BURST_SIZE: usize = 64;

/// Index into a stage's declared edge list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge(pub usize);

/// Dense stage index inside a built graph
pub type NodeId = usize;

/// Graph construction errors. These are configuration errors and abort start-up.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("Stage {stage} declares unresolved edge {edge}")]
    UnresolvedEdge { stage: String, edge: String },

    #[error("Unknown stage: {0}")]
    UnknownStage(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// A packet processing stage.
pub trait Stage: Send {
    /// Unique stage name, used to resolve edges.
    fn name(&self) -> &str;

    /// Names of the stages this stage may enqueue to, indexed by `Edge`.
    fn edges(&self) -> &[&'static str];

    /// Process one batch. Every packet must be enqueued or dropped.
    fn process(&mut self, batch: Vec<Packet>, out: &mut Enqueue<'_>);
}

/// Output side of a running stage
pub struct Enqueue<'a> {
    edges: &'a [NodeId],
    pending: &'a mut [Vec<Packet>],
    ready: &'a mut VecDeque<NodeId>,
}

impl Enqueue<'_> {
    /// Place `packet` on `edge`. Panics if the stage did not declare the edge.
    pub fn enqueue(&mut self, edge: Edge, packet: Packet) {
        let next = self.edges[edge.0];
        let queue = &mut self.pending[next];
        if queue.is_empty() {
            self.ready.push_back(next);
        }
        queue.push(packet);
    }
}

/// Terminal stage that releases everything it receives.
///
/// The count of released packets is the stage's packet counter in `GraphStats`.
pub struct DropSink {
    name: String,
}

impl DropSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Stage for DropSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn edges(&self) -> &[&'static str] {
        &[]
    }

    fn process(&mut self, batch: Vec<Packet>, _out: &mut Enqueue<'_>) {
        trace!(stage = %self.name, count = batch.len(), "Dropping packets");
        drop(batch);
    }
}

struct NodeCounter {
    name: String,
    drop: bool,
    packets: AtomicU64,
    calls: AtomicU64,
}

/// Counters for one stage
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct NodeStats {
    pub name: String,
    pub drop: bool,
    pub packets: u64,
    pub calls: u64,
}

/// Shared, read-only view of a graph's per-stage counters.
///
/// The owning worker updates the counters; any thread may read them.
#[derive(Clone)]
pub struct GraphStats {
    nodes: Arc<[NodeCounter]>,
}

impl GraphStats {
    /// Snapshot all counters.
    pub fn snapshot(&self) -> Vec<NodeStats> {
        self.nodes
            .iter()
            .map(|n| NodeStats {
                name: n.name.clone(),
                drop: n.drop,
                packets: n.packets.load(Ordering::Relaxed),
                calls: n.calls.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Packets received by the named stage, 0 if unknown.
    pub fn packets(&self, name: &str) -> u64 {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .map_or(0, |n| n.packets.load(Ordering::Relaxed))
    }
}

/// Collects stages before edge resolution
pub struct GraphBuilder {
    stages: Vec<(Box<dyn Stage>, bool)>,
    burst: usize,
}

impl GraphBuilder {
    pub fn new(burst: usize) -> Self {
        Self {
            stages: Vec::new(),
            burst: burst.max(1),
        }
    }

    /// Register a processing stage.
    pub fn add_stage(&mut self, stage: impl Stage + 'static) -> &mut Self {
        self.stages.push((Box::new(stage), false));
        self
    }

    /// Register a counting drop sink.
    pub fn add_drop(&mut self, name: &str) -> &mut Self {
        self.stages.push((Box::new(DropSink::new(name)), true));
        self
    }

    /// Resolve all edges and produce a runnable graph.
    pub fn build(self) -> Result<Graph> {
        let mut index = HashMap::with_capacity(self.stages.len());
        for (id, (stage, _)) in self.stages.iter().enumerate() {
            if index.insert(stage.name().to_string(), id).is_some() {
                return Err(GraphError::DuplicateStage(stage.name().to_string()));
            }
        }

        let mut nodes = Vec::with_capacity(self.stages.len());
        let mut counters = Vec::with_capacity(self.stages.len());
        for (stage, drop) in self.stages {
            let edges = stage
                .edges()
                .iter()
                .map(|edge| {
                    index
                        .get(*edge)
                        .copied()
                        .ok_or_else(|| GraphError::UnresolvedEdge {
                            stage: stage.name().to_string(),
                            edge: edge.to_string(),
                        })
                })
                .collect::<Result<Vec<_>>>()?;

            counters.push(NodeCounter {
                name: stage.name().to_string(),
                drop,
                packets: AtomicU64::new(0),
                calls: AtomicU64::new(0),
            });
            nodes.push(Node { stage, edges });
        }

        debug!(stages = nodes.len(), burst = self.burst, "Graph built");

        let pending = nodes.iter().map(|_| Vec::new()).collect();
        Ok(Graph {
            nodes,
            pending,
            ready: VecDeque::new(),
            index,
            burst: self.burst,
            stats: GraphStats {
                nodes: counters.into(),
            },
        })
    }
}

struct Node {
    stage: Box<dyn Stage>,
    edges: Vec<NodeId>,
}

/// A built graph, owned by exactly one worker thread
pub struct Graph {
    nodes: Vec<Node>,
    pending: Vec<Vec<Packet>>,
    ready: VecDeque<NodeId>,
    index: HashMap<String, NodeId>,
    burst: usize,
    stats: GraphStats,
}

impl Graph {
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    pub fn burst(&self) -> usize {
        self.burst
    }

    pub fn stats(&self) -> GraphStats {
        self.stats.clone()
    }

    /// Names of the stages behind each edge of `name`, in edge order.
    pub fn neighbors(&self, name: &str) -> Option<Vec<&str>> {
        let id = self.node_id(name)?;
        Some(
            self.nodes[id]
                .edges
                .iter()
                .map(|&next| self.nodes[next].stage.name())
                .collect(),
        )
    }

    /// Feed `batch` into the stage named `name` and run to completion.
    pub fn run_stage(&mut self, name: &str, batch: Vec<Packet>) -> Result<()> {
        let id = self
            .node_id(name)
            .ok_or_else(|| GraphError::UnknownStage(name.to_string()))?;
        self.run(id, batch);
        Ok(())
    }

    /// Feed `batch` into `entry` and run until every packet has left the graph.
    pub fn run(&mut self, entry: NodeId, batch: Vec<Packet>) {
        if batch.is_empty() {
            return;
        }
        if self.pending[entry].is_empty() {
            self.ready.push_back(entry);
        }
        self.pending[entry].extend(batch);

        while let Some(id) = self.ready.pop_front() {
            let queue = &mut self.pending[id];
            let batch = if queue.len() > self.burst {
                let rest = queue.split_off(self.burst);
                std::mem::replace(queue, rest)
            } else {
                std::mem::take(queue)
            };
            if !self.pending[id].is_empty() {
                self.ready.push_back(id);
            }
            if batch.is_empty() {
                continue;
            }

            let counter = &self.stats.nodes[id];
            counter.calls.fetch_add(1, Ordering::Relaxed);
            counter
                .packets
                .fetch_add(batch.len() as u64, Ordering::Relaxed);

            let node = &mut self.nodes[id];
            let mut out = Enqueue {
                edges: &node.edges,
                pending: &mut self.pending,
                ready: &mut self.ready,
            };
            node.stage.process(batch, &mut out);
        }
    }
}
