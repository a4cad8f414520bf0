//! Physical memory topology: zone classification and NUMA nodes.
//!
//! The boot-time memory map provider describes RAM as flat ranges; this
//! module classifies those ranges into allocation zones and groups them
//! into NUMA nodes with a distance matrix. The allocator consumes the
//! topology once at construction and treats node preference as a soft
//! hint afterwards.

use core::fmt;

use planck_noalloc::vec::ArrayVec;
use quark_core::addr::PhysAddr;

/// Maximum number of NUMA nodes tracked.
pub const MAX_NODES: usize = 8;

/// Identifier of a NUMA node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u8);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Allocation policy class of a physical range.
///
/// Ordered from most to least constrained; a request with a given
/// ceiling may fall back to more constrained kinds but never upwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ZoneKind {
    /// Legacy-DMA capable memory (below 16 MiB).
    Dma,
    /// 32-bit addressable memory (below 4 GiB).
    Dma32,
    /// Ordinary RAM.
    Normal,
    /// Memory above the configured normal ceiling.
    High,
    /// Device-exposed memory, never used for ordinary allocations.
    Device,
}

/// Upper bound of the legacy-DMA zone.
pub const DMA_LIMIT: u64 = 16 * 1024 * 1024;

/// Upper bound of the 32-bit DMA zone.
pub const DMA32_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

impl ZoneKind {
    /// Classifies the zone kind of an address given the boundary where
    /// `Normal` memory ends (`u64::MAX` when no high zone is configured).
    pub fn classify(addr: PhysAddr, normal_limit: u64) -> Self {
        let a = addr.as_u64();
        if a < DMA_LIMIT {
            Self::Dma
        } else if a < DMA32_LIMIT {
            Self::Dma32
        } else if a < normal_limit {
            Self::Normal
        } else {
            Self::High
        }
    }

    /// Returns the exclusive address boundary at which this kind ends,
    /// used to split a flat region into per-kind zones.
    pub fn boundary(self, normal_limit: u64) -> u64 {
        match self {
            Self::Dma => DMA_LIMIT,
            Self::Dma32 => DMA32_LIMIT,
            Self::Normal => normal_limit,
            Self::High | Self::Device => u64::MAX,
        }
    }

    /// Fallback order for an allocation whose ceiling is `self`: the
    /// request may be satisfied from `self` or any more constrained kind.
    ///
    /// `Device` zones never participate in fallback.
    pub fn fallback_chain(self) -> &'static [ZoneKind] {
        match self {
            Self::Dma => &[Self::Dma],
            Self::Dma32 => &[Self::Dma32, Self::Dma],
            Self::Normal => &[Self::Normal, Self::Dma32, Self::Dma],
            Self::High => &[Self::High, Self::Normal, Self::Dma32, Self::Dma],
            Self::Device => &[Self::Device],
        }
    }
}

/// One NUMA node: a physical span plus CPU affinity.
#[derive(Debug, Clone, Copy)]
pub struct NodeInfo {
    /// The node's identifier.
    pub id: NodeId,
    /// Start of the node's physical span.
    pub start: PhysAddr,
    /// Exclusive end of the node's physical span.
    pub end: PhysAddr,
    /// Bitmask of CPUs with affinity to this node.
    pub cpu_mask: u64,
}

impl NodeInfo {
    /// Returns `true` if `addr` falls within this node's span.
    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// NUMA topology: node spans and the relative distance matrix.
///
/// Mirrors what ACPI SRAT/SLIT (or a device tree) describe. Distances
/// are relative cost figures; a node's distance to itself is the
/// smallest entry in its row.
pub struct NumaTopology {
    nodes: ArrayVec<NodeInfo, MAX_NODES>,
    /// `distance[from][to]`, row-major.
    distances: [[u8; MAX_NODES]; MAX_NODES],
    /// Exclusive end of `Normal` memory; addresses beyond are `High`.
    normal_limit: u64,
}

/// Conventional local-node distance (matching ACPI SLIT).
const LOCAL_DISTANCE: u8 = 10;
/// Conventional remote distance used when no matrix is supplied.
const REMOTE_DISTANCE: u8 = 20;

impl NumaTopology {
    /// Builds a topology covering `[0, span_end)` with a single node.
    ///
    /// Used by systems without NUMA firmware tables and by host tests.
    pub fn single_node(span_end: PhysAddr) -> Self {
        let mut nodes = ArrayVec::new();
        nodes.push(NodeInfo {
            id: NodeId(0),
            start: PhysAddr::zero(),
            end: span_end,
            cpu_mask: u64::MAX,
        });
        let mut distances = [[REMOTE_DISTANCE; MAX_NODES]; MAX_NODES];
        distances[0][0] = LOCAL_DISTANCE;
        Self {
            nodes,
            distances,
            normal_limit: u64::MAX,
        }
    }

    /// Builds a topology from explicit node spans and a distance matrix.
    ///
    /// `distances[from][to]` entries outside the node count are ignored.
    /// Panics if `nodes` exceeds [`MAX_NODES`].
    pub fn new(nodes: &[NodeInfo], distances: &[[u8; MAX_NODES]; MAX_NODES]) -> Self {
        assert!(nodes.len() <= MAX_NODES, "too many NUMA nodes");
        let mut stored = ArrayVec::new();
        for node in nodes {
            stored.push(*node);
        }
        Self {
            nodes: stored,
            distances: *distances,
            normal_limit: u64::MAX,
        }
    }

    /// Sets the exclusive end of `Normal` memory, creating a `High` zone
    /// beyond it.
    pub fn with_normal_limit(mut self, limit: u64) -> Self {
        self.normal_limit = limit;
        self
    }

    /// Returns the exclusive end of `Normal` memory.
    pub fn normal_limit(&self) -> u64 {
        self.normal_limit
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the node infos.
    pub fn nodes(&self) -> &[NodeInfo] {
        self.nodes.as_slice()
    }

    /// Returns the node owning `addr`, defaulting to node 0 for addresses
    /// outside every declared span.
    pub fn node_of(&self, addr: PhysAddr) -> NodeId {
        self.nodes
            .iter()
            .find(|n| n.contains(addr))
            .map_or(NodeId(0), |n| n.id)
    }

    /// Returns the distance between two nodes.
    pub fn distance(&self, from: NodeId, to: NodeId) -> u8 {
        self.distances[from.0 as usize][to.0 as usize]
    }

    /// Returns all node ids ordered by increasing distance from `from`
    /// (the local node first).
    pub fn nodes_by_distance(&self, from: NodeId) -> ArrayVec<NodeId, MAX_NODES> {
        let mut ids = ArrayVec::new();
        for node in self.nodes.iter() {
            ids.push(node.id);
        }
        ids.as_mut_slice()
            .sort_unstable_by_key(|id| self.distance(from, *id));
        ids
    }
}
