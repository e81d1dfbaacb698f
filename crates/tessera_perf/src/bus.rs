//! Transfer cost model between memory nodes.

use serde::{Deserialize, Serialize};
use tessera_core::MemoryNode;

/// Latency and bandwidth of one directed link
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkModel {
    /// Fixed cost per transfer in microseconds
    pub latency_us: f64,
    /// Bytes moved per microsecond
    pub bandwidth: f64,
}

impl LinkModel {
    /// A link that costs nothing (same node)
    pub const LOCAL: LinkModel = LinkModel {
        latency_us: 0.0,
        bandwidth: f64::INFINITY,
    };

    /// Create a link model
    #[must_use]
    pub const fn new(latency_us: f64, bandwidth: f64) -> Self {
        Self {
            latency_us,
            bandwidth,
        }
    }

    /// Predicted time to move `bytes` over this link
    #[must_use]
    pub fn transfer_time(&self, bytes: usize) -> f64 {
        if self.bandwidth.is_infinite() {
            return self.latency_us;
        }
        self.latency_us + bytes as f64 / self.bandwidth
    }
}

/// Dense matrix of link models between every pair of memory nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusModel {
    nnodes: usize,
    links: Vec<LinkModel>,
}

impl BusModel {
    /// Every distinct pair of nodes shares the same link characteristics
    #[must_use]
    pub fn uniform(nnodes: usize, link: LinkModel) -> Self {
        let mut links = vec![link; nnodes * nnodes];
        for node in 0..nnodes {
            links[node * nnodes + node] = LinkModel::LOCAL;
        }
        Self { nnodes, links }
    }

    /// Typical PCIe-like characteristics: 10us latency, 5 GB/s
    #[must_use]
    pub fn pcie(nnodes: usize) -> Self {
        Self::uniform(nnodes, LinkModel::new(10.0, 5_000.0))
    }

    /// Number of memory nodes covered
    #[must_use]
    pub const fn nnodes(&self) -> usize {
        self.nnodes
    }

    /// Override one directed link
    pub fn set_link(&mut self, src: MemoryNode, dst: MemoryNode, link: LinkModel) {
        assert!(src.index() < self.nnodes && dst.index() < self.nnodes, "node out of range");
        self.links[src.index() * self.nnodes + dst.index()] = link;
    }

    /// Link model for a directed pair
    #[must_use]
    pub fn link(&self, src: MemoryNode, dst: MemoryNode) -> LinkModel {
        if src == dst {
            return LinkModel::LOCAL;
        }
        self.links
            .get(src.index() * self.nnodes + dst.index())
            .copied()
            .unwrap_or(LinkModel::LOCAL)
    }

    /// Predicted time to move `bytes` from `src` to `dst`
    #[must_use]
    pub fn transfer_time(&self, src: MemoryNode, dst: MemoryNode, bytes: usize) -> f64 {
        self.link(src, dst).transfer_time(bytes)
    }
}

impl Default for BusModel {
    fn default() -> Self {
        Self::pcie(1)
    }
}
