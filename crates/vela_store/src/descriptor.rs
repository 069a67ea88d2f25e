//! Descriptor types gossiped by cluster nodes and stores.
//!
//! Gossip payloads are serde_json-encoded; the `encode`/`decode` pairs on
//! each type are the single wire contract shared by producers and the pool.

use serde::{Deserialize, Serialize};

/// Cluster-unique store identifier.
pub type StoreId = u64;
/// Identifier of the node hosting one or more stores.
pub type NodeId = u64;
/// Identifier of a replicated key range.
pub type RangeId = u64;
/// Identifier of one replica within a range.
pub type ReplicaId = u32;

/// Gossip key prefix for store descriptors.
pub const STORE_GOSSIP_PREFIX: &str = "store:";
/// Gossip key prefix for per-store dead-replica lists.
pub const DEAD_REPLICAS_GOSSIP_PREFIX: &str = "dead-replicas:";
/// Gossip key prefix for node descriptors.
pub const NODE_GOSSIP_PREFIX: &str = "node:";

pub fn store_gossip_key(store_id: StoreId) -> String {
    format!("{STORE_GOSSIP_PREFIX}{store_id}")
}

pub fn dead_replicas_gossip_key(store_id: StoreId) -> String {
    format!("{DEAD_REPLICAS_GOSSIP_PREFIX}{store_id}")
}

pub fn node_gossip_key(node_id: NodeId) -> String {
    format!("{NODE_GOSSIP_PREFIX}{node_id}")
}

/// Opaque attribute strings used for placement constraint matching.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub attrs: Vec<String>,
}

impl Attributes {
    pub fn new(attrs: Vec<String>) -> Self {
        Self { attrs }
    }
}

impl From<&[&str]> for Attributes {
    fn from(attrs: &[&str]) -> Self {
        Self {
            attrs: attrs.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Capacity telemetry a store reports about itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCapacity {
    /// Total capacity in bytes.
    pub capacity: u64,
    /// Available capacity in bytes.
    pub available: u64,
    /// Number of ranges with a replica on this store.
    pub range_count: u64,
}

impl StoreCapacity {
    /// Fraction of capacity in use, 0 when capacity is unknown.
    pub fn fraction_used(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.capacity.saturating_sub(self.available) as f64 / self.capacity as f64
    }
}

/// Self-description a node gossips about itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    /// Advertised RPC address.
    pub address: String,
    pub attrs: Attributes,
}

impl NodeDescriptor {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Self-description a store gossips about itself.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDescriptor {
    pub store_id: StoreId,
    pub node: NodeDescriptor,
    pub attrs: Attributes,
    pub capacity: StoreCapacity,
}

impl StoreDescriptor {
    /// Union of node-level and store-level attributes, order-preserving.
    pub fn combined_attrs(&self) -> Vec<String> {
        let mut combined = self.node.attrs.attrs.clone();
        for attr in &self.attrs.attrs {
            if !combined.contains(attr) {
                combined.push(attr.clone());
            }
        }
        combined
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// One replica of a range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub node_id: NodeId,
    pub store_id: StoreId,
    pub replica_id: ReplicaId,
}

/// A replica the cluster has reported dead, keyed by its range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaIdent {
    pub range_id: RangeId,
    pub replica: ReplicaDescriptor,
}

/// Authoritative list of dead replicas on one store, as gossiped.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDeadReplicas {
    pub store_id: StoreId,
    pub replicas: Vec<ReplicaIdent>,
}

impl StoreDeadReplicas {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}
