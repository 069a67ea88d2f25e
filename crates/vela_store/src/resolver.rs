//! Node address resolution over gossiped node descriptors.

use std::sync::Arc;

use anyhow::Context;
use vela_base::gossip::Gossip;

use crate::descriptor::{node_gossip_key, NodeDescriptor, NodeId};

/// Resolves a node id to its advertised RPC address.
pub type NodeAddressResolver = Arc<dyn Fn(NodeId) -> anyhow::Result<String> + Send + Sync>;

/// Resolver backed by the gossip hub's retained node descriptors.
pub fn gossip_address_resolver(gossip: Arc<Gossip>) -> NodeAddressResolver {
    Arc::new(move |node_id| {
        let payload = gossip
            .info(&node_gossip_key(node_id))
            .with_context(|| format!("no gossiped descriptor for node {node_id}"))?;
        let desc = NodeDescriptor::decode(&payload)
            .with_context(|| format!("decode gossiped descriptor for node {node_id}"))?;
        Ok(desc.address)
    })
}
