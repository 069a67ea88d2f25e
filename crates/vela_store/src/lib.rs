//! VelaStore store-pool subsystem.
//!
//! A per-node, in-memory registry of every known store in the cluster and its
//! health. Gossip feeds the pool store descriptors and per-store dead-replica
//! lists; a background worker ages out stores that stop reporting; placement
//! and rebalancing callers ask which stores are currently eligible to receive
//! a replica.
//!
//! The gossip transport, the reservation wire protocol, and the allocator
//! that consumes eligibility answers all live outside this crate.

pub mod descriptor;
pub mod resolver;
pub mod store_pool;
