//! Cluster plumbing shared by VelaStore subsystems.
//!
//! This crate is kept small and dependency-light: higher layers supply the
//! domain types and policies, this crate provides the hybrid-logical clock,
//! the supervised-worker stopper, and the in-process gossip hub they share.

pub mod gossip;
pub mod hlc;
pub mod stopper;
