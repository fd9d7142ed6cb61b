//! Minimal OSPF: periodic Hellos discover neighbors, LSUs flood each
//! router's adjacency list, and Dijkstra over the resulting database
//! rewrites the routing table.

pub mod daemon;
pub mod database;
pub mod nbr;
pub mod proto;
pub mod spf;

pub use daemon::{Mospf, Router, RouterIface};
