//! Pods: named groups of slots laid over the servers of a cluster.
//!
//! The heartbeat layer only keeps the slot bookkeeping in sync between servers. Deciding what runs
//! in a pod is up to its owner.

mod builder;
mod snapshot;
mod system;

#[rustfmt::skip]
pub use {
  builder::machine_hash,
  builder::PodBuilder,
  builder::PodConfig,
  builder::LOCAL_POD,
  snapshot::PodSnapshot,
  snapshot::PodSystemSnapshot,
  snapshot::PodType,
  system::PodSystem,
};
