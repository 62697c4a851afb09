//! Cluster membership and failure detection for a fleet of servers.
//!
//! Every server keeps a [`Root`](crate::topology::Root) describing the clusters, racks and servers
//! it knows about. Inside each rack, the first few live servers (ordered by id) are elected hubs.
//! Hubs gossip the whole rack to every other member and to representatives of foreign clusters,
//! while the remaining servers (spokes) only report themselves to their hubs. A node bootstraps by
//! joining the configured seed servers of every cluster in parallel.
//!
//! The network and timers are abstracted behind [`Remote`](crate::heartbeat::Remote) and
//! [`Scheduler`](crate::heartbeat::Scheduler), so the whole protocol can be exercised in-process
//! with the [`testkit`].

mod error;
pub mod heartbeat;
pub mod pod;
pub mod testkit;
pub mod topology;

#[rustfmt::skip]
pub use {
  error::HeartbeatError,
  error::RemoteError,
  error::Result,
};
