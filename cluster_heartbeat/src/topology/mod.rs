//! The topology store: clusters, regions, racks and servers, with their immutable snapshots.
//!
//! Entities refer to each other by id ([`ServerId`], [`RackKey`], cluster name), never by pointer.
//! Everything is reachable from the [`Root`].

mod clock;
mod cluster;
mod ids;
mod rack;
mod root;
mod server;
mod snapshot;
mod state;

#[rustfmt::skip]
pub(crate) use {
  server::ServerData,
  snapshot::Fingerprint,
};

#[rustfmt::skip]
pub use {
  clock::current_time_millis,
  clock::LogicalClock,
  cluster::Cluster,
  cluster::Region,
  ids::is_loopback,
  ids::normalize_address,
  ids::RackKey,
  ids::ServerId,
  ids::LOOPBACK,
  rack::Rack,
  root::Root,
  root::DEFAULT_RACK,
  root::EXTERNAL_RACK,
  server::Server,
  snapshot::RackSnapshot,
  snapshot::ServerSnapshot,
  state::ServerState,
};
