use crate::topology::ServerId;
use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, HeartbeatError>;

/// Failures raised by the topology, heartbeat and pod layers.
///
/// Stale or duplicate heartbeat updates are not errors. They are reported as "no change".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatError {
  /// A peer claimed this server's identity with a different machine hash or port.
  #[error("identity conflict for {server}: {reason}")]
  IdentityConflict { server: ServerId, reason: String },
  /// A pod with the same `name.cluster` id was already registered.
  #[error("duplicate pod {0}")]
  DuplicatePod(String),
  /// A server address was registered twice with the builder.
  #[error("duplicate server {0}")]
  DuplicateServer(String),
  /// A pod type that cannot be laid out.
  #[error("pod {0} has no slot layout for type {1}")]
  InvalidPod(String, String),
  /// Cluster ids must be non-empty.
  #[error("invalid cluster id {0:?}")]
  InvalidCluster(String),
  /// Join targets need a positive port.
  #[error("invalid seed {0}")]
  InvalidSeed(ServerId),
  /// The transport failed to deliver a request or its reply.
  #[error(transparent)]
  Remote(#[from] RemoteError),
  /// The heartbeat actor has shut down.
  #[error("heartbeat service stopped")]
  Stopped,
}

/// Transport failures surfaced by a [`Remote`](crate::heartbeat::Remote).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
  #[error("server {0} is unreachable")]
  Unreachable(ServerId),
  #[error("request dropped")]
  Dropped,
  #[error("request timed out")]
  Timeout,
  #[error("request rejected: {0}")]
  Rejected(String),
}
