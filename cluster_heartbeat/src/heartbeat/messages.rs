use crate::pod::PodSystemSnapshot;
use crate::topology::{RackSnapshot, ServerId, ServerSnapshot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Sent by a joining server to each seed of each cluster.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct JoinRequest {
  /// The address the joining server used to reach the seed.
  pub ext_address: String,
  pub ext_port: i32,
  pub cluster_id: String,
  pub address: String,
  pub port: i32,
  pub port_bartender: i32,
  pub display_name: String,
  pub machine_hash: String,
  /// 1-based position of the seed among non-loopback seeds, 0 otherwise.
  pub seed_index: i32,
}
impl JoinRequest {
  pub fn server_id(&self) -> ServerId {
    ServerId::new(&self.address, self.port)
  }
}

/// Requests exchanged between heartbeat services.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub enum HeartbeatRequest {
  Join(JoinRequest),
  /// Spoke to hub: the sender's own snapshot.
  ServerHeartbeat(Arc<ServerSnapshot>),
  /// Hub to rack members. Pods are omitted while the sender has not completed its join.
  HubHeartbeat {
    server: Arc<ServerSnapshot>,
    rack: Arc<RackSnapshot>,
    pods: Option<Arc<PodSystemSnapshot>>,
    sequence: u64,
  },
  /// Hub to representatives of a foreign cluster.
  ClusterHeartbeat {
    source_cluster: String,
    server: Arc<ServerSnapshot>,
    rack: Arc<RackSnapshot>,
    pods: Option<Arc<PodSystemSnapshot>>,
    sequence: u64,
  },
}
impl HeartbeatRequest {
  /// Name of the remote method carrying the request.
  pub fn method(&self) -> &'static str {
    match self {
      HeartbeatRequest::Join(_) => "join",
      HeartbeatRequest::ServerHeartbeat(_) => "serverHeartbeat",
      HeartbeatRequest::HubHeartbeat { .. } => "hubHeartbeat",
      HeartbeatRequest::ClusterHeartbeat { .. } => "clusterHeartbeat",
    }
  }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum HeartbeatReply {
  /// `None` when the seed is the joining server itself.
  Joined(Option<Arc<RackSnapshot>>),
  Ack,
}

/// A request to deliver, produced by the service and sent by the actor.
#[derive(Clone, Debug)]
pub struct Outbound {
  pub target: ServerId,
  pub request: HeartbeatRequest,
}

/// Server liveness changes observed by the local node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerEvent {
  Up(ServerId),
  Down(ServerId),
}
