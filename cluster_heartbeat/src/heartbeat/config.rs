use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configures the heartbeat service of a server.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct HeartbeatConfig {
  /// The number of live servers in each rack that act as hubs. Hubs gossip the whole rack, the
  /// other servers only report themselves to the hubs.
  ///
  /// default: `3`
  pub hub_count: usize,
  /// The minimum number of slots given to pods laid out across a cluster.
  ///
  /// default: `3`
  pub rack_depth: usize,
  /// The longest a destination may go without a hub or cluster heartbeat when nothing changed.
  ///
  /// default: `15 seconds`
  pub send_timeout: Duration,
  /// The interval of the periodic heartbeat task.
  ///
  /// default: `15 seconds`
  pub heartbeat_interval: Duration,
  /// The interval at which the join task considers joining the seed servers again.
  ///
  /// default: `60 seconds`
  pub join_interval: Duration,
  /// After a rejoin, rejoins keep happening for this long even when a seed is up.
  ///
  /// default: `15 minutes`
  pub join_full_time: Duration,
  /// A cluster's join completes early once this many seeds replied successfully.
  ///
  /// default: `2`
  pub join_success_threshold: usize,
  /// The number of servers per rack of a foreign cluster that receive cluster heartbeats.
  ///
  /// default: `3`
  pub cluster_representatives: usize,
}
impl Default for HeartbeatConfig {
  #[inline]
  fn default() -> Self {
    HeartbeatConfig {
      hub_count: 3,
      rack_depth: 3,
      send_timeout: Duration::from_secs(15),
      heartbeat_interval: Duration::from_secs(15),
      join_interval: Duration::from_secs(60),
      join_full_time: Duration::from_secs(15 * 60),
      join_success_threshold: 2,
      cluster_representatives: 3,
    }
  }
}

/// Identity of the local server.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ServerConfig {
  /// default: `127.0.0.1`
  pub address: String,
  /// default: `8080`
  pub port: i32,
  /// default: `false`
  pub ssl: bool,
  /// The internal (bartender) port peers use for heartbeats. Seeds listening on the same
  /// internal port as this server are tried first.
  ///
  /// default: `0`
  pub port_bartender: i32,
  /// default: `cluster`
  pub cluster_id: String,
  /// default: `address:port`
  pub display_name: Option<String>,
  /// Hardware address used to build the machine hash.
  ///
  /// default: `None`
  pub hardware_address: Option<Vec<u8>>,
  /// Whether any pod may be placed on this server.
  ///
  /// default: `true`
  pub pod_any: bool,
  /// Pods explicitly allowed on this server.
  ///
  /// default: `im::ordset![]`
  pub pods: im::OrdSet<String>,
}
impl Default for ServerConfig {
  #[inline]
  fn default() -> Self {
    ServerConfig {
      address: "127.0.0.1".to_string(),
      port: 8080,
      ssl: false,
      port_bartender: 0,
      cluster_id: "cluster".to_string(),
      display_name: None,
      hardware_address: None,
      pod_any: true,
      pods: im::ordset![],
    }
  }
}
impl ServerConfig {
  pub fn new(address: &str, port: i32) -> ServerConfig {
    ServerConfig {
      address: address.to_string(),
      port,
      ..ServerConfig::default()
    }
  }

  pub fn cluster(mut self, cluster_id: &str) -> ServerConfig {
    self.cluster_id = cluster_id.to_string();
    self
  }
}
