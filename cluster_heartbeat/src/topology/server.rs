use crate::topology::{
  current_time_millis, RackKey, Root, ServerId, ServerSnapshot, ServerState,
};
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use std::cmp::max;
use std::sync::Arc;
use tracing::{debug, trace};

/// Mutable half of a [`Server`], guarded by its lock.
#[derive(Clone, Debug, Default)]
pub(crate) struct ServerData {
  pub state: ServerState,
  pub display_name: String,
  pub machine_hash: String,
  pub port_bartender: i32,
  pub seed_index: i32,
  pub last_seed_time: u64,
  pub pod_any: bool,
  pub pod_set: im::OrdSet<String>,
  pub rack: Option<(RackKey, usize)>,
  pub last_heartbeat_time: u64,
  pub last_sequence: u64,
  /// Highest sequence the server reported about itself directly.
  pub reported_sequence: u64,
  pub state_sequence: u64,
  pub connection_fail_time: u64,
  pub external: Option<ServerId>,
  pub delegate: Option<ServerId>,
  pub delegate_self: bool,
}

/// A server known to the local node. Identity is immutable, everything else changes through the
/// heartbeat state machine and is published as an immutable [`ServerSnapshot`].
#[derive(Debug)]
pub struct Server {
  id: ServerId,
  address: String,
  port: i32,
  ssl: bool,
  dynamic: bool,
  cluster_id: String,
  is_self: bool,
  data: RwLock<ServerData>,
  snapshot: ArcSwap<ServerSnapshot>,
}
impl Server {
  pub(crate) fn new(
    address: &str,
    port: i32,
    ssl: bool,
    dynamic: bool,
    cluster_id: &str,
    is_self: bool,
  ) -> Server {
    let id = ServerId::new(address, port);
    let data = ServerData {
      display_name: id.to_string(),
      pod_any: true,
      ..ServerData::default()
    };
    let server = Server {
      address: crate::topology::normalize_address(address).to_string(),
      port,
      ssl,
      dynamic,
      cluster_id: cluster_id.to_string(),
      is_self,
      id,
      data: RwLock::new(data),
      snapshot: ArcSwap::from_pointee(ServerSnapshot::default()),
    };
    server.publish();
    server
  }

  fn publish(&self) {
    let data = self.data.read();
    self.snapshot.store(Arc::new(ServerSnapshot::of(self, &data)));
  }

  pub fn id(&self) -> &ServerId {
    &self.id
  }

  pub fn address(&self) -> &str {
    &self.address
  }

  pub fn port(&self) -> i32 {
    self.port
  }

  pub fn is_ssl(&self) -> bool {
    self.ssl
  }

  pub fn is_dynamic(&self) -> bool {
    self.dynamic
  }

  pub fn cluster_id(&self) -> &str {
    &self.cluster_id
  }

  /// True for the local server and for external aliases bound to it.
  pub fn is_self(&self) -> bool {
    self.is_self || self.data.read().delegate_self
  }

  /// True only for the instance created for the local server itself.
  pub fn is_self_instance(&self) -> bool {
    self.is_self
  }

  /// Same id, or one is a delegate (external alias) of the other.
  pub fn is_same_server(&self, other: &Server) -> bool {
    self.id == other.id
      || self.data.read().delegate.as_ref() == Some(&other.id)
      || other.data.read().delegate.as_ref() == Some(&self.id)
  }

  pub fn snapshot(&self) -> Arc<ServerSnapshot> {
    self.snapshot.load_full()
  }

  pub fn state(&self) -> ServerState {
    self.data.read().state
  }

  pub fn is_up(&self) -> bool {
    self.state().is_up()
  }

  pub fn display_name(&self) -> String {
    self.data.read().display_name.clone()
  }

  pub fn machine_hash(&self) -> String {
    self.data.read().machine_hash.clone()
  }

  pub fn port_bartender(&self) -> i32 {
    self.data.read().port_bartender
  }

  pub fn seed_index(&self) -> i32 {
    self.data.read().seed_index
  }

  pub fn last_seed_time(&self) -> u64 {
    self.data.read().last_seed_time
  }

  pub fn pod_set(&self) -> im::OrdSet<String> {
    self.data.read().pod_set.clone()
  }

  pub fn is_pod_any(&self) -> bool {
    self.data.read().pod_any
  }

  pub fn rack(&self) -> Option<RackKey> {
    self.data.read().rack.as_ref().map(|(key, _)| key.clone())
  }

  pub fn slot(&self) -> Option<usize> {
    self.data.read().rack.as_ref().map(|(_, slot)| *slot)
  }

  /// Sequence of the last accepted update.
  pub fn sequence(&self) -> u64 {
    self.data.read().last_sequence
  }

  /// Sequence at which the state last changed.
  pub fn state_sequence(&self) -> u64 {
    self.data.read().state_sequence
  }

  pub fn last_heartbeat_time(&self) -> u64 {
    self.data.read().last_heartbeat_time
  }

  pub fn connection_fail_time(&self) -> u64 {
    self.data.read().connection_fail_time
  }

  pub fn external(&self) -> Option<ServerId> {
    self.data.read().external.clone()
  }

  pub fn delegate(&self) -> Option<ServerId> {
    self.data.read().delegate.clone()
  }

  /// Applies `f` to the data, republishes the snapshot and refreshes the rack snapshot when the
  /// fingerprint changed. The local server stamps every fingerprint change with a new sequence.
  fn mutate<R>(&self, root: &Root, f: impl FnOnce(&mut ServerData) -> R) -> R {
    let (result, rack) = {
      let mut data = self.data.write();
      let result = f(&mut data);
      let mut next = ServerSnapshot::of(self, &data);
      let changed = next.crc != self.snapshot.load().crc;
      if changed && self.is_self {
        data.last_sequence = max(data.last_sequence + 1, current_time_millis());
        next.sequence = data.last_sequence;
      }
      self.snapshot.store(Arc::new(next));
      let rack = if changed {
        data.rack.as_ref().map(|(key, _)| key.clone())
      } else {
        None
      };
      (result, rack)
    };
    if let Some(key) = rack {
      root.refresh_rack(&key);
    }
    result
  }

  fn change_state(data: &mut ServerData, next: ServerState, sequence: u64) -> bool {
    if data.state == next {
      return false;
    }
    data.state = next;
    data.state_sequence = sequence;
    true
  }

  pub fn to_known(&self, root: &Root) -> bool {
    self.mutate(root, |data| {
      let next = data.state.to_known();
      let seq = data.last_sequence;
      Server::change_state(data, next, seq)
    })
  }

  /// A live link to the server was observed. Returns whether the state changed.
  pub fn on_heartbeat_start(&self, root: &Root) -> bool {
    let now = current_time_millis();
    let changed = self.mutate(root, |data| {
      data.last_heartbeat_time = now;
      data.connection_fail_time = 0;
      let next = data.state.on_heartbeat_start();
      if data.state == next {
        return false;
      }
      data.last_sequence = max(data.last_sequence + 1, now);
      let seq = data.last_sequence;
      Server::change_state(data, next, seq)
    });
    if changed {
      debug!(server = %self.id, "heartbeat start");
    }
    changed
  }

  /// The last link to the server closed. Returns whether the state changed.
  pub fn on_heartbeat_stop(&self, root: &Root) -> bool {
    let now = current_time_millis();
    let changed = self.mutate(root, |data| {
      let next = data.state.on_heartbeat_stop();
      if data.state == next {
        return false;
      }
      data.last_sequence = max(data.last_sequence + 1, now);
      let seq = data.last_sequence;
      Server::change_state(data, next, seq)
    });
    if changed {
      debug!(server = %self.id, "heartbeat stop");
    }
    changed
  }

  /// Applies a gossiped snapshot of this server. Stale sequences and updates aimed at the local
  /// server are ignored. Returns whether the state changed.
  pub fn on_heartbeat_update(&self, root: &Root, update: &ServerSnapshot) -> bool {
    if self.is_self() {
      return false;
    }
    let now = current_time_millis();
    if update.state.is_up() {
      self.data.write().last_heartbeat_time = now;
    }
    if update.sequence <= self.sequence() {
      trace!(server = %self.id, sequence = update.sequence, "stale heartbeat update");
      return false;
    }
    self.mutate(root, |data| {
      if update.sequence <= data.last_sequence {
        return false;
      }
      Server::apply_fields(data, update);
      data.last_sequence = update.sequence;
      if update.state.is_up() {
        data.connection_fail_time = 0;
      }
      let next = match update.state {
        ServerState::Unknown | ServerState::Known => data.state.to_known(),
        s => s,
      };
      Server::change_state(data, next, update.sequence)
    })
  }

  /// Applies a snapshot the server sent about itself. The sender is alive, so it comes up even
  /// when a locally stamped state (a closed link) carries a newer sequence than its report. Its
  /// fields win unless a newer direct report was already applied. Returns whether the state
  /// changed.
  pub fn on_heartbeat_report(&self, root: &Root, update: &ServerSnapshot) -> bool {
    if self.is_self() {
      return false;
    }
    let now = current_time_millis();
    let changed = self.mutate(root, |data| {
      data.last_heartbeat_time = now;
      data.connection_fail_time = 0;
      let before = ServerSnapshot::of(self, data).crc;
      if update.sequence >= data.reported_sequence {
        data.reported_sequence = update.sequence;
        Server::apply_fields(data, update);
      }
      let next = data.state.on_heartbeat_start();
      let moved = data.state != next;
      data.state = next;
      let differs = moved || ServerSnapshot::of(self, data).crc != before;
      data.last_sequence = if update.sequence > data.last_sequence {
        update.sequence
      } else if differs {
        data.last_sequence + 1
      } else {
        data.last_sequence
      };
      if moved {
        data.state_sequence = data.last_sequence;
      }
      moved
    });
    if changed {
      debug!(server = %self.id, "heartbeat report");
    }
    changed
  }

  fn apply_fields(data: &mut ServerData, update: &ServerSnapshot) {
    data.display_name = update.display_name.clone();
    data.machine_hash = update.machine_hash.clone();
    data.port_bartender = update.port_bartender;
    data.seed_index = update.seed_index;
    data.external = update.external_id.clone();
    data.pod_any = update.pod_any;
    data.pod_set = update.pod_set.iter().cloned().collect();
  }

  pub fn set_display_name(&self, root: &Root, name: &str) {
    if !name.is_empty() {
      self.mutate(root, |data| data.display_name = name.to_string());
    }
  }

  pub fn set_machine_hash(&self, root: &Root, hash: &str) {
    self.mutate(root, |data| data.machine_hash = hash.to_string());
  }

  pub fn set_port_bartender(&self, root: &Root, port: i32) {
    self.mutate(root, |data| data.port_bartender = port);
  }

  pub fn set_seed_index(&self, root: &Root, index: i32) {
    self.mutate(root, |data| data.seed_index = index);
  }

  pub fn set_last_seed_time(&self, time: u64) {
    self.data.write().last_seed_time = time;
  }

  pub fn set_pods(&self, root: &Root, pod_any: bool, pods: im::OrdSet<String>) {
    self.mutate(root, |data| {
      data.pod_any = pod_any;
      data.pod_set = pods;
    });
  }

  /// Records the public address peers use to reach this server.
  pub fn set_external(&self, root: &Root, external: Option<ServerId>) {
    if external.as_ref() == Some(&self.id) {
      return;
    }
    self.mutate(root, |data| data.external = external);
  }

  /// Binds this server as an alias of `delegate`.
  pub fn set_delegate(&self, delegate: &Server) {
    if delegate.id == self.id {
      return;
    }
    let delegate_self = delegate.is_self();
    let mut data = self.data.write();
    data.delegate = Some(delegate.id.clone());
    data.delegate_self = delegate_self;
  }

  pub fn on_connection_fail(&self, time: u64) {
    let mut data = self.data.write();
    if data.connection_fail_time == 0 {
      data.connection_fail_time = time;
    }
  }

  pub fn clear_connection_fail_time(&self) {
    self.data.write().connection_fail_time = 0;
  }

  pub(crate) fn set_rack(&self, rack: Option<(RackKey, usize)>) {
    self.data.write().rack = rack;
  }
}

#[cfg(test)]
fn peer(root: &Root) -> Arc<Server> {
  let rack = root.self_rack().unwrap();
  root.create_rack_server(&rack, "10.0.0.1", 80, false).unwrap()
}

#[cfg(test)]
fn update_of(server: &Server, state: ServerState, sequence: u64) -> ServerSnapshot {
  let mut update = (*server.snapshot()).clone();
  update.state = state;
  update.sequence = sequence;
  update.display_name = format!("{}@{}", server.id(), sequence);
  update.seal()
}

#[test]
fn test_update_is_idempotent() {
  let root = Root::new("10.0.0.5", 8080, false, "cluster").unwrap();
  let server = peer(&root);
  let update = update_of(&server, ServerState::Up, 10);
  assert!(server.on_heartbeat_update(&root, &update));
  let crc = server.snapshot().crc;
  let rack_crc = root.self_rack().unwrap().snapshot().crc;
  assert!(!server.on_heartbeat_update(&root, &update));
  assert_eq!(server.snapshot().crc, crc);
  assert_eq!(root.self_rack().unwrap().snapshot().crc, rack_crc);
  assert_eq!(server.display_name(), "10.0.0.1:80@10");
}

#[test]
fn test_sequence_acceptance_is_monotonic() {
  let root = Root::new("10.0.0.5", 8080, false, "cluster").unwrap();
  let server = peer(&root);
  assert!(server.on_heartbeat_update(&root, &update_of(&server, ServerState::Up, 10)));
  assert!(!server.on_heartbeat_update(&root, &update_of(&server, ServerState::Down, 9)));
  assert!(server.is_up());
  assert_eq!(server.sequence(), 10);
  assert!(server.on_heartbeat_update(&root, &update_of(&server, ServerState::Down, 11)));
  assert_eq!(server.state(), ServerState::Down);
  assert_eq!(server.state_sequence(), 11);
  assert!(!server.on_heartbeat_update(&root, &update_of(&server, ServerState::Known, 12)));
  assert_eq!(server.state(), ServerState::Down);
  assert_eq!(server.sequence(), 12);
}

#[test]
fn test_stale_up_update_refreshes_heartbeat_time() {
  let root = Root::new("10.0.0.5", 8080, false, "cluster").unwrap();
  let server = peer(&root);
  server.on_heartbeat_update(&root, &update_of(&server, ServerState::Up, 10));
  server.data.write().last_heartbeat_time = 1;
  assert!(!server.on_heartbeat_update(&root, &update_of(&server, ServerState::Up, 5)));
  assert!(server.last_heartbeat_time() > 1);
}

#[test]
fn test_direct_report_revives_a_server_stamped_down() {
  let root = Root::new("10.0.0.5", 8080, false, "cluster").unwrap();
  let server = peer(&root);
  let report = update_of(&server, ServerState::Up, 10);
  assert!(server.on_heartbeat_report(&root, &report));
  assert!(server.on_heartbeat_stop(&root));
  let down = server.sequence();
  assert!(down > 10);
  assert!(!server.on_heartbeat_update(&root, &report));
  assert_eq!(server.state(), ServerState::Down);
  assert!(server.on_heartbeat_report(&root, &report));
  assert!(server.is_up());
  assert_eq!(server.sequence(), down + 1);
  let renamed = update_of(&server, ServerState::Up, 11);
  assert!(!server.on_heartbeat_report(&root, &renamed));
  assert_eq!(server.display_name(), renamed.display_name);
  assert_eq!(server.sequence(), down + 2);
  assert!(!server.on_heartbeat_report(&root, &report));
  assert_eq!(server.display_name(), renamed.display_name);
}

#[test]
fn test_self_rejects_remote_updates() {
  let root = Root::new("10.0.0.5", 8080, false, "cluster").unwrap();
  let me = root.self_server().clone();
  let before = me.snapshot();
  assert!(!me.on_heartbeat_update(&root, &update_of(&me, ServerState::Down, u64::MAX)));
  assert!(!me.on_heartbeat_report(&root, &update_of(&me, ServerState::Down, u64::MAX)));
  assert_eq!(me.snapshot(), before);
}

#[test]
fn test_rack_snapshot_follows_crc_changes() {
  let root = Root::new("10.0.0.5", 8080, false, "cluster").unwrap();
  let server = peer(&root);
  let rack = root.self_rack().unwrap();
  let before = rack.snapshot().crc;
  assert!(server.on_heartbeat_start(&root));
  assert_ne!(rack.snapshot().crc, before);
  let up = rack.snapshot().crc;
  assert!(!server.on_heartbeat_start(&root));
  assert_eq!(rack.snapshot().crc, up);
  assert!(server.on_heartbeat_stop(&root));
  assert!(!server.on_heartbeat_stop(&root));
  assert_eq!(server.state(), ServerState::Down);
}

#[test]
fn test_self_changes_are_stamped_with_a_new_sequence() {
  let root = Root::new("10.0.0.5", 8080, false, "cluster").unwrap();
  let me = root.self_server().clone();
  let before = me.snapshot().sequence;
  me.on_heartbeat_start(&root);
  let after = me.snapshot().sequence;
  assert!(after > before);
  assert!(after >= current_time_millis() - 1000);
  me.set_display_name(&root, "me");
  assert!(me.snapshot().sequence > after);
}

#[test]
fn test_delegate_is_same_server() {
  let root = Root::new("10.0.0.5", 8080, false, "cluster").unwrap();
  let me = root.self_server().clone();
  let ext = root.create_server("192.168.0.5", 8080, false, "cluster").unwrap();
  assert!(!ext.is_self());
  ext.set_delegate(&me);
  assert!(ext.is_self());
  assert!(ext.is_same_server(&me));
  assert!(me.is_same_server(&ext));
  assert!(!ext.is_self_instance());
}
