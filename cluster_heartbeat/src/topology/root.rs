use crate::error::{HeartbeatError, Result};
use crate::topology::rack::{place, sort_slots};
use crate::topology::{
  Cluster, LogicalClock, Rack, RackKey, RackSnapshot, Server, ServerId, ServerSnapshot,
};
use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use itertools::Itertools;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Rack every server joins unless told otherwise.
pub const DEFAULT_RACK: &str = "rack";
/// Rack holding servers of foreign clusters.
pub const EXTERNAL_RACK: &str = "external";

/// The whole topology known to the local node.
///
/// Remote servers and clusters are created lazily and never removed; they age into `Down`.
/// All lookups are lock-free for readers.
#[derive(Debug)]
pub struct Root {
  clusters: DashMap<String, Arc<Cluster>>,
  cluster_order: ArcSwap<Vec<String>>,
  servers: DashMap<ServerId, Arc<Server>>,
  sequence: LogicalClock,
  self_server: Arc<Server>,
  write: Mutex<()>,
}
impl Root {
  /// Creates the topology with the local server placed in the default rack of its cluster.
  pub fn new(address: &str, port: i32, ssl: bool, cluster_id: &str) -> Result<Root> {
    if cluster_id.is_empty() {
      return Err(HeartbeatError::InvalidCluster(cluster_id.to_string()));
    }
    let self_server = Arc::new(Server::new(address, port, ssl, false, cluster_id, true));
    let root = Root {
      clusters: DashMap::new(),
      cluster_order: ArcSwap::from_pointee(Vec::new()),
      servers: DashMap::new(),
      sequence: LogicalClock::new(),
      self_server: self_server.clone(),
      write: Mutex::new(()),
    };
    root.servers.insert(self_server.id().clone(), self_server.clone());
    let rack = root.create_rack(cluster_id, DEFAULT_RACK)?;
    root.add_to_rack(&rack, &self_server);
    Ok(root)
  }

  pub fn self_server(&self) -> &Arc<Server> {
    &self.self_server
  }

  pub fn self_id(&self) -> &ServerId {
    self.self_server.id()
  }

  pub fn self_cluster(&self) -> Result<Arc<Cluster>> {
    self.create_cluster(self.self_server.cluster_id())
  }

  /// The rack the local server lives in.
  pub fn self_rack(&self) -> Option<Arc<Rack>> {
    self.self_server.rack().and_then(|key| self.rack(&key))
  }

  pub fn sequence(&self) -> u64 {
    self.sequence.current()
  }

  pub fn update_sequence(&self) -> u64 {
    self.sequence.next()
  }

  pub fn observe_sequence(&self, seen: u64) {
    self.sequence.observe(seen);
  }

  pub fn create_cluster(&self, name: &str) -> Result<Arc<Cluster>> {
    if name.is_empty() {
      return Err(HeartbeatError::InvalidCluster(name.to_string()));
    }
    if let Some(cluster) = self.cluster(name) {
      return Ok(cluster);
    }
    let _guard = self.write.lock();
    if let Some(cluster) = self.cluster(name) {
      return Ok(cluster);
    }
    let cluster = Arc::new(Cluster::new(name));
    self.clusters.insert(name.to_string(), cluster.clone());
    let mut order = (*self.cluster_order.load_full()).clone();
    order.push(name.to_string());
    self.cluster_order.store(Arc::new(order));
    debug!(cluster = name, "cluster created");
    Ok(cluster)
  }

  pub fn cluster(&self, name: &str) -> Option<Arc<Cluster>> {
    self.clusters.get(name).map(|c| c.value().clone())
  }

  /// Clusters in creation order.
  pub fn clusters(&self) -> Vec<Arc<Cluster>> {
    self.cluster_order.load().iter().filter_map(|id| self.cluster(id)).collect()
  }

  /// Get-or-create. An existing server keeps the cluster it was created with.
  pub fn create_server(
    &self,
    address: &str,
    port: i32,
    ssl: bool,
    cluster_id: &str,
  ) -> Result<Arc<Server>> {
    self.create_server_with(address, port, ssl, false, cluster_id)
  }

  /// Creates a server that was discovered at runtime and lists it with its cluster.
  pub fn create_dynamic_server(
    &self,
    cluster_id: &str,
    address: &str,
    port: i32,
    ssl: bool,
  ) -> Result<Arc<Server>> {
    let server = self.create_server_with(address, port, ssl, true, cluster_id)?;
    if let Some(cluster) = self.cluster(server.cluster_id()) {
      cluster.add_dynamic_server(server.id().clone());
    }
    Ok(server)
  }

  /// Creates a configured server and registers it as a seed of its cluster.
  pub fn create_seed_server(
    &self,
    cluster_id: &str,
    address: &str,
    port: i32,
    ssl: bool,
  ) -> Result<Arc<Server>> {
    let server = self.create_server(address, port, ssl, cluster_id)?;
    if let Some(cluster) = self.cluster(server.cluster_id()) {
      cluster.add_seed_server(server.id().clone());
    }
    Ok(server)
  }

  fn create_server_with(
    &self,
    address: &str,
    port: i32,
    ssl: bool,
    dynamic: bool,
    cluster_id: &str,
  ) -> Result<Arc<Server>> {
    let id = ServerId::new(address, port);
    if let Some(server) = self.server(&id) {
      return Ok(server);
    }
    let cluster = self.create_cluster(cluster_id)?;
    let (server, created) = match self.servers.entry(id) {
      Entry::Occupied(e) => (e.get().clone(), false),
      Entry::Vacant(e) => {
        let server = Arc::new(Server::new(address, port, ssl, dynamic, cluster.id(), false));
        e.insert(server.clone());
        (server, true)
      }
    };
    if created {
      self.update_sequence();
      debug!(server = %server.id(), cluster = cluster.id(), "server created");
    }
    Ok(server)
  }

  pub fn create_rack(&self, cluster_id: &str, rack_id: &str) -> Result<Arc<Rack>> {
    Ok(self.create_cluster(cluster_id)?.create_rack(rack_id))
  }

  pub fn rack(&self, key: &RackKey) -> Option<Arc<Rack>> {
    self.cluster(&key.cluster).and_then(|c| c.find_rack(&key.rack))
  }

  /// Places `server` in the first free slot of `rack` and re-sorts the rack by server id,
  /// rewriting every member's slot. A server moves out of any previous rack first. Returns the
  /// server's slot.
  pub fn add_to_rack(&self, rack: &Rack, server: &Server) -> usize {
    if let Some(slot) = rack.slot_of(server.id()) {
      return slot;
    }
    if let Some(old) = server.rack() {
      if &old != rack.key() {
        if let Some(old) = self.rack(&old) {
          self.remove_from_rack(&old, server.id());
        }
      }
    }
    let slots = {
      let _guard = rack.write.lock();
      let slots = place(&rack.servers(), server.id());
      rack.store_slots(slots.clone());
      slots
    };
    self.rewrite_slots(rack, &slots);
    self.update_sequence();
    self.refresh_rack(rack.key());
    slots.iter().position(|s| s.as_ref() == Some(server.id())).unwrap_or(0)
  }

  /// Releases the slot held by `id`. The server stays in the root maps.
  pub fn remove_from_rack(&self, rack: &Rack, id: &ServerId) -> bool {
    let slots = {
      let _guard = rack.write.lock();
      let mut slots = (*rack.servers()).clone();
      match slots.iter().position(|s| s.as_ref() == Some(id)) {
        Some(slot) => slots[slot] = None,
        None => return false,
      }
      sort_slots(&mut slots);
      rack.store_slots(slots.clone());
      slots
    };
    if let Some(server) = self.server(id) {
      server.set_rack(None);
    }
    self.rewrite_slots(rack, &slots);
    self.update_sequence();
    self.refresh_rack(rack.key());
    debug!(server = %id, rack = %rack.key(), "removed from rack");
    true
  }

  fn rewrite_slots(&self, rack: &Rack, slots: &[Option<ServerId>]) {
    for (slot, id) in slots.iter().enumerate() {
      if let Some(server) = id.as_ref().and_then(|id| self.server(id)) {
        server.set_rack(Some((rack.key().clone(), slot)));
      }
    }
  }

  /// Finds or creates the server and makes sure it is a member of `rack`.
  pub fn create_rack_server(
    &self,
    rack: &Rack,
    address: &str,
    port: i32,
    ssl: bool,
  ) -> Result<Arc<Server>> {
    let server = self.create_server(address, port, ssl, rack.cluster_id())?;
    if rack.contains(server.id()) {
      return Ok(server);
    }
    self.add_to_rack(rack, &server);
    server.to_known(self);
    if let Some(cluster) = self.cluster(server.cluster_id()) {
      cluster.add_dynamic_server(server.id().clone());
    }
    self.update_sequence();
    Ok(server)
  }

  /// Ensures the server described by `update` is in `rack`, resolving machine-hash conflicts: a
  /// down server is dropped when an up server in the rack shares its machine hash, and an up server
  /// evicts down servers with its machine hash. Returns `None` when the update was superseded.
  pub fn merge_rack_member(
    &self,
    rack: &Rack,
    update: &ServerSnapshot,
  ) -> Result<Option<Arc<Server>>> {
    let server = self.create_rack_server(rack, &update.address, update.port, update.ssl)?;
    if update.machine_hash.is_empty() || server.is_self() {
      return Ok(Some(server));
    }
    let peers = rack
      .members()
      .into_iter()
      .filter(|id| id != server.id())
      .filter_map(|id| self.server(&id))
      .filter(|peer| peer.machine_hash() == update.machine_hash)
      .collect_vec();
    if update.is_up() {
      for peer in peers.iter().filter(|p| !p.is_up() && !p.is_self()) {
        self.remove_from_rack(rack, peer.id());
      }
      Ok(Some(server))
    } else if peers.iter().any(|p| p.is_up()) {
      self.remove_from_rack(rack, server.id());
      Ok(None)
    } else {
      Ok(Some(server))
    }
  }

  /// Rebuilds the rack snapshot from the members' current snapshots.
  pub(crate) fn refresh_rack(&self, key: &RackKey) {
    if let Some(rack) = self.rack(key) {
      let servers = rack
        .servers()
        .iter()
        .map(|slot| {
          slot
            .as_ref()
            .and_then(|id| self.server(id))
            .map(|server| (*server.snapshot()).clone())
        })
        .collect();
      rack.publish(RackSnapshot::of(&key.cluster, &key.rack, servers));
    }
  }

  pub fn server(&self, id: &ServerId) -> Option<Arc<Server>> {
    self.servers.get(id).map(|s| s.value().clone())
  }

  pub fn find_server(&self, address: &str, port: i32) -> Option<Arc<Server>> {
    self.server(&ServerId::new(address, port))
  }

  /// Matches the server id or the display name.
  pub fn find_server_by_name(&self, name: &str) -> Option<Arc<Server>> {
    self
      .servers()
      .into_iter()
      .find(|s| s.id().as_str() == name || s.display_name() == name)
  }

  /// Prefers an up server when several share the hash.
  pub fn find_server_by_machine_hash(&self, hash: &str) -> Option<Arc<Server>> {
    if hash.is_empty() {
      return None;
    }
    let matches = self
      .servers()
      .into_iter()
      .filter(|s| s.machine_hash() == hash)
      .collect_vec();
    let up = matches.iter().find(|s| s.is_up()).cloned();
    up.or_else(|| matches.into_iter().next())
  }

  /// All servers, sorted by id.
  pub fn servers(&self) -> Vec<Arc<Server>> {
    self
      .servers
      .iter()
      .map(|s| s.value().clone())
      .sorted_by(|a, b| a.id().cmp(b.id()))
      .collect()
  }
}

#[cfg(test)]
fn root() -> Root {
  Root::new("10.0.0.5", 8080, false, "cluster").unwrap()
}

#[test]
fn test_self_server_is_placed_in_default_rack() {
  let root = root();
  let rack = root.self_rack().unwrap();
  assert_eq!(rack.key(), &RackKey::new("cluster", DEFAULT_RACK));
  assert_eq!(rack.members(), vec![root.self_id().clone()]);
  assert_eq!(root.self_server().slot(), Some(0));
  assert!(root.self_server().is_self());
}

#[test]
fn test_create_server_is_idempotent() {
  let root = root();
  let a = root.create_server("10.0.0.1", 80, false, "cluster").unwrap();
  let seq = root.sequence();
  let b = root.create_server("10.0.0.1", 80, false, "other").unwrap();
  assert!(Arc::ptr_eq(&a, &b));
  assert_eq!(b.cluster_id(), "cluster");
  assert_eq!(root.sequence(), seq);
  let local = root.create_server("", 80, false, "cluster").unwrap();
  assert_eq!(local.address(), "127.0.0.1");
  assert!(matches!(
    root.create_cluster(""),
    Err(HeartbeatError::InvalidCluster(_))
  ));
}

#[test]
fn test_add_to_rack_rewrites_slots() {
  let root = root();
  let rack = root.self_rack().unwrap();
  let seq = root.sequence();
  let low = root.create_rack_server(&rack, "10.0.0.1", 80, false).unwrap();
  assert!(root.sequence() > seq);
  let high = root.create_rack_server(&rack, "10.0.0.9", 80, false).unwrap();
  assert_eq!(low.slot(), Some(0));
  assert_eq!(root.self_server().slot(), Some(1));
  assert_eq!(high.slot(), Some(2));
  assert_eq!(low.state(), crate::topology::ServerState::Known);
  let ids = rack.snapshot().members().map(|s| s.id()).collect_vec();
  assert_eq!(ids, rack.members());
}

#[test]
fn test_find_servers() {
  let root = root();
  let a = root.create_server("10.0.0.1", 80, false, "cluster").unwrap();
  a.set_display_name(&root, "alpha");
  a.set_machine_hash(&root, "00:11:80");
  assert!(Arc::ptr_eq(&root.find_server("10.0.0.1", 80).unwrap(), &a));
  assert!(Arc::ptr_eq(&root.find_server_by_name("alpha").unwrap(), &a));
  assert!(Arc::ptr_eq(&root.find_server_by_name("10.0.0.1:80").unwrap(), &a));
  assert!(Arc::ptr_eq(&root.find_server_by_machine_hash("00:11:80").unwrap(), &a));
  assert!(root.find_server_by_machine_hash("").is_none());
}

#[test]
fn test_up_server_supersedes_down_server_with_same_machine_hash() {
  let root = root();
  let rack = root.self_rack().unwrap();
  let old = root.create_rack_server(&rack, "10.0.0.1", 80, false).unwrap();
  old.set_machine_hash(&root, "aa:bb:80");
  old.on_heartbeat_start(&root);
  old.on_heartbeat_stop(&root);
  let mut update = (*old.snapshot()).clone();
  update.address = "10.0.0.1".to_string();
  update.port = 81;
  update.state = crate::topology::ServerState::Up;
  let merged = root.merge_rack_member(&rack, &update.seal()).unwrap();
  assert!(merged.is_some());
  assert!(!rack.contains(old.id()));
  assert!(old.slot().is_none());
  assert!(root.server(old.id()).is_some());
}
