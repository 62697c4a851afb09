use crate::topology::{RackKey, Server, ServerData, ServerId, ServerState};
use crc::{Crc, Digest, CRC_64_ECMA_182};
use serde::{Deserialize, Serialize};

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Incremental CRC-64 over an explicit, ordered list of fields. Strings are length-prefixed so
/// adjacent fields cannot alias each other.
pub(crate) struct Fingerprint(Digest<'static, u64>);
impl Fingerprint {
  pub fn new() -> Fingerprint {
    Fingerprint(CRC64.digest())
  }

  pub fn str(&mut self, s: &str) -> &mut Self {
    self.0.update(&(s.len() as u32).to_be_bytes());
    self.0.update(s.as_bytes());
    self
  }

  pub fn int(&mut self, v: i64) -> &mut Self {
    self.0.update(&v.to_be_bytes());
    self
  }

  pub fn bool(&mut self, v: bool) -> &mut Self {
    self.0.update(&[v as u8]);
    self
  }

  pub fn finish(self) -> u64 {
    self.0.finalize()
  }
}

/// Immutable view of a server, gossiped between nodes.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
pub struct ServerSnapshot {
  pub address: String,
  pub port: i32,
  pub ssl: bool,
  /// Local view only, not fingerprinted.
  pub dynamic: bool,
  pub cluster_id: String,
  pub display_name: String,
  pub machine_hash: String,
  pub port_bartender: i32,
  pub state: ServerState,
  pub seed_index: i32,
  pub external_id: Option<ServerId>,
  pub pod_any: bool,
  /// Sorted.
  pub pod_set: Vec<String>,
  /// Logical time of the originating change. Carried, never hashed.
  pub sequence: u64,
  pub crc: u64,
}
impl ServerSnapshot {
  pub(crate) fn of(server: &Server, data: &ServerData) -> ServerSnapshot {
    ServerSnapshot {
      address: server.address().to_string(),
      port: server.port(),
      ssl: server.is_ssl(),
      dynamic: server.is_dynamic(),
      cluster_id: server.cluster_id().to_string(),
      display_name: data.display_name.clone(),
      machine_hash: data.machine_hash.clone(),
      port_bartender: data.port_bartender,
      state: data.state,
      seed_index: data.seed_index,
      external_id: data.external.clone(),
      pod_any: data.pod_any,
      pod_set: data.pod_set.iter().cloned().collect(),
      sequence: data.last_sequence,
      crc: 0,
    }
    .seal()
  }

  pub fn id(&self) -> ServerId {
    ServerId::new(&self.address, self.port)
  }

  pub fn is_up(&self) -> bool {
    self.state.is_up()
  }

  /// Recomputes the CRC after the fields were edited.
  pub fn seal(mut self) -> ServerSnapshot {
    self.crc = self.fingerprint();
    self
  }

  pub fn fingerprint(&self) -> u64 {
    let mut fp = Fingerprint::new();
    fp.str(&self.address)
      .int(self.port as i64)
      .bool(self.ssl)
      .str(&self.cluster_id)
      .str(&self.display_name)
      .str(&self.machine_hash)
      .int(self.port_bartender as i64)
      .int(u8::from(self.state) as i64)
      .int(self.seed_index as i64);
    match &self.external_id {
      Some(id) => fp.bool(true).str(id.as_str()),
      None => fp.bool(false),
    };
    fp.bool(self.pod_any).int(self.pod_set.len() as i64);
    for pod in &self.pod_set {
      fp.str(pod);
    }
    fp.finish()
  }
}

/// Immutable view of a rack: one entry per slot, in slot order.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct RackSnapshot {
  pub cluster_id: String,
  pub rack_id: String,
  pub servers: Vec<Option<ServerSnapshot>>,
  pub crc: u64,
}
impl RackSnapshot {
  pub fn of(
    cluster_id: &str,
    rack_id: &str,
    servers: Vec<Option<ServerSnapshot>>,
  ) -> RackSnapshot {
    let mut fp = Fingerprint::new();
    fp.str(cluster_id).str(rack_id).int(servers.len() as i64);
    for server in &servers {
      match server {
        Some(s) => fp.bool(true).int(s.crc as i64),
        None => fp.bool(false),
      };
    }
    RackSnapshot {
      cluster_id: cluster_id.to_string(),
      rack_id: rack_id.to_string(),
      servers,
      crc: fp.finish(),
    }
  }

  pub fn empty(key: &RackKey) -> RackSnapshot {
    RackSnapshot::of(&key.cluster, &key.rack, Vec::new())
  }

  pub fn key(&self) -> RackKey {
    RackKey::new(&self.cluster_id, &self.rack_id)
  }

  pub fn members(&self) -> impl Iterator<Item = &ServerSnapshot> {
    self.servers.iter().flatten()
  }
}

#[cfg(test)]
fn snapshot(address: &str, port: i32, state: ServerState) -> ServerSnapshot {
  ServerSnapshot {
    address: address.to_string(),
    port,
    ssl: false,
    dynamic: true,
    cluster_id: "cluster".to_string(),
    display_name: format!("{}:{}", address, port),
    machine_hash: String::new(),
    port_bartender: 0,
    state,
    seed_index: 0,
    external_id: None,
    pod_any: true,
    pod_set: vec![],
    sequence: 1,
    crc: 0,
  }
  .seal()
}

#[test]
fn test_sequence_is_not_fingerprinted() {
  let a = snapshot("10.0.0.1", 80, ServerState::Up);
  let mut b = a.clone();
  b.sequence = 99;
  assert_eq!(a.crc, b.clone().seal().crc);
  b.display_name = "renamed".to_string();
  assert_ne!(a.crc, b.seal().crc);
}

#[test]
fn test_fields_do_not_alias() {
  let mut a = snapshot("10.0.0.1", 80, ServerState::Up);
  a.display_name = "ab".to_string();
  a.machine_hash = "c".to_string();
  let mut b = a.clone();
  b.display_name = "a".to_string();
  b.machine_hash = "bc".to_string();
  assert_ne!(a.seal().crc, b.seal().crc);
}

#[test]
fn test_rack_crc_tracks_members_and_empty_slots() {
  let a = snapshot("10.0.0.1", 80, ServerState::Up);
  let b = snapshot("10.0.0.2", 80, ServerState::Known);
  let one = RackSnapshot::of("cluster", "rack", vec![Some(a.clone()), Some(b.clone())]);
  let two = RackSnapshot::of("cluster", "rack", vec![Some(a.clone()), Some(b.clone())]);
  assert_eq!(one.crc, two.crc);
  let gap = RackSnapshot::of("cluster", "rack", vec![Some(a.clone()), None, Some(b.clone())]);
  assert_ne!(one.crc, gap.crc);
  let other = RackSnapshot::of("cluster", "rack-2", vec![Some(a), Some(b)]);
  assert_ne!(one.crc, other.crc);
  assert_eq!(gap.members().count(), 2);
}
