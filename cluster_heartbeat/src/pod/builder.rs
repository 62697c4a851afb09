use crate::error::{HeartbeatError, Result};
use crate::pod::{PodSnapshot, PodType};
use crate::topology::{Root, ServerId};
use itertools::Itertools;
use std::cmp::max;
use std::collections::BTreeMap;

/// Name of the implicit pod holding only the local server. Every server has its own.
pub const LOCAL_POD: &str = "local";

/// Identifies a physical machine: the hardware address in hex followed by the port, e.g.
/// `0a:1b:2c:3d:4e:5f:8080`. Empty without a hardware address.
pub fn machine_hash(hardware_address: Option<&[u8]>, port: i32) -> String {
  match hardware_address {
    Some(mac) if !mac.is_empty() => {
      format!("{}:{}", mac.iter().map(|b| format!("{:02x}", b)).join(":"), port)
    }
    _ => String::new(),
  }
}

/// A configured pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodConfig {
  pub name: String,
  pub cluster_id: String,
  pub pod_type: PodType,
  /// Servers placed ahead of the other cluster members.
  pub servers: Vec<ServerId>,
}
impl PodConfig {
  pub fn id(&self) -> String {
    format!("{}.{}", self.name, self.cluster_id)
  }

  pub fn server(&mut self, id: ServerId) -> &mut PodConfig {
    if !self.servers.contains(&id) {
      self.servers.push(id);
    }
    self
  }
}

/// Collects configured pods and lays them out over the topology, together with the implicit
/// `cluster_hub`, `cluster` and `local` pods.
#[derive(Clone, Debug)]
pub struct PodBuilder {
  depth: usize,
  pods: BTreeMap<String, PodConfig>,
}
impl PodBuilder {
  pub fn new(depth: usize) -> PodBuilder {
    PodBuilder {
      depth,
      pods: BTreeMap::new(),
    }
  }

  pub fn pod(&mut self, name: &str, cluster_id: &str, pod_type: PodType) -> Result<&mut PodConfig> {
    let config = PodConfig {
      name: name.to_string(),
      cluster_id: cluster_id.to_string(),
      pod_type,
      servers: Vec::new(),
    };
    let id = config.id();
    if self.pods.contains_key(&id) {
      return Err(HeartbeatError::DuplicatePod(id));
    }
    Ok(self.pods.entry(id).or_insert(config))
  }

  pub fn pods(&self) -> impl Iterator<Item = &PodConfig> {
    self.pods.values()
  }

  pub fn build(&self, root: &Root, sequence: u64) -> Result<Vec<PodSnapshot>> {
    let mut pods = Vec::new();
    for config in self.pods.values() {
      pods.push(self.build_pod(root, config, sequence)?);
    }
    let me = root.self_server();
    let cluster_id = me.cluster_id();
    let hub_width = 3;
    pods.push(PodSnapshot {
      name: "cluster_hub".to_string(),
      cluster_id: cluster_id.to_string(),
      pod_type: PodType::Triad,
      primary_count: hub_width,
      depth: hub_width,
      servers: cluster_servers(root, cluster_id, hub_width, &[]),
      sequence,
      crc: 0,
    }
    .seal());
    if !self.pods.contains_key(&format!("cluster.{}", cluster_id)) {
      let known = root.cluster(cluster_id).map(|c| c.servers().len()).unwrap_or(0);
      let width = max(3, known);
      pods.push(PodSnapshot {
        name: "cluster".to_string(),
        cluster_id: cluster_id.to_string(),
        pod_type: PodType::Cluster,
        primary_count: width,
        depth: self.depth,
        servers: cluster_servers(root, cluster_id, width, &[]),
        sequence,
        crc: 0,
      }
      .seal());
    }
    pods.push(PodSnapshot {
      name: LOCAL_POD.to_string(),
      cluster_id: cluster_id.to_string(),
      pod_type: PodType::Solo,
      primary_count: 1,
      depth: 1,
      servers: vec![Some(me.id().clone())],
      sequence,
      crc: 0,
    }
    .seal());
    Ok(pods)
  }

  fn build_pod(&self, root: &Root, config: &PodConfig, sequence: u64) -> Result<PodSnapshot> {
    let known = root.cluster(&config.cluster_id).map(|c| c.servers().len()).unwrap_or(0);
    let primary = config.pod_type.primary_count(known).ok_or_else(|| {
      HeartbeatError::InvalidPod(config.id(), config.pod_type.name().to_string())
    })?;
    let width = match config.pod_type {
      PodType::Cluster => max(known, self.depth),
      _ => max(primary, self.depth),
    };
    Ok(PodSnapshot {
      name: config.name.clone(),
      cluster_id: config.cluster_id.clone(),
      pod_type: config.pod_type,
      primary_count: primary,
      depth: self.depth,
      servers: cluster_servers(root, &config.cluster_id, width, &config.servers),
      sequence,
      crc: 0,
    }
    .seal())
  }
}

/// `count` slots: the hinted servers, then the cluster members in rack order, then the local
/// server when it belongs to the cluster and is still missing, then empty placeholders.
pub(crate) fn cluster_servers(
  root: &Root,
  cluster_id: &str,
  count: usize,
  hints: &[ServerId],
) -> Vec<Option<ServerId>> {
  let members = root.cluster(cluster_id).map(|c| c.servers()).unwrap_or_default();
  let mut slots = hints
    .iter()
    .cloned()
    .chain(members)
    .unique()
    .map(Some)
    .collect::<Vec<_>>();
  let me = root.self_id();
  if root.self_server().cluster_id() == cluster_id
    && slots.len() < count
    && !slots.iter().any(|s| s.as_ref() == Some(me))
  {
    slots.push(Some(me.clone()));
  }
  slots.resize(count, None);
  slots
}

#[test]
fn test_machine_hash() {
  let mac = [0x0a, 0x1b, 0x2c, 0x3d, 0x4e, 0x5f];
  assert_eq!(machine_hash(Some(&mac), 8080), "0a:1b:2c:3d:4e:5f:8080");
  assert_eq!(machine_hash(None, 8080), "");
}

#[test]
fn test_duplicate_pod_is_rejected() {
  let mut builder = PodBuilder::new(3);
  assert!(builder.pod("web", "cluster", PodType::Web).is_ok());
  assert!(builder.pod("web", "other", PodType::Web).is_ok());
  assert_eq!(
    builder.pod("web", "cluster", PodType::Solo).map(|p| p.id()),
    Err(HeartbeatError::DuplicatePod("web.cluster".to_string()))
  );
}

#[test]
fn test_build_adds_implicit_pods() {
  let root = Root::new("10.0.0.5", 8080, false, "cluster").unwrap();
  let rack = root.self_rack().unwrap();
  root.create_rack_server(&rack, "10.0.0.1", 80, false).unwrap();
  let mut builder = PodBuilder::new(3);
  builder
    .pod("db", "cluster", PodType::Pair)
    .unwrap()
    .server(ServerId::new("10.0.0.9", 80));
  let pods = builder.build(&root, 7).unwrap();
  let ids = pods.iter().map(|p| p.id()).collect::<Vec<_>>();
  assert_eq!(
    ids,
    vec!["db.cluster", "cluster_hub.cluster", "cluster.cluster", "local.cluster"]
  );
  let db = &pods[0];
  assert_eq!(db.primary_count, 2);
  assert_eq!(
    db.servers,
    vec![
      Some(ServerId::new("10.0.0.9", 80)),
      Some(ServerId::new("10.0.0.1", 80)),
      Some(ServerId::new("10.0.0.5", 8080)),
    ]
  );
  let hub = &pods[1];
  assert_eq!(hub.servers.len(), 3);
  assert_eq!(hub.servers[2], None);
  assert_eq!(pods[3].servers, vec![Some(root.self_id().clone())]);
  assert!(pods.iter().all(|p| p.sequence == 7 && p.crc != 0));
}

#[test]
fn test_configured_cluster_pod_replaces_implicit_one() {
  let root = Root::new("10.0.0.5", 8080, false, "cluster").unwrap();
  let mut builder = PodBuilder::new(3);
  builder.pod("cluster", "cluster", PodType::Cluster).unwrap();
  let pods = builder.build(&root, 1).unwrap();
  assert_eq!(pods.iter().filter(|p| p.name == "cluster").count(), 1);
  let mut bad = PodBuilder::new(3);
  bad.pod("x", "cluster", PodType::Off).unwrap();
  assert!(matches!(bad.build(&root, 1), Err(HeartbeatError::InvalidPod(_, _))));
}
