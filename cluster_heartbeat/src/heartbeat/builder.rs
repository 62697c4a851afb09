use crate::error::{HeartbeatError, Result};
use crate::heartbeat::{HeartbeatConfig, HeartbeatService, ServerConfig};
use crate::pod::{machine_hash, PodBuilder, PodConfig, PodType};
use crate::topology::{Root, ServerId};
use std::sync::Arc;

/// A configured server of some cluster. Every configured server is a seed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedConfig {
  pub address: String,
  pub port: i32,
  pub ssl: bool,
  pub cluster_id: String,
  pub display_name: Option<String>,
  /// Dynamic servers reserve a place for servers discovered at runtime.
  pub dynamic: bool,
}

/// Assembles the topology, seeds and pods of a [`HeartbeatService`].
#[derive(Clone, Debug)]
pub struct HeartbeatBuilder {
  server: ServerConfig,
  config: HeartbeatConfig,
  clusters: Vec<String>,
  seeds: Vec<SeedConfig>,
  pods: PodBuilder,
}
impl HeartbeatBuilder {
  pub fn new(server: ServerConfig) -> HeartbeatBuilder {
    let config = HeartbeatConfig::default();
    HeartbeatBuilder {
      pods: PodBuilder::new(config.rack_depth),
      server,
      config,
      clusters: Vec::new(),
      seeds: Vec::new(),
    }
  }

  pub fn config(mut self, config: HeartbeatConfig) -> HeartbeatBuilder {
    let pods = self.pods.pods().cloned().collect::<Vec<_>>();
    self.pods = PodBuilder::new(config.rack_depth);
    for pod in pods {
      if let Ok(p) = self.pods.pod(&pod.name, &pod.cluster_id, pod.pod_type) {
        p.servers = pod.servers;
      }
    }
    self.config = config;
    self
  }

  pub fn cluster(&mut self, cluster_id: &str) -> Result<&mut HeartbeatBuilder> {
    if cluster_id.is_empty() {
      return Err(HeartbeatError::InvalidCluster(cluster_id.to_string()));
    }
    if !self.clusters.iter().any(|c| c == cluster_id) {
      self.clusters.push(cluster_id.to_string());
    }
    Ok(self)
  }

  pub fn server(
    &mut self,
    address: &str,
    port: i32,
    ssl: bool,
    cluster_id: &str,
    display_name: Option<&str>,
    dynamic: bool,
  ) -> Result<&mut HeartbeatBuilder> {
    let id = ServerId::new(address, port);
    if self.seeds.iter().any(|s| ServerId::new(&s.address, s.port) == id) {
      return Err(HeartbeatError::DuplicateServer(id.to_string()));
    }
    if port <= 0 && !dynamic {
      return Err(HeartbeatError::InvalidSeed(id));
    }
    self.cluster(cluster_id)?;
    self.seeds.push(SeedConfig {
      address: address.to_string(),
      port,
      ssl,
      cluster_id: cluster_id.to_string(),
      display_name: display_name.map(str::to_string),
      dynamic,
    });
    Ok(self)
  }

  pub fn server_dyn(
    &mut self,
    address: &str,
    port: i32,
    cluster_id: &str,
  ) -> Result<&mut HeartbeatBuilder> {
    self.server(address, port, false, cluster_id, None, true)
  }

  pub fn pod(&mut self, name: &str, cluster_id: &str, pod_type: PodType) -> Result<&mut PodConfig> {
    self.pods.pod(name, cluster_id, pod_type)
  }

  pub fn seeds(&self) -> &[SeedConfig] {
    &self.seeds
  }

  pub fn build(self) -> Result<HeartbeatService> {
    let cfg = &self.server;
    let root = Arc::new(Root::new(&cfg.address, cfg.port, cfg.ssl, &cfg.cluster_id)?);
    let me = root.self_server().clone();
    if let Some(name) = &cfg.display_name {
      me.set_display_name(&root, name);
    }
    me.set_port_bartender(&root, cfg.port_bartender);
    me.set_machine_hash(&root, &machine_hash(cfg.hardware_address.as_deref(), cfg.port));
    me.set_pods(&root, cfg.pod_any, cfg.pods.clone());
    for cluster in &self.clusters {
      root.create_cluster(cluster)?;
    }
    for seed in &self.seeds {
      let server = root.create_seed_server(&seed.cluster_id, &seed.address, seed.port, seed.ssl)?;
      if let Some(name) = &seed.display_name {
        server.set_display_name(&root, name);
      }
      if seed.dynamic {
        if let Some(cluster) = root.cluster(server.cluster_id()) {
          cluster.add_dynamic_server(server.id().clone());
        }
      }
    }
    Ok(HeartbeatService::new(root, self.config, self.pods))
  }
}

#[test]
fn test_builder_registers_seeds() {
  let mut builder = HeartbeatBuilder::new(ServerConfig::new("10.0.0.5", 8080));
  builder.server("10.0.0.5", 8080, false, "cluster", None, false).unwrap();
  builder.server("10.0.0.6", 8080, false, "cluster", Some("six"), false).unwrap();
  builder.server_dyn("10.9.0.1", 8080, "remote").unwrap();
  assert_eq!(
    builder.server_dyn("10.0.0.6", 8080, "cluster").map(|_| ()),
    Err(HeartbeatError::DuplicateServer("10.0.0.6:8080".to_string()))
  );
  assert_eq!(
    builder.server("10.0.0.7", 0, false, "cluster", None, false).map(|_| ()),
    Err(HeartbeatError::InvalidSeed(ServerId::new("10.0.0.7", 0)))
  );
  let service = builder.build().unwrap();
  let root = service.root();
  let cluster = root.cluster("cluster").unwrap();
  assert_eq!(cluster.seed_servers().len(), 2);
  assert_eq!(root.find_server_by_name("six").unwrap().port(), 8080);
  let remote = root.cluster("remote").unwrap();
  assert_eq!(remote.dynamic_servers().to_vec(), vec![ServerId::new("10.9.0.1", 8080)]);
  let ids = root.clusters().iter().map(|c| c.id().to_string()).collect::<Vec<_>>();
  assert_eq!(ids, vec!["cluster", "remote"]);
}

#[test]
fn test_builder_sets_self_identity() {
  let mut server = ServerConfig::new("10.0.0.5", 8080);
  server.hardware_address = Some(vec![0xde, 0xad, 0xbe, 0xef, 0, 1]);
  server.display_name = Some("me".to_string());
  server.port_bartender = 6700;
  let service = HeartbeatBuilder::new(server).build().unwrap();
  let me = service.root().self_server();
  assert_eq!(me.machine_hash(), "de:ad:be:ef:00:01:8080");
  assert_eq!(me.display_name(), "me");
  assert_eq!(me.port_bartender(), 6700);
}
