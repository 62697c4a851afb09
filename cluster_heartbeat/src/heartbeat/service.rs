use crate::error::{HeartbeatError, RemoteError, Result};
use crate::heartbeat::hub;
use crate::heartbeat::join::{seed_index, seed_order, JoinEffect, JoinFork, JoinState, Transition};
use crate::heartbeat::{
  ClusterTarget, HeartbeatConfig, HeartbeatReply, HeartbeatRequest, JoinRequest, Outbound,
  SendThrottle, ServerEvent,
};
use crate::pod::{PodBuilder, PodSystem, PodSystemSnapshot};
use crate::topology::{
  current_time_millis, RackSnapshot, Root, Server, ServerId, ServerSnapshot, DEFAULT_RACK,
  EXTERNAL_RACK,
};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use Command::*;

/// Work the service asks its actor to carry out.
#[derive(Clone, Debug)]
pub enum Command {
  Send(Outbound),
  Join {
    attempt: u64,
    cluster: String,
    target: ServerId,
    request: JoinRequest,
  },
  ScheduleHeartbeat(Duration),
  ScheduleJoin(Duration),
}

/// Lifecycle of the heartbeat and join loops. Timers only re-arm while active.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Lifecycle {
  Init,
  Active,
  Destroyed,
}
impl Lifecycle {
  fn to_active(&mut self) -> bool {
    if *self == Lifecycle::Init {
      *self = Lifecycle::Active;
      true
    } else {
      false
    }
  }

  fn to_destroyed(&mut self) -> bool {
    let changed = *self != Lifecycle::Destroyed;
    *self = Lifecycle::Destroyed;
    changed
  }

  pub fn is_active(self) -> bool {
    self == Lifecycle::Active
  }
}

/// Published after every join state change or completed join fan-out.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct JoinStatus {
  pub state: JoinState,
  /// Remote seeds that answered the last completed join.
  pub remote_count: Option<usize>,
  pub attempts: u64,
}

/// State of the heartbeat actor. Handlers run one at a time; sends are batched and produced by
/// [`after_batch`](HeartbeatService::after_batch).
pub struct HeartbeatService {
  root: Arc<Root>,
  config: HeartbeatConfig,
  pod_builder: PodBuilder,
  pods: PodSystem,
  targets: BTreeMap<ServerId, SendThrottle>,
  cluster_targets: BTreeMap<String, ClusterTarget>,
  join_state: JoinState,
  lifecycle: Lifecycle,
  join_lifecycle: Lifecycle,
  send_required: bool,
  last_join: Option<Instant>,
  attempt: u64,
  forks: BTreeMap<u64, JoinFork>,
  commands: Vec<Command>,
  events: broadcast::Sender<ServerEvent>,
  status: watch::Sender<JoinStatus>,
  last_status: JoinStatus,
}
impl HeartbeatService {
  pub fn new(root: Arc<Root>, config: HeartbeatConfig, pod_builder: PodBuilder) -> Self {
    let last_status = JoinStatus {
      state: JoinState::Init,
      remote_count: None,
      attempts: 0,
    };
    let (events, _) = broadcast::channel(256);
    let (status, _) = watch::channel(last_status.clone());
    HeartbeatService {
      root,
      config,
      pod_builder,
      pods: PodSystem::new(),
      targets: BTreeMap::new(),
      cluster_targets: BTreeMap::new(),
      join_state: JoinState::Init,
      lifecycle: Lifecycle::Init,
      join_lifecycle: Lifecycle::Init,
      send_required: false,
      last_join: None,
      attempt: 0,
      forks: BTreeMap::new(),
      commands: Vec::new(),
      events,
      status,
      last_status,
    }
  }

  pub fn root(&self) -> &Arc<Root> {
    &self.root
  }

  pub fn config(&self) -> &HeartbeatConfig {
    &self.config
  }

  pub fn pods(&self) -> &PodSystem {
    &self.pods
  }

  pub fn join_state(&self) -> JoinState {
    self.join_state
  }

  pub fn is_join_complete(&self) -> bool {
    self.join_state.is_join_complete()
  }

  pub fn lifecycle(&self) -> Lifecycle {
    self.lifecycle
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
    self.events.subscribe()
  }

  pub(crate) fn event_sender(&self) -> broadcast::Sender<ServerEvent> {
    self.events.clone()
  }

  pub fn join_status(&self) -> watch::Receiver<JoinStatus> {
    self.status.subscribe()
  }

  pub fn drain_commands(&mut self) -> Vec<Command> {
    std::mem::take(&mut self.commands)
  }

  /// Hubs of the local rack.
  pub fn hubs(&self) -> SmallVec<[ServerId; 3]> {
    match self.root.self_rack() {
      Some(rack) => hub::hubs(&rack.servers(), |id| self.is_up(id), self.config.hub_count),
      None => SmallVec::new(),
    }
  }

  /// Whether `id` is a hub of its own rack.
  pub fn is_hub(&self, id: &ServerId) -> bool {
    let rack = self.root.server(id).and_then(|s| s.rack()).and_then(|key| self.root.rack(&key));
    match rack {
      Some(rack) => hub::is_hub(&rack.servers(), |id| self.is_up(id), self.config.hub_count, id),
      None => false,
    }
  }

  fn is_up(&self, id: &ServerId) -> bool {
    self.root.server(id).map(|s| s.is_up()).unwrap_or(false)
  }

  pub fn start(&mut self) {
    if !self.lifecycle.to_active() {
      return;
    }
    let root = self.root.clone();
    root.self_server().on_heartbeat_start(&root);
    info!(server = %root.self_id(), "heartbeat started");
    self.commands.push(ScheduleHeartbeat(self.config.heartbeat_interval));
    self.start_join();
    self.update_heartbeats();
  }

  pub fn stop(&mut self) {
    let stopped = self.lifecycle.to_destroyed();
    self.join_lifecycle.to_destroyed();
    if stopped {
      info!(server = %self.root.self_id(), "heartbeat stopped");
    }
  }

  /// Dispatches an incoming request to its handler.
  pub fn handle(&mut self, request: HeartbeatRequest) -> Result<HeartbeatReply> {
    if self.lifecycle == Lifecycle::Destroyed {
      return Err(HeartbeatError::Stopped);
    }
    match request {
      HeartbeatRequest::Join(req) => self.join(&req).map(HeartbeatReply::Joined),
      HeartbeatRequest::ServerHeartbeat(server) => {
        self.server_heartbeat(&server)?;
        Ok(HeartbeatReply::Ack)
      }
      HeartbeatRequest::HubHeartbeat {
        server,
        rack,
        pods,
        sequence,
      } => {
        self.hub_heartbeat(&server, &rack, pods.as_deref(), sequence)?;
        Ok(HeartbeatReply::Ack)
      }
      HeartbeatRequest::ClusterHeartbeat {
        source_cluster,
        server,
        rack,
        pods,
        sequence,
      } => {
        self.cluster_heartbeat(&source_cluster, &server, &rack, pods.as_deref(), sequence)?;
        Ok(HeartbeatReply::Ack)
      }
    }
  }

  /// A server asks to join through this seed. Returns the rack snapshot the joining server should
  /// start from, or `None` when the joining server is this one.
  pub fn join(&mut self, req: &JoinRequest) -> Result<Option<Arc<RackSnapshot>>> {
    let root = self.root.clone();
    let me = root.self_server().clone();
    let cluster = root.create_cluster(&req.cluster_id)?;
    let own = cluster.id() == me.cluster_id();
    let server = root.create_dynamic_server(cluster.id(), &req.address, req.port, false)?;
    let server = match server.rack() {
      Some(_) => server,
      None => {
        let rack_id = if own { DEFAULT_RACK } else { EXTERNAL_RACK };
        let rack = root.create_rack(cluster.id(), rack_id)?;
        root.create_rack_server(&rack, &req.address, req.port, false)?
      }
    };
    if server.is_self() {
      server.to_known(&root);
    } else if server.on_heartbeat_start(&root) {
      self.on_server_start(&server);
    }
    if !own {
      self.cluster_target(cluster.id()).add_server(server.id().clone());
    }
    if !req.ext_address.is_empty() {
      me.set_seed_index(&root, req.seed_index);
      me.set_last_seed_time(current_time_millis());
    }
    let reply = if server.is_self() {
      self.join_self(&me, req)?;
      None
    } else {
      server.set_port_bartender(&root, req.port_bartender);
      server.set_display_name(&root, &req.display_name);
      server.set_machine_hash(&root, &req.machine_hash);
      let rack = if server.cluster_id() == me.cluster_id() {
        server.rack()
      } else {
        me.rack()
      };
      rack.and_then(|key| root.rack(&key)).map(|rack| rack.snapshot())
    };
    server.clear_connection_fail_time();
    debug!(server = %server.id(), cluster = cluster.id(), "join request");
    self.update_heartbeats();
    Ok(reply)
  }

  /// The join request reached this server itself: check that it really is this process and bind
  /// the address the seed was configured with as an alias of this server.
  fn join_self(&mut self, me: &Arc<Server>, req: &JoinRequest) -> Result<()> {
    let root = self.root.clone();
    if req.machine_hash != me.machine_hash() {
      error!(server = %me.id(), remote = %req.machine_hash, "machine hash conflict on join");
      return Err(HeartbeatError::IdentityConflict {
        server: me.id().clone(),
        reason: format!("machine hash {:?} != {:?}", req.machine_hash, me.machine_hash()),
      });
    }
    if req.port_bartender != me.port_bartender() {
      error!(server = %me.id(), remote = req.port_bartender, "internal port conflict on join");
      return Err(HeartbeatError::IdentityConflict {
        server: me.id().clone(),
        reason: format!("internal port {} != {}", req.port_bartender, me.port_bartender()),
      });
    }
    if !req.ext_address.is_empty() {
      let ext = root.create_server(&req.ext_address, req.ext_port, false, me.cluster_id())?;
      if ext.id() != me.id() {
        ext.set_delegate(me);
        me.set_external(&root, Some(ext.id().clone()));
      }
    }
    me.on_heartbeat_start(&root);
    Ok(())
  }

  /// Spoke heartbeat: the sender's own snapshot.
  pub fn server_heartbeat(&mut self, update: &ServerSnapshot) -> Result<()> {
    let root = self.root.clone();
    let server = self.update_server_start(update)?;
    if server.rack().is_none() && server.cluster_id() == root.self_server().cluster_id() {
      if let Some(rack) = root.self_rack() {
        root.add_to_rack(&rack, &server);
      }
    }
    self.update_heartbeats();
    Ok(())
  }

  pub fn hub_heartbeat(
    &mut self,
    server: &ServerSnapshot,
    rack: &RackSnapshot,
    pods: Option<&PodSystemSnapshot>,
    sequence: u64,
  ) -> Result<()> {
    self.root.observe_sequence(sequence);
    self.update_rack(rack)?;
    self.update_server_start(server)?;
    if let Some(pods) = pods {
      self.update_pod_system(pods);
    }
    let transition = self.join_state.on_hub_heartbeat();
    self.apply(transition);
    self.update_heartbeats();
    Ok(())
  }

  pub fn cluster_heartbeat(
    &mut self,
    source_cluster: &str,
    server: &ServerSnapshot,
    rack: &RackSnapshot,
    pods: Option<&PodSystemSnapshot>,
    sequence: u64,
  ) -> Result<()> {
    let root = self.root.clone();
    root.observe_sequence(sequence);
    let cluster = root.create_cluster(source_cluster)?;
    let sender = root.create_server(&server.address, server.port, server.ssl, cluster.id())?;
    self.report_server(&sender, server);
    if cluster.id() != root.self_server().cluster_id() {
      self.cluster_target(cluster.id()).add_server(sender.id().clone());
    }
    self.update_rack(rack)?;
    if let Some(pods) = pods {
      self.update_pod_system(pods);
    }
    self.update_heartbeats();
    Ok(())
  }

  fn update_server_start(&mut self, update: &ServerSnapshot) -> Result<Arc<Server>> {
    let root = self.root.clone();
    let cluster_id = if update.cluster_id.is_empty() {
      root.self_server().cluster_id().to_string()
    } else {
      update.cluster_id.clone()
    };
    let server = root.create_server(&update.address, update.port, update.ssl, &cluster_id)?;
    self.report_server(&server, update);
    Ok(server)
  }

  /// The server sent its own snapshot, so it is alive whatever the gossip says.
  fn report_server(&mut self, server: &Arc<Server>, update: &ServerSnapshot) {
    if server.on_heartbeat_report(&self.root, update) {
      self.on_server_start(server);
    }
  }

  /// Applies a gossiped rack. Racks of foreign clusters are merged into their `external` rack.
  pub fn update_rack(&mut self, update: &RackSnapshot) -> Result<()> {
    let root = self.root.clone();
    let cluster = match root.cluster(&update.cluster_id) {
      Some(cluster) => cluster,
      None if update.cluster_id.is_empty() => return Ok(()),
      None => root.create_cluster(&update.cluster_id)?,
    };
    let rack = if cluster.id() == root.self_server().cluster_id() {
      cluster.create_rack(&update.rack_id)
    } else {
      self.cluster_target(cluster.id());
      cluster.create_rack(EXTERNAL_RACK)
    };
    for member in update.members() {
      if let Some(server) = root.merge_rack_member(&rack, member)? {
        self.update_server(&server, member);
      }
    }
    Ok(())
  }

  fn update_server(&mut self, server: &Arc<Server>, update: &ServerSnapshot) {
    if server.is_self() {
      return;
    }
    if server.on_heartbeat_update(&self.root, update) {
      if server.is_up() {
        self.on_server_start(server);
      } else {
        self.on_server_stop(server);
      }
    }
  }

  fn update_pod_system(&mut self, pods: &PodSystemSnapshot) {
    if self.pods.update_pod_system(&self.root, pods) {
      trace!(crc = self.pods.snapshot().crc, "pods updated");
    }
  }

  fn on_server_start(&mut self, server: &Server) {
    debug!(server = %server.id(), "server up");
    let _ = self.events.send(ServerEvent::Up(server.id().clone()));
    self.targets.entry(server.id().clone()).or_default().clear();
    if let Some(target) = self.cluster_targets.get_mut(server.cluster_id()) {
      target.clear();
    }
    self.update_heartbeats();
  }

  fn on_server_stop(&mut self, server: &Server) {
    debug!(server = %server.id(), "server down");
    let _ = self.events.send(ServerEvent::Down(server.id().clone()));
    self.update_heartbeats();
  }

  /// The transport reports a closed link. The server is marked down once no link is left, and
  /// only when either side is a hub. Returns whether the server went down.
  pub fn on_link_close(&mut self, id: &ServerId, live_links: usize) -> bool {
    if live_links > 0 {
      return false;
    }
    let server = match self.root.server(id) {
      Some(server) if !server.is_self() => server,
      _ => return false,
    };
    if !self.is_hub(id) && !self.is_hub(self.root.self_id()) {
      trace!(server = %id, "link closed between spokes");
      return false;
    }
    if server.on_heartbeat_stop(&self.root) {
      self.on_server_stop(&server);
      true
    } else {
      false
    }
  }

  pub fn on_heartbeat_timer(&mut self) {
    if !self.lifecycle.is_active() {
      return;
    }
    self.update_heartbeats();
    self.commands.push(ScheduleHeartbeat(self.config.heartbeat_interval));
  }

  pub fn on_join_timer(&mut self) {
    if !self.join_lifecycle.is_active() {
      return;
    }
    if self.is_join_required() {
      self.start_join();
    }
    self.commands.push(ScheduleJoin(self.config.join_interval));
  }

  /// Rejoin while within `join_full_time` of the last join, or when the local cluster has seeds
  /// and none of them is up.
  pub fn is_join_required(&self) -> bool {
    let recent = self
      .last_join
      .map(|at| at.elapsed() <= self.config.join_full_time)
      .unwrap_or(true);
    recent || !self.is_seed_heartbeat_valid()
  }

  /// Whether some seed of the local cluster, this server included, is up. A cluster without
  /// listening seeds needs none.
  fn is_seed_heartbeat_valid(&self) -> bool {
    let root = &self.root;
    let cluster = match root.cluster(root.self_server().cluster_id()) {
      Some(cluster) => cluster,
      None => return true,
    };
    let seeds = cluster
      .seed_servers()
      .iter()
      .filter_map(|id| root.server(id))
      .filter(|seed| seed.port() > 0)
      .collect::<Vec<_>>();
    seeds.is_empty() || seeds.iter().any(|seed| seed.is_up())
  }

  /// Fans a join request out to every seed of every cluster.
  pub fn start_join(&mut self) {
    let root = self.root.clone();
    let me = root.self_server().clone();
    self.attempt += 1;
    self.last_join = Some(Instant::now());
    let attempt = self.attempt;
    let mut clusters = Vec::new();
    let mut calls = Vec::new();
    for cluster in root.clusters() {
      let configured = cluster
        .seed_servers()
        .iter()
        .filter_map(|id| root.server(id))
        .collect::<Vec<_>>();
      let seeds = seed_order(&me, configured.clone());
      clusters.push((cluster.id().to_string(), seeds.len()));
      for seed in &seeds {
        calls.push(Join {
          attempt,
          cluster: cluster.id().to_string(),
          target: seed.id().clone(),
          request: JoinRequest {
            ext_address: seed.address().to_string(),
            ext_port: seed.port(),
            cluster_id: me.cluster_id().to_string(),
            address: me.address().to_string(),
            port: me.port(),
            port_bartender: me.port_bartender(),
            display_name: me.display_name(),
            machine_hash: me.machine_hash(),
            seed_index: seed_index(&configured, seed),
          },
        });
      }
    }
    let fork = JoinFork::new(attempt, clusters, self.config.join_success_threshold);
    info!(server = %me.id(), attempt, seeds = calls.len(), "join started");
    self.last_status.attempts = attempt;
    if fork.is_complete() {
      self.on_join_complete(0);
    } else {
      self.forks.insert(attempt, fork);
      self.commands.extend(calls);
    }
  }

  /// Reply (or failure) of one seed. Late replies still update the topology. Every reply carrying a
  /// rack counts as remote; the local server answers itself with none.
  pub fn on_join_reply(
    &mut self,
    attempt: u64,
    cluster: &str,
    target: &ServerId,
    result: std::result::Result<HeartbeatReply, RemoteError>,
  ) {
    let outcome = match result {
      Ok(HeartbeatReply::Joined(rack)) => {
        if let Some(rack) = &rack {
          if let Err(err) = self.update_rack(rack) {
            warn!(seed = %target, %err, "join reply rejected");
          }
        }
        self.update_heartbeats();
        Some(rack.is_some())
      }
      Ok(HeartbeatReply::Ack) => Some(false),
      Err(err) => {
        debug!(seed = %target, %err, "join failed");
        if let Some(server) = self.root.server(target) {
          server.on_connection_fail(current_time_millis());
        }
        None
      }
    };
    let done = match self.forks.get_mut(&attempt) {
      Some(fork) => match outcome {
        Some(remote) => fork.on_success(cluster, remote),
        None => fork.on_failure(cluster),
      },
      None => None,
    };
    if let Some(count) = done {
      self.forks.remove(&attempt);
      self.on_join_complete(count);
    }
  }

  fn on_join_complete(&mut self, remote_count: usize) {
    info!(server = %self.root.self_id(), remote = remote_count, "join complete");
    self.last_status.remote_count = Some(remote_count);
    let transition = self.join_state.on_join_complete(remote_count);
    self.apply(transition);
    if self.lifecycle.is_active() && self.join_lifecycle.to_active() {
      self.commands.push(ScheduleJoin(self.config.join_interval));
    }
  }

  fn apply(&mut self, transition: Transition) {
    if transition.state != self.join_state {
      info!(from = ?self.join_state, to = ?transition.state, "join state");
      self.join_state = transition.state;
    }
    for effect in transition.effects {
      match effect {
        JoinEffect::StartPods => self.start_pods(),
        JoinEffect::SendHeartbeats => self.update_heartbeats(),
      }
    }
    self.last_status.state = self.join_state;
    self.status.send_replace(self.last_status.clone());
  }

  fn start_pods(&mut self) {
    let sequence = self.root.update_sequence();
    match self.pod_builder.build(&self.root, sequence) {
      Ok(pods) => self.pods.start(pods),
      Err(err) => error!(%err, "pods not started"),
    }
  }

  fn update_heartbeats(&mut self) {
    self.send_required = true;
  }

  fn cluster_target(&mut self, cluster_id: &str) -> &mut ClusterTarget {
    self
      .cluster_targets
      .entry(cluster_id.to_string())
      .or_insert_with(|| ClusterTarget::new(cluster_id))
  }

  /// Sends whatever the handled batch made necessary: hubs gossip the rack to its members and to
  /// foreign clusters, spokes report themselves to their hubs.
  pub fn after_batch(&mut self) {
    if !self.send_required || !self.lifecycle.is_active() {
      return;
    }
    self.send_required = false;
    if self.is_join_complete() {
      self.pods.fill_slots(&self.root);
    }
    if self.is_hub(self.root.self_id()) {
      self.send_hub_heartbeats();
      self.send_cluster_heartbeats();
    } else {
      self.send_spoke_heartbeats();
    }
  }

  fn pod_update(&self) -> Option<Arc<PodSystemSnapshot>> {
    if self.is_join_complete() && self.pods.is_started() {
      Some(self.pods.snapshot())
    } else {
      None
    }
  }

  fn send_hub_heartbeats(&mut self) {
    let root = self.root.clone();
    let rack = match root.self_rack() {
      Some(rack) => rack,
      None => return,
    };
    let server = root.self_server().snapshot();
    let snapshot = rack.snapshot();
    let pods = self.pod_update();
    let pod_crc = pods.as_ref().map(|p| p.crc).unwrap_or(0);
    let now = Instant::now();
    let timeout = self.config.send_timeout;
    for id in rack.members() {
      if root.server(&id).map(|s| s.is_self()).unwrap_or(true) {
        continue;
      }
      let throttle = self.targets.entry(id.clone()).or_default();
      if !throttle.try_send(now, timeout, snapshot.crc, pod_crc) {
        trace!(target = %id, "hub heartbeat throttled");
        continue;
      }
      self.commands.push(Send(Outbound {
        target: id,
        request: HeartbeatRequest::HubHeartbeat {
          server: server.clone(),
          rack: snapshot.clone(),
          pods: pods.clone(),
          sequence: root.sequence(),
        },
      }));
    }
  }

  fn send_cluster_heartbeats(&mut self) {
    let root = self.root.clone();
    let rack = match root.self_rack() {
      Some(rack) => rack,
      None => return,
    };
    let me = root.self_server();
    let server = me.snapshot();
    let snapshot = rack.snapshot();
    let pods = self.pod_update();
    let pod_crc = pods.as_ref().map(|p| p.crc).unwrap_or(0);
    let now = Instant::now();
    let timeout = self.config.send_timeout;
    let per_rack = self.config.cluster_representatives;
    let mut sends = Vec::new();
    for target in self.cluster_targets.values_mut() {
      let servers = target.servers(&root, per_rack);
      if servers.is_empty() {
        continue;
      }
      if !target.throttle.try_send(now, timeout, snapshot.crc, pod_crc) {
        trace!(cluster = target.cluster_id(), "cluster heartbeat throttled");
        continue;
      }
      for id in servers {
        sends.push(Send(Outbound {
          target: id,
          request: HeartbeatRequest::ClusterHeartbeat {
            source_cluster: me.cluster_id().to_string(),
            server: server.clone(),
            rack: snapshot.clone(),
            pods: pods.clone(),
            sequence: root.sequence(),
          },
        }));
      }
    }
    self.commands.extend(sends);
  }

  fn send_spoke_heartbeats(&mut self) {
    let me = self.root.self_server().snapshot();
    for hub in self.hubs() {
      if &hub == self.root.self_id() {
        continue;
      }
      self.commands.push(Send(Outbound {
        target: hub,
        request: HeartbeatRequest::ServerHeartbeat(me.clone()),
      }));
    }
  }
}
