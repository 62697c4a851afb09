use crate::error::{HeartbeatError, RemoteError, Result};
use crate::heartbeat::{
  hub, Command, HeartbeatReply, HeartbeatRequest, HeartbeatService, JoinRequest, JoinStatus,
  Outbound, Remote, Scheduler, ServerEvent, TimerHandle,
};
use crate::pod::PodSystemSnapshot;
use crate::topology::{RackSnapshot, Root, ServerId, ServerSnapshot};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info};
use HeartbeatMsg::*;

pub(crate) enum HeartbeatMsg {
  Request(HeartbeatRequest, oneshot::Sender<Result<HeartbeatReply>>),
  JoinReply {
    attempt: u64,
    cluster: String,
    target: ServerId,
    result: std::result::Result<HeartbeatReply, RemoteError>,
  },
  HeartbeatTimer,
  JoinTimer,
  LinkClosed(ServerId, usize),
  Stop,
}

/// Runs a [`HeartbeatService`] as a tokio task. Messages are handled one at a time; after the
/// inbox is drained the batched sends go out as spawned tasks.
pub struct HeartbeatActor {
  service: HeartbeatService,
  remote: Arc<dyn Remote>,
  scheduler: Arc<dyn Scheduler>,
  tx: UnboundedSender<HeartbeatMsg>,
  rx: UnboundedReceiver<HeartbeatMsg>,
  heartbeat_timer: Option<TimerHandle>,
  join_timer: Option<TimerHandle>,
}
impl HeartbeatActor {
  /// The handle is usable before the actor runs; requests queue up in the inbox.
  pub fn new(
    service: HeartbeatService,
    remote: Arc<dyn Remote>,
    scheduler: Arc<dyn Scheduler>,
  ) -> (HeartbeatActor, HeartbeatHandle) {
    let (tx, rx) = unbounded_channel();
    let handle = HeartbeatHandle {
      tx: tx.clone(),
      root: service.root().clone(),
      hub_count: service.config().hub_count,
      status: service.join_status(),
      events: service.event_sender(),
    };
    let actor = HeartbeatActor {
      service,
      remote,
      scheduler,
      tx,
      rx,
      heartbeat_timer: None,
      join_timer: None,
    };
    (actor, handle)
  }

  pub fn spawn(
    service: HeartbeatService,
    remote: Arc<dyn Remote>,
    scheduler: Arc<dyn Scheduler>,
  ) -> HeartbeatHandle {
    let (actor, handle) = HeartbeatActor::new(service, remote, scheduler);
    tokio::spawn(actor.run());
    handle
  }

  pub async fn run(mut self) {
    self.service.start();
    self.service.after_batch();
    self.dispatch();
    while let Some(msg) = self.rx.recv().await {
      let mut running = self.recv(msg);
      while running {
        match self.rx.try_recv() {
          Ok(msg) => running = self.recv(msg),
          Err(_) => break,
        }
      }
      if !running {
        break;
      }
      self.service.after_batch();
      self.dispatch();
    }
    for timer in self.heartbeat_timer.take().into_iter().chain(self.join_timer.take()) {
      timer.cancel();
    }
    info!(server = %self.service.root().self_id(), "heartbeat actor finished");
  }

  fn recv(&mut self, msg: HeartbeatMsg) -> bool {
    match msg {
      Request(request, reply) => {
        let _ = reply.send(self.service.handle(request));
      }
      JoinReply {
        attempt,
        cluster,
        target,
        result,
      } => self.service.on_join_reply(attempt, &cluster, &target, result),
      HeartbeatTimer => self.service.on_heartbeat_timer(),
      JoinTimer => self.service.on_join_timer(),
      LinkClosed(server, live) => {
        self.service.on_link_close(&server, live);
      }
      Stop => {
        self.service.stop();
        return false;
      }
    }
    true
  }

  fn dispatch(&mut self) {
    for command in self.service.drain_commands() {
      match command {
        Command::Send(Outbound { target, request }) => {
          let remote = self.remote.clone();
          tokio::spawn(async move {
            let method = request.method();
            if let Err(err) = remote.invoke(&target, request).await {
              debug!(%target, method, %err, "heartbeat not delivered");
            }
          });
        }
        Command::Join {
          attempt,
          cluster,
          target,
          request,
        } => {
          let remote = self.remote.clone();
          let tx = self.tx.clone();
          tokio::spawn(async move {
            let result = remote.invoke(&target, HeartbeatRequest::Join(request)).await;
            let _ = tx.send(JoinReply {
              attempt,
              cluster,
              target,
              result,
            });
          });
        }
        Command::ScheduleHeartbeat(delay) => {
          let tx = self.tx.clone();
          let task = Box::new(move || {
            let _ = tx.send(HeartbeatTimer);
          });
          self.heartbeat_timer = Some(self.scheduler.schedule_after(delay, task));
        }
        Command::ScheduleJoin(delay) => {
          let tx = self.tx.clone();
          let task = Box::new(move || {
            let _ = tx.send(JoinTimer);
          });
          self.join_timer = Some(self.scheduler.schedule_after(delay, task));
        }
      }
    }
  }
}

/// Cloneable entry point to a running [`HeartbeatActor`].
#[derive(Clone)]
pub struct HeartbeatHandle {
  tx: UnboundedSender<HeartbeatMsg>,
  root: Arc<Root>,
  hub_count: usize,
  status: watch::Receiver<JoinStatus>,
  events: broadcast::Sender<ServerEvent>,
}
impl HeartbeatHandle {
  /// Shared topology. Readers never block the actor.
  pub fn topology(&self) -> &Arc<Root> {
    &self.root
  }

  pub fn self_id(&self) -> &ServerId {
    self.root.self_id()
  }

  pub async fn request(&self, request: HeartbeatRequest) -> Result<HeartbeatReply> {
    let (reply, rx) = oneshot::channel();
    self.tx.send(Request(request, reply)).map_err(|_| HeartbeatError::Stopped)?;
    rx.await.map_err(|_| HeartbeatError::Stopped)?
  }

  pub async fn join(&self, request: JoinRequest) -> Result<Option<Arc<RackSnapshot>>> {
    match self.request(HeartbeatRequest::Join(request)).await? {
      HeartbeatReply::Joined(rack) => Ok(rack),
      HeartbeatReply::Ack => Ok(None),
    }
  }

  pub async fn server_heartbeat(&self, server: Arc<ServerSnapshot>) -> Result<()> {
    self.request(HeartbeatRequest::ServerHeartbeat(server)).await.map(|_| ())
  }

  pub async fn hub_heartbeat(
    &self,
    server: Arc<ServerSnapshot>,
    rack: Arc<RackSnapshot>,
    pods: Option<Arc<PodSystemSnapshot>>,
    sequence: u64,
  ) -> Result<()> {
    let request = HeartbeatRequest::HubHeartbeat {
      server,
      rack,
      pods,
      sequence,
    };
    self.request(request).await.map(|_| ())
  }

  pub async fn cluster_heartbeat(
    &self,
    source_cluster: &str,
    server: Arc<ServerSnapshot>,
    rack: Arc<RackSnapshot>,
    pods: Option<Arc<PodSystemSnapshot>>,
    sequence: u64,
  ) -> Result<()> {
    let request = HeartbeatRequest::ClusterHeartbeat {
      source_cluster: source_cluster.to_string(),
      server,
      rack,
      pods,
      sequence,
    };
    self.request(request).await.map(|_| ())
  }

  /// Reports the number of live links left to `server`.
  pub fn link_closed(&self, server: ServerId, live_links: usize) {
    let _ = self.tx.send(LinkClosed(server, live_links));
  }

  pub fn stop(&self) {
    let _ = self.tx.send(Stop);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
    self.events.subscribe()
  }

  pub fn join_status(&self) -> JoinStatus {
    self.status.borrow().clone()
  }

  pub fn is_join_complete(&self) -> bool {
    self.status.borrow().state.is_join_complete()
  }

  pub async fn wait_join_complete(&self) -> Result<()> {
    let mut status = self.status.clone();
    loop {
      let done = status.borrow().state.is_join_complete();
      if done {
        return Ok(());
      }
      status.changed().await.map_err(|_| HeartbeatError::Stopped)?;
    }
  }

  /// Hubs of the local rack, computed from the shared topology.
  pub fn hubs(&self) -> Vec<ServerId> {
    let rack = match self.root.self_rack() {
      Some(rack) => rack,
      None => return Vec::new(),
    };
    let is_up = |id: &ServerId| self.root.server(id).map(|s| s.is_up()).unwrap_or(false);
    hub::hubs(&rack.servers(), is_up, self.hub_count).into_vec()
  }
}
