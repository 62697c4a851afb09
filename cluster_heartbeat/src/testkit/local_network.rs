use crate::error::RemoteError;
use crate::heartbeat::{
  HeartbeatActor, HeartbeatHandle, HeartbeatReply, HeartbeatRequest, HeartbeatService, Remote,
  TokioScheduler,
};
use crate::testkit::FailureConfigMap;
use crate::topology::ServerId;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// An in-process [`Remote`] connecting heartbeat actors. Every request and reply is encoded and
/// decoded as it would be on the wire, and failures are injected per destination.
pub struct LocalNetwork {
  nodes: DashMap<ServerId, HeartbeatHandle>,
  failures: RwLock<FailureConfigMap>,
  request_timeout: Duration,
}
impl LocalNetwork {
  pub fn new(failures: FailureConfigMap) -> Arc<LocalNetwork> {
    Arc::new(LocalNetwork {
      nodes: DashMap::new(),
      failures: RwLock::new(failures),
      request_timeout: Duration::from_secs(5),
    })
  }

  /// Starts an actor for `service` and makes it reachable under its server id.
  pub fn spawn(self: &Arc<Self>, service: HeartbeatService) -> HeartbeatHandle {
    let remote: Arc<dyn Remote> = self.clone();
    let (actor, handle) = HeartbeatActor::new(service, remote, Arc::new(TokioScheduler));
    self.register(handle.clone());
    tokio::spawn(actor.run());
    handle
  }

  pub fn register(&self, handle: HeartbeatHandle) {
    self.nodes.insert(handle.self_id().clone(), handle);
  }

  /// Stops the node and makes it unreachable.
  pub fn kill(&self, id: &ServerId) {
    if let Some((_, handle)) = self.nodes.remove(id) {
      handle.stop();
    }
  }

  pub fn set_failures(&self, failures: FailureConfigMap) {
    *self.failures.write() = failures;
  }

  pub fn node(&self, id: &ServerId) -> Option<HeartbeatHandle> {
    self.nodes.get(id).map(|h| h.value().clone())
  }

  fn wire<T: Serialize + DeserializeOwned>(value: &T) -> Result<T, RemoteError> {
    let bytes = serde_cbor::to_vec(value).map_err(|e| RemoteError::Rejected(e.to_string()))?;
    serde_cbor::from_slice(&bytes).map_err(|e| RemoteError::Rejected(e.to_string()))
  }
}

#[async_trait]
impl Remote for LocalNetwork {
  async fn invoke(
    &self,
    target: &ServerId,
    request: HeartbeatRequest,
  ) -> Result<HeartbeatReply, RemoteError> {
    let fail_cfg = *self.failures.read().get(target);
    if fail_cfg.down {
      return Err(RemoteError::Unreachable(target.clone()));
    }
    let request = LocalNetwork::wire(&request)?;
    if rand::random::<f64>() < fail_cfg.drop_prob {
      return Err(RemoteError::Dropped);
    }
    if let Some((min, max)) = fail_cfg.delay {
      let range = min.as_millis()..=max.as_millis();
      let dur = Duration::from_millis(SmallRng::from_entropy().gen_range(range) as u64);
      sleep(dur).await;
    }
    let handle = self.node(target).ok_or_else(|| RemoteError::Unreachable(target.clone()))?;
    let reply = timeout(self.request_timeout, handle.request(request))
      .await
      .map_err(|_| RemoteError::Timeout)?
      .map_err(|e| RemoteError::Rejected(e.to_string()))?;
    LocalNetwork::wire(&reply)
  }
}
