use crate::topology::{Cluster, Root, ServerId};
use std::time::Duration;
use tokio::time::Instant;

/// Suppresses redundant sends to one destination. A send is due when the throttle window has
/// elapsed or the rack or pod fingerprint differs from what was last sent.
#[derive(Clone, Debug, Default)]
pub struct SendThrottle {
  last_send: Option<Instant>,
  last_rack_crc: u64,
  last_pod_crc: u64,
}
impl SendThrottle {
  pub fn new() -> SendThrottle {
    SendThrottle::default()
  }

  pub fn should_send(&self, now: Instant, timeout: Duration, rack_crc: u64, pod_crc: u64) -> bool {
    match self.last_send {
      None => true,
      Some(last) => {
        now.saturating_duration_since(last) >= timeout
          || rack_crc != self.last_rack_crc
          || pod_crc != self.last_pod_crc
      }
    }
  }

  pub fn record(&mut self, now: Instant, rack_crc: u64, pod_crc: u64) {
    self.last_send = Some(now);
    self.last_rack_crc = rack_crc;
    self.last_pod_crc = pod_crc;
  }

  /// Forces the next send.
  pub fn clear(&mut self) {
    self.last_send = None;
  }

  /// `should_send` followed by `record` when it passes.
  pub fn try_send(&mut self, now: Instant, timeout: Duration, rack_crc: u64, pod_crc: u64) -> bool {
    if self.should_send(now, timeout, rack_crc, pod_crc) {
      self.record(now, rack_crc, pod_crc);
      true
    } else {
      false
    }
  }
}

/// A foreign cluster receiving cluster heartbeats, throttled as a whole.
#[derive(Clone, Debug)]
pub struct ClusterTarget {
  cluster_id: String,
  servers: im::Vector<ServerId>,
  pub(crate) throttle: SendThrottle,
}
impl ClusterTarget {
  pub fn new(cluster_id: &str) -> ClusterTarget {
    ClusterTarget {
      cluster_id: cluster_id.to_string(),
      servers: im::Vector::new(),
      throttle: SendThrottle::new(),
    }
  }

  pub fn cluster_id(&self) -> &str {
    &self.cluster_id
  }

  /// Forces the next cluster heartbeat.
  pub fn clear(&mut self) {
    self.throttle.clear();
  }

  /// Tracks a server explicitly, on top of the per-rack representatives.
  pub fn add_server(&mut self, id: ServerId) -> bool {
    if self.servers.contains(&id) {
      return false;
    }
    self.servers.push_back(id);
    true
  }

  /// The first `per_rack` servers of every rack, then the explicitly tracked ones.
  pub fn servers(&self, root: &Root, per_rack: usize) -> Vec<ServerId> {
    let mut targets = root
      .cluster(&self.cluster_id)
      .map(|c| ClusterTarget::representatives(&c, per_rack))
      .unwrap_or_default();
    for id in &self.servers {
      if !targets.contains(id) {
        targets.push(id.clone());
      }
    }
    targets
  }

  fn representatives(cluster: &Cluster, per_rack: usize) -> Vec<ServerId> {
    cluster
      .racks()
      .iter()
      .flat_map(|rack| rack.members().into_iter().take(per_rack))
      .collect()
  }
}

#[test]
fn test_throttle_window() {
  let timeout = Duration::from_secs(15);
  let start = Instant::now();
  let mut throttle = SendThrottle::new();
  assert!(throttle.should_send(start, timeout, 1, 0));
  throttle.record(start, 1, 0);
  assert!(!throttle.should_send(start + Duration::from_secs(14), timeout, 1, 0));
  assert!(throttle.should_send(start + timeout, timeout, 1, 0));
  assert!(throttle.should_send(start, timeout, 2, 0));
  assert!(throttle.should_send(start, timeout, 1, 7));
  throttle.clear();
  assert!(throttle.should_send(start, timeout, 1, 0));
}

#[test]
fn test_try_send_records() {
  let timeout = Duration::from_secs(15);
  let now = Instant::now();
  let mut throttle = SendThrottle::new();
  assert!(throttle.try_send(now, timeout, 5, 5));
  assert!(!throttle.try_send(now, timeout, 5, 5));
  assert!(throttle.try_send(now, timeout, 6, 5));
  assert!(!throttle.try_send(now, timeout, 6, 5));
}

#[test]
fn test_cluster_target_representatives() {
  let root = Root::new("10.0.0.5", 8080, false, "local").unwrap();
  let rack = root.create_rack("remote", "a").unwrap();
  for i in 1..=5 {
    root.create_rack_server(&rack, &format!("10.1.0.{}", i), 80, false).unwrap();
  }
  let other = root.create_rack("remote", "b").unwrap();
  root.create_rack_server(&other, "10.2.0.1", 80, false).unwrap();
  let mut target = ClusterTarget::new("remote");
  let now = Instant::now();
  let timeout = Duration::from_secs(15);
  assert!(target.throttle.try_send(now, timeout, 1, 0));
  assert!(!target.throttle.should_send(now, timeout, 1, 0));
  target.clear();
  assert!(target.throttle.should_send(now, timeout, 1, 0));
  assert!(target.add_server(ServerId::new("10.1.0.5", 80)));
  assert!(!target.add_server(ServerId::new("10.1.0.5", 80)));
  let servers = target.servers(&root, 3);
  assert_eq!(
    servers,
    vec![
      ServerId::new("10.1.0.1", 80),
      ServerId::new("10.1.0.2", 80),
      ServerId::new("10.1.0.3", 80),
      ServerId::new("10.2.0.1", 80),
      ServerId::new("10.1.0.5", 80),
    ]
  );
}
