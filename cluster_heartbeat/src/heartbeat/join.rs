use crate::topology::{is_loopback, Server};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use JoinState::*;

/// Sort key putting seeds that look like the local server first: an internal port equal to the
/// local public port, then same public port, then same address. Seeds without an internal port go
/// last.
fn start_key(me: &Server, seed: &Server) -> (i32, i32, String) {
  let bartender = seed.port_bartender();
  let bartender = if bartender == me.port() {
    0
  } else if bartender <= 0 {
    i32::MAX / 4
  } else {
    bartender
  };
  let port = if seed.port() == me.port() {
    0
  } else {
    seed.port()
  };
  let address = if seed.address() == me.address() {
    String::new()
  } else {
    seed.address().to_string()
  };
  (bartender, port, address)
}

/// Orders the seeds of a cluster for joining. Seeds without a positive port are dropped.
pub fn seed_order(me: &Server, seeds: Vec<Arc<Server>>) -> Vec<Arc<Server>> {
  let mut seeds = seeds.into_iter().filter(|s| s.port() > 0).collect::<Vec<_>>();
  seeds.sort_by_cached_key(|s| start_key(me, s));
  seeds
}

/// 1-based position of `seed` among the non-loopback seeds, 0 when it is not one of them.
pub fn seed_index(seeds: &[Arc<Server>], seed: &Server) -> i32 {
  let mut index = 0;
  for s in seeds.iter().filter(|s| !is_loopback(s.address())) {
    index += 1;
    if s.id() == seed.id() {
      return index;
    }
  }
  0
}

/// Whether a cluster's join fan-out is done.
pub fn join_complete(successes: usize, failures: usize, total: usize, threshold: usize) -> bool {
  successes >= threshold || successes + failures >= total
}

/// Replies of one cluster's seeds. Completes early once `threshold` seeds answered.
#[derive(Clone, Debug)]
pub struct JoinAggregate {
  total: usize,
  threshold: usize,
  successes: usize,
  failures: usize,
  remote: usize,
  reported: bool,
}
impl JoinAggregate {
  pub fn new(total: usize, threshold: usize) -> JoinAggregate {
    JoinAggregate {
      total,
      threshold,
      successes: 0,
      failures: 0,
      remote: 0,
      reported: false,
    }
  }

  /// `remote` is false when the seed was the local server. Returns the remote count the first
  /// time the aggregate completes.
  pub fn on_success(&mut self, remote: bool) -> Option<usize> {
    self.successes += 1;
    if remote {
      self.remote += 1;
    }
    self.report()
  }

  pub fn on_failure(&mut self) -> Option<usize> {
    self.failures += 1;
    self.report()
  }

  fn report(&mut self) -> Option<usize> {
    if self.reported || !self.is_complete() {
      return None;
    }
    self.reported = true;
    Some(self.remote)
  }

  pub fn is_complete(&self) -> bool {
    join_complete(self.successes, self.failures, self.total, self.threshold)
  }

  pub fn remote_count(&self) -> usize {
    self.remote
  }
}

/// Top-level fork over every cluster being joined. Sums the remote counts of the clusters.
#[derive(Clone, Debug)]
pub struct JoinFork {
  attempt: u64,
  pending: BTreeMap<String, JoinAggregate>,
  remote: usize,
}
impl JoinFork {
  /// Clusters without seeds contribute 0 and are not waited on.
  pub fn new(attempt: u64, clusters: Vec<(String, usize)>, threshold: usize) -> JoinFork {
    let pending = clusters
      .into_iter()
      .filter(|(_, seeds)| *seeds > 0)
      .map(|(cluster, seeds)| (cluster, JoinAggregate::new(seeds, threshold)))
      .collect();
    JoinFork {
      attempt,
      pending,
      remote: 0,
    }
  }

  pub fn attempt(&self) -> u64 {
    self.attempt
  }

  pub fn is_complete(&self) -> bool {
    self.pending.is_empty()
  }

  pub fn remote_count(&self) -> usize {
    self.remote
  }

  /// Returns the total remote count when this reply completes the fork.
  pub fn on_success(&mut self, cluster: &str, remote: bool) -> Option<usize> {
    let done = self.pending.get_mut(cluster).and_then(|agg| agg.on_success(remote));
    self.settle(cluster, done)
  }

  pub fn on_failure(&mut self, cluster: &str) -> Option<usize> {
    let done = self.pending.get_mut(cluster).and_then(|agg| agg.on_failure());
    self.settle(cluster, done)
  }

  fn settle(&mut self, cluster: &str, done: Option<usize>) -> Option<usize> {
    let count = done?;
    self.pending.remove(cluster);
    self.remote += count;
    if self.is_complete() {
      Some(self.remote)
    } else {
      None
    }
  }
}

/// Bootstrap progress. Pods start once the node is known to be alone or a hub heartbeat arrived.
#[derive(
  Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug,
)]
pub enum JoinState {
  Init,
  HeartbeatReceived,
}
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum JoinEffect {
  StartPods,
  SendHeartbeats,
}
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Transition {
  pub state: JoinState,
  pub effects: Vec<JoinEffect>,
}
impl JoinState {
  fn stay(self) -> Transition {
    Transition {
      state: self,
      effects: Vec::new(),
    }
  }

  fn received() -> Transition {
    Transition {
      state: HeartbeatReceived,
      effects: vec![JoinEffect::StartPods, JoinEffect::SendHeartbeats],
    }
  }

  /// A join fan-out finished. With no remote peer the node is alone and starts by itself.
  pub fn on_join_complete(self, remote_count: usize) -> Transition {
    match self {
      Init if remote_count == 0 => JoinState::received(),
      s => s.stay(),
    }
  }

  pub fn on_hub_heartbeat(self) -> Transition {
    match self {
      Init => JoinState::received(),
      s => s.stay(),
    }
  }

  pub fn is_join_complete(self) -> bool {
    self == HeartbeatReceived
  }
}

#[test]
fn test_join_complete_predicate() {
  assert!(!join_complete(1, 0, 5, 2));
  assert!(join_complete(2, 0, 5, 2));
  assert!(!join_complete(1, 3, 5, 2));
  assert!(join_complete(1, 4, 5, 2));
  assert!(join_complete(0, 5, 5, 2));
  assert!(join_complete(1, 0, 1, 2));
}

#[test]
fn test_aggregate_under_partial_failure() {
  let mut agg = JoinAggregate::new(5, 2);
  assert_eq!(agg.on_failure(), None);
  assert_eq!(agg.on_failure(), None);
  assert_eq!(agg.on_failure(), None);
  assert_eq!(agg.on_success(true), None);
  assert_eq!(agg.on_success(true), Some(2));
  assert_eq!(agg.on_success(true), None);
  assert_eq!(agg.remote_count(), 3);
}

#[test]
fn test_aggregate_counts_only_remote_successes() {
  let mut agg = JoinAggregate::new(3, 2);
  assert_eq!(agg.on_success(false), None);
  assert_eq!(agg.on_success(true), Some(1));
  let mut all_failed = JoinAggregate::new(2, 2);
  assert_eq!(all_failed.on_failure(), None);
  assert_eq!(all_failed.on_failure(), Some(0));
}

#[test]
fn test_fork_sums_clusters() {
  let clusters = vec![
    ("a".to_string(), 2),
    ("b".to_string(), 1),
    ("empty".to_string(), 0),
  ];
  let mut fork = JoinFork::new(1, clusters, 2);
  assert!(!fork.is_complete());
  assert_eq!(fork.on_success("a", true), None);
  assert_eq!(fork.on_failure("b"), None);
  assert_eq!(fork.on_success("a", true), Some(2));
  assert!(fork.is_complete());
  assert_eq!(fork.on_success("a", true), None);
  assert!(JoinFork::new(2, vec![("empty".to_string(), 0)], 2).is_complete());
}

#[test]
fn test_join_state_transitions() {
  let t = Init.on_join_complete(2);
  assert_eq!(t.state, Init);
  assert!(t.effects.is_empty());
  let t = Init.on_join_complete(0);
  assert_eq!(t.state, HeartbeatReceived);
  assert_eq!(t.effects, vec![JoinEffect::StartPods, JoinEffect::SendHeartbeats]);
  let t = Init.on_hub_heartbeat();
  assert!(t.state.is_join_complete());
  assert!(HeartbeatReceived.on_hub_heartbeat().effects.is_empty());
  assert!(HeartbeatReceived.on_join_complete(0).effects.is_empty());
}

#[test]
fn test_seed_order_and_index() {
  use crate::topology::Root;
  let root = Root::new("10.0.0.5", 8080, false, "cluster").unwrap();
  let me = root.self_server().clone();
  me.set_port_bartender(&root, 6700);
  let seed = |addr: &str, port: i32, bartender: i32| {
    let s = root.create_seed_server("cluster", addr, port, false).unwrap();
    s.set_port_bartender(&root, bartender);
    s
  };
  let far = seed("10.0.0.9", 9090, 6800);
  let unset = seed("10.0.0.1", 9090, 0);
  let other_host = seed("10.0.0.2", 8080, 6700);
  let same_host = seed("10.0.0.5", 8081, 6700);
  let closed = seed("10.0.0.3", 0, 6700);
  let front = seed("10.0.0.4", 9090, 8080);
  let seeds = vec![
    far.clone(),
    unset.clone(),
    other_host.clone(),
    same_host.clone(),
    closed,
    front.clone(),
  ];
  let ordered = seed_order(&me, seeds)
    .iter()
    .map(|s| s.id().clone())
    .collect::<Vec<_>>();
  assert_eq!(
    ordered,
    vec![
      front.id().clone(),
      other_host.id().clone(),
      same_host.id().clone(),
      far.id().clone(),
      unset.id().clone(),
    ]
  );
  let local = seed("127.0.0.1", 7000, 0);
  let listed = vec![local.clone(), far.clone(), unset.clone()];
  assert_eq!(seed_index(&listed, &far), 1);
  assert_eq!(seed_index(&listed, &unset), 2);
  assert_eq!(seed_index(&listed, &local), 0);
}
