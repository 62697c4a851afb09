//! Heartbeat actors talking over an in-process network, with time paused so timers run instantly.

use cluster_heartbeat::heartbeat::{
  HeartbeatBuilder, HeartbeatConfig, HeartbeatHandle, HeartbeatRequest, HeartbeatService,
  ServerConfig, ServerEvent,
};
use cluster_heartbeat::testkit::{init_logging, FailureConfig, FailureConfigMap, LocalNetwork};
use cluster_heartbeat::topology::ServerId;
use cluster_heartbeat::HeartbeatError;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_test::assert_ok;

const CLUSTER: &str = "cluster";

fn addr(i: usize) -> String {
  format!("10.0.0.{}", i)
}

fn id(i: usize) -> ServerId {
  ServerId::new(&addr(i), 8080)
}

fn config() -> HeartbeatConfig {
  HeartbeatConfig {
    heartbeat_interval: Duration::from_millis(100),
    send_timeout: Duration::from_millis(200),
    join_interval: Duration::from_millis(500),
    ..HeartbeatConfig::default()
  }
}

fn node(i: usize, seeds: &[usize]) -> HeartbeatService {
  let mut builder = HeartbeatBuilder::new(ServerConfig::new(&addr(i), 8080)).config(config());
  for seed in seeds {
    builder.server(&addr(*seed), 8080, false, CLUSTER, None, false).unwrap();
  }
  builder.build().unwrap()
}

fn sees_up(handle: &HeartbeatHandle, server: usize) -> bool {
  handle.topology().server(&id(server)).map(|s| s.is_up()).unwrap_or(false)
}

async fn eventually<F: Fn() -> bool>(what: &str, done: F) {
  for _ in 0..1500 {
    if done() {
      return;
    }
    sleep(Duration::from_millis(20)).await;
  }
  panic!("timed out waiting for {}", what);
}

async fn joined(handle: &HeartbeatHandle) {
  let waited = timeout(Duration::from_secs(30), handle.wait_join_complete()).await;
  assert_ok!(assert_ok!(waited));
}

#[tokio::test(start_paused = true)]
async fn solo_node_is_its_own_hub() {
  init_logging();
  let net = LocalNetwork::new(FailureConfigMap::default());
  let solo = net.spawn(node(1, &[]));
  joined(&solo).await;
  assert_eq!(solo.join_status().remote_count, Some(0));
  assert_eq!(solo.hubs(), vec![id(1)]);
}

#[tokio::test(start_paused = true)]
async fn solo_node_seeded_with_itself() {
  init_logging();
  let net = LocalNetwork::new(FailureConfigMap::default());
  let solo = net.spawn(node(1, &[1]));
  joined(&solo).await;
  assert_eq!(solo.join_status().remote_count, Some(0));
  assert_eq!(solo.topology().self_server().seed_index(), 1);
}

#[tokio::test(start_paused = true)]
async fn mutual_seeds_converge() {
  init_logging();
  let net = LocalNetwork::new(FailureConfigMap::default());
  let a = net.spawn(node(1, &[1, 2]));
  let b = net.spawn(node(2, &[1, 2]));
  joined(&a).await;
  joined(&b).await;
  eventually("both servers up", || sees_up(&a, 2) && sees_up(&b, 1)).await;
  assert_eq!(a.hubs(), b.hubs());
  assert_eq!(a.hubs(), vec![id(1), id(2)]);
  eventually("equal racks", || {
    a.topology().self_rack().unwrap().snapshot().crc
      == b.topology().self_rack().unwrap().snapshot().crc
  })
  .await;
}

#[tokio::test(start_paused = true)]
async fn late_joiner_is_gossiped_to_the_rack() {
  init_logging();
  let net = LocalNetwork::new(FailureConfigMap::default());
  let a = net.spawn(node(1, &[1, 2]));
  let b = net.spawn(node(2, &[1, 2]));
  eventually("first pair up", || sees_up(&a, 2) && sees_up(&b, 1)).await;
  let c = net.spawn(node(3, &[1]));
  joined(&c).await;
  eventually("late joiner seen by everyone", || {
    sees_up(&a, 3) && sees_up(&b, 3) && sees_up(&c, 1) && sees_up(&c, 2)
  })
  .await;
  assert_eq!(c.hubs(), vec![id(1), id(2), id(3)]);
}

#[tokio::test(start_paused = true)]
async fn join_succeeds_with_unreachable_seeds() {
  init_logging();
  let mut failures = FailureConfigMap::default();
  for down in 1..=3 {
    failures.node_wide.insert(id(down), FailureConfig::down());
  }
  let net = LocalNetwork::new(failures);
  net.spawn(node(4, &[]));
  net.spawn(node(5, &[]));
  let joiner = net.spawn(node(9, &[1, 2, 3, 4, 5]));
  joined(&joiner).await;
  assert_eq!(joiner.join_status().remote_count, Some(2));
  eventually("reachable seeds up", || sees_up(&joiner, 4) && sees_up(&joiner, 5)).await;
  let seed = joiner.topology().server(&id(2)).unwrap();
  assert!(!seed.is_up());
  assert!(seed.connection_fail_time() > 0);
}

#[tokio::test(start_paused = true)]
async fn lossy_network_still_converges() {
  init_logging();
  let mut failures = FailureConfigMap::default();
  failures.cluster_wide.drop_prob = 0.3;
  failures.cluster_wide.delay = Some((Duration::from_millis(1), Duration::from_millis(30)));
  let net = LocalNetwork::new(failures);
  let nodes = (1..=4).map(|i| net.spawn(node(i, &[1, 2, 3, 4]))).collect::<Vec<_>>();
  eventually("full mesh up", || {
    nodes.iter().all(|n| (1..=4).all(|j| sees_up(n, j)))
  })
  .await;
  eventually("same hubs", || nodes.iter().all(|n| n.hubs() == vec![id(1), id(2), id(3)])).await;
  net.set_failures(FailureConfigMap::default());
  eventually("join complete", || nodes.iter().all(|n| n.is_join_complete())).await;
}

#[tokio::test(start_paused = true)]
async fn closed_link_marks_hub_down() {
  init_logging();
  let net = LocalNetwork::new(FailureConfigMap::default());
  let a = net.spawn(node(1, &[1, 2]));
  let b = net.spawn(node(2, &[1, 2]));
  eventually("both servers up", || sees_up(&a, 2) && sees_up(&b, 1)).await;
  let mut events = a.subscribe();
  net.kill(b.self_id());
  a.link_closed(id(2), 0);
  let down = timeout(Duration::from_secs(5), async {
    loop {
      if let Ok(ServerEvent::Down(server)) = events.recv().await {
        return server;
      }
    }
  })
  .await;
  assert_eq!(assert_ok!(down), id(2));
  assert!(!sees_up(&a, 2));
  assert_eq!(a.hubs(), vec![id(1)]);
}

#[tokio::test(start_paused = true)]
async fn closed_link_to_a_live_peer_recovers() {
  init_logging();
  let net = LocalNetwork::new(FailureConfigMap::default());
  let a = net.spawn(node(1, &[1, 2]));
  let b = net.spawn(node(2, &[1, 2]));
  eventually("both servers up", || sees_up(&a, 2) && sees_up(&b, 1)).await;
  let mut events = a.subscribe();
  a.link_closed(id(2), 0);
  let seen = timeout(Duration::from_secs(5), async {
    let mut seen = Vec::new();
    while seen.len() < 2 {
      if let Ok(event) = events.recv().await {
        seen.push(event);
      }
    }
    seen
  })
  .await;
  assert_eq!(assert_ok!(seen), vec![ServerEvent::Down(id(2)), ServerEvent::Up(id(2))]);
  eventually("hubs restored", || a.hubs() == vec![id(1), id(2)]).await;
}

#[tokio::test(start_paused = true)]
async fn stopped_actor_rejects_requests() {
  init_logging();
  let net = LocalNetwork::new(FailureConfigMap::default());
  let solo = net.spawn(node(1, &[]));
  joined(&solo).await;
  let snapshot = solo.topology().self_server().snapshot();
  assert_ok!(solo.request(HeartbeatRequest::ServerHeartbeat(snapshot.clone())).await);
  solo.stop();
  let rejected = solo.request(HeartbeatRequest::ServerHeartbeat(snapshot)).await;
  assert_eq!(rejected, Err(HeartbeatError::Stopped));
}
