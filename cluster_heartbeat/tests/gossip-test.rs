//! Drives heartbeat services by hand, delivering every request synchronously, so the protocol can
//! be checked step by step without timers.

use cluster_heartbeat::heartbeat::{
  Command, HeartbeatBuilder, HeartbeatConfig, HeartbeatReply, HeartbeatRequest, HeartbeatService,
  ServerConfig, ServerEvent,
};
use cluster_heartbeat::topology::{RackSnapshot, ServerId, ServerState};
use cluster_heartbeat::RemoteError;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

const CLUSTER: &str = "cluster";

fn addr(i: usize) -> String {
  format!("10.0.0.{}", i)
}

fn id(i: usize) -> ServerId {
  ServerId::new(&addr(i), 8080)
}

fn node(i: usize, seeds: &[usize]) -> HeartbeatService {
  let mut builder = HeartbeatBuilder::new(ServerConfig::new(&addr(i), 8080));
  for seed in seeds {
    builder.server(&addr(*seed), 8080, false, CLUSTER, None, false).unwrap();
  }
  builder.build().unwrap()
}

/// Gossip a service would send right now, as (target, method).
fn sends(service: &mut HeartbeatService) -> Vec<(ServerId, &'static str)> {
  service.after_batch();
  service
    .drain_commands()
    .into_iter()
    .filter_map(|c| match c {
      Command::Send(out) => Some((out.target, out.request.method())),
      _ => None,
    })
    .collect()
}

#[derive(Default)]
struct Net {
  nodes: BTreeMap<ServerId, HeartbeatService>,
  /// Hub and cluster heartbeats delivered, by (source, target).
  sent: BTreeMap<(ServerId, ServerId), usize>,
}
impl Net {
  fn add(&mut self, service: HeartbeatService) {
    self.nodes.insert(service.root().self_id().clone(), service);
  }

  fn get(&self, i: usize) -> &HeartbeatService {
    &self.nodes[&id(i)]
  }

  fn get_mut(&mut self, i: usize) -> &mut HeartbeatService {
    self.nodes.get_mut(&id(i)).unwrap()
  }

  fn start(&mut self) {
    for service in self.nodes.values_mut() {
      service.start();
    }
  }

  /// Delivers requests until nobody has anything left to send. Returns the number of gossip
  /// requests delivered.
  fn pump(&mut self) -> usize {
    let mut delivered = 0;
    for _ in 0..64 {
      let mut pending = Vec::new();
      for (source, service) in self.nodes.iter_mut() {
        service.after_batch();
        for command in service.drain_commands() {
          pending.push((source.clone(), command));
        }
      }
      let mut any = false;
      for (source, command) in pending {
        match command {
          Command::Send(out) => {
            any = true;
            delivered += 1;
            *self.sent.entry((source, out.target.clone())).or_default() += 1;
            if let Some(target) = self.nodes.get_mut(&out.target) {
              let _ = target.handle(out.request);
            }
          }
          Command::Join {
            attempt,
            cluster,
            target,
            request,
          } => {
            any = true;
            let result = match self.nodes.get_mut(&target) {
              Some(node) => node
                .handle(HeartbeatRequest::Join(request))
                .map_err(|e| RemoteError::Rejected(e.to_string())),
              None => Err(RemoteError::Unreachable(target.clone())),
            };
            if let Some(node) = self.nodes.get_mut(&source) {
              node.on_join_reply(attempt, &cluster, &target, result);
            }
          }
          Command::ScheduleHeartbeat(_) | Command::ScheduleJoin(_) => {}
        }
      }
      if !any {
        return delivered;
      }
    }
    panic!("gossip did not settle");
  }

  fn sent_between(&self, source: usize, target: usize) -> usize {
    self.sent.get(&(id(source), id(target))).copied().unwrap_or(0)
  }

  fn state_seen_by(&self, observer: usize, server: usize) -> ServerState {
    self.get(observer).root().server(&id(server)).map(|s| s.state()).unwrap_or(ServerState::Unknown)
  }
}

#[test]
fn solo_node_joins_alone_and_elects_itself() {
  let mut net = Net::default();
  net.add(node(1, &[]));
  net.start();
  net.pump();
  let solo = net.get(1);
  assert!(solo.is_join_complete());
  assert_eq!(solo.hubs().to_vec(), vec![id(1)]);
  assert!(solo.pods().is_started());
  assert!(solo.pods().pod("local.cluster").is_some());
}

#[test]
fn self_seed_counts_as_a_local_success() {
  let mut net = Net::default();
  net.add(node(1, &[1]));
  net.start();
  assert!(!net.get(1).is_join_complete());
  net.pump();
  let status = net.get(1).join_status().borrow().clone();
  assert_eq!(status.remote_count, Some(0));
  assert!(net.get(1).is_join_complete());
  assert_eq!(net.get(1).root().self_server().seed_index(), 1);
}

#[test]
fn two_nodes_with_mutual_seeds_converge() {
  let mut net = Net::default();
  net.add(node(1, &[1, 2]));
  net.add(node(2, &[1, 2]));
  let mut events = net.get(1).subscribe();
  net.start();
  net.pump();
  assert_eq!(net.state_seen_by(1, 2), ServerState::Up);
  assert_eq!(net.state_seen_by(2, 1), ServerState::Up);
  assert_eq!(net.get(1).hubs(), net.get(2).hubs());
  assert_eq!(net.get(1).hubs().to_vec(), vec![id(1), id(2)]);
  assert!(net.get(1).is_join_complete());
  assert!(net.get(2).is_join_complete());
  assert_eq!(events.try_recv(), Ok(ServerEvent::Up(id(2))));
  assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
}

#[test]
fn rack_crc_is_identical_once_views_agree() {
  let mut net = Net::default();
  for i in 1..=3 {
    net.add(node(i, &[1, 2, 3]));
  }
  net.start();
  net.pump();
  let crcs = (1..=3)
    .map(|i| net.get(i).root().self_rack().unwrap().snapshot().crc)
    .collect_vec();
  assert!(crcs.iter().all_equal(), "{:?}", crcs);
  net.get_mut(1).on_heartbeat_timer();
  net.pump();
  let again = (1..=3)
    .map(|i| net.get(i).root().self_rack().unwrap().snapshot().crc)
    .collect_vec();
  assert_eq!(crcs, again);
}

#[test]
fn hubs_agree_across_the_rack() {
  let mut net = Net::default();
  let all = [1, 2, 3, 4, 5];
  for i in all.iter() {
    net.add(node(*i, &all));
  }
  net.start();
  net.pump();
  for i in all.iter() {
    assert_eq!(net.get(*i).hubs().to_vec(), vec![id(1), id(2), id(3)], "node {}", i);
    for j in all.iter() {
      assert_eq!(net.state_seen_by(*i, *j), ServerState::Up, "{} sees {}", i, j);
    }
  }
  assert!(net.get(4).hubs().iter().all(|h| h != &id(4)));
}

#[test]
fn spokes_only_report_to_hubs() {
  let mut net = Net::default();
  let all = [1, 2, 3, 4];
  for i in all.iter() {
    net.add(node(*i, &all));
  }
  net.start();
  net.pump();
  net.get_mut(4).on_heartbeat_timer();
  net.get_mut(4).after_batch();
  let sends = net
    .get_mut(4)
    .drain_commands()
    .into_iter()
    .filter_map(|c| match c {
      Command::Send(out) => Some((out.target, out.request.method())),
      _ => None,
    })
    .collect_vec();
  assert_eq!(
    sends,
    vec![
      (id(1), "serverHeartbeat"),
      (id(2), "serverHeartbeat"),
      (id(3), "serverHeartbeat"),
    ]
  );
}

#[test]
fn unchanged_rack_is_not_resent_within_the_window() {
  let mut net = Net::default();
  net.add(node(1, &[1, 2]));
  net.add(node(2, &[1, 2]));
  net.start();
  net.pump();
  net.sent.clear();

  net.get_mut(1).on_heartbeat_timer();
  net.pump();
  net.get_mut(1).on_heartbeat_timer();
  net.pump();
  assert_eq!(net.sent_between(1, 2), 0);

  let renamed = {
    let b = net.get(2).root().clone();
    b.self_server().set_display_name(&b, "renamed");
    b.self_server().snapshot()
  };
  net.get_mut(1).server_heartbeat(&renamed).unwrap();
  net.get_mut(1).after_batch();
  let to_two = net
    .get_mut(1)
    .drain_commands()
    .into_iter()
    .filter(|c| matches!(c, Command::Send(out) if out.target == id(2)))
    .count();
  assert_eq!(to_two, 1);

  net.get_mut(1).on_heartbeat_timer();
  net.get_mut(1).after_batch();
  let to_two = net
    .get_mut(1)
    .drain_commands()
    .into_iter()
    .filter(|c| matches!(c, Command::Send(out) if out.target == id(2)))
    .count();
  assert_eq!(to_two, 0);
}

#[test]
fn join_completes_when_some_seeds_fail() {
  let mut net = Net::default();
  net.add(node(9, &[1, 2, 3, 4, 5]));
  net.add(node(4, &[]));
  net.add(node(5, &[]));
  net.start();
  net.pump();
  let status = net.get(9).join_status().borrow().clone();
  assert_eq!(status.remote_count, Some(2));
  assert!(net.get(9).is_join_complete());
  assert_eq!(net.state_seen_by(9, 4), ServerState::Up);
  assert_eq!(net.state_seen_by(9, 1), ServerState::Unknown);
  assert!(net.get(9).root().server(&id(1)).unwrap().connection_fail_time() > 0);
}

#[test]
fn join_reply_carries_the_seed_rack() {
  let mut seed = node(1, &[]);
  seed.start();
  let mut joiner = node(2, &[1]);
  joiner.start();
  let request = joiner
    .drain_commands()
    .into_iter()
    .find_map(|c| match c {
      Command::Join { request, .. } => Some(request),
      _ => None,
    })
    .unwrap();
  assert_eq!(request.ext_address, addr(1));
  assert_eq!(request.seed_index, 1);
  let reply = seed.handle(HeartbeatRequest::Join(request)).unwrap();
  let rack = match reply {
    HeartbeatReply::Joined(Some(rack)) => rack,
    other => panic!("unexpected reply {:?}", other),
  };
  let members = rack.members().map(|s| s.id()).collect_vec();
  assert_eq!(members, vec![id(1), id(2)]);
  assert_eq!(seed.root().server(&id(2)).unwrap().state(), ServerState::Up);
  assert_eq!(seed.root().self_server().seed_index(), 1);
}

#[test]
fn join_with_a_foreign_identity_is_rejected() {
  let mut server = ServerConfig::new(&addr(1), 8080);
  server.hardware_address = Some(vec![1, 2, 3, 4, 5, 6]);
  let mut seed = HeartbeatBuilder::new(server).build().unwrap();
  seed.start();
  let mut impostor = node(1, &[1]);
  impostor.start();
  let request = impostor
    .drain_commands()
    .into_iter()
    .find_map(|c| match c {
      Command::Join { request, .. } => Some(request),
      _ => None,
    })
    .unwrap();
  let err = seed.handle(HeartbeatRequest::Join(request)).unwrap_err();
  assert!(err.to_string().contains("identity conflict"), "{}", err);
}

#[test]
fn link_close_downs_a_hub_only_without_live_links() {
  let mut net = Net::default();
  net.add(node(1, &[1, 2]));
  net.add(node(2, &[1, 2]));
  net.start();
  net.pump();
  let mut events = net.get(1).subscribe();
  assert!(!net.get_mut(1).on_link_close(&id(2), 1));
  assert!(net.get_mut(1).on_link_close(&id(2), 0));
  assert_eq!(net.state_seen_by(1, 2), ServerState::Down);
  assert_eq!(events.try_recv(), Ok(ServerEvent::Down(id(2))));
  assert_eq!(net.get(1).hubs().to_vec(), vec![id(1)]);
  assert!(!net.get_mut(1).on_link_close(&id(2), 0));
}

#[test]
fn down_server_recovers_on_rejoin() {
  let mut net = Net::default();
  net.add(node(1, &[1, 2]));
  net.add(node(2, &[1, 2]));
  net.start();
  net.pump();
  let mut events = net.get(1).subscribe();
  assert!(net.get_mut(1).on_link_close(&id(2), 0));
  net.pump();
  assert_eq!(net.state_seen_by(1, 2), ServerState::Down);
  net.get_mut(2).start_join();
  net.pump();
  assert_eq!(net.state_seen_by(1, 2), ServerState::Up);
  assert_eq!(events.try_recv(), Ok(ServerEvent::Down(id(2))));
  assert_eq!(events.try_recv(), Ok(ServerEvent::Up(id(2))));
  assert_eq!(net.get(1).hubs().to_vec(), vec![id(1), id(2)]);
}

#[test]
fn own_heartbeat_revives_a_down_server() {
  let mut net = Net::default();
  net.add(node(1, &[1, 2]));
  net.add(node(2, &[1, 2]));
  net.start();
  net.pump();
  assert!(net.get_mut(1).on_link_close(&id(2), 0));
  net.pump();
  let alive = net.get(2).root().self_server().snapshot();
  assert!(net.get(1).root().server(&id(2)).unwrap().sequence() > alive.sequence);
  net.get_mut(1).server_heartbeat(&alive).unwrap();
  assert_eq!(net.state_seen_by(1, 2), ServerState::Up);
  net.pump();
  assert_eq!(net.state_seen_by(2, 1), ServerState::Up);
  let crcs = (1..=2)
    .map(|i| net.get(i).root().self_rack().unwrap().snapshot().crc)
    .collect_vec();
  assert!(crcs.iter().all_equal(), "{:?}", crcs);
}

#[test]
fn late_joiner_keeps_its_own_local_pod() {
  let mut net = Net::default();
  net.add(node(1, &[]));
  net.start();
  net.pump();
  net.add(node(2, &[1]));
  net.start();
  net.pump();
  let late = net.get(2);
  assert!(late.is_join_complete());
  assert_eq!(late.pods().pod("local.cluster").unwrap().servers, vec![Some(id(2))]);
  assert_eq!(net.get(1).pods().pod("local.cluster").unwrap().servers, vec![Some(id(1))]);
  assert!(late.pods().pod("cluster_hub.cluster").is_some());
}

#[test]
fn clusters_exchange_cluster_heartbeats() {
  let mut a = HeartbeatBuilder::new(ServerConfig::new(&addr(1), 8080).cluster("a"));
  a.server(&addr(7), 8080, false, "c", None, false).unwrap();
  let c = HeartbeatBuilder::new(ServerConfig::new(&addr(7), 8080).cluster("c"));
  let mut net = Net::default();
  net.add(a.build().unwrap());
  net.add(c.build().unwrap());
  net.start();
  net.pump();
  assert_eq!(net.state_seen_by(1, 7), ServerState::Up);
  assert_eq!(net.state_seen_by(7, 1), ServerState::Up);
  assert!(net.sent_between(1, 7) > 0);
  let seen = net.get(7).root().server(&id(1)).unwrap();
  assert_eq!(seen.cluster_id(), "a");
  assert_eq!(seen.rack().unwrap().rack, "external");
  let status = net.get(1).join_status().borrow().clone();
  assert_eq!(status.remote_count, Some(1));
  assert!(!net.get(1).is_join_complete());
}

#[test]
fn returning_representative_gets_a_cluster_heartbeat_at_once() {
  let mut a = HeartbeatBuilder::new(ServerConfig::new(&addr(1), 8080).cluster("a"));
  a.server(&addr(7), 8080, false, "c", None, false).unwrap();
  let c = HeartbeatBuilder::new(ServerConfig::new(&addr(7), 8080).cluster("c"));
  let mut net = Net::default();
  net.add(a.build().unwrap());
  net.add(c.build().unwrap());
  net.start();
  net.pump();
  assert!(net.get_mut(1).on_link_close(&id(7), 0));
  net.pump();
  assert_eq!(net.state_seen_by(1, 7), ServerState::Down);
  let request = {
    let root = net.get(7).root();
    HeartbeatRequest::ClusterHeartbeat {
      source_cluster: "c".to_string(),
      server: root.self_server().snapshot(),
      rack: root.self_rack().unwrap().snapshot(),
      pods: None,
      sequence: root.sequence(),
    }
  };
  net.get_mut(1).handle(request).unwrap();
  assert_eq!(net.state_seen_by(1, 7), ServerState::Up);
  assert_eq!(sends(net.get_mut(1)), vec![(id(7), "clusterHeartbeat")]);
}

#[test]
fn cluster_without_members_does_not_hold_the_throttle() {
  let mut net = Net::default();
  net.add(node(1, &[]));
  net.start();
  net.pump();
  let service = net.get_mut(1);
  service.update_rack(&RackSnapshot::of("far", "rack", vec![])).unwrap();
  service.on_heartbeat_timer();
  assert!(sends(service).is_empty());
  let root = service.root().clone();
  let rack = root.create_rack("far", "external").unwrap();
  root.create_rack_server(&rack, &addr(8), 8080, false).unwrap();
  service.on_heartbeat_timer();
  assert_eq!(sends(service), vec![(id(8), "clusterHeartbeat")]);
}

fn rejoin_node(i: usize, seeds: &[(usize, &str)]) -> HeartbeatService {
  let config = HeartbeatConfig {
    join_full_time: Duration::from_secs(1),
    ..HeartbeatConfig::default()
  };
  let mut builder = HeartbeatBuilder::new(ServerConfig::new(&addr(i), 8080)).config(config);
  for (seed, cluster) in seeds {
    builder.server(&addr(*seed), 8080, false, cluster, None, false).unwrap();
  }
  builder.build().unwrap()
}

#[tokio::test(start_paused = true)]
async fn rejoin_is_required_only_without_a_live_local_seed() {
  let mut net = Net::default();
  net.add(rejoin_node(1, &[]));
  net.add(rejoin_node(2, &[(3, CLUSTER)]));
  net.add(rejoin_node(4, &[(9, "c")]));
  net.add(rejoin_node(5, &[(6, CLUSTER)]));
  net.add(rejoin_node(6, &[]));
  net.start();
  net.pump();
  assert!(net.get(1).is_join_required());
  tokio::time::advance(Duration::from_secs(2)).await;
  assert!(!net.get(1).is_join_required(), "no seeds");
  assert!(net.get(2).is_join_required(), "local seed down");
  assert!(!net.get(4).is_join_required(), "foreign seeds only");
  assert!(!net.get(5).is_join_required(), "local seed up");
}

#[test]
fn stopped_service_refuses_requests() {
  let mut service = node(1, &[]);
  service.start();
  service.drain_commands();
  service.stop();
  let snapshot = service.root().self_server().snapshot();
  assert!(service.handle(HeartbeatRequest::ServerHeartbeat(snapshot)).is_err());
  service.on_heartbeat_timer();
  service.after_batch();
  assert!(service
    .drain_commands()
    .iter()
    .all(|c| !matches!(c, Command::Send(_) | Command::ScheduleHeartbeat(_))));
}
