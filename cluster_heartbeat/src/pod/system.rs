use crate::pod::{PodSnapshot, PodSystemSnapshot, LOCAL_POD};
use crate::topology::Root;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// The pods known to the local server. Updates from peers are accepted per pod when they carry a
/// newer sequence. Pod sequences come from the root clock.
#[derive(Debug)]
pub struct PodSystem {
  pods: BTreeMap<String, Arc<PodSnapshot>>,
  snapshot: Arc<PodSystemSnapshot>,
  started: bool,
}
impl PodSystem {
  pub fn new() -> PodSystem {
    PodSystem {
      pods: BTreeMap::new(),
      snapshot: Arc::new(PodSystemSnapshot::empty()),
      started: false,
    }
  }

  /// Installs locally built pods. Pods already received from peers are kept, except the local
  /// pod, which is always this server's own.
  pub fn start(&mut self, pods: Vec<PodSnapshot>) {
    for pod in pods {
      if pod.name == LOCAL_POD {
        self.pods.insert(pod.id(), Arc::new(pod));
      } else {
        self.pods.entry(pod.id()).or_insert_with(|| Arc::new(pod));
      }
    }
    self.started = true;
    self.publish();
    debug!(pods = self.pods.len(), "pods started");
  }

  pub fn is_started(&self) -> bool {
    self.started
  }

  pub fn snapshot(&self) -> Arc<PodSystemSnapshot> {
    self.snapshot.clone()
  }

  pub fn pod(&self, id: &str) -> Option<Arc<PodSnapshot>> {
    self.pods.get(id).cloned()
  }

  /// Merges a peer's pods, skipping its local pod. Returns whether anything changed.
  pub fn update_pod_system(&mut self, root: &Root, update: &PodSystemSnapshot) -> bool {
    if update.crc == self.snapshot.crc {
      return false;
    }
    let mut changed = false;
    for pod in &update.pods {
      root.observe_sequence(pod.sequence);
      if pod.name == LOCAL_POD {
        continue;
      }
      let newer = match self.pods.get(&pod.id()) {
        None => true,
        Some(local) => pod.sequence > local.sequence && pod.crc != local.crc,
      };
      if newer {
        self.pods.insert(pod.id(), pod.clone());
        changed = true;
      }
    }
    if changed {
      self.publish();
    }
    changed
  }

  /// Puts cluster members that no pod slot references yet into empty placeholders.
  pub fn fill_slots(&mut self, root: &Root) -> bool {
    let mut changed = false;
    let ids = self.pods.keys().cloned().collect::<Vec<_>>();
    for id in ids {
      let pod = match self.pods.get(&id) {
        Some(pod) if pod.has_free_slot() => pod.clone(),
        _ => continue,
      };
      let mut candidates = root
        .cluster(&pod.cluster_id)
        .map(|c| c.servers())
        .unwrap_or_default()
        .into_iter()
        .filter(|s| !pod.servers.iter().any(|slot| slot.as_ref() == Some(s)));
      let mut next = (*pod).clone();
      let mut filled = false;
      for slot in next.servers.iter_mut().filter(|s| s.is_none()) {
        match candidates.next() {
          Some(server) => {
            *slot = Some(server);
            filled = true;
          }
          None => break,
        }
      }
      if filled {
        next.sequence = root.update_sequence();
        self.pods.insert(id, Arc::new(next.seal()));
        changed = true;
      }
    }
    if changed {
      self.publish();
    }
    changed
  }

  fn publish(&mut self) {
    self.snapshot = Arc::new(PodSystemSnapshot::of(self.pods.values().cloned().collect()));
  }
}
impl Default for PodSystem {
  fn default() -> Self {
    PodSystem::new()
  }
}

#[cfg(test)]
use crate::pod::{PodBuilder, PodType};
#[cfg(test)]
use crate::topology::ServerId;

#[test]
fn test_fill_slots_with_new_servers() {
  let root = Root::new("10.0.0.5", 8080, false, "cluster").unwrap();
  let mut system = PodSystem::new();
  system.start(PodBuilder::new(3).build(&root, 1).unwrap());
  let hub = system.pod("cluster_hub.cluster").unwrap();
  assert_eq!(hub.servers, vec![Some(root.self_id().clone()), None, None]);
  let crc = system.snapshot().crc;
  assert!(!system.fill_slots(&root));
  let rack = root.self_rack().unwrap();
  root.create_rack_server(&rack, "10.0.0.1", 80, false).unwrap();
  assert!(system.fill_slots(&root));
  let hub = system.pod("cluster_hub.cluster").unwrap();
  assert_eq!(
    hub.servers,
    vec![Some(root.self_id().clone()), Some(ServerId::new("10.0.0.1", 80)), None]
  );
  assert!(hub.sequence > 1);
  assert_eq!(hub.sequence, root.sequence());
  assert_ne!(system.snapshot().crc, crc);
  assert!(!system.fill_slots(&root));
}

#[test]
fn test_update_accepts_newer_pods_only() {
  let root = Root::new("10.0.0.5", 8080, false, "cluster").unwrap();
  let mut builder = PodBuilder::new(3);
  builder.pod("web", "cluster", PodType::Web).unwrap();
  let mut local = PodSystem::new();
  local.start(builder.build(&root, 10).unwrap());
  let mut stale = (*local.pod("web.cluster").unwrap()).clone();
  stale.servers = vec![None, None, None];
  stale.sequence = 5;
  let stale = PodSystemSnapshot::of(vec![Arc::new(stale.seal())]);
  assert!(!local.update_pod_system(&root, &stale));
  let mut newer = (*local.pod("web.cluster").unwrap()).clone();
  newer.servers = vec![Some(ServerId::new("10.0.0.7", 80)), None, None];
  newer.sequence = 20;
  let newer = PodSystemSnapshot::of(vec![Arc::new(newer.seal())]);
  assert!(local.update_pod_system(&root, &newer));
  assert!(!local.update_pod_system(&root, &newer));
  assert_eq!(local.pod("web.cluster").unwrap().sequence, 20);
  assert_eq!(local.snapshot().pods.len(), 4);
  assert!(root.sequence() >= 20);
}

#[test]
fn test_local_pod_stays_local() {
  let root = Root::new("10.0.0.5", 8080, false, "cluster").unwrap();
  let peer = Root::new("10.0.0.1", 8080, false, "cluster").unwrap();
  let theirs = PodSystemSnapshot::of(
    PodBuilder::new(3).build(&peer, 50).unwrap().into_iter().map(Arc::new).collect(),
  );
  let mut system = PodSystem::new();
  assert!(system.update_pod_system(&root, &theirs));
  assert!(system.pod("local.cluster").is_none());
  system.start(PodBuilder::new(3).build(&root, 1).unwrap());
  let local = system.pod("local.cluster").unwrap();
  assert_eq!(local.servers, vec![Some(root.self_id().clone())]);
  let hub = system.pod("cluster_hub.cluster").unwrap();
  assert_eq!(hub.servers[0], Some(peer.self_id().clone()));
}
