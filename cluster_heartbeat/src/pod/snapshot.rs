use crate::topology::{Fingerprint, ServerId};
use serde::{Deserialize, Serialize};
use std::cmp::max;
use std::sync::Arc;

use PodType::*;

#[derive(
  Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug,
)]
pub enum PodType {
  Off,
  Auto,
  Solo,
  Lazy,
  Web,
  Pair,
  Triad,
  Cluster,
}
impl PodType {
  /// Primary slots for a pod over `servers` cluster servers. `None` for types without a layout.
  pub fn primary_count(self, servers: usize) -> Option<usize> {
    match self {
      Solo | Lazy | Web => Some(1),
      Pair => Some(2),
      Triad => Some(3),
      Cluster => Some(max(3, servers)),
      Off | Auto => None,
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      Off => "off",
      Auto => "auto",
      Solo => "solo",
      Lazy => "lazy",
      Web => "web",
      Pair => "pair",
      Triad => "triad",
      Cluster => "cluster",
    }
  }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct PodSnapshot {
  pub name: String,
  pub cluster_id: String,
  pub pod_type: PodType,
  pub primary_count: usize,
  pub depth: usize,
  /// One entry per slot. `None` is a placeholder waiting for a server.
  pub servers: Vec<Option<ServerId>>,
  pub sequence: u64,
  pub crc: u64,
}
impl PodSnapshot {
  /// `name.cluster`
  pub fn id(&self) -> String {
    format!("{}.{}", self.name, self.cluster_id)
  }

  pub fn seal(mut self) -> PodSnapshot {
    let mut fp = Fingerprint::new();
    fp.str(&self.name)
      .str(&self.cluster_id)
      .str(self.pod_type.name())
      .int(self.primary_count as i64)
      .int(self.depth as i64)
      .int(self.servers.len() as i64);
    for server in &self.servers {
      match server {
        Some(id) => fp.bool(true).str(id.as_str()),
        None => fp.bool(false),
      };
    }
    self.crc = fp.finish();
    self
  }

  pub fn has_free_slot(&self) -> bool {
    self.servers.iter().any(Option::is_none)
  }
}

/// Every pod known to a server, ordered by pod id.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct PodSystemSnapshot {
  pub pods: Vec<Arc<PodSnapshot>>,
  pub sequence: u64,
  pub crc: u64,
}
impl PodSystemSnapshot {
  pub fn of(pods: Vec<Arc<PodSnapshot>>) -> PodSystemSnapshot {
    let mut fp = Fingerprint::new();
    fp.int(pods.len() as i64);
    for pod in &pods {
      fp.int(pod.crc as i64);
    }
    PodSystemSnapshot {
      sequence: pods.iter().map(|p| p.sequence).max().unwrap_or(0),
      crc: fp.finish(),
      pods,
    }
  }

  pub fn empty() -> PodSystemSnapshot {
    PodSystemSnapshot::of(Vec::new())
  }

  pub fn pod(&self, id: &str) -> Option<&Arc<PodSnapshot>> {
    self.pods.iter().find(|p| p.id() == id)
  }
}

#[test]
fn test_primary_counts() {
  assert_eq!(Solo.primary_count(9), Some(1));
  assert_eq!(Web.primary_count(9), Some(1));
  assert_eq!(Pair.primary_count(9), Some(2));
  assert_eq!(Triad.primary_count(1), Some(3));
  assert_eq!(Cluster.primary_count(1), Some(3));
  assert_eq!(Cluster.primary_count(7), Some(7));
  assert_eq!(Off.primary_count(7), None);
}
