use crate::topology::ServerId;
use im::HashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Failures injected into requests sent to a server.
#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct FailureConfig {
  pub drop_prob: f64,
  /// Uniformly random delay between the bounds.
  pub delay: Option<(Duration, Duration)>,
  /// Every request fails as unreachable.
  pub down: bool,
}
impl FailureConfig {
  pub fn down() -> FailureConfig {
    FailureConfig {
      down: true,
      ..FailureConfig::default()
    }
  }
}

#[derive(Clone, Default, Serialize, Deserialize, Debug)]
pub struct FailureConfigMap {
  pub cluster_wide: FailureConfig,
  pub node_wide: HashMap<ServerId, FailureConfig>,
}
impl FailureConfigMap {
  pub fn get(&self, server: &ServerId) -> &FailureConfig {
    self.node_wide.get(server).unwrap_or(&self.cluster_wide)
  }
}

#[test]
fn test_node_wide_overrides_cluster_wide() {
  let down = ServerId::new("10.0.0.1", 80);
  let mut map = FailureConfigMap::default();
  map.cluster_wide.drop_prob = 0.5;
  map.node_wide.insert(down.clone(), FailureConfig::down());
  assert!(map.get(&down).down);
  assert_eq!(map.get(&ServerId::new("10.0.0.2", 80)).drop_prob, 0.5);
}
