use num_enum::IntoPrimitive;
use serde::{Deserialize, Serialize};

use ServerState::*;

/// Liveness of a server as seen by the local node.
///
/// States only move forward: `Unknown -> Known -> Up <-> Down`.
#[derive(
  Serialize,
  Deserialize,
  IntoPrimitive,
  Hash,
  PartialEq,
  Eq,
  Ord,
  PartialOrd,
  Clone,
  Copy,
  Debug,
)]
#[repr(u8)]
pub enum ServerState {
  Unknown,
  Known,
  Up,
  Down,
}
impl ServerState {
  pub fn to_known(self) -> ServerState {
    match self {
      Unknown => Known,
      s => s,
    }
  }

  pub fn on_heartbeat_start(self) -> ServerState {
    Up
  }

  pub fn on_heartbeat_stop(self) -> ServerState {
    match self {
      Known | Up => Down,
      s => s,
    }
  }

  pub fn is_up(self) -> bool {
    self == Up
  }

  /// Whether this state ever saw a heartbeat exchange.
  pub fn is_known(self) -> bool {
    self != Unknown
  }
}
impl Default for ServerState {
  fn default() -> Self {
    Unknown
  }
}

#[test]
fn test_state_transitions() {
  assert_eq!(Unknown.to_known(), Known);
  assert_eq!(Down.to_known(), Down);
  assert_eq!(Up.to_known(), Up);
  assert_eq!(Known.on_heartbeat_start(), Up);
  assert_eq!(Down.on_heartbeat_start(), Up);
  assert_eq!(Up.on_heartbeat_stop(), Down);
  assert_eq!(Unknown.on_heartbeat_stop(), Unknown);
  assert_eq!(u8::from(Down), 3);
}
