use serde::{Deserialize, Serialize};
use std::fmt;

/// Address used when a server is configured with an empty host.
pub const LOOPBACK: &str = "127.0.0.1";

/// Replaces an empty address with [`LOOPBACK`].
pub fn normalize_address(address: &str) -> &str {
  if address.is_empty() {
    LOOPBACK
  } else {
    address
  }
}

/// Loopback and unset addresses never count as seeds when numbering them.
pub fn is_loopback(address: &str) -> bool {
  address.is_empty() || address.starts_with("127")
}

/// Unique `address:port` identifier of a server.
#[derive(
  Serialize, Deserialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug,
)]
pub struct ServerId(String);
impl ServerId {
  pub fn new(address: &str, port: i32) -> ServerId {
    ServerId(format!("{}:{}", normalize_address(address), port))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}
impl fmt::Display for ServerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Identifies a rack by the cluster it lives in and its own id.
#[derive(
  Serialize, Deserialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug,
)]
pub struct RackKey {
  pub cluster: String,
  pub rack: String,
}
impl RackKey {
  pub fn new(cluster: &str, rack: &str) -> RackKey {
    RackKey {
      cluster: cluster.to_string(),
      rack: rack.to_string(),
    }
  }
}
impl fmt::Display for RackKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.cluster, self.rack)
  }
}

#[test]
fn test_server_id_normalizes_empty_address() {
  assert_eq!(ServerId::new("", 8080), ServerId::new("127.0.0.1", 8080));
  assert_eq!(ServerId::new("10.0.0.1", 80).as_str(), "10.0.0.1:80");
  assert!(is_loopback(""));
  assert!(is_loopback("127.0.0.2"));
  assert!(!is_loopback("192.168.1.4"));
}
