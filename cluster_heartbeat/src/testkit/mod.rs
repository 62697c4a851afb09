//! Tools for exercising the heartbeat protocol in-process.

mod failure_config;
mod local_network;
mod logging;

#[rustfmt::skip]
pub use {
  failure_config::FailureConfig,
  failure_config::FailureConfigMap,
  local_network::LocalNetwork,
  logging::init_logging,
};
