//! Hub election, heartbeat gossip and the join protocol.
//!
//! A [`HeartbeatService`] holds the protocol state and is driven by a [`HeartbeatActor`]. Remote
//! calls go through a [`Remote`], timers through a [`Scheduler`].

mod actor;
mod builder;
mod config;
pub mod hub;
pub mod join;
mod messages;
mod remote;
mod service;
mod throttle;

#[rustfmt::skip]
pub use {
  actor::HeartbeatActor,
  actor::HeartbeatHandle,
  builder::HeartbeatBuilder,
  builder::SeedConfig,
  config::HeartbeatConfig,
  config::ServerConfig,
  join::JoinAggregate,
  join::JoinEffect,
  join::JoinFork,
  join::JoinState,
  join::Transition,
  messages::HeartbeatReply,
  messages::HeartbeatRequest,
  messages::JoinRequest,
  messages::Outbound,
  messages::ServerEvent,
  remote::Remote,
  remote::Scheduler,
  remote::TimerHandle,
  remote::TokioScheduler,
  service::Command,
  service::HeartbeatService,
  service::JoinStatus,
  service::Lifecycle,
  throttle::ClusterTarget,
  throttle::SendThrottle,
};
