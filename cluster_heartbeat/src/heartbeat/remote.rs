use crate::error::RemoteError;
use crate::heartbeat::{HeartbeatReply, HeartbeatRequest};
use crate::topology::ServerId;
use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Invokes a heartbeat method on a remote server.
#[async_trait]
pub trait Remote: Send + Sync + 'static {
  async fn invoke(
    &self,
    target: &ServerId,
    request: HeartbeatRequest,
  ) -> Result<HeartbeatReply, RemoteError>;
}

/// Runs a callback after a delay.
pub trait Scheduler: Send + Sync + 'static {
  fn schedule_after(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle;
}

/// Cancels a scheduled callback. Dropping the handle leaves the callback scheduled.
pub struct TimerHandle {
  cancel: Option<Box<dyn FnOnce() + Send>>,
}
impl TimerHandle {
  pub fn new(cancel: impl FnOnce() + Send + 'static) -> TimerHandle {
    TimerHandle {
      cancel: Some(Box::new(cancel)),
    }
  }

  pub fn cancel(mut self) {
    if let Some(cancel) = self.cancel.take() {
      cancel();
    }
  }
}

/// Schedules callbacks as tasks on the current tokio runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioScheduler;
impl Scheduler for TokioScheduler {
  fn schedule_after(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle {
    let handle: JoinHandle<()> = tokio::spawn(async move {
      sleep(delay).await;
      task();
    });
    TimerHandle::new(move || handle.abort())
  }
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_timer_does_not_fire() {
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  let fired = Arc::new(AtomicUsize::new(0));
  let f1 = fired.clone();
  let f2 = fired.clone();
  let kept = TokioScheduler.schedule_after(
    Duration::from_millis(10),
    Box::new(move || {
      f1.fetch_add(1, Ordering::SeqCst);
    }),
  );
  let cancelled = TokioScheduler.schedule_after(
    Duration::from_millis(10),
    Box::new(move || {
      f2.fetch_add(10, Ordering::SeqCst);
    }),
  );
  cancelled.cancel();
  sleep(Duration::from_millis(50)).await;
  assert_eq!(fired.load(Ordering::SeqCst), 1);
  drop(kept);
}
