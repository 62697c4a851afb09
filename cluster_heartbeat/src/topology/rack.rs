use crate::topology::{RackKey, RackSnapshot, ServerId};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;

/// A rack of servers. Slots are kept sorted by server id with empty slots last, and are published
/// as a whole so readers never see a half-sorted array.
#[derive(Debug)]
pub struct Rack {
  key: RackKey,
  slots: ArcSwap<Vec<Option<ServerId>>>,
  snapshot: ArcSwap<RackSnapshot>,
  pub(crate) write: Mutex<()>,
}
impl Rack {
  pub(crate) fn new(key: RackKey) -> Rack {
    Rack {
      snapshot: ArcSwap::from_pointee(RackSnapshot::empty(&key)),
      slots: ArcSwap::from_pointee(Vec::new()),
      key,
      write: Mutex::new(()),
    }
  }

  pub fn key(&self) -> &RackKey {
    &self.key
  }

  pub fn id(&self) -> &str {
    &self.key.rack
  }

  pub fn cluster_id(&self) -> &str {
    &self.key.cluster
  }

  pub fn servers(&self) -> Arc<Vec<Option<ServerId>>> {
    self.slots.load_full()
  }

  /// Occupied slots, in slot order.
  pub fn members(&self) -> Vec<ServerId> {
    self.slots.load().iter().flatten().cloned().collect()
  }

  pub fn contains(&self, id: &ServerId) -> bool {
    self.slot_of(id).is_some()
  }

  pub fn slot_of(&self, id: &ServerId) -> Option<usize> {
    self.slots.load().iter().position(|s| s.as_ref() == Some(id))
  }

  pub fn snapshot(&self) -> Arc<RackSnapshot> {
    self.snapshot.load_full()
  }

  pub(crate) fn store_slots(&self, slots: Vec<Option<ServerId>>) {
    self.slots.store(Arc::new(slots));
  }

  pub(crate) fn publish(&self, snapshot: RackSnapshot) {
    self.snapshot.store(Arc::new(snapshot));
  }
}

/// Takes the first free slot (or appends), then sorts by id with empty slots last.
pub(crate) fn place(slots: &[Option<ServerId>], id: &ServerId) -> Vec<Option<ServerId>> {
  let mut next = slots.to_vec();
  match next.iter().position(Option::is_none) {
    Some(free) => next[free] = Some(id.clone()),
    None => next.push(Some(id.clone())),
  }
  sort_slots(&mut next);
  next
}

pub(crate) fn sort_slots(slots: &mut Vec<Option<ServerId>>) {
  slots.sort_by(|a, b| match (a, b) {
    (Some(a), Some(b)) => a.cmp(b),
    (Some(_), None) => Ordering::Less,
    (None, Some(_)) => Ordering::Greater,
    (None, None) => Ordering::Equal,
  });
}

#[test]
fn test_place_sorts_and_reuses_free_slots() {
  let a = ServerId::new("10.0.0.1", 80);
  let b = ServerId::new("10.0.0.2", 80);
  let c = ServerId::new("10.0.0.3", 80);
  let slots = place(&[], &c);
  let slots = place(&slots, &a);
  assert_eq!(slots, vec![Some(a.clone()), Some(c.clone())]);
  let slots = place(&[Some(c.clone()), None, Some(a.clone())], &b);
  assert_eq!(slots, vec![Some(a), Some(b), Some(c)]);
}
