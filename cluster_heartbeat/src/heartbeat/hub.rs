use crate::topology::ServerId;
use itertools::Itertools;
use smallvec::SmallVec;

/// The hubs of a rack: the first `hub_count` up servers in ascending id order.
pub fn hubs<F>(slots: &[Option<ServerId>], is_up: F, hub_count: usize) -> SmallVec<[ServerId; 3]>
where
  F: Fn(&ServerId) -> bool,
{
  slots
    .iter()
    .flatten()
    .filter(|id| is_up(*id))
    .sorted()
    .take(hub_count)
    .cloned()
    .collect()
}

pub fn is_hub<F>(slots: &[Option<ServerId>], is_up: F, hub_count: usize, server: &ServerId) -> bool
where
  F: Fn(&ServerId) -> bool,
{
  hubs(slots, is_up, hub_count).contains(server)
}

#[cfg(test)]
use maplit::hashset;

#[test]
fn test_hubs_are_deterministic() {
  let ids = (1..=6).map(|i| ServerId::new(&format!("10.0.0.{}", i), 80)).collect::<Vec<_>>();
  let up = hashset! { ids[0].clone(), ids[2].clone(), ids[3].clone(), ids[5].clone() };
  let slots = ids.iter().cloned().map(Some).collect::<Vec<_>>();
  let shuffled = vec![
    Some(ids[5].clone()),
    None,
    Some(ids[3].clone()),
    Some(ids[0].clone()),
    Some(ids[4].clone()),
    Some(ids[2].clone()),
    Some(ids[1].clone()),
  ];
  let a = hubs(&slots, |id| up.contains(id), 3);
  let b = hubs(&shuffled, |id| up.contains(id), 3);
  assert_eq!(a, b);
  assert_eq!(a.to_vec(), vec![ids[0].clone(), ids[2].clone(), ids[3].clone()]);
  assert!(is_hub(&slots, |id| up.contains(id), 3, &ids[3]));
  assert!(!is_hub(&slots, |id| up.contains(id), 3, &ids[5]));
  assert!(!is_hub(&slots, |id| up.contains(id), 3, &ids[1]));
  assert!(hubs(&slots, |_| false, 3).is_empty());
}
