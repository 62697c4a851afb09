use crate::topology::{Rack, RackKey, ServerId};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// A region groups racks by index. Regions and racks grow sparsely.
#[derive(Debug)]
pub struct Region {
  index: usize,
  racks: ArcSwap<Vec<Option<String>>>,
}
impl Region {
  fn new(index: usize) -> Region {
    Region {
      index,
      racks: ArcSwap::from_pointee(Vec::new()),
    }
  }

  pub fn index(&self) -> usize {
    self.index
  }

  /// Rack ids by index, `None` for unused indices.
  pub fn racks(&self) -> Arc<Vec<Option<String>>> {
    self.racks.load_full()
  }
}

/// A named cluster: its regions, racks and the servers configured as seeds.
#[derive(Debug)]
pub struct Cluster {
  id: String,
  regions: ArcSwap<Vec<Option<Arc<Region>>>>,
  racks: DashMap<String, Arc<Rack>>,
  seeds: ArcSwap<Vec<ServerId>>,
  dynamic: ArcSwap<Vec<ServerId>>,
  write: Mutex<()>,
}
impl Cluster {
  pub(crate) fn new(id: &str) -> Cluster {
    Cluster {
      id: id.to_string(),
      regions: ArcSwap::from_pointee(Vec::new()),
      racks: DashMap::new(),
      seeds: ArcSwap::from_pointee(Vec::new()),
      dynamic: ArcSwap::from_pointee(Vec::new()),
      write: Mutex::new(()),
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn create_region(&self, index: usize) -> Arc<Region> {
    let _guard = self.write.lock();
    self.region_locked(index)
  }

  fn region_locked(&self, index: usize) -> Arc<Region> {
    let regions = self.regions.load_full();
    if let Some(Some(region)) = regions.get(index) {
      return region.clone();
    }
    let mut next = (*regions).clone();
    if next.len() <= index {
      next.resize(index + 1, None);
    }
    let region = Arc::new(Region::new(index));
    next[index] = Some(region.clone());
    self.regions.store(Arc::new(next));
    region
  }

  pub fn regions(&self) -> Vec<Arc<Region>> {
    self.regions.load().iter().flatten().cloned().collect()
  }

  /// Get-or-create. New racks go into region 0 at the next free index.
  pub fn create_rack(&self, rack_id: &str) -> Arc<Rack> {
    if let Some(rack) = self.find_rack(rack_id) {
      return rack;
    }
    let _guard = self.write.lock();
    if let Some(rack) = self.find_rack(rack_id) {
      return rack;
    }
    let region = self.region_locked(0);
    let mut racks = (*region.racks.load_full()).clone();
    match racks.iter().position(Option::is_none) {
      Some(free) => racks[free] = Some(rack_id.to_string()),
      None => racks.push(Some(rack_id.to_string())),
    }
    let rack = Arc::new(Rack::new(RackKey::new(&self.id, rack_id)));
    self.racks.insert(rack_id.to_string(), rack.clone());
    region.racks.store(Arc::new(racks));
    rack
  }

  pub fn find_rack(&self, rack_id: &str) -> Option<Arc<Rack>> {
    self.racks.get(rack_id).map(|r| r.value().clone())
  }

  /// Racks in region order, then by index within the region.
  pub fn racks(&self) -> Vec<Arc<Rack>> {
    self
      .regions()
      .iter()
      .flat_map(|region| region.racks().iter().flatten().cloned().collect::<Vec<_>>())
      .filter_map(|id| self.find_rack(&id))
      .collect()
  }

  /// Every rack member, in rack then slot order.
  pub fn servers(&self) -> Vec<ServerId> {
    self.racks().iter().flat_map(|rack| rack.members()).collect()
  }

  pub fn add_seed_server(&self, id: ServerId) -> bool {
    Cluster::add_unique(&self.write, &self.seeds, id)
  }

  pub fn seed_servers(&self) -> Arc<Vec<ServerId>> {
    self.seeds.load_full()
  }

  pub fn add_dynamic_server(&self, id: ServerId) -> bool {
    Cluster::add_unique(&self.write, &self.dynamic, id)
  }

  pub fn dynamic_servers(&self) -> Arc<Vec<ServerId>> {
    self.dynamic.load_full()
  }

  fn add_unique(lock: &Mutex<()>, list: &ArcSwap<Vec<ServerId>>, id: ServerId) -> bool {
    let _guard = lock.lock();
    let current = list.load_full();
    if current.contains(&id) {
      return false;
    }
    let mut next = (*current).clone();
    next.push(id);
    list.store(Arc::new(next));
    true
  }
}

#[test]
fn test_racks_are_ordered_by_region_index() {
  let cluster = Cluster::new("cluster");
  let b = cluster.create_rack("b");
  let a = cluster.create_rack("a");
  assert!(Arc::ptr_eq(&b, &cluster.create_rack("b")));
  let ids = cluster.racks().iter().map(|r| r.id().to_string()).collect::<Vec<_>>();
  assert_eq!(ids, vec!["b", "a"]);
  assert_eq!(a.key(), &RackKey::new("cluster", "a"));
  let region = cluster.create_region(3);
  assert_eq!(region.index(), 3);
  assert_eq!(cluster.regions().len(), 2);
}

#[test]
fn test_seed_list_rejects_duplicates() {
  let cluster = Cluster::new("cluster");
  assert!(cluster.add_seed_server(ServerId::new("10.0.0.1", 80)));
  assert!(!cluster.add_seed_server(ServerId::new("10.0.0.1", 80)));
  assert_eq!(cluster.seed_servers().len(), 1);
}
