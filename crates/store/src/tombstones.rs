use std::collections::VecDeque;

use kide_core::{ResourceVersion, Uid};
use rustc_hash::FxHashMap;

/// Recently deleted uids with their final version, FIFO with fixed capacity.
///
/// Guards against a late duplicate of an earlier event resurrecting an
/// object after its delete was applied.
pub(crate) struct Tombstones {
    map: FxHashMap<Uid, ResourceVersion>,
    order: VecDeque<Uid>,
    cap: usize,
    evicted: u64,
}

impl Tombstones {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap, evicted: 0 }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn get(&self, uid: &Uid) -> Option<&ResourceVersion> {
        self.map.get(uid)
    }

    pub fn insert(&mut self, uid: Uid, rv: ResourceVersion) {
        if self.cap == 0 {
            return;
        }
        if !self.map.contains_key(&uid) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.evicted += 1;
                }
            }
            self.order.push_back(uid);
        }
        self.map.insert(uid, rv);
    }

    pub fn remove(&mut self, uid: &Uid) {
        if self.map.remove(uid).is_some() {
            self.order.retain(|u| u != uid);
        }
    }
}
