//! Adaptive Replacement Cache bookkeeping for buffer retention.
//!
//! The ARC tracks buffer keys only; the buffers themselves live in the cache
//! table. Keys the caller reports as pinned (busy or dirty) are never chosen
//! as victims, so the resident set may temporarily exceed `capacity` while
//! many buffers are held or awaiting write-back.

use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArcList {
    T1,
    T2,
    B1,
    B2,
}

#[derive(Debug)]
pub(crate) struct ArcState {
    capacity: usize,
    /// Target size for the T1 list.
    p: usize,
    t1: VecDeque<u64>,
    t2: VecDeque<u64>,
    b1: VecDeque<u64>,
    b2: VecDeque<u64>,
    loc: HashMap<u64, ArcList>,
}

impl ArcState {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            p: 0,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            loc: HashMap::new(),
        }
    }

    pub(crate) fn resident_len(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    fn remove_from_list(list: &mut VecDeque<u64>, key: u64) -> bool {
        if let Some(pos) = list.iter().position(|k| *k == key) {
            let _ = list.remove(pos);
            return true;
        }
        false
    }

    /// Pop the least recently used key that is not pinned.
    fn pop_unpinned(list: &mut VecDeque<u64>, pinned: &impl Fn(u64) -> bool) -> Option<u64> {
        let pos = list.iter().position(|k| !pinned(*k))?;
        list.remove(pos)
    }

    /// Drop `key` from every list, ghosts included.
    pub(crate) fn forget(&mut self, key: u64) {
        if let Some(list) = self.loc.remove(&key) {
            let list = match list {
                ArcList::T1 => &mut self.t1,
                ArcList::T2 => &mut self.t2,
                ArcList::B1 => &mut self.b1,
                ArcList::B2 => &mut self.b2,
            };
            let _ = Self::remove_from_list(list, key);
        }
    }

    /// Record an access to `key`; returns resident keys that must be evicted.
    pub(crate) fn access(&mut self, key: u64, pinned: &impl Fn(u64) -> bool) -> Vec<u64> {
        let mut evicted = Vec::new();
        match self.loc.get(&key).copied() {
            Some(ArcList::T1) => {
                let _ = Self::remove_from_list(&mut self.t1, key);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            Some(ArcList::T2) => {
                let _ = Self::remove_from_list(&mut self.t2, key);
                self.t2.push_back(key);
            }
            Some(ArcList::B1) => {
                let delta = (self.b2.len().max(1) / self.b1.len().max(1)).max(1);
                self.p = (self.p + delta).min(self.capacity);
                let _ = Self::remove_from_list(&mut self.b1, key);
                self.replace(key, pinned, &mut evicted);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            Some(ArcList::B2) => {
                let delta = (self.b1.len().max(1) / self.b2.len().max(1)).max(1);
                self.p = self.p.saturating_sub(delta);
                let _ = Self::remove_from_list(&mut self.b2, key);
                self.replace(key, pinned, &mut evicted);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            None => {
                self.admit_new(key, pinned, &mut evicted);
            }
        }
        evicted
    }

    /// Evict unpinned keys until the resident set fits again.
    pub(crate) fn shrink(&mut self, pinned: &impl Fn(u64) -> bool) -> Vec<u64> {
        let mut evicted = Vec::new();
        while self.resident_len() > self.capacity {
            let before = evicted.len();
            self.replace(u64::MAX, pinned, &mut evicted);
            if evicted.len() == before {
                break;
            }
        }
        evicted
    }

    fn admit_new(&mut self, key: u64, pinned: &impl Fn(u64) -> bool, evicted: &mut Vec<u64>) {
        if self.t1.len() + self.b1.len() >= self.capacity {
            if self.t1.len() < self.capacity {
                let _ = self.b1.pop_front().and_then(|v| self.loc.remove(&v));
                self.replace(key, pinned, evicted);
            } else if let Some(victim) = Self::pop_unpinned(&mut self.t1, pinned) {
                let _ = self.loc.remove(&victim);
                evicted.push(victim);
            }
        } else if self.resident_len() >= self.capacity {
            if self.t1.len() + self.t2.len() + self.b1.len() + self.b2.len()
                >= self.capacity.saturating_mul(2)
            {
                let _ = self.b2.pop_front().and_then(|v| self.loc.remove(&v));
            }
            self.replace(key, pinned, evicted);
        }

        self.t1.push_back(key);
        self.loc.insert(key, ArcList::T1);
    }

    fn replace(&mut self, incoming: u64, pinned: &impl Fn(u64) -> bool, evicted: &mut Vec<u64>) {
        let t1_len = self.t1.len();
        let prefer_t1 = t1_len >= 1
            && (t1_len > self.p
                || (matches!(self.loc.get(&incoming), Some(ArcList::B2)) && t1_len == self.p));

        let from_t1 = |state: &mut Self, evicted: &mut Vec<u64>| {
            Self::pop_unpinned(&mut state.t1, pinned).map(|victim| {
                state.loc.insert(victim, ArcList::B1);
                state.b1.push_back(victim);
                evicted.push(victim);
            })
        };
        let from_t2 = |state: &mut Self, evicted: &mut Vec<u64>| {
            Self::pop_unpinned(&mut state.t2, pinned).map(|victim| {
                state.loc.insert(victim, ArcList::B2);
                state.b2.push_back(victim);
                evicted.push(victim);
            })
        };

        if prefer_t1 {
            if from_t1(self, evicted).is_none() {
                let _ = from_t2(self, evicted);
            }
        } else if from_t2(self, evicted).is_none() {
            let _ = from_t1(self, evicted);
        }

        while self.b1.len() > self.capacity {
            if let Some(victim) = self.b1.pop_front() {
                let _ = self.loc.remove(&victim);
            }
        }
        while self.b2.len() > self.capacity {
            if let Some(victim) = self.b2.pop_front() {
                let _ = self.loc.remove(&victim);
            }
        }
    }
}
