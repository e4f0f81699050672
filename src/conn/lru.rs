// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! The TCP connection LRU set.
//!
//! Every established TCP connection of a shard lives in an
//! insertion-ordered set keyed by its connection id. [`LruSet::get`]
//! promotes an entry to the most-recently-used end; the timeout stage
//! walks from the least-recently-used end and stops at the first
//! unexpired entry, which makes the set double as the shard's timer
//! wheel: a touched connection has, by construction, a later deadline
//! than everything behind it.
//!
//! Nodes live in a slab and are linked by index, so insertion,
//! promotion, and removal are all constant time.

use std::collections::HashMap;

use slab::Slab;

#[derive(Debug)]
struct Node {
    cid: u64,
    token: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

/// An insertion-ordered set of TCP connections, keyed by connection
/// id and valued by connection token.
#[derive(Debug, Default)]
pub struct LruSet {
    map: HashMap<u64, usize>,
    nodes: Slab<Node>,

    /// The least-recently-used end.
    head: Option<usize>,

    /// The most-recently-used end.
    tail: Option<usize>,
}

impl LruSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, cid: u64) -> bool {
        self.map.contains_key(&cid)
    }

    /// Inserts a connection at the most-recently-used end. The id must
    /// not already be present.
    pub fn insert(&mut self, cid: u64, token: usize) {
        debug_assert!(!self.map.contains_key(&cid));
        let node = self.nodes.insert(Node {
            cid,
            token,
            prev: self.tail,
            next: None,
        });
        if let Some(tail) = self.tail {
            self.nodes[tail].next = Some(node);
        } else {
            self.head = Some(node);
        }
        self.tail = Some(node);
        self.map.insert(cid, node);
    }

    /// Looks up a connection and promotes it to the most-recently-used
    /// end.
    pub fn get(&mut self, cid: u64) -> Option<usize> {
        let node = *self.map.get(&cid)?;
        self.unlink(node);
        // Relink at the tail.
        self.nodes[node].prev = self.tail;
        self.nodes[node].next = None;
        if let Some(tail) = self.tail {
            self.nodes[tail].next = Some(node);
        } else {
            self.head = Some(node);
        }
        self.tail = Some(node);
        Some(self.nodes[node].token)
    }

    /// Removes a connection, returning its token.
    pub fn remove(&mut self, cid: u64) -> Option<usize> {
        let node = self.map.remove(&cid)?;
        self.unlink(node);
        Some(self.nodes.remove(node).token)
    }

    /// Iterates `(cid, token)` pairs from the least-recently-used end.
    pub fn iter_lru(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        LruIter {
            set: self,
            cursor: self.head,
        }
    }

    fn unlink(&mut self, node: usize) {
        let (prev, next) = (self.nodes[node].prev, self.nodes[node].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
    }
}

struct LruIter<'a> {
    set: &'a LruSet,
    cursor: Option<usize>,
}

impl Iterator for LruIter<'_> {
    type Item = (u64, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let node = &self.set.nodes[self.cursor?];
        self.cursor = node.next;
        Some((node.cid, node.token))
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_runs_from_least_to_most_recent() {
        let mut lru = LruSet::new();
        lru.insert(1, 10);
        lru.insert(2, 20);
        lru.insert(3, 30);
        let order: Vec<u64> = lru.iter_lru().map(|(cid, _)| cid).collect();
        assert_eq!(order, [1, 2, 3]);
    }

    #[test]
    fn get_promotes_to_the_most_recent_end() {
        let mut lru = LruSet::new();
        lru.insert(1, 10);
        lru.insert(2, 20);
        lru.insert(3, 30);
        assert_eq!(lru.get(1), Some(10));
        let order: Vec<u64> = lru.iter_lru().map(|(cid, _)| cid).collect();
        assert_eq!(order, [2, 3, 1]);
        assert_eq!(lru.get(99), None);
    }

    #[test]
    fn removal_relinks_neighbors() {
        let mut lru = LruSet::new();
        lru.insert(1, 10);
        lru.insert(2, 20);
        lru.insert(3, 30);
        assert_eq!(lru.remove(2), Some(20));
        assert!(!lru.contains(2));
        let order: Vec<u64> = lru.iter_lru().map(|(cid, _)| cid).collect();
        assert_eq!(order, [1, 3]);
        assert_eq!(lru.remove(1), Some(10));
        assert_eq!(lru.remove(3), Some(30));
        assert!(lru.is_empty());
        assert_eq!(lru.remove(3), None);
    }

    #[test]
    fn promote_and_remove_interleave() {
        let mut lru = LruSet::new();
        for cid in 0..8 {
            lru.insert(cid, cid as usize);
        }
        lru.get(0);
        lru.get(4);
        lru.remove(7);
        let order: Vec<u64> = lru.iter_lru().map(|(cid, _)| cid).collect();
        assert_eq!(order, [1, 2, 3, 5, 6, 0, 4]);
    }
}
