//! The in-memory tier.
//!
//! A count- and cost-bounded key/value map with LRU eviction. Eviction order
//! is documented (least recently used first, where both `set` and `get`
//! refresh recency), but callers should only rely on the configured limits
//! being enforced, never on which entry goes first.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::MemoryConfig;
use crate::error::CacheError;
use crate::store::Store;

/// A node in the recency list, stored in a slab indexed by `usize`.
struct Node<V> {
    key: String,
    value: V,
    cost: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner<V> {
    map: HashMap<String, usize>,
    nodes: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    /// Most recently used entry.
    head: Option<usize>,
    /// Least recently used entry; the next eviction victim.
    tail: Option<usize>,
    total_cost: u64,
}

impl<V> Inner<V> {
    fn alloc(&mut self, node: Node<V>) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.nodes[idx].as_mut().expect("linked node exists");
            let links = (node.prev, node.next);
            node.prev = None;
            node.next = None;
            links
        };
        match prev {
            Some(p) => self.nodes[p].as_mut().expect("linked node exists").next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].as_mut().expect("linked node exists").prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.nodes[idx].as_mut().expect("linked node exists");
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.nodes[h].as_mut().expect("linked node exists").prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    /// Evicts the least recently used entry. Returns `false` when empty.
    fn evict_one(&mut self) -> bool {
        let Some(idx) = self.tail else {
            return false;
        };
        self.unlink(idx);
        let node = self.nodes[idx].take().expect("tail node exists");
        self.map.remove(&node.key);
        self.total_cost -= node.cost;
        self.free.push(idx);
        true
    }

    fn remove_key(&mut self, key: &str) {
        if let Some(idx) = self.map.remove(key) {
            self.unlink(idx);
            let node = self.nodes[idx].take().expect("mapped node exists");
            self.total_cost -= node.cost;
            self.free.push(idx);
        }
    }
}

/// The memory tier: a thread-safe, bounded key/value map.
///
/// All operations are safe under concurrent invocation and never touch the
/// filesystem. The tier never fails; its [`Store`] impl always returns `Ok`.
pub struct MemoryCache<V> {
    config: MemoryConfig,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> MemoryCache<V> {
    pub fn new(config: MemoryConfig) -> Self {
        MemoryCache {
            config,
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                nodes: Vec::new(),
                free: Vec::new(),
                head: None,
                tail: None,
                total_cost: 0,
            }),
        }
    }

    /// Stores `value` under `key` with the given cost in bytes, evicting
    /// least-recently-used entries until the configured limits hold again.
    pub fn set(&self, key: &str, value: V, cost: u64) {
        let mut inner = self.inner.lock().unwrap();
        match inner.map.get(key).copied() {
            Some(idx) => {
                let old_cost = {
                    let node = inner.nodes[idx].as_mut().expect("mapped node exists");
                    let old_cost = node.cost;
                    node.value = value;
                    node.cost = cost;
                    old_cost
                };
                inner.total_cost = inner.total_cost - old_cost + cost;
                inner.touch(idx);
            }
            None => {
                let idx = inner.alloc(Node {
                    key: key.to_owned(),
                    value,
                    cost,
                    prev: None,
                    next: None,
                });
                inner.push_front(idx);
                inner.map.insert(key.to_owned(), idx);
                inner.total_cost += cost;
            }
        }

        let max_entries = self.config.max_entries;
        let max_total_cost = self.config.max_total_cost;
        while (max_entries > 0 && inner.map.len() > max_entries)
            || (max_total_cost > 0 && inner.total_cost > max_total_cost)
        {
            if !inner.evict_one() {
                break;
            }
        }
    }

    /// Returns the value stored under `key`, refreshing its recency.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.map.get(key).copied()?;
        inner.touch(idx);
        inner.nodes[idx].as_ref().map(|node| node.value.clone())
    }

    pub fn remove(&self, key: &str) {
        self.inner.lock().unwrap().remove_key(key);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.clear();
        inner.nodes.clear();
        inner.free.clear();
        inner.head = None;
        inner.tail = None;
        inner.total_cost = 0;
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the costs of all held entries.
    pub fn total_cost(&self) -> u64 {
        self.inner.lock().unwrap().total_cost
    }
}

impl<V: Clone + Send + Sync> Store<V> for MemoryCache<V> {
    fn set(&self, key: &str, value: V, raw: Option<&[u8]>) -> Result<(), CacheError> {
        let cost = raw.map(|b| b.len() as u64).unwrap_or(0);
        MemoryCache::set(self, key, value, cost);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<V>, CacheError> {
        Ok(MemoryCache::get(self, key))
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        MemoryCache::remove(self, key);
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        MemoryCache::clear(self);
        Ok(())
    }
}
