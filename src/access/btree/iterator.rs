use super::leaf::LeafNode;
use super::node::Node;
use super::store::NodeStore;
use crate::storage::error::{StorageError, StorageResult};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

/// Inclusive key range. A missing bound is unbounded on that side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange<K> {
    pub from: Option<K>,
    pub to: Option<K>,
}

impl<K> KeyRange<K> {
    pub fn new(from: Option<K>, to: Option<K>) -> Self {
        Self { from, to }
    }

    pub fn between(from: K, to: K) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn all() -> Self {
        Self { from: None, to: None }
    }
}

/// Sort `ranges` and combine the ones that overlap or touch.
///
/// Ranges whose lower bound lies above their upper bound select nothing and
/// are dropped. An empty input selects everything.
pub fn merge_ranges<K: Clone>(
    ranges: &[KeyRange<K>],
    compare: impl Fn(&K, &K) -> Ordering,
) -> Vec<KeyRange<K>> {
    if ranges.is_empty() {
        return vec![KeyRange::all()];
    }

    let mut sorted: Vec<KeyRange<K>> = ranges
        .iter()
        .filter(|range| match (&range.from, &range.to) {
            (Some(from), Some(to)) => compare(from, to) != Ordering::Greater,
            _ => true,
        })
        .cloned()
        .collect();
    sorted.sort_by(|a, b| match (&a.from, &b.from) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => compare(x, y),
    });

    let mut merged: Vec<KeyRange<K>> = Vec::with_capacity(sorted.len());
    for range in sorted {
        if let Some(last) = merged.last_mut() {
            let overlaps = match (&last.to, &range.from) {
                (Some(to), Some(from)) => compare(from, to) != Ordering::Greater,
                _ => true,
            };
            if overlaps {
                last.to = match (last.to.take(), range.to) {
                    (Some(a), Some(b)) => Some(if compare(&a, &b) == Ordering::Less { b } else { a }),
                    _ => None,
                };
                continue;
            }
        }
        merged.push(range);
    }
    merged
}

/// Values of a single leaf, in key order, up to an optional upper bound.
///
/// Yields `StorageResult<V>` because every step decodes from the page.
pub struct LeafIter<K, V> {
    leaf: LeafNode<K, V>,
    position: usize,
    to: Option<K>,
    passed_upper_bound: bool,
    finished: bool,
}

impl<K, V> LeafIter<K, V> {
    pub(crate) fn new(leaf: LeafNode<K, V>, position: usize, to: Option<K>) -> Self {
        Self {
            leaf,
            position,
            to,
            passed_upper_bound: false,
            finished: false,
        }
    }

    /// Whether iteration stopped at a key above the upper bound, as opposed
    /// to running off the end of the leaf.
    pub fn passed_upper_bound(&self) -> bool {
        self.passed_upper_bound
    }

    pub fn leaf(&self) -> &LeafNode<K, V> {
        &self.leaf
    }

    fn next_value(&mut self) -> StorageResult<Option<V>> {
        if self.finished {
            return Ok(None);
        }

        if let Some(to) = &self.to {
            match self.leaf.compare_key_at(self.position, to)? {
                Some(Ordering::Greater) => {
                    self.passed_upper_bound = true;
                    self.finished = true;
                    return Ok(None);
                }
                Some(_) => {}
                None => {
                    self.finished = true;
                    return Ok(None);
                }
            }
        } else if self.position >= self.leaf.num_entries() {
            self.finished = true;
            return Ok(None);
        }

        let value = self.leaf.value_at(self.position)?;
        self.position += 1;
        Ok(Some(value))
    }
}

impl<K, V> Iterator for LeafIter<K, V> {
    type Item = StorageResult<V>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_value() {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Lazy walk over the leaf chain for a list of disjoint, sorted ranges.
pub struct TreeIter<K, V> {
    store: Arc<NodeStore<K, V>>,
    root: Node<K, V>,
    ranges: VecDeque<KeyRange<K>>,
    range: Option<KeyRange<K>>,
    current: Option<LeafIter<K, V>>,
    /// Leaves visited for the current range; more than there are pages means a cycle.
    hops: usize,
    max_hops: usize,
    finished: bool,
}

impl<K: Clone, V> TreeIter<K, V> {
    pub(crate) fn new(
        store: Arc<NodeStore<K, V>>,
        root: Node<K, V>,
        ranges: Vec<KeyRange<K>>,
    ) -> StorageResult<Self> {
        let max_hops = store.manager().num_pages()?;
        Ok(Self {
            store,
            root,
            ranges: ranges.into(),
            range: None,
            current: None,
            hops: 0,
            max_hops,
            finished: false,
        })
    }

    fn advance(&mut self) -> StorageResult<Option<V>> {
        loop {
            if let Some(current) = self.current.as_mut() {
                if let Some(value) = current.next_value()? {
                    return Ok(Some(value));
                }

                let next = if current.passed_upper_bound() {
                    None
                } else {
                    current.leaf().next_leaf_id()
                };

                self.current = match (next, self.range.as_ref()) {
                    (Some(id), Some(range)) => {
                        self.hops += 1;
                        if self.hops > self.max_hops {
                            return Err(StorageError::corruption(format!(
                                "leaf chain revisits pages (at leaf {})",
                                id
                            )));
                        }
                        let leaf = self.store.load_leaf(id)?;
                        Some(leaf.iter(range.from.as_ref(), range.to.clone())?)
                    }
                    _ => None,
                };
                continue;
            }

            let Some(range) = self.ranges.pop_front() else {
                return Ok(None);
            };
            let leaf = self.root.find_leaf(range.from.as_ref())?;
            self.current = Some(leaf.iter(range.from.as_ref(), range.to.clone())?);
            self.range = Some(range);
            self.hops = 0;
        }
    }
}

impl<K: Clone, V> Iterator for TreeIter<K, V> {
    type Item = StorageResult<V>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.advance() {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
