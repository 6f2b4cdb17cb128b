//! Reference-counted constant pools.

use crate::error::AbcError;
use anyhow::Result;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Distinct entries in first-seen order, each with a reference count.
///
/// Indices start at `count_from`: 1 for the constant pools (index 0 is the
/// reserved "none" entry), 0 for methods, or the size of an earlier pool
/// when two pools share one index space.
#[derive(Debug, Clone)]
pub struct Pool<T> {
    values: Vec<T>,
    refs: Vec<u32>,
    index: HashMap<T, usize>,
    pub count_from: u32,
}

impl<T: Clone + Eq + Hash + Debug> Pool<T> {
    pub fn new(count_from: u32) -> Self {
        Self {
            values: Vec::new(),
            refs: Vec::new(),
            index: HashMap::new(),
            count_from,
        }
    }

    /// Count one more reference to `v` and return its new count; 1 means
    /// `v` was just added.
    pub fn add(&mut self, v: T) -> u32 {
        match self.index.get(&v) {
            Some(&i) => {
                self.refs[i] += 1;
                self.refs[i]
            }
            None => {
                self.index.insert(v.clone(), self.values.len());
                self.values.push(v);
                self.refs.push(1);
                1
            }
        }
    }

    /// Emitted index of `v`.
    pub fn id(&self, v: &T) -> Result<u32> {
        self.index
            .get(v)
            .map(|&i| i as u32 + self.count_from)
            .ok_or_else(|| AbcError::internal(format!("{:?} was never added to its pool", v)))
    }

    pub fn contains(&self, v: &T) -> bool {
        self.index.contains_key(v)
    }

    /// The count written in the file header for this pool.
    pub fn size(&self) -> u32 {
        self.values.len() as u32 + self.count_from
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    /// Most referenced first; equal counts keep their insertion order.
    pub fn sort(&mut self) {
        let mut order: Vec<usize> = (0..self.values.len()).collect();
        order.sort_by(|&a, &b| self.refs[b].cmp(&self.refs[a]));
        let values: Vec<T> = order.iter().map(|&i| self.values[i].clone()).collect();
        let refs: Vec<u32> = order.iter().map(|&i| self.refs[i]).collect();
        self.index = values
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), i))
            .collect();
        self.values = values;
        self.refs = refs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(entries: &[&str]) -> Pool<String> {
        let mut p = Pool::new(1);
        for e in entries {
            p.add(e.to_string());
        }
        p
    }

    #[test]
    fn frequent_entries_get_small_indices() {
        let mut p = pool(&["a", "b", "c", "b", "c", "c"]);
        assert_eq!(p.id(&"a".to_string()).unwrap(), 1);
        p.sort();
        let order: Vec<&str> = p.values().iter().map(String::as_str).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
        assert_eq!(p.id(&"c".to_string()).unwrap(), 1);
        assert_eq!(p.size(), 4);
    }

    #[test]
    fn ties_keep_insertion_order_every_time() {
        let entries = ["x", "y", "z", "w", "y", "w"];
        let mut first = pool(&entries);
        let mut second = pool(&entries);
        first.sort();
        second.sort();
        assert_eq!(first.values(), second.values());
        let order: Vec<&str> = first.values().iter().map(String::as_str).collect();
        assert_eq!(order, vec!["y", "w", "x", "z"]);
        first.sort();
        assert_eq!(first.values(), second.values());
    }

    #[test]
    fn shared_index_space() {
        let mut a: Pool<u32> = Pool::new(0);
        a.add(7);
        a.add(9);
        let mut b: Pool<u32> = Pool::new(a.size());
        b.add(3);
        assert_eq!(b.id(&3).unwrap(), 2);
        assert_eq!(b.size(), 3);
        assert!(b.id(&7).is_err());
    }
}
