//! Trie-indexed tuple multiset (component A).
//!
//! Mirrors `tuplecontainer.py`'s `TupleContainer`: `self.contain` there is a
//! `dict[element] -> [count, subtrie_or_None]`; here the same shape is an
//! explicit `Entry { count, subtrie }` map. A concrete (formal-free)
//! template position is looked up directly; anything else falls back to
//! scanning every key and testing `element_matches`.

use crate::value::{element_matches, Element, Template, Tuple};
use std::collections::HashMap;

struct Entry {
    /// Copies of a tuple whose last element lands on this key at this depth.
    count: usize,
    /// Further elements, present only once some stored tuple continues past
    /// this key.
    subtrie: Option<Box<Trie>>,
}

#[derive(Default)]
pub struct Trie {
    entries: HashMap<Element, Entry>,
    /// Copies of the zero-arity tuple, if ever stored — not reachable via
    /// `entries` since there is no first element to key on.
    empty_tuple_count: usize,
}

impl Trie {
    pub fn new() -> Self {
        Trie::default()
    }

    pub fn add(&mut self, tuple: &Tuple) {
        match tuple.split_first() {
            None => self.empty_tuple_count += 1,
            Some((first, rest)) => {
                let entry = self.entries.entry(first.clone()).or_insert_with(|| Entry {
                    count: 0,
                    subtrie: None,
                });
                if rest.is_empty() {
                    entry.count += 1;
                } else {
                    entry
                        .subtrie
                        .get_or_insert_with(|| Box::new(Trie::new()))
                        .add(&rest.to_vec());
                }
            }
        }
    }

    /// Removes exactly one copy of `tuple`, pruning empty branches on the
    /// way back up. Returns whether a copy was present to remove.
    pub fn delete(&mut self, tuple: &Tuple) -> bool {
        match tuple.split_first() {
            None => {
                if self.empty_tuple_count > 0 {
                    self.empty_tuple_count -= 1;
                    true
                } else {
                    false
                }
            }
            Some((first, rest)) => {
                let Some(entry) = self.entries.get_mut(first) else {
                    return false;
                };
                let removed = if rest.is_empty() {
                    if entry.count > 0 {
                        entry.count -= 1;
                        true
                    } else {
                        false
                    }
                } else if let Some(sub) = entry.subtrie.as_mut() {
                    sub.delete(&rest.to_vec())
                } else {
                    false
                };

                if removed {
                    let prune = match &entry.subtrie {
                        Some(sub) => entry.count == 0 && sub.is_empty(),
                        None => entry.count == 0,
                    };
                    if prune {
                        self.entries.remove(first);
                    }
                }
                removed
            }
        }
    }

    /// Returns one tuple matching `template` without removing it, preferring
    /// a direct key lookup when `template` is formal-free.
    pub fn match_one(&self, template: &Template) -> Option<Tuple> {
        if template.is_empty() {
            return (self.empty_tuple_count > 0).then(Vec::new);
        }
        self.match_one_inner(template)
    }

    fn match_one_inner(&self, template: &[Element]) -> Option<Tuple> {
        let (first, rest) = template.split_first()?;

        if is_concrete(first) {
            if let Some(entry) = self.entries.get(first) {
                if let Some(v) = Self::descend_one(entry, first, rest) {
                    return Some(v);
                }
            }
            return None;
        }

        for (key, entry) in &self.entries {
            if element_matches(first, key) {
                if let Some(v) = Self::descend_one(entry, key, rest) {
                    return Some(v);
                }
            }
        }
        None
    }

    fn descend_one(entry: &Entry, key: &Element, rest: &[Element]) -> Option<Tuple> {
        if rest.is_empty() {
            (entry.count > 0).then(|| vec![key.clone()])
        } else {
            let sub = entry.subtrie.as_ref()?;
            let mut tail = sub.match_one_inner(rest)?;
            tail.insert(0, key.clone());
            Some(tail)
        }
    }

    /// All tuples matching `template` (lazily would be a generator in the
    /// original; collected eagerly here since callers always want the full
    /// set for `collect`/`copy_collect`).
    pub fn match_all(&self, template: &Template) -> Vec<Tuple> {
        if template.is_empty() {
            return vec![Vec::new(); self.empty_tuple_count];
        }
        self.match_all_inner(template)
    }

    fn match_all_inner(&self, template: &[Element]) -> Vec<Tuple> {
        let Some((first, rest)) = template.split_first() else {
            return vec![Vec::new()];
        };
        let mut out = Vec::new();
        for (key, entry) in &self.entries {
            if !element_matches(first, key) {
                continue;
            }
            if rest.is_empty() {
                for _ in 0..entry.count {
                    out.push(vec![key.clone()]);
                }
            } else if let Some(sub) = entry.subtrie.as_ref() {
                for tail in sub.match_all_inner(rest) {
                    let mut t = Vec::with_capacity(tail.len() + 1);
                    t.push(key.clone());
                    t.extend(tail);
                    out.push(t);
                }
            }
        }
        out
    }

    /// Every tuple currently stored, ignoring any template.
    pub fn enumerate_all(&self) -> Vec<Tuple> {
        let mut out = vec![Vec::new(); self.empty_tuple_count];
        for (key, entry) in &self.entries {
            for _ in 0..entry.count {
                out.push(vec![key.clone()]);
            }
            if let Some(sub) = entry.subtrie.as_ref() {
                for tail in sub.enumerate_all() {
                    let mut t = Vec::with_capacity(tail.len() + 1);
                    t.push(key.clone());
                    t.extend(tail);
                    out.push(t);
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        let mut total = self.empty_tuple_count;
        for entry in self.entries.values() {
            total += entry.count;
            if let Some(sub) = entry.subtrie.as_ref() {
                total += sub.len();
            }
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.empty_tuple_count == 0
    }
}

fn is_concrete(element: &Element) -> bool {
    match element {
        Element::Formal(_) => false,
        Element::Tuple(items) | Element::Sequence(items) => items.iter().all(is_concrete),
        _ => true,
    }
}
