//! Tuple / template / element data model.
//!
//! A tuple is an ordered finite sequence of elements; a template is a tuple
//! of the same arity where each position is either a concrete value or a
//! type marker ("formal") matching any element of that runtime class.
//! Sequence-valued elements are stored by value (`Vec<Element>` derives
//! structural `Hash`/`Eq`), so once built they are safe to use as trie keys.

use crate::ids::TupleSpaceId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The runtime class a type marker can match against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Class {
    Int,
    Float,
    Str,
    Tuple,
    TupleSpaceRef,
    Sequence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Element {
    Int(i64),
    /// Stored as bits so `Element` can derive `Eq`/`Hash`; tuple matching
    /// never needs float ordering, only equality.
    Float(u64),
    Str(String),
    Tuple(Vec<Element>),
    TupleSpaceRef(TupleSpaceId),
    Sequence(Vec<Element>),
    /// A formal: matches any element whose class equals the marker. Only
    /// valid in a template, never in a stored tuple.
    Formal(Class),
}

impl Element {
    pub fn float(v: f64) -> Self {
        Element::Float(v.to_bits())
    }

    pub fn class(&self) -> Option<Class> {
        match self {
            Element::Int(_) => Some(Class::Int),
            Element::Float(_) => Some(Class::Float),
            Element::Str(_) => Some(Class::Str),
            Element::Tuple(_) => Some(Class::Tuple),
            Element::TupleSpaceRef(_) => Some(Class::TupleSpaceRef),
            Element::Sequence(_) => Some(Class::Sequence),
            Element::Formal(_) => None,
        }
    }

    pub fn is_formal(&self) -> bool {
        matches!(self, Element::Formal(_))
    }

    /// Recursively walk every nested `TupleSpaceRef` this element carries,
    /// mirroring `utils.containsTS`'s traversal for reference-graph
    /// maintenance.
    pub fn walk_tuplespace_refs(&self, f: &mut impl FnMut(TupleSpaceId)) {
        match self {
            Element::TupleSpaceRef(id) => f(*id),
            Element::Tuple(items) | Element::Sequence(items) => {
                for item in items {
                    item.walk_tuplespace_refs(f);
                }
            }
            _ => {}
        }
    }
}

impl Eq for Element {}

impl std::hash::Hash for Element {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Element::Int(v) => v.hash(state),
            Element::Float(bits) => bits.hash(state),
            Element::Str(s) => s.hash(state),
            Element::Tuple(items) | Element::Sequence(items) => items.hash(state),
            Element::TupleSpaceRef(id) => id.hash(state),
            Element::Formal(c) => c.hash(state),
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::Int(v) => write!(f, "{v}"),
            Element::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            Element::Str(s) => write!(f, "{s:?}"),
            Element::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Element::Sequence(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Element::TupleSpaceRef(id) => write!(f, "<ts:{id}>"),
            Element::Formal(c) => write!(f, "<formal:{c:?}>"),
        }
    }
}

/// An ordered sequence of elements, stored in a container.
pub type Tuple = Vec<Element>;

/// A template has the same shape as a tuple but positions may be formals.
pub type Template = Vec<Element>;

/// Structural, positional match: equal length, and each position either
/// equals, or (template side is a formal) the tuple element's class equals
/// the formal's marker; nested tuples/sequences recurse by the same rule.
pub fn element_matches(template: &Element, value: &Element) -> bool {
    match template {
        Element::Formal(class) => value.class() == Some(*class),
        Element::Tuple(t_items) => match value {
            Element::Tuple(v_items) => {
                t_items.len() == v_items.len()
                    && t_items
                        .iter()
                        .zip(v_items.iter())
                        .all(|(t, v)| element_matches(t, v))
            }
            _ => false,
        },
        Element::Sequence(t_items) => match value {
            Element::Sequence(v_items) => {
                t_items.len() == v_items.len()
                    && t_items
                        .iter()
                        .zip(v_items.iter())
                        .all(|(t, v)| element_matches(t, v))
            }
            _ => false,
        },
        other => other == value,
    }
}

pub fn tuple_matches(template: &Template, tuple: &Tuple) -> bool {
    template.len() == tuple.len()
        && template
            .iter()
            .zip(tuple.iter())
            .all(|(t, v)| element_matches(t, v))
}
