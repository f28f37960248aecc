//! The one list type, shared by the compiler's input and the language's
//! runtime lists.
use core::fmt;
use std::sync::Arc;

use super::Value;

/// An immutable sequence of values.
///
/// A `Seq` is either the empty sequence or a shared node. Nodes come in two
/// flavors that behave identically through [`Seq::first`], [`Seq::rest`],
/// [`Seq::nth`] and [`Seq::len`]:
///
/// * cons cells, produced by [`Seq::cons`], prepending in O(1)
/// * array slices with a continuation, produced by [`Seq::from_array`],
///   giving O(1) positional access (argument vectors use these)
#[derive(Clone, Default)]
pub struct Seq(Option<Arc<Node>>);

enum Node {
    Cons {
        head: Value,
        tail: Seq,
        len: usize,
    },
    Array {
        items: Arc<[Value]>,
        offset: usize,
        tail: Seq,
        len: usize,
    },
}

impl Seq {
    /// The empty sequence. There is no other representation of "no elements".
    pub const EMPTY: Seq = Seq(None);

    pub fn cons(head: Value, tail: Seq) -> Seq {
        let len = tail.len() + 1;
        Seq(Some(Arc::new(Node::Cons { head, tail, len })))
    }

    /// Views `items[offset..]` followed by `tail` as one sequence.
    ///
    /// The array is shared, not copied; an exhausted slice collapses to `tail`.
    pub fn from_array(items: impl Into<Arc<[Value]>>, offset: usize, tail: Seq) -> Seq {
        let items = items.into();
        if offset >= items.len() {
            return tail;
        }
        let len = items.len() - offset + tail.len();
        Seq(Some(Arc::new(Node::Array {
            items,
            offset,
            tail,
            len,
        })))
    }

    pub fn from_vec(items: Vec<Value>) -> Seq {
        Self::from_array(items, 0, Seq::EMPTY)
    }

    /// Builds a cons list holding `items` in order.
    pub fn list(items: impl IntoIterator<Item = Value>) -> Seq {
        let items: Vec<_> = items.into_iter().collect();
        items
            .into_iter()
            .rev()
            .fold(Seq::EMPTY, |tail, head| Seq::cons(head, tail))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn len(&self) -> usize {
        match self.0.as_deref() {
            None => 0,
            Some(Node::Cons { len, .. } | Node::Array { len, .. }) => *len,
        }
    }

    /// The first element, or `None` for the empty sequence.
    pub fn first(&self) -> Option<&Value> {
        match self.0.as_deref()? {
            Node::Cons { head, .. } => Some(head),
            Node::Array { items, offset, .. } => Some(&items[*offset]),
        }
    }

    /// Everything after the first element. The rest of the empty sequence is empty.
    pub fn rest(&self) -> Seq {
        match self.0.as_deref() {
            None => Seq::EMPTY,
            Some(Node::Cons { tail, .. }) => tail.clone(),
            Some(Node::Array {
                items,
                offset,
                tail,
                ..
            }) => Seq::from_array(Arc::clone(items), offset + 1, tail.clone()),
        }
    }

    pub fn nth(&self, n: usize) -> Option<&Value> {
        let mut seq = self;
        let mut n = n;
        loop {
            match seq.0.as_deref()? {
                Node::Cons { head, tail, .. } => {
                    if n == 0 {
                        return Some(head);
                    }
                    n -= 1;
                    seq = tail;
                }
                Node::Array {
                    items,
                    offset,
                    tail,
                    ..
                } => {
                    let available = items.len() - offset;
                    if n < available {
                        return Some(&items[offset + n]);
                    }
                    // the remainder is the continuation's business
                    n -= available;
                    seq = tail;
                }
            }
        }
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            seq: self,
            index: 0,
        }
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.iter().cloned().collect()
    }

    #[cfg(test)]
    fn is_cons(&self) -> bool {
        matches!(self.0.as_deref(), Some(Node::Cons { .. }))
    }
}

// Long lists would otherwise be dropped one stack frame per cell.
impl Drop for Seq {
    fn drop(&mut self) {
        let mut next = self.0.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(Node::Cons { mut tail, .. } | Node::Array { mut tail, .. }) => {
                    next = tail.0.take();
                }
                Err(_) => break,
            }
        }
    }
}

pub struct Iter<'a> {
    seq: &'a Seq,
    index: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Value;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let seq: &'a Seq = self.seq;
            match seq.0.as_deref()? {
                Node::Cons { head, tail, .. } => {
                    self.seq = tail;
                    return Some(head);
                }
                Node::Array {
                    items,
                    offset,
                    tail,
                    ..
                } => {
                    let at = offset + self.index;
                    if at < items.len() {
                        self.index += 1;
                        return Some(&items[at]);
                    }
                    self.seq = tail;
                    self.index = 0;
                }
            }
        }
    }
}

impl<'a> IntoIterator for &'a Seq {
    type Item = &'a Value;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl FromIterator<Value> for Seq {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Seq::list(iter)
    }
}

impl PartialEq for Seq {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
