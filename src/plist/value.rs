//! Tagged property-tree value: the in-memory model shared by the database,
//! repository indexes, package descriptors, and transactions.

use std::collections::HashMap;

/// A single node in the property tree.
///
/// Mirrors the tagged-variant model described for the on-disk plist format:
/// bool, signed/unsigned integer, string, byte-blob, ordered sequence, and
/// mapping-of-strings-to-values. Structural equality is order-insensitive
/// for mappings and order-sensitive for sequences.
#[derive(Debug, Clone)]
pub enum Value {
    /// Boolean scalar.
    Bool(bool),
    /// Signed 64-bit integer scalar.
    Int(i64),
    /// Unsigned 64-bit integer scalar.
    UInt(u64),
    /// UTF-8 string scalar.
    Str(String),
    /// Opaque byte blob, e.g. a binary hash or signature.
    Bytes(Vec<u8>),
    /// Ordered sequence of values.
    Seq(Sequence),
    /// Mapping of string keys to values, insertion-ordered.
    Map(Mapping),
}

/// An ordered sequence container with an immutability flag.
#[derive(Debug, Clone, Default)]
pub struct Sequence {
    items: Vec<Value>,
    immutable: bool,
}

/// A mapping container with an immutability flag.
///
/// Keys preserve insertion order for iteration, backed by a hash index for
/// O(1) lookup. Canonical serialization sorts keys independently of this
/// order (see `plist::text`).
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    order: Vec<String>,
    slots: Vec<Value>,
    index: HashMap<String, usize>,
    immutable: bool,
}

/// Error returned when mutating an immutable subtree.
#[derive(Debug, Clone, thiserror::Error)]
#[error("attempted to mutate an immutable property-tree value")]
pub struct ImmutableError;

impl Sequence {
    /// Creates an empty, mutable sequence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the sequence has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether this sequence rejects further mutation.
    #[must_use]
    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    /// Freezes this sequence in place.
    pub fn make_immutable(&mut self) {
        self.immutable = true;
        for item in &mut self.items {
            item.make_immutable();
        }
    }

    /// Iterates over elements in order.
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.items.iter()
    }

    /// Appends a value at the end.
    ///
    /// # Errors
    /// Returns [`ImmutableError`] if this sequence is frozen.
    pub fn append(&mut self, value: Value) -> Result<(), ImmutableError> {
        if self.immutable {
            return Err(ImmutableError);
        }
        self.items.push(value);
        Ok(())
    }

    /// Prepends a value at the front.
    ///
    /// # Errors
    /// Returns [`ImmutableError`] if this sequence is frozen.
    pub fn prepend(&mut self, value: Value) -> Result<(), ImmutableError> {
        if self.immutable {
            return Err(ImmutableError);
        }
        self.items.insert(0, value);
        Ok(())
    }

    /// Gets the element at `idx`, if present.
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.items.get(idx)
    }

    /// Returns the sequence's string elements, skipping non-string entries.
    pub fn strings(&self) -> impl Iterator<Item = &str> {
        self.items.iter().filter_map(Value::as_str)
    }

    /// Removes the first element equal to `needle` (string comparison), if any.
    ///
    /// # Errors
    /// Returns [`ImmutableError`] if this sequence is frozen.
    pub fn remove_string(&mut self, needle: &str) -> Result<bool, ImmutableError> {
        if self.immutable {
            return Err(ImmutableError);
        }
        if let Some(pos) = self.items.iter().position(|v| v.as_str() == Some(needle)) {
            self.items.remove(pos);
            return Ok(true);
        }
        Ok(false)
    }

    fn deep_copy(&self) -> Self {
        Self {
            items: self.items.iter().map(Value::deep_copy).collect(),
            immutable: false,
        }
    }

    fn structural_eq(&self, other: &Self) -> bool {
        self.items.len() == other.items.len()
            && self
                .items
                .iter()
                .zip(&other.items)
                .all(|(a, b)| a.structural_eq(b))
    }
}

impl FromIterator<Value> for Sequence {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Self {
            items: iter.into_iter().collect(),
            immutable: false,
        }
    }
}

impl Mapping {
    /// Creates an empty, mutable mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of key/value pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the mapping has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Whether this mapping rejects further mutation.
    #[must_use]
    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    /// Freezes this mapping and every value it contains.
    pub fn make_immutable(&mut self) {
        self.immutable = true;
        for v in &mut self.slots {
            v.make_immutable();
        }
    }

    /// Looks up a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.index.get(key).map(|&i| &self.slots[i])
    }

    /// Looks up a string-valued key.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Looks up a uint-valued key.
    #[must_use]
    pub fn get_uint(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_uint)
    }

    /// Looks up a bool-valued key, defaulting to `false` when absent.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Looks up a sequence-valued key.
    #[must_use]
    pub fn get_seq(&self, key: &str) -> Option<&Sequence> {
        self.get(key).and_then(Value::as_seq)
    }

    /// Looks up a mapping-valued key.
    #[must_use]
    pub fn get_map(&self, key: &str) -> Option<&Mapping> {
        self.get(key).and_then(Value::as_map)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Key/value pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.order
            .iter()
            .map(|k| (k.as_str(), &self.slots[self.index[k]]))
    }

    /// Inserts or replaces a key's value.
    ///
    /// # Errors
    /// Returns [`ImmutableError`] if this mapping is frozen.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Result<(), ImmutableError> {
        if self.immutable {
            return Err(ImmutableError);
        }
        let key = key.into();
        if let Some(&i) = self.index.get(&key) {
            self.slots[i] = value;
        } else {
            self.index.insert(key.clone(), self.slots.len());
            self.order.push(key);
            self.slots.push(value);
        }
        Ok(())
    }

    /// Removes a key, returning its prior value.
    ///
    /// # Errors
    /// Returns [`ImmutableError`] if this mapping is frozen.
    pub fn remove(&mut self, key: &str) -> Result<Option<Value>, ImmutableError> {
        if self.immutable {
            return Err(ImmutableError);
        }
        let Some(i) = self.index.remove(key) else {
            return Ok(None);
        };
        self.order.remove(i);
        let value = self.slots.remove(i);
        for idx in self.index.values_mut() {
            if *idx > i {
                *idx -= 1;
            }
        }
        Ok(Some(value))
    }

    /// Returns a deep, mutable copy of this mapping regardless of its own
    /// immutability flag (the "copy_mutable" operation used when overlaying
    /// `stage` onto an immutable `index`).
    #[must_use]
    pub fn copy_mutable(&self) -> Self {
        self.deep_copy()
    }

    fn deep_copy(&self) -> Self {
        Self {
            order: self.order.clone(),
            slots: self.slots.iter().map(Value::deep_copy).collect(),
            index: self.index.clone(),
            immutable: false,
        }
    }

    fn structural_eq(&self, other: &Self) -> bool {
        if self.order.len() != other.order.len() {
            return false;
        }
        self.iter()
            .all(|(k, v)| other.get(k).is_some_and(|ov| v.structural_eq(ov)))
    }
}

impl FromIterator<(String, Value)> for Mapping {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            // Construction-time insert; safe to ignore immutability since
            // `map` is freshly created and mutable.
            let _ = map.insert(k, v);
        }
        map
    }
}

impl Value {
    /// Wraps a scalar string.
    #[must_use]
    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    /// An empty, mutable mapping value.
    #[must_use]
    pub fn empty_map() -> Self {
        Self::Map(Mapping::new())
    }

    /// An empty, mutable sequence value.
    #[must_use]
    pub fn empty_seq() -> Self {
        Self::Seq(Sequence::new())
    }

    /// Borrows the string scalar, if this value is a `Str`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Borrows the unsigned integer scalar, if this value is a `UInt`.
    #[must_use]
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::UInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrows the integer scalar, if this value is an `Int`.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrows the bool scalar, if this value is a `Bool`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrows the byte blob, if this value is `Bytes`.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Borrows the sequence, if this value is a `Seq`.
    #[must_use]
    pub fn as_seq(&self) -> Option<&Sequence> {
        match self {
            Self::Seq(s) => Some(s),
            _ => None,
        }
    }

    /// Mutably borrows the sequence, if this value is a `Seq`.
    pub fn as_seq_mut(&mut self) -> Option<&mut Sequence> {
        match self {
            Self::Seq(s) => Some(s),
            _ => None,
        }
    }

    /// Borrows the mapping, if this value is a `Map`.
    #[must_use]
    pub fn as_map(&self) -> Option<&Mapping> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Mutably borrows the mapping, if this value is a `Map`.
    pub fn as_map_mut(&mut self) -> Option<&mut Mapping> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Recursively sets the immutable flag on this subtree.
    ///
    /// Once set, it is a one-way transition: no operation in this crate
    /// clears it again.
    pub fn make_immutable(&mut self) {
        match self {
            Self::Seq(s) => s.make_immutable(),
            Self::Map(m) => m.make_immutable(),
            _ => {}
        }
    }

    /// Whether this subtree (if a container) has been frozen.
    #[must_use]
    pub fn is_immutable(&self) -> bool {
        match self {
            Self::Seq(s) => s.is_immutable(),
            Self::Map(m) => m.is_immutable(),
            _ => true,
        }
    }

    /// Produces a fully mutable deep copy, regardless of this value's own
    /// immutability.
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        match self {
            Self::Bool(b) => Self::Bool(*b),
            Self::Int(i) => Self::Int(*i),
            Self::UInt(u) => Self::UInt(*u),
            Self::Str(s) => Self::Str(s.clone()),
            Self::Bytes(b) => Self::Bytes(b.clone()),
            Self::Seq(s) => Self::Seq(s.deep_copy()),
            Self::Map(m) => Self::Map(m.deep_copy()),
        }
    }

    /// Structural, order-insensitive (for maps) / order-sensitive (for
    /// sequences) equality.
    #[must_use]
    pub fn structural_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::UInt(a), Self::UInt(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Seq(a), Self::Seq(b)) => a.structural_eq(b),
            (Self::Map(a), Self::Map(b)) => a.structural_eq(b),
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.structural_eq(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_equality_is_order_insensitive() {
        let mut a = Mapping::new();
        a.insert("x", Value::Int(1)).unwrap();
        a.insert("y", Value::Int(2)).unwrap();
        let mut b = Mapping::new();
        b.insert("y", Value::Int(2)).unwrap();
        b.insert("x", Value::Int(1)).unwrap();
        assert!(Value::Map(a).structural_eq(&Value::Map(b)));
    }

    #[test]
    fn sequence_equality_is_order_sensitive() {
        let a = Sequence::from_iter([Value::Int(1), Value::Int(2)]);
        let b = Sequence::from_iter([Value::Int(2), Value::Int(1)]);
        assert!(!Value::Seq(a).structural_eq(&Value::Seq(b)));
    }

    #[test]
    fn immutable_rejects_mutation() {
        let mut m = Mapping::new();
        m.insert("a", Value::Bool(true)).unwrap();
        m.make_immutable();
        assert!(m.insert("b", Value::Bool(false)).is_err());
    }

    #[test]
    fn deep_copy_is_mutable_even_from_frozen_source() {
        let mut m = Mapping::new();
        m.insert("a", Value::Bool(true)).unwrap();
        m.make_immutable();
        let mut copy = m.copy_mutable();
        assert!(copy.insert("b", Value::Bool(false)).is_ok());
    }
}
