//! Identity Map - key-normalized containers used to join record sets in memory
//!
//! Keys of any type are projected to a string for hashing. Values whose string
//! forms coincide share a slot: `1` and `"1"` address the same entry. This
//! lets a numeric primary key join against a foreign key stored as a string,
//! and it means a caller that must keep such values apart has to use a key
//! type whose projections differ.

use std::borrow::Cow;
use std::collections::HashMap;

use serde_json::{Map, Value};

/// A key that can be projected to the string used for identity lookups
pub trait IdentityKey {
    fn identity(&self) -> Cow<'_, str>;
}

impl IdentityKey for Value {
    fn identity(&self) -> Cow<'_, str> {
        match self {
            Value::String(s) => Cow::Borrowed(s.as_str()),
            Value::Null => Cow::Borrowed("null"),
            Value::Bool(true) => Cow::Borrowed("true"),
            Value::Bool(false) => Cow::Borrowed("false"),
            Value::Number(n) => Cow::Owned(n.to_string()),
            other => Cow::Owned(other.to_string()),
        }
    }
}

impl IdentityKey for str {
    fn identity(&self) -> Cow<'_, str> {
        Cow::Borrowed(self)
    }
}

impl IdentityKey for String {
    fn identity(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.as_str())
    }
}

impl IdentityKey for bool {
    fn identity(&self) -> Cow<'_, str> {
        Cow::Borrowed(if *self { "true" } else { "false" })
    }
}

impl IdentityKey for uuid::Uuid {
    fn identity(&self) -> Cow<'_, str> {
        Cow::Owned(self.to_string())
    }
}

macro_rules! numeric_identity {
    ($($ty:ty),*) => {
        $(impl IdentityKey for $ty {
            fn identity(&self) -> Cow<'_, str> {
                Cow::Owned(self.to_string())
            }
        })*
    };
}

numeric_identity!(i32, i64, u32, u64, usize);

impl<T: IdentityKey + ?Sized> IdentityKey for &T {
    fn identity(&self) -> Cow<'_, str> {
        (**self).identity()
    }
}

/// Something records can be keyed by: exposes named field values
pub trait FieldSource {
    fn field(&self, name: &str) -> Option<&Value>;
}

impl FieldSource for Map<String, Value> {
    fn field(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

impl<T: FieldSource + ?Sized> FieldSource for &T {
    fn field(&self, name: &str) -> Option<&Value> {
        (**self).field(name)
    }
}

/// Associative container keyed by the string projection of arbitrary keys.
///
/// Lookups and inserts are O(1) amortized; keys are reported back in their
/// original form and in insertion order.
#[derive(Debug, Clone)]
pub struct IdentityMap<K, V> {
    entries: HashMap<String, (K, V)>,
    order: Vec<String>,
}

impl<K, V> Default for IdentityMap<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }
}

impl<K, V> IdentityMap<K, V>
where
    K: IdentityKey,
{
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty map with room for `capacity` keys
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: Vec::with_capacity(capacity),
        }
    }

    /// Insert or overwrite the value for `key`, returning the previous value.
    ///
    /// Overwriting keeps the slot's original position in `get_keys()` but
    /// stores the new original key.
    pub fn set(&mut self, key: K, value: V) -> Option<V> {
        let projected = key.identity().into_owned();
        match self.entries.insert(projected.clone(), (key, value)) {
            Some((_, previous)) => Some(previous),
            None => {
                self.order.push(projected);
                None
            }
        }
    }

    /// Get the value stored for `key`
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        Q: IdentityKey + ?Sized,
    {
        self.entries.get(key.identity().as_ref()).map(|(_, v)| v)
    }

    /// Get a mutable reference to the value stored for `key`
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        Q: IdentityKey + ?Sized,
    {
        self.entries.get_mut(key.identity().as_ref()).map(|(_, v)| v)
    }

    /// Check whether `key` has a value
    pub fn exists<Q>(&self, key: &Q) -> bool
    where
        Q: IdentityKey + ?Sized,
    {
        self.entries.contains_key(key.identity().as_ref())
    }

    /// Remove the value stored for `key`
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        Q: IdentityKey + ?Sized,
    {
        let projected = key.identity();
        let removed = self.entries.remove(projected.as_ref())?;
        if let Some(pos) = self.order.iter().position(|k| k == projected.as_ref()) {
            self.order.remove(pos);
        }
        Some(removed.1)
    }

    /// Keys in their original form, in insertion order
    pub fn get_keys(&self) -> Vec<&K> {
        self.iter().map(|(k, _)| k).collect()
    }

    /// Iterate `(original key, value)` pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.order
            .iter()
            .filter_map(move |k| self.entries.get(k).map(|(key, value)| (key, value)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> IdentityMap<K, Vec<V>>
where
    K: IdentityKey,
{
    /// Append `value` to the bucket for `key`, creating the bucket if needed
    pub fn push(&mut self, key: K, value: V) {
        if let Some(bucket) = self.get_mut(&key) {
            bucket.push(value);
        } else {
            self.set(key, vec![value]);
        }
    }
}

/// Index records by `id_field`; the last record wins on duplicate ids.
///
/// Records without the field (or with a null value) are skipped.
pub fn build_one_to_one<R, I>(records: I, id_field: &str) -> IdentityMap<Value, R>
where
    R: FieldSource,
    I: IntoIterator<Item = R>,
{
    let mut map = IdentityMap::new();
    for record in records {
        if let Some(key) = record.field(id_field).filter(|v| !v.is_null()).cloned() {
            map.set(key, record);
        }
    }
    map
}

/// Group records by `id_field`, preserving input order inside each bucket.
///
/// Records without the field (or with a null value) are skipped.
pub fn build_one_to_many<R, I>(records: I, id_field: &str) -> IdentityMap<Value, Vec<R>>
where
    R: FieldSource,
    I: IntoIterator<Item = R>,
{
    let mut map = IdentityMap::new();
    for record in records {
        if let Some(key) = record.field(id_field).filter(|v| !v.is_null()).cloned() {
            map.push(key, record);
        }
    }
    map
}

/// Join a one-to-one map with a one-to-many map.
///
/// `merge` is invoked once per key of `one_to_one`, in insertion order, with
/// the matching bucket of `one_to_many`; keys without a bucket receive an
/// empty slice. Neither map is modified, so repeated joins see the same data.
pub fn join<K, P, C, F>(one_to_one: &IdentityMap<K, P>, one_to_many: &IdentityMap<K, Vec<C>>, mut merge: F)
where
    K: IdentityKey,
    F: FnMut(&P, &[C]),
{
    for (key, parent) in one_to_one.iter() {
        let children = one_to_many.get(key).map(Vec::as_slice).unwrap_or(&[]);
        merge(parent, children);
    }
}
