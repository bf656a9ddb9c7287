//! Tag value types.
//!
//! A tag is a `(name, value)` pair such as `("order", "42")`. An entry may
//! carry several values for one name (`region=eu` and `region=us`), so a tag
//! set is a set of pairs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::ser::{Error as _, SerializeMap};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A single `(name, value)` tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Set of tags attached to an entry or named in an invalidation.
///
/// Ordered so that iteration, logging and the wire payload are deterministic.
/// Serializes as a `{name: value}` map, which can only hold one value per
/// name: see [`Tags::split_by_name`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Tags(BTreeSet<Tag>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tag (builder pattern).
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Add a tag. Returns `false` if the exact pair was already present.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        self.0.insert(Tag::new(name, value))
    }

    pub fn contains(&self, name: &str, value: &str) -> bool {
        self.iter().any(|(n, v)| n == name && v == value)
    }

    /// Every value carried for `name`, in order.
    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.iter().filter(move |(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|tag| (tag.name.as_str(), tag.value.as_str()))
    }

    /// Whether no name appears twice, i.e. the set fits a `{name: value}` map.
    pub fn has_unique_names(&self) -> bool {
        let mut names = self.0.iter().map(|tag| tag.name.as_str());
        let Some(mut previous) = names.next() else {
            return true;
        };
        for name in names {
            if name == previous {
                return false;
            }
            previous = name;
        }
        true
    }

    /// Split into sets with unique names that together hold every pair.
    ///
    /// The n-th set holds the n-th value of every name, so the number of sets
    /// is the largest number of values carried by one name. An empty set
    /// splits into nothing.
    pub fn split_by_name(&self) -> Vec<Tags> {
        let mut parts: Vec<Tags> = Vec::new();
        let mut current: Option<&str> = None;
        let mut position = 0;

        for tag in &self.0 {
            if current != Some(tag.name.as_str()) {
                current = Some(tag.name.as_str());
                position = 0;
            }
            if parts.len() == position {
                parts.push(Tags::new());
            }
            parts[position].0.insert(tag.clone());
            position += 1;
        }

        parts
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for tag in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}", tag)?;
            first = false;
        }
        Ok(())
    }
}

impl Serialize for Tags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !self.has_unique_names() {
            return Err(S::Error::custom(format!(
                "tags `{}` repeat a name and cannot be written as a map",
                self
            )));
        }

        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for tag in &self.0 {
            map.serialize_entry(&tag.name, &tag.value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Tags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        BTreeMap::<String, String>::deserialize(deserializer).map(Tags::from_iter)
    }
}

impl<N, V> FromIterator<(N, V)> for Tags
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(n, v)| Tag::new(n, v))
                .collect(),
        )
    }
}

impl<N, V, const LEN: usize> From<[(N, V); LEN]> for Tags
where
    N: Into<String>,
    V: Into<String>,
{
    fn from(pairs: [(N, V); LEN]) -> Self {
        pairs.into_iter().collect()
    }
}

impl FromIterator<Tag> for Tags {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
