//! Series label sets.
//!
//! [`Labels`] is the identity of a time series: an ordered set of name/value
//! pairs, sorted by name with unique names. Shard routing, the
//! external-labels overlay and equality all rely on that canonical form, so
//! it is enforced at construction and preserved by every operation here.

use fnv::FnvHasher;
use std::fmt;
use std::hash::Hasher;

/// A single label name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Label {
    /// Label name.
    pub name: String,
    /// Label value.
    pub value: String,
}

impl Label {
    /// Create a label from anything string-like.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An ordered label set: sorted by name, names unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Build a canonical label set from arbitrary pairs.
    ///
    /// Pairs are sorted by name; on duplicate names the first occurrence
    /// wins.
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        labels.dedup_by(|b, a| a.name == b.name);
        Self(labels)
    }

    /// Convenience constructor from `(name, value)` pairs.
    ///
    /// # Example
    ///
    /// ```
    /// use virta_core::Labels;
    ///
    /// let series = Labels::from_pairs([("__name__", "http_requests_total"), ("job", "api")]);
    /// assert_eq!(series.get("job"), Some("api"));
    /// ```
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        Self::new(pairs.into_iter().map(|(n, v)| Label::new(n, v)).collect())
    }

    /// Number of labels in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the set holds no labels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate the labels in name order.
    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    /// Look up a label value by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    /// Stable routing hash of the whole set.
    ///
    /// FNV-1a over the name/value byte stream with `0xff` separators. The
    /// result depends only on the label content, never on process layout or
    /// hasher seeding, so shard assignment is reproducible across runs.
    pub fn shard_hash(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        for label in &self.0 {
            hasher.write(label.name.as_bytes());
            hasher.write_u8(0xff);
            hasher.write(label.value.as_bytes());
            hasher.write_u8(0xff);
        }
        hasher.finish()
    }

    /// Merge operator-configured external labels into this set.
    ///
    /// An ordered merge of two sorted streams: every external label whose
    /// name is absent from `self` is inserted, and `self` wins on name
    /// collision. Applying the same overlay twice yields the same result as
    /// applying it once.
    pub fn with_external(&self, external: &Labels) -> Labels {
        if external.is_empty() {
            return self.clone();
        }

        let mut merged = Vec::with_capacity(self.0.len() + external.0.len());
        let mut j = 0;
        for label in &self.0 {
            while j < external.0.len() && external.0[j].name < label.name {
                merged.push(external.0[j].clone());
                j += 1;
            }
            if j < external.0.len() && external.0[j].name == label.name {
                j += 1;
            }
            merged.push(label.clone());
        }
        merged.extend(external.0[j..].iter().cloned());

        Labels(merged)
    }

    /// Remove all labels, keeping the allocation.
    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn new_sorts_and_dedups() {
        let labels = Labels::new(vec![
            Label::new("job", "api"),
            Label::new("__name__", "up"),
            Label::new("job", "ignored"),
        ]);
        let names: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["__name__", "job"]);
        assert_eq!(labels.get("job"), Some("api"));
    }

    #[test]
    fn shard_hash_is_stable_and_content_sensitive() {
        let a = Labels::from_pairs([("job", "api"), ("instance", "a")]);
        let b = Labels::from_pairs([("instance", "a"), ("job", "api")]);
        let c = Labels::from_pairs([("job", "api"), ("instance", "b")]);

        assert_eq!(a.shard_hash(), b.shard_hash());
        assert_ne!(a.shard_hash(), c.shard_hash());
    }

    #[test]
    fn shard_hash_separator_prevents_boundary_collisions() {
        let a = Labels::from_pairs([("ab", "c")]);
        let b = Labels::from_pairs([("a", "bc")]);
        assert_ne!(a.shard_hash(), b.shard_hash());
    }

    #[test]
    fn external_merge_input_wins() {
        let series = Labels::from_pairs([("job", "api"), ("region", "local")]);
        let external = Labels::from_pairs([("cluster", "eu-1"), ("region", "global")]);

        let merged = series.with_external(&external);
        assert_eq!(merged.get("cluster"), Some("eu-1"));
        assert_eq!(merged.get("region"), Some("local"));
        assert_eq!(merged.get("job"), Some("api"));
        assert_eq!(merged.len(), 3);

        // Output stays sorted.
        let names: Vec<&str> = merged.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["cluster", "job", "region"]);
    }

    #[test]
    fn external_merge_is_idempotent() {
        let series = Labels::from_pairs([("job", "api")]);
        let external = Labels::from_pairs([("cluster", "eu-1"), ("job", "other")]);

        let once = series.with_external(&external);
        let twice = once.with_external(&external);
        assert_eq!(once, twice);
    }

    #[test]
    fn external_merge_empty_external_is_noop() {
        let series = Labels::from_pairs([("job", "api")]);
        assert_eq!(series.with_external(&Labels::default()), series);
    }
}
