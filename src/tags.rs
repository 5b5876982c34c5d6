//! # Tag Algebra
//!
//! A *tag* identifies a single write event: one node, one instant. A *tag
//! set* is the unordered collection of tags currently "alive" on a row; it
//! is what the shadow table stores and what the merge resolves over.
//!
//! The algebra is the add-wins / observed-delete scheme:
//!
//! - every write contributes its own tag;
//! - every write records, in `clearTags`, the set of tags it *observed*
//!   (and therefore supersedes);
//! - a row is deleted exactly when the surviving tag set is empty, i.e.
//!   every known write has been observed cleared by someone.
//!
//! A remote write whose tag is absent from a concurrent delete's
//! `clearTags` was not observed by that delete, so the write survives it.
//!
//! ## Wire and Storage Form
//!
//! A tag serializes as `"<clientId>@<ISO8601 UTC, millisecond precision>"`,
//! e.g. `"6f…@2024-01-02T03:04:05.678Z"`. A tag set serializes as a JSON
//! array of tag strings; array order carries no meaning, equality is by set
//! contents.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Error, Result};

// =============================================================================
// Tag
// =============================================================================

/// A single write-event identifier: `clientId@timestamp`.
///
/// Ordering is by timestamp first, then client id lexicographically — the
/// same order the column-wise merge uses to break ties.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    pub client_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Tag {
    /// Builds the tag for a write by `client_id` at instant `timestamp`.
    ///
    /// The timestamp is truncated to millisecond precision so that the
    /// encoded and decoded forms compare equal.
    pub fn generate(client_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        let millis = timestamp.timestamp_millis();
        let truncated = DateTime::<Utc>::from_timestamp_millis(millis)
            .unwrap_or(timestamp);
        Self {
            client_id: client_id.into(),
            timestamp: truncated,
        }
    }

    /// Parses the `clientId@ISO8601` string form.
    pub fn parse(s: &str) -> Result<Self> {
        let (client_id, ts) = s
            .split_once('@')
            .ok_or_else(|| Error::Internal(format!("malformed tag '{s}'")))?;
        let timestamp = DateTime::parse_from_rfc3339(ts)
            .map_err(|e| Error::Internal(format!("malformed tag timestamp '{ts}': {e}")))?
            .with_timezone(&Utc);
        Ok(Self {
            client_id: client_id.to_string(),
            timestamp,
        })
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            self.client_id,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }
}

impl Ord for Tag {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.client_id.cmp(&other.client_id))
    }
}

impl PartialOrd for Tag {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// =============================================================================
// TagSet
// =============================================================================

/// An unordered set of tags with set-contents equality.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TagSet(BTreeSet<Tag>);

impl TagSet {
    /// The empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// A set holding a single tag.
    pub fn singleton(tag: Tag) -> Self {
        let mut set = BTreeSet::new();
        set.insert(tag);
        Self(set)
    }

    /// Decodes the JSON-array storage form. The empty string decodes as the
    /// empty set (fresh meta rows and trigger defaults).
    pub fn decode(encoded: &str) -> Result<Self> {
        if encoded.is_empty() {
            return Ok(Self::new());
        }
        let strings: Vec<String> = serde_json::from_str(encoded)?;
        let mut set = BTreeSet::new();
        for s in &strings {
            set.insert(Tag::parse(s)?);
        }
        Ok(Self(set))
    }

    /// Encodes as a JSON array of tag strings.
    pub fn encode(&self) -> String {
        let strings: Vec<String> = self.0.iter().map(Tag::to_string).collect();
        serde_json::to_string(&strings).expect("string array always serializes")
    }

    /// Set union.
    pub fn merge(&self, other: &TagSet) -> TagSet {
        Self(self.0.union(&other.0).cloned().collect())
    }

    /// Set difference `self \ other`.
    pub fn difference(&self, other: &TagSet) -> TagSet {
        Self(self.0.difference(&other.0).cloned().collect())
    }

    /// Inserts one tag.
    pub fn insert(&mut self, tag: Tag) {
        self.0.insert(tag);
    }

    pub fn contains(&self, tag: &Tag) -> bool {
        self.0.contains(tag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.0.iter()
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Vec<Tag>> for TagSet {
    fn from(tags: Vec<Tag>) -> Self {
        tags.into_iter().collect()
    }
}

// =============================================================================
// Shadow Entries
// =============================================================================

/// One row of the shadow table: the surviving tag set for a user row.
///
/// Exactly one shadow row exists per live user row; absence means the row
/// has been observed deleted by all known writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowEntry {
    pub namespace: String,
    pub tablename: String,
    /// Canonical primary-key JSON, identical to the oplog encoding.
    pub primary_key: String,
    pub tags: TagSet,
}

// =============================================================================
// Tests
// =============================================================================
