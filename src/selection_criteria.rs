//! Read-preference-driven server selection criteria (spec §3 `tagSet`, §4.6
//! read-preference rules).
//!
//! Grounded on the teacher's `selection_criteria.rs`.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bson::{doc, Bson, Document};

use crate::{
    error::{ErrorKind, Result},
    sdam::ServerInfo,
};

/// Describes which servers are suitable for a given operation.
#[derive(Clone)]
pub enum SelectionCriteria {
    /// Select via a `ReadPreference` (the common case).
    ReadPreference(ReadPreference),

    /// An arbitrary predicate, used internally to pin an operation to a
    /// specific address (e.g. a sharded-transaction mongos, spec §5).
    Predicate(Predicate),
}

impl std::fmt::Debug for SelectionCriteria {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadPreference(r) => write!(f, "ReadPreference({r:?})"),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(r) => Some(r),
            Self::Predicate(..) => None,
        }
    }

    pub fn is_read_pref_primary(&self) -> bool {
        matches!(self, Self::ReadPreference(ReadPreference::Primary))
    }

    pub fn max_staleness(&self) -> Option<Duration> {
        self.as_read_pref().and_then(|pref| pref.max_staleness())
    }

    pub fn from_predicate(f: impl Fn(&ServerInfo) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }
}

/// A predicate used to filter servers that are considered suitable.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerInfo) -> bool>;

/// Specifies how the core should route a read operation to members of a
/// replica set (spec §4.6).
#[derive(Clone, Debug, PartialEq)]
pub enum ReadPreference {
    Primary,
    Secondary {
        tag_sets: Option<Vec<TagSet>>,
        max_staleness: Option<Duration>,
    },
    PrimaryPreferred {
        tag_sets: Option<Vec<TagSet>>,
        max_staleness: Option<Duration>,
    },
    SecondaryPreferred {
        tag_sets: Option<Vec<TagSet>>,
        max_staleness: Option<Duration>,
    },
    Nearest {
        tag_sets: Option<Vec<TagSet>>,
        max_staleness: Option<Duration>,
    },
}

impl ReadPreference {
    pub fn max_staleness(&self) -> Option<Duration> {
        match self {
            ReadPreference::Primary => None,
            ReadPreference::Secondary { max_staleness, .. }
            | ReadPreference::PrimaryPreferred { max_staleness, .. }
            | ReadPreference::SecondaryPreferred { max_staleness, .. }
            | ReadPreference::Nearest { max_staleness, .. } => *max_staleness,
        }
    }

    pub fn tag_sets(&self) -> Option<&[TagSet]> {
        match self {
            ReadPreference::Primary => None,
            ReadPreference::Secondary { tag_sets, .. }
            | ReadPreference::PrimaryPreferred { tag_sets, .. }
            | ReadPreference::SecondaryPreferred { tag_sets, .. }
            | ReadPreference::Nearest { tag_sets, .. } => tag_sets.as_deref(),
        }
    }

    pub fn with_tags(self, tag_sets: Vec<TagSet>) -> Result<Self> {
        let tag_sets = Some(tag_sets);
        Ok(match self {
            ReadPreference::Primary => {
                return Err(ErrorKind::InvalidArgument {
                    message: "read preference tags require a non-primary mode".into(),
                }
                .into())
            }
            ReadPreference::Secondary { max_staleness, .. } => {
                ReadPreference::Secondary { tag_sets, max_staleness }
            }
            ReadPreference::PrimaryPreferred { max_staleness, .. } => {
                ReadPreference::PrimaryPreferred { tag_sets, max_staleness }
            }
            ReadPreference::SecondaryPreferred { max_staleness, .. } => {
                ReadPreference::SecondaryPreferred { tag_sets, max_staleness }
            }
            ReadPreference::Nearest { max_staleness, .. } => {
                ReadPreference::Nearest { tag_sets, max_staleness }
            }
        })
    }

    pub fn into_document(self) -> Document {
        let (mode, tag_sets, max_staleness) = match self {
            ReadPreference::Primary => ("primary", None, None),
            ReadPreference::PrimaryPreferred { tag_sets, max_staleness } => {
                ("primaryPreferred", tag_sets, max_staleness)
            }
            ReadPreference::Secondary { tag_sets, max_staleness } => {
                ("secondary", tag_sets, max_staleness)
            }
            ReadPreference::SecondaryPreferred { tag_sets, max_staleness } => {
                ("secondaryPreferred", tag_sets, max_staleness)
            }
            ReadPreference::Nearest { tag_sets, max_staleness } => {
                ("nearest", tag_sets, max_staleness)
            }
        };

        let mut doc = doc! { "mode": mode };
        if let Some(max_stale) = max_staleness {
            doc.insert("maxStalenessSeconds", max_stale.as_secs() as i64);
        }
        if let Some(tag_sets) = tag_sets {
            let tags: Vec<Bson> = tag_sets
                .into_iter()
                .map(|tag_set| Bson::Document(tag_set.into_iter().map(|(k, v)| (k, v.into())).collect()))
                .collect();
            doc.insert("tags", tags);
        }
        doc
    }
}

/// A read-preference tag set: a server is a match if every key/value pair
/// here is present in the server's own tag map (spec §4.6, "subset match").
pub type TagSet = HashMap<String, String>;

/// True if every (k, v) in `wanted` is present in `have` — the subset-match
/// rule spec §4.6 prescribes for tag-set filtering.
pub fn tag_set_matches(wanted: &TagSet, have: &TagSet) -> bool {
    wanted.iter().all(|(k, v)| have.get(k) == Some(v))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_tag_set_matches_anything() {
        let wanted = TagSet::new();
        let have: TagSet = [("dc".to_string(), "east".to_string())].into_iter().collect();
        assert!(tag_set_matches(&wanted, &have));
    }

    #[test]
    fn tag_set_requires_subset() {
        let wanted: TagSet = [("dc".to_string(), "east".to_string())].into_iter().collect();
        let have: TagSet = [("dc".to_string(), "west".to_string())].into_iter().collect();
        assert!(!tag_set_matches(&wanted, &have));
    }

    #[test]
    fn primary_rejects_tags() {
        assert!(ReadPreference::Primary.with_tags(vec![]).is_err());
    }

    #[test]
    fn into_document_includes_staleness_and_tags() {
        let pref = ReadPreference::Nearest {
            tag_sets: Some(vec![[("dc".into(), "east".into())].into_iter().collect()]),
            max_staleness: Some(Duration::from_secs(90)),
        };
        let doc = pref.into_document();
        assert_eq!(doc.get_str("mode").unwrap(), "nearest");
        assert_eq!(doc.get_i64("maxStalenessSeconds").unwrap(), 90);
    }
}
