//! `ReadConcern`/`WriteConcern`, used by `bindSession` (spec §4.8) when
//! constructing transaction commands and by `ClientOptions` defaults.
//!
//! Grounded on the teacher's `concern.rs`, trimmed of its client-options
//! serde-helper plumbing (not needed once `ClientOptions` isn't itself
//! wire-serialized).

use std::{str::FromStr, time::Duration};

use typed_builder::TypedBuilder;

use crate::error::{ErrorKind, Result};

/// Consistency/isolation level for read operations (spec §4.8: attached to
/// `startTransaction` commands and, for causally-consistent sessions, to
/// every command via `afterClusterTime`).
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ReadConcern {
    pub level: ReadConcernLevel,
}

impl ReadConcern {
    pub fn majority() -> Self {
        ReadConcernLevel::Majority.into()
    }

    pub fn local() -> Self {
        ReadConcernLevel::Local.into()
    }

    pub fn linearizable() -> Self {
        ReadConcernLevel::Linearizable.into()
    }

    pub fn available() -> Self {
        ReadConcernLevel::Available.into()
    }

    pub fn snapshot() -> Self {
        ReadConcernLevel::Snapshot.into()
    }

    pub fn custom(level: impl AsRef<str>) -> Self {
        ReadConcernLevel::from_str(level.as_ref()).into()
    }

    pub fn into_document(self) -> bson::Document {
        bson::doc! { "level": self.level.as_str() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReadConcernLevel {
    Local,
    Majority,
    Linearizable,
    Available,
    Snapshot,
    Custom(String),
}

impl ReadConcernLevel {
    fn from_str(s: &str) -> Self {
        match s {
            "local" => Self::Local,
            "majority" => Self::Majority,
            "linearizable" => Self::Linearizable,
            "available" => Self::Available,
            "snapshot" => Self::Snapshot,
            other => Self::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Local => "local",
            Self::Majority => "majority",
            Self::Linearizable => "linearizable",
            Self::Available => "available",
            Self::Snapshot => "snapshot",
            Self::Custom(s) => s,
        }
    }
}

impl From<ReadConcernLevel> for ReadConcern {
    fn from(level: ReadConcernLevel) -> Self {
        Self { level }
    }
}

/// Acknowledgment required from the server before a write is considered
/// durable enough to report success (spec §6 `w`, `wtimeoutMS`, `journal`).
#[derive(Clone, Debug, Default, PartialEq, Eq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct WriteConcern {
    pub w: Option<Acknowledgment>,
    pub w_timeout: Option<Duration>,
    pub journal: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Acknowledgment {
    /// `w: 0` means unacknowledged — spec §9 open question 3 hinges on this variant.
    Nodes(u32),
    Majority,
    Custom(String),
}

impl FromStr for Acknowledgment {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "majority" {
            return Ok(Self::Majority);
        }
        if let Ok(n) = s.parse::<u32>() {
            return Ok(Self::Nodes(n));
        }
        Ok(Self::Custom(s.to_string()))
    }
}

impl From<u32> for Acknowledgment {
    fn from(n: u32) -> Self {
        Self::Nodes(n)
    }
}

impl WriteConcern {
    pub fn nodes(v: u32) -> Self {
        Acknowledgment::Nodes(v).into()
    }

    pub fn majority() -> Self {
        Acknowledgment::Majority.into()
    }

    /// spec §9 open question 3: a write concern is acknowledged unless it
    /// explicitly requests `w: 0` with no journal requirement.
    pub fn is_acknowledged(&self) -> bool {
        self.w != Some(Acknowledgment::Nodes(0)) || self.journal == Some(true)
    }

    pub fn is_empty(&self) -> bool {
        self.w.is_none() && self.w_timeout.is_none() && self.journal.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if self.w == Some(Acknowledgment::Nodes(0)) && self.journal == Some(true) {
            return Err(ErrorKind::InvalidArgument {
                message: "write concern cannot have w=0 and j=true".into(),
            }
            .into());
        }
        Ok(())
    }

    pub fn into_document(self) -> bson::Document {
        let mut doc = bson::Document::new();
        match self.w {
            Some(Acknowledgment::Nodes(n)) => {
                doc.insert("w", n as i32);
            }
            Some(Acknowledgment::Majority) => {
                doc.insert("w", "majority");
            }
            Some(Acknowledgment::Custom(s)) => {
                doc.insert("w", s);
            }
            None => {}
        }
        if let Some(timeout) = self.w_timeout {
            doc.insert("wtimeout", timeout.as_millis() as i64);
        }
        if let Some(j) = self.journal {
            doc.insert("j", j);
        }
        doc
    }
}

impl From<Acknowledgment> for WriteConcern {
    fn from(w: Acknowledgment) -> Self {
        WriteConcern {
            w: Some(w),
            w_timeout: None,
            journal: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn w0_without_journal_is_unacknowledged() {
        let wc = WriteConcern::nodes(0);
        assert!(!wc.is_acknowledged());
    }

    #[test]
    fn w0_with_journal_is_acknowledged() {
        let mut wc = WriteConcern::nodes(0);
        wc.journal = Some(true);
        assert!(wc.is_acknowledged());
        assert!(wc.validate().is_err());
    }

    #[test]
    fn majority_is_acknowledged() {
        assert!(WriteConcern::majority().is_acknowledged());
    }

    #[test]
    fn read_concern_custom_round_trips_level_string() {
        let rc = ReadConcern::custom("snapshot");
        assert_eq!(rc.level, ReadConcernLevel::Snapshot);
        let rc = ReadConcern::custom("myNewLevel");
        assert_eq!(rc.level.as_str(), "myNewLevel");
    }
}
