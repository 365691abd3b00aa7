#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![cfg_attr(
    feature = "cargo-clippy",
    allow(
        clippy::unreadable_literal,
        clippy::cognitive_complexity,
        clippy::float_cmp,
        clippy::match_like_matches_macro,
        clippy::derive_partial_eq_without_eq
    )
)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub use ::bson;

pub mod auth;
pub mod cmap;
pub mod compression;
pub mod concern;
pub mod cursor;
pub mod dispatcher;
pub mod error;
pub mod options;
pub mod sdam;
pub mod selection_criteria;
pub mod session;
#[cfg(feature = "dns-resolver")]
pub mod srv;
pub mod wire;

pub use crate::{
    cmap::{Connection, Pool},
    concern::{ReadConcern, WriteConcern},
    cursor::{Cursor, CursorSpecification, Namespace},
    dispatcher::{Dispatcher, OperationKind},
    error::{Error, ErrorKind, Result},
    options::{ClientOptions, Credential, ServerAddress},
    sdam::{ServerDescription, Topology, TopologyDescription},
    selection_criteria::{ReadPreference, SelectionCriteria},
    session::{ClientSession, ClusterTime, SessionOptions, TransactionOptions},
};

/// A boxed future, used at the [`auth::ScramAuthenticator`] extension point.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
