//! The `Error`/`Result` types used across the core, and the classification
//! tables that drive retry, resumability, and transaction-label behavior.
//!
//! Grounded on the teacher's `error.rs`: an `Error` wrapping a boxed
//! `ErrorKind` plus a label set, `ErrorKind` deriving `thiserror::Error` with
//! `#[non_exhaustive]` variants so new failure modes can be added without a
//! semver break for downstream `match`es.

use std::{collections::HashSet, fmt, sync::Arc};

use thiserror::Error;

use crate::options::ServerAddress;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;

/// Added to an error when it represents a retryable read failure (spec §7).
pub const RETRYABLE_READ_ERROR: &str = "RetryableReadError";
/// Added to an error when it represents a retryable write failure (spec §7).
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";
/// Added to an error that can be resumed by re-issuing a change-stream `getMore`.
pub const RESUMABLE_CHANGE_STREAM_ERROR: &str = "ResumableChangeStreamError";
/// Added to a network/selection error raised while a transaction is in progress.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";
/// Added when it is unknown whether a `commitTransaction` satisfied its write concern.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

// Code tables exactly as spec.md §7 lists them.
const RETRYABLE_READ_CODES: [i32; 10] = [6, 7, 89, 91, 189, 10107, 11600, 11602, 13435, 13436];
const RETRYABLE_WRITE_EXTRA_CODES: [i32; 2] = [262, 9001];
const RESUMABLE_EXTRA_CODES: [i32; 5] = [63, 150, 13388, 133, 234];

fn retryable_write_codes() -> impl Iterator<Item = i32> {
    RETRYABLE_READ_CODES
        .into_iter()
        .chain(RETRYABLE_WRITE_EXTRA_CODES)
}

fn resumable_codes() -> impl Iterator<Item = i32> {
    retryable_write_codes().chain(RESUMABLE_EXTRA_CODES)
}

/// A structured failure from the core. Cheaply `Clone`-able (the payload is
/// behind an `Arc`) so the same error can be surfaced to a waiting retry path
/// and to the caller.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
pub struct Error {
    pub kind: Arc<ErrorKind>,
    labels: HashSet<String>,
    #[source]
    source: Option<Arc<Error>>,
}

impl Error {
    pub fn new(kind: ErrorKind, labels: impl IntoIterator<Item = String>) -> Self {
        Self {
            kind: Arc::new(kind),
            labels: labels.into_iter().collect(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: Error) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Adds a label if it isn't already present.
    pub fn add_label(&mut self, label: impl Into<String>) {
        self.labels.insert(label.into());
    }

    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    pub fn contains_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// The numeric `code` from a server `Command` error, if this is one.
    pub fn server_code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command { code, .. } => Some(*code),
            _ => self.source.as_ref().and_then(|s| s.server_code()),
        }
    }

    pub fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io { .. } | ErrorKind::Tls { .. }
        ) || self.source.as_ref().is_some_and(|s| s.is_network_error())
    }

    pub fn is_server_selection_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ServerSelection { .. })
    }

    /// spec §7: retryable read = network error ∪ codes in RETRYABLE_READ_CODES.
    pub fn is_read_retryable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        self.server_code()
            .is_some_and(|c| RETRYABLE_READ_CODES.contains(&c))
    }

    /// spec §7: retryable write = retryable read ∪ {262, 9001}, or the label was
    /// already attached when the command failed.
    pub fn is_write_retryable(&self) -> bool {
        if self.contains_label(RETRYABLE_WRITE_ERROR) {
            return true;
        }
        if self.is_network_error() {
            return true;
        }
        self.server_code()
            .is_some_and(|c| retryable_write_codes().any(|r| r == c))
    }

    /// spec §7: resumable change-stream error = retryable write ∪ {63, 150, 13388, 133, 234}.
    pub fn is_resumable(&self) -> bool {
        if self.contains_label(RESUMABLE_CHANGE_STREAM_ERROR) {
            return true;
        }
        if self.is_network_error() {
            return true;
        }
        self.server_code()
            .is_some_and(|c| resumable_codes().any(|r| r == c))
    }

    pub fn is_transient_transaction_error(&self) -> bool {
        self.contains_label(TRANSIENT_TRANSACTION_ERROR)
            || self.is_network_error()
            || self.is_server_selection_error()
            || self.is_write_retryable()
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::InvalidResponse {
                message: message.into(),
            },
            None,
        )
    }

    pub fn server_selection_timeout(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::ServerSelection {
                message: message.into(),
            },
            None,
        )
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind, None)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        ErrorKind::Io {
            message: e.to_string(),
        }
        .into()
    }
}

impl From<bson::de::Error> for Error {
    fn from(e: bson::de::Error) -> Self {
        ErrorKind::InvalidResponse {
            message: e.to_string(),
        }
        .into()
    }
}

impl From<bson::ser::Error> for Error {
    fn from(e: bson::ser::Error) -> Self {
        ErrorKind::InvalidArgument {
            message: e.to_string(),
        }
        .into()
    }
}

/// A single per-document write failure, returned as data rather than thrown.
/// See spec §7: "command succeeded but per-document write failures — returned
/// as a structured result, not a thrown error."
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct WriteError {
    pub code: i32,
    pub message: String,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "write error {}: {}", self.code, self.message)
    }
}

/// The taxonomy of failures the core can produce (spec §7).
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was supplied by the caller (bad connection string,
    /// malformed option combination, …).
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A transport fault: TCP connect/send/recv failure. `resumable` per
    /// spec §7 ("resumable = true for tcp").
    #[error("I/O error: {message}")]
    Io { message: String },

    /// A TLS handshake or record-layer fault. `resumable = false` per spec §7.
    #[error("TLS error: {message}")]
    Tls { message: String },

    /// Wire-level decode failure: short read, bad opcode, length mismatch.
    /// Fatal for the connection that produced it (spec §4.1).
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The server replied with a message the core could not parse into the
    /// shape it expected.
    #[error("invalid server response: {message}")]
    InvalidResponse { message: String },

    /// The server returned `ok: 0`.
    #[error("command failed with code {code}: {message}")]
    Command { code: i32, message: String },

    /// A per-document write failure bundle.
    #[error("bulk write error: {0:?}")]
    Write(Vec<WriteError>),

    /// `selectServer` could not find a candidate before `serverSelectionTimeoutMS` elapsed,
    /// or the topology is `compatible == false`.
    #[error("server selection failed: {message}")]
    ServerSelection { message: String },

    /// DNS resolution of a `+srv` hostname failed.
    #[error("DNS error: {message}")]
    DnsResolve { message: String },

    /// The authenticator rejected the connection.
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// A background worker (monitor, pool) was asked to act after `close()`.
    #[error("operation attempted after shutdown")]
    Shutdown,

    /// Caller supplied an explicit `ClientSession` to a different `Client` than the
    /// one driving the operation, or used one session concurrently from two operations.
    #[error("invalid session: {message}")]
    InvalidSession { message: String },

    /// A transaction-specific state violation (commit after abort, write op
    /// with no active transaction when one was required, …).
    #[error("transaction error: {message}")]
    Transaction { message: String },

    /// An internal invariant was violated; always a bug in the core itself.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ErrorKind {
    pub fn with_labels(self, labels: impl IntoIterator<Item = impl Into<String>>) -> Error {
        Error::new(self, labels.into_iter().map(Into::into))
    }
}

/// A transport-fault wrapper carrying the host it occurred on, matching the
/// `{tag: tcp|ssl, action, underlying, host}` shape spec §4.2 prescribes for
/// the `Connection` → pool → `Topology` disconnect notification.
#[derive(Clone, Debug)]
pub struct TransportError {
    pub tag: TransportErrorTag,
    pub action: &'static str,
    pub host: ServerAddress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorTag {
    Tcp,
    Ssl,
}

impl TransportError {
    pub fn new(tag: TransportErrorTag, action: &'static str, host: ServerAddress) -> Self {
        Self { tag, action, host }
    }

    pub fn resumable(&self) -> bool {
        matches!(self.tag, TransportErrorTag::Tcp)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} failed", self.action, self.host)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!(host = %e.host, action = e.action, tag = ?e.tag, "connection transport error");
        match e.tag {
            TransportErrorTag::Tcp => ErrorKind::Io { message: e.to_string() }.into(),
            TransportErrorTag::Ssl => ErrorKind::Tls { message: e.to_string() }.into(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retryable_write_is_superset_of_retryable_read() {
        let read: HashSet<i32> = RETRYABLE_READ_CODES.into_iter().collect();
        let write: HashSet<i32> = retryable_write_codes().collect();
        assert!(read.is_subset(&write));
        assert!(write.contains(&262));
        assert!(write.contains(&9001));
    }

    #[test]
    fn resumable_is_superset_of_retryable_write() {
        let write: HashSet<i32> = retryable_write_codes().collect();
        let resumable: HashSet<i32> = resumable_codes().collect();
        assert!(write.is_subset(&resumable));
        for code in [63, 150, 13388, 133, 234] {
            assert!(resumable.contains(&code));
        }
    }

    #[test]
    fn not_writable_primary_is_classified_retryable() {
        let err: Error = ErrorKind::Command {
            code: 10107,
            message: "not master".into(),
        }
        .into();
        assert!(err.is_read_retryable());
        assert!(err.is_write_retryable());
    }

    #[test]
    fn labels_round_trip() {
        let mut err: Error = ErrorKind::Internal {
            message: "x".into(),
        }
        .into();
        assert!(!err.contains_label(TRANSIENT_TRANSACTION_ERROR));
        err.add_label(TRANSIENT_TRANSACTION_ERROR);
        assert!(err.contains_label(TRANSIENT_TRANSACTION_ERROR));
    }

    #[test]
    fn network_error_is_transient_transaction_error() {
        let err: Error = ErrorKind::Io {
            message: "reset".into(),
        }
        .into();
        assert!(err.is_transient_transaction_error());
    }
}
