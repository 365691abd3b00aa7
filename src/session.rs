//! Logical sessions, causal-consistency bookkeeping, and the multi-statement
//! transaction state machine (spec §4.7/§4.8).
//!
//! Grounded on the teacher's `client/session/{mod,pool,cluster_time}.rs`,
//! stripped of the `Client`/`execute_operation` coupling: committing and
//! aborting a transaction require sending a command, so that I/O lives in
//! [`crate::dispatcher`] and this module owns only the state machine that
//! decides what to send.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use bson::{doc, spec::BinarySubtype, Binary, Bson, Document, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::{
    concern::{ReadConcern, WriteConcern},
    selection_criteria::SelectionCriteria,
};

/// A server-reported logical time used to order operations across the
/// deployment (spec §4.8: causal-consistency bookkeeping).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTime {
    cluster_time: Timestamp,
    signature: Document,
}

impl PartialEq for ClusterTime {
    fn eq(&self, other: &Self) -> bool {
        self.cluster_time == other.cluster_time
    }
}

impl Eq for ClusterTime {}

impl PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClusterTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.cluster_time.time, self.cluster_time.increment)
            .cmp(&(other.cluster_time.time, other.cluster_time.increment))
    }
}

impl ClusterTime {
    /// Parses a `$clusterTime` subdocument out of a command reply, if present.
    pub fn from_reply(reply: &Document) -> Option<Self> {
        let doc = reply.get_document("$clusterTime").ok()?;
        bson::from_document(doc.clone()).ok()
    }

    pub fn into_document(self) -> Document {
        doc! {
            "clusterTime": self.cluster_time,
            "signature": self.signature,
        }
    }
}

/// The driver-side half of a server session: an opaque id plus the local
/// transaction counter echoed back to the server (spec §3: ServerSession).
#[derive(Debug, Clone)]
pub struct ServerSession {
    id: Document,
    last_use: Instant,
    dirty: bool,
    txn_number: i64,
}

impl ServerSession {
    fn new() -> Self {
        let id = doc! {
            "id": Bson::Binary(Binary {
                subtype: BinarySubtype::Uuid,
                bytes: Uuid::new_v4().as_bytes().to_vec(),
            }),
        };
        Self {
            id,
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
        }
    }

    pub fn id(&self) -> &Document {
        &self.id
    }

    /// Expired when `now - last_use > logical_session_timeout - 1 minute`
    /// (spec §3/§4.7).
    fn is_expired(&self, logical_session_timeout: Duration) -> bool {
        let margin = logical_session_timeout.saturating_sub(Duration::from_secs(60));
        self.last_use.elapsed() > margin
    }
}

/// A stack of `ServerSession`s reused across implicit and explicit sessions
/// (spec §4.7).
#[derive(Debug, Default)]
pub struct ServerSessionPool {
    sessions: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops the top session if it is not expired, discarding any expired
    /// ones found along the way; allocates a fresh one if the pool is empty.
    pub async fn check_out(&self, logical_session_timeout: Duration) -> ServerSession {
        let mut sessions = self.sessions.lock().await;
        while let Some(session) = sessions.pop_front() {
            if session.is_expired(logical_session_timeout) {
                continue;
            }
            return session;
        }
        ServerSession::new()
    }

    /// Returns a session to the pool unless it is dirty or expired (spec
    /// §4.7).
    pub async fn check_in(&self, mut session: ServerSession, logical_session_timeout: Duration) {
        session.last_use = Instant::now();
        let mut sessions = self.sessions.lock().await;
        while let Some(back) = sessions.back() {
            if back.is_expired(logical_session_timeout) {
                sessions.pop_back();
            } else {
                break;
            }
        }
        if !session.dirty && !session.is_expired(logical_session_timeout) {
            sessions.push_front(session);
        }
    }
}

/// Per-transaction options (spec §4.8).
#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
pub struct TransactionOptions {
    pub read_concern: Option<ReadConcern>,
    pub write_concern: Option<WriteConcern>,
    pub selection_criteria: Option<SelectionCriteria>,
    pub max_commit_time: Option<Duration>,
}

impl TransactionOptions {
    /// Fills unset fields from `defaults`.
    fn merged_with(mut self, defaults: &TransactionOptions) -> Self {
        self.read_concern = self.read_concern.or_else(|| defaults.read_concern.clone());
        self.write_concern = self.write_concern.or_else(|| defaults.write_concern.clone());
        self.selection_criteria = self
            .selection_criteria
            .or_else(|| defaults.selection_criteria.clone());
        self.max_commit_time = self.max_commit_time.or(defaults.max_commit_time);
        self
    }
}

/// Session-wide options (spec §4.8/§9).
#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
pub struct SessionOptions {
    pub causal_consistency: Option<bool>,
    pub default_transaction_options: Option<TransactionOptions>,
    pub snapshot: Option<bool>,
}

/// Default bound on retrying an `UnknownTransactionCommitResult` commit
/// (spec §4.8).
pub const DEFAULT_TRANSACTION_RETRY_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    NoTransaction,
    Starting,
    InProgress,
    Committed { data_committed: bool },
    Aborted,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub state: TransactionState,
    pub options: Option<TransactionOptions>,
    pub pinned: Option<SelectionCriteria>,
    pub recovery_token: Option<Document>,
    pub start_time: Option<Instant>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            state: TransactionState::NoTransaction,
            options: None,
            pinned: None,
            recovery_token: None,
            start_time: None,
        }
    }
}

impl Transaction {
    fn start(&mut self, options: Option<TransactionOptions>) {
        self.state = TransactionState::Starting;
        self.options = options;
        self.recovery_token = None;
        self.start_time = Some(Instant::now());
    }

    fn commit(&mut self, data_committed: bool) {
        self.state = TransactionState::Committed { data_committed };
    }

    fn abort(&mut self) {
        self.state = TransactionState::Aborted;
        self.options = None;
        self.pinned = None;
    }

    fn reset(&mut self) {
        *self = Transaction::default();
    }
}

/// Per-operation handle wrapping a [`ServerSession`] plus causal-consistency
/// and transaction state (spec §3/§4.8).
#[derive(Debug)]
pub struct ClientSession {
    server_session: Option<ServerSession>,
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    is_implicit: bool,
    options: Option<SessionOptions>,
    pub transaction: Transaction,
}

impl ClientSession {
    pub fn new(server_session: ServerSession, options: Option<SessionOptions>, is_implicit: bool) -> Self {
        Self {
            server_session: Some(server_session),
            cluster_time: None,
            operation_time: None,
            is_implicit,
            options,
            transaction: Transaction::default(),
        }
    }

    pub fn id(&self) -> &Document {
        self.server_session.as_ref().expect("session id used after release").id()
    }

    pub fn is_implicit(&self) -> bool {
        self.is_implicit
    }

    pub fn options(&self) -> Option<&SessionOptions> {
        self.options.as_ref()
    }

    pub fn causal_consistency(&self) -> bool {
        !self.options.as_ref().and_then(|o| o.snapshot).unwrap_or(false)
            && self
                .options
                .as_ref()
                .and_then(|o| o.causal_consistency)
                .unwrap_or(true)
    }

    pub fn in_transaction(&self) -> bool {
        matches!(
            self.transaction.state,
            TransactionState::Starting | TransactionState::InProgress
        )
    }

    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// Advances the cached cluster time if `to` is newer (spec §5 ordering
    /// guarantee).
    pub fn advance_cluster_time(&mut self, to: ClusterTime) {
        if self.cluster_time.as_ref().map(|ct| *ct < to).unwrap_or(true) {
            self.cluster_time = Some(to);
        }
    }

    fn advance_operation_time(&mut self, to: Timestamp) {
        let newer = match self.operation_time {
            Some(current) => (to.time, to.increment) > (current.time, current.increment),
            None => true,
        };
        if newer {
            self.operation_time = Some(to);
        }
    }

    pub fn txn_number(&self) -> i64 {
        self.server_session.as_ref().map(|s| s.txn_number).unwrap_or(0)
    }

    pub fn get_and_increment_txn_number(&mut self) -> i64 {
        let session = self.server_session.as_mut().expect("session used after release");
        session.txn_number += 1;
        session.txn_number
    }

    pub fn mark_dirty(&mut self) {
        if let Some(session) = self.server_session.as_mut() {
            session.dirty = true;
        }
    }

    pub fn update_last_use(&mut self) {
        if let Some(session) = self.server_session.as_mut() {
            session.last_use = Instant::now();
        }
    }

    /// Returns the underlying `ServerSession` to its pool; called once when
    /// this session (implicit or explicit) is done being used.
    pub async fn release(&mut self, pool: &ServerSessionPool, logical_session_timeout: Duration) {
        if let Some(session) = self.server_session.take() {
            pool.check_in(session, logical_session_timeout).await;
        }
    }

    fn default_transaction_options(&self) -> Option<&TransactionOptions> {
        self.options.as_ref().and_then(|o| o.default_transaction_options.as_ref())
    }

    /// Transitions into `startingTransaction` (spec §4.8): legal from
    /// `noTransaction`, `committed`, or `aborted`.
    pub fn start_transaction(&mut self, options: Option<TransactionOptions>) -> crate::error::Result<()> {
        use crate::error::ErrorKind;

        if self.options.as_ref().and_then(|o| o.snapshot).unwrap_or(false) {
            return Err(ErrorKind::Transaction {
                message: "transactions are not supported in snapshot sessions".into(),
            }
            .into());
        }
        match self.transaction.state {
            TransactionState::Starting | TransactionState::InProgress => {
                return Err(ErrorKind::Transaction {
                    message: "transaction already in progress".into(),
                }
                .into());
            }
            TransactionState::Committed { .. } => {
                self.transaction.pinned = None;
            }
            _ => {}
        }

        let merged = match (options, self.default_transaction_options()) {
            (Some(options), Some(defaults)) => Some(options.merged_with(defaults)),
            (Some(options), None) => Some(options),
            (None, Some(defaults)) => Some(defaults.clone()),
            (None, None) => None,
        };
        if let Some(options) = &merged {
            if !options.write_concern.as_ref().map(|wc| wc.is_acknowledged()).unwrap_or(true) {
                return Err(ErrorKind::Transaction {
                    message: "transactions do not support unacknowledged write concerns".into(),
                }
                .into());
            }
        }

        self.get_and_increment_txn_number();
        self.transaction.start(merged);
        Ok(())
    }

    /// Marks the transaction state after a successful commit/abort; actual
    /// wire I/O is driven by [`crate::dispatcher`].
    pub fn mark_committed(&mut self, data_committed: bool) {
        self.transaction.commit(data_committed);
    }

    pub fn mark_aborted(&mut self) {
        self.transaction.abort();
    }

    pub fn reset_transaction(&mut self) {
        self.transaction.reset();
    }

    /// Mutates `cmd` in place per spec §4.8's `bindSession`.
    pub fn bind_session(&self, cmd: &mut Document, retryable_writes_enabled: bool) {
        cmd.insert("lsid", self.id().clone());

        if retryable_writes_enabled {
            cmd.insert("txnNumber", self.txn_number());
        }

        if self.causal_consistency() {
            if let Some(operation_time) = self.operation_time {
                let read_concern = cmd
                    .entry("readConcern".to_string())
                    .or_insert_with(|| Bson::Document(Document::new()));
                if let Bson::Document(rc) = read_concern {
                    rc.insert("afterClusterTime", operation_time);
                }
            }
        }

        match self.transaction.state {
            TransactionState::Starting => {
                cmd.insert("startTransaction", true);
                cmd.insert("autocommit", false);
                cmd.remove("writeConcern");
                if let Some(options) = &self.transaction.options {
                    if let Some(rc) = &options.read_concern {
                        cmd.insert("readConcern", rc.clone().into_document());
                    }
                }
            }
            TransactionState::InProgress => {
                cmd.insert("autocommit", false);
                cmd.remove("readConcern");
                cmd.remove("writeConcern");
            }
            _ => {}
        }
    }

    /// Applies a reply per spec §4.8's `updateSession`.
    pub fn update_session(&mut self, reply: &Document, write_concern_acknowledged: bool) {
        if let Some(cluster_time) = ClusterTime::from_reply(reply) {
            self.advance_cluster_time(cluster_time);
        }
        if write_concern_acknowledged {
            if let Ok(operation_time) = reply.get_timestamp("operationTime") {
                self.advance_operation_time(operation_time);
            }
        }
        if let Ok(recovery_token) = reply.get_document("recoveryToken") {
            self.transaction.recovery_token = Some(recovery_token.clone());
        }
        if self.transaction.state == TransactionState::Starting {
            self.transaction.state = TransactionState::InProgress;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn timestamp(time: u32, increment: u32) -> Timestamp {
        Timestamp { time, increment }
    }

    #[tokio::test]
    async fn pool_checkout_allocates_when_empty() {
        let pool = ServerSessionPool::new();
        let session = pool.check_out(Duration::from_secs(1800)).await;
        assert_eq!(session.txn_number, 0);
    }

    #[tokio::test]
    async fn pool_round_trips_a_session() {
        let pool = ServerSessionPool::new();
        let session = pool.check_out(Duration::from_secs(1800)).await;
        let id = session.id().clone();
        pool.check_in(session, Duration::from_secs(1800)).await;
        let checked_out = pool.check_out(Duration::from_secs(1800)).await;
        assert_eq!(*checked_out.id(), id);
    }

    #[tokio::test]
    async fn pool_discards_dirty_sessions() {
        let pool = ServerSessionPool::new();
        let mut session = pool.check_out(Duration::from_secs(1800)).await;
        let id = session.id().clone();
        session.dirty = true;
        pool.check_in(session, Duration::from_secs(1800)).await;
        let fresh = pool.check_out(Duration::from_secs(1800)).await;
        assert_ne!(*fresh.id(), id);
    }

    #[test]
    fn bind_session_adds_lsid_and_txn_number() {
        let server_session = ServerSession::new();
        let mut session = ClientSession::new(server_session, None, true);
        session.get_and_increment_txn_number();
        let mut cmd = doc! { "ping": 1 };
        session.bind_session(&mut cmd, true);
        assert!(cmd.contains_key("lsid"));
        assert_eq!(cmd.get_i64("txnNumber").unwrap(), 1);
    }

    #[test]
    fn bind_session_in_starting_transaction_adds_flags_and_drops_write_concern() {
        let server_session = ServerSession::new();
        let mut session = ClientSession::new(server_session, None, false);
        session.start_transaction(None).unwrap();
        let mut cmd = doc! { "insert": "coll", "writeConcern": { "w": 1 } };
        session.bind_session(&mut cmd, false);
        assert_eq!(cmd.get_bool("startTransaction").unwrap(), true);
        assert_eq!(cmd.get_bool("autocommit").unwrap(), false);
        assert!(!cmd.contains_key("writeConcern"));
    }

    #[test]
    fn update_session_advances_operation_time_monotonically() {
        let server_session = ServerSession::new();
        let mut session = ClientSession::new(server_session, None, true);
        session.update_session(&doc! { "operationTime": timestamp(10, 1) }, true);
        assert_eq!(session.operation_time(), Some(timestamp(10, 1)));
        session.update_session(&doc! { "operationTime": timestamp(5, 9) }, true);
        assert_eq!(session.operation_time(), Some(timestamp(10, 1)));
        session.update_session(&doc! { "operationTime": timestamp(11, 0) }, true);
        assert_eq!(session.operation_time(), Some(timestamp(11, 0)));
    }

    #[test]
    fn start_transaction_rejects_when_already_in_progress() {
        let server_session = ServerSession::new();
        let mut session = ClientSession::new(server_session, None, false);
        session.start_transaction(None).unwrap();
        session.transaction.state = TransactionState::InProgress;
        assert!(session.start_transaction(None).is_err());
    }
}
