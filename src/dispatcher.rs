//! Top-level command dispatch (spec §4.9): owns the topology, the
//! per-server connection pools and monitors, and the server session pool,
//! and ties them together into `issue_command`.
//!
//! Grounded on the teacher's `client/executor.rs` retry loop, trimmed of
//! change-stream/CSFLE/load-balancer concerns that are out of this core's
//! scope (DESIGN.md).

use std::{collections::HashMap, sync::Arc, time::Duration};

use bson::{doc, Document};
use tokio::sync::Mutex;

use crate::{
    cmap::Pool,
    concern::WriteConcern,
    error::{Error, ErrorKind, Result, RETRYABLE_WRITE_ERROR, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT},
    options::{ClientOptions, ServerAddress},
    sdam::{Monitor, Topology},
    selection_criteria::{ReadPreference, SelectionCriteria},
    session::{ClientSession, ServerSession, ServerSessionPool, SessionOptions, TransactionState},
};

/// Whether an operation reads or writes, per spec §4.9's retry rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
}

/// Owns everything needed to run commands against a deployment: the
/// topology authority, one connection pool and monitor per known server,
/// and the session pool (spec §4.9, §5).
pub struct Dispatcher {
    topology: Arc<Topology>,
    pools: Mutex<HashMap<ServerAddress, Arc<Pool>>>,
    session_pool: Arc<ServerSessionPool>,
    options: Arc<ClientOptions>,
}

impl Dispatcher {
    /// Builds a dispatcher and starts a monitor for every seed in `options`.
    pub fn new(options: ClientOptions) -> Arc<Self> {
        let options = Arc::new(options);
        let dispatcher = Arc::new(Self {
            topology: Arc::new(Topology::new(options.clone())),
            pools: Mutex::new(HashMap::new()),
            session_pool: Arc::new(ServerSessionPool::new()),
            options: options.clone(),
        });
        for address in &options.hosts {
            dispatcher.clone().spawn_monitor(address.clone());
        }
        dispatcher
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    fn spawn_monitor(self: Arc<Self>, address: ServerAddress) {
        tokio::spawn(async move {
            let pool = self.pool_for(&address).await;
            let dispatcher = self.clone();
            let on_discover: crate::sdam::DiscoverFn = Arc::new(move |found: ServerAddress| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { dispatcher.discover(found).await });
            });
            let monitor = Monitor::new(address, self.options.clone(), self.topology.clone(), pool, on_discover);
            monitor.run().await;
        });
    }

    /// Returns the pool for `address`, lazily creating (but not monitoring)
    /// one for servers discovered after startup via a primary's `hosts`
    /// list. The caller is responsible for starting a monitor for genuinely
    /// new servers (spec §4.5's topology-driven server set).
    async fn pool_for(&self, address: &ServerAddress) -> Arc<Pool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(address) {
            return pool.clone();
        }
        let pool = Arc::new(
            Pool::new(address.clone(), self.options.clone())
                .with_max_pool_size(self.options.max_pool_size)
                .with_max_idle_time(self.options.max_idle_time),
        );
        pool.spawn_idle_reaper();
        pools.insert(address.clone(), pool.clone());
        pool
    }

    /// Ensures a newly discovered server (named in a primary's `hosts` but
    /// not a configured seed) has a running monitor.
    pub async fn discover(self: &Arc<Self>, address: ServerAddress) {
        let mut pools = self.pools.lock().await;
        if pools.contains_key(&address) {
            return;
        }
        drop(pools);
        self.clone().spawn_monitor(address);
    }

    async fn logical_session_timeout(&self) -> Duration {
        self.topology
            .description()
            .await
            .logical_session_timeout_minutes
            .map(|minutes| Duration::from_secs(minutes as u64 * 60))
            .unwrap_or(Duration::from_secs(30 * 60))
    }

    /// Starts an explicit session (spec §3/§4.7).
    pub async fn start_session(&self, options: Option<SessionOptions>) -> ClientSession {
        let timeout = self.logical_session_timeout().await;
        let server_session = self.session_pool.check_out(timeout).await;
        ClientSession::new(server_session, options, false)
    }

    async fn implicit_session(&self) -> ClientSession {
        let timeout = self.logical_session_timeout().await;
        let server_session = self.session_pool.check_out(timeout).await;
        ClientSession::new(server_session, None, true)
    }

    /// Returns `session`'s server session to the pool. Must be called
    /// exactly once, whether the session was implicit or explicit
    /// (spec §4.7).
    pub async fn release_session(&self, session: &mut ClientSession) {
        let timeout = self.logical_session_timeout().await;
        session.release(&self.session_pool, timeout).await;
    }

    /// Runs `command` against `db`, honoring `criteria`, session binding,
    /// and the single-retry rules of spec §4.9. Uses `session` if supplied,
    /// otherwise acquires and releases an implicit one.
    pub async fn issue_command(
        &self,
        db: &str,
        command: Document,
        kind: OperationKind,
        criteria: &SelectionCriteria,
        session: Option<&mut ClientSession>,
    ) -> Result<Document> {
        let mut implicit = None;
        let session_ref: &mut ClientSession = match session {
            Some(s) => s,
            None => {
                implicit = Some(self.implicit_session().await);
                implicit.as_mut().expect("just assigned")
            }
        };

        let result = self
            .issue_command_with_retry(db, command, kind, criteria, session_ref)
            .await;

        if let Some(mut session) = implicit {
            self.release_session(&mut session).await;
        }

        result
    }

    /// Sends `commitTransaction` per spec §4.8: the first attempt honors the
    /// transaction's own write concern, a retry after an
    /// `UnknownTransactionCommitResult` is forced to `w: majority`, and a
    /// transaction started but never written to (`Starting`, never
    /// `InProgress`) commits with no network I/O at all (spec.md §9 open
    /// question 1).
    pub async fn commit_transaction(&self, session: &mut ClientSession) -> Result<()> {
        match session.transaction.state {
            TransactionState::Starting => {
                session.mark_committed(false);
                return Ok(());
            }
            // A second commit on a transaction that never wrote anything stays a no-op.
            TransactionState::Committed { data_committed: false } => return Ok(()),
            TransactionState::InProgress | TransactionState::Committed { data_committed: true } => {}
            TransactionState::NoTransaction | TransactionState::Aborted => {
                return Err(ErrorKind::Transaction {
                    message: "commitTransaction called with no transaction started".into(),
                }
                .into());
            }
        }

        let write_concern = session
            .transaction
            .options
            .as_ref()
            .and_then(|o| o.write_concern.clone());
        let criteria = session
            .transaction
            .pinned
            .clone()
            .unwrap_or_else(|| SelectionCriteria::ReadPreference(ReadPreference::Primary));
        let start_time = session.transaction.start_time;

        let result = self
            .send_transaction_command("commitTransaction", session, write_concern.clone(), &criteria)
            .await;

        match result {
            Ok(()) => {
                session.mark_committed(true);
                Ok(())
            }
            Err(mut error) if error.is_network_error() || error.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) => {
                error.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
                let retry_deadline = start_time
                    .map(|t| t.elapsed() < crate::session::DEFAULT_TRANSACTION_RETRY_TIMEOUT)
                    .unwrap_or(false);
                if retry_deadline {
                    let retry_concern = Some(WriteConcern::majority());
                    match self
                        .send_transaction_command("commitTransaction", session, retry_concern, &criteria)
                        .await
                    {
                        Ok(()) => {
                            session.mark_committed(true);
                            Ok(())
                        }
                        Err(mut retry_error) => {
                            retry_error.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
                            Err(retry_error)
                        }
                    }
                } else {
                    Err(error)
                }
            }
            Err(error) => Err(error),
        }
    }

    /// Sends `abortTransaction` per spec §4.8: best-effort, errors are
    /// swallowed since there is nothing useful a caller can do with an abort
    /// failure (the transaction is abandoned either way).
    pub async fn abort_transaction(&self, session: &mut ClientSession) {
        if !session.in_transaction() {
            return;
        }
        let write_concern = session
            .transaction
            .options
            .as_ref()
            .and_then(|o| o.write_concern.clone());
        let criteria = session
            .transaction
            .pinned
            .clone()
            .unwrap_or_else(|| SelectionCriteria::ReadPreference(ReadPreference::Primary));
        let _ = self
            .send_transaction_command("abortTransaction", session, write_concern, &criteria)
            .await;
        session.mark_aborted();
    }

    /// Sends a `commitTransaction`/`abortTransaction` command directly,
    /// bypassing [`Self::attempt`]'s generic `bind_session` call: that call's
    /// `InProgress` branch strips `writeConcern` from in-transaction CRUD
    /// commands, but the commit/abort commands themselves must carry it
    /// (spec §4.8).
    async fn send_transaction_command(
        &self,
        name: &str,
        session: &mut ClientSession,
        write_concern: Option<WriteConcern>,
        criteria: &SelectionCriteria,
    ) -> Result<()> {
        let mut command = doc! {
            "lsid": session.id().clone(),
            "txnNumber": session.txn_number(),
            "autocommit": false,
        };
        command.insert(name, 1);
        if let Some(wc) = write_concern.filter(|wc| !wc.is_empty()) {
            command.insert("writeConcern", wc.into_document());
        }
        if let Some(recovery_token) = session.transaction.recovery_token.clone() {
            command.insert("recoveryToken", recovery_token);
        }

        let address = self.topology.select_server(criteria).await?;
        let pool = self.pool_for(&address).await;
        let mut conn = pool.checkout().await?;
        let result = conn.send_command("admin", command).await;
        pool.check_in(conn).await;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                session.mark_dirty();
                return Err(e);
            }
        };
        session.update_session(&reply, true);
        if reply.get_f64("ok").unwrap_or(1.0) == 1.0 {
            Ok(())
        } else {
            Err(command_error(&reply))
        }
    }

    async fn issue_command_with_retry(
        &self,
        db: &str,
        command: Document,
        kind: OperationKind,
        criteria: &SelectionCriteria,
        session: &mut ClientSession,
    ) -> Result<Document> {
        let is_get_more = command.get_str("getMore").is_ok() || command.contains_key("getMore");
        let retryable = match kind {
            OperationKind::Read => self.options.retry_reads && !is_get_more,
            OperationKind::Write => self.options.retry_writes,
        };

        let effective_criteria = session
            .transaction
            .pinned
            .clone()
            .unwrap_or_else(|| criteria.clone());

        // Retryable writes dedup server-side on one txnNumber shared by both
        // the original send and its single retry (spec §8 scenario 3); a
        // write inside a multi-statement transaction already carries the
        // txnNumber `start_transaction` assigned and must not bump it again.
        if retryable && kind == OperationKind::Write && !session.in_transaction() {
            session.get_and_increment_txn_number();
        }

        let first = self
            .attempt(db, command.clone(), kind, &effective_criteria, session)
            .await;

        let error = match first {
            Ok(reply) => return Ok(reply),
            Err(e) => e,
        };

        let should_retry = match kind {
            OperationKind::Read => retryable && error.is_read_retryable(),
            OperationKind::Write => retryable && error.is_write_retryable(),
        };

        if !should_retry {
            if session.in_transaction() && error.is_transient_transaction_error() {
                let mut error = error;
                error.add_label(TRANSIENT_TRANSACTION_ERROR);
                return Err(error);
            }
            return Err(error);
        }

        #[cfg(feature = "tracing-unstable")]
        tracing::debug!(db, ?kind, error = %error, "retrying command after retryable error");

        self.attempt(db, command, kind, &effective_criteria, session)
            .await
            .map_err(|mut retry_error| {
                if kind == OperationKind::Write {
                    retry_error.add_label(RETRYABLE_WRITE_ERROR);
                }
                retry_error
            })
    }

    async fn attempt(
        &self,
        db: &str,
        mut command: Document,
        kind: OperationKind,
        criteria: &SelectionCriteria,
        session: &mut ClientSession,
    ) -> Result<Document> {
        let address = self.topology.select_server(criteria).await?;
        let pool = self.pool_for(&address).await;
        let mut conn = pool.checkout().await?;

        session.bind_session(&mut command, kind == OperationKind::Write && self.options.retry_writes);

        #[cfg(feature = "tracing-unstable")]
        tracing::debug!(host = %address, db, ?kind, "sending command");

        let result = conn.send_command(db, command).await;
        pool.check_in(conn).await;

        match result {
            Ok(reply) => {
                let write_concern_acknowledged = !matches!(kind, OperationKind::Write)
                    || reply.get_f64("ok").unwrap_or(1.0) != 0.0;
                session.update_session(&reply, write_concern_acknowledged);
                if reply.get_f64("ok").unwrap_or(1.0) == 1.0 {
                    Ok(reply)
                } else {
                    Err(command_error(&reply))
                }
            }
            Err(e) => {
                session.mark_dirty();
                Err(e)
            }
        }
    }
}

fn command_error(reply: &Document) -> Error {
    let code = reply.get_i32("code").unwrap_or(0);
    let message = reply
        .get_str("errmsg")
        .unwrap_or("command failed")
        .to_string();
    Error::new(ErrorKind::Command { code, message }, [])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn get_more_is_not_retried_as_a_read() {
        let command = bson::doc! { "getMore": 123i64, "collection": "c" };
        assert!(command.get_str("getMore").is_err() && command.contains_key("getMore"));
    }

    #[tokio::test]
    async fn committing_a_starting_transaction_sends_no_command() {
        let dispatcher = Dispatcher::new(ClientOptions::builder().build());
        let mut session = dispatcher.start_session(None).await;
        session.start_transaction(None).unwrap();
        dispatcher.commit_transaction(&mut session).await.unwrap();
        assert_eq!(
            session.transaction.state,
            crate::session::TransactionState::Committed { data_committed: false }
        );
    }

    #[tokio::test]
    async fn recommitting_an_empty_transaction_stays_a_no_op() {
        let dispatcher = Dispatcher::new(ClientOptions::builder().build());
        let mut session = dispatcher.start_session(None).await;
        session.start_transaction(None).unwrap();
        dispatcher.commit_transaction(&mut session).await.unwrap();
        dispatcher.commit_transaction(&mut session).await.unwrap();
    }

    #[tokio::test]
    async fn aborting_outside_a_transaction_is_a_no_op() {
        let dispatcher = Dispatcher::new(ClientOptions::builder().build());
        let mut session = dispatcher.start_session(None).await;
        dispatcher.abort_transaction(&mut session).await;
        assert_eq!(session.transaction.state, crate::session::TransactionState::NoTransaction);
    }
}
