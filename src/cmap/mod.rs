//! Connection establishment, the initial handshake, and the per-server
//! connection pool (spec §4.2, §4.9).
//!
//! Grounded on the teacher's `cmap/conn.rs` (checkout/check-in lifecycle,
//! idle/generation staleness tracking) and `cmap/establish/handshake.rs`
//! (client metadata document), trimmed of load-balancer pinning and CMAP
//! event emission — this core reports pool state to `sdam::Topology`
//! directly rather than through an event bus.

use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use bson::{doc, Document};
use tokio::{
    io::{AsyncRead, AsyncWrite, BufStream, ReadBuf},
    net::TcpStream,
    sync::Mutex,
};

use crate::{
    error::{ErrorKind, Result, TransportError, TransportErrorTag},
    options::{ClientOptions, Compressor, ServerAddress},
    wire::{self, Message, MessageFlags},
};

fn next_connection_id() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(1);
    NEXT.fetch_add(1, Ordering::SeqCst)
}

/// The union of transports a `Connection` may be built on. TLS support is
/// feature-gated exactly like the teacher's `AsyncStream`.
pub enum AsyncStream {
    Tcp(TcpStream),
    #[cfg(feature = "rustls-tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "rustls-tls")]
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            AsyncStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "rustls-tls")]
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "rustls-tls")]
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "rustls-tls")]
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

async fn connect_tcp(address: &ServerAddress, connect_timeout: Duration) -> Result<TcpStream> {
    let fut = TcpStream::connect((address.host(), address.port()));
    let stream = tokio::time::timeout(connect_timeout, fut)
        .await
        .map_err(|_| crate::error::Error::from(TransportError::new(TransportErrorTag::Tcp, "connect (timed out)", address.clone())))?
        .map_err(|e| {
            crate::error::Error::from(TransportError::new(TransportErrorTag::Tcp, "connect", address.clone()))
                .with_source(e.into())
        })?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Negotiated facts about a server, captured during the handshake (spec
/// §4.2/§4.6: wire version range, compressors, session timeout).
#[derive(Clone, Debug, Default)]
pub struct StreamDescription {
    pub max_wire_version: i32,
    pub min_wire_version: i32,
    pub max_bson_object_size: i64,
    pub max_message_size_bytes: i64,
    pub max_write_batch_size: i64,
    pub logical_session_timeout_minutes: Option<i64>,
    pub compressors: Vec<String>,
}

impl StreamDescription {
    fn from_hello_reply(doc: &Document) -> Self {
        Self {
            max_wire_version: doc.get_i32("maxWireVersion").unwrap_or(0),
            min_wire_version: doc.get_i32("minWireVersion").unwrap_or(0),
            max_bson_object_size: doc.get_i64("maxBsonObjectSize").unwrap_or(16 * 1024 * 1024),
            max_message_size_bytes: doc
                .get_i64("maxMessageSizeBytes")
                .unwrap_or(48 * 1024 * 1024),
            max_write_batch_size: doc.get_i64("maxWriteBatchSize").unwrap_or(100_000),
            logical_session_timeout_minutes: doc.get_i64("logicalSessionTimeoutMinutes").ok(),
            compressors: doc
                .get_array("compression")
                .map(|arr| {
                    arr.iter()
                        .filter_map(|b| b.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// A single-threaded, request/response-correlated connection to one mongod/
/// mongos (spec §4.2).
pub struct Connection {
    pub id: u32,
    pub address: ServerAddress,
    pub generation: u32,
    pub created_at: Instant,
    available_since: Option<Instant>,
    stream: BufStream<AsyncStream>,
    pub stream_description: Option<StreamDescription>,
    pub compressor: Option<Compressor>,
    more_to_come: bool,
    errored: bool,
}

impl Connection {
    /// Opens a standalone connection for monitoring use (not drawn from a
    /// `Pool`), per spec §4.2's distinction between pooled and monitoring
    /// connections.
    pub async fn connect_monitoring(address: ServerAddress, options: &ClientOptions) -> Result<Self> {
        Self::establish(address, options, 0).await
    }

    async fn establish(
        address: ServerAddress,
        options: &ClientOptions,
        generation: u32,
    ) -> Result<Self> {
        let tcp = connect_tcp(&address, options.connect_timeout).await?;
        let stream = wrap_tls(tcp, &address, options).await?;

        let mut conn = Self {
            id: next_connection_id(),
            address,
            generation,
            created_at: Instant::now(),
            available_since: None,
            stream: BufStream::new(stream),
            stream_description: None,
            compressor: None,
            more_to_come: false,
            errored: false,
        };
        conn.handshake(options).await?;
        Ok(conn)
    }

    /// Runs the `hello` handshake command and negotiates compression (spec
    /// §4.1: compressors are proposed via `compression` and the server
    /// echoes back the subset it supports).
    async fn handshake(&mut self, options: &ClientOptions) -> Result<()> {
        let mut command = doc! {
            "hello": 1,
            "client": client_metadata_document(options),
        };
        if !options.compressors.is_empty() {
            let names: Vec<&str> = options.compressors.iter().map(Compressor::name).collect();
            command.insert("compression", names);
        }

        let reply = self.run_command_uncompressed("admin", command).await?;
        if reply.get_i32("ok").unwrap_or_else(|_| reply.get_f64("ok").unwrap_or(0.0) as i32) != 1 {
            return Err(ErrorKind::Command {
                code: reply.get_i32("code").unwrap_or(0),
                message: reply
                    .get_str("errmsg")
                    .unwrap_or("hello command failed")
                    .to_string(),
            }
            .into());
        }

        let description = StreamDescription::from_hello_reply(&reply);
        self.compressor =
            crate::compression::negotiate(&options.compressors, &description.compressors)
                .cloned();
        self.stream_description = Some(description);
        Ok(())
    }

    async fn run_command_uncompressed(&mut self, db: &str, mut command: Document) -> Result<Document> {
        command.insert("$db", db);
        let message = Message::with_document(command);
        message.write_to(&mut self.stream).await?;
        let response = Message::read_from(&mut self.stream).await?;
        response.single_document_response()
    }

    /// Sends `command` against `db`, compressing it first unless it's on the
    /// compression-exempt list (spec §4.1).
    pub async fn send_command(&mut self, db: &str, mut command: Document) -> Result<Document> {
        if self.more_to_come {
            return Err(ErrorKind::Internal {
                message: format!("attempted to send on {} while moreToCome is set", self.address),
            }
            .into());
        }
        command.insert("$db", db);
        let command_name = command.keys().next().cloned().unwrap_or_default();

        let message = Message::with_document(command);
        if let Err(e) = self.write_message(&message, &command_name).await {
            self.errored = true;
            return Err(self.as_transport_error(e, "write"));
        }

        let response = match Message::read_from(&mut self.stream).await {
            Ok(r) => r,
            Err(e) => {
                self.errored = true;
                return Err(self.as_transport_error(e, "read"));
            }
        };
        self.more_to_come = response.flags.contains(MessageFlags::MORE_TO_COME);
        response.single_document_response()
    }

    /// Tags a wire-level failure with the host and action it occurred on,
    /// keeping the underlying error as the cause (spec §4.2's disconnect
    /// notification shape).
    fn as_transport_error(&self, source: crate::error::Error, action: &'static str) -> crate::error::Error {
        let tag = match self.stream.get_ref() {
            AsyncStream::Tcp(_) => TransportErrorTag::Tcp,
            #[cfg(feature = "rustls-tls")]
            AsyncStream::Tls(_) => TransportErrorTag::Ssl,
        };
        crate::error::Error::from(TransportError::new(tag, action, self.address.clone())).with_source(source)
    }

    async fn write_message(&mut self, message: &Message, command_name: &str) -> Result<()> {
        match &self.compressor {
            Some(compressor) if !crate::compression::is_compression_exempt(command_name) => {
                let mut body = Vec::new();
                body.extend_from_slice(&message.flags.bits().to_le_bytes());
                for section in &message.sections {
                    if let wire::MessageSection::Document(doc) = section {
                        doc.to_writer(&mut body)?;
                    }
                }
                wire::write_compressed(&mut self.stream, compressor, wire::OpCode::Message, &body)
                    .await
            }
            _ => message.write_to(&mut self.stream).await,
        }
    }

    /// Sends `command` with the `exhaustAllowed` flag set, used by the
    /// streaming monitor to start a push-style `hello` stream against
    /// servers with wire version >= 9 (spec §11 supplemented feature).
    pub async fn send_exhaust_hello(&mut self, command: Document) -> Result<Document> {
        let mut command = command;
        command.insert("$db", "admin");
        let message = Message {
            request_id: wire::next_request_id(),
            response_to: 0,
            flags: MessageFlags::EXHAUST_ALLOWED,
            sections: vec![wire::MessageSection::Document(command)],
        };
        message
            .write_to(&mut self.stream)
            .await
            .map_err(|e| self.as_transport_error(e, "exhaust hello write"))?;
        let response = Message::read_from(&mut self.stream)
            .await
            .map_err(|e| self.as_transport_error(e, "exhaust hello read"))?;
        self.more_to_come = response.flags.contains(MessageFlags::MORE_TO_COME);
        response.single_document_response()
    }

    /// Reads the next pushed reply on an exhaust stream. Only valid after a
    /// response with `moreToCome` set (spec §11).
    pub async fn receive_exhaust_message(&mut self) -> Result<Document> {
        if !self.more_to_come {
            return Err(ErrorKind::Internal {
                message: "receive_exhaust_message called without a pending exhaust stream".into(),
            }
            .into());
        }
        let response = Message::read_from(&mut self.stream)
            .await
            .map_err(|e| self.as_transport_error(e, "exhaust stream read"))?;
        self.more_to_come = response.flags.contains(MessageFlags::MORE_TO_COME);
        response.single_document_response()
    }

    pub fn is_streaming(&self) -> bool {
        self.more_to_come
    }

    pub fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        match (self.available_since, max_idle_time) {
            (Some(since), Some(max)) => since.elapsed() >= max,
            _ => false,
        }
    }

    pub fn has_errored(&self) -> bool {
        self.errored
    }

    fn mark_available(&mut self) {
        self.available_since = Some(Instant::now());
    }

    fn mark_in_use(&mut self) {
        self.available_since = None;
    }
}

#[cfg(feature = "rustls-tls")]
async fn wrap_tls(
    tcp: TcpStream,
    address: &ServerAddress,
    options: &ClientOptions,
) -> Result<AsyncStream> {
    use std::sync::OnceLock;

    if options.tls.is_none() {
        return Ok(AsyncStream::Tcp(tcp));
    }

    static ROOTS: OnceLock<Arc<rustls::RootCertStore>> = OnceLock::new();
    let roots = ROOTS.get_or_init(|| {
        let mut store = rustls::RootCertStore::empty();
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(store)
    });

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots.as_ref().clone())
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let server_name = rustls::pki_types::ServerName::try_from(address.host().to_string()).map_err(|e| {
        crate::error::Error::from(TransportError::new(TransportErrorTag::Ssl, "resolve server name", address.clone()))
            .with_source(ErrorKind::Tls { message: e.to_string() }.into())
    })?;

    let tls_stream = connector.connect(server_name, tcp).await.map_err(|e| {
        crate::error::Error::from(TransportError::new(TransportErrorTag::Ssl, "TLS handshake", address.clone()))
            .with_source(ErrorKind::Tls { message: e.to_string() }.into())
    })?;
    Ok(AsyncStream::Tls(Box::new(tls_stream)))
}

#[cfg(not(feature = "rustls-tls"))]
async fn wrap_tls(
    tcp: TcpStream,
    _address: &ServerAddress,
    options: &ClientOptions,
) -> Result<AsyncStream> {
    if options.tls.is_some() {
        return Err(ErrorKind::InvalidArgument {
            message: "TLS requested but the rustls-tls feature is not enabled".into(),
        }
        .into());
    }
    Ok(AsyncStream::Tcp(tcp))
}

fn client_metadata_document(options: &ClientOptions) -> Document {
    let mut metadata = Document::new();
    if let Some(app_name) = &options.app_name {
        metadata.insert("application", doc! { "name": app_name.clone() });
    }
    metadata.insert(
        "driver",
        doc! { "name": "mongo-core", "version": env!("CARGO_PKG_VERSION") },
    );
    metadata.insert("os", doc! { "type": std::env::consts::OS });
    metadata.insert("platform", "rustc");
    metadata
}

/// A bounded, blocking-checkout connection pool for one server (spec §4.2).
pub struct Pool {
    address: ServerAddress,
    options: Arc<ClientOptions>,
    max_pool_size: u32,
    max_idle_time: Option<Duration>,
    inner: Arc<Mutex<PoolInner>>,
    /// Woken on every check-in/clear/establish-failure so a blocked
    /// `checkout` can re-check whether it's now first in line.
    turn: tokio::sync::Notify,
}

struct PoolInner {
    available: VecDeque<Connection>,
    total: u32,
    generation: u32,
    /// Ticket counters implementing first-come-first-served checkout
    /// ordering (spec §4.2): a waiter may proceed only once `now_serving`
    /// reaches the ticket it was handed.
    next_ticket: u64,
    now_serving: u64,
}

impl Pool {
    pub fn new(address: ServerAddress, options: Arc<ClientOptions>) -> Self {
        Self {
            address,
            options,
            max_pool_size: 100,
            max_idle_time: None,
            inner: Arc::new(Mutex::new(PoolInner {
                available: VecDeque::new(),
                total: 0,
                generation: 0,
                next_ticket: 0,
                now_serving: 0,
            })),
            turn: tokio::sync::Notify::new(),
        }
    }

    pub fn with_max_pool_size(mut self, max_pool_size: u32) -> Self {
        self.max_pool_size = max_pool_size;
        self
    }

    pub fn with_max_idle_time(mut self, max_idle_time: Option<Duration>) -> Self {
        self.max_idle_time = max_idle_time;
        self
    }

    /// Starts a background task that periodically reaps idle connections;
    /// a no-op if `max_idle_time` is unset. The task holds only a `Weak`
    /// reference and exits once every other handle to the pool is dropped.
    pub fn spawn_idle_reaper(self: &Arc<Self>) {
        let Some(max_idle_time) = self.max_idle_time else {
            return;
        };
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let period = max_idle_time.max(Duration::from_millis(500));
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match pool.upgrade() {
                    Some(pool) => pool.reap_idle().await,
                    None => return,
                }
            }
        });
    }

    /// Checks out a connection, reusing an idle one from the pool if
    /// available, else establishing a new one so long as `max_pool_size`
    /// has not been reached. Once the pool is saturated, blocks in strict
    /// arrival order until a connection frees or `server_selection_timeout`
    /// elapses (spec §4.2: "connection checkout is a blocking operation;
    /// the pool enforces first-come-first-served ordering").
    pub async fn checkout(&self) -> Result<Connection> {
        let deadline = Instant::now() + self.options.server_selection_timeout;
        let my_ticket = {
            let mut guard = self.inner.lock().await;
            let ticket = guard.next_ticket;
            guard.next_ticket += 1;
            ticket
        };

        loop {
            {
                let mut guard = self.inner.lock().await;
                if guard.now_serving == my_ticket {
                    while let Some(mut conn) = guard.available.pop_front() {
                        if conn.generation != guard.generation || conn.is_idle(self.max_idle_time) {
                            guard.total = guard.total.saturating_sub(1);
                            continue;
                        }
                        conn.mark_in_use();
                        guard.now_serving += 1;
                        self.turn.notify_waiters();
                        return Ok(conn);
                    }

                    if guard.total < self.max_pool_size {
                        guard.total += 1;
                        let generation = guard.generation;
                        guard.now_serving += 1;
                        drop(guard);
                        self.turn.notify_waiters();
                        return match Connection::establish(self.address.clone(), &self.options, generation).await {
                            Ok(conn) => Ok(conn),
                            Err(e) => {
                                let mut guard = self.inner.lock().await;
                                guard.total = guard.total.saturating_sub(1);
                                drop(guard);
                                self.turn.notify_waiters();
                                Err(e)
                            }
                        };
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let mut guard = self.inner.lock().await;
                if guard.now_serving == my_ticket {
                    guard.now_serving += 1;
                }
                drop(guard);
                self.turn.notify_waiters();
                #[cfg(feature = "tracing-unstable")]
                tracing::debug!(host = %self.address, "checkout timed out waiting for a free connection");
                return Err(ErrorKind::ServerSelection {
                    message: format!(
                        "timed out after {:?} waiting for a connection to {}",
                        self.options.server_selection_timeout, self.address
                    ),
                }
                .into());
            }

            let _ = tokio::time::timeout(remaining, self.turn.notified()).await;
        }
    }

    /// Returns a connection to the pool, discarding it instead if it has
    /// errored or belongs to a stale generation (spec §4.2).
    pub async fn check_in(&self, mut conn: Connection) {
        let mut guard = self.inner.lock().await;
        if conn.has_errored() || conn.generation != guard.generation {
            guard.total = guard.total.saturating_sub(1);
            drop(guard);
            self.turn.notify_waiters();
            return;
        }
        conn.mark_available();
        guard.available.push_back(conn);
        drop(guard);
        self.turn.notify_waiters();
    }

    /// Invalidates every pooled connection by bumping the generation (spec
    /// §4.2's "pool clear" on a network error / `notPrimary` observation).
    pub async fn clear(&self) {
        let mut guard = self.inner.lock().await;
        guard.generation += 1;
        guard.total = guard.total.saturating_sub(guard.available.len() as u32);
        guard.available.clear();
        drop(guard);
        self.turn.notify_waiters();
    }

    /// Drops connections that have been idle longer than `max_idle_time`
    /// (spec §5's idle-reap interval); driven periodically by
    /// [`Self::spawn_idle_reaper`].
    pub async fn reap_idle(&self) {
        if self.max_idle_time.is_none() {
            return;
        }
        let mut guard = self.inner.lock().await;
        let before = guard.available.len();
        guard
            .available
            .retain(|conn| !conn.is_idle(self.max_idle_time));
        let removed = before - guard.available.len();
        guard.total = guard.total.saturating_sub(removed as u32);
        if removed > 0 {
            drop(guard);
            self.turn.notify_waiters();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stream_description_defaults_when_fields_missing() {
        let reply = doc! { "ok": 1.0 };
        let desc = StreamDescription::from_hello_reply(&reply);
        assert_eq!(desc.max_wire_version, 0);
        assert_eq!(desc.max_bson_object_size, 16 * 1024 * 1024);
        assert!(desc.compressors.is_empty());
    }

    #[test]
    fn stream_description_reads_compressors() {
        let reply = doc! {
            "ok": 1.0,
            "maxWireVersion": 17,
            "compression": ["zstd", "zlib"],
            "logicalSessionTimeoutMinutes": 30i64,
        };
        let desc = StreamDescription::from_hello_reply(&reply);
        assert_eq!(desc.max_wire_version, 17);
        assert_eq!(desc.compressors, vec!["zstd".to_string(), "zlib".to_string()]);
        assert_eq!(desc.logical_session_timeout_minutes, Some(30));
    }
}
