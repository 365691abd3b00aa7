//! Server Discovery and Monitoring: per-server descriptions, the topology
//! state machine, server selection, and the background monitors that keep
//! both current (spec §4.6, §4.7).
//!
//! Grounded on the teacher's `sdam/description/server.rs` (`ServerDescription`/
//! `ServerType`), `sdam/description/topology.rs` (the `TopologyType` state
//! machine), `sdam/description/topology/server_selection/mod.rs` (the
//! suitable-servers / latency-window algorithm), and `sdam/monitor.rs` (the
//! polling loop) — collapsed into one module and driven by this crate's
//! `cmap::Connection` instead of the teacher's `hello`/`is_master` facade.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use bson::{doc, Document};
use rand::seq::IteratorRandom;
use tokio::sync::{Notify, RwLock};

use crate::{
    cmap::{Connection, Pool},
    error::{Error, ErrorKind, Result},
    options::{ClientOptions, ServerAddress},
    selection_criteria::{tag_set_matches, ReadPreference, SelectionCriteria, TagSet},
};

/// The kind of server behind an address, inferred from its `hello` reply
/// (spec §4.6).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum ServerType {
    Standalone,
    Mongos,
    RsPrimary,
    RsSecondary,
    RsArbiter,
    RsOther,
    RsGhost,
    #[default]
    Unknown,
}

impl ServerType {
    fn from_hello_reply(doc: &Document) -> Self {
        if doc.get_bool("isreplicaset").unwrap_or(false) {
            return ServerType::RsGhost;
        }
        let set_name = doc.get_str("setName").ok();
        match (
            doc.get_bool("ismaster").or_else(|_| doc.get_bool("isWritablePrimary")),
            set_name,
        ) {
            (_, None) if doc.get_str("msg").ok() == Some("isdbgrid") => ServerType::Mongos,
            (Ok(true), Some(_)) => ServerType::RsPrimary,
            (_, Some(_)) if doc.get_bool("secondary").unwrap_or(false) => ServerType::RsSecondary,
            (_, Some(_)) if doc.get_bool("arbiterOnly").unwrap_or(false) => ServerType::RsArbiter,
            (_, Some(_)) if doc.get_bool("hidden").unwrap_or(false) => ServerType::RsOther,
            (_, Some(_)) => ServerType::RsOther,
            (Ok(true), None) => ServerType::Standalone,
            _ => ServerType::Unknown,
        }
    }

    pub fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone | ServerType::RsPrimary | ServerType::RsSecondary | ServerType::Mongos
        )
    }
}

/// The most recent information known about one server (spec §4.6).
#[derive(Clone, Debug)]
pub struct ServerDescription {
    pub address: ServerAddress,
    pub server_type: ServerType,
    pub set_name: Option<String>,
    pub set_version: Option<i32>,
    pub election_id: Option<bson::oid::ObjectId>,
    pub hosts: HashSet<ServerAddress>,
    pub tags: TagSet,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    pub logical_session_timeout_minutes: Option<i64>,
    pub round_trip_time: Option<Duration>,
    pub last_update: Instant,
    /// Wall-clock counterpart of `last_update` (when this driver process
    /// last refreshed the description), used by [`TopologyDescription::apply_max_staleness`]
    /// alongside `last_write_date` (spec §4.6's staleness estimate needs
    /// both on the same clock).
    pub last_update_time: bson::DateTime,
    /// The server's own `lastWrite.lastWriteDate` from its `hello` reply,
    /// if it reported one (spec §3/§4.6).
    pub last_write_date: Option<bson::DateTime>,
    pub error: Option<Error>,
}

impl ServerDescription {
    pub fn unknown(address: ServerAddress) -> Self {
        Self {
            address,
            server_type: ServerType::Unknown,
            set_name: None,
            set_version: None,
            election_id: None,
            hosts: HashSet::new(),
            tags: TagSet::new(),
            min_wire_version: 0,
            max_wire_version: 0,
            logical_session_timeout_minutes: None,
            round_trip_time: None,
            last_update: Instant::now(),
            last_update_time: bson::DateTime::now(),
            last_write_date: None,
            error: None,
        }
    }

    pub fn errored(address: ServerAddress, error: Error) -> Self {
        Self {
            error: Some(error),
            ..Self::unknown(address)
        }
    }

    /// Builds a description from a successful `hello` reply, applying the
    /// RTT EMA formula from spec §4.7: `new = 0.2 * sample + 0.8 * previous`.
    pub fn from_hello(
        address: ServerAddress,
        reply: &Document,
        sample_rtt: Duration,
        previous_rtt: Option<Duration>,
    ) -> Self {
        let hosts = ["hosts", "passives", "arbiters"]
            .iter()
            .flat_map(|key| {
                reply
                    .get_array(key)
                    .ok()
                    .into_iter()
                    .flat_map(|arr| arr.iter().filter_map(|b| b.as_str()))
                    .filter_map(|s| ServerAddress::parse(s).ok())
                    .collect::<Vec<_>>()
            })
            .collect();

        let tags = reply
            .get_document("tags")
            .ok()
            .map(|doc| {
                doc.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            address,
            server_type: ServerType::from_hello_reply(reply),
            set_name: reply.get_str("setName").ok().map(str::to_string),
            set_version: reply.get_i32("setVersion").ok(),
            election_id: reply.get_object_id("electionId").ok(),
            hosts,
            tags,
            min_wire_version: reply.get_i32("minWireVersion").unwrap_or(0),
            max_wire_version: reply.get_i32("maxWireVersion").unwrap_or(0),
            logical_session_timeout_minutes: reply.get_i64("logicalSessionTimeoutMinutes").ok(),
            round_trip_time: Some(ewma(sample_rtt, previous_rtt)),
            last_update: Instant::now(),
            last_update_time: bson::DateTime::now(),
            last_write_date: reply
                .get_document("lastWrite")
                .ok()
                .and_then(|lw| lw.get_datetime("lastWriteDate").ok())
                .copied(),
            error: None,
        }
    }
}

/// `a - b` in milliseconds, on the server's wall clock (both `a` and `b` are
/// `bson::DateTime` values, so this is immune to local monotonic-clock drift
/// between driver and server).
fn millis_between(a: bson::DateTime, b: bson::DateTime) -> i64 {
    a.timestamp_millis() - b.timestamp_millis()
}

/// `new = 0.2 * sample + 0.8 * previous` (spec §4.7); the first sample is
/// taken as-is.
fn ewma(sample: Duration, previous: Option<Duration>) -> Duration {
    match previous {
        None => sample,
        Some(prev) => Duration::from_secs_f64(0.2 * sample.as_secs_f64() + 0.8 * prev.as_secs_f64()),
    }
}

/// A read-only view of a server handed to a `SelectionCriteria::Predicate`
/// closure (spec §4.6).
pub struct ServerInfo<'a> {
    description: &'a ServerDescription,
}

impl<'a> ServerInfo<'a> {
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    pub fn tags(&self) -> &TagSet {
        &self.description.tags
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        self.description.round_trip_time
    }
}

/// The overall shape of the deployment, inferred from the union of its
/// servers' descriptions (spec §4.6).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TopologyType {
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    #[default]
    Unknown,
}

/// The aggregate, versioned view of every server the client knows about
/// (spec §4.6).
#[derive(Clone, Debug)]
pub struct TopologyDescription {
    pub topology_type: TopologyType,
    pub set_name: Option<String>,
    pub servers: HashMap<ServerAddress, ServerDescription>,
    pub logical_session_timeout_minutes: Option<i64>,
    pub max_election_id: Option<bson::oid::ObjectId>,
    pub max_set_version: Option<i32>,
}

const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

impl TopologyDescription {
    pub fn new(options: &ClientOptions) -> Self {
        let topology_type = if options.direct_connection == Some(true) {
            TopologyType::Single
        } else if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };

        let servers = options
            .hosts
            .iter()
            .cloned()
            .map(|addr| (addr.clone(), ServerDescription::unknown(addr)))
            .collect();

        Self {
            topology_type,
            set_name: options.repl_set_name.clone(),
            servers,
            logical_session_timeout_minutes: None,
            max_election_id: None,
            max_set_version: None,
        }
    }

    /// Applies a freshly observed `ServerDescription`, running the state
    /// transition table from spec §4.6.
    pub fn update(&mut self, description: ServerDescription) {
        if !self.servers.contains_key(&description.address) {
            return;
        }

        match self.topology_type {
            TopologyType::Single => {
                self.servers.insert(description.address.clone(), description);
            }
            TopologyType::Unknown => self.update_unknown(description),
            TopologyType::Sharded => self.update_sharded(description),
            TopologyType::ReplicaSetNoPrimary => self.update_rs_no_primary(description),
            TopologyType::ReplicaSetWithPrimary => self.update_rs_with_primary(description),
        }

        self.update_logical_session_timeout();
    }

    fn update_unknown(&mut self, description: ServerDescription) {
        match description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {
                self.servers.insert(description.address.clone(), description);
            }
            ServerType::Standalone => {
                if self.servers.len() == 1 {
                    self.topology_type = TopologyType::Single;
                    self.servers.insert(description.address.clone(), description);
                } else {
                    self.servers.remove(&description.address);
                }
            }
            ServerType::Mongos => {
                self.topology_type = TopologyType::Sharded;
                self.servers.insert(description.address.clone(), description);
            }
            ServerType::RsPrimary => {
                self.topology_type = TopologyType::ReplicaSetWithPrimary;
                self.record_primary(description);
            }
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                self.sync_hosts(&description);
                self.servers.insert(description.address.clone(), description);
            }
        }
    }

    fn update_sharded(&mut self, description: ServerDescription) {
        match description.server_type {
            ServerType::Unknown | ServerType::Mongos => {
                self.servers.insert(description.address.clone(), description);
            }
            _ => {
                self.servers.remove(&description.address);
            }
        }
    }

    fn update_rs_no_primary(&mut self, description: ServerDescription) {
        match description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {
                self.servers.insert(description.address.clone(), description);
            }
            ServerType::Standalone | ServerType::Mongos => {
                self.servers.remove(&description.address);
            }
            ServerType::RsPrimary => {
                self.topology_type = TopologyType::ReplicaSetWithPrimary;
                self.record_primary(description);
            }
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.sync_hosts(&description);
                self.servers.insert(description.address.clone(), description);
            }
        }
    }

    fn update_rs_with_primary(&mut self, description: ServerDescription) {
        match description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {
                self.servers.insert(description.address.clone(), description);
                self.check_if_has_primary();
            }
            ServerType::Standalone | ServerType::Mongos => {
                self.servers.remove(&description.address);
                self.check_if_has_primary();
            }
            ServerType::RsPrimary => {
                // A stale primary (lower election id/set version) is demoted to Unknown
                // rather than accepted, per spec §4.6's election-id precedence rule.
                if self.is_stale_primary(&description) {
                    self.servers
                        .insert(description.address.clone(), ServerDescription::unknown(description.address));
                } else {
                    // Any other server previously believed to be primary is now stale.
                    for other in self.servers.values_mut() {
                        if other.address != description.address && other.server_type == ServerType::RsPrimary {
                            *other = ServerDescription::unknown(other.address.clone());
                        }
                    }
                    self.record_primary(description);
                }
            }
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.servers.insert(description.address.clone(), description);
                self.check_if_has_primary();
            }
        }
    }

    fn is_stale_primary(&self, description: &ServerDescription) -> bool {
        match (description.set_version, description.election_id) {
            (Some(version), Some(election_id)) => {
                let stale_version = self.max_set_version.is_some_and(|max| version < max);
                let stale_election =
                    self.max_set_version == Some(version) && self.max_election_id.is_some_and(|max| election_id < max);
                stale_version || stale_election
            }
            _ => false,
        }
    }

    fn record_primary(&mut self, description: ServerDescription) {
        self.max_set_version = match (self.max_set_version, description.set_version) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.max_election_id = description.election_id.or(self.max_election_id);
        self.sync_hosts(&description);
        self.servers.insert(description.address.clone(), description);
    }

    fn sync_hosts(&mut self, description: &ServerDescription) {
        for host in &description.hosts {
            self.servers
                .entry(host.clone())
                .or_insert_with(|| ServerDescription::unknown(host.clone()));
        }
        let known_hosts = description.hosts.clone();
        if !known_hosts.is_empty() {
            self.servers
                .retain(|addr, _| known_hosts.contains(addr) || addr == &description.address);
        }
    }

    fn check_if_has_primary(&mut self) {
        if !self
            .servers
            .values()
            .any(|s| s.server_type == ServerType::RsPrimary)
        {
            self.topology_type = TopologyType::ReplicaSetNoPrimary;
        }
    }

    fn update_logical_session_timeout(&mut self) {
        self.logical_session_timeout_minutes = self
            .servers
            .values()
            .filter(|s| s.server_type.is_data_bearing())
            .map(|s| s.logical_session_timeout_minutes)
            .fold(Some(i64::MAX), |acc, v| match (acc, v) {
                (Some(a), Some(b)) => Some(a.min(b)),
                _ => None,
            });
    }

    /// Applies spec §4.6's server-selection algorithm: filter suitable
    /// servers, narrow to the latency window, pick uniformly at random.
    pub fn select_server(
        &self,
        criteria: &SelectionCriteria,
        local_threshold: Duration,
        heartbeat_freq: Duration,
    ) -> Option<&ServerDescription> {
        if self.topology_type == TopologyType::Unknown {
            return None;
        }
        if self.topology_type == TopologyType::Single {
            return self.servers.values().next();
        }

        let mut suitable = self.suitable_servers(criteria, heartbeat_freq);
        if !criteria.is_read_pref_primary() {
            self.retain_within_latency_window(&mut suitable, local_threshold);
        }
        suitable.into_iter().choose(&mut rand::rng())
    }

    fn suitable_servers(&self, criteria: &SelectionCriteria, heartbeat_freq: Duration) -> Vec<&ServerDescription> {
        match criteria {
            SelectionCriteria::Predicate(pred) => self
                .servers
                .values()
                .filter(|s| pred(&ServerInfo { description: s }))
                .collect(),
            SelectionCriteria::ReadPreference(read_pref) => match self.topology_type {
                TopologyType::Unknown => Vec::new(),
                TopologyType::Single => self.servers.values().collect(),
                TopologyType::Sharded => self
                    .servers
                    .values()
                    .filter(|s| s.server_type == ServerType::Mongos)
                    .collect(),
                TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                    self.suitable_replica_set_servers(read_pref, heartbeat_freq)
                }
            },
        }
    }

    fn suitable_replica_set_servers(&self, read_pref: &ReadPreference, heartbeat_freq: Duration) -> Vec<&ServerDescription> {
        let candidates: Vec<&ServerDescription> = match read_pref {
            ReadPreference::Primary => self
                .servers
                .values()
                .filter(|s| s.server_type == ServerType::RsPrimary)
                .collect(),
            ReadPreference::PrimaryPreferred { .. } => {
                let primary: Vec<_> = self
                    .servers
                    .values()
                    .filter(|s| s.server_type == ServerType::RsPrimary)
                    .collect();
                if !primary.is_empty() {
                    primary
                } else {
                    self.secondaries()
                }
            }
            ReadPreference::Secondary { .. } => self.secondaries(),
            ReadPreference::SecondaryPreferred { .. } => {
                let secondaries = self.secondaries();
                if !secondaries.is_empty() {
                    secondaries
                } else {
                    self.servers
                        .values()
                        .filter(|s| s.server_type == ServerType::RsPrimary)
                        .collect()
                }
            }
            ReadPreference::Nearest { .. } => self
                .servers
                .values()
                .filter(|s| matches!(s.server_type, ServerType::RsPrimary | ServerType::RsSecondary))
                .collect(),
        };

        let max_staleness = read_pref.max_staleness();
        let candidates = self.apply_max_staleness(candidates, max_staleness, heartbeat_freq);

        match read_pref.tag_sets() {
            Some(tag_sets) if !tag_sets.is_empty() => candidates
                .into_iter()
                .filter(|s| tag_sets.iter().any(|wanted| tag_set_matches(wanted, &s.tags)))
                .collect(),
            _ => candidates,
        }
    }

    fn secondaries(&self) -> Vec<&ServerDescription> {
        self.servers
            .values()
            .filter(|s| s.server_type == ServerType::RsSecondary)
            .collect()
    }

    /// Excludes servers staler than `maxStalenessSeconds`, per spec §4.6:
    /// with a primary, `(S.lastUpdateTime − S.lastWriteDate) −
    /// (P.lastUpdateTime − P.lastWriteDate) + heartbeatFrequencyMs`;
    /// without one, `SMax.lastWriteDate − S.lastWriteDate +
    /// heartbeatFrequencyMs`, where `SMax` is the freshest secondary.
    fn apply_max_staleness<'a>(
        &'a self,
        candidates: Vec<&'a ServerDescription>,
        max_staleness: Option<Duration>,
        heartbeat_freq: Duration,
    ) -> Vec<&'a ServerDescription> {
        let Some(max_staleness) = max_staleness else {
            return candidates;
        };
        let heartbeat_freq_ms = heartbeat_freq.as_millis() as i64;

        let primary = self.servers.values().find(|s| s.server_type == ServerType::RsPrimary);

        match primary {
            Some(primary) => {
                let Some(primary_write_date) = primary.last_write_date else {
                    return candidates;
                };
                let primary_lag_ms = millis_between(primary.last_update_time, primary_write_date);

                candidates
                    .into_iter()
                    .filter(|s| match s.last_write_date {
                        Some(write_date) => {
                            let secondary_lag_ms = millis_between(s.last_update_time, write_date);
                            let staleness_ms = secondary_lag_ms - primary_lag_ms + heartbeat_freq_ms;
                            staleness_ms <= max_staleness.as_millis() as i64
                        }
                        None => false,
                    })
                    .collect()
            }
            None => {
                let Some(freshest_write_date) = candidates.iter().filter_map(|s| s.last_write_date).max() else {
                    return candidates;
                };

                candidates
                    .into_iter()
                    .filter(|s| match s.last_write_date {
                        Some(write_date) => {
                            let staleness_ms = millis_between(freshest_write_date, write_date) + heartbeat_freq_ms;
                            staleness_ms <= max_staleness.as_millis() as i64
                        }
                        None => false,
                    })
                    .collect()
            }
        }
    }

    fn retain_within_latency_window(&self, suitable: &mut Vec<&ServerDescription>, local_threshold: Duration) {
        let Some(shortest) = suitable.iter().filter_map(|s| s.round_trip_time).min() else {
            return;
        };
        let ceiling = shortest + local_threshold;
        suitable.retain(|s| s.round_trip_time.is_some_and(|rtt| rtt <= ceiling));
    }
}

/// The live, shared authority over one client's topology view: serializes
/// mutation, and lets callers await selection until a matching server
/// appears or `server_selection_timeout` elapses (spec §4.6, §4.9).
pub struct Topology {
    description: RwLock<TopologyDescription>,
    changed: Notify,
    options: Arc<ClientOptions>,
}

impl Topology {
    pub fn new(options: Arc<ClientOptions>) -> Self {
        Self {
            description: RwLock::new(TopologyDescription::new(&options)),
            changed: Notify::new(),
            options,
        }
    }

    pub async fn description(&self) -> TopologyDescription {
        self.description.read().await.clone()
    }

    pub async fn on_server_description(&self, description: ServerDescription) {
        let mut guard = self.description.write().await;
        guard.update(description);
        drop(guard);
        self.changed.notify_waiters();
    }

    /// Blocks until a server matching `criteria` is available or
    /// `server_selection_timeout` elapses (spec §4.9).
    pub async fn select_server(&self, criteria: &SelectionCriteria) -> Result<ServerAddress> {
        let deadline = Instant::now() + self.options.server_selection_timeout;
        loop {
            {
                let guard = self.description.read().await;
                if let Some(error) = guard
                    .servers
                    .values()
                    .find_map(|s| s.error.as_ref())
                    .filter(|_| guard.topology_type == TopologyType::Unknown)
                {
                    return Err(error.clone());
                }
                if let Some(server) =
                    guard.select_server(criteria, self.options.local_threshold, self.options.heartbeat_freq)
                {
                    return Ok(server.address.clone());
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ErrorKind::ServerSelection {
                    message: format!(
                        "no server matching {criteria:?} found after {:?}",
                        self.options.server_selection_timeout
                    ),
                }
                .into());
            }

            let _ = tokio::time::timeout(remaining, self.changed.notified()).await;
        }
    }
}

/// Minimum interval between `hello` polls, even if `heartbeat_freq` is
/// configured lower (spec §4.7's `minHeartbeatFrequencyMS`).
const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// Servers reporting at least this wire version support the awaitable-hello
/// exhaust protocol and are upgraded from polling to streaming (spec §4.4
/// "Upgrade", §4.5).
const STREAMING_MIN_WIRE_VERSION: i32 = 9;

/// Notified of a server address newly named in a `hello` reply's `hosts`
/// (e.g. a primary's membership list) so the caller can start monitoring it
/// (spec §4.5's topology-driven server set). A plain callback rather than a
/// direct `Dispatcher` reference keeps this module from depending on the
/// dispatch layer above it.
pub type DiscoverFn = Arc<dyn Fn(ServerAddress) + Send + Sync>;

/// Polls (or streams from) one server's `hello` and feeds results back into
/// a `Topology` (spec §4.7).
pub struct Monitor {
    address: ServerAddress,
    options: Arc<ClientOptions>,
    topology: Arc<Topology>,
    pool: Arc<Pool>,
    on_discover: DiscoverFn,
}

impl Monitor {
    pub fn new(
        address: ServerAddress,
        options: Arc<ClientOptions>,
        topology: Arc<Topology>,
        pool: Arc<Pool>,
        on_discover: DiscoverFn,
    ) -> Self {
        Self {
            address,
            options,
            topology,
            pool,
            on_discover,
        }
    }

    /// Runs until the caller's task is dropped; callers spawn this as a
    /// long-lived background task per server. Polls with a discrete `hello`
    /// per `heartbeat_freq` until a reply reports `maxWireVersion >= 9`, then
    /// switches to a streaming companion connection that blocks in
    /// `maxAwaitTimeMS`-sized increments instead (spec §4.4, §4.5).
    pub async fn run(&self) {
        let mut previous_rtt = None;
        let mut backoff = MIN_HEARTBEAT_FREQUENCY;
        let mut streaming: Option<Connection> = None;

        loop {
            if let Some(conn) = streaming.as_mut() {
                match self.stream_once(conn, previous_rtt).await {
                    Ok(description) => {
                        previous_rtt = description.round_trip_time;
                        backoff = MIN_HEARTBEAT_FREQUENCY;
                        let hosts = description.hosts.clone();
                        let downgrade = description.max_wire_version < STREAMING_MIN_WIRE_VERSION;
                        self.topology.on_server_description(description).await;
                        self.announce_new_hosts(hosts);
                        if downgrade {
                            streaming = None;
                        }
                        continue;
                    }
                    Err(e) => {
                        streaming = None;
                        self.handle_check_failure(e, &mut previous_rtt, &mut backoff).await;
                        continue;
                    }
                }
            }

            match self.check_once(previous_rtt).await {
                Ok(description) => {
                    previous_rtt = description.round_trip_time;
                    backoff = MIN_HEARTBEAT_FREQUENCY;
                    let hosts = description.hosts.clone();
                    let upgrade = description.max_wire_version >= STREAMING_MIN_WIRE_VERSION;
                    self.topology.on_server_description(description).await;
                    self.announce_new_hosts(hosts);
                    if upgrade {
                        streaming = self.open_streaming_connection().await.ok();
                    }
                }
                Err(e) => {
                    self.handle_check_failure(e, &mut previous_rtt, &mut backoff).await;
                    continue;
                }
            }

            if streaming.is_none() {
                tokio::time::sleep(self.options.heartbeat_freq.max(MIN_HEARTBEAT_FREQUENCY)).await;
            }
        }
    }

    async fn handle_check_failure(&self, e: Error, previous_rtt: &mut Option<Duration>, backoff: &mut Duration) {
        self.pool.clear().await;
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!(host = %self.address, error = %e, "server heartbeat failed");
        self.topology
            .on_server_description(ServerDescription::errored(self.address.clone(), e))
            .await;
        *previous_rtt = None;
        tokio::time::sleep(*backoff).await;
        *backoff = jittered_backoff(*backoff);
    }

    fn announce_new_hosts(&self, hosts: HashSet<ServerAddress>) {
        for host in hosts {
            if host != self.address {
                (self.on_discover)(host);
            }
        }
    }

    async fn check_once(&self, previous_rtt: Option<Duration>) -> Result<ServerDescription> {
        let mut conn = Connection::connect_monitoring(self.address.clone(), &self.options).await?;
        let start = Instant::now();
        let reply = conn.send_command("admin", doc! { "hello": 1 }).await?;
        let rtt = start.elapsed();
        Ok(ServerDescription::from_hello(
            self.address.clone(),
            &reply,
            rtt,
            previous_rtt,
        ))
    }

    /// Opens the dedicated connection a streaming monitor holds for the
    /// lifetime of the upgrade, and sends the first awaitable `hello` that
    /// starts the exhaust stream (spec §4.5).
    async fn open_streaming_connection(&self) -> Result<Connection> {
        let mut conn = Connection::connect_monitoring(self.address.clone(), &self.options).await?;
        let heartbeat_ms = self.options.heartbeat_freq.max(MIN_HEARTBEAT_FREQUENCY).as_millis() as i64;
        conn.send_exhaust_hello(doc! { "hello": 1, "maxAwaitTimeMS": heartbeat_ms })
            .await?;
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!(host = %self.address, "upgraded to streaming monitor");
        Ok(conn)
    }

    /// Reads the next pushed reply on the streaming connection. The RTT
    /// carried by a pushed reply isn't re-measured per spec §4.4 (the
    /// `maxAwaitTimeMS` wait dwarfs the network hop); the last sampled value
    /// is kept instead.
    async fn stream_once(&self, conn: &mut Connection, previous_rtt: Option<Duration>) -> Result<ServerDescription> {
        let reply = conn.receive_exhaust_message().await?;
        Ok(ServerDescription::from_hello(
            self.address.clone(),
            &reply,
            previous_rtt.unwrap_or_default(),
            previous_rtt,
        ))
    }
}

/// Doubles `current` up to a 1s ceiling and jitters by up to ±50ms, per
/// DESIGN.md's resolution of spec §9's open backoff question.
fn jittered_backoff(current: Duration) -> Duration {
    use rand::Rng;
    let doubled = (current * 2).min(Duration::from_secs(1));
    let jitter_ms = rand::rng().random_range(-50i64..=50);
    let millis = (doubled.as_millis() as i64 + jitter_ms).max(MIN_HEARTBEAT_FREQUENCY.as_millis() as i64);
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    #[test]
    fn ewma_first_sample_is_taken_as_is() {
        let rtt = ewma(Duration::from_millis(50), None);
        assert_eq!(rtt, Duration::from_millis(50));
    }

    #[test]
    fn ewma_applies_0_2_weight() {
        let rtt = ewma(Duration::from_millis(100), Some(Duration::from_millis(0)));
        assert_eq!(rtt, Duration::from_millis(20));
    }

    #[test]
    fn unknown_topology_becomes_sharded_on_mongos() {
        let mut topo = TopologyDescription {
            topology_type: TopologyType::Unknown,
            set_name: None,
            servers: [(addr("a:27017"), ServerDescription::unknown(addr("a:27017")))]
                .into_iter()
                .collect(),
            logical_session_timeout_minutes: None,
            max_election_id: None,
            max_set_version: None,
        };

        let mut desc = ServerDescription::unknown(addr("a:27017"));
        desc.server_type = ServerType::Mongos;
        topo.update(desc);

        assert_eq!(topo.topology_type, TopologyType::Sharded);
    }

    #[test]
    fn stale_primary_is_rejected_by_election_id() {
        let a = addr("a:27017");
        let b = addr("b:27017");
        let mut topo = TopologyDescription {
            topology_type: TopologyType::ReplicaSetWithPrimary,
            set_name: Some("rs0".to_string()),
            servers: [
                (a.clone(), {
                    let mut d = ServerDescription::unknown(a.clone());
                    d.server_type = ServerType::RsPrimary;
                    d.set_version = Some(2);
                    d.election_id = Some(bson::oid::ObjectId::from_bytes([2; 12]));
                    d
                }),
                (b.clone(), ServerDescription::unknown(b.clone())),
            ]
            .into_iter()
            .collect(),
            logical_session_timeout_minutes: None,
            max_election_id: Some(bson::oid::ObjectId::from_bytes([2; 12])),
            max_set_version: Some(2),
        };

        let mut stale = ServerDescription::unknown(b.clone());
        stale.server_type = ServerType::RsPrimary;
        stale.set_version = Some(1);
        stale.election_id = Some(bson::oid::ObjectId::from_bytes([1; 12]));
        topo.update(stale);

        assert_eq!(topo.servers.get(&a).unwrap().server_type, ServerType::RsPrimary);
        assert_eq!(topo.servers.get(&b).unwrap().server_type, ServerType::Unknown);
    }

    #[test]
    fn latency_window_excludes_servers_outside_threshold() {
        let a = addr("a:27017");
        let b = addr("b:27017");
        let mut da = ServerDescription::unknown(a.clone());
        da.server_type = ServerType::RsSecondary;
        da.round_trip_time = Some(Duration::from_millis(5));
        let mut db = ServerDescription::unknown(b.clone());
        db.server_type = ServerType::RsSecondary;
        db.round_trip_time = Some(Duration::from_millis(50));

        let topo = TopologyDescription {
            topology_type: TopologyType::ReplicaSetNoPrimary,
            set_name: Some("rs0".to_string()),
            servers: [(a.clone(), da), (b.clone(), db)].into_iter().collect(),
            logical_session_timeout_minutes: None,
            max_election_id: None,
            max_set_version: None,
        };

        let mut suitable: Vec<&ServerDescription> = topo.servers.values().collect();
        topo.retain_within_latency_window(&mut suitable, Duration::from_millis(15));
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].address, a);
    }

    #[test]
    fn backoff_doubles_and_caps_at_one_second() {
        let b1 = jittered_backoff(Duration::from_millis(500));
        assert!(b1.as_millis() >= 900 && b1.as_millis() <= 1050);
        let b2 = jittered_backoff(Duration::from_secs(2));
        assert!(b2.as_millis() <= 1050);
    }
}
