//! `ClientOptions`, `ServerAddress`, `Credential`, and the `mongodb[+srv]://`
//! connection-string grammar from spec §6.
//!
//! Grounded on the teacher's `client/options/mod.rs` (`ServerAddress`,
//! `ClientOptions` field set and defaults) and `client/options/parse.rs` /
//! `srv.rs` (percent-decoding, `+srv` SRV/TXT resolution).

use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use percent_encoding::percent_decode_str;
use typed_builder::TypedBuilder;

use crate::{
    concern::{ReadConcern, WriteConcern},
    error::{Error, ErrorKind, Result},
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

const DEFAULT_PORT: u16 = 27017;

/// The address of a single mongod/mongos process. Spec §3 calls this
/// "host:port or UDS path"; UDS paths are represented as `Tcp` with `port:
/// None` and a host containing a `/` the same way the teacher's driver
/// special-cases them at the socket layer only, not in this type.
#[derive(Clone, Debug, Eq, serde::Serialize)]
#[non_exhaustive]
pub enum ServerAddress {
    Tcp { host: String, port: Option<u16> },
}

impl ServerAddress {
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');
        let host = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| {
            ErrorKind::InvalidArgument {
                message: format!("invalid server address: \"{address}\""),
            }
        })?;

        let port = match parts.next() {
            Some(p) => {
                let port: u16 = p.parse().map_err(|_| ErrorKind::InvalidArgument {
                    message: format!("invalid port in address \"{address}\""),
                })?;
                if port == 0 {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!("port must be non-zero in \"{address}\""),
                    }
                    .into());
                }
                if parts.next().is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!("address \"{address}\" has more than one ':'"),
                    }
                    .into());
                }
                Some(port)
            }
            None => None,
        };

        Ok(ServerAddress::Tcp {
            host: host.to_lowercase(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        let Self::Tcp { host, .. } = self;
        host
    }

    pub fn port(&self) -> u16 {
        let Self::Tcp { port, .. } = self;
        port.unwrap_or(DEFAULT_PORT)
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host() == other.host() && self.port() == other.port()
    }
}

impl std::hash::Hash for ServerAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host().hash(state);
        self.port().hash(state);
    }
}

impl FromStr for ServerAddress {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host(), self.port())
    }
}

/// A credential pair. `Debug` deliberately never prints `password` — spec §6
/// requires that "logs never leak" the decoded password, which in a Rust
/// core means no code path formats the raw value, not a literal encryption
/// layer around an in-process `String`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub username: Option<String>,
    pub password: Option<String>,
    pub source: Option<String>,
    pub mechanism: Option<AuthMechanism>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("source", &self.source)
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

/// SASL mechanism selection. The core only negotiates which mechanism to
/// hand a connection to; the mechanism's wire protocol is an external
/// collaborator (spec §1, §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMechanism {
    ScramSha1,
    ScramSha256,
    MongoDbX509,
    MongoDbCr,
}

impl FromStr for AuthMechanism {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SCRAM-SHA-1" => Ok(Self::ScramSha1),
            "SCRAM-SHA-256" => Ok(Self::ScramSha256),
            "MONGODB-X509" => Ok(Self::MongoDbX509),
            "MONGODB-CR" => Ok(Self::MongoDbCr),
            other => Err(ErrorKind::InvalidArgument {
                message: format!("unsupported authMechanism: {other}"),
            }
            .into()),
        }
    }
}

/// TLS configuration. `rustls-tls` is the only backend this core carries
/// (see DESIGN.md for why `openssl-tls` was dropped).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsOptions {
    pub allow_invalid_certificates: Option<bool>,
    pub ca_file_path: Option<String>,
    pub cert_key_file_path: Option<String>,
}

/// Write-concern-driven retry policy decision, recorded explicitly per
/// spec §9's third open question ("spec requires that explicitly").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryWritesPolicy {
    /// `retryWrites=true` and the write concern is acknowledged.
    Enabled,
    /// `retryWrites=true` but the write concern is unacknowledged: retries
    /// are disabled, explicitly, rather than silently as in the source.
    DisabledUnacknowledged,
    Disabled,
}

/// Options governing how a `Client`/`Topology` is configured. Field set and
/// defaults mirror spec §6's connection-string option table.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ClientOptions {
    #[builder(default = vec![ServerAddress::Tcp { host: "localhost".into(), port: Some(DEFAULT_PORT) }])]
    pub hosts: Vec<ServerAddress>,

    #[builder(default)]
    pub app_name: Option<String>,

    #[builder(default)]
    pub repl_set_name: Option<String>,

    #[builder(default)]
    pub direct_connection: Option<bool>,

    #[builder(default)]
    pub tls: Option<TlsOptions>,

    #[builder(default = Duration::from_secs(10))]
    pub connect_timeout: Duration,

    #[builder(default)]
    pub socket_timeout: Option<Duration>,

    #[builder(default = 100)]
    pub max_pool_size: u32,

    #[builder(default = 0)]
    pub min_pool_size: u32,

    #[builder(default)]
    pub max_idle_time: Option<Duration>,

    #[builder(default = WriteConcern::default())]
    pub write_concern: WriteConcern,

    #[builder(default)]
    pub read_concern: Option<ReadConcern>,

    #[builder(default = SelectionCriteria::ReadPreference(ReadPreference::Primary))]
    pub selection_criteria: SelectionCriteria,

    #[builder(default)]
    pub max_staleness: Option<Duration>,

    #[builder(default)]
    pub credential: Option<Credential>,

    #[builder(default = Duration::from_millis(10_000))]
    pub heartbeat_freq: Duration,

    #[builder(default = true)]
    pub retry_writes: bool,

    #[builder(default = true)]
    pub retry_reads: bool,

    #[builder(default)]
    pub compressors: Vec<Compressor>,

    #[builder(default = Duration::from_secs(60))]
    pub server_selection_timeout: Duration,

    #[builder(default = Duration::from_millis(15))]
    pub local_threshold: Duration,
}

impl ClientOptions {
    /// spec §9, open question 3: resolve the effective retry-writes policy
    /// for this client's default write concern.
    pub fn retry_writes_policy(&self) -> RetryWritesPolicy {
        if !self.retry_writes {
            return RetryWritesPolicy::Disabled;
        }
        if self.write_concern.is_acknowledged() {
            RetryWritesPolicy::Enabled
        } else {
            RetryWritesPolicy::DisabledUnacknowledged
        }
    }
}

/// The negotiable wire-compression algorithms (spec §4.1: `{zlib, zstd}`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compressor {
    Zstd,
    Zlib { level: Option<i32> },
}

impl Compressor {
    pub fn name(&self) -> &'static str {
        match self {
            Compressor::Zstd => "zstd",
            Compressor::Zlib { .. } => "zlib",
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            Compressor::Zlib { .. } => 2,
            Compressor::Zstd => 3,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "zlib" => Some(Compressor::Zlib { level: None }),
            "zstd" => Some(Compressor::Zstd),
            _ => None,
        }
    }
}

/// Parses a `mongodb://` or `mongodb+srv://` connection string into
/// `ClientOptions`, per spec §6's grammar and option table. `+srv` expansion
/// (behind `dns-resolver`) is performed by the caller via
/// [`resolve_srv`](crate::srv::resolve_srv) since it requires network I/O;
/// this function handles everything that's pure string parsing.
pub fn parse_connection_string(uri: &str) -> Result<ClientOptions> {
    let (srv, rest) = if let Some(rest) = uri.strip_prefix("mongodb+srv://") {
        (true, rest)
    } else if let Some(rest) = uri.strip_prefix("mongodb://") {
        (false, rest)
    } else {
        return Err(ErrorKind::InvalidArgument {
            message: "connection string must start with mongodb:// or mongodb+srv://".into(),
        }
        .into());
    };

    let (auth_and_hosts, path_and_query) = match rest.find(['/', '?']) {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };

    let (userinfo, hosts_part) = match auth_and_hosts.rsplit_once('@') {
        Some((u, h)) => (Some(u), h),
        None => (None, auth_and_hosts),
    };

    let credential = userinfo
        .map(|u| -> Result<Credential> {
            let (user, pass) = match u.split_once(':') {
                Some((u, p)) => (decode(u)?, Some(decode(p)?)),
                None => (decode(u)?, None),
            };
            Ok(Credential {
                username: Some(user),
                password: pass,
                source: None,
                mechanism: None,
            })
        })
        .transpose()?;

    if hosts_part.is_empty() {
        return Err(ErrorKind::InvalidArgument {
            message: "connection string has no host list".into(),
        }
        .into());
    }

    let hosts: Vec<ServerAddress> = hosts_part
        .split(',')
        .map(ServerAddress::parse)
        .collect::<Result<_>>()?;

    if srv && hosts.len() != 1 {
        return Err(ErrorKind::InvalidArgument {
            message: "mongodb+srv:// requires exactly one host".into(),
        }
        .into());
    }

    let (db_part, query_part) = match path_and_query.strip_prefix('/') {
        Some(rest) => match rest.split_once('?') {
            Some((db, q)) => (Some(db), Some(q)),
            None => (Some(rest).filter(|s| !s.is_empty()), None),
        },
        None => (None, path_and_query.strip_prefix('?')),
    };
    let _default_db = db_part;

    let mut options = ClientOptions::builder().hosts(hosts).build();
    if let Some(mut cred) = credential {
        if let Some(query) = query_part {
            for (k, v) in parse_query(query) {
                if k.eq_ignore_ascii_case("authSource") {
                    cred.source = Some(v);
                } else if k.eq_ignore_ascii_case("authMechanism") {
                    cred.mechanism = Some(v.parse()?);
                }
            }
        }
        options.credential = Some(cred);
    }

    if let Some(query) = query_part {
        apply_query_options(&mut options, query)?;
    }

    if srv {
        options.tls.get_or_insert_with(TlsOptions::default);
    }

    Ok(options)
}

fn decode(s: &str) -> Result<String> {
    percent_decode_str(s)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| {
            ErrorKind::InvalidArgument {
                message: format!("invalid percent-encoding: {e}"),
            }
            .into()
        })
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((k.to_string(), decode(v).unwrap_or_else(|_| v.to_string())))
        })
        .collect()
}

fn apply_query_options(options: &mut ClientOptions, query: &str) -> Result<()> {
    let pairs = parse_query(query);
    let mut tag_sets: Vec<TagSet> = Vec::new();
    let mut read_pref_mode: Option<String> = None;
    let mut max_staleness_secs: Option<u64> = None;

    for (key, value) in &pairs {
        let key = key.as_str();
        if key.eq_ignore_ascii_case("replicaSet") {
            options.repl_set_name = Some(value.clone());
        } else if key.eq_ignore_ascii_case("ssl") || key.eq_ignore_ascii_case("tls") {
            if value == "true" {
                options.tls.get_or_insert_with(TlsOptions::default);
            }
        } else if key.eq_ignore_ascii_case("connectTimeoutMS") {
            options.connect_timeout = parse_millis(value)?;
        } else if key.eq_ignore_ascii_case("socketTimeoutMS") {
            options.socket_timeout = Some(parse_millis(value)?);
        } else if key.eq_ignore_ascii_case("maxPoolSize") {
            options.max_pool_size = parse_u32(value)?;
        } else if key.eq_ignore_ascii_case("minPoolSize") {
            options.min_pool_size = parse_u32(value)?;
        } else if key.eq_ignore_ascii_case("maxIdleTimeMS") {
            options.max_idle_time = Some(parse_millis(value)?);
        } else if key.eq_ignore_ascii_case("w") {
            options.write_concern.w = Some(value.parse()?);
        } else if key.eq_ignore_ascii_case("wtimeoutMS") {
            options.write_concern.w_timeout = Some(parse_millis(value)?);
        } else if key.eq_ignore_ascii_case("journal") {
            options.write_concern.journal = Some(value == "true");
        } else if key.eq_ignore_ascii_case("readConcernLevel") {
            options.read_concern = Some(ReadConcern::custom(value.clone()));
        } else if key.eq_ignore_ascii_case("readPreference") {
            read_pref_mode = Some(value.clone());
        } else if key.eq_ignore_ascii_case("readPreferenceTags") {
            tag_sets.push(
                value
                    .split(',')
                    .filter_map(|kv| kv.split_once(':'))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            );
        } else if key.eq_ignore_ascii_case("maxStalenessSeconds") {
            max_staleness_secs = Some(value.parse().map_err(|_| ErrorKind::InvalidArgument {
                message: format!("invalid maxStalenessSeconds: {value}"),
            })?);
        } else if key.eq_ignore_ascii_case("heartbeatFrequencyMS") {
            options.heartbeat_freq = parse_millis(value)?;
        } else if key.eq_ignore_ascii_case("retryWrites") {
            options.retry_writes = value == "true";
        } else if key.eq_ignore_ascii_case("retryReads") {
            options.retry_reads = value == "true";
        } else if key.eq_ignore_ascii_case("compressors") {
            options.compressors = value
                .split(',')
                .filter_map(Compressor::from_name)
                .collect();
        } else if key.eq_ignore_ascii_case("directConnection") {
            options.direct_connection = Some(value == "true");
        } else if key.eq_ignore_ascii_case("serverSelectionTimeoutMS") {
            options.server_selection_timeout = parse_millis(value)?;
        } else if key.eq_ignore_ascii_case("localThresholdMS") {
            options.local_threshold = parse_millis(value)?;
        } else if key.eq_ignore_ascii_case("appName") {
            options.app_name = Some(value.clone());
        }
        // authSource/authMechanism handled by the credential branch above;
        // unrecognized options are ignored, matching the teacher's lenient parser.
    }

    if let Some(mode) = read_pref_mode {
        let tags = (!tag_sets.is_empty()).then_some(tag_sets);
        let max_staleness = max_staleness_secs.map(Duration::from_secs);
        let pref = match mode.as_str() {
            "primary" => ReadPreference::Primary,
            "primaryPreferred" => ReadPreference::PrimaryPreferred { tag_sets: tags, max_staleness },
            "secondary" => ReadPreference::Secondary { tag_sets: tags, max_staleness },
            "secondaryPreferred" => {
                ReadPreference::SecondaryPreferred { tag_sets: tags, max_staleness }
            }
            "nearest" => ReadPreference::Nearest { tag_sets: tags, max_staleness },
            other => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("invalid readPreference: {other}"),
                }
                .into())
            }
        };
        options.selection_criteria = SelectionCriteria::ReadPreference(pref);
    }

    Ok(())
}

fn parse_millis(s: &str) -> Result<Duration> {
    s.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ErrorKind::InvalidArgument {
            message: format!("invalid millisecond duration: {s}"),
        }
        .into())
}

fn parse_u32(s: &str) -> Result<u32> {
    s.parse().map_err(|_| {
        ErrorKind::InvalidArgument {
            message: format!("invalid integer: {s}"),
        }
        .into()
    })
}

pub type Tags = HashMap<String, String>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_basic_uri() {
        let opts = parse_connection_string("mongodb://localhost:27018/mydb").unwrap();
        assert_eq!(
            opts.hosts,
            vec![ServerAddress::Tcp {
                host: "localhost".into(),
                port: Some(27018)
            }]
        );
    }

    #[test]
    fn parses_credentials_and_options() {
        let opts = parse_connection_string(
            "mongodb://alice:s%40cret@a:27017,b:27018/?replicaSet=rs0&retryWrites=false",
        )
        .unwrap();
        assert_eq!(opts.hosts.len(), 2);
        let cred = opts.credential.unwrap();
        assert_eq!(cred.username.as_deref(), Some("alice"));
        assert_eq!(cred.password.as_deref(), Some("s@cret"));
        assert_eq!(opts.repl_set_name.as_deref(), Some("rs0"));
        assert!(!opts.retry_writes);
    }

    #[test]
    fn debug_never_prints_password() {
        let cred = Credential {
            username: Some("alice".into()),
            password: Some("hunter2".into()),
            source: None,
            mechanism: None,
        };
        assert!(!format!("{cred:?}").contains("hunter2"));
    }

    #[test]
    fn srv_requires_single_host() {
        let err = parse_connection_string("mongodb+srv://a,b/").unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::InvalidArgument { .. }));
    }

    #[test]
    fn read_preference_tags_and_staleness_parse() {
        let opts = parse_connection_string(
            "mongodb://a/?readPreference=secondary&readPreferenceTags=dc:east,use:reporting&maxStalenessSeconds=90",
        )
        .unwrap();
        match opts.selection_criteria {
            SelectionCriteria::ReadPreference(ReadPreference::Secondary {
                tag_sets: Some(tags),
                max_staleness: Some(d),
            }) => {
                assert_eq!(tags[0].get("dc").map(String::as_str), Some("east"));
                assert_eq!(d, Duration::from_secs(90));
            }
            other => panic!("unexpected selection criteria: {other:?}"),
        }
    }

    #[test]
    fn unacknowledged_write_concern_disables_retry_explicitly() {
        use crate::concern::Acknowledgment;
        let mut opts = ClientOptions::builder().build();
        opts.write_concern.w = Some(Acknowledgment::Nodes(0));
        assert_eq!(
            opts.retry_writes_policy(),
            RetryWritesPolicy::DisabledUnacknowledged
        );
    }
}
