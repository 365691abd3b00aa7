//! `mongodb+srv://` seed-list resolution via SRV and TXT DNS records
//! (SPEC_FULL.md §10.3/§11 — supplemented from the teacher, which this core
//! otherwise omits since spec.md's connection-string parsing takes a plain
//! host list).
//!
//! Grounded on the teacher's `srv.rs` and `runtime/resolver.rs`.

use std::time::Duration;

use crate::{error::Result, options::ServerAddress};

#[cfg(feature = "dns-resolver")]
use crate::error::ErrorKind;

/// The seed list and options recovered from `_mongodb._tcp.<host>` SRV
/// records and the accompanying TXT record.
#[derive(Debug)]
pub struct ResolvedSeedList {
    pub hosts: Vec<ServerAddress>,
    pub min_ttl: Duration,
    pub auth_source: Option<String>,
    pub repl_set_name: Option<String>,
}

#[cfg(feature = "dns-resolver")]
pub async fn resolve_srv(hostname: &str) -> Result<ResolvedSeedList> {
    let resolver = build_resolver().await?;
    let (hosts, min_ttl) = resolve_hosts(&resolver, hostname).await?;
    let (auth_source, repl_set_name) = resolve_txt_options(&resolver, hostname).await?;
    Ok(ResolvedSeedList {
        hosts,
        min_ttl,
        auth_source,
        repl_set_name,
    })
}

#[cfg(feature = "dns-resolver")]
async fn build_resolver() -> Result<hickory_resolver::TokioResolver> {
    let builder = hickory_resolver::TokioResolver::builder_tokio().map_err(|e| {
        ErrorKind::DnsResolve {
            message: format!("failed to read system DNS configuration: {e}"),
        }
    })?;
    Ok(builder.build())
}

#[cfg(feature = "dns-resolver")]
async fn resolve_hosts(
    resolver: &hickory_resolver::TokioResolver,
    hostname: &str,
) -> Result<(Vec<ServerAddress>, Duration)> {
    use hickory_proto::rr::RData;

    let parts: Vec<_> = hostname.split('.').collect();
    if parts.len() < 3 {
        return Err(ErrorKind::InvalidArgument {
            message: "a mongodb+srv hostname must have at least three '.'-delimited parts".into(),
        }
        .into());
    }
    let domain = parts[1..].join(".");

    let lookup_name = format!("_mongodb._tcp.{hostname}");
    let lookup = resolver.srv_lookup(lookup_name.as_str()).await.map_err(|e| {
        ErrorKind::DnsResolve {
            message: format!("SRV lookup for {hostname} failed: {e}"),
        }
    })?;

    let mut hosts = Vec::new();
    let mut min_ttl = u32::MAX;
    for record in lookup.as_lookup().record_iter() {
        let RData::SRV(srv) = record.data() else {
            continue;
        };
        let mut target = srv.target().to_utf8();
        if target.ends_with('.') {
            target.pop();
        }
        if !target.ends_with(&domain) {
            return Err(ErrorKind::DnsResolve {
                message: format!(
                    "SRV record {target} returned for {hostname} does not share its parent domain {domain}"
                ),
            }
            .into());
        }
        min_ttl = min_ttl.min(record.ttl());
        hosts.push(ServerAddress::Tcp {
            host: target,
            port: Some(srv.port()),
        });
    }

    if hosts.is_empty() {
        return Err(ErrorKind::DnsResolve {
            message: format!("SRV lookup for {hostname} returned no records"),
        }
        .into());
    }

    Ok((hosts, Duration::from_secs(min_ttl as u64)))
}

/// Parses the single permitted TXT record into `authSource`/`replicaSet`
/// (spec: `loadBalanced` is rejected since load-balanced mode is out of
/// scope — see DESIGN.md).
#[cfg(feature = "dns-resolver")]
async fn resolve_txt_options(
    resolver: &hickory_resolver::TokioResolver,
    hostname: &str,
) -> Result<(Option<String>, Option<String>)> {
    let lookup = match resolver.txt_lookup(hostname).await {
        Ok(lookup) => lookup,
        Err(_) => return Ok((None, None)),
    };

    let mut records = lookup.iter();
    let Some(record) = records.next() else {
        return Ok((None, None));
    };
    if records.next().is_some() {
        return Err(ErrorKind::DnsResolve {
            message: format!("TXT lookup for {hostname} returned more than one record"),
        }
        .into());
    }

    let text: String = record
        .txt_data()
        .iter()
        .map(|bytes| String::from_utf8_lossy(bytes))
        .collect();

    let mut auth_source = None;
    let mut repl_set_name = None;
    for pair in text.split('&').filter(|s| !s.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(ErrorKind::DnsResolve {
                message: format!("TXT record option '{pair}' is not a key=value pair"),
            }
            .into());
        };
        match key.to_ascii_lowercase().as_str() {
            "authsource" => auth_source = Some(value.to_string()),
            "replicaset" => repl_set_name = Some(value.to_string()),
            "loadbalanced" => {
                return Err(ErrorKind::DnsResolve {
                    message: "loadBalanced mongodb+srv deployments are not supported".into(),
                }
                .into())
            }
            other => {
                return Err(ErrorKind::DnsResolve {
                    message: format!("unrecognized TXT record option '{other}'"),
                }
                .into())
            }
        }
    }

    Ok((auth_source, repl_set_name))
}

#[cfg(not(feature = "dns-resolver"))]
pub async fn resolve_srv(_hostname: &str) -> Result<ResolvedSeedList> {
    Err(crate::error::ErrorKind::InvalidArgument {
        message: "mongodb+srv connection strings require the 'dns-resolver' feature".into(),
    }
    .into())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn resolve_srv_without_feature_errors_cleanly() {
        #[cfg(not(feature = "dns-resolver"))]
        {
            let result = resolve_srv("example.com").await;
            assert!(result.is_err());
        }
    }
}
