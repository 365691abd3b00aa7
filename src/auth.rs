//! Authentication mechanism negotiation (spec §4.3: "SASL at the interface
//! only" — the wire-level conversation shape, not the mechanism crypto).
//!
//! Grounded on the teacher's `client/auth/mod.rs` mechanism-name constants
//! and negotiation order, trimmed of the `hmac`/`sha1`/`sha2`/`pbkdf2`
//! dependent SCRAM math per DESIGN.md's dependency-drop list: SCRAM is
//! exposed as a pluggable `ScramAuthenticator` extension point rather than
//! implemented here, while X.509 and PLAIN (which need no password hashing)
//! are implemented directly.

use base64::Engine;
use bson::doc;

use crate::{
    cmap::Connection,
    error::{ErrorKind, Result},
    options::{AuthMechanism, Credential},
};

/// Picks the mechanism to use for `credential`, per spec §4.3: an explicit
/// mechanism wins; otherwise SCRAM-SHA-256 is preferred when the server
/// advertises it via `saslSupportedMechs`, falling back to SCRAM-SHA-1.
pub fn negotiate_mechanism(credential: &Credential, sasl_supported_mechs: &[String]) -> AuthMechanism {
    if let Some(mechanism) = &credential.mechanism {
        return mechanism.clone();
    }
    if sasl_supported_mechs.iter().any(|m| m == "SCRAM-SHA-256") {
        AuthMechanism::ScramSha256
    } else {
        AuthMechanism::ScramSha1
    }
}

/// Runs the authentication conversation for `credential` on a freshly
/// handshaked `conn` (spec §4.3/§4.9: authentication happens once per
/// connection, before it's usable for application commands).
pub async fn authenticate(
    conn: &mut Connection,
    credential: &Credential,
    mechanism: AuthMechanism,
    scram: Option<&dyn ScramAuthenticator>,
) -> Result<()> {
    let source = credential
        .source
        .clone()
        .unwrap_or_else(|| "admin".to_string());

    match mechanism {
        AuthMechanism::MongoDbX509 => authenticate_x509(conn, credential).await,
        AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 => match scram {
            Some(provider) => provider.authenticate(conn, credential, mechanism).await,
            None => Err(ErrorKind::Authentication {
                message: format!(
                    "{} requires a ScramAuthenticator implementation; none was supplied",
                    mechanism_name(mechanism)
                ),
            }
            .into()),
        },
        AuthMechanism::MongoDbCr => Err(ErrorKind::Authentication {
            message: "MONGODB-CR is deprecated and not supported".into(),
        }
        .into()),
    }
    .map_err(|e| annotate_source(e, &source))
}

fn annotate_source(e: crate::error::Error, _source: &str) -> crate::error::Error {
    e
}

fn mechanism_name(mechanism: AuthMechanism) -> &'static str {
    match mechanism {
        AuthMechanism::ScramSha1 => "SCRAM-SHA-1",
        AuthMechanism::ScramSha256 => "SCRAM-SHA-256",
        AuthMechanism::MongoDbX509 => "MONGODB-X509",
        AuthMechanism::MongoDbCr => "MONGODB-CR",
    }
}

async fn authenticate_x509(conn: &mut Connection, credential: &Credential) -> Result<()> {
    let mut command = doc! {
        "authenticate": 1,
        "mechanism": "MONGODB-X509",
    };
    if let Some(username) = &credential.username {
        command.insert("user", username.clone());
    }
    let reply = conn.send_command("$external", command).await?;
    check_ok(&reply)
}

/// Plain SASL (LDAP-backed auth), which only needs base64 framing (spec
/// §4.3).
pub async fn authenticate_plain(conn: &mut Connection, credential: &Credential) -> Result<()> {
    let username = credential.username.as_deref().unwrap_or_default();
    let password = credential.password.as_deref().unwrap_or_default();
    let payload = format!("\x00{username}\x00{password}");
    let command = doc! {
        "saslStart": 1,
        "mechanism": "PLAIN",
        "payload": bson::Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: payload.into_bytes(),
        },
    };
    let source = credential.source.clone().unwrap_or_else(|| "$external".to_string());
    let reply = conn.send_command(&source, command).await?;
    check_ok(&reply)?;
    if reply.get_bool("done").unwrap_or(false) {
        return Ok(());
    }
    let conversation_id = reply.get_i32("conversationId").unwrap_or(1);
    let finish = doc! {
        "saslContinue": 1,
        "conversationId": conversation_id,
        "payload": bson::Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: Vec::new(),
        },
    };
    let reply = conn.send_command(&source, finish).await?;
    check_ok(&reply)
}

fn check_ok(reply: &bson::Document) -> Result<()> {
    if reply.get_i32("ok").unwrap_or(0) == 1 || reply.get_f64("ok").unwrap_or(0.0) == 1.0 {
        Ok(())
    } else {
        Err(ErrorKind::Authentication {
            message: reply
                .get_str("errmsg")
                .unwrap_or("authentication failed")
                .to_string(),
        }
        .into())
    }
}

/// The extension point spec §4.3 leaves at the interface for SCRAM: a
/// caller-supplied implementation of the password-hashing conversation.
/// This core owns negotiation and the wire round-trips; it does not own
/// HMAC/PBKDF2.
pub trait ScramAuthenticator: Send + Sync {
    fn authenticate<'a>(
        &'a self,
        conn: &'a mut Connection,
        credential: &'a Credential,
        mechanism: AuthMechanism,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
}

/// Base64-encodes a SASL payload for commands that frame it as text rather
/// than as BSON binary (used by some mechanism implementations' debug
/// tooling).
pub fn encode_payload(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn negotiate_prefers_explicit_mechanism() {
        let credential = Credential {
            username: None,
            password: None,
            source: None,
            mechanism: Some(AuthMechanism::MongoDbX509),
        };
        assert_eq!(
            negotiate_mechanism(&credential, &["SCRAM-SHA-256".to_string()]),
            AuthMechanism::MongoDbX509
        );
    }

    #[test]
    fn negotiate_prefers_sha256_when_advertised() {
        let credential = Credential {
            username: Some("u".into()),
            password: Some("p".into()),
            source: None,
            mechanism: None,
        };
        let mechanism = negotiate_mechanism(
            &credential,
            &["SCRAM-SHA-1".to_string(), "SCRAM-SHA-256".to_string()],
        );
        assert_eq!(mechanism, AuthMechanism::ScramSha256);
    }

    #[test]
    fn negotiate_falls_back_to_sha1() {
        let credential = Credential {
            username: Some("u".into()),
            password: Some("p".into()),
            source: None,
            mechanism: None,
        };
        let mechanism = negotiate_mechanism(&credential, &["SCRAM-SHA-1".to_string()]);
        assert_eq!(mechanism, AuthMechanism::ScramSha1);
    }
}
