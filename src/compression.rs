//! Message compression: negotiating a compressor with the server's `hello`
//! reply and wrapping/unwrapping `OP_COMPRESSED` (spec §4.1).
//!
//! Grounded on the teacher's `compression.rs`/`compression/*.rs`, collapsed
//! into one file since this core only negotiates `{zlib, zstd}` (no
//! Snappy — spec.md §4.1 names exactly those two).

use std::io::Write;

#[cfg(feature = "zlib-compression")]
use flate2::{
    write::{ZlibDecoder, ZlibEncoder},
    Compression,
};

use crate::{
    error::{Error, ErrorKind, Result},
    options::Compressor,
};

/// Commands that must never be compressed, per spec §4.1 — compressing the
/// handshake itself, or a SASL/auth step, would prevent the server from ever
/// reading the command that negotiates compression in the first place.
const NEVER_COMPRESS: &[&str] = &[
    "hello",
    "isMaster",
    "ismaster",
    "saslStart",
    "saslContinue",
    "getnonce",
    "authenticate",
    "createUser",
    "updateUser",
    "copydbSaslStart",
    "copydbgetnonce",
    "copydb",
];

/// True if `command_name` is exempt from compression (spec §4.1).
pub fn is_compression_exempt(command_name: &str) -> bool {
    NEVER_COMPRESS
        .iter()
        .any(|exempt| exempt.eq_ignore_ascii_case(command_name))
}

/// Compresses `uncompressed` with the given compressor, returning the bytes
/// that follow an `OP_COMPRESSED` header.
pub fn compress(compressor: &Compressor, uncompressed: &[u8]) -> Result<Vec<u8>> {
    match compressor {
        #[cfg(feature = "zstd-compression")]
        Compressor::Zstd => {
            zstd::encode_all(uncompressed, zstd::DEFAULT_COMPRESSION_LEVEL).map_err(|e| {
                ErrorKind::Internal {
                    message: format!("zstd compression failed: {e}"),
                }
                .into()
            })
        }
        #[cfg(feature = "zlib-compression")]
        Compressor::Zlib { level } => {
            let level = level
                .map(|l| Compression::new(l as u32))
                .unwrap_or_else(Compression::default);
            let mut encoder = ZlibEncoder::new(Vec::new(), level);
            encoder.write_all(uncompressed)?;
            encoder.finish().map_err(Error::from)
        }
        #[allow(unreachable_patterns)]
        _ => Err(ErrorKind::InvalidArgument {
            message: format!(
                "the {} compression feature is not enabled",
                compressor.name()
            ),
        }
        .into()),
    }
}

/// Decompresses the payload of an `OP_COMPRESSED` message given the
/// originating compressor id (spec §4.1: the id is wire-coded into the
/// `OP_COMPRESSED` header, independent of what this side negotiated).
pub fn decompress(compressor_id: u8, compressed: &[u8]) -> Result<Vec<u8>> {
    match compressor_id {
        0 => Ok(compressed.to_vec()),
        #[cfg(feature = "zlib-compression")]
        2 => {
            let mut decoder = ZlibDecoder::new(Vec::new());
            decoder.write_all(compressed)?;
            decoder.finish().map_err(Error::from)
        }
        #[cfg(feature = "zstd-compression")]
        3 => zstd::decode_all(compressed).map_err(|e| {
            ErrorKind::Internal {
                message: format!("zstd decompression failed: {e}"),
            }
            .into()
        }),
        other => Err(ErrorKind::InvalidResponse {
            message: format!("unsupported compressor id {other}"),
        }
        .into()),
    }
}

/// Picks the first of `preferred` that also appears in `server_supported`
/// (spec §4.1: the client's configured order wins ties).
pub fn negotiate<'a>(
    preferred: &'a [Compressor],
    server_supported: &[String],
) -> Option<&'a Compressor> {
    preferred
        .iter()
        .find(|c| server_supported.iter().any(|s| s == c.name()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hello_and_sasl_are_exempt() {
        assert!(is_compression_exempt("hello"));
        assert!(is_compression_exempt("saslStart"));
        assert!(is_compression_exempt("ISMASTER"));
        assert!(!is_compression_exempt("find"));
    }

    #[test]
    fn negotiate_prefers_client_order() {
        let preferred = vec![Compressor::Zstd, Compressor::Zlib { level: None }];
        let supported = vec!["zlib".to_string(), "zstd".to_string()];
        let chosen = negotiate(&preferred, &supported).unwrap();
        assert_eq!(chosen.name(), "zstd");
    }

    #[test]
    fn negotiate_returns_none_when_no_overlap() {
        let preferred = vec![Compressor::Zstd];
        let supported = vec!["zlib".to_string()];
        assert!(negotiate(&preferred, &supported).is_none());
    }

    #[cfg(feature = "zlib-compression")]
    #[test]
    fn zlib_round_trips() {
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(4);
        let compressed = compress(&Compressor::Zlib { level: None }, &payload).unwrap();
        assert!(compressed.len() < payload.len());
        let decompressed = decompress(2, &compressed).unwrap();
        assert_eq!(decompressed, payload);
    }
}
