//! The MongoDB wire protocol: the 16-byte message header, `OP_MSG` framing,
//! legacy `OP_QUERY`/`OP_REPLY` framing, and `OP_COMPRESSED` wrapping (spec
//! §4.1, §8).
//!
//! Grounded on the teacher's `cmap/conn/wire/{header,message,reply,util}.rs`,
//! collapsed into one module and ported from the teacher's `futures`-based
//! async IO onto `tokio::io::{AsyncRead, AsyncWrite}` to match this crate's
//! runtime dependency.

use std::sync::atomic::{AtomicI32, Ordering};

use bitflags::bitflags;
use bson::Document;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    compression,
    error::{Error, ErrorKind, Result},
    options::Compressor,
};

/// Returns a fresh, process-unique request id for correlating a request with
/// its reply (spec §4.1/§8: `responseTo` on the reply must equal `requestId`
/// on the request).
pub fn next_request_id() -> i32 {
    static REQUEST_ID: AtomicI32 = AtomicI32::new(0);
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpCode {
    Reply = 1,
    Query = 2004,
    Compressed = 2012,
    Message = 2013,
}

impl OpCode {
    pub fn from_i32(i: i32) -> Result<Self> {
        match i {
            1 => Ok(OpCode::Reply),
            2004 => Ok(OpCode::Query),
            2012 => Ok(OpCode::Compressed),
            2013 => Ok(OpCode::Message),
            other => Err(ErrorKind::Protocol {
                message: format!("invalid wire protocol opcode: {other}"),
            }
            .into()),
        }
    }
}

/// The 16-byte header prefixing every wire protocol message (spec §8).
#[derive(Clone, Debug)]
pub struct Header {
    pub length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl Header {
    pub const LENGTH: usize = 4 * std::mem::size_of::<i32>();

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_i32_le(self.length).await?;
        writer.write_i32_le(self.request_id).await?;
        writer.write_i32_le(self.response_to).await?;
        writer.write_i32_le(self.op_code as i32).await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let length = reader.read_i32_le().await?;
        let request_id = reader.read_i32_le().await?;
        let response_to = reader.read_i32_le().await?;
        let op_code = OpCode::from_i32(reader.read_i32_le().await?)?;
        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }
}

bitflags! {
    /// `OP_MSG` flag bits (spec §4.1/§8).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0x0000_0001;
        const MORE_TO_COME     = 0x0000_0002;
        const EXHAUST_ALLOWED  = 0x0001_0000;
    }
}

/// An `OP_MSG` section (spec §4.1: type 0 is a single document, type 1 is a
/// named document sequence).
#[derive(Clone, Debug)]
pub enum MessageSection {
    Document(Document),
    Sequence {
        identifier: String,
        documents: Vec<Document>,
    },
}

/// A decoded/to-be-encoded `OP_MSG` message.
#[derive(Clone, Debug)]
pub struct Message {
    pub request_id: i32,
    pub response_to: i32,
    pub flags: MessageFlags,
    pub sections: Vec<MessageSection>,
}

impl Message {
    pub fn with_document(document: Document) -> Self {
        Self {
            request_id: next_request_id(),
            response_to: 0,
            flags: MessageFlags::empty(),
            sections: vec![MessageSection::Document(document)],
        }
    }

    /// The first document across all sections, which is where a command
    /// reply body lives (spec §8).
    pub fn single_document_response(self) -> Result<Document> {
        self.sections
            .into_iter()
            .find_map(|section| match section {
                MessageSection::Document(doc) => Some(doc),
                MessageSection::Sequence { documents, .. } => documents.into_iter().next(),
            })
            .ok_or_else(|| {
                ErrorKind::InvalidResponse {
                    message: "no document in OP_MSG reply".into(),
                }
                .into()
            })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut body = Vec::new();
        for section in &self.sections {
            write_section(&mut body, section)?;
        }

        let total_length = Header::LENGTH + std::mem::size_of::<u32>() + body.len();
        let header = Header {
            length: total_length as i32,
            request_id: self.request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        };
        header.write_to(writer).await?;
        writer.write_u32_le(self.flags.bits()).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let header = Header::read_from(reader).await?;
        if header.op_code != OpCode::Message {
            return Err(ErrorKind::Protocol {
                message: format!("expected OP_MSG, got {:?}", header.op_code),
            }
            .into());
        }

        let mut remaining = header.length as usize - Header::LENGTH - std::mem::size_of::<u32>();
        let flags = MessageFlags::from_bits_truncate(reader.read_u32_le().await?);

        let checksum_len = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            std::mem::size_of::<u32>()
        } else {
            0
        };

        let mut sections = Vec::new();
        while remaining > checksum_len {
            let (section, consumed) = read_section(reader).await?;
            sections.push(section);
            remaining -= consumed;
        }

        if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            reader.read_u32_le().await?;
        }

        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            sections,
        })
    }
}

fn write_section(out: &mut Vec<u8>, section: &MessageSection) -> Result<()> {
    match section {
        MessageSection::Document(doc) => {
            out.push(0u8);
            doc.to_writer(out)?;
        }
        MessageSection::Sequence {
            identifier,
            documents,
        } => {
            out.push(1u8);
            let mut payload = Vec::new();
            payload.extend_from_slice(identifier.as_bytes());
            payload.push(0);
            for doc in documents {
                doc.to_writer(&mut payload)?;
            }
            let size = (payload.len() + std::mem::size_of::<i32>()) as i32;
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&payload);
        }
    }
    Ok(())
}

async fn read_section<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(MessageSection, usize)> {
    let payload_type = reader.read_u8().await?;
    if payload_type == 0 {
        let (doc, len) = read_document(reader).await?;
        return Ok((MessageSection::Document(doc), len + 1));
    }

    let size = reader.read_i32_le().await?;
    let mut remaining = size as usize - std::mem::size_of::<i32>();

    let mut identifier = Vec::new();
    loop {
        let byte = reader.read_u8().await?;
        remaining -= 1;
        if byte == 0 {
            break;
        }
        identifier.push(byte);
    }
    let identifier = String::from_utf8(identifier).map_err(|e| ErrorKind::Protocol {
        message: format!("invalid section identifier: {e}"),
    })?;

    let mut documents = Vec::new();
    while remaining > 0 {
        let (doc, len) = read_document(reader).await?;
        documents.push(doc);
        remaining -= len;
    }

    Ok((
        MessageSection::Sequence {
            identifier,
            documents,
        },
        size as usize + 1,
    ))
}

/// Reads one BSON document, returning it along with the number of bytes
/// consumed (needed to track the remaining section length).
async fn read_document<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Document, usize)> {
    let len = reader.read_i32_le().await?;
    if len < 4 {
        return Err(ErrorKind::Protocol {
            message: format!("invalid BSON document length {len}"),
        }
        .into());
    }
    let mut buf = vec![0u8; len as usize];
    buf[0..4].copy_from_slice(&len.to_le_bytes());
    reader.read_exact(&mut buf[4..]).await?;
    let doc = Document::from_reader(buf.as_slice()).map_err(Error::from)?;
    Ok((doc, len as usize))
}

bitflags! {
    /// `OP_REPLY` response flag bits, kept for legacy `OP_QUERY` handshakes
    /// against very old mongos/wire versions (spec §8).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ReplyFlags: u32 {
        const CURSOR_NOT_FOUND = 0x0000_0001;
        const QUERY_FAILURE    = 0x0000_0002;
        const AWAIT_CAPABLE    = 0x0000_0004;
    }
}

/// A decoded legacy `OP_REPLY`.
#[derive(Clone, Debug)]
pub struct Reply {
    pub flags: ReplyFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub docs: Vec<Document>,
}

impl Reply {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let header = Header::read_from(reader).await?;
        if header.op_code != OpCode::Reply {
            return Err(ErrorKind::Protocol {
                message: format!("expected OP_REPLY, got {:?}", header.op_code),
            }
            .into());
        }

        let flags = ReplyFlags::from_bits_truncate(reader.read_u32_le().await?);
        let cursor_id = reader.read_i64_le().await?;
        let starting_from = reader.read_i32_le().await?;
        let num_returned = reader.read_i32_le().await?;

        let mut docs = Vec::with_capacity(num_returned.max(0) as usize);
        let mut remaining = header.length as usize
            - Header::LENGTH
            - std::mem::size_of::<u32>()
            - std::mem::size_of::<i64>()
            - 2 * std::mem::size_of::<i32>();
        while remaining > 0 {
            let (doc, len) = read_document(reader).await?;
            docs.push(doc);
            remaining -= len;
        }

        Ok(Self {
            flags,
            cursor_id,
            starting_from,
            docs,
        })
    }
}

/// Encodes an `OP_QUERY` targeting `full_collection_name` with `query`,
/// still used for the very first handshake against wire versions that
/// predate `OP_MSG` (spec §4.1).
pub async fn write_query<W: AsyncWrite + Unpin>(
    writer: &mut W,
    full_collection_name: &str,
    query: &Document,
) -> Result<i32> {
    let mut body = Vec::new();
    body.extend_from_slice(&0i32.to_le_bytes()); // flags
    body.extend_from_slice(full_collection_name.as_bytes());
    body.push(0);
    body.extend_from_slice(&0i32.to_le_bytes()); // numberToSkip
    body.extend_from_slice(&(-1i32).to_le_bytes()); // numberToReturn
    query.to_writer(&mut body)?;

    let request_id = next_request_id();
    let header = Header {
        length: (Header::LENGTH + body.len()) as i32,
        request_id,
        response_to: 0,
        op_code: OpCode::Query,
    };
    header.write_to(writer).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(request_id)
}

/// Wraps `original_op_code`-tagged `uncompressed` bytes in `OP_COMPRESSED`
/// using `compressor` (spec §4.1).
pub async fn write_compressed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    compressor: &Compressor,
    original_op_code: OpCode,
    uncompressed: &[u8],
) -> Result<()> {
    let compressed = compression::compress(compressor, uncompressed)?;

    let body_len = std::mem::size_of::<i32>() // original op code
        + std::mem::size_of::<i32>() // uncompressed size
        + std::mem::size_of::<u8>()  // compressor id
        + compressed.len();

    let header = Header {
        length: (Header::LENGTH + body_len) as i32,
        request_id: next_request_id(),
        response_to: 0,
        op_code: OpCode::Compressed,
    };
    header.write_to(writer).await?;
    writer.write_i32_le(original_op_code as i32).await?;
    writer.write_i32_le(uncompressed.len() as i32).await?;
    writer.write_u8(compressor.id()).await?;
    writer.write_all(&compressed).await?;
    writer.flush().await?;
    Ok(())
}

/// Decoded payload of an `OP_COMPRESSED` message, not yet parsed as an
/// `OP_MSG`/`OP_REPLY`.
pub struct DecompressedMessage {
    pub original_op_code: OpCode,
    pub bytes: Vec<u8>,
}

pub async fn read_compressed<R: AsyncRead + Unpin>(
    reader: &mut R,
    header: Header,
) -> Result<DecompressedMessage> {
    let original_op_code = OpCode::from_i32(reader.read_i32_le().await?)?;
    let uncompressed_size = reader.read_i32_le().await?;
    let compressor_id = reader.read_u8().await?;

    let compressed_len = header.length as usize
        - Header::LENGTH
        - 2 * std::mem::size_of::<i32>()
        - std::mem::size_of::<u8>();
    let mut compressed = vec![0u8; compressed_len];
    reader.read_exact(&mut compressed).await?;

    let bytes = compression::decompress(compressor_id, &compressed)?;
    if bytes.len() != uncompressed_size as usize {
        return Err(ErrorKind::Protocol {
            message: format!(
                "OP_COMPRESSED declared uncompressed size {uncompressed_size} but decompressed \
                 to {}",
                bytes.len()
            ),
        }
        .into());
    }

    Ok(DecompressedMessage {
        original_op_code,
        bytes,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn message_round_trips_single_document() {
        let doc = bson::doc! { "hello": 1, "$db": "admin" };
        let msg = Message::with_document(doc.clone());

        let mut buf = Vec::new();
        msg.write_to(&mut buf).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = Message::read_from(&mut cursor).await.unwrap();
        assert_eq!(decoded.single_document_response().unwrap(), doc);
    }

    #[tokio::test]
    async fn message_round_trips_document_sequence() {
        let msg = Message {
            request_id: 7,
            response_to: 0,
            flags: MessageFlags::empty(),
            sections: vec![
                MessageSection::Document(bson::doc! { "insert": "coll", "$db": "test" }),
                MessageSection::Sequence {
                    identifier: "documents".to_string(),
                    documents: vec![bson::doc! { "_id": 1 }, bson::doc! { "_id": 2 }],
                },
            ],
        };

        let mut buf = Vec::new();
        msg.write_to(&mut buf).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = Message::read_from(&mut cursor).await.unwrap();
        assert_eq!(decoded.request_id, 7);
        assert_eq!(decoded.sections.len(), 2);
    }

    #[test]
    fn request_ids_are_unique_and_increasing() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }
}
