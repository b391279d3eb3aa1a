//! Wire protocol framing
//!
//! Messages are a 16-byte little-endian header (total length, request id,
//! response-to, opcode) followed by the body. One opcode family is
//! accepted: the message envelope (`OP_MSG`) carrying flag bits, one body
//! document, and optional document-sequence sections. Document bytes on
//! the wire use the engine's self-describing serialization.

use byteorder::{ByteOrder, LittleEndian};
use rook_core::{Document, Error, Result};

/// Header length in bytes.
pub const HEADER_LEN: usize = 16;
/// The message-envelope opcode.
pub const OP_MSG: i32 = 2013;

/// Section kind byte: one body document.
const SECTION_BODY: u8 = 0;
/// Section kind byte: a named document sequence.
const SECTION_SEQUENCE: u8 = 1;

/// The fixed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Total message length including the header.
    pub message_length: i32,
    /// Client-chosen request id.
    pub request_id: i32,
    /// Request id this message answers, zero for requests.
    pub response_to: i32,
    /// Opcode; only [`OP_MSG`] is accepted.
    pub op_code: i32,
}

impl MsgHeader {
    /// Parse the 16 header bytes.
    pub fn parse(buf: &[u8]) -> Result<MsgHeader> {
        if buf.len() < HEADER_LEN {
            return Err(Error::InvalidBson("message shorter than header".into()));
        }
        Ok(MsgHeader {
            message_length: LittleEndian::read_i32(&buf[0..4]),
            request_id: LittleEndian::read_i32(&buf[4..8]),
            response_to: LittleEndian::read_i32(&buf[8..12]),
            op_code: LittleEndian::read_i32(&buf[12..16]),
        })
    }

    /// Serialize into 16 bytes.
    pub fn write(&self, buf: &mut Vec<u8>) {
        let mut b = [0u8; HEADER_LEN];
        LittleEndian::write_i32(&mut b[0..4], self.message_length);
        LittleEndian::write_i32(&mut b[4..8], self.request_id);
        LittleEndian::write_i32(&mut b[8..12], self.response_to);
        LittleEndian::write_i32(&mut b[12..16], self.op_code);
        buf.extend_from_slice(&b);
    }
}

/// The message envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct OpMsg {
    /// Flag bits (none are interpreted yet; checked to be zero-extended).
    pub flag_bits: u32,
    /// The command body.
    pub body: Document,
    /// Named document sequences (bulk payloads).
    pub sequences: Vec<(String, Vec<Document>)>,
}

impl OpMsg {
    /// Envelope with just a body.
    pub fn with_body(body: Document) -> Self {
        Self {
            flag_bits: 0,
            body,
            sequences: Vec::new(),
        }
    }

    /// Frame a full message.
    pub fn encode(&self, request_id: i32, response_to: i32) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        let mut flags = [0u8; 4];
        LittleEndian::write_u32(&mut flags, self.flag_bits);
        payload.extend_from_slice(&flags);

        payload.push(SECTION_BODY);
        write_document(&mut payload, &self.body)?;
        for (name, docs) in &self.sequences {
            payload.push(SECTION_SEQUENCE);
            let mut section = Vec::new();
            section.extend_from_slice(name.as_bytes());
            section.push(0);
            let mut count = [0u8; 4];
            LittleEndian::write_u32(&mut count, docs.len() as u32);
            section.extend_from_slice(&count);
            for doc in docs {
                write_document(&mut section, doc)?;
            }
            let mut len = [0u8; 4];
            LittleEndian::write_u32(&mut len, section.len() as u32 + 4);
            payload.extend_from_slice(&len);
            payload.extend_from_slice(&section);
        }

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        MsgHeader {
            message_length: (HEADER_LEN + payload.len()) as i32,
            request_id,
            response_to,
            op_code: OP_MSG,
        }
        .write(&mut out);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Parse a full message (header included).
    pub fn decode(buf: &[u8]) -> Result<(MsgHeader, OpMsg)> {
        let header = MsgHeader::parse(buf)?;
        if header.op_code != OP_MSG {
            return Err(Error::bad_value(format!(
                "unsupported opcode {}",
                header.op_code
            )));
        }
        if header.message_length as usize != buf.len() {
            return Err(Error::InvalidBson(format!(
                "header claims {} bytes, got {}",
                header.message_length,
                buf.len()
            )));
        }
        let mut pos = HEADER_LEN;
        if buf.len() < pos + 4 {
            return Err(Error::InvalidBson("message truncated at flags".into()));
        }
        let flag_bits = LittleEndian::read_u32(&buf[pos..pos + 4]);
        pos += 4;

        let mut body = None;
        let mut sequences = Vec::new();
        while pos < buf.len() {
            let kind = buf[pos];
            pos += 1;
            match kind {
                SECTION_BODY => {
                    let (doc, used) = read_document(&buf[pos..])?;
                    pos += used;
                    if body.replace(doc).is_some() {
                        return Err(Error::InvalidBson("duplicate body section".into()));
                    }
                }
                SECTION_SEQUENCE => {
                    if buf.len() < pos + 4 {
                        return Err(Error::InvalidBson("sequence truncated".into()));
                    }
                    let section_len = LittleEndian::read_u32(&buf[pos..pos + 4]) as usize;
                    let end = pos + section_len;
                    if section_len < 4 || end > buf.len() {
                        return Err(Error::InvalidBson("bad sequence length".into()));
                    }
                    let mut spos = pos + 4;
                    let name_end = buf[spos..end]
                        .iter()
                        .position(|b| *b == 0)
                        .ok_or_else(|| Error::InvalidBson("unterminated sequence name".into()))?;
                    let name = String::from_utf8(buf[spos..spos + name_end].to_vec())
                        .map_err(|_| Error::InvalidBson("bad sequence name".into()))?;
                    spos += name_end + 1;
                    if end < spos + 4 {
                        return Err(Error::InvalidBson("sequence count truncated".into()));
                    }
                    let count = LittleEndian::read_u32(&buf[spos..spos + 4]) as usize;
                    spos += 4;
                    let mut docs = Vec::with_capacity(count);
                    for _ in 0..count {
                        let (doc, used) = read_document(&buf[spos..end])?;
                        spos += used;
                        docs.push(doc);
                    }
                    sequences.push((name, docs));
                    pos = end;
                }
                other => {
                    return Err(Error::InvalidBson(format!(
                        "unknown section kind {}",
                        other
                    )))
                }
            }
        }
        let body =
            body.ok_or_else(|| Error::InvalidBson("message carries no body section".into()))?;
        Ok((
            header,
            OpMsg {
                flag_bits,
                body,
                sequences,
            },
        ))
    }
}

/// Length-prefixed document bytes.
fn write_document(out: &mut Vec<u8>, doc: &Document) -> Result<()> {
    let bytes = bincode::serialize(doc)
        .map_err(|e| Error::InvalidBson(format!("document encode failed: {}", e)))?;
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, bytes.len() as u32 + 4);
    out.extend_from_slice(&len);
    out.extend_from_slice(&bytes);
    Ok(())
}

fn read_document(buf: &[u8]) -> Result<(Document, usize)> {
    if buf.len() < 4 {
        return Err(Error::InvalidBson("document length truncated".into()));
    }
    let total = LittleEndian::read_u32(&buf[0..4]) as usize;
    if total < 4 || total > buf.len() {
        return Err(Error::InvalidBson("bad document length".into()));
    }
    let doc = bincode::deserialize(&buf[4..total])
        .map_err(|e| Error::InvalidBson(format!("document decode failed: {}", e)))?;
    Ok((doc, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook_core::doc;

    #[test]
    fn header_round_trip() {
        let header = MsgHeader {
            message_length: 128,
            request_id: 7,
            response_to: 3,
            op_code: OP_MSG,
        };
        let mut buf = Vec::new();
        header.write(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(MsgHeader::parse(&buf).unwrap(), header);
    }

    #[test]
    fn message_round_trip_with_sequences() {
        let msg = OpMsg {
            flag_bits: 0,
            body: doc! { "insert": "users", "$db": "app" },
            sequences: vec![(
                "documents".to_string(),
                vec![doc! { "a": 1 }, doc! { "a": 2 }],
            )],
        };
        let bytes = msg.encode(42, 0).unwrap();
        let (header, decoded) = OpMsg::decode(&bytes).unwrap();
        assert_eq!(header.request_id, 42);
        assert_eq!(header.op_code, OP_MSG);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn bad_frames_are_rejected() {
        assert!(MsgHeader::parse(&[0u8; 4]).is_err());

        let msg = OpMsg::with_body(doc! { "ping": 1 });
        let mut bytes = msg.encode(1, 0).unwrap();
        // Wrong opcode.
        LittleEndian::write_i32(&mut bytes[12..16], 9999);
        assert!(OpMsg::decode(&bytes).is_err());

        // Truncated message.
        let bytes = msg.encode(1, 0).unwrap();
        assert!(OpMsg::decode(&bytes[..bytes.len() - 2]).is_err());
    }
}
