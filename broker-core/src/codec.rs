//! Message codec (spec §4.A): a length-prefixed binary envelope, written in
//! a strict field order that grows by version. A decoder accepts any
//! version up to its own and treats missing trailing sections as empty; an
//! encoder always writes the highest version it supports.
//!
//! Wire layout, in order:
//! - `version: u8`, `kind: u8`
//! - v0: message_id, source_client_id, source_broker_id, broker_id list,
//!   client_id list, payload, then kind-specific fields
//! - v1 appends: other_fields (flat key,value,key,value,...)
//! - v2 appends: source_tenant_id, destination_tenant_id list
//! - v3 appends: source_client_instance_id
//!
//! Strings are raw byte ranges on the wire, without a null terminator; a
//! decoder may add one when materializing into its host language (Rust
//! strings don't need to, since we keep them as owned `String`s).

use std::collections::BTreeSet;

use thiserror::Error;

use crate::message::{ErrorFields, KindFields, Message, MessageKind, RequestFields, ResponseFields};

pub const CURRENT_VERSION: u8 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The byte stream could not be parsed as a valid envelope.
    #[error("bad data: {0}")]
    BadData(String),
    /// A length prefix implied an allocation too large to be plausible.
    #[error("no memory: {0}")]
    NoMemory(String),
    /// The kind byte did not map to a known [`MessageKind`].
    #[error("wrong kind: {0}")]
    WrongKind(u8),
}

/// Defensive cap on any single length-prefixed field, to fail fast on
/// corrupt input rather than attempt a multi-gigabyte allocation.
const MAX_FIELD_LEN: usize = 64 * 1024 * 1024;

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn write_bytes(&mut self, v: &[u8]) {
        self.write_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    fn write_str(&mut self, v: &str) {
        self.write_bytes(v.as_bytes());
    }

    fn write_str_list<'a>(&mut self, items: impl IntoIterator<Item = &'a str>) {
        let items: Vec<&str> = items.into_iter().collect();
        self.write_u32(items.len() as u32);
        for item in items {
            self.write_str(item);
        }
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> bool {
        self.pos < self.buf.len()
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| CodecError::BadData("unexpected end of buffer reading u8".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let end = self.pos + 4;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| CodecError::BadData("unexpected end of buffer reading u32".into()))?;
        self.pos = end;
        Ok(u32::from_be_bytes(slice.try_into().unwrap()))
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_u32()? as usize;
        if len > MAX_FIELD_LEN {
            return Err(CodecError::NoMemory(format!(
                "field length {len} exceeds {MAX_FIELD_LEN}"
            )));
        }
        let end = self.pos + len;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| CodecError::BadData("field length runs past end of buffer".into()))?;
        self.pos = end;
        Ok(slice.to_vec())
    }

    fn read_str(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| CodecError::BadData(e.to_string()))
    }

    fn read_str_list(&mut self) -> Result<Vec<String>, CodecError> {
        let count = self.read_u32()? as usize;
        if count > MAX_FIELD_LEN {
            return Err(CodecError::NoMemory(format!("list length {count} implausible")));
        }
        let mut out = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            out.push(self.read_str()?);
        }
        Ok(out)
    }
}

/// Encodes `message` using the highest wire version this crate supports.
pub fn encode(message: &Message) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u8(CURRENT_VERSION);
    w.write_u8(message.kind().as_tag());

    // v0
    w.write_str(&message.message_id);
    w.write_str(&message.source_client_id);
    w.write_str(&message.source_broker_id);
    w.write_str_list(message.destination_broker_ids.iter().map(String::as_str));
    w.write_str_list(message.destination_client_ids.iter().map(String::as_str));
    w.write_bytes(&message.payload);
    encode_kind_fields(&mut w, &message.fields);

    // v1
    w.write_u32(message.other_fields.len() as u32);
    for (k, v) in &message.other_fields {
        w.write_str(k);
        w.write_str(v);
    }

    // v2
    w.write_str(&message.source_tenant_id);
    w.write_str_list(message.destination_tenant_ids.iter().map(String::as_str));

    // v3
    w.write_str(&message.source_client_instance_id);

    w.finish()
}

fn encode_kind_fields(w: &mut Writer, fields: &KindFields) {
    match fields {
        KindFields::Event => {}
        KindFields::Request(r) => {
            w.write_str(&r.reply_to_topic);
        }
        KindFields::Response(r) => {
            w.write_str(&r.request_message_id);
            w.write_str(&r.service_instance_id);
        }
        KindFields::Error(e) => {
            w.write_str(&e.code);
            w.write_str(&e.error_message);
        }
    }
}

fn decode_kind_fields(r: &mut Reader, kind: MessageKind) -> Result<KindFields, CodecError> {
    Ok(match kind {
        MessageKind::Event => KindFields::Event,
        MessageKind::Request => KindFields::Request(RequestFields {
            reply_to_topic: r.read_str()?,
        }),
        MessageKind::Response => KindFields::Response(ResponseFields {
            request_message_id: r.read_str()?,
            service_instance_id: r.read_str()?,
        }),
        MessageKind::Error => KindFields::Error(ErrorFields {
            code: r.read_str()?,
            error_message: r.read_str()?,
        }),
    })
}

/// Decodes a frame. Accepts any version <= [`CURRENT_VERSION`]; sections
/// introduced by a later version than the frame's are left empty.
pub fn decode(buf: &[u8]) -> Result<Message, CodecError> {
    let mut r = Reader::new(buf);
    let version = r.read_u8()?;
    if version > CURRENT_VERSION {
        return Err(CodecError::BadData(format!(
            "unsupported version {version}, max supported is {CURRENT_VERSION}"
        )));
    }
    let kind_tag = r.read_u8()?;
    let kind = MessageKind::from_tag(kind_tag).ok_or(CodecError::WrongKind(kind_tag))?;

    let message_id = r.read_str()?;
    let source_client_id = r.read_str()?;
    let source_broker_id = r.read_str()?;
    let destination_broker_ids: BTreeSet<String> = r.read_str_list()?.into_iter().collect();
    let destination_client_ids: BTreeSet<String> = r.read_str_list()?.into_iter().collect();
    let payload = r.read_bytes()?;
    let fields = decode_kind_fields(&mut r, kind)?;

    let mut other_fields = std::collections::HashMap::new();
    if version >= 1 && r.remaining() {
        let count = r.read_u32()? as usize;
        for _ in 0..count {
            let k = r.read_str()?;
            let v = r.read_str()?;
            other_fields.insert(k, v);
        }
    }

    let mut source_tenant_id = String::new();
    let mut destination_tenant_ids = BTreeSet::new();
    if version >= 2 && r.remaining() {
        source_tenant_id = r.read_str()?;
        destination_tenant_ids = r.read_str_list()?.into_iter().collect();
    }

    let mut source_client_instance_id = String::new();
    if version >= 3 && r.remaining() {
        source_client_instance_id = r.read_str()?;
    }

    Ok(Message {
        message_id,
        source_broker_id,
        source_client_id,
        source_client_instance_id,
        source_tenant_id,
        destination_broker_ids,
        destination_client_ids,
        destination_tenant_ids,
        payload,
        other_fields,
        fields,
        dirty: false,
    })
}
