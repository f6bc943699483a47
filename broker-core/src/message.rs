//! The versioned message record (spec §3 "Message") carried inside a
//! published frame once the pipeline has recognized and parsed it.

use std::collections::{BTreeSet, HashMap};

/// The four message kinds the fabric understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Event,
    Request,
    Response,
    Error,
}

impl MessageKind {
    pub fn as_tag(self) -> u8 {
        match self {
            MessageKind::Event => 0,
            MessageKind::Request => 1,
            MessageKind::Response => 2,
            MessageKind::Error => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(MessageKind::Event),
            1 => Some(MessageKind::Request),
            2 => Some(MessageKind::Response),
            3 => Some(MessageKind::Error),
            _ => None,
        }
    }
}

/// Kind-specific fields layered on top of the common envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFields {
    pub reply_to_topic: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseFields {
    pub request_message_id: String,
    pub service_instance_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub code: String,
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindFields {
    Event,
    Request(RequestFields),
    Response(ResponseFields),
    Error(ErrorFields),
}

impl KindFields {
    pub fn kind(&self) -> MessageKind {
        match self {
            KindFields::Event => MessageKind::Event,
            KindFields::Request(_) => MessageKind::Request,
            KindFields::Response(_) => MessageKind::Response,
            KindFields::Error(_) => MessageKind::Error,
        }
    }
}

/// The full message record (spec §3). `dirty` is set by any mutator so the
/// pipeline knows to re-serialize before handing the payload back to the
/// transport (spec §4.J, store phase).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_id: String,
    pub source_broker_id: String,
    pub source_client_id: String,
    pub source_client_instance_id: String,
    pub source_tenant_id: String,
    pub destination_broker_ids: BTreeSet<String>,
    pub destination_client_ids: BTreeSet<String>,
    pub destination_tenant_ids: BTreeSet<String>,
    pub payload: Vec<u8>,
    pub other_fields: HashMap<String, String>,
    pub fields: KindFields,
    pub(crate) dirty: bool,
}

impl Message {
    pub fn new(message_id: impl Into<String>, fields: KindFields) -> Self {
        Message {
            message_id: message_id.into(),
            source_broker_id: String::new(),
            source_client_id: String::new(),
            source_client_instance_id: String::new(),
            source_tenant_id: String::new(),
            destination_broker_ids: BTreeSet::new(),
            destination_client_ids: BTreeSet::new(),
            destination_tenant_ids: BTreeSet::new(),
            payload: Vec::new(),
            other_fields: HashMap::new(),
            fields,
            dirty: false,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.fields.kind()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn set_source_broker_id(&mut self, id: impl Into<String>) {
        self.source_broker_id = id.into();
        self.dirty = true;
    }

    pub fn set_source_client_id(&mut self, id: impl Into<String>) {
        self.source_client_id = id.into();
        self.dirty = true;
    }

    pub fn add_destination_broker(&mut self, id: impl Into<String>) {
        self.destination_broker_ids.insert(id.into());
        self.dirty = true;
    }

    pub fn add_destination_client(&mut self, id: impl Into<String>) {
        self.destination_client_ids.insert(id.into());
        self.dirty = true;
    }

    pub fn clear_destination_clients(&mut self) {
        self.destination_client_ids.clear();
        self.dirty = true;
    }

    pub fn as_request(&self) -> Option<&RequestFields> {
        match &self.fields {
            KindFields::Request(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&ResponseFields> {
        match &self.fields {
            KindFields::Response(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorFields> {
        match &self.fields {
            KindFields::Error(e) => Some(e),
            _ => None,
        }
    }
}
