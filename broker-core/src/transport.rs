//! Trait surface this crate expects a host transport to provide. Socket
//! I/O, TLS/X.509 parsing, and on-disk message persistence are out of
//! scope here; these traits are the seam a transport plugs into.

use crate::authz::AuthKey;
use crate::message::Message;

/// Delivers an encoded frame to a single connected client or bridge peer.
/// The transport owns the actual socket; this crate only decides *what*
/// goes where.
pub trait FrameSink {
    fn send(&self, destination_client_id: &str, payload: &[u8]);
}

/// The in-memory revocation view a transport consults before accepting a
/// client's certificate, kept in sync by [`crate::revocation::RevocationStore`]'s
/// maintenance tick.
pub trait RevocationView {
    fn push_revoked(&self, hashes: &[String]);
}

/// Off-hot-path aggregate counters for `/mcafee/event/dxl/broker/health`,
/// built by a thread-pool worker and posted back onto the event loop's
/// outbound queue rather than computed inline (spec §9 scheduling model).
pub trait HealthResponder {
    fn current_connection_count(&self) -> u64;
    fn current_memory_bytes(&self) -> u64;
}

/// Minimal description of an inbound frame before it is parsed into a
/// [`Message`]: which connection it arrived on, whether that connection is
/// a bridge, and the raw bytes.
pub struct InboundFrame<'a> {
    pub source_client_id: String,
    pub is_bridge_source: bool,
    pub cert_hash: Option<String>,
    pub payload: &'a [u8],
}

impl<'a> InboundFrame<'a> {
    /// Populates `cert_hash` by hashing the connection's DER-encoded
    /// certificate, rather than requiring the transport to hash it itself.
    pub fn with_certificate(source_client_id: impl Into<String>, is_bridge_source: bool, certificate_der: &[u8], payload: &'a [u8]) -> Self {
        let hash = match AuthKey::from_certificate_der(certificate_der) {
            AuthKey::CertHash(hash) => hash,
            AuthKey::ClientId(_) => unreachable!("from_certificate_der always returns CertHash"),
        };
        InboundFrame {
            source_client_id: source_client_id.into(),
            is_bridge_source,
            cert_hash: Some(hash),
            payload,
        }
    }
}

/// What a transport needs after a frame has gone through the pipeline: the
/// (possibly re-serialized) payload, plus where to send it.
pub struct OutboundFrame {
    pub destination_client_ids: Vec<String>,
    pub payload: Vec<u8>,
}

impl OutboundFrame {
    pub fn new(destination_client_ids: Vec<String>, payload: Vec<u8>) -> Self {
        OutboundFrame {
            destination_client_ids,
            payload,
        }
    }
}

/// Re-exported so hosts implementing [`FrameSink`] can build replies
/// without depending on the codec module directly.
pub fn encode_for_sink(message: &Message) -> Vec<u8> {
    crate::codec::encode(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_frame_with_certificate_hashes_the_der_bytes() {
        let payload = b"hello";
        let frame = InboundFrame::with_certificate("client-1", true, b"pretend-der-bytes", payload);
        assert_eq!(frame.cert_hash, Some(match AuthKey::from_certificate_der(b"pretend-der-bytes") {
            AuthKey::CertHash(h) => h,
            AuthKey::ClientId(_) => unreachable!(),
        }));
        assert!(frame.is_bridge_source);
        assert_eq!(frame.payload, payload);
    }
}
