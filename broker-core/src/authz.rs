//! Authorization engine (spec §4.E): per-topic allow-lists keyed by client
//! id or certificate hash, with wildcard-pattern topics.

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};

use crate::wildcard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Publish,
    Subscribe,
}

/// A key identifying an authorized principal: either its client id or the
/// hash of its certificate. Both sit in the same key space, so a topic's
/// allow-list can mix the two forms freely.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthKey {
    ClientId(String),
    CertHash(String),
}

impl AuthKey {
    /// Builds a `CertHash` key from a DER-encoded certificate, hashing it
    /// with SHA-256 and hex-encoding the digest (spec §4.F/§4.E: both the
    /// revocation store and the authorization engine key certificates by
    /// this same lowercase hex fingerprint).
    pub fn from_certificate_der(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        AuthKey::CertHash(hex::encode(digest))
    }
}

/// Immutable snapshot of the current authorization policy. Replaced
/// wholesale on reload rather than mutated in place, so `is_authorized` is
/// a pure function of the snapshot it closes over (spec §9 determinism
/// requirement).
#[derive(Debug, Clone, Default)]
pub struct AuthorizationState {
    publish: BTreeMap<String, BTreeSet<AuthKey>>,
    subscribe: BTreeMap<String, BTreeSet<AuthKey>>,
    has_wildcard: bool,
}

impl AuthorizationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&mut self, direction: Direction, topic: impl Into<String>, key: AuthKey) {
        let topic = topic.into();
        if wildcard::contains_wildcard(&topic) {
            self.has_wildcard = true;
        }
        let map = match direction {
            Direction::Publish => &mut self.publish,
            Direction::Subscribe => &mut self.subscribe,
        };
        map.entry(topic).or_default().insert(key);
    }

    /// A topic absent from the mapping is unrestricted. A present exact
    /// topic restricts to its own keys; a wildcard-pattern topic whose keys
    /// include `key` additionally grants any topic it matches.
    pub fn is_authorized(&self, direction: Direction, key: &AuthKey, topic: &str) -> bool {
        let map = match direction {
            Direction::Publish => &self.publish,
            Direction::Subscribe => &self.subscribe,
        };
        let mut restricted = false;
        if let Some(allowed) = map.get(topic) {
            restricted = true;
            if allowed.contains(key) {
                return true;
            }
        }
        if self.has_wildcard {
            for (pattern, allowed) in map {
                if wildcard::contains_wildcard(pattern) && wildcard::matches(pattern, topic) {
                    restricted = true;
                    if allowed.contains(key) {
                        return true;
                    }
                }
            }
        }
        !restricted
    }

    pub fn is_authorized_to_publish(&self, key: &AuthKey, topic: &str) -> bool {
        self.is_authorized(Direction::Publish, key, topic)
    }

    pub fn is_authorized_to_subscribe(&self, key: &AuthKey, topic: &str) -> bool {
        self.is_authorized(Direction::Subscribe, key, topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_topic_is_unrestricted() {
        let state = AuthorizationState::new();
        assert!(state.is_authorized_to_publish(&AuthKey::ClientId("c1".into()), "anything"));
    }

    #[test]
    fn exact_topic_restricts_to_listed_keys() {
        let mut state = AuthorizationState::new();
        state.allow(Direction::Publish, "x/y", AuthKey::ClientId("c1".into()));
        assert!(state.is_authorized_to_publish(&AuthKey::ClientId("c1".into()), "x/y"));
        assert!(!state.is_authorized_to_publish(&AuthKey::ClientId("c2".into()), "x/y"));
    }

    #[test]
    fn wildcard_pattern_grants_matching_topics() {
        let mut state = AuthorizationState::new();
        state.allow(Direction::Publish, "x/+/z", AuthKey::ClientId("c1".into()));
        assert!(state.is_authorized_to_publish(&AuthKey::ClientId("c1".into()), "x/q/z"));
        assert!(!state.is_authorized_to_publish(&AuthKey::ClientId("c2".into()), "x/q/z"));
        assert!(state.is_authorized_to_publish(&AuthKey::ClientId("c2".into()), "other"));
    }

    #[test]
    fn cert_hash_key_works_the_same_as_client_id() {
        let mut state = AuthorizationState::new();
        state.allow(Direction::Subscribe, "a/b", AuthKey::CertHash("deadbeef".into()));
        assert!(state.is_authorized_to_subscribe(&AuthKey::CertHash("deadbeef".into()), "a/b"));
        assert!(!state.is_authorized_to_subscribe(&AuthKey::ClientId("deadbeef".into()), "a/b"));
    }

    #[test]
    fn cert_hash_key_is_a_deterministic_lowercase_hex_digest() {
        let key = AuthKey::from_certificate_der(b"pretend-der-bytes");
        let AuthKey::CertHash(hash) = &key else { panic!("expected CertHash") };
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(key, AuthKey::from_certificate_der(b"pretend-der-bytes"));
    }
}
