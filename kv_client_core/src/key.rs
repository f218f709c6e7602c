use bytes::Bytes;
use ripemd::{Digest, Ripemd160};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Particle type tags of key values
pub const PARTICLE_INTEGER: u8 = 1;
pub const PARTICLE_STRING: u8 = 3;
pub const PARTICLE_BLOB: u8 = 4;

/// User supplied key value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserKey {
    String(String),
    Integer(i64),
    Blob(Vec<u8>),
}

impl UserKey {
    pub fn particle_type(&self) -> u8 {
        match self {
            UserKey::String(_) => PARTICLE_STRING,
            UserKey::Integer(_) => PARTICLE_INTEGER,
            UserKey::Blob(_) => PARTICLE_BLOB,
        }
    }

    /// Wire bytes of the value, integers are big endian
    pub fn to_bytes(&self) -> Bytes {
        match self {
            UserKey::String(s) => Bytes::copy_from_slice(s.as_bytes()),
            UserKey::Integer(i) => Bytes::copy_from_slice(&i.to_be_bytes()),
            UserKey::Blob(b) => Bytes::copy_from_slice(b),
        }
    }
}

impl From<&str> for UserKey {
    fn from(value: &str) -> Self {
        UserKey::String(value.to_string())
    }
}

impl From<String> for UserKey {
    fn from(value: String) -> Self {
        UserKey::String(value)
    }
}

impl From<i64> for UserKey {
    fn from(value: i64) -> Self {
        UserKey::Integer(value)
    }
}

impl From<Vec<u8>> for UserKey {
    fn from(value: Vec<u8>) -> Self {
        UserKey::Blob(value)
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserKey::String(s) => write!(f, "{}", s),
            UserKey::Integer(i) => write!(f, "{}", i),
            UserKey::Blob(b) => write!(f, "{}", hex::encode(b)),
        }
    }
}

/// Record identifier
///
/// The digest is what the server indexes by; the user key is only kept so it
/// can be sent along when the policy asks for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub namespace: String,
    pub set_name: String,
    pub user_key: Option<UserKey>,
    pub digest: [u8; 20],
}

impl Key {
    pub fn new(namespace: impl Into<String>, set_name: impl Into<String>, user_key: impl Into<UserKey>) -> Self {
        let set_name = set_name.into();
        let user_key = user_key.into();
        let digest = compute_digest(&set_name, &user_key);
        Self {
            namespace: namespace.into(),
            set_name,
            user_key: Some(user_key),
            digest,
        }
    }

    /// Key known only by its digest
    pub fn from_digest(namespace: impl Into<String>, set_name: impl Into<String>, digest: [u8; 20]) -> Self {
        Self {
            namespace: namespace.into(),
            set_name: set_name.into(),
            user_key: None,
            digest,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user_key {
            Some(user_key) => write!(f, "{}:{}:{}", self.namespace, self.set_name, user_key),
            None => write!(f, "{}:{}:{}", self.namespace, self.set_name, hex::encode(self.digest)),
        }
    }
}

/// RIPEMD-160 over the set name, the key particle type and the key bytes
pub fn compute_digest(set_name: &str, user_key: &UserKey) -> [u8; 20] {
    let mut hasher = Ripemd160::new();
    hasher.update(set_name.as_bytes());
    hasher.update([user_key.particle_type()]);
    hasher.update(user_key.to_bytes());
    let mut digest = [0u8; 20];
    digest.copy_from_slice(&hasher.finalize());
    digest
}
