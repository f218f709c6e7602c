use crate::key::Key;
use bytes::Bytes;
use std::collections::HashMap;

/// Raw bin value as found on the wire
///
/// Decoding into typed values is left to the caller's codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Particle {
    pub particle_type: u8,
    pub data: Bytes,
}

impl Particle {
    pub fn new(particle_type: u8, data: impl Into<Bytes>) -> Self {
        Self {
            particle_type,
            data: data.into(),
        }
    }

    pub fn string(value: &str) -> Self {
        Self::new(crate::key::PARTICLE_STRING, Bytes::copy_from_slice(value.as_bytes()))
    }

    pub fn integer(value: i64) -> Self {
        Self::new(crate::key::PARTICLE_INTEGER, Bytes::copy_from_slice(&value.to_be_bytes()))
    }
}

/// Named value written by a put
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bin {
    pub name: String,
    pub value: Particle,
}

impl Bin {
    pub fn new(name: impl Into<String>, value: Particle) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub bins: HashMap<String, Particle>,
    pub generation: u32,
    /// Server void time in seconds, 0 when the record never expires
    pub expiration: u32,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<&Particle> {
        self.bins.get(name)
    }
}

/// Key with its own bin selection for a batch read
#[derive(Debug, Clone)]
pub struct BatchRead {
    pub key: Key,
    /// Bins to fetch, all bins when `None` and `read_all_bins` is set
    pub bin_names: Option<Vec<String>>,
    pub read_all_bins: bool,
    /// Filled in by the batch command
    pub record: Option<Record>,
}

impl BatchRead {
    pub fn new(key: Key, bin_names: Vec<String>) -> Self {
        Self {
            key,
            bin_names: Some(bin_names),
            read_all_bins: false,
            record: None,
        }
    }

    pub fn all_bins(key: Key) -> Self {
        Self {
            key,
            bin_names: None,
            read_all_bins: true,
            record: None,
        }
    }

    /// Header only read
    pub fn header(key: Key) -> Self {
        Self {
            key,
            bin_names: None,
            read_all_bins: false,
            record: None,
        }
    }
}
