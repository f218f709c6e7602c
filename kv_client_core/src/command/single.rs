//! Single record commands

use super::buffer::CommandBuffer;
use super::parse::{RecordHeader, RecordReader};
use super::{key_node, Command, Parsed};
use crate::cluster::Cluster;
use crate::config::{Policy, WritePolicy};
use crate::error::{ClientError, Result};
use crate::key::Key;
use crate::net::ProtoMessage;
use crate::node::Node;
use crate::record::{Bin, Record};
use crate::result_code;
use std::sync::Arc;

/// Header of the single record in a response
fn read_header(message: &ProtoMessage) -> Result<(RecordReader, RecordHeader)> {
    let mut reader = RecordReader::new(message.body.clone());
    let header = reader.read_header()?;
    Ok((reader, header))
}

/// Point read of one record
pub struct ReadCommand {
    policy: Policy,
    key: Key,
    bin_names: Option<Vec<String>>,
    header_only: bool,
    record: Option<Record>,
}

impl ReadCommand {
    /// Read the named bins, or all bins when `bin_names` is `None`
    pub fn new(policy: Policy, key: Key, bin_names: Option<Vec<String>>) -> Self {
        Self {
            policy,
            key,
            bin_names,
            header_only: false,
            record: None,
        }
    }

    /// Read generation and expiration without bins
    pub fn header(policy: Policy, key: Key) -> Self {
        Self {
            header_only: true,
            ..Self::new(policy, key, None)
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Record found by the last successful attempt, `None` when not found
    pub fn into_record(self) -> Option<Record> {
        self.record
    }
}

impl Command for ReadCommand {
    fn name(&self) -> &'static str {
        "read"
    }

    fn policy(&self) -> &Policy {
        &self.policy
    }

    fn node(&self, cluster: &Cluster, sequence: usize) -> Result<Arc<Node>> {
        key_node(cluster, &self.key, &self.policy, sequence, false)
    }

    fn write_buffer(&mut self, buf: &mut CommandBuffer) -> Result<()> {
        if self.header_only {
            buf.set_read_header(&self.policy, &self.key)
        } else {
            buf.set_read(&self.policy, &self.key, self.bin_names.as_deref())
        }
    }

    fn parse_message(&mut self, message: &ProtoMessage) -> Result<Parsed> {
        let (mut reader, header) = read_header(message)?;
        match header.result_code {
            result_code::OK => {
                reader.read_key(header.field_count)?;
                self.record = Some(reader.read_record(&header)?);
            }
            result_code::KEY_NOT_FOUND_ERROR => self.record = None,
            code => return Err(ClientError::server(code)),
        }
        Ok(Parsed::Done)
    }
}

/// Existence check of one record
pub struct ExistsCommand {
    policy: Policy,
    key: Key,
    exists: bool,
}

impl ExistsCommand {
    pub fn new(policy: Policy, key: Key) -> Self {
        Self {
            policy,
            key,
            exists: false,
        }
    }

    pub fn exists(&self) -> bool {
        self.exists
    }
}

impl Command for ExistsCommand {
    fn name(&self) -> &'static str {
        "exists"
    }

    fn policy(&self) -> &Policy {
        &self.policy
    }

    fn node(&self, cluster: &Cluster, sequence: usize) -> Result<Arc<Node>> {
        key_node(cluster, &self.key, &self.policy, sequence, false)
    }

    fn write_buffer(&mut self, buf: &mut CommandBuffer) -> Result<()> {
        buf.set_exists(&self.policy, &self.key)
    }

    fn parse_message(&mut self, message: &ProtoMessage) -> Result<Parsed> {
        let (_, header) = read_header(message)?;
        self.exists = match header.result_code {
            result_code::OK => true,
            result_code::KEY_NOT_FOUND_ERROR => false,
            code => return Err(ClientError::server(code)),
        };
        Ok(Parsed::Done)
    }
}

/// Put of bins into one record
pub struct WriteCommand {
    policy: WritePolicy,
    key: Key,
    bins: Vec<Bin>,
}

impl WriteCommand {
    pub fn new(policy: WritePolicy, key: Key, bins: Vec<Bin>) -> Self {
        Self { policy, key, bins }
    }
}

impl Command for WriteCommand {
    fn name(&self) -> &'static str {
        "write"
    }

    fn policy(&self) -> &Policy {
        &self.policy.base
    }

    fn is_read(&self) -> bool {
        false
    }

    fn node(&self, cluster: &Cluster, sequence: usize) -> Result<Arc<Node>> {
        key_node(cluster, &self.key, &self.policy.base, sequence, true)
    }

    fn write_buffer(&mut self, buf: &mut CommandBuffer) -> Result<()> {
        buf.set_write(&self.policy, &self.key, &self.bins)
    }

    fn parse_message(&mut self, message: &ProtoMessage) -> Result<Parsed> {
        let (_, header) = read_header(message)?;
        match header.result_code {
            result_code::OK => Ok(Parsed::Done),
            code => Err(ClientError::server(code)),
        }
    }
}

/// Delete of one record
pub struct DeleteCommand {
    policy: WritePolicy,
    key: Key,
    existed: bool,
}

impl DeleteCommand {
    pub fn new(policy: WritePolicy, key: Key) -> Self {
        Self {
            policy,
            key,
            existed: false,
        }
    }

    /// The record was present before the delete
    pub fn existed(&self) -> bool {
        self.existed
    }
}

impl Command for DeleteCommand {
    fn name(&self) -> &'static str {
        "delete"
    }

    fn policy(&self) -> &Policy {
        &self.policy.base
    }

    fn is_read(&self) -> bool {
        false
    }

    fn node(&self, cluster: &Cluster, sequence: usize) -> Result<Arc<Node>> {
        key_node(cluster, &self.key, &self.policy.base, sequence, true)
    }

    fn write_buffer(&mut self, buf: &mut CommandBuffer) -> Result<()> {
        buf.set_delete(&self.policy, &self.key)
    }

    fn parse_message(&mut self, message: &ProtoMessage) -> Result<Parsed> {
        let (_, header) = read_header(message)?;
        self.existed = match header.result_code {
            result_code::OK => true,
            result_code::KEY_NOT_FOUND_ERROR => false,
            code => return Err(ClientError::server(code)),
        };
        Ok(Parsed::Done)
    }
}
