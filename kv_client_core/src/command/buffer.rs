//! Request encoding
//!
//! A request is the 8 byte proto header, the 22 byte message header, the
//! fields and the operations. Values inside operations are opaque particles.

use crate::config::{BatchPolicy, Policy, WritePolicy};
use crate::error::{ClientError, Result};
use crate::key::Key;
use crate::net::proto::{DATA_MESSAGE_TYPE, HEADER_SIZE, PROTO_VERSION};
use crate::record::Bin;
use bytes::{BufMut, BytesMut};

pub const MSG_HEADER_SIZE: usize = 22;
/// Offset of the transaction timeout inside a complete request
pub const TIMEOUT_OFFSET: usize = HEADER_SIZE + 14;

pub const INFO1_READ: u8 = 1;
pub const INFO1_GET_ALL: u8 = 1 << 1;
pub const INFO1_BATCH: u8 = 1 << 3;
pub const INFO1_NOBINDATA: u8 = 1 << 5;

pub const INFO2_WRITE: u8 = 1;
pub const INFO2_DELETE: u8 = 1 << 1;
pub const INFO2_GENERATION: u8 = 1 << 2;

pub const INFO3_LAST: u8 = 1;

pub const FIELD_NAMESPACE: u8 = 0;
pub const FIELD_SET: u8 = 1;
pub const FIELD_KEY: u8 = 2;
pub const FIELD_DIGEST: u8 = 4;
pub const FIELD_DIGEST_ARRAY: u8 = 6;
pub const FIELD_BATCH_INDEX: u8 = 41;

pub const OP_READ: u8 = 1;
pub const OP_WRITE: u8 = 2;

const FIELD_HEADER_SIZE: usize = 5;
const OP_HEADER_SIZE: usize = 8;
const DIGEST_SIZE: usize = 20;

/// One key of a batch index request
pub struct BatchEntry<'a> {
    /// Position of the key in the caller's key list
    pub index: u32,
    pub key: &'a Key,
    pub bin_names: Option<&'a [String]>,
    pub read_attr: u8,
}

/// Reusable request buffer
#[derive(Debug, Default)]
pub struct CommandBuffer {
    buf: BytesMut,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn begin(&mut self) {
        self.buf.clear();
        self.buf.put_bytes(0, HEADER_SIZE + MSG_HEADER_SIZE);
    }

    #[allow(clippy::too_many_arguments)]
    fn write_header(
        &mut self,
        info1: u8,
        info2: u8,
        info3: u8,
        generation: u32,
        expiration: u32,
        timeout_ms: u64,
        field_count: usize,
        op_count: usize,
    ) -> Result<()> {
        let field_count = u16::try_from(field_count)
            .map_err(|_| ClientError::InvalidArgument("too many fields".to_string()))?;
        let op_count = u16::try_from(op_count)
            .map_err(|_| ClientError::InvalidArgument("too many operations".to_string()))?;

        let header = &mut self.buf[HEADER_SIZE..HEADER_SIZE + MSG_HEADER_SIZE];
        header[0] = MSG_HEADER_SIZE as u8;
        header[1] = info1;
        header[2] = info2;
        header[3] = info3;
        header[4] = 0;
        header[5] = 0;
        header[6..10].copy_from_slice(&generation.to_be_bytes());
        header[10..14].copy_from_slice(&expiration.to_be_bytes());
        header[14..18].copy_from_slice(&clamp_timeout(timeout_ms).to_be_bytes());
        header[18..20].copy_from_slice(&field_count.to_be_bytes());
        header[20..22].copy_from_slice(&op_count.to_be_bytes());
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        let size = (self.buf.len() - HEADER_SIZE) as u64;
        if size > 0xFFFF_FFFF_FFFF {
            return Err(ClientError::InvalidArgument(format!("request of {} bytes is too large", size)));
        }
        let word = size | (u64::from(PROTO_VERSION) << 56) | (u64::from(DATA_MESSAGE_TYPE) << 48);
        self.buf[..HEADER_SIZE].copy_from_slice(&word.to_be_bytes());
        Ok(())
    }

    /// Overwrite the transaction timeout after the total timeout shrank
    pub fn patch_total_timeout(&mut self, timeout_ms: u64) {
        if self.buf.len() >= TIMEOUT_OFFSET + 4 {
            self.buf[TIMEOUT_OFFSET..TIMEOUT_OFFSET + 4].copy_from_slice(&clamp_timeout(timeout_ms).to_be_bytes());
        }
    }

    fn write_field(&mut self, field_type: u8, data: &[u8]) {
        self.buf.put_u32(data.len() as u32 + 1);
        self.buf.put_u8(field_type);
        self.buf.put_slice(data);
    }

    fn write_field_header(&mut self, size: usize, field_type: u8) {
        self.buf.put_u32(size as u32 + 1);
        self.buf.put_u8(field_type);
    }

    /// Namespace, set, digest and optionally the user key, returns the field count
    fn write_key(&mut self, key: &Key, send_key: bool) -> usize {
        let mut count = 0;
        if !key.namespace.is_empty() {
            self.write_field(FIELD_NAMESPACE, key.namespace.as_bytes());
            count += 1;
        }
        if !key.set_name.is_empty() {
            self.write_field(FIELD_SET, key.set_name.as_bytes());
            count += 1;
        }
        self.write_field(FIELD_DIGEST, &key.digest);
        count += 1;

        if let (true, Some(user_key)) = (send_key, &key.user_key) {
            let bytes = user_key.to_bytes();
            self.write_field_header(bytes.len() + 1, FIELD_KEY);
            self.buf.put_u8(user_key.particle_type());
            self.buf.put_slice(&bytes);
            count += 1;
        }
        count
    }

    fn write_read_op(&mut self, name: &str) -> Result<()> {
        let name_len = checked_name(name)?;
        self.buf.put_u32((4 + name_len) as u32);
        self.buf.put_u8(OP_READ);
        self.buf.put_u8(0);
        self.buf.put_u8(0);
        self.buf.put_u8(name_len as u8);
        self.buf.put_slice(name.as_bytes());
        Ok(())
    }

    fn write_bin(&mut self, bin: &Bin) -> Result<()> {
        let name_len = checked_name(&bin.name)?;
        self.buf.put_u32((4 + name_len + bin.value.data.len()) as u32);
        self.buf.put_u8(OP_WRITE);
        self.buf.put_u8(bin.value.particle_type);
        self.buf.put_u8(0);
        self.buf.put_u8(name_len as u8);
        self.buf.put_slice(bin.name.as_bytes());
        self.buf.put_slice(&bin.value.data);
        Ok(())
    }

    /// Read the named bins, or every bin when `bin_names` is `None`
    pub fn set_read(&mut self, policy: &Policy, key: &Key, bin_names: Option<&[String]>) -> Result<()> {
        self.begin();
        let field_count = self.write_key(key, policy.send_key);
        match bin_names {
            Some(names) if !names.is_empty() => {
                for name in names {
                    self.write_read_op(name)?;
                }
                self.write_header(INFO1_READ, 0, 0, 0, 0, policy.total_timeout_ms, field_count, names.len())?;
            }
            _ => {
                self.write_header(
                    INFO1_READ | INFO1_GET_ALL,
                    0,
                    0,
                    0,
                    0,
                    policy.total_timeout_ms,
                    field_count,
                    0,
                )?;
            }
        }
        self.end()
    }

    /// Read generation and expiration only
    pub fn set_read_header(&mut self, policy: &Policy, key: &Key) -> Result<()> {
        self.begin();
        let field_count = self.write_key(key, policy.send_key);
        self.write_header(INFO1_READ | INFO1_NOBINDATA, 0, 0, 0, 0, policy.total_timeout_ms, field_count, 0)?;
        self.end()
    }

    pub fn set_exists(&mut self, policy: &Policy, key: &Key) -> Result<()> {
        self.set_read_header(policy, key)
    }

    pub fn set_write(&mut self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> Result<()> {
        self.begin();
        let field_count = self.write_key(key, policy.base.send_key);
        for bin in bins {
            self.write_bin(bin)?;
        }
        let info2 = if policy.generation > 0 {
            INFO2_WRITE | INFO2_GENERATION
        } else {
            INFO2_WRITE
        };
        self.write_header(
            0,
            info2,
            0,
            policy.generation,
            policy.expiration,
            policy.base.total_timeout_ms,
            field_count,
            bins.len(),
        )?;
        self.end()
    }

    pub fn set_delete(&mut self, policy: &WritePolicy, key: &Key) -> Result<()> {
        self.begin();
        let field_count = self.write_key(key, false);
        let info2 = if policy.generation > 0 {
            INFO2_WRITE | INFO2_DELETE | INFO2_GENERATION
        } else {
            INFO2_WRITE | INFO2_DELETE
        };
        self.write_header(0, info2, 0, policy.generation, 0, policy.base.total_timeout_ms, field_count, 0)?;
        self.end()
    }

    /// Batch index request
    ///
    /// A key with the same namespace and bin selection as the previous key
    /// only carries the repeat flag instead of its own namespace and ops.
    pub fn set_batch_index(&mut self, policy: &BatchPolicy, entries: &[BatchEntry<'_>]) -> Result<()> {
        self.begin();
        let count = u32::try_from(entries.len())
            .map_err(|_| ClientError::InvalidArgument("too many batch keys".to_string()))?;

        let field_start = self.buf.len();
        self.write_field_header(0, FIELD_BATCH_INDEX);
        self.buf.put_u32(count);
        self.buf.put_u8(u8::from(policy.allow_inline));

        let mut previous: Option<&BatchEntry<'_>> = None;
        for entry in entries {
            self.buf.put_u32(entry.index);
            self.buf.put_slice(&entry.key.digest);

            let repeat = previous.map_or(false, |prev| {
                prev.key.namespace == entry.key.namespace
                    && prev.bin_names == entry.bin_names
                    && prev.read_attr == entry.read_attr
            });
            if repeat {
                self.buf.put_u8(1);
            } else {
                let names = entry.bin_names.unwrap_or(&[]);
                let op_count = u16::try_from(names.len())
                    .map_err(|_| ClientError::InvalidArgument("too many bins".to_string()))?;
                self.buf.put_u8(0);
                self.buf.put_u8(entry.read_attr);
                self.buf.put_u16(1);
                self.buf.put_u16(op_count);
                self.write_field(FIELD_NAMESPACE, entry.key.namespace.as_bytes());
                for name in names {
                    self.write_read_op(name)?;
                }
            }
            previous = Some(entry);
        }

        let field_size = (self.buf.len() - field_start - FIELD_HEADER_SIZE + 1) as u32;
        self.buf[field_start..field_start + 4].copy_from_slice(&field_size.to_be_bytes());

        self.write_header(
            INFO1_READ | INFO1_BATCH,
            0,
            0,
            0,
            0,
            policy.base.total_timeout_ms,
            1,
            0,
        )?;
        self.end()
    }

    /// Legacy batch request for keys of a single namespace
    pub fn set_batch_direct(
        &mut self,
        policy: &BatchPolicy,
        namespace: &str,
        keys: &[&Key],
        bin_names: Option<&[String]>,
        read_attr: u8,
    ) -> Result<()> {
        self.begin();
        self.write_field(FIELD_NAMESPACE, namespace.as_bytes());
        self.write_field_header(keys.len() * DIGEST_SIZE, FIELD_DIGEST_ARRAY);
        for key in keys {
            self.buf.put_slice(&key.digest);
        }

        let names = bin_names.unwrap_or(&[]);
        for name in names {
            self.write_read_op(name)?;
        }
        self.write_header(read_attr, 0, 0, 0, 0, policy.base.total_timeout_ms, 2, names.len())?;
        self.end()
    }
}

fn clamp_timeout(timeout_ms: u64) -> u32 {
    u32::try_from(timeout_ms).unwrap_or(u32::MAX)
}

fn checked_name(name: &str) -> Result<usize> {
    if name.len() > u8::MAX as usize {
        return Err(ClientError::InvalidArgument(format!("bin name {} is too long", name)));
    }
    Ok(name.len())
}

/// Read attributes for a bin selection
pub fn read_attr(bin_names: Option<&[String]>, read_all_bins: bool) -> u8 {
    match bin_names {
        Some(names) if !names.is_empty() => INFO1_READ,
        _ if read_all_bins => INFO1_READ | INFO1_GET_ALL,
        _ => INFO1_READ | INFO1_NOBINDATA,
    }
}
