//! Response decoding
//!
//! Responses carry one record per 22 byte message header. Single record
//! commands receive one record; batch commands receive a stream of messages
//! holding many records, terminated by a header with the last flag.

use super::buffer::{FIELD_DIGEST, FIELD_NAMESPACE, INFO3_LAST};
use crate::error::{ClientError, Result};
use crate::record::{Particle, Record};
use bytes::Bytes;
use std::collections::HashMap;

/// Decoded message header of one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub result_code: i32,
    pub info3: u8,
    pub generation: u32,
    pub expiration: u32,
    /// Position of the key in a batch index request
    pub batch_index: u32,
    pub field_count: u16,
    pub op_count: u16,
}

impl RecordHeader {
    pub fn is_last(&self) -> bool {
        self.info3 & INFO3_LAST != 0
    }
}

/// Digest and namespace fields of a returned record
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecordKey {
    pub namespace: Option<String>,
    pub digest: Option<[u8; 20]>,
}

/// Cursor over the records of one message body
pub struct RecordReader {
    body: Bytes,
    offset: usize,
}

impl RecordReader {
    pub fn new(body: Bytes) -> Self {
        Self { body, offset: 0 }
    }

    pub fn has_remaining(&self) -> bool {
        self.offset < self.body.len()
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.body.len())
            .ok_or_else(|| {
                ClientError::Parse(format!(
                    "record truncated: need {} bytes at offset {} of {}",
                    len,
                    self.offset,
                    self.body.len()
                ))
            })?;
        let slice = &self.body[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn take_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_header(&mut self) -> Result<RecordHeader> {
        let header_size = *self
            .body
            .get(self.offset)
            .ok_or_else(|| ClientError::Parse("missing record header".to_string()))? as usize;
        if header_size < 22 {
            return Err(ClientError::Parse(format!("invalid record header size {}", header_size)));
        }
        let h = self.take(header_size)?;
        Ok(RecordHeader {
            result_code: i32::from(h[5]),
            info3: h[3],
            generation: u32::from_be_bytes([h[6], h[7], h[8], h[9]]),
            expiration: u32::from_be_bytes([h[10], h[11], h[12], h[13]]),
            batch_index: u32::from_be_bytes([h[14], h[15], h[16], h[17]]),
            field_count: u16::from_be_bytes([h[18], h[19]]),
            op_count: u16::from_be_bytes([h[20], h[21]]),
        })
    }

    /// Read the fields of a record, keeping namespace and digest
    pub fn read_key(&mut self, field_count: u16) -> Result<RecordKey> {
        let mut key = RecordKey::default();
        for _ in 0..field_count {
            let size = self.take_u32()? as usize;
            if size == 0 {
                return Err(ClientError::Parse("empty field".to_string()));
            }
            let field_type = self.take(1)?[0];
            let data = self.take(size - 1)?;
            match field_type {
                FIELD_DIGEST if data.len() == 20 => {
                    let mut digest = [0u8; 20];
                    digest.copy_from_slice(data);
                    key.digest = Some(digest);
                }
                FIELD_NAMESPACE => {
                    key.namespace = Some(String::from_utf8_lossy(data).into_owned());
                }
                _ => {}
            }
        }
        Ok(key)
    }

    /// Read the bins of a record
    pub fn read_record(&mut self, header: &RecordHeader) -> Result<Record> {
        let mut bins = HashMap::with_capacity(header.op_count as usize);
        for _ in 0..header.op_count {
            let size = self.take_u32()? as usize;
            let op = self.take(4)?;
            let particle_type = op[1];
            let name_len = op[3] as usize;
            let value_len = size
                .checked_sub(4 + name_len)
                .ok_or_else(|| ClientError::Parse(format!("invalid op size {}", size)))?;
            let name = String::from_utf8_lossy(self.take(name_len)?).into_owned();
            let start = self.offset;
            self.take(value_len)?;
            let data = self.body.slice(start..start + value_len);
            bins.insert(name, Particle { particle_type, data });
        }
        Ok(Record {
            bins,
            generation: header.generation,
            expiration: header.expiration,
        })
    }

    /// Skip the bins of a record
    pub fn skip_ops(&mut self, op_count: u16) -> Result<()> {
        for _ in 0..op_count {
            let size = self.take_u32()? as usize;
            self.take(size)?;
        }
        Ok(())
    }
}
