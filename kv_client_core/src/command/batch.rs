//! Batch reads
//!
//! Keys are grouped by the node owning their partition. Nodes without batch
//! index support get one legacy request per namespace. Every per-node
//! command writes into the shared [`BatchRequest`] by key position, so
//! results come back in the caller's key order whatever order the nodes
//! answer in.

use super::buffer::{read_attr, BatchEntry, CommandBuffer, INFO1_NOBINDATA, INFO1_READ};
use super::listener::RecordSequenceListener;
use super::parse::{RecordHeader, RecordReader};
use super::{Command, Parsed};
use crate::cluster::partition::partition_id;
use crate::cluster::{Cluster, PartitionMap, Route};
use crate::config::{BatchPolicy, Policy, Replica};
use crate::error::{ClientError, Result};
use crate::key::Key;
use crate::net::ProtoMessage;
use crate::node::Node;
use crate::record::{BatchRead, Record};
use crate::result_code;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Keys of one namespace sent to a legacy node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchNamespace {
    pub namespace: String,
    pub offsets: Vec<usize>,
}

/// Keys routed to one node
#[derive(Debug, Clone)]
pub struct BatchNode {
    pub node: Arc<Node>,
    /// Positions of the keys in the request
    pub offsets: Vec<usize>,
    /// Per-namespace split, empty when the node supports batch index
    pub namespaces: Vec<BatchNamespace>,
}

impl BatchNode {
    /// Group key positions by owning node
    ///
    /// `subset` restricts the grouping to the given positions, used when a
    /// failed node command is split again against a newer partition map.
    pub fn generate_list(
        partitions: &PartitionMap,
        policy: &BatchPolicy,
        rack_id: i32,
        keys: &[Key],
        subset: Option<&[usize]>,
        sequence: usize,
    ) -> Result<Vec<BatchNode>> {
        let route = Route {
            replica: policy.base.replica,
            sequence,
            rack_id,
            is_write: false,
        };
        let offsets: Vec<usize> = match subset {
            Some(subset) => subset.to_vec(),
            None => (0..keys.len()).collect(),
        };

        let mut list: Vec<BatchNode> = Vec::new();
        for offset in offsets {
            let key = keys.get(offset).ok_or_else(|| {
                ClientError::InvalidArgument(format!("batch offset {} out of range", offset))
            })?;
            let node = partitions.node_for(&key.namespace, partition_id(&key.digest), &route)?;
            match list.iter_mut().find(|batch| Arc::ptr_eq(&batch.node, &node)) {
                Some(batch) => batch.offsets.push(offset),
                None => list.push(BatchNode {
                    node,
                    offsets: vec![offset],
                    namespaces: Vec::new(),
                }),
            }
        }

        for batch in &mut list {
            if !batch.node.use_batch_index(policy.use_batch_direct) {
                batch.split_namespaces(keys);
            }
        }
        Ok(list)
    }

    fn split_namespaces(&mut self, keys: &[Key]) {
        let mut namespaces: Vec<BatchNamespace> = Vec::new();
        for &offset in &self.offsets {
            let namespace = &keys[offset].namespace;
            match namespaces.iter_mut().find(|ns| &ns.namespace == namespace) {
                Some(ns) => ns.offsets.push(offset),
                None => namespaces.push(BatchNamespace {
                    namespace: namespace.clone(),
                    offsets: vec![offset],
                }),
            }
        }
        self.namespaces = namespaces;
    }

    /// Node gets legacy per-namespace requests
    pub fn is_direct(&self) -> bool {
        !self.namespaces.is_empty()
    }
}

/// Bin selection of one key
#[derive(Debug, Clone, PartialEq, Eq)]
struct Selection {
    bin_names: Option<Vec<String>>,
    read_attr: u8,
}

#[derive(Debug)]
enum Selections {
    Uniform(Selection),
    PerKey(Vec<Selection>),
}

/// Destination of batch rows
pub enum BatchSink {
    Records(Mutex<Vec<Option<Record>>>),
    Exists(Mutex<Vec<bool>>),
    Sequence(Arc<dyn RecordSequenceListener>),
}

/// Keys and results shared by all node commands of one batch
pub struct BatchRequest {
    keys: Vec<Key>,
    selections: Selections,
    sink: BatchSink,
    /// Set once any node command failed for good
    done: AtomicBool,
}

impl BatchRequest {
    fn new(keys: Vec<Key>, selections: Selections, sink: BatchSink) -> Self {
        Self {
            keys,
            selections,
            sink,
            done: AtomicBool::new(false),
        }
    }

    /// Read the named bins, or all bins when `bin_names` is `None`
    pub fn get(keys: Vec<Key>, bin_names: Option<Vec<String>>) -> Self {
        let read_attr = read_attr(bin_names.as_deref(), true);
        let count = keys.len();
        Self::new(
            keys,
            Selections::Uniform(Selection { bin_names, read_attr }),
            BatchSink::Records(Mutex::new(vec![None; count])),
        )
    }

    /// Read record headers only
    pub fn get_header(keys: Vec<Key>) -> Self {
        let count = keys.len();
        Self::new(
            keys,
            Selections::Uniform(Selection {
                bin_names: None,
                read_attr: INFO1_READ | INFO1_NOBINDATA,
            }),
            BatchSink::Records(Mutex::new(vec![None; count])),
        )
    }

    pub fn exists(keys: Vec<Key>) -> Self {
        let count = keys.len();
        Self::new(
            keys,
            Selections::Uniform(Selection {
                bin_names: None,
                read_attr: INFO1_READ | INFO1_NOBINDATA,
            }),
            BatchSink::Exists(Mutex::new(vec![false; count])),
        )
    }

    /// Per-key bin selections, requires batch index support on every node
    pub fn read_list(reads: &[BatchRead]) -> Self {
        let keys = reads.iter().map(|read| read.key.clone()).collect::<Vec<_>>();
        let selections = reads
            .iter()
            .map(|read| Selection {
                bin_names: read.bin_names.clone(),
                read_attr: read_attr(read.bin_names.as_deref(), read.read_all_bins),
            })
            .collect();
        let count = keys.len();
        Self::new(
            keys,
            Selections::PerKey(selections),
            BatchSink::Records(Mutex::new(vec![None; count])),
        )
    }

    /// Deliver each record to `listener` as it arrives
    pub fn sequence(keys: Vec<Key>, bin_names: Option<Vec<String>>, listener: Arc<dyn RecordSequenceListener>) -> Self {
        let read_attr = read_attr(bin_names.as_deref(), true);
        Self::new(
            keys,
            Selections::Uniform(Selection { bin_names, read_attr }),
            BatchSink::Sequence(listener),
        )
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn requires_batch_index(&self) -> bool {
        matches!(self.selections, Selections::PerKey(_))
    }

    fn selection(&self, offset: usize) -> &Selection {
        match &self.selections {
            Selections::Uniform(selection) => selection,
            Selections::PerKey(selections) => &selections[offset],
        }
    }

    fn store(&self, offset: usize, record: Option<Record>) {
        match &self.sink {
            BatchSink::Records(records) => records.lock()[offset] = record,
            BatchSink::Exists(exists) => exists.lock()[offset] = record.is_some(),
            BatchSink::Sequence(listener) => listener.on_record(&self.keys[offset], record),
        }
    }

    /// Records in key order, empty for exists and sequence requests
    pub fn take_records(&self) -> Vec<Option<Record>> {
        match &self.sink {
            BatchSink::Records(records) => std::mem::take(&mut *records.lock()),
            _ => Vec::new(),
        }
    }

    pub fn take_exists(&self) -> Vec<bool> {
        match &self.sink {
            BatchSink::Exists(exists) => std::mem::take(&mut *exists.lock()),
            _ => Vec::new(),
        }
    }

    /// Split the request into one command per node, or per namespace on legacy nodes
    pub fn plan(self: &Arc<Self>, cluster: &Cluster, policy: &BatchPolicy) -> Result<Vec<BatchCommand>> {
        let nodes = BatchNode::generate_list(
            &cluster.partition_map(),
            policy,
            cluster.policy().rack_id,
            &self.keys,
            None,
            0,
        )?;
        if self.requires_batch_index() && nodes.iter().any(BatchNode::is_direct) {
            return Err(ClientError::InvalidArgument(
                "batch read list requires batch index support on every node".to_string(),
            ));
        }
        debug!(keys = self.keys.len(), nodes = nodes.len(), "Batch planned");
        Ok(BatchCommand::from_nodes(self, policy, nodes))
    }
}

/// Batch request to one node
pub struct BatchCommand {
    request: Arc<BatchRequest>,
    policy: BatchPolicy,
    node: Arc<Node>,
    offsets: Vec<usize>,
    /// Set for legacy requests
    namespace: Option<String>,
    /// Next expected offset of a legacy response
    cursor: usize,
}

impl BatchCommand {
    pub fn from_nodes(request: &Arc<BatchRequest>, policy: &BatchPolicy, nodes: Vec<BatchNode>) -> Vec<BatchCommand> {
        let mut commands = Vec::with_capacity(nodes.len());
        for batch in nodes {
            if batch.namespaces.is_empty() {
                commands.push(Self::build(request, policy, batch.node, batch.offsets, None));
                continue;
            }
            for ns in batch.namespaces {
                commands.push(Self::build(request, policy, batch.node.clone(), ns.offsets, Some(ns.namespace)));
            }
        }
        commands
    }

    fn build(
        request: &Arc<BatchRequest>,
        policy: &BatchPolicy,
        node: Arc<Node>,
        offsets: Vec<usize>,
        namespace: Option<String>,
    ) -> Self {
        Self {
            request: request.clone(),
            policy: policy.clone(),
            node,
            offsets,
            namespace,
            cursor: 0,
        }
    }

    pub fn target(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    fn row_offset(&mut self, header: &RecordHeader) -> Result<usize> {
        let offset = if self.namespace.is_some() {
            let offset = self.offsets.get(self.cursor).copied();
            self.cursor += 1;
            offset
        } else {
            Some(header.batch_index as usize).filter(|offset| *offset < self.request.keys.len())
        };
        offset.ok_or_else(|| {
            ClientError::Parse(format!("Unexpected batch index returned: {}", header.batch_index))
        })
    }
}

impl Command for BatchCommand {
    fn name(&self) -> &'static str {
        "batch"
    }

    fn policy(&self) -> &Policy {
        &self.policy.base
    }

    fn node(&self, _cluster: &Cluster, _sequence: usize) -> Result<Arc<Node>> {
        Ok(self.node.clone())
    }

    fn write_buffer(&mut self, buf: &mut CommandBuffer) -> Result<()> {
        let request = &self.request;
        match &self.namespace {
            Some(namespace) => {
                let selection = match &request.selections {
                    Selections::Uniform(selection) => selection,
                    Selections::PerKey(_) => {
                        return Err(ClientError::InvalidArgument(
                            "batch read list requires batch index support".to_string(),
                        ))
                    }
                };
                let keys: Vec<&Key> = self.offsets.iter().map(|&offset| &request.keys[offset]).collect();
                buf.set_batch_direct(
                    &self.policy,
                    namespace,
                    &keys,
                    selection.bin_names.as_deref(),
                    selection.read_attr,
                )
            }
            None => {
                let entries: Vec<BatchEntry<'_>> = self
                    .offsets
                    .iter()
                    .map(|&offset| {
                        let selection = request.selection(offset);
                        BatchEntry {
                            index: offset as u32,
                            key: &request.keys[offset],
                            bin_names: selection.bin_names.as_deref(),
                            read_attr: selection.read_attr,
                        }
                    })
                    .collect();
                buf.set_batch_index(&self.policy, &entries)
            }
        }
    }

    fn prepare_attempt(&mut self) {
        self.cursor = 0;
    }

    fn parse_message(&mut self, message: &ProtoMessage) -> Result<Parsed> {
        let mut reader = RecordReader::new(message.body.clone());

        while reader.has_remaining() {
            let header = reader.read_header()?;
            match header.result_code {
                result_code::OK | result_code::KEY_NOT_FOUND_ERROR | result_code::FILTERED_OUT => {}
                code => return Err(ClientError::server(code)),
            }
            if header.is_last() {
                return Ok(Parsed::Done);
            }

            let key = reader.read_key(header.field_count)?;
            let offset = self.row_offset(&header)?;
            let expected = &self.request.keys[offset];
            if key.digest != Some(expected.digest) {
                return Err(ClientError::Parse(format!(
                    "Unexpected batch key returned: {},{},{}",
                    expected.namespace,
                    hex::encode(key.digest.unwrap_or_default()),
                    header.batch_index
                )));
            }

            if header.result_code == result_code::OK {
                if header.op_count > 0 && matches!(self.request.sink, BatchSink::Exists(_)) {
                    return Err(ClientError::Parse("Received bins that were not requested".to_string()));
                }
                let record = reader.read_record(&header)?;
                self.request.store(offset, Some(record));
            } else {
                reader.skip_ops(header.op_count)?;
                self.request.store(offset, None);
            }
        }
        Ok(Parsed::More)
    }

    fn is_stream(&self) -> bool {
        true
    }

    fn should_retry_batch(&self) -> bool {
        matches!(self.policy.base.replica, Replica::Sequence | Replica::PreferRack) && !self.request.is_done()
    }

    fn retry_batch(&mut self, cluster: &Cluster, sequence: usize) -> Result<Option<Vec<Box<dyn Command>>>> {
        let nodes = BatchNode::generate_list(
            &cluster.partition_map(),
            &self.policy,
            cluster.policy().rack_id,
            &self.request.keys,
            Some(&self.offsets),
            sequence,
        )?;
        if nodes.len() == 1 && Arc::ptr_eq(&nodes[0].node, &self.node) {
            return Ok(None);
        }
        debug!(node = %self.node, split = nodes.len(), "Batch retry split");
        Ok(Some(
            BatchCommand::from_nodes(&self.request, &self.policy, nodes)
                .into_iter()
                .map(|command| Box::new(command) as Box<dyn Command>)
                .collect(),
        ))
    }

    fn on_failure(&mut self) {
        self.request.mark_done();
    }
}

/// Fill the caller's batch reads from a finished read-list request
pub fn fill_batch_reads(request: &BatchRequest, reads: &mut [BatchRead]) {
    for (read, record) in reads.iter_mut().zip(request.take_records()) {
        read.record = record;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::buffer::INFO1_GET_ALL;

    struct Collect(Mutex<Vec<(String, bool)>>);

    impl RecordSequenceListener for Collect {
        fn on_record(&self, key: &Key, record: Option<Record>) {
            self.0.lock().push((key.to_string(), record.is_some()));
        }

        fn on_success(&self) {}

        fn on_failure(&self, _error: ClientError) {}
    }

    fn keys(count: i64) -> Vec<Key> {
        (0..count).map(|i| Key::new("test", "demo", i)).collect()
    }

    #[test]
    fn test_records_stored_by_offset() {
        let request = BatchRequest::get(keys(3), None);
        assert_eq!(request.selection(2).read_attr, INFO1_READ | INFO1_GET_ALL);
        request.store(2, Some(Record::default()));
        let records = request.take_records();
        assert_eq!(records.len(), 3);
        assert!(records[0].is_none());
        assert!(records[2].is_some());
    }

    #[test]
    fn test_exists_sink() {
        let request = BatchRequest::exists(keys(2));
        request.store(1, Some(Record::default()));
        request.store(0, None);
        assert_eq!(request.take_exists(), vec![false, true]);
        assert!(request.take_records().is_empty());
    }

    #[test]
    fn test_read_list_selections() {
        let reads = vec![
            BatchRead::new(Key::new("test", "demo", 1i64), vec!["a".to_string()]),
            BatchRead::all_bins(Key::new("test", "demo", 2i64)),
            BatchRead::header(Key::new("test", "demo", 3i64)),
        ];
        let request = BatchRequest::read_list(&reads);
        assert!(request.requires_batch_index());
        assert_eq!(request.selection(0).read_attr, INFO1_READ);
        assert_eq!(request.selection(1).read_attr, INFO1_READ | INFO1_GET_ALL);
        assert_eq!(request.selection(2).read_attr, INFO1_READ | INFO1_NOBINDATA);

        request.store(1, Some(Record::default()));
        let mut filled = reads.clone();
        fill_batch_reads(&request, &mut filled);
        assert!(filled[0].record.is_none());
        assert!(filled[1].record.is_some());
    }

    #[test]
    fn test_sequence_delivers_each_record() {
        let listener = Arc::new(Collect(Mutex::new(Vec::new())));
        let request = BatchRequest::sequence(keys(2), None, listener.clone());
        request.store(1, None);
        request.store(0, Some(Record::default()));
        let seen = listener.0.lock().clone();
        assert_eq!(seen.len(), 2);
        assert!(!seen[0].1);
        assert!(seen[1].1);
    }

    #[test]
    fn test_done_flag() {
        let request = BatchRequest::get(keys(1), None);
        assert!(!request.is_done());
        request.mark_done();
        assert!(request.is_done());
    }
}
