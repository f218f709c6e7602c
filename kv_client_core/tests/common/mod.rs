//! In-memory cluster used by the integration tests
//!
//! Every node answers the info, admin and data protocols from a shared
//! record store. Connections are routed by port. Faults queued with
//! [`MockCluster::push_fault`] are consumed by the next data requests.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use kv_client_core::auth::AdminAuthenticator;
use kv_client_core::cluster::PARTITIONS;
use kv_client_core::net::proto::{
    ProtoHeader, ProtoMessage, ADMIN_MESSAGE_TYPE, DATA_MESSAGE_TYPE, HEADER_SIZE, INFO_MESSAGE_TYPE,
};
use kv_client_core::net::{AsyncConnection, AsyncConnector, Connection, Connector, Host};
use kv_client_core::{ClientConfig, ClientError, Connectors, Key, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const INFO1_GET_ALL: u8 = 1 << 1;
const INFO1_NOBINDATA: u8 = 1 << 5;
const INFO2_WRITE: u8 = 1;
const INFO2_DELETE: u8 = 1 << 1;
const INFO2_GENERATION: u8 = 1 << 2;
const INFO3_LAST: u8 = 1;

const FIELD_NAMESPACE: u8 = 0;
const FIELD_DIGEST: u8 = 4;
const FIELD_DIGEST_ARRAY: u8 = 6;
const FIELD_BATCH_INDEX: u8 = 41;

const OK: u8 = 0;
const KEY_NOT_FOUND: u8 = 2;
const GENERATION_ERROR: u8 = 3;
pub const SERVER_TIMEOUT: u8 = 9;
pub const GENERATION_MISMATCH: u8 = GENERATION_ERROR;

const ADMIN_AUTHENTICATE: u8 = 0;
const ADMIN_LOGIN: u8 = 20;
const ADMIN_FIELD_USER: u8 = 0;
const ADMIN_FIELD_CLEAR_PASSWORD: u8 = 4;
const ADMIN_FIELD_SESSION_TOKEN: u8 = 5;
const ADMIN_FIELD_SESSION_TTL: u8 = 6;
const ADMIN_HEADER_SIZE: usize = 16;
const SECURITY_NOT_ENABLED: u8 = 52;
pub const NOT_AUTHENTICATED: u8 = 80;
pub const INVALID_CREDENTIAL: u8 = 65;

pub const BASE_PORT: u16 = 3100;

/// Failure injected into the next data request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Never answer, sync reads time out after the socket timeout
    Hang,
    /// Drop the connection after the request was received
    Reset,
    /// Answer with a result code instead of executing
    Code(u8),
}

#[derive(Debug, Clone)]
struct StoredRecord {
    bins: Vec<(String, u8, Vec<u8>)>,
    generation: u32,
}

#[derive(Debug, Clone)]
struct MockNode {
    name: String,
    port: u16,
    features: String,
    namespaces: Vec<String>,
    masters: Vec<usize>,
    proles: Vec<usize>,
    partition_generation: i64,
    peers_generation: i64,
    down: bool,
    /// Ports listed as peers, every other live node when unset
    peers: Option<Vec<u16>>,
    info: HashMap<String, String>,
}

/// Users and sessions of a cluster with security enabled
#[derive(Debug, Default)]
struct Security {
    user: String,
    password: String,
    tokens: HashSet<Vec<u8>>,
    issued: usize,
    logins: usize,
    authentications: usize,
}

#[derive(Default)]
struct State {
    nodes: Vec<MockNode>,
    records: HashMap<(String, [u8; 20]), StoredRecord>,
    faults: VecDeque<Fault>,
    requests_by_node: HashMap<String, usize>,
    security: Option<Security>,
}

#[derive(Default)]
pub struct MockCluster {
    state: Mutex<State>,
    data_requests: AtomicUsize,
    batch_index_requests: AtomicUsize,
    batch_direct_requests: AtomicUsize,
    connects: AtomicUsize,
}

enum Reply {
    Message(Bytes),
    Hang,
    Reset,
}

impl MockCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Cluster of `count` nodes named `A`, `B`, ... splitting the partitions evenly
    pub fn with_nodes(count: usize) -> Arc<Self> {
        let mock = Self::new();
        let share = PARTITIONS / count;
        for i in 0..count {
            let end = if i + 1 == count { PARTITIONS } else { (i + 1) * share };
            mock.add_node(&node_name(i), BASE_PORT + i as u16, i * share..end);
        }
        mock
    }

    /// Add a node mastering `partitions` of every namespace
    pub fn add_node(&self, name: &str, port: u16, partitions: Range<usize>) {
        self.state.lock().nodes.push(MockNode {
            name: name.to_string(),
            port,
            features: "peers;replicas;batch-index".to_string(),
            namespaces: vec!["test".to_string()],
            masters: partitions.collect(),
            proles: Vec::new(),
            partition_generation: 1,
            peers_generation: 1,
            down: false,
            peers: None,
            info: HashMap::new(),
        });
    }

    pub fn connectors(self: &Arc<Self>) -> Connectors {
        let connector = Arc::new(MockConnector { cluster: self.clone() });
        Connectors {
            sync: connector.clone(),
            asynchronous: connector,
            authenticator: Arc::new(AdminAuthenticator),
        }
    }

    /// Client configuration seeded with the first node
    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::default();
        config.cluster.seeds = vec![format!("127.0.0.1:{}", BASE_PORT)];
        config.cluster.tend_interval_ms = 60_000;
        config.cluster.connection_timeout_ms = 200;
        config
    }

    fn with_node<F: FnOnce(&mut MockNode)>(&self, port: u16, f: F) {
        let mut state = self.state.lock();
        if let Some(node) = state.nodes.iter_mut().find(|n| n.port == port) {
            f(node);
        }
    }

    pub fn set_features(&self, port: u16, features: &str) {
        self.with_node(port, |node| node.features = features.to_string());
    }

    pub fn set_namespaces(&self, port: u16, namespaces: &[&str]) {
        self.with_node(port, |node| node.namespaces = namespaces.iter().map(|s| s.to_string()).collect());
    }

    /// Reassign ownership and bump the partition generation
    pub fn set_partitions(&self, port: u16, masters: Range<usize>, proles: Range<usize>) {
        self.with_node(port, |node| {
            node.masters = masters.collect();
            node.proles = proles.collect();
            node.partition_generation += 1;
        });
    }

    pub fn rename(&self, port: u16, name: &str) {
        self.with_node(port, |node| node.name = name.to_string());
    }

    pub fn set_down(&self, port: u16, down: bool) {
        self.with_node(port, |node| node.down = down);
    }

    pub fn set_info(&self, port: u16, name: &str, value: &str) {
        self.with_node(port, |node| {
            node.info.insert(name.to_string(), value.to_string());
        });
    }

    /// Advertise exactly `peers` from the node at `port`
    pub fn set_peers(&self, port: u16, peers: &[u16]) {
        self.with_node(port, |node| {
            node.peers = Some(peers.to_vec());
            node.peers_generation += 1;
        });
    }

    /// Drop the node at `port` from every other node's peer list
    ///
    /// The node itself keeps answering.
    pub fn leave(&self, port: u16) {
        let mut state = self.state.lock();
        let ports: Vec<u16> = state.nodes.iter().map(|n| n.port).collect();
        for node in state.nodes.iter_mut().filter(|n| n.port != port) {
            let own = node.port;
            let current = node
                .peers
                .take()
                .unwrap_or_else(|| ports.iter().copied().filter(|p| *p != own).collect());
            node.peers = Some(current.into_iter().filter(|p| *p != port).collect());
            node.peers_generation += 1;
        }
    }

    /// Require a login with `user` and `password`
    pub fn enable_security(&self, user: &str, password: &str) {
        self.state.lock().security = Some(Security {
            user: user.to_string(),
            password: password.to_string(),
            ..Security::default()
        });
    }

    /// Invalidate every session token issued so far
    pub fn expire_sessions(&self) {
        if let Some(security) = self.state.lock().security.as_mut() {
            security.tokens.clear();
        }
    }

    /// Successful logins
    pub fn logins(&self) -> usize {
        self.state.lock().security.as_ref().map_or(0, |s| s.logins)
    }

    /// Authenticate calls with a valid token
    pub fn authentications(&self) -> usize {
        self.state.lock().security.as_ref().map_or(0, |s| s.authentications)
    }

    pub fn push_fault(&self, fault: Fault) {
        self.state.lock().faults.push_back(fault);
    }

    pub fn put_record(&self, key: &Key, bins: &[(&str, i64)]) {
        let bins = bins
            .iter()
            .map(|(name, value)| (name.to_string(), 1u8, value.to_be_bytes().to_vec()))
            .collect();
        self.state
            .lock()
            .records
            .insert((key.namespace.clone(), key.digest), StoredRecord { bins, generation: 1 });
    }

    pub fn has_record(&self, key: &Key) -> bool {
        self.state.lock().records.contains_key(&(key.namespace.clone(), key.digest))
    }

    pub fn data_requests(&self) -> usize {
        self.data_requests.load(Ordering::SeqCst)
    }

    pub fn batch_index_requests(&self) -> usize {
        self.batch_index_requests.load(Ordering::SeqCst)
    }

    pub fn batch_direct_requests(&self) -> usize {
        self.batch_direct_requests.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Data requests served by the node currently named `name`
    pub fn requests_served_by(&self, name: &str) -> usize {
        self.state.lock().requests_by_node.get(name).copied().unwrap_or(0)
    }

    fn check_reachable(&self, host: &Host) -> Result<()> {
        let state = self.state.lock();
        match state.nodes.iter().find(|n| n.port == host.port) {
            Some(node) if !node.down => Ok(()),
            _ => Err(ClientError::Connection(format!("connection refused: {}", host))),
        }
    }

    fn handle(&self, port: u16, request: &[u8]) -> Result<Reply> {
        if request.len() < HEADER_SIZE {
            return Err(ClientError::Parse("short request".to_string()));
        }
        let mut word = [0u8; HEADER_SIZE];
        word.copy_from_slice(&request[..HEADER_SIZE]);
        let header = ProtoHeader::from_bytes(&word)?;
        let body = &request[HEADER_SIZE..];

        let mut state = self.state.lock();
        let node = state
            .nodes
            .iter()
            .find(|n| n.port == port)
            .cloned()
            .ok_or_else(|| ClientError::Connection("node is gone".to_string()))?;
        if node.down {
            return Ok(Reply::Reset);
        }

        match header.msg_type {
            INFO_MESSAGE_TYPE => Ok(Reply::Message(info_response(&state, &node, body))),
            ADMIN_MESSAGE_TYPE => Ok(Reply::Message(admin_response(&mut state, body)?)),
            DATA_MESSAGE_TYPE => {
                self.data_requests.fetch_add(1, Ordering::SeqCst);
                *state.requests_by_node.entry(node.name.clone()).or_insert(0) += 1;
                match state.faults.pop_front() {
                    Some(Fault::Hang) => return Ok(Reply::Hang),
                    Some(Fault::Reset) => return Ok(Reply::Reset),
                    Some(Fault::Code(code)) => {
                        let mut out = BytesMut::new();
                        encode_row(&mut out, code, INFO3_LAST, 0, 0, None, &[]);
                        return Ok(Reply::Message(frame(out)));
                    }
                    None => {}
                }
                let request = DataRequest::parse(body)?;
                if request.batch_index.is_some() {
                    self.batch_index_requests.fetch_add(1, Ordering::SeqCst);
                }
                if request.digest_array.is_some() {
                    self.batch_direct_requests.fetch_add(1, Ordering::SeqCst);
                }
                Ok(Reply::Message(execute(&mut state, request)))
            }
            other => Err(ClientError::Parse(format!("unsupported message type {}", other))),
        }
    }
}

pub fn node_name(index: usize) -> String {
    ((b'A' + index as u8) as char).to_string()
}

fn bitmap(partitions: &[usize]) -> String {
    let mut bitmap = vec![0u8; PARTITIONS / 8];
    for id in partitions {
        bitmap[id >> 3] |= 0x80 >> (id & 7);
    }
    STANDARD.encode(bitmap)
}

fn info_response(state: &State, node: &MockNode, body: &[u8]) -> Bytes {
    let text = String::from_utf8_lossy(body);
    let mut out = String::new();
    for name in text.split('\n').filter(|n| !n.is_empty()) {
        let value = match name {
            "node" => node.name.clone(),
            "partition-generation" => node.partition_generation.to_string(),
            "peers-generation" => node.peers_generation.to_string(),
            "rebalance-generation" => "1".to_string(),
            "features" => node.features.clone(),
            "services" | "services-alternate" => String::new(),
            "peers-clear-std" | "peers-clear-alt" => {
                let peers: Vec<String> = state
                    .nodes
                    .iter()
                    .filter(|n| n.port != node.port && !n.down)
                    .filter(|n| node.peers.as_ref().map_or(true, |ports| ports.contains(&n.port)))
                    .map(|n| format!("[{},,[127.0.0.1:{}]]", n.name, n.port))
                    .collect();
                format!("{},{},[{}]", node.peers_generation, BASE_PORT, peers.join(","))
            }
            "replicas" => node
                .namespaces
                .iter()
                .map(|ns| format!("{}:0,2,{},{}", ns, bitmap(&node.masters), bitmap(&node.proles)))
                .collect::<Vec<_>>()
                .join(";"),
            "replicas-master" => node
                .namespaces
                .iter()
                .map(|ns| format!("{}:{}", ns, bitmap(&node.masters)))
                .collect::<Vec<_>>()
                .join(";"),
            "rack-ids" => node
                .namespaces
                .iter()
                .map(|ns| format!("{}:0", ns))
                .collect::<Vec<_>>()
                .join(";"),
            other => node.info.get(other).cloned().unwrap_or_default(),
        };
        out.push_str(name);
        out.push('\t');
        out.push_str(&value);
        out.push('\n');
    }
    ProtoMessage::new(INFO_MESSAGE_TYPE, Bytes::from(out)).to_bytes()
}

fn admin_response(state: &mut State, body: &[u8]) -> Result<Bytes> {
    if body.len() < ADMIN_HEADER_SIZE {
        return Err(ClientError::Parse("short admin request".to_string()));
    }
    let command = body[2];
    let mut cursor = Cursor {
        data: body,
        offset: ADMIN_HEADER_SIZE,
    };
    let mut fields = HashMap::new();
    for _ in 0..body[3] {
        let size = cursor.u32()? as usize;
        let id = cursor.u8()?;
        fields.insert(id, cursor.take(size - 1)?.to_vec());
    }

    let security = match state.security.as_mut() {
        Some(security) => security,
        None => return Ok(admin_reply(SECURITY_NOT_ENABLED, &[])),
    };
    let user_matches = fields.get(&ADMIN_FIELD_USER).map(|u| &u[..]) == Some(security.user.as_bytes());

    match command {
        ADMIN_LOGIN => {
            let password_matches =
                fields.get(&ADMIN_FIELD_CLEAR_PASSWORD).map(|p| &p[..]) == Some(security.password.as_bytes());
            if !user_matches || !password_matches {
                return Ok(admin_reply(INVALID_CREDENTIAL, &[]));
            }
            security.issued += 1;
            security.logins += 1;
            let token = format!("session-{}", security.issued).into_bytes();
            security.tokens.insert(token.clone());
            let ttl = 600u32.to_be_bytes();
            Ok(admin_reply(
                OK,
                &[(ADMIN_FIELD_SESSION_TOKEN, &token[..]), (ADMIN_FIELD_SESSION_TTL, &ttl[..])],
            ))
        }
        ADMIN_AUTHENTICATE => {
            let valid = user_matches
                && fields
                    .get(&ADMIN_FIELD_SESSION_TOKEN)
                    .map_or(false, |token| security.tokens.contains(token));
            if !valid {
                return Ok(admin_reply(NOT_AUTHENTICATED, &[]));
            }
            security.authentications += 1;
            Ok(admin_reply(OK, &[]))
        }
        other => Err(ClientError::Parse(format!("unsupported admin command {}", other))),
    }
}

fn admin_reply(result: u8, fields: &[(u8, &[u8])]) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u8(0);
    body.put_u8(result);
    body.put_u8(0);
    body.put_u8(fields.len() as u8);
    body.put_bytes(0, ADMIN_HEADER_SIZE - 4);
    for (id, data) in fields {
        body.put_u32(data.len() as u32 + 1);
        body.put_u8(*id);
        body.put_slice(data);
    }
    ProtoMessage::new(ADMIN_MESSAGE_TYPE, body.freeze()).to_bytes()
}

/// Decoded data request
struct DataRequest {
    info1: u8,
    info2: u8,
    generation: u32,
    namespace: String,
    digest: Option<[u8; 20]>,
    digest_array: Option<Vec<[u8; 20]>>,
    batch_index: Option<Vec<BatchKey>>,
    ops: Vec<(u8, String, u8, Vec<u8>)>,
}

struct BatchKey {
    index: u32,
    digest: [u8; 20],
    namespace: String,
    read_attr: u8,
    bin_names: Vec<String>,
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.offset + len;
        if end > self.data.len() {
            return Err(ClientError::Parse("request truncated".to_string()));
        }
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn digest(&mut self) -> Result<[u8; 20]> {
        let mut digest = [0u8; 20];
        digest.copy_from_slice(self.take(20)?);
        Ok(digest)
    }

    fn op(&mut self) -> Result<(u8, String, u8, Vec<u8>)> {
        let size = self.u32()? as usize;
        let op_type = self.u8()?;
        let particle_type = self.u8()?;
        self.u8()?;
        let name_len = self.u8()? as usize;
        let name = String::from_utf8_lossy(self.take(name_len)?).into_owned();
        let value = self.take(size - 4 - name_len)?.to_vec();
        Ok((op_type, name, particle_type, value))
    }
}

impl DataRequest {
    fn parse(body: &[u8]) -> Result<DataRequest> {
        let mut cursor = Cursor { data: body, offset: 0 };
        let header = cursor.take(22)?;
        let field_count = u16::from_be_bytes([header[18], header[19]]);
        let op_count = u16::from_be_bytes([header[20], header[21]]);
        let mut request = DataRequest {
            info1: header[1],
            info2: header[2],
            generation: u32::from_be_bytes([header[6], header[7], header[8], header[9]]),
            namespace: String::new(),
            digest: None,
            digest_array: None,
            batch_index: None,
            ops: Vec::new(),
        };

        for _ in 0..field_count {
            let size = cursor.u32()? as usize;
            let field_type = cursor.u8()?;
            let data = cursor.take(size - 1)?;
            match field_type {
                FIELD_NAMESPACE => request.namespace = String::from_utf8_lossy(data).into_owned(),
                FIELD_DIGEST => {
                    let mut digest = [0u8; 20];
                    digest.copy_from_slice(data);
                    request.digest = Some(digest);
                }
                FIELD_DIGEST_ARRAY => {
                    let mut inner = Cursor { data, offset: 0 };
                    let mut digests = Vec::new();
                    while inner.offset < data.len() {
                        digests.push(inner.digest()?);
                    }
                    request.digest_array = Some(digests);
                }
                FIELD_BATCH_INDEX => request.batch_index = Some(parse_batch_index(data)?),
                _ => {}
            }
        }
        for _ in 0..op_count {
            request.ops.push(cursor.op()?);
        }
        Ok(request)
    }
}

fn parse_batch_index(data: &[u8]) -> Result<Vec<BatchKey>> {
    let mut cursor = Cursor { data, offset: 0 };
    let count = cursor.u32()?;
    cursor.u8()?;

    let mut keys: Vec<BatchKey> = Vec::new();
    for _ in 0..count {
        let index = cursor.u32()?;
        let digest = cursor.digest()?;
        if cursor.u8()? == 1 {
            let previous = keys
                .last()
                .ok_or_else(|| ClientError::Parse("repeat flag on first key".to_string()))?;
            keys.push(BatchKey {
                index,
                digest,
                namespace: previous.namespace.clone(),
                read_attr: previous.read_attr,
                bin_names: previous.bin_names.clone(),
            });
            continue;
        }
        let read_attr = cursor.u8()?;
        let field_count = cursor.u16()?;
        let op_count = cursor.u16()?;
        let mut namespace = String::new();
        for _ in 0..field_count {
            let size = cursor.u32()? as usize;
            let field_type = cursor.u8()?;
            let value = cursor.take(size - 1)?;
            if field_type == FIELD_NAMESPACE {
                namespace = String::from_utf8_lossy(value).into_owned();
            }
        }
        let mut bin_names = Vec::new();
        for _ in 0..op_count {
            bin_names.push(cursor.op()?.1);
        }
        keys.push(BatchKey {
            index,
            digest,
            namespace,
            read_attr,
            bin_names,
        });
    }
    Ok(keys)
}

fn selected_bins<'a>(record: &'a StoredRecord, read_attr: u8, bin_names: &[String]) -> Vec<(&'a str, u8, &'a [u8])> {
    if read_attr & INFO1_NOBINDATA != 0 {
        return Vec::new();
    }
    record
        .bins
        .iter()
        .filter(|(name, _, _)| read_attr & INFO1_GET_ALL != 0 || bin_names.contains(name))
        .map(|(name, particle_type, value)| (name.as_str(), *particle_type, value.as_slice()))
        .collect()
}

fn execute(state: &mut State, request: DataRequest) -> Bytes {
    let mut out = BytesMut::new();

    if let Some(keys) = &request.batch_index {
        for key in keys {
            match state.records.get(&(key.namespace.clone(), key.digest)) {
                Some(record) => {
                    let bins = selected_bins(record, key.read_attr, &key.bin_names);
                    encode_row(&mut out, OK, 0, key.index, record.generation, Some(key.digest), &bins);
                }
                None => encode_row(&mut out, KEY_NOT_FOUND, 0, key.index, 0, Some(key.digest), &[]),
            }
        }
        return batch_response(out);
    }

    if let Some(digests) = &request.digest_array {
        let bin_names: Vec<String> = request.ops.iter().map(|op| op.1.clone()).collect();
        for digest in digests {
            match state.records.get(&(request.namespace.clone(), *digest)) {
                Some(record) => {
                    let bins = selected_bins(record, request.info1, &bin_names);
                    encode_row(&mut out, OK, 0, 0, record.generation, Some(*digest), &bins);
                }
                None => encode_row(&mut out, KEY_NOT_FOUND, 0, 0, 0, Some(*digest), &[]),
            }
        }
        return batch_response(out);
    }

    let id = (request.namespace.clone(), request.digest.unwrap_or_default());
    if request.info2 & INFO2_WRITE != 0 {
        let current = state.records.get(&id).map(|r| r.generation);
        if request.info2 & INFO2_GENERATION != 0 && current != Some(request.generation) {
            encode_row(&mut out, GENERATION_ERROR, 0, 0, 0, None, &[]);
        } else if request.info2 & INFO2_DELETE != 0 {
            let code = if state.records.remove(&id).is_some() { OK } else { KEY_NOT_FOUND };
            encode_row(&mut out, code, 0, 0, 0, None, &[]);
        } else {
            let record = state.records.entry(id).or_insert(StoredRecord {
                bins: Vec::new(),
                generation: 0,
            });
            for (_, name, particle_type, value) in request.ops {
                record.bins.retain(|(existing, _, _)| existing != &name);
                record.bins.push((name, particle_type, value));
            }
            record.generation += 1;
            encode_row(&mut out, OK, 0, 0, record.generation, None, &[]);
        }
        return frame(out);
    }

    match state.records.get(&id) {
        Some(record) => {
            let bin_names: Vec<String> = request.ops.iter().map(|op| op.1.clone()).collect();
            let bins = selected_bins(record, request.info1, &bin_names);
            encode_row(&mut out, OK, 0, 0, record.generation, None, &bins);
        }
        None => encode_row(&mut out, KEY_NOT_FOUND, 0, 0, 0, None, &[]),
    }
    frame(out)
}

/// Rows in one message, the last marker in a second
fn batch_response(rows: BytesMut) -> Bytes {
    let mut last = BytesMut::new();
    encode_row(&mut last, OK, INFO3_LAST, 0, 0, None, &[]);
    let mut out = BytesMut::new();
    if !rows.is_empty() {
        out.extend_from_slice(&frame(rows));
    }
    out.extend_from_slice(&frame(last));
    out.freeze()
}

fn frame(body: BytesMut) -> Bytes {
    ProtoMessage::new(DATA_MESSAGE_TYPE, body.freeze()).to_bytes()
}

fn encode_row(
    out: &mut BytesMut,
    result_code: u8,
    info3: u8,
    batch_index: u32,
    generation: u32,
    digest: Option<[u8; 20]>,
    bins: &[(&str, u8, &[u8])],
) {
    out.put_u8(22);
    out.put_u8(0);
    out.put_u8(0);
    out.put_u8(info3);
    out.put_u8(0);
    out.put_u8(result_code);
    out.put_u32(generation);
    out.put_u32(0);
    out.put_u32(batch_index);
    out.put_u16(u16::from(digest.is_some()));
    out.put_u16(bins.len() as u16);
    if let Some(digest) = digest {
        out.put_u32(21);
        out.put_u8(FIELD_DIGEST);
        out.put_slice(&digest);
    }
    for (name, particle_type, value) in bins {
        out.put_u32((4 + name.len() + value.len()) as u32);
        out.put_u8(1);
        out.put_u8(*particle_type);
        out.put_u8(0);
        out.put_u8(name.len() as u8);
        out.put_slice(name.as_bytes());
        out.put_slice(value);
    }
}

/// Connection state shared by the sync and async transports
struct Wire {
    cluster: Arc<MockCluster>,
    port: u16,
    pending: VecDeque<u8>,
    timeout: Option<Duration>,
    hang: bool,
    reset: bool,
    closed: bool,
}

impl Wire {
    fn new(cluster: Arc<MockCluster>, port: u16) -> Self {
        Self {
            cluster,
            port,
            pending: VecDeque::new(),
            timeout: None,
            hang: false,
            reset: false,
            closed: false,
        }
    }

    fn send(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed || self.reset {
            return Err(ClientError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "closed")));
        }
        match self.cluster.handle(self.port, buf)? {
            Reply::Message(bytes) => self.pending.extend(bytes.iter()),
            Reply::Hang => self.hang = true,
            Reply::Reset => self.reset = true,
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Option<Vec<u8>> {
        if self.pending.len() < len {
            return None;
        }
        Some(self.pending.drain(..len).collect())
    }

    fn is_valid(&self) -> bool {
        !self.closed && !self.reset && !self.hang && self.pending.is_empty()
    }
}

fn reset_error() -> ClientError {
    ClientError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"))
}

pub struct MockConnection {
    wire: Wire,
}

impl Connection for MockConnection {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.wire.send(buf)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.wire.reset {
            return Err(reset_error());
        }
        match self.wire.take(buf.len()) {
            Some(bytes) => {
                buf.copy_from_slice(&bytes);
                Ok(())
            }
            None if self.wire.hang => {
                std::thread::sleep(self.wire.timeout.unwrap_or(Duration::from_millis(50)));
                Err(ClientError::Io(io::Error::new(io::ErrorKind::TimedOut, "read timed out")))
            }
            None => Err(ClientError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"))),
        }
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.wire.timeout = timeout;
        Ok(())
    }

    fn is_valid(&mut self) -> bool {
        self.wire.is_valid()
    }

    fn is_closed(&self) -> bool {
        self.wire.closed
    }

    fn close(&mut self) {
        self.wire.closed = true;
    }
}

/// Transport handing out connections to the mock nodes
pub struct MockConnector {
    cluster: Arc<MockCluster>,
}

impl Connector for MockConnector {
    fn connect(&self, host: &Host, _timeout: Duration) -> Result<Box<dyn Connection>> {
        self.cluster.check_reachable(host)?;
        self.cluster.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            wire: Wire::new(self.cluster.clone(), host.port),
        }))
    }
}

#[async_trait]
impl AsyncConnector for MockConnector {
    async fn connect(&self, host: &Host, _timeout: Duration) -> Result<Box<dyn AsyncConnection>> {
        self.cluster.check_reachable(host)?;
        self.cluster.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockAsyncConnection {
            wire: Wire::new(self.cluster.clone(), host.port),
        }))
    }
}

pub struct MockAsyncConnection {
    wire: Wire,
}

#[async_trait]
impl AsyncConnection for MockAsyncConnection {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.wire.send(buf)
    }

    async fn read_message(&mut self) -> Result<ProtoMessage> {
        if self.wire.reset {
            return Err(reset_error());
        }
        if self.wire.hang {
            futures::future::pending::<()>().await;
        }
        let word = self
            .wire
            .take(HEADER_SIZE)
            .ok_or_else(|| ClientError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof")))?;
        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&word);
        let header = ProtoHeader::from_bytes(&header_bytes)?;
        let body = self
            .wire
            .take(header.size)
            .ok_or_else(|| ClientError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof")))?;
        Ok(ProtoMessage {
            header,
            body: Bytes::from(body),
        })
    }

    fn is_valid(&mut self) -> bool {
        self.wire.is_valid()
    }

    fn is_closed(&self) -> bool {
        self.wire.closed
    }

    fn close(&mut self) {
        self.wire.closed = true;
    }
}
