//! Completion callbacks for asynchronous commands
//!
//! Listeners are invoked from a tokio task once the command and all of its
//! retries have finished. Exactly one of `on_success` or `on_failure` is
//! called per command.

use crate::error::ClientError;
use crate::key::Key;
use crate::record::{BatchRead, Record};

pub trait RecordListener: Send + Sync {
    fn on_success(&self, key: Key, record: Option<Record>);

    fn on_failure(&self, error: ClientError);
}

pub trait WriteListener: Send + Sync {
    fn on_success(&self, key: Key);

    fn on_failure(&self, error: ClientError);
}

pub trait ExistsListener: Send + Sync {
    fn on_success(&self, key: Key, exists: bool);

    fn on_failure(&self, error: ClientError);
}

pub trait DeleteListener: Send + Sync {
    fn on_success(&self, key: Key, existed: bool);

    fn on_failure(&self, error: ClientError);
}

/// Batch results in key order
pub trait RecordArrayListener: Send + Sync {
    fn on_success(&self, keys: Vec<Key>, records: Vec<Option<Record>>);

    fn on_failure(&self, error: ClientError);
}

pub trait ExistsArrayListener: Send + Sync {
    fn on_success(&self, keys: Vec<Key>, exists: Vec<bool>);

    fn on_failure(&self, error: ClientError);
}

pub trait BatchListListener: Send + Sync {
    fn on_success(&self, records: Vec<BatchRead>);

    fn on_failure(&self, error: ClientError);
}

/// Batch results delivered one record at a time
///
/// `on_record` may be called concurrently from the tasks of different nodes
/// and in any order.
pub trait RecordSequenceListener: Send + Sync {
    fn on_record(&self, key: &Key, record: Option<Record>);

    fn on_success(&self);

    fn on_failure(&self, error: ClientError);
}
