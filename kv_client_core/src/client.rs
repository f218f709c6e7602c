//! Client facade
//!
//! This module provides the [`Client`], the entry point applications use. It
//! owns the cluster and exposes blocking, `async` and listener based variants
//! of every operation. A `None` policy selects the configured default.

use crate::cluster::{Cluster, Connectors};
use crate::command::async_exec;
use crate::command::batch::{fill_batch_reads, BatchRequest};
use crate::command::listener::{
    BatchListListener, DeleteListener, ExistsArrayListener, ExistsListener, RecordArrayListener,
    RecordListener, RecordSequenceListener, WriteListener,
};
use crate::command::sync_exec;
use crate::command::{DeleteCommand, ExistsCommand, ReadCommand, WriteCommand};
use crate::config::{BatchPolicy, ClientConfig, Policy, WritePolicy};
use crate::error::{ClientError, Result};
use crate::key::Key;
use crate::log::log_startup;
use crate::metrics::{ClientMetrics, MetricsSummary};
use crate::node::Node;
use crate::record::{BatchRead, Bin, Record};
use crate::stats::ClusterStats;
use crate::task::InfoTask;
use std::future::Future;
use std::sync::Arc;

pub struct Client {
    cluster: Arc<Cluster>,
    config: ClientConfig,
}

fn bin_list(bin_names: Option<&[&str]>) -> Option<Vec<String>> {
    bin_names.map(|names| names.iter().map(|name| name.to_string()).collect())
}

impl Client {
    /// Connect with the default TCP transports
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_connectors(config, Connectors::default())
    }

    /// Connect with custom transports or authenticator
    pub fn with_connectors(config: ClientConfig, connectors: Connectors) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| ClientError::Config(errors.join("; ")))?;
        log_startup(&config);

        let metrics = Arc::new(ClientMetrics::new());
        let cluster = Cluster::new(config.cluster.clone(), connectors, metrics)?;
        Ok(Self { cluster, config })
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.cluster.is_connected()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.cluster.nodes()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.cluster.node_names()
    }

    pub fn stats(&self) -> ClusterStats {
        self.cluster.stats()
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.cluster.metrics().summary()
    }

    /// Stop tending and close all connections
    pub fn close(&self) {
        self.cluster.close();
    }

    fn read_policy(&self, policy: Option<&Policy>) -> Policy {
        policy.unwrap_or(&self.config.read).clone()
    }

    fn write_policy(&self, policy: Option<&WritePolicy>) -> WritePolicy {
        policy.unwrap_or(&self.config.write).clone()
    }

    fn batch_policy(&self, policy: Option<&BatchPolicy>) -> BatchPolicy {
        policy.unwrap_or(&self.config.batch).clone()
    }

    fn spawn<F>(&self, future: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| ClientError::InvalidArgument(format!("listener commands need a tokio runtime: {}", e)))?;
        handle.spawn(future);
        Ok(())
    }

    // Blocking operations

    /// Read the named bins, or all bins when `bin_names` is `None`
    pub fn get(&self, policy: Option<&Policy>, key: &Key, bin_names: Option<&[&str]>) -> Result<Option<Record>> {
        let mut command = ReadCommand::new(self.read_policy(policy), key.clone(), bin_list(bin_names));
        sync_exec::execute(&self.cluster, &mut command)?;
        Ok(command.into_record())
    }

    /// Read generation and expiration only
    pub fn get_header(&self, policy: Option<&Policy>, key: &Key) -> Result<Option<Record>> {
        let mut command = ReadCommand::header(self.read_policy(policy), key.clone());
        sync_exec::execute(&self.cluster, &mut command)?;
        Ok(command.into_record())
    }

    pub fn exists(&self, policy: Option<&Policy>, key: &Key) -> Result<bool> {
        let mut command = ExistsCommand::new(self.read_policy(policy), key.clone());
        sync_exec::execute(&self.cluster, &mut command)?;
        Ok(command.exists())
    }

    pub fn put(&self, policy: Option<&WritePolicy>, key: &Key, bins: &[Bin]) -> Result<()> {
        let mut command = WriteCommand::new(self.write_policy(policy), key.clone(), bins.to_vec());
        sync_exec::execute(&self.cluster, &mut command)
    }

    /// Delete a record, returns whether it existed
    pub fn delete(&self, policy: Option<&WritePolicy>, key: &Key) -> Result<bool> {
        let mut command = DeleteCommand::new(self.write_policy(policy), key.clone());
        sync_exec::execute(&self.cluster, &mut command)?;
        Ok(command.existed())
    }

    /// Read many records, results are in key order with `None` for missing keys
    pub fn batch_get(
        &self,
        policy: Option<&BatchPolicy>,
        keys: &[Key],
        bin_names: Option<&[&str]>,
    ) -> Result<Vec<Option<Record>>> {
        let request = Arc::new(BatchRequest::get(keys.to_vec(), bin_list(bin_names)));
        sync_exec::execute_batch(&self.cluster, &self.batch_policy(policy), &request)?;
        Ok(request.take_records())
    }

    pub fn batch_get_header(&self, policy: Option<&BatchPolicy>, keys: &[Key]) -> Result<Vec<Option<Record>>> {
        let request = Arc::new(BatchRequest::get_header(keys.to_vec()));
        sync_exec::execute_batch(&self.cluster, &self.batch_policy(policy), &request)?;
        Ok(request.take_records())
    }

    pub fn batch_exists(&self, policy: Option<&BatchPolicy>, keys: &[Key]) -> Result<Vec<bool>> {
        let request = Arc::new(BatchRequest::exists(keys.to_vec()));
        sync_exec::execute_batch(&self.cluster, &self.batch_policy(policy), &request)?;
        Ok(request.take_exists())
    }

    /// Read keys with their own bin selections, filling `record` of each entry
    pub fn batch_read(&self, policy: Option<&BatchPolicy>, reads: &mut [BatchRead]) -> Result<()> {
        let request = Arc::new(BatchRequest::read_list(reads));
        sync_exec::execute_batch(&self.cluster, &self.batch_policy(policy), &request)?;
        fill_batch_reads(&request, reads);
        Ok(())
    }

    /// Task that completes once `command` satisfies `predicate` on every node
    pub fn info_task(
        &self,
        command: impl Into<String>,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> InfoTask {
        InfoTask::new(self.cluster.clone(), command, predicate)
    }

    // Async operations

    pub async fn get_async(
        &self,
        policy: Option<&Policy>,
        key: &Key,
        bin_names: Option<&[&str]>,
    ) -> Result<Option<Record>> {
        let command = ReadCommand::new(self.read_policy(policy), key.clone(), bin_list(bin_names));
        let command = async_exec::execute(self.cluster.clone(), command).await?;
        Ok(command.into_record())
    }

    pub async fn exists_async(&self, policy: Option<&Policy>, key: &Key) -> Result<bool> {
        let command = ExistsCommand::new(self.read_policy(policy), key.clone());
        let command = async_exec::execute(self.cluster.clone(), command).await?;
        Ok(command.exists())
    }

    pub async fn put_async(&self, policy: Option<&WritePolicy>, key: &Key, bins: &[Bin]) -> Result<()> {
        let command = WriteCommand::new(self.write_policy(policy), key.clone(), bins.to_vec());
        async_exec::execute(self.cluster.clone(), command).await?;
        Ok(())
    }

    pub async fn delete_async(&self, policy: Option<&WritePolicy>, key: &Key) -> Result<bool> {
        let command = DeleteCommand::new(self.write_policy(policy), key.clone());
        let command = async_exec::execute(self.cluster.clone(), command).await?;
        Ok(command.existed())
    }

    pub async fn batch_get_async(
        &self,
        policy: Option<&BatchPolicy>,
        keys: &[Key],
        bin_names: Option<&[&str]>,
    ) -> Result<Vec<Option<Record>>> {
        let request = Arc::new(BatchRequest::get(keys.to_vec(), bin_list(bin_names)));
        async_exec::execute_batch(self.cluster.clone(), self.batch_policy(policy), request.clone()).await?;
        Ok(request.take_records())
    }

    pub async fn batch_exists_async(&self, policy: Option<&BatchPolicy>, keys: &[Key]) -> Result<Vec<bool>> {
        let request = Arc::new(BatchRequest::exists(keys.to_vec()));
        async_exec::execute_batch(self.cluster.clone(), self.batch_policy(policy), request.clone()).await?;
        Ok(request.take_exists())
    }

    pub async fn batch_read_async(&self, policy: Option<&BatchPolicy>, mut reads: Vec<BatchRead>) -> Result<Vec<BatchRead>> {
        let request = Arc::new(BatchRequest::read_list(&reads));
        async_exec::execute_batch(self.cluster.clone(), self.batch_policy(policy), request.clone()).await?;
        fill_batch_reads(&request, &mut reads);
        Ok(reads)
    }

    // Listener operations

    pub fn get_with_listener(
        &self,
        policy: Option<&Policy>,
        key: Key,
        bin_names: Option<&[&str]>,
        listener: Arc<dyn RecordListener>,
    ) -> Result<()> {
        let command = ReadCommand::new(self.read_policy(policy), key, bin_list(bin_names));
        let cluster = self.cluster.clone();
        self.spawn(async move {
            match async_exec::execute(cluster, command).await {
                Ok(command) => {
                    let key = command.key().clone();
                    listener.on_success(key, command.into_record());
                }
                Err(e) => listener.on_failure(e),
            }
        })
    }

    pub fn exists_with_listener(
        &self,
        policy: Option<&Policy>,
        key: Key,
        listener: Arc<dyn ExistsListener>,
    ) -> Result<()> {
        let command = ExistsCommand::new(self.read_policy(policy), key.clone());
        let cluster = self.cluster.clone();
        self.spawn(async move {
            match async_exec::execute(cluster, command).await {
                Ok(command) => listener.on_success(key, command.exists()),
                Err(e) => listener.on_failure(e),
            }
        })
    }

    pub fn put_with_listener(
        &self,
        policy: Option<&WritePolicy>,
        key: Key,
        bins: Vec<Bin>,
        listener: Arc<dyn WriteListener>,
    ) -> Result<()> {
        let command = WriteCommand::new(self.write_policy(policy), key.clone(), bins);
        let cluster = self.cluster.clone();
        self.spawn(async move {
            match async_exec::execute(cluster, command).await {
                Ok(_) => listener.on_success(key),
                Err(e) => listener.on_failure(e),
            }
        })
    }

    pub fn delete_with_listener(
        &self,
        policy: Option<&WritePolicy>,
        key: Key,
        listener: Arc<dyn DeleteListener>,
    ) -> Result<()> {
        let command = DeleteCommand::new(self.write_policy(policy), key.clone());
        let cluster = self.cluster.clone();
        self.spawn(async move {
            match async_exec::execute(cluster, command).await {
                Ok(command) => listener.on_success(key, command.existed()),
                Err(e) => listener.on_failure(e),
            }
        })
    }

    pub fn batch_get_with_listener(
        &self,
        policy: Option<&BatchPolicy>,
        keys: Vec<Key>,
        bin_names: Option<&[&str]>,
        listener: Arc<dyn RecordArrayListener>,
    ) -> Result<()> {
        let request = Arc::new(BatchRequest::get(keys.clone(), bin_list(bin_names)));
        let policy = self.batch_policy(policy);
        let cluster = self.cluster.clone();
        self.spawn(async move {
            match async_exec::execute_batch(cluster, policy, request.clone()).await {
                Ok(()) => listener.on_success(keys, request.take_records()),
                Err(e) => listener.on_failure(e),
            }
        })
    }

    pub fn batch_exists_with_listener(
        &self,
        policy: Option<&BatchPolicy>,
        keys: Vec<Key>,
        listener: Arc<dyn ExistsArrayListener>,
    ) -> Result<()> {
        let request = Arc::new(BatchRequest::exists(keys.clone()));
        let policy = self.batch_policy(policy);
        let cluster = self.cluster.clone();
        self.spawn(async move {
            match async_exec::execute_batch(cluster, policy, request.clone()).await {
                Ok(()) => listener.on_success(keys, request.take_exists()),
                Err(e) => listener.on_failure(e),
            }
        })
    }

    pub fn batch_read_with_listener(
        &self,
        policy: Option<&BatchPolicy>,
        mut reads: Vec<BatchRead>,
        listener: Arc<dyn BatchListListener>,
    ) -> Result<()> {
        let request = Arc::new(BatchRequest::read_list(&reads));
        let policy = self.batch_policy(policy);
        let cluster = self.cluster.clone();
        self.spawn(async move {
            match async_exec::execute_batch(cluster, policy, request.clone()).await {
                Ok(()) => {
                    fill_batch_reads(&request, &mut reads);
                    listener.on_success(reads);
                }
                Err(e) => listener.on_failure(e),
            }
        })
    }

    /// Deliver each record to `listener` as soon as its node answers
    pub fn batch_get_sequence(
        &self,
        policy: Option<&BatchPolicy>,
        keys: Vec<Key>,
        bin_names: Option<&[&str]>,
        listener: Arc<dyn RecordSequenceListener>,
    ) -> Result<()> {
        let request = Arc::new(BatchRequest::sequence(keys, bin_list(bin_names), listener.clone()));
        let policy = self.batch_policy(policy);
        let cluster = self.cluster.clone();
        self.spawn(async move {
            match async_exec::execute_batch(cluster, policy, request).await {
                Ok(()) => listener.on_success(),
                Err(e) => listener.on_failure(e),
            }
        })
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cluster.close();
    }
}
