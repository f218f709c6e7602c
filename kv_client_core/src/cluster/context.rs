use crate::auth::Authenticator;
use crate::config::ClusterPolicy;
use crate::metrics::ClientMetrics;
use crate::net::{AsyncConnector, Connector};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Transport and authentication collaborators
#[derive(Clone)]
pub struct Connectors {
    pub sync: Arc<dyn Connector>,
    pub asynchronous: Arc<dyn AsyncConnector>,
    pub authenticator: Arc<dyn Authenticator>,
}

impl Default for Connectors {
    fn default() -> Self {
        Self {
            sync: Arc::new(crate::net::TcpConnector),
            asynchronous: Arc::new(crate::net::TokioConnector),
            authenticator: Arc::new(crate::auth::AdminAuthenticator),
        }
    }
}

/// State shared between the cluster and its nodes
///
/// Nodes hold this instead of a cluster reference so that the ownership
/// graph stays acyclic.
pub struct ClusterContext {
    pub policy: ClusterPolicy,
    pub connectors: Connectors,
    pub metrics: Arc<ClientMetrics>,
    tend_wake: Sender<()>,
    tend_valid: AtomicBool,
}

impl ClusterContext {
    /// Create the context and the receiving end of the tend wake channel
    pub fn new(policy: ClusterPolicy, connectors: Connectors, metrics: Arc<ClientMetrics>) -> (Self, Receiver<()>) {
        let (tend_wake, wake_rx) = bounded(1);
        let ctx = Self {
            policy,
            connectors,
            metrics,
            tend_wake,
            tend_valid: AtomicBool::new(true),
        };
        (ctx, wake_rx)
    }

    /// Ask the tend loop to run now
    ///
    /// At most one wake is pending, extra signals coalesce.
    pub fn wake_tend(&self) {
        let _ = self.tend_wake.try_send(());
    }

    pub fn is_tend_valid(&self) -> bool {
        self.tend_valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.tend_valid.store(false, Ordering::Release);
        self.wake_tend();
    }
}
