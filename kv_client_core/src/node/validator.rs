use super::parse_features;
use crate::auth::Session;
use crate::cluster::ClusterContext;
use crate::error::{ClientError, Result};
use crate::info;
use crate::net::{Connection, Host};
use tracing::debug;

/// Connection and identity of a host that answered as a cluster node
pub struct NodeValidator {
    pub name: String,
    pub primary_host: Host,
    pub aliases: Vec<Host>,
    pub conn: Box<dyn Connection>,
    pub session: Option<Session>,
    pub features: u32,
}

impl NodeValidator {
    /// Connect to `host`, log in and verify it is a usable member of the cluster
    pub fn validate(ctx: &ClusterContext, host: &Host) -> Result<NodeValidator> {
        let mut conn = ctx
            .connectors
            .sync
            .connect(host, ctx.policy.connection_timeout())?;

        match Self::identify(ctx, host, conn.as_mut()) {
            Ok((name, session, features)) => {
                debug!(node = %name, host = %host, "Validated node");
                Ok(NodeValidator {
                    name,
                    primary_host: host.clone(),
                    aliases: vec![host.clone()],
                    conn,
                    session,
                    features,
                })
            }
            Err(e) => {
                conn.close();
                Err(e)
            }
        }
    }

    fn identify(
        ctx: &ClusterContext,
        host: &Host,
        conn: &mut dyn Connection,
    ) -> Result<(String, Option<Session>, u32)> {
        let policy = &ctx.policy;
        let mut session = None;

        if let Some((user, password)) = policy.credentials() {
            conn.set_timeout(Some(policy.login_timeout()))?;
            let issued = ctx.connectors.authenticator.login(conn, user, password)?;
            if !issued.token.is_empty() {
                session = Some(issued);
            }
        }
        conn.set_timeout(Some(policy.connection_timeout()))?;

        let mut names = vec!["node", "partition-generation", "features"];
        if policy.cluster_name.is_some() {
            names.push("cluster-name");
        }
        let mut map = info::request(conn, &names)?;

        let name = info::take_value(&mut map, "node")?;
        if name.is_empty() {
            return Err(ClientError::InvalidNode(format!("{} returned an empty node name", host)));
        }

        if info::parse_generation(&map, "partition-generation")? == -1 {
            return Err(ClientError::InvalidNode(format!(
                "node {} {} is not yet fully initialized",
                name, host
            )));
        }

        if let Some(expected) = &policy.cluster_name {
            let actual = map.get("cluster-name").map(String::as_str).unwrap_or("");
            if actual != expected {
                return Err(ClientError::InvalidNode(format!(
                    "node {} {} expected cluster name '{}' received '{}'",
                    name, host, expected, actual
                )));
            }
        }

        let features = map.get("features").map(|f| parse_features(f)).unwrap_or(0);
        Ok((name, session, features))
    }
}
