use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Server address with optional TLS name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Host {
    /// Host name or IP address
    pub name: String,
    /// Name expected on the server certificate
    pub tls_name: Option<String>,
    pub port: u16,
}

impl Host {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            tls_name: None,
            port,
        }
    }

    /// Parse `name`, `name:port`, `name:tls_name:port` or `[ipv6]:port`
    pub fn parse(value: &str, default_port: u16) -> Result<Host> {
        let value = value.trim();
        if value.is_empty() {
            return Err(ClientError::InvalidArgument("empty host".to_string()));
        }

        if let Some(rest) = value.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| ClientError::InvalidArgument(format!("invalid IPv6 host {}", value)))?;
            let name = &rest[..end];
            let port = match rest[end + 1..].strip_prefix(':') {
                Some(port) => parse_port(port, value)?,
                None => default_port,
            };
            return Ok(Host::new(name, port));
        }

        let parts: Vec<&str> = value.split(':').collect();
        match parts.as_slice() {
            [name] => Ok(Host::new(*name, default_port)),
            [name, port] => Ok(Host::new(*name, parse_port(port, value)?)),
            [name, tls_name, port] => Ok(Host {
                name: name.to_string(),
                tls_name: Some(tls_name.to_string()),
                port: parse_port(port, value)?,
            }),
            _ => Err(ClientError::InvalidArgument(format!("invalid host {}", value))),
        }
    }

    /// Parse a `;` or `,` separated list of hosts
    pub fn parse_list(value: &str, default_port: u16) -> Result<Vec<Host>> {
        value
            .split(|c| c == ';' || c == ',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| Host::parse(s, default_port))
            .collect()
    }

    /// Replace the host name through an address translation table
    pub fn translate(mut self, ip_map: &HashMap<String, String>) -> Host {
        if let Some(alternate) = ip_map.get(&self.name) {
            self.name = alternate.clone();
        }
        self
    }

    /// Address suitable for socket resolution
    pub fn address(&self) -> String {
        if self.name.contains(':') {
            format!("[{}]:{}", self.name, self.port)
        } else {
            format!("{}:{}", self.name, self.port)
        }
    }
}

fn parse_port(port: &str, value: &str) -> Result<u16> {
    port.trim()
        .parse()
        .map_err(|_| ClientError::InvalidArgument(format!("invalid port in host {}", value)))
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}
