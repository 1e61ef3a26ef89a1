//! The `ServerContext` holds the common state across the server

use std::fmt;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};

use derive_more::{Display, Error, From};
use serde_derive::Deserialize;

use crate::dns::store::RecordStore;

#[derive(Debug, Display, From, Error)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_yaml::Error),
}

type Result<T> = std::result::Result<T, ConfigError>;

pub struct ServerStatistics {
    pub tcp_query_count: AtomicUsize,
    pub udp_query_count: AtomicUsize,
}

impl ServerStatistics {
    pub fn get_tcp_query_count(&self) -> usize {
        self.tcp_query_count.load(Ordering::Acquire)
    }

    pub fn get_udp_query_count(&self) -> usize {
        self.udp_query_count.load(Ordering::Acquire)
    }
}

/// A host and port to bind a listener to
#[derive(Clone, Debug, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct DnsListening {
    pub udp: Endpoint,
    pub tcp: Endpoint,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Listening {
    pub http_api: Endpoint,
    pub dns: DnsListening,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RecordPolicy {
    /// Hard ceiling on record age, regardless of client ttl
    pub expire_time_seconds: u64,
    /// Minimum gap between expiry scans on the query path
    pub poll_period_seconds: u64,
}

/// Server configuration, loaded once at startup
///
/// The YAML layout is kept compatible with the deployed client/server
/// configuration files.
#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    /// Shared secret used to verify update signatures
    pub secret: String,
    /// Names updates are accepted for
    pub addresses: Vec<String>,
    pub listening: Listening,
    pub record: RecordPolicy,
}

impl ServerConfig {
    pub fn from_file(path: &str) -> Result<ServerConfig> {
        let raw = fs::read_to_string(path)?;

        Ok(serde_yaml::from_str(&raw)?)
    }
}

/// Main server context containing configuration and shared state
///
/// One instance is created at startup and shared by every listener; the
/// record store inside it is the single point of synchronization.
pub struct ServerContext {
    pub store: RecordStore,
    pub secret: String,
    pub allowed_names: Vec<String>,
    pub http_api: Endpoint,
    pub dns_udp: Endpoint,
    pub dns_tcp: Endpoint,
    pub statistics: ServerStatistics,
}

impl ServerContext {
    pub fn from_config(config: ServerConfig) -> ServerContext {
        ServerContext {
            store: RecordStore::new(
                config.record.expire_time_seconds,
                config.record.poll_period_seconds,
            ),
            secret: config.secret,
            allowed_names: config.addresses,
            http_api: config.listening.http_api,
            dns_udp: config.listening.dns.udp,
            dns_tcp: config.listening.dns.tcp,
            statistics: ServerStatistics {
                tcp_query_count: AtomicUsize::new(0),
                udp_query_count: AtomicUsize::new(0),
            },
        }
    }
}
