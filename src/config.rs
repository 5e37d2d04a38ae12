// Copyright 2020 Joyent, Inc.

//! Client and server settings, loadable from JSON.

use std::fs::File;
use std::io::{BufReader, Error, ErrorKind};
use std::path::Path;
use std::time::Duration;

use serde_derive::Deserialize;

use crate::protocol::DEFAULT_MAX_FRAME;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub address: String,
    pub heartbeat_interval_ms: u64,
    pub retry_base_ms: u64,
    /// Highest backoff multiplier.
    pub retry_ceiling: u32,
    pub max_frame: usize,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            address: "127.0.0.1:2030".to_string(),
            heartbeat_interval_ms: 20_000,
            retry_base_ms: 500,
            retry_ceiling: 4,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

impl ClientConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn from_json(text: &str) -> Result<ClientConfig, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<ClientConfig, Error> {
        read_json(path)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub address: String,
    pub max_frame: usize,
    /// Version hash announced in the handshake. A fresh one is generated
    /// when unset.
    pub version_hash: Option<String>,
    /// Extra words for the global dictionary.
    pub dict_words: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            address: "127.0.0.1:2030".to_string(),
            max_frame: DEFAULT_MAX_FRAME,
            version_hash: None,
            dict_words: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_json(text: &str) -> Result<ServerConfig, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<ServerConfig, Error> {
        read_json(path)
    }
}

fn read_json<T, P>(path: P) -> Result<T, Error>
where
    T: serde::de::DeserializeOwned,
    P: AsRef<Path>,
{
    let file = File::open(path)?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| Error::new(ErrorKind::InvalidData, e))
}
