use std::{
    io::ErrorKind,
    net::{IpAddr, SocketAddr},
    path::Path,
};

use serde::{Deserialize, Serialize};
use tokio::fs::read_to_string;

use crate::{connector::ConnectorType, error::ConfigError};

const DEFAULT_WEBSOCKET_ADDRESS: &str = "localhost:8080";
const DEFAULT_WEBSOCKET_PORT: u16 = 8080;
const DEFAULT_RPC_ADDRESS: &str = "localhost:8191";
const DEFAULT_RPC_PORT: u16 = 8191;
const DEFAULT_SCRIPT_HOST: &str = "127.0.0.1";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectorSettings {
    pub connector_type: ConnectorType,
    pub websocket_address: String,
    pub rpc_address: String,
    /// `ip` or `ip:port`. Empty means loopback on the dialect's default port.
    pub script_address: String,
    pub timeout_seconds: u64,
    pub client_name: String,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            connector_type: ConnectorType::default(),
            websocket_address: DEFAULT_WEBSOCKET_ADDRESS.to_owned(),
            rpc_address: DEFAULT_RPC_ADDRESS.to_owned(),
            script_address: String::new(),
            timeout_seconds: 60,
            client_name: "SnesConnectorLibrary".to_owned(),
        }
    }
}

impl ConnectorSettings {
    pub fn for_type(connector_type: ConnectorType) -> Self {
        Self {
            connector_type,
            ..Default::default()
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads settings from a TOML file. A missing file yields the defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match read_to_string(path).await {
            Ok(text) => Self::from_toml(&text),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn websocket_url(&self) -> String {
        with_scheme_and_port(
            &self.websocket_address,
            DEFAULT_WEBSOCKET_ADDRESS,
            "ws://",
            DEFAULT_WEBSOCKET_PORT,
        )
    }

    pub fn rpc_url(&self) -> String {
        with_scheme_and_port(&self.rpc_address, DEFAULT_RPC_ADDRESS, "http://", DEFAULT_RPC_PORT)
    }

    pub fn script_socket_address(&self, default_port: u16) -> Result<SocketAddr, ConfigError> {
        let address = self.script_address.trim();
        if address.is_empty() {
            return format!("{}:{}", DEFAULT_SCRIPT_HOST, default_port)
                .parse()
                .map_err(|_| ConfigError::InvalidAddress(address.to_owned()));
        }
        if let Ok(socket_address) = address.parse::<SocketAddr>() {
            return Ok(socket_address);
        }
        address
            .parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, default_port))
            .map_err(|_| ConfigError::InvalidAddress(address.to_owned()))
    }
}

fn with_scheme_and_port(address: &str, fallback: &str, scheme: &str, port: u16) -> String {
    let address = address.trim();
    let address = if address.is_empty() { fallback } else { address };
    let (scheme, rest) = match address.split_once("://") {
        Some((scheme, rest)) => (format!("{}://", scheme), rest),
        None => (scheme.to_owned(), address),
    };
    let host = rest.trim_end_matches('/');
    let has_port = host
        .rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    if has_port {
        format!("{}{}", scheme, host)
    } else {
        format!("{}{}:{}", scheme, host, port)
    }
}
