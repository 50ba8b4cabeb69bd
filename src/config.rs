use log::error;
use thiserror::Error;

use std::path::PathBuf;
use std::time::Duration;

use crate::settlement::crypto::{CryptoError, Seed};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("NANO_WALLET_SEED cannot be empty")]
    MissingSeed,

    #[error("Invalid NANO_WALLET_SEED: {0}")]
    InvalidSeed(#[from] CryptoError),

    #[error("Invalid value for {var}: {value}")]
    InvalidNumber { var: &'static str, value: String },
}

/// A remote node used only for proof of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPeer {
    pub url: String,
    pub api_key: Option<String>,
}

/// Service configuration, read from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub seed: Seed,
    pub node_url: String,
    pub node_api_key: Option<String>,
    pub node_ws_url: Option<String>,
    pub work_peers: Vec<WorkPeer>,
    pub db_file: PathBuf,
    pub bind_addr: String,
    pub explorer_url: String,
    pub pending_tx_ttl: Duration,
    pub event_webhook_url: Option<String>,
    pub rpc_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the configuration from an arbitrary variable source
    ///
    /// Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let get_secs = |var: &'static str, default: u64| -> Result<Duration, ConfigError> {
            match get(var) {
                Some(value) => value
                    .parse()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::InvalidNumber { var, value }),
                None => Ok(Duration::from_secs(default)),
            }
        };

        let seed = match get("NANO_WALLET_SEED") {
            Some(seed) => seed.parse::<Seed>()?,
            None => {
                error!(
                    "NANO_WALLET_SEED is not set. A freshly generated seed you could use: {}",
                    Seed::generate().to_hex()
                );
                return Err(ConfigError::MissingSeed);
            }
        };

        let work_peers = get("NANO_WORK_GEN_NODE_URLS")
            .map(|urls| {
                urls.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .enumerate()
                    .map(|(index, url)| WorkPeer {
                        url: url.to_string(),
                        api_key: get(&format!("NANO_WORK_GEN_NODE_API_KEY_{}", index)),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Config {
            seed,
            node_url: get("NANO_NODE_URL").unwrap_or_else(|| "http://127.0.0.1:7076".to_string()),
            node_api_key: get("NANO_NODE_API_KEY"),
            node_ws_url: get("NANO_NODE_WS_URL"),
            work_peers,
            db_file: get("DB_FILE").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./db")),
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            explorer_url: get("EXPLORER_URL").unwrap_or_else(|| "https://nanolooker.com".to_string()),
            pending_tx_ttl: get_secs("PENDING_TX_TTL_SECS", 86_400)?,
            event_webhook_url: get("EVENT_WEBHOOK_URL"),
            rpc_timeout: get_secs("RPC_TIMEOUT_SECS", 30)?,
        })
    }
}
