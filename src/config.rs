//! Process configuration, read from the environment at startup.

use std::env;

use anyhow::{anyhow, bail, Context, Result};
use secp256k1::SecretKey;
use serde::Deserialize;

use crate::chain::FeeStrategy;

fn default_channel_capacity() -> u64 {
    1_000_000
}

fn default_min_htlc_msat() -> u64 {
    600
}

fn default_time_lock_delta() -> u32 {
    144
}

/// Connection parameters for an LND node.
#[derive(Clone, Debug, Deserialize)]
pub struct LndConfig {
    /// gRPC endpoint, e.g. `https://localhost:10009`
    pub address: String,
    /// PEM-encoded TLS certificate of the node
    pub cert: String,
    /// hex-encoded admin macaroon
    pub macaroon: String,
}

/// Connection parameters for a CLN node.
#[derive(Clone, Debug, Deserialize)]
pub struct ClnConfig {
    /// path to lightningd's JSON-RPC unix socket
    pub socket_path: String,
    /// path for the htlc_accepted hook forwarder to connect to
    pub hook_socket_path: String,
}

/// Per-node configuration, one entry in the `NODES` env array.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub name: String,
    /// the node's identity pubkey, hex
    pub node_pubkey: String,
    /// advertised host for wallets, e.g. `lsp.example.com:9735`
    #[serde(default)]
    pub host: String,
    pub lnd: Option<LndConfig>,
    pub cln: Option<ClnConfig>,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity_sat: u64,
    #[serde(default = "default_min_htlc_msat")]
    pub min_htlc_msat: u64,
    #[serde(default)]
    pub channel_private: bool,
    #[serde(default)]
    pub channel_zero_conf: bool,
    #[serde(default)]
    pub min_confs: Option<u32>,
    #[serde(default)]
    pub target_conf: Option<u32>,
    #[serde(default = "default_time_lock_delta")]
    pub time_lock_delta: u32,
}

pub struct Config {
    pub nodes: Vec<NodeConfig>,
    pub database_url: String,
    pub listen_address: String,
    pub certmagic_domain: Option<String>,
    pub mempool_api_base_url: Option<String>,
    pub mempool_priority: FeeStrategy,
    pub private_key: SecretKey,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let nodes_json = env::var("NODES").context("NODES env var is not set")?;
        let nodes: Vec<NodeConfig> =
            serde_json::from_str(&nodes_json).context("failed to unmarshal NODES env")?;
        if nodes.is_empty() {
            bail!("need at least one node configured in NODES");
        }
        for node in &nodes {
            if node.lnd.is_none() && node.cln.is_none() {
                bail!("node {} has to be either cln or lnd", node.node_pubkey);
            }
        }

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL env var is not set")?;
        let listen_address =
            env::var("LISTEN_ADDRESS").context("LISTEN_ADDRESS env var is not set")?;
        let certmagic_domain = env::var("CERTMAGIC_DOMAIN").ok().filter(|d| !d.is_empty());

        let mempool_api_base_url = if env::var("USE_MEMPOOL_FEE_ESTIMATION").as_deref() == Ok("true")
        {
            Some(
                env::var("MEMPOOL_API_BASE_URL")
                    .context("MEMPOOL_API_BASE_URL env var is not set")?,
            )
        } else {
            None
        };
        let mempool_priority = env::var("MEMPOOL_PRIORITY")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or_default();

        let key_hex = env::var("LSPD_PRIVATE_KEY").context("LSPD_PRIVATE_KEY env var is not set")?;
        let key_bytes = hex::decode(&key_hex).context("LSPD_PRIVATE_KEY is not valid hex")?;
        let private_key = SecretKey::from_slice(&key_bytes)
            .map_err(|e| anyhow!("LSPD_PRIVATE_KEY is not a valid key: {}", e))?;

        Ok(Config {
            nodes,
            database_url,
            listen_address,
            certmagic_domain,
            mempool_api_base_url,
            mempool_priority,
            private_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_config_parse() {
        let json = r#"[{
            "node_pubkey": "02a1b2c3",
            "lnd": {"address": "https://localhost:10009", "cert": "pem", "macaroon": "0f"},
            "channel_capacity_sat": 500000,
            "channel_private": true,
            "target_conf": 6
        }]"#;
        let nodes: Vec<NodeConfig> = serde_json::from_str(json).unwrap();
        assert_eq!(nodes.len(), 1);
        let node = &nodes[0];
        assert!(node.lnd.is_some());
        assert!(node.cln.is_none());
        assert_eq!(node.channel_capacity_sat, 500_000);
        assert_eq!(node.min_htlc_msat, 600);
        assert_eq!(node.time_lock_delta, 144);
        assert_eq!(node.target_conf, Some(6));
        assert!(node.channel_private);
        assert!(!node.channel_zero_conf);
    }

    #[test]
    fn test_cln_node_config_parse() {
        let json = r#"[{
            "node_pubkey": "03ff",
            "cln": {"socket_path": "/run/lightning-rpc", "hook_socket_path": "/run/lspd-hook"}
        }]"#;
        let nodes: Vec<NodeConfig> = serde_json::from_str(json).unwrap();
        assert_eq!(nodes[0].cln.as_ref().unwrap().socket_path, "/run/lightning-rpc");
    }
}
