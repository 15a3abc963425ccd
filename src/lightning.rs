//! The capability surface a Lightning node backend must supply.
//!
//! Semantics are normative here; wire mechanics live in the backend
//! modules (`lnd`, `cln`).

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bitcoin::OutPoint;
use secp256k1::PublicKey;
use thiserror::Error;

use crate::scid::ShortChannelId;

#[derive(Debug, Error)]
pub enum Error {
    /// RPC transport failure (connection, TLS, socket)
    #[error("transport error: {0}")]
    Transport(String),
    /// the node answered with an error
    #[error("rpc error: {0}")]
    Rpc(String),
    /// no channel in an OPEN state at the requested outpoint
    #[error("no channel found")]
    NoChannelFound,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<tonic::Status> for Error {
    fn from(s: tonic::Status) -> Error {
        Error::Rpc(s.to_string())
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(e: tonic::transport::Error) -> Error {
        Error::Transport(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Transport(e.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct GetInfoResult {
    pub alias: String,
    pub pubkey: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GetChannelResult {
    /// The zero-conf alias the peer advertised for the channel.
    pub initial_scid: ShortChannelId,
    /// The on-chain scid once the funding tx confirmed; equal to the alias
    /// until then.
    pub confirmed_scid: ShortChannelId,
}

#[derive(Clone, Debug)]
pub struct OpenChannelRequest {
    pub destination: PublicKey,
    pub capacity_sat: u64,
    pub min_htlc_msat: u64,
    pub is_private: bool,
    pub is_zero_conf: bool,
    pub min_confs: Option<u32>,
    pub fee_sat_per_vbyte: Option<f64>,
    pub target_conf: Option<u32>,
}

/// Backend-polymorphic operations on a Lightning node.
///
/// Each backend keeps its own channel-state taxonomy internally and exposes
/// only the semantic OPEN / PENDING / CLOSING sets through these methods.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// The node's identity.
    async fn get_info(&self) -> Result<GetInfoResult, Error>;

    /// True iff a peer session to `destination` is currently established.
    async fn is_connected(&self, destination: &PublicKey) -> Result<bool, Error>;

    /// Funds a channel and returns the funding outpoint. Fee selection
    /// priority: explicit sat/vbyte, then target-conf directive, then the
    /// backend default. Errors propagate verbatim.
    async fn open_channel(&self, req: &OpenChannelRequest) -> Result<OutPoint, Error>;

    /// The scid pair for a channel in an OPEN state at `channel_point`,
    /// `Error::NoChannelFound` otherwise.
    async fn get_channel(
        &self,
        peer: &PublicKey,
        channel_point: OutPoint,
    ) -> Result<GetChannelResult, Error>;

    /// Number of channels to `node` in an OPEN or PENDING state.
    async fn get_node_channel_count(&self, node: &PublicKey) -> Result<usize, Error>;

    /// Given candidate channel points (`"<txid>:<outnum>"` keys), returns
    /// the subset the node still considers live, i.e. not in a CLOSING
    /// state.
    async fn get_closed_channels(
        &self,
        node: &PublicKey,
        channel_points: &HashMap<String, ShortChannelId>,
    ) -> Result<HashMap<String, ShortChannelId>, Error>;
}

/// Set-difference shared by the backends: candidates minus the ones the
/// node reports in a CLOSING state.
pub fn filter_live_channels(
    candidates: &HashMap<String, ShortChannelId>,
    closing: &HashSet<String>,
) -> HashMap<String, ShortChannelId> {
    candidates
        .iter()
        .filter(|(cp, _)| !closing.contains(*cp))
        .map(|(cp, scid)| (cp.clone(), *scid))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_live_channels() {
        let mut candidates = HashMap::new();
        candidates.insert("deadbeef:0".to_string(), ShortChannelId(1));
        candidates.insert("cafebabe:1".to_string(), ShortChannelId(2));
        let mut closing = HashSet::new();
        closing.insert("deadbeef:0".to_string());

        let live = filter_live_channels(&candidates, &closing);
        assert_eq!(live.len(), 1);
        assert_eq!(live.get("cafebabe:1"), Some(&ShortChannelId(2)));
    }
}
