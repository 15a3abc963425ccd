use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{OutPoint, Txid};
use log::{debug, warn};
use secp256k1::PublicKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::chain::FeeDirective;
use crate::lightning::{
    filter_live_channels, Error, GetChannelResult, GetInfoResult, NodeClient, OpenChannelRequest,
};
use crate::scid::ShortChannelId;

const RPC_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) const OPEN_STATUSES: &[&str] = &["CHANNELD_NORMAL"];
pub(crate) const PENDING_STATUSES: &[&str] = &["OPENINGD", "CHANNELD_AWAITING_LOCKIN"];
pub(crate) const CLOSING_STATUSES: &[&str] = &[
    "CHANNELD_SHUTTING_DOWN",
    "CLOSINGD_SIGEXCHANGE",
    "CLOSINGD_COMPLETE",
    "AWAITING_UNILATERAL",
    "FUNDING_SPEND_SEEN",
    "ONCHAIN",
];

struct RpcConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// JSON-RPC client for one lightningd, over its unix socket.
///
/// One request is in flight at a time; the connection is re-established on
/// the next call after an I/O error.
pub struct ClnClient {
    socket_path: String,
    conn: Mutex<Option<RpcConn>>,
    next_id: AtomicU64,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

impl ClnClient {
    pub fn new(socket_path: &str) -> Result<Self, Error> {
        if socket_path.is_empty() {
            return Err(Error::Transport("empty lightningd socket path".to_string()));
        }
        Ok(ClnClient {
            socket_path: socket_path.to_string(),
            conn: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, Error> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let stream = UnixStream::connect(&self.socket_path).await?;
            let (read_half, write_half) = stream.into_split();
            *guard = Some(RpcConn { reader: BufReader::new(read_half), writer: write_half });
        }
        let conn = guard.as_mut().expect("connection established above");

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request =
            json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let res = timeout(RPC_TIMEOUT, self.roundtrip(conn, &request)).await;
        match res {
            Ok(Ok(value)) => {
                let envelope: RpcEnvelope<T> = serde_json::from_value(value)
                    .map_err(|e| Error::InvalidResponse(e.to_string()))?;
                if let Some(err) = envelope.error {
                    warn!("CLN: {} error {}: {}", method, err.code, err.message);
                    return Err(Error::Rpc(format!("{}: {}", err.code, err.message)));
                }
                envelope
                    .result
                    .ok_or_else(|| Error::InvalidResponse("response without result".to_string()))
            }
            Ok(Err(e)) => {
                // the stream may hold half a response; force a reconnect
                *guard = None;
                Err(e)
            }
            Err(_) => {
                *guard = None;
                Err(Error::Transport(format!("{} timed out", method)))
            }
        }
    }

    async fn roundtrip(
        &self,
        conn: &mut RpcConn,
        request: &serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        let mut bytes = serde_json::to_vec(request)
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;
        bytes.extend_from_slice(b"\n\n");
        conn.writer.write_all(&bytes).await?;

        // lightningd terminates each response with a blank line
        let mut buf = String::new();
        loop {
            let mut line = String::new();
            let n = conn.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(Error::Transport("lightningd closed the socket".to_string()));
            }
            if line.trim().is_empty() {
                if buf.trim().is_empty() {
                    continue;
                }
                return serde_json::from_str(&buf)
                    .map_err(|e| Error::InvalidResponse(e.to_string()));
            }
            buf.push_str(&line);
        }
    }

    /// The peer on the other end of `scid`, matching confirmed scids and
    /// local aliases.
    pub(crate) async fn scid_peer(&self, scid: ShortChannelId) -> Result<Option<PublicKey>, Error> {
        let channels = self.list_peer_channels(None).await?;
        for c in &channels {
            if c.scid() == Some(scid) || c.local_alias() == Some(scid) {
                return Ok(c.peer_id.as_deref().and_then(|id| PublicKey::from_str(id).ok()));
            }
        }
        Ok(None)
    }

    async fn list_peer_channels(
        &self,
        peer: Option<&PublicKey>,
    ) -> Result<Vec<ClnChannel>, Error> {
        let params = match peer {
            Some(peer) => json!({ "id": peer.to_string() }),
            None => json!({}),
        };
        let res: ListPeerChannelsResult = self.call("listpeerchannels", params).await?;
        Ok(res.channels)
    }
}

#[derive(Deserialize)]
struct GetInfo {
    id: String,
    alias: Option<String>,
}

#[derive(Deserialize)]
struct ListPeersResult {
    peers: Vec<ClnPeer>,
}

#[derive(Deserialize)]
struct ClnPeer {
    #[serde(default)]
    connected: bool,
}

#[derive(Deserialize)]
struct ListPeerChannelsResult {
    channels: Vec<ClnChannel>,
}

#[derive(Deserialize)]
pub(crate) struct ClnAlias {
    pub local: Option<String>,
    #[allow(dead_code)]
    pub remote: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ClnChannel {
    pub peer_id: Option<String>,
    pub state: String,
    pub short_channel_id: Option<String>,
    pub alias: Option<ClnAlias>,
    pub funding_txid: Option<String>,
    pub funding_outnum: Option<u32>,
}

impl ClnChannel {
    pub fn scid(&self) -> Option<ShortChannelId> {
        self.short_channel_id.as_deref().and_then(|s| s.parse().ok())
    }

    pub fn local_alias(&self) -> Option<ShortChannelId> {
        self.alias.as_ref()?.local.as_deref().and_then(|s| s.parse().ok())
    }
}

#[derive(Deserialize)]
struct FundChannelResult {
    txid: String,
    outnum: u32,
}

#[derive(Serialize)]
struct FundChannelParams {
    id: String,
    amount: u64,
    announce: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    feerate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    minconf: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mindepth: Option<u32>,
}

/// CLN feerate parameter for a fee directive; `None` lets lightningd pick.
pub(crate) fn feerate_param(directive: FeeDirective) -> Option<String> {
    match directive {
        FeeDirective::SatPerVbyte(rate) => Some(format!("{}perkb", (rate * 1000.0) as u64)),
        FeeDirective::TargetConf(target) => {
            if target < 3 {
                Some("urgent".to_string())
            } else if target < 30 {
                Some("normal".to_string())
            } else {
                Some("slow".to_string())
            }
        }
        FeeDirective::Default => None,
    }
}

/// Channel points of channels in a CLOSING state, keyed the way the
/// reconciliation candidates are: `"<funding txid>:<scid low 24 bits>"`.
pub(crate) fn closing_channel_points(channels: &[ClnChannel]) -> HashSet<String> {
    let mut lookup = HashSet::new();
    for c in channels {
        if !CLOSING_STATUSES.contains(&c.state.as_str()) {
            continue;
        }
        let scid = match c.scid() {
            Some(scid) => scid,
            None => continue,
        };
        let txid = match &c.funding_txid {
            Some(txid) => txid,
            None => continue,
        };
        lookup.insert(format!("{}:{}", txid, scid.outnum()));
    }
    lookup
}

/// The scid pair for an OPEN channel at `channel_point`.
///
/// The local alias can lag zero-conf negotiation; until it is present the
/// channel is reported as not found so the caller keeps retrying instead
/// of routing over a scid the peer cannot be paid through yet.
fn open_channel_at(channels: &[ClnChannel], channel_point: OutPoint) -> Option<GetChannelResult> {
    let funding_txid = channel_point.txid.to_string();
    for c in channels {
        if !OPEN_STATUSES.contains(&c.state.as_str()) {
            continue;
        }
        if c.funding_txid.as_deref() != Some(funding_txid.as_str())
            || c.funding_outnum != Some(channel_point.vout)
        {
            continue;
        }
        let initial = match c.local_alias() {
            Some(scid) => scid,
            None => continue,
        };
        let confirmed = c.scid().unwrap_or(initial);
        return Some(GetChannelResult { initial_scid: initial, confirmed_scid: confirmed });
    }
    None
}

#[async_trait]
impl NodeClient for ClnClient {
    async fn get_info(&self) -> Result<GetInfoResult, Error> {
        let info: GetInfo = self.call("getinfo", json!({})).await?;
        Ok(GetInfoResult { alias: info.alias.unwrap_or_default(), pubkey: info.id })
    }

    async fn is_connected(&self, destination: &PublicKey) -> Result<bool, Error> {
        let res: ListPeersResult =
            self.call("listpeers", json!({ "id": destination.to_string() })).await?;
        let connected = res.peers.iter().any(|p| p.connected);
        debug!("CLN: destination {} {}", destination, if connected { "online" } else { "offline" });
        Ok(connected)
    }

    async fn open_channel(&self, req: &OpenChannelRequest) -> Result<OutPoint, Error> {
        let feerate = if let Some(rate) = req.fee_sat_per_vbyte {
            feerate_param(FeeDirective::SatPerVbyte(rate))
        } else if let Some(target) = req.target_conf {
            feerate_param(FeeDirective::TargetConf(target))
        } else {
            None
        };
        let params = FundChannelParams {
            id: req.destination.to_string(),
            amount: req.capacity_sat,
            announce: !req.is_private,
            feerate,
            minconf: req.min_confs,
            mindepth: req.is_zero_conf.then_some(0),
        };
        let fund: FundChannelResult = self
            .call(
                "fundchannel",
                serde_json::to_value(params).map_err(|e| Error::InvalidResponse(e.to_string()))?,
            )
            .await?;

        let txid = Txid::from_str(&fund.txid)
            .map_err(|e| Error::InvalidResponse(format!("funding txid {}: {}", fund.txid, e)))?;
        Ok(OutPoint::new(txid, fund.outnum))
    }

    async fn get_channel(
        &self,
        peer: &PublicKey,
        channel_point: OutPoint,
    ) -> Result<GetChannelResult, Error> {
        let channels = self.list_peer_channels(Some(peer)).await?;
        match open_channel_at(&channels, channel_point) {
            Some(result) => Ok(result),
            None => {
                debug!("CLN: no channel found: get_channel({}, {})", peer, channel_point);
                Err(Error::NoChannelFound)
            }
        }
    }

    async fn get_node_channel_count(&self, node: &PublicKey) -> Result<usize, Error> {
        let channels = self.list_peer_channels(Some(node)).await?;
        Ok(channels
            .iter()
            .filter(|c| {
                OPEN_STATUSES.contains(&c.state.as_str())
                    || PENDING_STATUSES.contains(&c.state.as_str())
            })
            .count())
    }

    async fn get_closed_channels(
        &self,
        node: &PublicKey,
        channel_points: &HashMap<String, ShortChannelId>,
    ) -> Result<HashMap<String, ShortChannelId>, Error> {
        if channel_points.is_empty() {
            return Ok(HashMap::new());
        }
        let channels = self.list_peer_channels(Some(node)).await?;
        Ok(filter_live_channels(channel_points, &closing_channel_points(&channels)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feerate_param() {
        assert_eq!(feerate_param(FeeDirective::SatPerVbyte(12.5)), Some("12500perkb".to_string()));
        assert_eq!(feerate_param(FeeDirective::TargetConf(1)), Some("urgent".to_string()));
        assert_eq!(feerate_param(FeeDirective::TargetConf(6)), Some("normal".to_string()));
        assert_eq!(feerate_param(FeeDirective::TargetConf(100)), Some("slow".to_string()));
        assert_eq!(feerate_param(FeeDirective::Default), None);
    }

    #[test]
    fn test_closing_channel_points() {
        let channels = vec![
            ClnChannel {
                peer_id: None,
                state: "CHANNELD_SHUTTING_DOWN".to_string(),
                short_channel_id: Some("1x1x0".to_string()),
                alias: None,
                funding_txid: Some("deadbeef".to_string()),
                funding_outnum: Some(0),
            },
            ClnChannel {
                peer_id: None,
                state: "CHANNELD_NORMAL".to_string(),
                short_channel_id: Some("1x2x1".to_string()),
                alias: None,
                funding_txid: Some("cafebabe".to_string()),
                funding_outnum: Some(1),
            },
        ];
        let closing = closing_channel_points(&channels);
        assert_eq!(closing.len(), 1);
        let scid: ShortChannelId = "1x1x0".parse().unwrap();
        assert!(closing.contains(&format!("deadbeef:{}", scid.outnum())));
    }

    #[test]
    fn test_open_channel_at_waits_for_alias() {
        use bitcoin::hashes::Hash;

        let channel_point = OutPoint::new(Txid::from_slice(&[0xde; 32]).unwrap(), 0);
        let mut channel = ClnChannel {
            peer_id: None,
            state: "CHANNELD_NORMAL".to_string(),
            short_channel_id: Some("103x1x0".to_string()),
            alias: None,
            funding_txid: Some(channel_point.txid.to_string()),
            funding_outnum: Some(0),
        };

        // alias not negotiated yet: the confirmed scid must not stand in
        assert!(open_channel_at(std::slice::from_ref(&channel), channel_point).is_none());

        channel.alias = Some(ClnAlias { local: Some("0x8219x1".to_string()), remote: None });
        let result = open_channel_at(std::slice::from_ref(&channel), channel_point).unwrap();
        assert_eq!(result.initial_scid, "0x8219x1".parse().unwrap());
        assert_eq!(result.confirmed_scid, "103x1x0".parse().unwrap());

        // zero-conf before confirmation: no real scid, alias serves as both
        channel.short_channel_id = None;
        let result = open_channel_at(std::slice::from_ref(&channel), channel_point).unwrap();
        assert_eq!(result.initial_scid, result.confirmed_scid);
    }
}
