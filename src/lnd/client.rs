use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Txid};
use log::{debug, info};
use secp256k1::PublicKey;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Certificate, Channel, ClientTlsConfig};
use tonic::{Request, Status};

use crate::config::LndConfig;
use crate::lightning::{
    filter_live_channels, Error, GetChannelResult, GetInfoResult, NodeClient, OpenChannelRequest,
};
use crate::lnrpc::lightning_client::LightningClient;
use crate::lnrpc::{self, channel_point::FundingTxid};
use crate::routerrpc::router_client::RouterClient;
use crate::scid::ShortChannelId;

const RPC_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct MacaroonInterceptor {
    macaroon: MetadataValue<Ascii>,
}

impl tonic::service::Interceptor for MacaroonInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        request.metadata_mut().insert("macaroon", self.macaroon.clone());
        Ok(request)
    }
}

type LndChannel = InterceptedService<Channel, MacaroonInterceptor>;

/// gRPC client for one LND node.
#[derive(Clone)]
pub struct LndClient {
    channel: Channel,
    macaroon: MetadataValue<Ascii>,
}

impl LndClient {
    pub fn new(config: &LndConfig) -> Result<Self, Error> {
        let tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(&config.cert));
        let channel = Channel::from_shared(config.address.clone())
            .map_err(|e| Error::Transport(e.to_string()))?
            .tls_config(tls)?
            .timeout(RPC_TIMEOUT)
            .connect_lazy();
        let macaroon = config
            .macaroon
            .parse()
            .map_err(|_| Error::Transport("macaroon is not valid metadata".to_string()))?;
        Ok(LndClient { channel, macaroon })
    }

    fn lightning(&self) -> LightningClient<LndChannel> {
        LightningClient::with_interceptor(
            self.channel.clone(),
            MacaroonInterceptor { macaroon: self.macaroon.clone() },
        )
    }

    pub(crate) fn router(&self) -> RouterClient<LndChannel> {
        RouterClient::with_interceptor(
            self.channel.clone(),
            MacaroonInterceptor { macaroon: self.macaroon.clone() },
        )
    }

    /// Resolves the pubkey on the far side of `chan_id`, given our own
    /// identity.
    pub(crate) async fn next_hop_pubkey(
        &self,
        chan_id: u64,
        own_pubkey: &str,
    ) -> Result<Option<PublicKey>, Error> {
        let edge = self
            .lightning()
            .get_chan_info(lnrpc::ChanInfoRequest { chan_id })
            .await?
            .into_inner();
        let other = if edge.node1_pub == own_pubkey {
            edge.node2_pub
        } else if edge.node2_pub == own_pubkey {
            edge.node1_pub
        } else {
            return Ok(None);
        };
        Ok(PublicKey::from_str(&other).ok())
    }

    /// Channel points of confirmed open channels, with their scids.
    pub(crate) async fn open_channel_scids(
        &self,
    ) -> Result<Vec<(String, ShortChannelId)>, Error> {
        let channels = self
            .lightning()
            .list_channels(lnrpc::ListChannelsRequest::default())
            .await?
            .into_inner()
            .channels;
        Ok(channels
            .into_iter()
            .filter_map(|c| {
                let scid =
                    if c.zero_conf_confirmed_scid != 0 { c.zero_conf_confirmed_scid } else { c.chan_id };
                if scid == 0 {
                    None
                } else {
                    Some((c.channel_point, ShortChannelId(scid)))
                }
            })
            .collect())
    }

    pub(crate) async fn forwarding_history(
        &self,
        start_time: u64,
        index_offset: u32,
        num_max_events: u32,
    ) -> Result<lnrpc::ForwardingHistoryResponse, Error> {
        Ok(self
            .lightning()
            .forwarding_history(lnrpc::ForwardingHistoryRequest {
                start_time,
                end_time: 0,
                index_offset,
                num_max_events,
            })
            .await?
            .into_inner())
    }
}

fn outpoint_from_channel_point(cp: lnrpc::ChannelPoint) -> Result<OutPoint, Error> {
    let txid = match cp.funding_txid {
        Some(FundingTxid::FundingTxidBytes(bytes)) => Txid::from_slice(&bytes)
            .map_err(|e| Error::InvalidResponse(format!("funding txid: {}", e)))?,
        Some(FundingTxid::FundingTxidStr(s)) => Txid::from_str(&s)
            .map_err(|e| Error::InvalidResponse(format!("funding txid {}: {}", s, e)))?,
        None => return Err(Error::InvalidResponse("missing funding txid".to_string())),
    };
    Ok(OutPoint::new(txid, cp.output_index))
}

#[async_trait]
impl NodeClient for LndClient {
    async fn get_info(&self) -> Result<GetInfoResult, Error> {
        let info = self.lightning().get_info(lnrpc::GetInfoRequest {}).await?.into_inner();
        Ok(GetInfoResult { alias: info.alias, pubkey: info.identity_pubkey })
    }

    async fn is_connected(&self, destination: &PublicKey) -> Result<bool, Error> {
        let pubkey = destination.to_string();
        let peers = self
            .lightning()
            .list_peers(lnrpc::ListPeersRequest {})
            .await?
            .into_inner()
            .peers;
        let connected = peers.iter().any(|p| p.pub_key == pubkey);
        debug!("LND: destination {} {}", pubkey, if connected { "online" } else { "offline" });
        Ok(connected)
    }

    async fn open_channel(&self, req: &OpenChannelRequest) -> Result<OutPoint, Error> {
        let mut request = lnrpc::OpenChannelRequest {
            node_pubkey: req.destination.serialize().to_vec(),
            local_funding_amount: req.capacity_sat as i64,
            private: req.is_private,
            min_htlc_msat: req.min_htlc_msat as i64,
            zero_conf: req.is_zero_conf,
            ..Default::default()
        };
        if let Some(min_confs) = req.min_confs {
            request.min_confs = min_confs as i32;
            request.spend_unconfirmed = min_confs == 0;
        }
        // explicit rate beats a confirmation target
        if let Some(rate) = req.fee_sat_per_vbyte {
            request.sat_per_vbyte = rate.round() as u64;
        } else if let Some(target) = req.target_conf {
            request.target_conf = target as i32;
        }

        let cp = self.lightning().open_channel_sync(request).await?.into_inner();
        let outpoint = outpoint_from_channel_point(cp)?;
        info!("LND: opened channel {} to {}", outpoint, req.destination);
        Ok(outpoint)
    }

    async fn get_channel(
        &self,
        peer: &PublicKey,
        channel_point: OutPoint,
    ) -> Result<GetChannelResult, Error> {
        let channels = self
            .lightning()
            .list_channels(lnrpc::ListChannelsRequest {
                peer: peer.serialize().to_vec(),
                ..Default::default()
            })
            .await?
            .into_inner()
            .channels;

        let wanted = channel_point.to_string();
        for c in channels {
            if c.channel_point != wanted || !c.active {
                continue;
            }
            let initial = c.alias_scids.first().copied().unwrap_or(c.chan_id);
            let confirmed =
                if c.zero_conf_confirmed_scid != 0 { c.zero_conf_confirmed_scid } else { c.chan_id };
            return Ok(GetChannelResult {
                initial_scid: ShortChannelId(initial),
                confirmed_scid: ShortChannelId(confirmed),
            });
        }
        Err(Error::NoChannelFound)
    }

    async fn get_node_channel_count(&self, node: &PublicKey) -> Result<usize, Error> {
        let open = self
            .lightning()
            .list_channels(lnrpc::ListChannelsRequest {
                peer: node.serialize().to_vec(),
                ..Default::default()
            })
            .await?
            .into_inner()
            .channels
            .len();

        let pubkey = node.to_string();
        let pending = self
            .lightning()
            .pending_channels(lnrpc::PendingChannelsRequest {})
            .await?
            .into_inner()
            .pending_open_channels
            .iter()
            .filter(|p| p.channel.as_ref().map(|c| c.remote_node_pub == pubkey).unwrap_or(false))
            .count();
        Ok(open + pending)
    }

    async fn get_closed_channels(
        &self,
        _node: &PublicKey,
        channel_points: &HashMap<String, ShortChannelId>,
    ) -> Result<HashMap<String, ShortChannelId>, Error> {
        if channel_points.is_empty() {
            return Ok(HashMap::new());
        }

        let mut closing = HashSet::new();
        let closed = self
            .lightning()
            .closed_channels(lnrpc::ClosedChannelsRequest {})
            .await?
            .into_inner()
            .channels;
        for c in closed {
            closing.insert(c.channel_point);
        }

        let pending =
            self.lightning().pending_channels(lnrpc::PendingChannelsRequest {}).await?.into_inner();
        for wc in pending.waiting_close_channels {
            if let Some(c) = wc.channel {
                closing.insert(c.channel_point);
            }
        }

        Ok(filter_live_channels(channel_points, &closing))
    }
}
