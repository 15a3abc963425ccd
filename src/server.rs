//! Wallet-facing admin gRPC server.
//!
//! Wallets call `ChannelInformation` to learn the LSP's parameters and
//! `RegisterPayment` to announce a payment the interceptor should open a
//! channel for.

use std::sync::Arc;

use bitcoin::hashes::{sha256, Hash};
use log::{info, warn};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use tonic::{transport::Server, Request, Response, Status};
use triggered::Listener;

use crate::config::NodeConfig;
use crate::lightning::NodeClient;
use crate::proto::channel_opener_server::{ChannelOpener, ChannelOpenerServer};
use crate::proto::{
    ChannelInformationReply, ChannelInformationRequest, RegisterPaymentReply,
    RegisterPaymentRequest,
};
use crate::store::{InterceptStore, RegisteredPayment};

pub struct GrpcServer {
    node_config: Arc<NodeConfig>,
    node_client: Arc<dyn NodeClient>,
    store: Arc<dyn InterceptStore>,
    private_key: SecretKey,
}

impl GrpcServer {
    pub fn new(
        node_config: Arc<NodeConfig>,
        node_client: Arc<dyn NodeClient>,
        store: Arc<dyn InterceptStore>,
        private_key: SecretKey,
    ) -> Self {
        GrpcServer { node_config, node_client, store, private_key }
    }

    /// Serve until `shutdown` fires.
    pub async fn run(
        self,
        address: String,
        certmagic_domain: Option<String>,
        shutdown: Listener,
    ) -> anyhow::Result<()> {
        if let Some(domain) = certmagic_domain {
            // certificate provisioning for the domain is handled in front
            // of the daemon
            info!("admin server expects TLS for {} to be terminated upstream", domain);
        }
        let addr = address.parse()?;
        info!("admin server listening on {}", addr);
        Server::builder()
            .add_service(ChannelOpenerServer::new(self))
            .serve_with_shutdown(addr, shutdown)
            .await?;
        Ok(())
    }

    fn sign_channel_information(&self, reply: &ChannelInformationReply) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(reply.name.as_bytes());
        data.extend_from_slice(reply.pubkey.as_bytes());
        data.extend_from_slice(reply.host.as_bytes());
        data.extend_from_slice(&reply.channel_capacity.to_be_bytes());
        data.extend_from_slice(&reply.target_conf.to_be_bytes());
        data.extend_from_slice(&reply.min_htlc_msat.to_be_bytes());
        data.extend_from_slice(&reply.time_lock_delta.to_be_bytes());
        data.push(reply.zero_conf as u8);
        let digest = sha256::Hash::hash(&data);
        let message = Message::from_slice(digest.as_ref()).expect("sha256 is 32 bytes");
        let secp = Secp256k1::signing_only();
        secp.sign_ecdsa(&message, &self.private_key).serialize_compact().to_vec()
    }
}

#[tonic::async_trait]
impl ChannelOpener for GrpcServer {
    async fn channel_information(
        &self,
        _request: Request<ChannelInformationRequest>,
    ) -> Result<Response<ChannelInformationReply>, Status> {
        let info = self
            .node_client
            .get_info()
            .await
            .map_err(|e| Status::internal(format!("get_info: {}", e)))?;

        let secp = Secp256k1::signing_only();
        let lsp_pubkey = PublicKey::from_secret_key(&secp, &self.private_key);

        let mut reply = ChannelInformationReply {
            name: info.alias,
            pubkey: info.pubkey,
            host: self.node_config.host.clone(),
            channel_capacity: self.node_config.channel_capacity_sat as i64,
            target_conf: self.node_config.target_conf.unwrap_or(6),
            min_htlc_msat: self.node_config.min_htlc_msat,
            time_lock_delta: self.node_config.time_lock_delta,
            zero_conf: self.node_config.channel_zero_conf,
            lsp_pubkey: lsp_pubkey.serialize().to_vec(),
            signature: Vec::new(),
        };
        reply.signature = self.sign_channel_information(&reply);
        Ok(Response::new(reply))
    }

    async fn register_payment(
        &self,
        request: Request<RegisterPaymentRequest>,
    ) -> Result<Response<RegisterPaymentReply>, Status> {
        let req = request.into_inner();

        let payment_hash: [u8; 32] = req
            .payment_hash
            .try_into()
            .map_err(|_| Status::invalid_argument("payment_hash must be 32 bytes"))?;
        let destination = PublicKey::from_slice(&req.destination)
            .map_err(|_| Status::invalid_argument("destination is not a valid pubkey"))?;
        if req.incoming_amount_msat <= 0 || req.outgoing_amount_msat <= 0 {
            return Err(Status::invalid_argument("amounts must be positive"));
        }
        if req.outgoing_amount_msat > req.incoming_amount_msat {
            return Err(Status::invalid_argument(
                "outgoing amount must not exceed incoming amount",
            ));
        }
        if req.channel_capacity_sat < 0 {
            return Err(Status::invalid_argument("channel capacity must not be negative"));
        }
        if req.token.is_empty() {
            return Err(Status::permission_denied("missing token"));
        }

        let registration = RegisteredPayment {
            payment_hash,
            payment_secret: req.payment_secret,
            destination,
            incoming_amount_msat: req.incoming_amount_msat as u64,
            outgoing_amount_msat: req.outgoing_amount_msat as u64,
            channel_capacity_sat: req.channel_capacity_sat as u64,
            token: req.token,
        };
        self.store.register_payment(&registration).await.map_err(|e| {
            warn!("register_payment({}): {}", hex::encode(payment_hash), e);
            Status::internal("failed to persist registration")
        })?;

        let channels = self.node_client.get_node_channel_count(&destination).await.unwrap_or(0);
        info!(
            "registered payment {} for {} ({} channels open or pending)",
            hex::encode(payment_hash),
            destination,
            channels
        );
        Ok(Response::new(RegisterPaymentReply {}))
    }
}
