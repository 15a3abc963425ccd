//! The JIT-open decision engine.
//!
//! One instance per node. Given the canonical tuple a backend adapter
//! decoded from its intercept stream, decides whether the HTLC passes
//! through untouched, gets rerouted over a freshly opened channel, or
//! fails with a Lightning error code. Every fallible step maps to a
//! failure action; this path never terminates the process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use secp256k1::PublicKey;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::chain::{fee_directive, FeeDirective, FeeEstimator, FeeStrategy};
use crate::config::NodeConfig;
use crate::lightning::{NodeClient, OpenChannelRequest};
use crate::onion;
use crate::scid::ShortChannelId;
use crate::store::{Error as StoreError, InterceptStore, InterceptionRecord, RegisteredPayment};

/// Failure codes an HTLC may be failed back with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InterceptFailureCode {
    TemporaryChannelFailure,
    TemporaryNodeFailure,
    IncorrectOrUnknownPaymentDetails,
}

/// The verdict for one intercepted HTLC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InterceptAction {
    /// Forward unchanged.
    Resume,
    /// Forward over `channel_id` with a rewritten amount and onion.
    ResumeWithOnion { amount_msat: u64, channel_id: ShortChannelId, onion_blob: Vec<u8> },
    Fail { code: InterceptFailureCode },
}

fn fail(code: InterceptFailureCode) -> InterceptAction {
    InterceptAction::Fail { code }
}

/// One long-lived intercept-stream adapter per node.
///
/// `start` runs until `stop` is called or the adapter hits a fatal error;
/// `stop` returns only after in-flight HTLC decisions have drained and
/// their responses are sent (or the stream is gone).
#[async_trait]
pub trait HtlcInterceptor: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self);
}

const HASH_LOCK_STRIPES: usize = 64;

// zero-conf negotiation can briefly leave the alias unset after a
// successful open; poll before giving up on the HTLC
const GET_CHANNEL_ATTEMPTS: u32 = 10;
const GET_CHANNEL_DELAY: Duration = Duration::from_millis(500);

pub struct Interceptor {
    client: Arc<dyn NodeClient>,
    config: Arc<NodeConfig>,
    store: Arc<dyn InterceptStore>,
    fee_estimator: Option<Arc<dyn FeeEstimator>>,
    fee_strategy: FeeStrategy,
    hash_locks: Vec<Mutex<()>>,
}

impl Interceptor {
    pub fn new(
        client: Arc<dyn NodeClient>,
        config: Arc<NodeConfig>,
        store: Arc<dyn InterceptStore>,
        fee_estimator: Option<Arc<dyn FeeEstimator>>,
        fee_strategy: FeeStrategy,
    ) -> Self {
        let hash_locks = (0..HASH_LOCK_STRIPES).map(|_| Mutex::new(())).collect();
        Interceptor { client, config, store, fee_estimator, fee_strategy, hash_locks }
    }

    /// Decide the fate of one HTLC.
    ///
    /// Concurrent calls for the same payment hash serialize on a striped
    /// advisory lock so only one enters the open/persist section; across
    /// processes the store's unique key on the hash settles the race.
    pub async fn intercept(
        &self,
        next_hop: Option<PublicKey>,
        payment_hash: [u8; 32],
        outgoing_amount_msat: u64,
        outgoing_expiry: u32,
        incoming_expiry: u32,
        onion_blob: &[u8],
    ) -> InterceptAction {
        let stripe = payment_hash[31] as usize % HASH_LOCK_STRIPES;
        let _guard = self.hash_locks[stripe].lock().await;

        info!(
            "intercepted htlc: hash {}, next hop {}, outgoing {} msat, expiry {}/{}",
            hex::encode(payment_hash),
            next_hop.map(|k| k.to_string()).unwrap_or_else(|| "<unknown>".to_string()),
            outgoing_amount_msat,
            incoming_expiry,
            outgoing_expiry,
        );

        // a prior commitment answers any replay deterministically
        match self.store.lookup(&payment_hash).await {
            Ok(Some(rec)) => return replay(rec),
            Ok(None) => {}
            Err(e) => {
                error!("store lookup({}) error: {}", hex::encode(payment_hash), e);
                return fail(InterceptFailureCode::TemporaryNodeFailure);
            }
        }

        let reg = match self.store.lookup_registration(&payment_hash).await {
            Ok(Some(reg)) => reg,
            // not for us, forward as-is
            Ok(None) => return InterceptAction::Resume,
            Err(e) => {
                error!("registration lookup({}) error: {}", hex::encode(payment_hash), e);
                return fail(InterceptFailureCode::TemporaryNodeFailure);
            }
        };

        if outgoing_amount_msat < reg.outgoing_amount_msat {
            warn!(
                "htlc {} pays {} msat, registered {} msat",
                hex::encode(payment_hash),
                outgoing_amount_msat,
                reg.outgoing_amount_msat
            );
            return fail(InterceptFailureCode::IncorrectOrUnknownPaymentDetails);
        }
        if incoming_expiry.saturating_sub(outgoing_expiry) < self.config.time_lock_delta {
            warn!(
                "htlc {} cltv delta {} below required {}",
                hex::encode(payment_hash),
                incoming_expiry.saturating_sub(outgoing_expiry),
                self.config.time_lock_delta
            );
            return fail(InterceptFailureCode::IncorrectOrUnknownPaymentDetails);
        }

        match self.client.is_connected(&reg.destination).await {
            Ok(true) => {}
            Ok(false) => {
                info!("destination {} offline, failing htlc", reg.destination);
                return fail(InterceptFailureCode::TemporaryChannelFailure);
            }
            Err(e) => {
                error!("is_connected({}) error: {}", reg.destination, e);
                return fail(InterceptFailureCode::TemporaryChannelFailure);
            }
        }

        let (channel_point, scid_alias) = match self.open_channel(&reg).await {
            Ok(opened) => opened,
            Err(code) => return fail(code),
        };

        let new_onion = match onion::rewrite(
            onion_blob,
            scid_alias,
            reg.outgoing_amount_msat,
            outgoing_expiry,
        ) {
            Ok(blob) => blob,
            Err(e) => {
                error!("onion rewrite for {} failed: {}", hex::encode(payment_hash), e);
                return fail(InterceptFailureCode::TemporaryChannelFailure);
            }
        };

        let rec = InterceptionRecord {
            payment_hash,
            channel_point,
            scid_alias,
            onion_blob: new_onion,
            outgoing_amount_msat: reg.outgoing_amount_msat,
            incoming_amount_msat: reg.incoming_amount_msat,
            outgoing_expiry,
            incoming_expiry,
            token: reg.token.clone(),
            created_at: Utc::now(),
        };
        match self.store.insert(&rec).await {
            Ok(()) => {
                info!(
                    "opened channel {} (alias {}) for payment {}",
                    channel_point,
                    scid_alias,
                    hex::encode(payment_hash)
                );
            }
            Err(StoreError::Duplicate) => {
                // a concurrent racer on another process won; adopt its
                // record and leave our channel for future use
                warn!(
                    "lost insert race for {}, adopting committed record",
                    hex::encode(payment_hash)
                );
                match self.store.lookup(&payment_hash).await {
                    Ok(Some(winner)) => return replay(winner),
                    Ok(None) | Err(_) => {
                        return fail(InterceptFailureCode::TemporaryChannelFailure)
                    }
                }
            }
            Err(e) => {
                error!("persisting interception for {}: {}", hex::encode(payment_hash), e);
                return fail(InterceptFailureCode::TemporaryChannelFailure);
            }
        }

        InterceptAction::ResumeWithOnion {
            amount_msat: rec.outgoing_amount_msat,
            channel_id: rec.scid_alias,
            onion_blob: rec.onion_blob,
        }
    }

    /// Opens the zero-conf channel and resolves its alias scid.
    async fn open_channel(
        &self,
        reg: &RegisteredPayment,
    ) -> Result<(bitcoin::OutPoint, ShortChannelId), InterceptFailureCode> {
        let mut req = OpenChannelRequest {
            destination: reg.destination,
            capacity_sat: if reg.channel_capacity_sat > 0 {
                reg.channel_capacity_sat
            } else {
                self.config.channel_capacity_sat
            },
            min_htlc_msat: self.config.min_htlc_msat,
            is_private: self.config.channel_private,
            is_zero_conf: true,
            min_confs: self.config.min_confs,
            fee_sat_per_vbyte: None,
            target_conf: self.config.target_conf,
        };

        let estimate = match &self.fee_estimator {
            Some(estimator) => match estimator.recommended_fees().await {
                Ok(fees) => Some(fees),
                Err(e) => {
                    warn!("fee estimation failed, falling back to target conf: {}", e);
                    None
                }
            },
            None => None,
        };
        match fee_directive(self.fee_strategy, estimate.as_ref(), self.config.target_conf) {
            FeeDirective::SatPerVbyte(rate) => req.fee_sat_per_vbyte = Some(rate),
            FeeDirective::TargetConf(t) => req.target_conf = Some(t),
            FeeDirective::Default => {}
        }

        let channel_point = match self.client.open_channel(&req).await {
            Ok(cp) => cp,
            Err(e) => {
                error!("open_channel to {} failed: {}", reg.destination, e);
                return Err(InterceptFailureCode::TemporaryChannelFailure);
            }
        };

        for attempt in 1..=GET_CHANNEL_ATTEMPTS {
            match self.client.get_channel(&reg.destination, channel_point).await {
                Ok(chan) => return Ok((channel_point, chan.initial_scid)),
                Err(e) if attempt < GET_CHANNEL_ATTEMPTS => {
                    info!(
                        "get_channel({}, {}) attempt {}: {}",
                        reg.destination, channel_point, attempt, e
                    );
                    sleep(GET_CHANNEL_DELAY).await;
                }
                Err(e) => {
                    error!(
                        "channel {} to {} never reached an open state: {}",
                        channel_point, reg.destination, e
                    );
                }
            }
        }
        Err(InterceptFailureCode::TemporaryChannelFailure)
    }
}

fn replay(rec: InterceptionRecord) -> InterceptAction {
    InterceptAction::ResumeWithOnion {
        amount_msat: rec.outgoing_amount_msat,
        channel_id: rec.scid_alias,
        onion_blob: rec.onion_blob,
    }
}
