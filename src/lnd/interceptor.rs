use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tonic::{Code, Request};
use triggered::{Listener, Trigger};

use super::{ForwardingHistorySync, LndClient};
use crate::config::NodeConfig;
use crate::interceptor::{HtlcInterceptor, InterceptAction, InterceptFailureCode, Interceptor};
use crate::lnrpc::failure::FailureCode;
use crate::routerrpc::{
    ForwardHtlcInterceptRequest, ForwardHtlcInterceptResponse, ResolveHoldForwardAction,
};
use crate::util::WaitGroup;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Long-lived adapter between one LND node's HTLC-intercept stream and the
/// decision engine. Reconnects forever until stopped.
pub struct LndHtlcInterceptor {
    config: Arc<NodeConfig>,
    client: Arc<LndClient>,
    fwsync: Arc<ForwardingHistorySync>,
    interceptor: Arc<Interceptor>,
    stop_requested: AtomicBool,
    inflight: WaitGroup,
    cancel_trigger: Trigger,
    cancel_listener: Listener,
}

impl LndHtlcInterceptor {
    pub fn new(
        config: Arc<NodeConfig>,
        client: Arc<LndClient>,
        fwsync: Arc<ForwardingHistorySync>,
        interceptor: Arc<Interceptor>,
    ) -> Self {
        let (cancel_trigger, cancel_listener) = triggered::trigger();
        LndHtlcInterceptor {
            config,
            client,
            fwsync,
            interceptor,
            stop_requested: AtomicBool::new(false),
            inflight: WaitGroup::new(),
            cancel_trigger,
            cancel_listener,
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    async fn intercept_loop(&self) -> Result<()> {
        loop {
            if self.stop_requested() {
                return Ok(());
            }

            info!("connecting LND HTLC interceptor");
            let (tx, mut rx) = mpsc::channel::<ForwardHtlcInterceptResponse>(128);
            let outbound = async_stream::stream! {
                while let Some(resp) = rx.recv().await {
                    yield resp;
                }
            };
            let mut router = self.client.router();
            let mut stream = tokio::select! {
                _ = self.cancel_listener.clone() => return Ok(()),
                res = router.htlc_interceptor(Request::new(outbound)) => {
                    match res {
                        Ok(response) => response.into_inner(),
                        Err(status) => {
                            warn!("router.htlc_interceptor(): {}", status);
                            tokio::select! {
                                _ = self.cancel_listener.clone() => return Ok(()),
                                _ = sleep(RECONNECT_DELAY) => continue,
                            }
                        }
                    }
                }
            };

            loop {
                // stop drains in-flight work in stop(); we just quit
                // receiving here
                if self.stop_requested() {
                    return Ok(());
                }

                let request = tokio::select! {
                    _ = self.cancel_listener.clone() => return Ok(()),
                    msg = stream.message() => match msg {
                        Ok(Some(request)) => request,
                        Ok(None) => {
                            warn!("LND interceptor stream closed by node");
                            break;
                        }
                        Err(status) if status.code() == Code::Cancelled => {
                            debug!("LND interceptor stream cancelled");
                            break;
                        }
                        Err(status) => {
                            warn!("unexpected error in interceptor recv: {}", status);
                            break;
                        }
                    },
                };

                self.dispatch(request, tx.clone()).await;
            }

            tokio::select! {
                _ = self.cancel_listener.clone() => return Ok(()),
                _ = sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    /// Hand one HTLC to its own task; a slow channel open must not block
    /// the stream.
    async fn dispatch(
        &self,
        request: ForwardHtlcInterceptRequest,
        tx: mpsc::Sender<ForwardHtlcInterceptResponse>,
    ) {
        let next_hop = match self
            .client
            .next_hop_pubkey(request.outgoing_requested_chan_id, &self.config.node_pubkey)
            .await
        {
            Ok(hop) => hop,
            Err(e) => {
                debug!(
                    "next hop lookup for chan {} failed: {}",
                    request.outgoing_requested_chan_id, e
                );
                None
            }
        };

        let payment_hash: [u8; 32] = match request.payment_hash.clone().try_into() {
            Ok(hash) => hash,
            Err(_) => {
                error!("htlc with {}-byte payment hash, resuming", request.payment_hash.len());
                let _ = tx.send(resume_unchanged(&request)).await;
                return;
            }
        };

        let interceptor = self.interceptor.clone();
        let guard = self.inflight.add();
        tokio::spawn(async move {
            let action = interceptor
                .intercept(
                    next_hop,
                    payment_hash,
                    request.outgoing_amount_msat,
                    request.outgoing_expiry,
                    request.incoming_expiry,
                    &request.onion_blob,
                )
                .await;

            let response = match action {
                InterceptAction::ResumeWithOnion { amount_msat, channel_id, onion_blob } => {
                    ForwardHtlcInterceptResponse {
                        incoming_circuit_key: request.incoming_circuit_key.clone(),
                        action: ResolveHoldForwardAction::Resume as i32,
                        outgoing_amount_msat: amount_msat,
                        outgoing_requested_chan_id: channel_id.0,
                        onion_blob,
                        ..Default::default()
                    }
                }
                InterceptAction::Fail { code } => ForwardHtlcInterceptResponse {
                    incoming_circuit_key: request.incoming_circuit_key.clone(),
                    action: ResolveHoldForwardAction::Fail as i32,
                    failure_code: map_failure_code(code) as i32,
                    ..Default::default()
                },
                InterceptAction::Resume => resume_unchanged(&request),
            };

            if tx.send(response).await.is_err() {
                warn!("interceptor stream went away before response could be sent");
            }
            drop(guard);
        });
    }
}

fn resume_unchanged(request: &ForwardHtlcInterceptRequest) -> ForwardHtlcInterceptResponse {
    ForwardHtlcInterceptResponse {
        incoming_circuit_key: request.incoming_circuit_key.clone(),
        action: ResolveHoldForwardAction::Resume as i32,
        outgoing_amount_msat: request.outgoing_amount_msat,
        outgoing_requested_chan_id: request.outgoing_requested_chan_id,
        onion_blob: request.onion_blob.clone(),
        ..Default::default()
    }
}

fn map_failure_code(code: InterceptFailureCode) -> FailureCode {
    match code {
        InterceptFailureCode::TemporaryChannelFailure => FailureCode::TemporaryChannelFailure,
        InterceptFailureCode::TemporaryNodeFailure => FailureCode::TemporaryNodeFailure,
        InterceptFailureCode::IncorrectOrUnknownPaymentDetails => {
            FailureCode::IncorrectOrUnknownPaymentDetails
        }
    }
}

#[async_trait]
impl HtlcInterceptor for LndHtlcInterceptor {
    async fn start(&self) -> Result<()> {
        let fwsync = self.fwsync.clone();
        let cancel = self.cancel_listener.clone();
        tokio::spawn(async move { fwsync.forwarding_history_synchronize(cancel).await });
        let fwsync = self.fwsync.clone();
        let cancel = self.cancel_listener.clone();
        tokio::spawn(async move { fwsync.channels_synchronize(cancel).await });

        self.intercept_loop().await
    }

    async fn stop(&self) {
        // stop receiving, let handled htlcs finish, then drop the stream
        self.stop_requested.store(true, Ordering::Release);
        self.inflight.wait().await;
        self.cancel_trigger.trigger();
    }
}
