//! Background reconciliation against the node: mirrors settled forwards
//! into the store and keeps the opened-channel bookkeeping in step with
//! what the node still reports as live.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use secp256k1::PublicKey;
use tokio::time::interval;
use triggered::Listener;

use super::LndClient;
use crate::lightning::NodeClient;
use crate::store::{Error as StoreError, ForwardingEvent, InterceptStore};

const SYNC_INTERVAL: Duration = Duration::from_secs(60);
const FORWARDS_PER_PAGE: u32 = 10_000;

pub struct ForwardingHistorySync {
    client: Arc<LndClient>,
    node_pubkey: PublicKey,
    store: Arc<dyn InterceptStore>,
}

impl ForwardingHistorySync {
    pub fn new(
        client: Arc<LndClient>,
        node_pubkey: PublicKey,
        store: Arc<dyn InterceptStore>,
    ) -> Self {
        ForwardingHistorySync { client, node_pubkey, store }
    }

    pub async fn forwarding_history_synchronize(self: Arc<Self>, cancel: Listener) {
        let mut ticker = interval(SYNC_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.clone() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_forwarding_events().await {
                        error!("forwarding history sync: {}", e);
                    }
                }
            }
        }
    }

    pub async fn channels_synchronize(self: Arc<Self>, cancel: Listener) {
        let mut ticker = interval(SYNC_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.clone() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_channels().await {
                        error!("channels sync: {}", e);
                    }
                }
            }
        }
    }

    async fn sync_forwarding_events(&self) -> Result<(), StoreError> {
        let last = self.store.last_forwarding_event().await?;
        let start_time = last.map(|ns| ns / 1_000_000_000).unwrap_or(0);
        let mut index_offset = 0u32;

        loop {
            let page = match self
                .client
                .forwarding_history(start_time, index_offset, FORWARDS_PER_PAGE)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    error!("forwarding_history rpc: {}", e);
                    return Ok(());
                }
            };
            if page.forwarding_events.is_empty() {
                return Ok(());
            }

            let events: Vec<ForwardingEvent> = page
                .forwarding_events
                .iter()
                .map(|ev| ForwardingEvent {
                    timestamp_ns: ev.timestamp_ns,
                    chan_id_in: ev.chan_id_in,
                    chan_id_out: ev.chan_id_out,
                    amt_in_msat: ev.amt_in_msat,
                    amt_out_msat: ev.amt_out_msat,
                })
                .collect();
            let count = events.len();
            self.store.insert_forwarding_events(&events).await?;
            debug!("stored {} forwarding events", count);

            if count < FORWARDS_PER_PAGE as usize {
                return Ok(());
            }
            index_offset = page.last_offset_index;
        }
    }

    async fn sync_channels(&self) -> Result<(), StoreError> {
        let open = match self.client.open_channel_scids().await {
            Ok(open) => open,
            Err(e) => {
                error!("open_channel_scids rpc: {}", e);
                return Ok(());
            }
        };
        for (channel_point, scid) in open {
            self.store.mark_channel_opened(&channel_point, scid).await?;
        }

        let candidates = self.store.open_channel_points().await?;
        if candidates.is_empty() {
            return Ok(());
        }
        let live = match self.client.get_closed_channels(&self.node_pubkey, &candidates).await {
            Ok(live) => live,
            Err(e) => {
                error!("get_closed_channels rpc: {}", e);
                return Ok(());
            }
        };
        let closed: Vec<String> =
            candidates.keys().filter(|cp| !live.contains_key(*cp)).cloned().collect();
        if !closed.is_empty() {
            info!("pruning {} closed channels from bookkeeping", closed.len());
            self.store.remove_channel_points(&closed).await?;
        }
        Ok(())
    }
}
