//! Persistent state shared by the interceptors and the admin server.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use bitcoin::OutPoint;
use chrono::{DateTime, Utc};
use secp256k1::PublicKey;
use thiserror::Error;

use crate::scid::ShortChannelId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("pool error: {0}")]
    Pool(String),
    /// an interception for this payment hash already exists
    #[error("duplicate payment hash")]
    Duplicate,
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// An expected payment, registered out-of-band by the wallet through the
/// admin server. Consumed at most once by the interceptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredPayment {
    pub payment_hash: [u8; 32],
    pub payment_secret: Vec<u8>,
    pub destination: PublicKey,
    pub incoming_amount_msat: u64,
    pub outgoing_amount_msat: u64,
    pub channel_capacity_sat: u64,
    pub token: String,
}

/// The committed outcome of a JIT open for one payment hash. Immutable
/// once written; replayed HTLCs are answered from this record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterceptionRecord {
    pub payment_hash: [u8; 32],
    pub channel_point: OutPoint,
    pub scid_alias: ShortChannelId,
    pub onion_blob: Vec<u8>,
    pub outgoing_amount_msat: u64,
    pub incoming_amount_msat: u64,
    pub outgoing_expiry: u32,
    pub incoming_expiry: u32,
    pub token: String,
    pub created_at: DateTime<Utc>,
}

/// One settled forward, as reported by the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardingEvent {
    pub timestamp_ns: u64,
    pub chan_id_in: u64,
    pub chan_id_out: u64,
    pub amt_in_msat: u64,
    pub amt_out_msat: u64,
}

/// Durable mapping from payment hash to registration and committed open.
///
/// `insert` carries the uniqueness constraint that makes the JIT decision
/// idempotent across tasks, restarts, and replicas sharing one database: a
/// second insert for the same hash fails with [`Error::Duplicate`] and the
/// caller adopts the stored record.
#[async_trait]
pub trait InterceptStore: Send + Sync {
    async fn lookup(&self, payment_hash: &[u8; 32]) -> Result<Option<InterceptionRecord>, Error>;

    async fn lookup_registration(
        &self,
        payment_hash: &[u8; 32],
    ) -> Result<Option<RegisteredPayment>, Error>;

    /// Atomic; rejects a duplicate `payment_hash` with [`Error::Duplicate`].
    /// A success is durable before the call returns.
    async fn insert(&self, rec: &InterceptionRecord) -> Result<(), Error>;

    async fn register_payment(&self, reg: &RegisteredPayment) -> Result<(), Error>;

    /// Bookkeeping for the forwarding-history job; never touches the
    /// payment-hash to channel-point mapping.
    async fn mark_channel_opened(
        &self,
        channel_point: &str,
        scid: ShortChannelId,
    ) -> Result<(), Error>;

    /// All channel points currently tracked as open.
    async fn open_channel_points(&self) -> Result<HashMap<String, ShortChannelId>, Error>;

    async fn remove_channel_points(&self, channel_points: &[String]) -> Result<(), Error>;

    async fn insert_forwarding_events(&self, events: &[ForwardingEvent]) -> Result<(), Error>;

    /// Timestamp (ns) of the newest stored forwarding event.
    async fn last_forwarding_event(&self) -> Result<Option<u64>, Error>;
}
