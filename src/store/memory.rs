//! In-memory store, for tests and local development. Same contract as the
//! Postgres store, minus durability.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Error, ForwardingEvent, InterceptStore, InterceptionRecord, RegisteredPayment};
use crate::scid::ShortChannelId;

#[derive(Default)]
struct Inner {
    payments: HashMap<[u8; 32], RegisteredPayment>,
    interceptions: HashMap<[u8; 32], InterceptionRecord>,
    channel_opens: HashMap<String, ShortChannelId>,
    forwarding_events: Vec<ForwardingEvent>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interception_count(&self) -> usize {
        self.inner.lock().unwrap().interceptions.len()
    }
}

#[async_trait]
impl InterceptStore for MemoryStore {
    async fn lookup(&self, payment_hash: &[u8; 32]) -> Result<Option<InterceptionRecord>, Error> {
        Ok(self.inner.lock().unwrap().interceptions.get(payment_hash).cloned())
    }

    async fn lookup_registration(
        &self,
        payment_hash: &[u8; 32],
    ) -> Result<Option<RegisteredPayment>, Error> {
        Ok(self.inner.lock().unwrap().payments.get(payment_hash).cloned())
    }

    async fn insert(&self, rec: &InterceptionRecord) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.interceptions.contains_key(&rec.payment_hash) {
            return Err(Error::Duplicate);
        }
        inner.interceptions.insert(rec.payment_hash, rec.clone());
        Ok(())
    }

    async fn register_payment(&self, reg: &RegisteredPayment) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.payments.entry(reg.payment_hash).or_insert_with(|| reg.clone());
        Ok(())
    }

    async fn mark_channel_opened(
        &self,
        channel_point: &str,
        scid: ShortChannelId,
    ) -> Result<(), Error> {
        self.inner.lock().unwrap().channel_opens.insert(channel_point.to_string(), scid);
        Ok(())
    }

    async fn open_channel_points(&self) -> Result<HashMap<String, ShortChannelId>, Error> {
        Ok(self.inner.lock().unwrap().channel_opens.clone())
    }

    async fn remove_channel_points(&self, channel_points: &[String]) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        for cp in channel_points {
            inner.channel_opens.remove(cp);
        }
        Ok(())
    }

    async fn insert_forwarding_events(&self, events: &[ForwardingEvent]) -> Result<(), Error> {
        self.inner.lock().unwrap().forwarding_events.extend_from_slice(events);
        Ok(())
    }

    async fn last_forwarding_event(&self) -> Result<Option<u64>, Error> {
        Ok(self.inner.lock().unwrap().forwarding_events.iter().map(|e| e.timestamp_ns).max())
    }
}
