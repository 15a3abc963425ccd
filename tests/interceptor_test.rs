//! Decision-engine scenarios against a scripted node and the in-memory
//! store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Txid};
use secp256k1::{PublicKey, Secp256k1, SecretKey};

use lspd::chain::FeeStrategy;
use lspd::config::NodeConfig;
use lspd::interceptor::{InterceptAction, InterceptFailureCode, Interceptor};
use lspd::lightning::{
    Error, GetChannelResult, GetInfoResult, NodeClient, OpenChannelRequest,
};
use lspd::onion;
use lspd::scid::ShortChannelId;
use lspd::store::memory::MemoryStore;
use lspd::store::{InterceptStore, RegisteredPayment};

struct MockNode {
    connected: bool,
    open_fails: bool,
    /// number of get_channel calls that report no channel before one
    /// succeeds
    channel_not_found_times: AtomicUsize,
    open_delay: Duration,
    outpoint: OutPoint,
    channel: GetChannelResult,
    open_calls: AtomicUsize,
}

impl MockNode {
    fn new() -> Self {
        MockNode {
            connected: true,
            open_fails: false,
            channel_not_found_times: AtomicUsize::new(0),
            open_delay: Duration::ZERO,
            outpoint: OutPoint::new(Txid::from_slice(&[0xde; 32]).unwrap(), 0),
            channel: GetChannelResult {
                initial_scid: ShortChannelId(0x0000010000010001),
                confirmed_scid: ShortChannelId(0x0000010000010001),
            },
            open_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl NodeClient for MockNode {
    async fn get_info(&self) -> Result<GetInfoResult, Error> {
        Ok(GetInfoResult { alias: "mock".to_string(), pubkey: String::new() })
    }

    async fn is_connected(&self, _destination: &PublicKey) -> Result<bool, Error> {
        Ok(self.connected)
    }

    async fn open_channel(&self, _req: &OpenChannelRequest) -> Result<OutPoint, Error> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if self.open_fails {
            return Err(Error::Rpc("insufficient funds".to_string()));
        }
        Ok(self.outpoint)
    }

    async fn get_channel(
        &self,
        _peer: &PublicKey,
        _channel_point: OutPoint,
    ) -> Result<GetChannelResult, Error> {
        if self
            .channel_not_found_times
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::NoChannelFound);
        }
        Ok(self.channel)
    }

    async fn get_node_channel_count(&self, _node: &PublicKey) -> Result<usize, Error> {
        Ok(0)
    }

    async fn get_closed_channels(
        &self,
        _node: &PublicKey,
        channel_points: &HashMap<String, ShortChannelId>,
    ) -> Result<HashMap<String, ShortChannelId>, Error> {
        Ok(channel_points.clone())
    }
}

fn node_config() -> NodeConfig {
    NodeConfig {
        name: "test".to_string(),
        node_pubkey: String::new(),
        host: String::new(),
        lnd: None,
        cln: None,
        channel_capacity_sat: 1_000_000,
        min_htlc_msat: 600,
        channel_private: false,
        channel_zero_conf: true,
        min_confs: Some(0),
        target_conf: Some(6),
        time_lock_delta: 40,
    }
}

fn destination() -> PublicKey {
    let secp = Secp256k1::new();
    PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[0xab; 32]).unwrap())
}

fn incoming_onion() -> Vec<u8> {
    vec![0x55; 1366]
}

async fn register(store: &MemoryStore, payment_hash: [u8; 32]) {
    store
        .register_payment(&RegisteredPayment {
            payment_hash,
            payment_secret: vec![1; 32],
            destination: destination(),
            incoming_amount_msat: 52_000,
            outgoing_amount_msat: 50_000,
            channel_capacity_sat: 100_000,
            token: "token-1".to_string(),
        })
        .await
        .unwrap();
}

fn interceptor(node: Arc<MockNode>, store: Arc<MemoryStore>) -> Interceptor {
    Interceptor::new(node, Arc::new(node_config()), store, None, FeeStrategy::default())
}

#[tokio::test]
async fn test_passthrough_without_registration() {
    let node = Arc::new(MockNode::new());
    let store = Arc::new(MemoryStore::new());
    let engine = interceptor(node.clone(), store.clone());

    let action =
        engine.intercept(None, [0x11; 32], 1000, 100, 140, &incoming_onion()).await;

    assert_eq!(action, InterceptAction::Resume);
    assert_eq!(node.open_calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.interception_count(), 0);
}

#[tokio::test]
async fn test_jit_open_happy_path() {
    let node = Arc::new(MockNode::new());
    let store = Arc::new(MemoryStore::new());
    let engine = interceptor(node.clone(), store.clone());
    let hash = [0x22; 32];
    register(&store, hash).await;

    let action =
        engine.intercept(Some(destination()), hash, 50_000, 100, 144, &incoming_onion()).await;

    let expected_scid = ShortChannelId(0x0000010000010001);
    let expected_onion =
        onion::rewrite(&incoming_onion(), expected_scid, 50_000, 100).unwrap();
    assert_eq!(
        action,
        InterceptAction::ResumeWithOnion {
            amount_msat: 50_000,
            channel_id: expected_scid,
            onion_blob: expected_onion,
        }
    );
    assert_eq!(node.open_calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.interception_count(), 1);

    let rec = store.lookup(&hash).await.unwrap().expect("record persisted");
    assert_eq!(rec.channel_point, node.outpoint);
    assert_eq!(rec.scid_alias, expected_scid);
    assert_eq!(rec.token, "token-1");
}

#[tokio::test]
async fn test_wallet_offline_fails_htlc() {
    let mut mock = MockNode::new();
    mock.connected = false;
    let node = Arc::new(mock);
    let store = Arc::new(MemoryStore::new());
    let engine = interceptor(node.clone(), store.clone());
    let hash = [0x22; 32];
    register(&store, hash).await;

    let action =
        engine.intercept(Some(destination()), hash, 50_000, 100, 144, &incoming_onion()).await;

    assert_eq!(
        action,
        InterceptAction::Fail { code: InterceptFailureCode::TemporaryChannelFailure }
    );
    assert_eq!(node.open_calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.interception_count(), 0);
}

#[tokio::test]
async fn test_replay_reuses_channel() {
    let node = Arc::new(MockNode::new());
    let store = Arc::new(MemoryStore::new());
    let engine = interceptor(node.clone(), store.clone());
    let hash = [0x22; 32];
    register(&store, hash).await;

    let first =
        engine.intercept(Some(destination()), hash, 50_000, 100, 144, &incoming_onion()).await;
    let second =
        engine.intercept(Some(destination()), hash, 50_000, 100, 144, &incoming_onion()).await;

    // bit-for-bit identical, one channel open total
    assert_eq!(first, second);
    assert_eq!(node.open_calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.interception_count(), 1);
}

#[tokio::test]
async fn test_concurrent_duplicate_opens_once() {
    let mut mock = MockNode::new();
    mock.open_delay = Duration::from_millis(50);
    let node = Arc::new(mock);
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(interceptor(node.clone(), store.clone()));
    let hash = [0x33; 32];
    register(&store, hash).await;

    let a = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine.intercept(Some(destination()), hash, 50_000, 100, 144, &incoming_onion()).await
        })
    };
    let b = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine.intercept(Some(destination()), hash, 50_000, 100, 144, &incoming_onion()).await
        })
    };
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    assert_eq!(node.open_calls.load(Ordering::SeqCst), 1);
    assert_eq!(a, b);
    match a {
        InterceptAction::ResumeWithOnion { channel_id, .. } => {
            assert_eq!(channel_id, ShortChannelId(0x0000010000010001))
        }
        other => panic!("expected reroute, got {:?}", other),
    }
}

#[tokio::test]
async fn test_underpaying_htlc_rejected() {
    let node = Arc::new(MockNode::new());
    let store = Arc::new(MemoryStore::new());
    let engine = interceptor(node.clone(), store.clone());
    let hash = [0x44; 32];
    register(&store, hash).await;

    let action =
        engine.intercept(Some(destination()), hash, 49_999, 100, 144, &incoming_onion()).await;

    assert_eq!(
        action,
        InterceptAction::Fail { code: InterceptFailureCode::IncorrectOrUnknownPaymentDetails }
    );
    assert_eq!(node.open_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_insufficient_cltv_delta_rejected() {
    let node = Arc::new(MockNode::new());
    let store = Arc::new(MemoryStore::new());
    let engine = interceptor(node.clone(), store.clone());
    let hash = [0x44; 32];
    register(&store, hash).await;

    // 139 - 100 = 39 < 40
    let action =
        engine.intercept(Some(destination()), hash, 50_000, 100, 139, &incoming_onion()).await;

    assert_eq!(
        action,
        InterceptAction::Fail { code: InterceptFailureCode::IncorrectOrUnknownPaymentDetails }
    );
}

#[tokio::test]
async fn test_open_failure_fails_htlc() {
    let mut mock = MockNode::new();
    mock.open_fails = true;
    let node = Arc::new(mock);
    let store = Arc::new(MemoryStore::new());
    let engine = interceptor(node.clone(), store.clone());
    let hash = [0x55; 32];
    register(&store, hash).await;

    let action =
        engine.intercept(Some(destination()), hash, 50_000, 100, 144, &incoming_onion()).await;

    assert_eq!(
        action,
        InterceptAction::Fail { code: InterceptFailureCode::TemporaryChannelFailure }
    );
    assert_eq!(store.interception_count(), 0);
}

#[tokio::test]
async fn test_alias_negotiation_window_is_retried() {
    let mut mock = MockNode::new();
    // the alias shows up on the third lookup
    mock.channel_not_found_times = AtomicUsize::new(2);
    let node = Arc::new(mock);
    let store = Arc::new(MemoryStore::new());
    let engine = interceptor(node.clone(), store.clone());
    let hash = [0x66; 32];
    register(&store, hash).await;

    let action =
        engine.intercept(Some(destination()), hash, 50_000, 100, 144, &incoming_onion()).await;

    match action {
        InterceptAction::ResumeWithOnion { channel_id, .. } => {
            assert_eq!(channel_id, ShortChannelId(0x0000010000010001))
        }
        other => panic!("expected reroute after retries, got {:?}", other),
    }
    assert_eq!(store.interception_count(), 1);
}
