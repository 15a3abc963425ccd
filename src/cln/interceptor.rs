//! Adapter between CLN's `htlc_accepted` hook and the decision engine.
//!
//! lightningd cannot call out of process by itself; a small hook-forwarder
//! plugin connects to the unix socket this adapter listens on and relays
//! each `htlc_accepted` invocation as a newline-delimited JSON-RPC request.
//! The response carries the hook verdict back: `continue` (optionally with
//! a replacement payload and forward scid) or `fail` with a BOLT-04
//! failure code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::time::sleep;
use triggered::{Listener, Trigger};

use super::ClnClient;
use crate::config::NodeConfig;
use crate::interceptor::{HtlcInterceptor, InterceptAction, InterceptFailureCode, Interceptor};
use crate::scid::ShortChannelId;
use crate::util::WaitGroup;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Deserialize)]
struct HookRequest {
    id: Value,
    method: String,
    params: HookParams,
}

#[derive(Deserialize)]
struct HookParams {
    onion: HookOnion,
    htlc: HookHtlc,
}

#[derive(Deserialize)]
struct HookOnion {
    short_channel_id: Option<String>,
    forward_msat: Option<Value>,
    outgoing_cltv_value: Option<u32>,
    next_onion: Option<String>,
}

#[derive(Deserialize)]
struct HookHtlc {
    payment_hash: String,
    cltv_expiry: u32,
    #[allow(dead_code)]
    amount_msat: Option<Value>,
}

#[derive(Serialize)]
struct HookResult {
    result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    forward_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_message: Option<String>,
}

/// Amounts arrive either as a bare number or a `"…msat"` string.
fn parse_msat(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.strip_suffix("msat").unwrap_or(s).parse().ok(),
        _ => None,
    }
}

fn continue_unchanged() -> HookResult {
    HookResult { result: "continue", payload: None, forward_to: None, failure_message: None }
}

fn failure_message(code: InterceptFailureCode) -> &'static str {
    match code {
        InterceptFailureCode::TemporaryChannelFailure => "1007",
        InterceptFailureCode::TemporaryNodeFailure => "2002",
        InterceptFailureCode::IncorrectOrUnknownPaymentDetails => "400f",
    }
}

fn encode_action(action: InterceptAction) -> HookResult {
    match action {
        InterceptAction::Resume => continue_unchanged(),
        InterceptAction::ResumeWithOnion { channel_id, onion_blob, .. } => HookResult {
            result: "continue",
            payload: Some(hex::encode(onion_blob)),
            forward_to: Some(channel_id.to_string()),
            failure_message: None,
        },
        InterceptAction::Fail { code } => HookResult {
            result: "fail",
            payload: None,
            forward_to: None,
            failure_message: Some(failure_message(code).to_string()),
        },
    }
}

/// Long-lived adapter serving the hook forwarder of one CLN node.
pub struct ClnHtlcInterceptor {
    client: Arc<ClnClient>,
    interceptor: Arc<Interceptor>,
    hook_socket_path: String,
    stop_requested: AtomicBool,
    inflight: WaitGroup,
    cancel_trigger: Trigger,
    cancel_listener: Listener,
}

impl ClnHtlcInterceptor {
    pub fn new(
        config: &NodeConfig,
        client: Arc<ClnClient>,
        interceptor: Arc<Interceptor>,
    ) -> Result<Self> {
        let hook_socket_path = config
            .cln
            .as_ref()
            .map(|c| c.hook_socket_path.clone())
            .ok_or_else(|| anyhow::anyhow!("node {} has no cln config", config.node_pubkey))?;
        let (cancel_trigger, cancel_listener) = triggered::trigger();
        Ok(ClnHtlcInterceptor {
            client,
            interceptor,
            hook_socket_path,
            stop_requested: AtomicBool::new(false),
            inflight: WaitGroup::new(),
            cancel_trigger,
            cancel_listener,
        })
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    async fn accept_loop(&self) -> Result<()> {
        // a previous run may have left the socket file behind
        let _ = std::fs::remove_file(&self.hook_socket_path);
        let listener = UnixListener::bind(&self.hook_socket_path)?;
        info!("CLN hook listener on {}", self.hook_socket_path);

        loop {
            if self.stop_requested() {
                return Ok(());
            }
            let stream = tokio::select! {
                _ = self.cancel_listener.clone() => return Ok(()),
                res = listener.accept() => match res {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("hook accept: {}", e);
                        tokio::select! {
                            _ = self.cancel_listener.clone() => return Ok(()),
                            _ = sleep(RECONNECT_DELAY) => continue,
                        }
                    }
                },
            };
            info!("CLN hook forwarder connected");
            self.serve_connection(stream).await;

            tokio::select! {
                _ = self.cancel_listener.clone() => return Ok(()),
                _ = sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn serve_connection(&self, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let writer = Arc::new(Mutex::new(write_half));

        loop {
            if self.stop_requested() {
                return;
            }
            let mut line = String::new();
            let read = tokio::select! {
                _ = self.cancel_listener.clone() => return,
                res = reader.read_line(&mut line) => res,
            };
            match read {
                Ok(0) => {
                    warn!("hook forwarder disconnected");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("hook read: {}", e);
                    return;
                }
            }
            if line.trim().is_empty() {
                continue;
            }

            let request: HookRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!("undecodable hook request: {}", e);
                    continue;
                }
            };
            if request.method != "htlc_accepted" {
                debug!("ignoring hook method {}", request.method);
                continue;
            }
            self.dispatch(request, writer.clone()).await;
        }
    }

    async fn dispatch(&self, request: HookRequest, writer: Arc<Mutex<OwnedWriteHalf>>) {
        let id = request.id.clone();
        let params = request.params;

        let payment_hash: Option<[u8; 32]> = hex::decode(&params.htlc.payment_hash)
            .ok()
            .and_then(|h| h.try_into().ok());
        let payment_hash = match payment_hash {
            Some(hash) => hash,
            None => {
                error!("htlc with malformed payment hash {}", params.htlc.payment_hash);
                respond(&writer, &id, continue_unchanged()).await;
                return;
            }
        };

        // no forward scid means the htlc terminates here; nothing to do
        let forward_scid: Option<ShortChannelId> =
            params.onion.short_channel_id.as_deref().and_then(|s| s.parse().ok());
        let forward_scid = match forward_scid {
            Some(scid) => scid,
            None => {
                respond(&writer, &id, continue_unchanged()).await;
                return;
            }
        };

        let outgoing_amount_msat =
            params.onion.forward_msat.as_ref().and_then(parse_msat).unwrap_or(0);
        let outgoing_expiry = params.onion.outgoing_cltv_value.unwrap_or(0);
        let incoming_expiry = params.htlc.cltv_expiry;
        let onion_blob = params
            .onion
            .next_onion
            .as_deref()
            .and_then(|o| hex::decode(o).ok())
            .unwrap_or_default();

        let next_hop = match self.client.scid_peer(forward_scid).await {
            Ok(hop) => hop,
            Err(e) => {
                debug!("next hop lookup for {} failed: {}", forward_scid, e);
                None
            }
        };

        let interceptor = self.interceptor.clone();
        let guard = self.inflight.add();
        tokio::spawn(async move {
            let action = interceptor
                .intercept(
                    next_hop,
                    payment_hash,
                    outgoing_amount_msat,
                    outgoing_expiry,
                    incoming_expiry,
                    &onion_blob,
                )
                .await;
            respond(&writer, &id, encode_action(action)).await;
            drop(guard);
        });
    }
}

async fn respond(writer: &Arc<Mutex<OwnedWriteHalf>>, id: &Value, result: HookResult) {
    let envelope = serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result });
    let mut bytes = envelope.to_string().into_bytes();
    bytes.push(b'\n');
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_all(&bytes).await {
        warn!("hook response write failed: {}", e);
    }
}

#[async_trait::async_trait]
impl HtlcInterceptor for ClnHtlcInterceptor {
    async fn start(&self) -> Result<()> {
        self.accept_loop().await
    }

    async fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.inflight.wait().await;
        self.cancel_trigger.trigger();
        let _ = std::fs::remove_file(&self.hook_socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_msat() {
        assert_eq!(parse_msat(&serde_json::json!(1000)), Some(1000));
        assert_eq!(parse_msat(&serde_json::json!("1000msat")), Some(1000));
        assert_eq!(parse_msat(&serde_json::json!("250")), Some(250));
        assert_eq!(parse_msat(&serde_json::json!(null)), None);
        assert_eq!(parse_msat(&serde_json::json!("abcmsat")), None);
    }

    #[test]
    fn test_failure_codes_enumerated() {
        assert_eq!(failure_message(InterceptFailureCode::TemporaryChannelFailure), "1007");
        assert_eq!(failure_message(InterceptFailureCode::TemporaryNodeFailure), "2002");
        assert_eq!(
            failure_message(InterceptFailureCode::IncorrectOrUnknownPaymentDetails),
            "400f"
        );
    }

    #[test]
    fn test_encode_reroute() {
        let action = InterceptAction::ResumeWithOnion {
            amount_msat: 1,
            channel_id: ShortChannelId::new(1, 2, 3),
            onion_blob: vec![0xab],
        };
        let encoded = encode_action(action);
        assert_eq!(encoded.result, "continue");
        assert_eq!(encoded.payload.as_deref(), Some("ab"));
        assert_eq!(encoded.forward_to.as_deref(), Some("1x2x3"));
        let json = serde_json::to_value(&encoded).unwrap();
        assert!(json.get("failure_message").is_none());
    }
}
