//! LND backend: gRPC node client, HTLC interception adapter, and the
//! forwarding-history sync job.

mod client;
mod history;
mod interceptor;

pub use client::LndClient;
pub use history::ForwardingHistorySync;
pub use interceptor::LndHtlcInterceptor;
