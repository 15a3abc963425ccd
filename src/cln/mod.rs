//! CLN backend: JSON-RPC node client over lightningd's unix socket and the
//! htlc_accepted hook adapter.

mod client;
mod interceptor;

pub use client::ClnClient;
pub use interceptor::ClnHtlcInterceptor;
