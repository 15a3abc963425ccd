//! lspd: a Lightning Service Provider daemon.
//!
//! Sits beside one or more Lightning nodes (LND over gRPC, CLN over its
//! unix socket), intercepts in-flight HTLC forwards, and opens zero-conf
//! channels just-in-time for payments that wallets registered through the
//! admin gRPC server.

pub mod chain;
pub mod cln;
pub mod config;
pub mod driver;
pub mod interceptor;
pub mod lightning;
pub mod lnd;
pub mod onion;
pub mod scid;
pub mod server;
pub mod store;
pub mod util;

pub mod lnrpc {
    tonic::include_proto!("lnrpc");
}

pub mod routerrpc {
    tonic::include_proto!("routerrpc");
}

pub mod proto {
    tonic::include_proto!("lspd");
}
