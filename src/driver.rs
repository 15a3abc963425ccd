//! Process startup and supervision: one interception adapter per
//! configured node plus the admin server. Any child exiting takes the
//! whole daemon down so the service manager can restart it.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Command;
use log::{error, info};
use secp256k1::{rand, PublicKey, SecretKey};
use tokio::task::JoinSet;

use crate::chain::{FeeEstimator, MempoolClient};
use crate::cln::{ClnClient, ClnHtlcInterceptor};
use crate::config::Config;
use crate::interceptor::{HtlcInterceptor, Interceptor};
use crate::lightning::NodeClient;
use crate::lnd::{ForwardingHistorySync, LndClient, LndHtlcInterceptor};
use crate::server::GrpcServer;
use crate::store::postgres::PostgresStore;
use crate::store::InterceptStore;
use crate::util::setup_logging;

pub const APP_NAME: &str = "lspd";

#[tokio::main]
pub async fn start() -> Result<()> {
    let matches = Command::new(APP_NAME)
        .about("Lightning Service Provider daemon with just-in-time channel opens")
        .subcommand(Command::new("genkey").about("print a fresh LSPD_PRIVATE_KEY and exit"))
        .get_matches();
    if matches.subcommand_matches("genkey").is_some() {
        let key = SecretKey::new(&mut rand::thread_rng());
        println!("LSPD_PRIVATE_KEY=\"{}\"", hex::encode(key.secret_bytes()));
        return Ok(());
    }

    setup_logging(APP_NAME, "info");

    let config = Config::from_env()?;
    let store: Arc<dyn InterceptStore> = Arc::new(
        PostgresStore::connect(&config.database_url)
            .await
            .context("failed to connect to database")?,
    );

    let fee_estimator: Option<Arc<dyn FeeEstimator>> = match &config.mempool_api_base_url {
        Some(url) => {
            info!(
                "using mempool api for fee estimation: {}, fee strategy: {:?}",
                url, config.mempool_priority
            );
            Some(Arc::new(MempoolClient::new(url)?))
        }
        None => None,
    };

    let mut interceptors: Vec<Arc<dyn HtlcInterceptor>> = Vec::new();
    let mut admin_node: Option<(Arc<crate::config::NodeConfig>, Arc<dyn NodeClient>)> = None;
    for node in &config.nodes {
        let node_config = Arc::new(node.clone());
        let node_pubkey = PublicKey::from_str(&node.node_pubkey)
            .with_context(|| format!("invalid node_pubkey {}", node.node_pubkey))?;

        if let Some(lnd_config) = &node.lnd {
            let client =
                Arc::new(LndClient::new(lnd_config).context("failed to initialize LND client")?);
            let fwsync =
                Arc::new(ForwardingHistorySync::new(client.clone(), node_pubkey, store.clone()));
            let node_client: Arc<dyn NodeClient> = client.clone();
            let interceptor = Arc::new(Interceptor::new(
                node_client.clone(),
                node_config.clone(),
                store.clone(),
                fee_estimator.clone(),
                config.mempool_priority,
            ));
            interceptors.push(Arc::new(LndHtlcInterceptor::new(
                node_config.clone(),
                client,
                fwsync,
                interceptor,
            )));
            admin_node.get_or_insert((node_config, node_client));
        } else if let Some(cln_config) = &node.cln {
            let client = Arc::new(
                ClnClient::new(&cln_config.socket_path)
                    .context("failed to initialize CLN client")?,
            );
            let node_client: Arc<dyn NodeClient> = client.clone();
            let interceptor = Arc::new(Interceptor::new(
                node_client.clone(),
                node_config.clone(),
                store.clone(),
                fee_estimator.clone(),
                config.mempool_priority,
            ));
            interceptors.push(Arc::new(ClnHtlcInterceptor::new(
                &node_config,
                client,
                interceptor,
            )?));
            admin_node.get_or_insert((node_config, node_client));
        }
    }
    let (admin_config, admin_client) = admin_node.expect("at least one node is configured");

    let (shutdown_trigger, shutdown_signal) = triggered::trigger();
    let signal_trigger = shutdown_trigger.clone();
    ctrlc::set_handler(move || {
        info!("received stop signal, stopping");
        signal_trigger.trigger();
    })
    .context("failed to set signal handler")?;

    let mut tasks: JoinSet<(&'static str, Result<()>)> = JoinSet::new();
    for interceptor in &interceptors {
        let interceptor = interceptor.clone();
        tasks.spawn(async move { ("interceptor", interceptor.start().await) });
    }
    let server = GrpcServer::new(admin_config, admin_client, store.clone(), config.private_key);
    let listen_address = config.listen_address.clone();
    let certmagic_domain = config.certmagic_domain.clone();
    let server_shutdown = shutdown_signal.clone();
    tasks.spawn(async move {
        ("grpc server", server.run(listen_address, certmagic_domain, server_shutdown).await)
    });

    let mut fatal = false;
    let mut tally = |res: Option<std::result::Result<(&'static str, Result<()>), tokio::task::JoinError>>| {
        match res {
            Some(Ok((who, Ok(())))) => info!("{} stopped", who),
            Some(Ok((who, Err(e)))) => {
                error!("FATAL. {} stopped with error: {}", who, e);
                fatal = true;
            }
            Some(Err(e)) => {
                error!("FATAL. task panicked: {}", e);
                fatal = true;
            }
            None => {}
        }
    };

    // the first child to exit, or a signal, takes everything down
    tokio::select! {
        _ = shutdown_signal.clone() => {}
        res = tasks.join_next() => tally(res),
    }

    futures::future::join_all(interceptors.iter().map(|i| i.stop())).await;
    shutdown_trigger.trigger();
    while let Some(res) = tasks.join_next().await {
        tally(Some(res));
    }

    info!("lspd exited");
    if fatal {
        bail!("FATAL. a task exited with an error");
    }
    Ok(())
}
