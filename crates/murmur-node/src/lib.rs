//! Murmur Node -- library crate for the gossip node.
//!
//! Re-exports the controllers, endpoints and wiring so integration
//! tests can assemble and drive a node in-process.

use std::sync::Arc;
use std::time::Duration;

use murmur_crypto::{HostIdentity, PuzzleParams, TrustStore};
use murmur_protocol::PARAMS;
use murmur_transport::TransportConfig;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub mod api_endpoint;
pub mod bus;
pub mod central;
pub mod config;
pub mod gossip;
pub mod listener;
pub mod membership;
pub mod peer_endpoint;
pub mod sampler;

use bus::{CentralMsg, Peer};
use config::Config;

/// Render a caught panic payload as a string for crash reports.
pub fn panic_detail(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A running node: the central queue for control messages and the join
/// handle of the central loop.
pub struct NodeHandle {
    pub central_tx: mpsc::Sender<CentralMsg>,
    pub join: JoinHandle<Result<(), String>>,
    /// Bound P2P listen address (relevant when configured with port 0).
    pub p2p_addr: std::net::SocketAddr,
    /// Bound API listen address.
    pub api_addr: std::net::SocketAddr,
}

impl NodeHandle {
    /// Ask the node to shut down gracefully.
    pub async fn close(&self) {
        let _ = self.central_tx.send(CentralMsg::Close).await;
    }
}

/// The admission puzzle parameter set used on the live network.
pub fn admission_puzzle() -> PuzzleParams {
    PuzzleParams {
        log_n: PARAMS.scrypt_log_n,
        r: PARAMS.scrypt_r,
        p: PARAMS.scrypt_p,
        dk_len: PARAMS.scrypt_dk_len,
        repetition: PARAMS.puzzle_repetition,
    }
}

/// Assemble and start a node: bind the listeners, spawn the controller
/// loops and return the handle.
pub async fn start(config: Config) -> anyhow::Result<NodeHandle> {
    start_with_puzzle(config, admission_puzzle()).await
}

/// Start with an explicit puzzle parameter set (test networks use a
/// cheaper one).
pub async fn start_with_puzzle(
    config: Config,
    puzzle: PuzzleParams,
) -> anyhow::Result<NodeHandle> {
    let identity = Arc::new(HostIdentity::load(&config.hostkey, &config.pubkey)?);
    let trust = TrustStore::open(&config.trusted_identities_path)?;
    tracing::info!(
        identity = %identity.identity_hex(),
        version = env!("CARGO_PKG_VERSION"),
        "starting murmur-node"
    );

    let p2p_listener = tokio::net::TcpListener::bind(config.listen_address).await?;
    let p2p_addr = p2p_listener.local_addr()?;
    let api_listener = tokio::net::TcpListener::bind(config.api_address).await?;
    let api_addr = api_listener.local_addr()?;
    tracing::info!(
        listen = %p2p_addr,
        api = %api_addr,
        bootstrapper = %config.bootstrapper.map(|b| b.to_string()).unwrap_or_default(),
        cache_size = config.cache_size,
        degree = config.degree,
        max_ttl = config.effective_max_ttl(&PARAMS),
        "network config"
    );

    let transport = TransportConfig {
        identity,
        trust,
        local_addr: p2p_addr,
        puzzle,
        validity_window: Duration::from_secs(PARAMS.handshake_validity_secs),
        handshake_timeout: Duration::from_secs(PARAMS.handshake_timeout_secs),
        dial_timeout: Duration::from_secs(PARAMS.connection_timeout_secs),
        max_frame: PARAMS.max_frame_bytes(config.cache_size),
    };

    let (central_tx, central_rx) = mpsc::channel(PARAMS.in_queue_size);
    let (membership_tx, membership_rx) = mpsc::channel(PARAMS.out_queue_size);
    let (gossiper_tx, gossiper_rx) = mpsc::channel(PARAMS.out_queue_size);
    let (listener_cancel, listener_cancel_rx) = watch::channel(false);

    // Controller loops.
    let membership = membership::Membership::new(
        &PARAMS,
        Peer(p2p_addr),
        config.bootstrapper.map(Peer),
        puzzle,
    );
    tokio::spawn(membership::run(
        membership,
        membership_rx,
        membership_tx.clone(),
        central_tx.clone(),
        Duration::from_secs(PARAMS.membership_round_secs),
    ));

    let gossiper = gossip::Gossiper::new(
        &PARAMS,
        config.cache_size,
        config.degree,
        config.effective_max_ttl(&PARAMS),
    );
    tokio::spawn(gossip::run(
        gossiper,
        gossiper_rx,
        central_tx.clone(),
        Duration::from_millis(PARAMS.gossip_round_millis),
    ));

    // Listeners.
    tokio::spawn(listener::run_p2p_listener(
        p2p_listener,
        transport.clone(),
        central_tx.clone(),
        listener_cancel_rx.clone(),
    ));
    tokio::spawn(listener::run_api_listener(
        api_listener,
        central_tx.clone(),
        listener_cancel_rx,
    ));

    // The central loop.
    let central = central::Central::new(
        transport,
        config.cache_size,
        membership_tx,
        gossiper_tx,
        central_tx.clone(),
        listener_cancel,
    );
    let join = tokio::spawn(central::run(central, central_rx));

    Ok(NodeHandle {
        central_tx,
        join,
        p2p_addr,
        api_addr,
    })
}
