//! Accept loops for peer and local API connections.
//!
//! The P2P listener offloads each server handshake to its own task so a
//! slow puzzle never stalls the accept loop; only a completed, admitted
//! session reaches the central controller.

use futures::FutureExt;
use murmur_transport::TransportConfig;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use crate::bus::{ApiClient, CentralMsg, Peer};
use crate::panic_detail;

pub async fn run_p2p_listener(
    listener: TcpListener,
    transport: TransportConfig,
    central_tx: mpsc::Sender<CentralMsg>,
    mut cancel: watch::Receiver<bool>,
) {
    let tx = central_tx.clone();
    let fut = async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "net: p2p accept failed");
                            continue;
                        }
                    };
                    let config = transport.clone();
                    let central_tx = central_tx.clone();
                    tokio::spawn(async move {
                        match murmur_transport::accept(stream, &config).await {
                            Ok(connection) => {
                                let _ = central_tx
                                    .send(CentralMsg::IncomingP2pCreated {
                                        peer: Peer(remote),
                                        connection,
                                    })
                                    .await;
                            }
                            Err(e) => {
                                tracing::info!(%remote, error = %e, "net: inbound handshake rejected");
                            }
                        }
                    });
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return;
                    }
                }
            }
        }
    };

    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(()) => {
            let _ = tx.send(CentralMsg::P2pListenerClosed).await;
        }
        Err(panic) => {
            let _ = tx
                .send(CentralMsg::P2pListenerCrashed(panic_detail(panic)))
                .await;
        }
    }
}

pub async fn run_api_listener(
    listener: TcpListener,
    central_tx: mpsc::Sender<CentralMsg>,
    mut cancel: watch::Receiver<bool>,
) {
    let tx = central_tx.clone();
    let fut = async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let _ = central_tx
                                .send(CentralMsg::ApiEndpointCreated {
                                    client: ApiClient(remote),
                                    stream,
                                })
                                .await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "api: accept failed");
                        }
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return;
                    }
                }
            }
        }
    };

    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(()) => {
            let _ = tx.send(CentralMsg::ApiListenerClosed).await;
        }
        Err(panic) => {
            let _ = tx
                .send(CentralMsg::ApiListenerCrashed(panic_detail(panic)))
                .await;
        }
    }
}
