//! Peer endpoint -- one reader task and one writer task per connection.
//!
//! The reader polls with a short deadline so it can notice the cancel
//! signal; the writer drains its queue until the close control arrives.
//! Both catch panics and report them upward; the central controller is
//! the sole reactor to either half stopping.

use std::time::Duration;

use futures::FutureExt;
use murmur_protocol::PARAMS;
use murmur_transport::{SecureConnection, SecureReader, SecureWriter, SessionError};
use tokio::sync::{mpsc, watch};

use crate::bus::{CentralMsg, Peer, PeerWriterMsg};
use crate::panic_detail;

/// Split the connection and spawn the reader/writer pair. Returns the
/// writer queue and the cancel handle the central controller owns.
pub fn spawn(
    peer: Peer,
    is_outgoing: bool,
    connection: SecureConnection,
    central_tx: mpsc::Sender<CentralMsg>,
) -> (mpsc::Sender<PeerWriterMsg>, watch::Sender<bool>) {
    let (writer_tx, writer_rx) = mpsc::channel(PARAMS.out_queue_size);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (reader, writer) = connection.split();

    tokio::spawn(run_reader(
        peer,
        is_outgoing,
        reader,
        cancel_rx.clone(),
        central_tx.clone(),
    ));
    tokio::spawn(run_writer(peer, is_outgoing, writer, writer_rx, cancel_rx, central_tx));

    (writer_tx, cancel_tx)
}

async fn run_reader(
    peer: Peer,
    is_outgoing: bool,
    mut reader: SecureReader,
    cancel: watch::Receiver<bool>,
    central_tx: mpsc::Sender<CentralMsg>,
) {
    let poll = Duration::from_millis(PARAMS.closure_check_millis);
    let tx = central_tx.clone();

    let fut = async move {
        loop {
            match tokio::time::timeout(poll, reader.recv()).await {
                Err(_) => {
                    if *cancel.borrow() {
                        return None;
                    }
                }
                Ok(Ok(message)) => {
                    if central_tx
                        .send(CentralMsg::IncomingP2p {
                            from: peer,
                            message,
                        })
                        .await
                        .is_err()
                    {
                        return None;
                    }
                    if *cancel.borrow() {
                        return None;
                    }
                }
                Ok(Err(SessionError::Closed)) => {
                    return Some("connection closed by peer".to_string());
                }
                Ok(Err(e)) => return Some(e.to_string()),
            }
        }
    };

    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(error) => {
            let _ = tx
                .send(CentralMsg::P2pEndpointClosed {
                    peer,
                    is_outgoing,
                    is_reader: true,
                    error,
                })
                .await;
        }
        Err(panic) => {
            let _ = tx
                .send(CentralMsg::P2pEndpointCrashed {
                    peer,
                    is_outgoing,
                    is_reader: true,
                    error: panic_detail(panic),
                })
                .await;
        }
    }
}

async fn run_writer(
    peer: Peer,
    is_outgoing: bool,
    mut writer: SecureWriter,
    mut rx: mpsc::Receiver<PeerWriterMsg>,
    mut cancel: watch::Receiver<bool>,
    central_tx: mpsc::Sender<CentralMsg>,
) {
    let tx = central_tx.clone();

    let fut = async move {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(PeerWriterMsg::Send(message)) => {
                        if let Err(e) = writer.send(&message).await {
                            writer.shutdown().await;
                            return Some(e.to_string());
                        }
                    }
                    Some(PeerWriterMsg::Close) | None => {
                        writer.shutdown().await;
                        return None;
                    }
                },
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        writer.shutdown().await;
                        return None;
                    }
                }
            }
        }
    };

    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(error) => {
            let _ = tx
                .send(CentralMsg::P2pEndpointClosed {
                    peer,
                    is_outgoing,
                    is_reader: false,
                    error,
                })
                .await;
        }
        Err(panic) => {
            let _ = tx
                .send(CentralMsg::P2pEndpointCrashed {
                    peer,
                    is_outgoing,
                    is_reader: false,
                    error: panic_detail(panic),
                })
                .await;
        }
    }
}
