//! Local API endpoint -- reader/writer task pair over plain TCP.
//!
//! The reader parses the client frame format and forwards announce,
//! notify and validation calls; the writer serializes notifications
//! back to the client. Unknown frame types are skipped; undersized
//! frames terminate the client.

use std::time::Duration;

use futures::{FutureExt, SinkExt, StreamExt};
use murmur_protocol::api::{ApiCodec, ApiMessage};
use murmur_protocol::PARAMS;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bus::{ApiClient, ApiEvent, ApiWriterMsg, CentralMsg};
use crate::panic_detail;

/// Split the socket and spawn the reader/writer pair. Returns the
/// writer queue and the cancel handle the central controller owns.
pub fn spawn(
    client: ApiClient,
    stream: TcpStream,
    central_tx: mpsc::Sender<CentralMsg>,
) -> (mpsc::Sender<ApiWriterMsg>, watch::Sender<bool>) {
    let (writer_tx, writer_rx) = mpsc::channel(PARAMS.out_queue_size);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (read_half, write_half) = stream.into_split();

    tokio::spawn(run_reader(
        client,
        FramedRead::new(read_half, ApiCodec),
        cancel_rx.clone(),
        central_tx.clone(),
    ));
    tokio::spawn(run_writer(
        client,
        FramedWrite::new(write_half, ApiCodec),
        writer_rx,
        cancel_rx,
        central_tx,
    ));

    (writer_tx, cancel_tx)
}

async fn run_reader(
    client: ApiClient,
    mut frames: FramedRead<tokio::net::tcp::OwnedReadHalf, ApiCodec>,
    cancel: watch::Receiver<bool>,
    central_tx: mpsc::Sender<CentralMsg>,
) {
    let poll = Duration::from_millis(PARAMS.closure_check_millis);
    let tx = central_tx.clone();

    let fut = async move {
        loop {
            match tokio::time::timeout(poll, frames.next()).await {
                Err(_) => {
                    if *cancel.borrow() {
                        return None;
                    }
                }
                Ok(Some(Ok(frame))) => {
                    let event = match frame {
                        ApiMessage::Announce {
                            ttl,
                            data_type,
                            data,
                        } => ApiEvent::Announce {
                            item: murmur_protocol::GossipItem { data_type, data },
                            ttl,
                        },
                        ApiMessage::Notify { data_type } => ApiEvent::Notify { data_type },
                        ApiMessage::Validation { message_id, valid } => {
                            ApiEvent::Validation { message_id, valid }
                        }
                        ApiMessage::Notification { .. } => {
                            // Server-to-client only; skip and resync.
                            tracing::debug!(%client, "api: notification frame from client skipped");
                            continue;
                        }
                        ApiMessage::Unknown { msg_type } => {
                            tracing::debug!(%client, msg_type, "api: unknown frame type skipped");
                            continue;
                        }
                    };
                    if central_tx
                        .send(CentralMsg::IncomingApi {
                            from: client,
                            event,
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
                Ok(Some(Err(e))) => return Some(e.to_string()),
                Ok(None) => return Some("connection closed by client".to_string()),
            }
        }
    };

    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(error) => {
            let _ = tx
                .send(CentralMsg::ApiEndpointClosed {
                    client,
                    is_reader: true,
                    error,
                })
                .await;
        }
        Err(panic) => {
            let _ = tx
                .send(CentralMsg::ApiEndpointCrashed {
                    client,
                    is_reader: true,
                    error: panic_detail(panic),
                })
                .await;
        }
    }
}

async fn run_writer(
    client: ApiClient,
    mut frames: FramedWrite<tokio::net::tcp::OwnedWriteHalf, ApiCodec>,
    mut rx: mpsc::Receiver<ApiWriterMsg>,
    mut cancel: watch::Receiver<bool>,
    central_tx: mpsc::Sender<CentralMsg>,
) {
    let tx = central_tx.clone();

    let fut = async move {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(ApiWriterMsg::Notification { message_id, item }) => {
                        let frame = ApiMessage::Notification {
                            message_id,
                            data_type: item.data_type,
                            data: item.data,
                        };
                        if let Err(e) = frames.send(frame).await {
                            return Some(e.to_string());
                        }
                    }
                    Some(ApiWriterMsg::Close) | None => return None,
                },
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return None;
                    }
                }
            }
        }
    };

    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(error) => {
            let _ = tx
                .send(CentralMsg::ApiEndpointClosed {
                    client,
                    is_reader: false,
                    error,
                })
                .await;
        }
        Err(panic) => {
            let _ = tx
                .send(CentralMsg::ApiEndpointCrashed {
                    client,
                    is_reader: false,
                    error: panic_detail(panic),
                })
                .await;
        }
    }
}
