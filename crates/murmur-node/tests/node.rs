//! End-to-end node tests over real sockets: local API service and
//! rumor dissemination between two nodes.

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use murmur_crypto::{HostIdentity, PuzzleParams, TrustStore};
use murmur_node::config::Config;
use murmur_node::NodeHandle;
use murmur_protocol::api::{ApiCodec, ApiMessage};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

fn easy_puzzle() -> PuzzleParams {
    PuzzleParams {
        log_n: 4,
        r: 8,
        p: 1,
        dk_len: 32,
        repetition: 2,
    }
}

/// Key generation is slow; every test node shares one identity. The
/// protocol identifies peers by address, not by key.
fn shared_identity() -> Arc<HostIdentity> {
    static IDENTITY: OnceLock<Arc<HostIdentity>> = OnceLock::new();
    IDENTITY
        .get_or_init(|| Arc::new(HostIdentity::generate(2048).unwrap()))
        .clone()
}

/// Provision keys and a trust dir under `dir` and start a node.
async fn spawn_node(
    dir: &Path,
    bootstrapper: Option<std::net::SocketAddr>,
) -> anyhow::Result<NodeHandle> {
    let hostkey = dir.join("hostkey.pem");
    let pubkey = dir.join("pubkey.pem");
    let trusted = dir.join("trusted");
    std::fs::create_dir_all(&trusted)?;

    let identity = shared_identity();
    identity.write_pem(&hostkey, &pubkey)?;
    TrustStore::open(&trusted)?.add(&identity.identity_hex())?;

    let config = Config {
        hostkey,
        pubkey,
        trusted_identities_path: trusted,
        bootstrapper,
        api_address: "127.0.0.1:0".parse()?,
        listen_address: "127.0.0.1:0".parse()?,
        cache_size: 50,
        degree: 4,
        max_ttl: 0,
    };
    murmur_node::start_with_puzzle(config, easy_puzzle()).await
}

type ApiConn = Framed<TcpStream, ApiCodec>;

async fn api_client(node: &NodeHandle) -> ApiConn {
    let stream = TcpStream::connect(node.api_addr).await.unwrap();
    Framed::new(stream, ApiCodec)
}

async fn next_notification(conn: &mut ApiConn, deadline: Duration) -> ApiMessage {
    tokio::time::timeout(deadline, conn.next())
        .await
        .expect("timed out waiting for a notification")
        .expect("api connection closed")
        .expect("api frame error")
}

#[tokio::test]
async fn announce_notifies_local_subscriber() {
    let dir = tempfile::tempdir().unwrap();
    let node = spawn_node(dir.path(), None).await.unwrap();

    let mut subscriber = api_client(&node).await;
    subscriber
        .send(ApiMessage::Notify { data_type: 7 })
        .await
        .unwrap();
    // Give the subscription time to reach the gossiper.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut announcer = api_client(&node).await;
    announcer
        .send(ApiMessage::Announce {
            ttl: 3,
            data_type: 7,
            data: b"hi".to_vec(),
        })
        .await
        .unwrap();

    match next_notification(&mut subscriber, Duration::from_secs(10)).await {
        ApiMessage::Notification {
            message_id,
            data_type,
            data,
        } => {
            assert_eq!(message_id, 0);
            assert_eq!(data_type, 7);
            assert_eq!(data, b"hi");
        }
        other => panic!("expected a notification, got {other:?}"),
    }

    // A different data type stays silent.
    announcer
        .send(ApiMessage::Announce {
            ttl: 3,
            data_type: 8,
            data: b"other".to_vec(),
        })
        .await
        .unwrap();
    assert!(
        tokio::time::timeout(Duration::from_secs(3), subscriber.next())
            .await
            .is_err(),
        "subscriber must not hear about unrelated data types"
    );

    node.close().await;
    let result = tokio::time::timeout(Duration::from_secs(15), node.join)
        .await
        .expect("graceful shutdown timed out")
        .expect("central loop panicked");
    assert!(result.is_ok(), "central loop crashed: {result:?}");
}

#[tokio::test]
async fn rumor_crosses_to_bootstrapped_peer() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    // B is up first; A bootstraps from it.
    let node_b = spawn_node(dir_b.path(), None).await.unwrap();
    let node_a = spawn_node(dir_a.path(), Some(node_b.p2p_addr)).await.unwrap();

    // A subscriber on B for the announced data type.
    let mut subscriber = api_client(&node_b).await;
    subscriber
        .send(ApiMessage::Notify { data_type: 7 })
        .await
        .unwrap();

    // Let A's membership bootstrap and its secure connection to B come
    // up before announcing.
    tokio::time::sleep(Duration::from_secs(5)).await;

    let mut announcer = api_client(&node_a).await;
    announcer
        .send(ApiMessage::Announce {
            ttl: 0,
            data_type: 7,
            data: b"carried by gossip".to_vec(),
        })
        .await
        .unwrap();

    match next_notification(&mut subscriber, Duration::from_secs(30)).await {
        ApiMessage::Notification {
            data_type, data, ..
        } => {
            assert_eq!(data_type, 7);
            assert_eq!(data, b"carried by gossip");
        }
        other => panic!("expected a notification, got {other:?}"),
    }

    // Mark the rumor invalid on B: it must not be delivered again even
    // though A keeps pushing it.
    subscriber
        .send(ApiMessage::Validation {
            message_id: 0,
            valid: false,
        })
        .await
        .unwrap();
    assert!(
        tokio::time::timeout(Duration::from_secs(5), subscriber.next())
            .await
            .is_err(),
        "an invalidated rumor must stay quarantined"
    );

    node_a.close().await;
    node_b.close().await;
    for node in [node_a, node_b] {
        let result = tokio::time::timeout(Duration::from_secs(15), node.join)
            .await
            .expect("graceful shutdown timed out")
            .expect("central loop panicked");
        assert!(result.is_ok(), "central loop crashed: {result:?}");
    }
}

#[tokio::test]
async fn undersized_api_frame_terminates_client() {
    use tokio::io::AsyncWriteExt;

    let dir = tempfile::tempdir().unwrap();
    let node = spawn_node(dir.path(), None).await.unwrap();

    let mut stream = TcpStream::connect(node.api_addr).await.unwrap();
    // size = 2 is below the 4-byte header minimum.
    stream.write_all(&[0, 2, 0, 0]).await.unwrap();

    // The node terminates the client; the socket reaches EOF.
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(10), async {
        use tokio::io::AsyncReadExt;
        stream.read(&mut buf).await
    })
    .await
    .expect("server did not close a protocol-violating client");
    assert_eq!(read.unwrap(), 0);

    node.close().await;
    let _ = tokio::time::timeout(Duration::from_secs(15), node.join).await;
}
