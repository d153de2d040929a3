//! Handshake record construction and validation.
//!
//! Both sides build the same record shape: an ephemeral DH public value,
//! the RSA public key, creation time, advertised listen address, an
//! admission-puzzle nonce and an RSA-PSS signature over the puzzle input
//! including the nonce. The dialer solves and sends first; the acceptor
//! validates before revealing its own record.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use murmur_crypto::identity::verify_signature;
use murmur_crypto::{dh::DhKeypair, puzzle, session, PuzzleParams, TrustStore};
use murmur_protocol::{FrameCodec, HandshakeRecord};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::{HandshakeError, SecureConnection, TransportConfig};

/// What the validator knows about the peer's address ahead of time.
#[derive(Debug, Clone, Copy)]
pub enum AddrExpectation {
    /// Dialer side: the record must advertise exactly the dialed address.
    Exact(SocketAddr),
    /// Acceptor side: the record host must match the socket peer host.
    HostOf(IpAddr),
}

fn now_utc() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Build, solve and sign our handshake record. Blocking (scrypt); run
/// on a blocking thread.
pub fn build_record(
    config: &TransportConfig,
    is_client: bool,
) -> Result<(HandshakeRecord, DhKeypair), HandshakeError> {
    let dh = DhKeypair::generate();
    let mut record = HandshakeRecord {
        dh_pub: dh.public_bytes().to_vec(),
        rsa_pub: config.identity.public_der().to_vec(),
        time_utc: now_utc(),
        addr: config.local_addr.to_string(),
        nonce: Vec::new(),
        sig: Vec::new(),
        is_client,
    };

    let input = record.puzzle_input();
    record.nonce = puzzle::solve_bytes(&config.puzzle, &input, 64)
        .map_err(|_| HandshakeError::AdmissionRejected)?;

    let mut signed = input;
    signed.extend_from_slice(&record.nonce);
    record.sig = config.identity.sign(&signed);

    Ok((record, dh))
}

/// Validate a remote handshake record. Blocking (scrypt); run on a
/// blocking thread.
pub fn validate_record(
    record: &HandshakeRecord,
    expect_client: bool,
    expected_addr: AddrExpectation,
    trust: &TrustStore,
    puzzle_params: &PuzzleParams,
    validity_window: Duration,
) -> Result<(), HandshakeError> {
    if !record.is_well_formed() {
        return Err(HandshakeError::Protocol("malformed handshake record".into()));
    }
    if record.is_client != expect_client {
        return Err(HandshakeError::Protocol("handshake role mismatch".into()));
    }

    let age = (now_utc() - record.time_utc).unsigned_abs();
    if age > validity_window.as_secs() {
        return Err(HandshakeError::Protocol(format!(
            "handshake record stale by {age}s"
        )));
    }

    let input = record.puzzle_input();
    match puzzle::verify(puzzle_params, &input, &record.nonce) {
        Ok(true) => {}
        Ok(false) => return Err(HandshakeError::AdmissionRejected),
        Err(e) => return Err(HandshakeError::Protocol(e.to_string())),
    }

    let mut signed = input;
    signed.extend_from_slice(&record.nonce);
    verify_signature(&record.rsa_pub, &signed, &record.sig)
        .map_err(|_| HandshakeError::SigInvalid)?;

    if !trust.trusts_key(&record.rsa_pub) {
        return Err(HandshakeError::UntrustedIdentity);
    }

    let advertised: SocketAddr = record
        .addr
        .parse()
        .map_err(|_| HandshakeError::AddrMismatch)?;
    match expected_addr {
        AddrExpectation::Exact(expected) => {
            // A wildcard-bound listener advertises 0.0.0.0; the port
            // still has to agree with the address we dialed.
            let wildcard_ok =
                advertised.ip().is_unspecified() && advertised.port() == expected.port();
            if advertised != expected && !wildcard_ok {
                return Err(HandshakeError::AddrMismatch);
            }
        }
        AddrExpectation::HostOf(host) => {
            if advertised.ip() != host && !advertised.ip().is_unspecified() {
                return Err(HandshakeError::AddrMismatch);
            }
        }
    }

    Ok(())
}

type HandshakeFramed = Framed<TcpStream, FrameCodec>;

async fn send_record(
    framed: &mut HandshakeFramed,
    record: &HandshakeRecord,
) -> Result<(), HandshakeError> {
    let bytes = serde_json::to_vec(record)
        .map_err(|e| HandshakeError::Protocol(format!("encode handshake: {e}")))?;
    framed
        .send(Bytes::from(bytes))
        .await
        .map_err(|e| HandshakeError::Protocol(e.to_string()))
}

async fn recv_record(framed: &mut HandshakeFramed) -> Result<HandshakeRecord, HandshakeError> {
    let frame = framed
        .next()
        .await
        .ok_or_else(|| HandshakeError::Protocol("connection closed during handshake".into()))?
        .map_err(|e| HandshakeError::Protocol(e.to_string()))?;
    serde_json::from_slice(&frame)
        .map_err(|e| HandshakeError::Protocol(format!("decode handshake: {e}")))
}

/// Dialer side: solve and send our record, then validate the acceptor's.
pub async fn client_handshake(
    stream: TcpStream,
    dialed: SocketAddr,
    config: &TransportConfig,
) -> Result<SecureConnection, HandshakeError> {
    let mut framed = Framed::new(stream, FrameCodec::new(config.max_frame));

    let cfg = config.clone();
    let (record, dh) = tokio::task::spawn_blocking(move || build_record(&cfg, true))
        .await
        .map_err(|e| HandshakeError::Protocol(format!("handshake task: {e}")))??;
    send_record(&mut framed, &record).await?;

    let remote = recv_record(&mut framed).await?;
    let cfg = config.clone();
    let check = remote.clone();
    tokio::task::spawn_blocking(move || {
        validate_record(
            &check,
            false,
            AddrExpectation::Exact(dialed),
            &cfg.trust,
            &cfg.puzzle,
            cfg.validity_window,
        )
    })
    .await
    .map_err(|e| HandshakeError::Protocol(format!("handshake task: {e}")))??;

    finish(framed, dh, &remote, true)
}

/// Acceptor side: validate the dialer's record before revealing ours.
pub async fn server_handshake(
    stream: TcpStream,
    config: &TransportConfig,
) -> Result<SecureConnection, HandshakeError> {
    let peer_ip = stream.peer_addr()?.ip();
    let mut framed = Framed::new(stream, FrameCodec::new(config.max_frame));

    let remote = recv_record(&mut framed).await?;
    let cfg = config.clone();
    let check = remote.clone();
    tokio::task::spawn_blocking(move || {
        validate_record(
            &check,
            true,
            AddrExpectation::HostOf(peer_ip),
            &cfg.trust,
            &cfg.puzzle,
            cfg.validity_window,
        )
    })
    .await
    .map_err(|e| HandshakeError::Protocol(format!("handshake task: {e}")))??;

    let cfg = config.clone();
    let (record, dh) = tokio::task::spawn_blocking(move || build_record(&cfg, false))
        .await
        .map_err(|e| HandshakeError::Protocol(format!("handshake task: {e}")))??;
    send_record(&mut framed, &record).await?;

    finish(framed, dh, &remote, false)
}

fn finish(
    framed: HandshakeFramed,
    dh: DhKeypair,
    remote: &HandshakeRecord,
    is_client: bool,
) -> Result<SecureConnection, HandshakeError> {
    let shared = dh
        .shared_secret(&remote.dh_pub)
        .map_err(|e| HandshakeError::Protocol(e.to_string()))?;
    let key = session::derive_session_key(&shared)
        .map_err(|e| HandshakeError::Protocol(e.to_string()))?;
    let identity = murmur_crypto::identity_hex(&remote.rsa_pub);
    tracing::debug!(peer = %identity, is_client, "handshake complete");
    SecureConnection::new(framed, &key, is_client, identity)
        .map_err(|e| HandshakeError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_crypto::{HostIdentity, TrustStore};
    use std::sync::Arc;

    fn test_config(dir: &std::path::Path) -> TransportConfig {
        let identity = Arc::new(HostIdentity::generate(2048).unwrap());
        TransportConfig {
            identity,
            trust: TrustStore::open(dir).unwrap(),
            local_addr: "127.0.0.1:7001".parse().unwrap(),
            puzzle: PuzzleParams {
                log_n: 4,
                r: 8,
                p: 1,
                dk_len: 32,
                repetition: 2,
            },
            validity_window: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(2),
            max_frame: 65535,
        }
    }

    fn validate(
        record: &HandshakeRecord,
        config: &TransportConfig,
        expected: AddrExpectation,
    ) -> Result<(), HandshakeError> {
        validate_record(
            record,
            true,
            expected,
            &config.trust,
            &config.puzzle,
            config.validity_window,
        )
    }

    #[test]
    fn test_built_record_validates() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        config.trust.add(&config.identity.identity_hex()).unwrap();

        let (record, _dh) = build_record(&config, true).unwrap();
        validate(&record, &config, AddrExpectation::Exact(config.local_addr)).unwrap();
    }

    #[test]
    fn test_untrusted_identity_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        // No trust entry provisioned.
        let (record, _dh) = build_record(&config, true).unwrap();
        match validate(&record, &config, AddrExpectation::Exact(config.local_addr)) {
            Err(HandshakeError::UntrustedIdentity) => {}
            other => panic!("expected UntrustedIdentity, got {other:?}"),
        }
    }

    #[test]
    fn test_address_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        config.trust.add(&config.identity.identity_hex()).unwrap();

        let (record, _dh) = build_record(&config, true).unwrap();
        let other: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        match validate(&record, &config, AddrExpectation::Exact(other)) {
            Err(HandshakeError::AddrMismatch) => {}
            other => panic!("expected AddrMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_host_expectation_accepts_matching_ip() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        config.trust.add(&config.identity.identity_hex()).unwrap();

        let (record, _dh) = build_record(&config, true).unwrap();
        validate(
            &record,
            &config,
            AddrExpectation::HostOf("127.0.0.1".parse().unwrap()),
        )
        .unwrap();
        match validate(
            &record,
            &config,
            AddrExpectation::HostOf("10.1.2.3".parse().unwrap()),
        ) {
            Err(HandshakeError::AddrMismatch) => {}
            other => panic!("expected AddrMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_tampered_record_fails_signature() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        config.trust.add(&config.identity.identity_hex()).unwrap();

        let (mut record, _dh) = build_record(&config, true).unwrap();
        record.addr = "127.0.0.1:7002".into();
        // The forged address breaks the puzzle first (the input moved),
        // or the signature if the puzzle happens to still pass.
        match validate(
            &record,
            &config,
            AddrExpectation::Exact("127.0.0.1:7002".parse().unwrap()),
        ) {
            Err(HandshakeError::AdmissionRejected) | Err(HandshakeError::SigInvalid) => {}
            other => panic!("expected puzzle or signature failure, got {other:?}"),
        }
    }

    #[test]
    fn test_inadmissible_nonce_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.trust.add(&config.identity.identity_hex()).unwrap();

        let (record, _dh) = build_record(&config, true).unwrap();
        // Re-validate under a far harder threshold: the solved nonce
        // cannot meet it.
        config.puzzle.repetition = 1 << 30;
        match validate(&record, &config, AddrExpectation::Exact(config.local_addr)) {
            Err(HandshakeError::AdmissionRejected) => {}
            other => panic!("expected AdmissionRejected, got {other:?}"),
        }
    }

    #[test]
    fn test_stale_record_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        config.trust.add(&config.identity.identity_hex()).unwrap();

        let (mut record, _dh) = build_record(&config, true).unwrap();
        record.time_utc -= 3600;
        match validate(&record, &config, AddrExpectation::Exact(config.local_addr)) {
            Err(HandshakeError::Protocol(_)) => {}
            other => panic!("expected Protocol, got {other:?}"),
        }
    }

    #[test]
    fn test_role_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        config.trust.add(&config.identity.identity_hex()).unwrap();

        let (record, _dh) = build_record(&config, false).unwrap();
        match validate(&record, &config, AddrExpectation::Exact(config.local_addr)) {
            Err(HandshakeError::Protocol(_)) => {}
            other => panic!("expected Protocol, got {other:?}"),
        }
    }
}
