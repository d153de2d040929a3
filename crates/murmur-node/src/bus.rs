//! Internal message bus -- the typed unions the controllers exchange.
//!
//! Every controller is the single consumer of its own queue; nothing
//! here is shared state. Spawned tasks (dials, probes, handshakes,
//! puzzle solvers) communicate only by sending a reply message back.

use std::fmt;
use std::net::SocketAddr;

use murmur_protocol::{DataType, GossipItem, PeerMessage, PushRequest, RumorUpdate};
use murmur_transport::SecureConnection;

/// A remote node's advertised listen address. Equality is address
/// equality; peers outlive their connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Peer(pub SocketAddr);

impl Peer {
    /// Parse a wire address string, rejecting anything non-syntactic.
    pub fn parse(addr: &str) -> Option<Peer> {
        addr.parse().ok().map(Peer)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A local API client, identified by its socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApiClient(pub SocketAddr);

impl fmt::Display for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Parsed local API calls forwarded to the gossiper.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiEvent {
    Announce { item: GossipItem, ttl: u8 },
    Notify { data_type: DataType },
    Validation { message_id: u16, valid: bool },
}

/// Everything the central controller reacts to.
pub enum CentralMsg {
    // -- membership commands --
    PeerAdd(Peer),
    PeerRemove(Peer),
    ProbePeerRequest(Peer),
    MembershipPushRequest(PushRequest),
    MembershipPullRequest(Peer),
    MembershipPullReply { to: Peer, view: Vec<Peer> },
    MembershipCrashed(String),
    MembershipClosed,

    // -- gossiper commands --
    RandomPeerListRequest { related: Option<GossipItem>, num: usize },
    RandomPeerListRelease(Vec<Peer>),
    GossipNotification { client: ApiClient, item: GossipItem, message_id: u16 },
    GossipPush { to: Peer, update: RumorUpdate },
    GossipPullRequest(Peer),
    GossipPullReply { to: Peer, items: Vec<RumorUpdate> },
    GossiperCrashed(String),
    GossiperClosed,

    // -- listener lifecycle --
    ApiListenerCrashed(String),
    ApiListenerClosed,
    ApiEndpointCreated { client: ApiClient, stream: tokio::net::TcpStream },
    P2pListenerCrashed(String),
    P2pListenerClosed,
    IncomingP2pCreated { peer: Peer, connection: SecureConnection },

    // -- endpoint lifecycle --
    OutgoingP2pCreated { peer: Peer, result: Result<SecureConnection, String> },
    P2pEndpointClosed { peer: Peer, is_outgoing: bool, is_reader: bool, error: Option<String> },
    P2pEndpointCrashed { peer: Peer, is_outgoing: bool, is_reader: bool, error: String },
    ApiEndpointClosed { client: ApiClient, is_reader: bool, error: Option<String> },
    ApiEndpointCrashed { client: ApiClient, is_reader: bool, error: String },

    // -- spawned-task replies --
    CentralProbeReply { probed: Peer, reachable: bool },

    // -- inbound traffic --
    IncomingApi { from: ApiClient, event: ApiEvent },
    IncomingP2p { from: Peer, message: PeerMessage },

    // -- control --
    Crash(String),
    Close,
}

/// Everything the membership controller reacts to.
#[derive(Debug)]
pub enum MembershipMsg {
    ProbePeerReply { probed: Peer, reachable: bool },
    PeerDisconnected(Peer),
    IncomingPushRequest(PushRequest),
    /// Puzzle check finished off-thread for an incoming push.
    PushRequestVerified(Peer),
    IncomingPullRequest { from: Peer },
    IncomingPullReply { from: Peer, view: Vec<Peer> },
    Close,
}

/// Everything the gossiper reacts to.
#[derive(Debug)]
pub enum GossiperMsg {
    Announce { item: GossipItem, ttl: u8 },
    Notify { client: ApiClient, data_type: DataType },
    Unnotify(ApiClient),
    Validation { client: ApiClient, message_id: u16, valid: bool },
    RandomPeerListReply { related: Option<GossipItem>, peers: Vec<Peer> },
    IncomingPush(RumorUpdate),
    IncomingPullRequest { from: Peer },
    IncomingPullReply { from: Peer, items: Vec<RumorUpdate> },
    Close,
}

/// Input queue of a peer connection's writer task.
#[derive(Debug)]
pub enum PeerWriterMsg {
    Send(PeerMessage),
    Close,
}

/// Input queue of an API connection's writer task.
#[derive(Debug)]
pub enum ApiWriterMsg {
    Notification { message_id: u16, item: GossipItem },
    Close,
}

impl fmt::Debug for CentralMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CentralMsg::PeerAdd(p) => write!(f, "PeerAdd({p})"),
            CentralMsg::PeerRemove(p) => write!(f, "PeerRemove({p})"),
            CentralMsg::ProbePeerRequest(p) => write!(f, "ProbePeerRequest({p})"),
            CentralMsg::MembershipPushRequest(pr) => {
                write!(f, "MembershipPushRequest(to {})", pr.to)
            }
            CentralMsg::MembershipPullRequest(p) => write!(f, "MembershipPullRequest({p})"),
            CentralMsg::MembershipPullReply { to, view } => {
                write!(f, "MembershipPullReply(to {to}, {} peers)", view.len())
            }
            CentralMsg::MembershipCrashed(e) => write!(f, "MembershipCrashed({e})"),
            CentralMsg::MembershipClosed => write!(f, "MembershipClosed"),
            CentralMsg::RandomPeerListRequest { num, .. } => {
                write!(f, "RandomPeerListRequest({num})")
            }
            CentralMsg::RandomPeerListRelease(peers) => {
                write!(f, "RandomPeerListRelease({} peers)", peers.len())
            }
            CentralMsg::GossipNotification { client, message_id, .. } => {
                write!(f, "GossipNotification({client}, id {message_id})")
            }
            CentralMsg::GossipPush { to, .. } => write!(f, "GossipPush(to {to})"),
            CentralMsg::GossipPullRequest(p) => write!(f, "GossipPullRequest({p})"),
            CentralMsg::GossipPullReply { to, items } => {
                write!(f, "GossipPullReply(to {to}, {} items)", items.len())
            }
            CentralMsg::GossiperCrashed(e) => write!(f, "GossiperCrashed({e})"),
            CentralMsg::GossiperClosed => write!(f, "GossiperClosed"),
            CentralMsg::ApiListenerCrashed(e) => write!(f, "ApiListenerCrashed({e})"),
            CentralMsg::ApiListenerClosed => write!(f, "ApiListenerClosed"),
            CentralMsg::ApiEndpointCreated { client, .. } => {
                write!(f, "ApiEndpointCreated({client})")
            }
            CentralMsg::P2pListenerCrashed(e) => write!(f, "P2pListenerCrashed({e})"),
            CentralMsg::P2pListenerClosed => write!(f, "P2pListenerClosed"),
            CentralMsg::IncomingP2pCreated { peer, .. } => {
                write!(f, "IncomingP2pCreated({peer})")
            }
            CentralMsg::OutgoingP2pCreated { peer, result } => write!(
                f,
                "OutgoingP2pCreated({peer}, {})",
                if result.is_ok() { "ok" } else { "failed" }
            ),
            CentralMsg::P2pEndpointClosed { peer, is_reader, .. } => {
                write!(f, "P2pEndpointClosed({peer}, reader={is_reader})")
            }
            CentralMsg::P2pEndpointCrashed { peer, is_reader, error, .. } => {
                write!(f, "P2pEndpointCrashed({peer}, reader={is_reader}, {error})")
            }
            CentralMsg::ApiEndpointClosed { client, is_reader, .. } => {
                write!(f, "ApiEndpointClosed({client}, reader={is_reader})")
            }
            CentralMsg::ApiEndpointCrashed { client, is_reader, error } => {
                write!(f, "ApiEndpointCrashed({client}, reader={is_reader}, {error})")
            }
            CentralMsg::CentralProbeReply { probed, reachable } => {
                write!(f, "CentralProbeReply({probed}, {reachable})")
            }
            CentralMsg::IncomingApi { from, .. } => write!(f, "IncomingApi({from})"),
            CentralMsg::IncomingP2p { from, .. } => write!(f, "IncomingP2p({from})"),
            CentralMsg::Crash(e) => write!(f, "Crash({e})"),
            CentralMsg::Close => write!(f, "Close"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_parse() {
        assert!(Peer::parse("10.0.0.1:7000").is_some());
        assert!(Peer::parse("[::1]:7000").is_some());
        assert!(Peer::parse("not-an-address").is_none());
        assert!(Peer::parse("10.0.0.1").is_none());
    }

    #[test]
    fn test_peer_equality_is_address_equality() {
        let a = Peer::parse("10.0.0.1:7000").unwrap();
        let b = Peer::parse("10.0.0.1:7000").unwrap();
        let c = Peer::parse("10.0.0.1:7001").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
