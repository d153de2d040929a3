//! Central controller -- the single-owner event loop.
//!
//! Owns every endpoint handle, the connection mirror of the membership
//! view, the incoming-peer view, the awaiting-removal bucket, the
//! actively-creating and actively-probing intents and the local API
//! client records. One message at a time; no handler blocks on I/O.
//! Dials, probes and handshakes run on spawned tasks that report back
//! over the bus.
//!
//! An outgoing endpoint is removed only when both halves have stopped
//! AND (the node is shutting down OR (its usage counter is zero AND the
//! membership controller evicted it)).

use std::collections::HashMap;

use murmur_protocol::{PeerMessage, PARAMS};
use murmur_transport::{SecureConnection, TransportConfig};
use rand::seq::IteratorRandom;
use tokio::sync::{mpsc, watch};

use crate::bus::{
    ApiClient, ApiEvent, ApiWriterMsg, CentralMsg, GossiperMsg, MembershipMsg, Peer, PeerWriterMsg,
};
use crate::{api_endpoint, peer_endpoint};

/// Loop continuation decision of a handler.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

/// State of one peer connection's task pair.
struct PeerEntry {
    writer_tx: mpsc::Sender<PeerWriterMsg>,
    cancel: watch::Sender<bool>,
    usage: i64,
    reader_running: bool,
    writer_running: bool,
    has_crashed: bool,
}

impl PeerEntry {
    fn new(writer_tx: mpsc::Sender<PeerWriterMsg>, cancel: watch::Sender<bool>) -> Self {
        Self {
            writer_tx,
            cancel,
            usage: 0,
            reader_running: true,
            writer_running: true,
            has_crashed: false,
        }
    }

    /// Idempotent close: a control frame for the writer, the cancel
    /// signal for the reader.
    fn close(&self) {
        let _ = self.cancel.send(true);
        let _ = self.writer_tx.try_send(PeerWriterMsg::Close);
    }

    fn both_stopped(&self) -> bool {
        !self.reader_running && !self.writer_running
    }
}

/// State of one API client's task pair.
struct ApiEntry {
    writer_tx: mpsc::Sender<ApiWriterMsg>,
    cancel: watch::Sender<bool>,
    reader_running: bool,
    writer_running: bool,
    has_crashed: bool,
}

impl ApiEntry {
    fn new(writer_tx: mpsc::Sender<ApiWriterMsg>, cancel: watch::Sender<bool>) -> Self {
        Self {
            writer_tx,
            cancel,
            reader_running: true,
            writer_running: true,
            has_crashed: false,
        }
    }

    fn close(&self) {
        let _ = self.cancel.send(true);
        let _ = self.writer_tx.try_send(ApiWriterMsg::Close);
    }

    fn both_stopped(&self) -> bool {
        !self.reader_running && !self.writer_running
    }
}

pub struct Central {
    transport: TransportConfig,

    /// Mirror of the membership view: peer -> live outgoing connection.
    view: HashMap<Peer, PeerEntry>,
    /// Evicted peers still borrowed by the gossiper.
    awaiting_removal: HashMap<Peer, PeerEntry>,
    /// Peers with a dial in flight; value = remove once created.
    creating: HashMap<Peer, bool>,
    /// Peers with a probe in flight; value = add once probed.
    probing: HashMap<Peer, bool>,
    /// Connections the remote side initiated, keyed by socket address.
    incoming: HashMap<Peer, PeerEntry>,
    incoming_max: usize,

    api_clients: HashMap<ApiClient, ApiEntry>,
    api_max: usize,

    membership_tx: mpsc::Sender<MembershipMsg>,
    gossiper_tx: mpsc::Sender<GossiperMsg>,
    self_tx: mpsc::Sender<CentralMsg>,
    listener_cancel: watch::Sender<bool>,

    is_stopping: bool,
    /// Live task accounting: two listeners, two controllers, plus a
    /// reader and a writer per endpoint.
    total_tasks: i32,
}

impl Central {
    pub fn new(
        transport: TransportConfig,
        cache_size: u16,
        membership_tx: mpsc::Sender<MembershipMsg>,
        gossiper_tx: mpsc::Sender<GossiperMsg>,
        self_tx: mpsc::Sender<CentralMsg>,
        listener_cancel: watch::Sender<bool>,
    ) -> Self {
        Self {
            transport,
            view: HashMap::new(),
            awaiting_removal: HashMap::new(),
            creating: HashMap::new(),
            probing: HashMap::new(),
            incoming: HashMap::new(),
            incoming_max: 2 * PARAMS.view_cap() as usize,
            api_clients: HashMap::new(),
            api_max: cache_size as usize,
            membership_tx,
            gossiper_tx,
            self_tx,
            listener_cancel,
            is_stopping: false,
            // Two listeners plus the membership and gossiper loops.
            total_tasks: 4,
        }
    }

    pub async fn handle(&mut self, msg: CentralMsg) -> Result<Flow, String> {
        match msg {
            CentralMsg::PeerAdd(peer) => self.on_peer_add(peer),
            CentralMsg::PeerRemove(peer) => self.on_peer_remove(peer),
            CentralMsg::ProbePeerRequest(peer) => self.on_probe_request(peer).await,
            CentralMsg::MembershipPushRequest(request) => {
                match Peer::parse(&request.to) {
                    Some(to) => {
                        self.send_to_outgoing(to, PeerMessage::MembershipPush(request))
                            .await
                    }
                    None => Ok(Flow::Continue),
                }
            }
            CentralMsg::MembershipPullRequest(peer) => {
                self.send_to_outgoing(peer, PeerMessage::MembershipPullRequest)
                    .await
            }
            CentralMsg::MembershipPullReply { to, view } => {
                let view = view.iter().map(|p| p.to_string()).collect();
                self.send_to_incoming(to, PeerMessage::MembershipPullReply { view })
                    .await
            }
            CentralMsg::MembershipCrashed(e) => Err(format!("membership controller crashed: {e}")),
            CentralMsg::MembershipClosed => {
                tracing::info!("ctl: membership controller closed");
                self.task_stopped()
            }
            CentralMsg::RandomPeerListRequest { related, num } => {
                self.on_random_peer_list_request(related, num).await
            }
            CentralMsg::RandomPeerListRelease(peers) => self.on_random_peer_list_release(peers),
            CentralMsg::GossipNotification {
                client,
                item,
                message_id,
            } => {
                if let Some(entry) = self.api_clients.get(&client) {
                    if entry.writer_running {
                        let _ = entry
                            .writer_tx
                            .send(ApiWriterMsg::Notification { message_id, item })
                            .await;
                    }
                }
                Ok(Flow::Continue)
            }
            CentralMsg::GossipPush { to, update } => {
                self.send_to_outgoing(to, PeerMessage::GossipPush(update))
                    .await
            }
            CentralMsg::GossipPullRequest(peer) => {
                self.send_to_outgoing(peer, PeerMessage::GossipPullRequest)
                    .await
            }
            CentralMsg::GossipPullReply { to, items } => {
                self.send_to_incoming(to, PeerMessage::GossipPullReply { items })
                    .await
            }
            CentralMsg::GossiperCrashed(e) => Err(format!("gossiper crashed: {e}")),
            CentralMsg::GossiperClosed => {
                tracing::info!("ctl: gossiper closed");
                self.task_stopped()
            }
            CentralMsg::ApiListenerCrashed(e) => Err(format!("api listener crashed: {e}")),
            CentralMsg::ApiListenerClosed => {
                tracing::info!("ctl: api listener closed");
                self.task_stopped()
            }
            CentralMsg::ApiEndpointCreated { client, stream } => {
                self.on_api_endpoint_created(client, stream)
            }
            CentralMsg::P2pListenerCrashed(e) => Err(format!("p2p listener crashed: {e}")),
            CentralMsg::P2pListenerClosed => {
                tracing::info!("ctl: p2p listener closed");
                self.task_stopped()
            }
            CentralMsg::IncomingP2pCreated { peer, connection } => {
                self.on_incoming_p2p_created(peer, connection)
            }
            CentralMsg::OutgoingP2pCreated { peer, result } => {
                self.on_outgoing_p2p_created(peer, result).await
            }
            CentralMsg::P2pEndpointClosed {
                peer,
                is_outgoing,
                is_reader,
                error,
            } => {
                self.on_p2p_endpoint_stopped(peer, is_outgoing, is_reader, error)
                    .await
            }
            CentralMsg::P2pEndpointCrashed {
                peer,
                is_outgoing,
                is_reader,
                error,
            } => {
                tracing::warn!(%peer, is_reader, error = %error, "ctl: p2p endpoint crashed");
                self.on_p2p_endpoint_stopped(peer, is_outgoing, is_reader, Some(error))
                    .await
            }
            CentralMsg::ApiEndpointClosed {
                client,
                is_reader,
                error,
            } => self.on_api_endpoint_stopped(client, is_reader, error).await,
            CentralMsg::ApiEndpointCrashed {
                client,
                is_reader,
                error,
            } => {
                tracing::warn!(%client, is_reader, error = %error, "ctl: api endpoint crashed");
                self.on_api_endpoint_stopped(client, is_reader, Some(error))
                    .await
            }
            CentralMsg::CentralProbeReply { probed, reachable } => {
                self.on_probe_reply(probed, reachable).await
            }
            CentralMsg::IncomingApi { from, event } => {
                let forward = match event {
                    ApiEvent::Announce { item, ttl } => GossiperMsg::Announce { item, ttl },
                    ApiEvent::Notify { data_type } => GossiperMsg::Notify {
                        client: from,
                        data_type,
                    },
                    ApiEvent::Validation { message_id, valid } => GossiperMsg::Validation {
                        client: from,
                        message_id,
                        valid,
                    },
                };
                let _ = self.gossiper_tx.send(forward).await;
                Ok(Flow::Continue)
            }
            CentralMsg::IncomingP2p { from, message } => self.on_incoming_p2p(from, message).await,
            CentralMsg::Crash(e) => Err(e),
            CentralMsg::Close => self.on_close().await,
        }
    }

    fn on_peer_add(&mut self, peer: Peer) -> Result<Flow, String> {
        if self.view.contains_key(&peer) {
            return Ok(Flow::Continue);
        }
        if let Some(entry) = self.awaiting_removal.remove(&peer) {
            self.view.insert(peer, entry);
            return Ok(Flow::Continue);
        }
        if let Some(remove_later) = self.creating.get_mut(&peer) {
            *remove_later = false;
            return Ok(Flow::Continue);
        }
        if let Some(add_later) = self.probing.get_mut(&peer) {
            *add_later = true;
            return Ok(Flow::Continue);
        }

        self.creating.insert(peer, false);
        let config = self.transport.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = murmur_transport::connect(peer.0, &config)
                .await
                .map_err(|e| e.to_string());
            let _ = tx
                .send(CentralMsg::OutgoingP2pCreated { peer, result })
                .await;
        });
        Ok(Flow::Continue)
    }

    fn on_peer_remove(&mut self, peer: Peer) -> Result<Flow, String> {
        if self.awaiting_removal.contains_key(&peer) {
            return Ok(Flow::Continue);
        }
        if let Some(entry) = self.view.remove(&peer) {
            if entry.usage <= 0 {
                if entry.both_stopped() {
                    // Nothing left to tear down.
                    return Ok(Flow::Continue);
                }
                entry.close();
            }
            self.awaiting_removal.insert(peer, entry);
            return Ok(Flow::Continue);
        }
        if let Some(remove_later) = self.creating.get_mut(&peer) {
            *remove_later = true;
            return Ok(Flow::Continue);
        }
        if let Some(add_later) = self.probing.get_mut(&peer) {
            *add_later = false;
        }
        Ok(Flow::Continue)
    }

    async fn on_probe_request(&mut self, peer: Peer) -> Result<Flow, String> {
        // A peer we hold a connection or dial intent for counts as
        // reachable without touching the network.
        if self.view.contains_key(&peer)
            || self.awaiting_removal.contains_key(&peer)
            || self.creating.contains_key(&peer)
        {
            let _ = self
                .membership_tx
                .send(MembershipMsg::ProbePeerReply {
                    probed: peer,
                    reachable: true,
                })
                .await;
            return Ok(Flow::Continue);
        }

        self.probing.insert(peer, false);
        let tx = self.self_tx.clone();
        let timeout = std::time::Duration::from_secs(PARAMS.connection_timeout_secs);
        tokio::spawn(async move {
            let reachable = matches!(
                tokio::time::timeout(timeout, tokio::net::TcpStream::connect(peer.0)).await,
                Ok(Ok(_))
            );
            let _ = tx
                .send(CentralMsg::CentralProbeReply {
                    probed: peer,
                    reachable,
                })
                .await;
        });
        Ok(Flow::Continue)
    }

    async fn on_probe_reply(&mut self, probed: Peer, reachable: bool) -> Result<Flow, String> {
        let Some(add_later) = self.probing.remove(&probed) else {
            tracing::warn!(peer = %probed, "ctl: probe reply without registration");
            return Ok(Flow::Continue);
        };
        let _ = self
            .membership_tx
            .send(MembershipMsg::ProbePeerReply { probed, reachable })
            .await;
        if add_later {
            let _ = self.self_tx.send(CentralMsg::PeerAdd(probed)).await;
        }
        Ok(Flow::Continue)
    }

    async fn on_random_peer_list_request(
        &mut self,
        related: Option<murmur_protocol::GossipItem>,
        num: usize,
    ) -> Result<Flow, String> {
        let chosen: Vec<Peer> = self
            .view
            .keys()
            .copied()
            .choose_multiple(&mut rand::thread_rng(), num.min(self.view.len()));
        for peer in &chosen {
            if let Some(entry) = self.view.get_mut(peer) {
                entry.usage += 1;
            }
        }
        let _ = self
            .gossiper_tx
            .send(GossiperMsg::RandomPeerListReply {
                related,
                peers: chosen,
            })
            .await;
        Ok(Flow::Continue)
    }

    fn on_random_peer_list_release(&mut self, peers: Vec<Peer>) -> Result<Flow, String> {
        for peer in peers {
            if let Some(entry) = self.view.get_mut(&peer) {
                entry.usage -= 1;
            } else if let Some(entry) = self.awaiting_removal.get_mut(&peer) {
                entry.usage -= 1;
                if entry.usage <= 0 {
                    if entry.both_stopped() {
                        self.awaiting_removal.remove(&peer);
                    } else {
                        entry.close();
                    }
                }
            } else {
                // A borrowed peer must survive until its release.
                tracing::warn!(%peer, "ctl: released peer was already deleted");
            }
        }
        Ok(Flow::Continue)
    }

    fn on_api_endpoint_created(
        &mut self,
        client: ApiClient,
        stream: tokio::net::TcpStream,
    ) -> Result<Flow, String> {
        let exists = self.api_clients.contains_key(&client);
        if exists {
            tracing::warn!(%client, "ctl: api endpoint already exists");
        }
        if self.api_clients.len() >= self.api_max || exists || self.is_stopping {
            drop(stream); // closes the socket
            return Ok(Flow::Continue);
        }
        let (writer_tx, cancel) = api_endpoint::spawn(client, stream, self.self_tx.clone());
        self.total_tasks += 2;
        self.api_clients
            .insert(client, ApiEntry::new(writer_tx, cancel));
        tracing::info!(%client, "ctl: api client connected");
        Ok(Flow::Continue)
    }

    fn on_incoming_p2p_created(
        &mut self,
        peer: Peer,
        connection: SecureConnection,
    ) -> Result<Flow, String> {
        let exists = self.incoming.contains_key(&peer);
        if exists {
            tracing::warn!(%peer, "ctl: incoming endpoint already exists");
        }
        if self.incoming.len() >= self.incoming_max || exists || self.is_stopping {
            drop(connection);
            return Ok(Flow::Continue);
        }
        let (writer_tx, cancel) = peer_endpoint::spawn(peer, false, connection, self.self_tx.clone());
        self.total_tasks += 2;
        self.incoming.insert(peer, PeerEntry::new(writer_tx, cancel));
        tracing::info!(%peer, "ctl: incoming peer connected");
        Ok(Flow::Continue)
    }

    async fn on_outgoing_p2p_created(
        &mut self,
        peer: Peer,
        result: Result<SecureConnection, String>,
    ) -> Result<Flow, String> {
        let Some(remove_later) = self.creating.remove(&peer) else {
            tracing::warn!(%peer, "ctl: outgoing endpoint created without registration");
            return Ok(Flow::Continue);
        };
        let connection = match result {
            Ok(connection) => connection,
            Err(error) => {
                tracing::warn!(%peer, error = %error, "ctl: dial failed");
                // Let the membership view converge on the next round.
                let _ = self
                    .membership_tx
                    .send(MembershipMsg::PeerDisconnected(peer))
                    .await;
                return Ok(Flow::Continue);
            }
        };

        let (writer_tx, cancel) = peer_endpoint::spawn(peer, true, connection, self.self_tx.clone());
        self.total_tasks += 2;
        self.view.insert(peer, PeerEntry::new(writer_tx, cancel));
        tracing::info!(%peer, "ctl: outgoing peer connected");

        if remove_later {
            let _ = self.self_tx.send(CentralMsg::PeerRemove(peer)).await;
        }
        Ok(Flow::Continue)
    }

    async fn on_p2p_endpoint_stopped(
        &mut self,
        peer: Peer,
        is_outgoing: bool,
        is_reader: bool,
        error: Option<String>,
    ) -> Result<Flow, String> {
        if is_outgoing {
            self.outgoing_endpoint_stopped(peer, is_reader, error).await
        } else {
            self.incoming_endpoint_stopped(peer, is_reader, error)
        }
    }

    async fn outgoing_endpoint_stopped(
        &mut self,
        peer: Peer,
        is_reader: bool,
        error: Option<String>,
    ) -> Result<Flow, String> {
        let in_removal = self.awaiting_removal.contains_key(&peer);
        let entry = if in_removal {
            self.awaiting_removal.get_mut(&peer)
        } else {
            self.view.get_mut(&peer)
        };
        let Some(entry) = entry else {
            return Ok(Flow::Continue);
        };

        if is_reader {
            if !entry.reader_running {
                return Ok(Flow::Continue);
            }
            entry.reader_running = false;
        } else {
            if !entry.writer_running {
                return Ok(Flow::Continue);
            }
            entry.writer_running = false;
        }
        self.total_tasks -= 1;
        if error.is_some() {
            entry.has_crashed = true;
        }

        let both_stopped = entry.both_stopped();
        let has_crashed = entry.has_crashed;
        if !both_stopped {
            if has_crashed {
                // One half is still up; force it down.
                entry.close();
            }
            return Ok(Flow::Continue);
        }

        if has_crashed {
            tracing::warn!(%peer, error = error.as_deref().unwrap_or(""), "ctl: outgoing peer torn down");
        } else {
            tracing::info!(%peer, "ctl: outgoing peer closed");
        }
        if self.is_stopping {
            self.view.remove(&peer);
            self.awaiting_removal.remove(&peer);
        } else if !in_removal {
            // Closed without an eviction: drop the mirror entry and
            // let the membership controller converge.
            self.view.remove(&peer);
            let _ = self
                .membership_tx
                .send(MembershipMsg::PeerDisconnected(peer))
                .await;
        } else if self.awaiting_removal.get(&peer).map(|e| e.usage <= 0) == Some(true) {
            self.awaiting_removal.remove(&peer);
        }
        self.check_all_stopped()
    }

    fn incoming_endpoint_stopped(
        &mut self,
        peer: Peer,
        is_reader: bool,
        error: Option<String>,
    ) -> Result<Flow, String> {
        let Some(entry) = self.incoming.get_mut(&peer) else {
            return Ok(Flow::Continue);
        };
        if is_reader {
            if !entry.reader_running {
                return Ok(Flow::Continue);
            }
            entry.reader_running = false;
        } else {
            if !entry.writer_running {
                return Ok(Flow::Continue);
            }
            entry.writer_running = false;
        }
        self.total_tasks -= 1;
        if error.is_some() {
            entry.has_crashed = true;
        }

        let both_stopped = entry.both_stopped();
        let has_crashed = entry.has_crashed;
        if both_stopped {
            tracing::info!(%peer, crashed = has_crashed, "ctl: incoming peer closed");
            self.incoming.remove(&peer);
            return self.check_all_stopped();
        } else if has_crashed {
            entry.close();
        }
        Ok(Flow::Continue)
    }

    async fn on_api_endpoint_stopped(
        &mut self,
        client: ApiClient,
        is_reader: bool,
        error: Option<String>,
    ) -> Result<Flow, String> {
        let Some(entry) = self.api_clients.get_mut(&client) else {
            return Ok(Flow::Continue);
        };
        if is_reader {
            if !entry.reader_running {
                return Ok(Flow::Continue);
            }
            entry.reader_running = false;
        } else {
            if !entry.writer_running {
                return Ok(Flow::Continue);
            }
            entry.writer_running = false;
        }
        self.total_tasks -= 1;
        if error.is_some() {
            entry.has_crashed = true;
        }

        let both_stopped = entry.both_stopped();
        let has_crashed = entry.has_crashed;
        if both_stopped {
            tracing::info!(%client, crashed = has_crashed, "ctl: api client closed");
            self.api_clients.remove(&client);
            // Drop the client's subscriptions with it.
            let _ = self.gossiper_tx.send(GossiperMsg::Unnotify(client)).await;
            return self.check_all_stopped();
        } else if has_crashed {
            entry.close();
        }
        Ok(Flow::Continue)
    }

    async fn on_incoming_p2p(&mut self, from: Peer, message: PeerMessage) -> Result<Flow, String> {
        match message {
            PeerMessage::MembershipPush(request) => {
                let _ = self
                    .membership_tx
                    .send(MembershipMsg::IncomingPushRequest(request))
                    .await;
            }
            PeerMessage::MembershipPullRequest => {
                let _ = self
                    .membership_tx
                    .send(MembershipMsg::IncomingPullRequest { from })
                    .await;
            }
            PeerMessage::MembershipPullReply { view } => {
                // Syntactic validation happens here; junk never reaches
                // the membership controller.
                let view = view.iter().filter_map(|a| Peer::parse(a)).collect();
                let _ = self
                    .membership_tx
                    .send(MembershipMsg::IncomingPullReply { from, view })
                    .await;
            }
            PeerMessage::GossipPush(update) => {
                let _ = self
                    .gossiper_tx
                    .send(GossiperMsg::IncomingPush(update))
                    .await;
            }
            PeerMessage::GossipPullRequest => {
                let _ = self
                    .gossiper_tx
                    .send(GossiperMsg::IncomingPullRequest { from })
                    .await;
            }
            PeerMessage::GossipPullReply { items } => {
                let _ = self
                    .gossiper_tx
                    .send(GossiperMsg::IncomingPullReply { from, items })
                    .await;
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_close(&mut self) -> Result<Flow, String> {
        if self.is_stopping {
            return Ok(Flow::Continue);
        }
        tracing::info!("ctl: closing");
        self.is_stopping = true;

        let _ = self.listener_cancel.send(true);
        let _ = self.membership_tx.send(MembershipMsg::Close).await;
        let _ = self.gossiper_tx.send(GossiperMsg::Close).await;

        for entry in self.view.values() {
            entry.close();
        }
        for entry in self.awaiting_removal.values() {
            entry.close();
        }
        for entry in self.incoming.values() {
            entry.close();
        }
        for entry in self.api_clients.values() {
            entry.close();
        }
        for remove_later in self.creating.values_mut() {
            *remove_later = true;
        }
        for add_later in self.probing.values_mut() {
            *add_later = false;
        }

        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(PARAMS.closure_timeout_secs)).await;
            let _ = tx
                .send(CentralMsg::Crash("graceful closure timed out".into()))
                .await;
        });
        Ok(Flow::Continue)
    }

    async fn send_to_outgoing(&mut self, peer: Peer, msg: PeerMessage) -> Result<Flow, String> {
        let entry = if let Some(entry) = self.view.get(&peer) {
            entry
        } else if let Some(entry) = self.awaiting_removal.get(&peer) {
            entry
        } else {
            return Ok(Flow::Continue);
        };
        if entry.writer_running {
            let _ = entry.writer_tx.send(PeerWriterMsg::Send(msg)).await;
        }
        Ok(Flow::Continue)
    }

    async fn send_to_incoming(&mut self, peer: Peer, msg: PeerMessage) -> Result<Flow, String> {
        if let Some(entry) = self.incoming.get(&peer) {
            if entry.writer_running {
                let _ = entry.writer_tx.send(PeerWriterMsg::Send(msg)).await;
            }
        }
        Ok(Flow::Continue)
    }

    fn task_stopped(&mut self) -> Result<Flow, String> {
        self.total_tasks -= 1;
        self.check_all_stopped()
    }

    fn check_all_stopped(&self) -> Result<Flow, String> {
        if self.total_tasks <= 0 {
            Ok(Flow::Shutdown)
        } else {
            Ok(Flow::Continue)
        }
    }
}

/// Messages still honored while the controller is stopping.
fn allowed_while_stopping(msg: &CentralMsg) -> bool {
    matches!(
        msg,
        CentralMsg::PeerRemove(_)
            | CentralMsg::MembershipCrashed(_)
            | CentralMsg::MembershipClosed
            | CentralMsg::GossiperCrashed(_)
            | CentralMsg::GossiperClosed
            | CentralMsg::ApiListenerCrashed(_)
            | CentralMsg::ApiListenerClosed
            | CentralMsg::ApiEndpointCreated { .. }
            | CentralMsg::ApiEndpointClosed { .. }
            | CentralMsg::ApiEndpointCrashed { .. }
            | CentralMsg::P2pListenerCrashed(_)
            | CentralMsg::P2pListenerClosed
            | CentralMsg::IncomingP2pCreated { .. }
            | CentralMsg::P2pEndpointClosed { .. }
            | CentralMsg::P2pEndpointCrashed { .. }
            | CentralMsg::OutgoingP2pCreated { .. }
            | CentralMsg::Crash(_)
    )
}

/// Run the central loop to completion. `Err` carries the fatal crash
/// reason; the process exits nonzero for it.
pub async fn run(mut central: Central, mut rx: mpsc::Receiver<CentralMsg>) -> Result<(), String> {
    loop {
        let Some(msg) = rx.recv().await else {
            return Ok(());
        };
        if central.is_stopping && !allowed_while_stopping(&msg) {
            continue;
        }
        tracing::trace!(?msg, "ctl: dispatch");
        match central.handle(msg).await? {
            Flow::Continue => {}
            Flow::Shutdown => {
                tracing::info!("ctl: all submodules stopped, shutting down");
                return Ok(());
            }
        }
    }
}
