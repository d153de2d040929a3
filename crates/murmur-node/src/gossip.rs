//! Gossiper -- median-counter rumor dissemination over the view.
//!
//! The state machine is synchronous: handlers mutate the cache and
//! append commands for the central controller to an outbox, which the
//! run loop drains after every event. Rumors move B -> C -> D; state D
//! lives in the old set and only suppresses re-entry.

use std::collections::{HashMap, HashSet};

use murmur_protocol::{DataType, GossipItem, ProtocolParams, RumorState, RumorUpdate};
use tokio::sync::mpsc;

use crate::bus::{ApiClient, CentralMsg, GossiperMsg, Peer};

/// An actively disseminated rumor.
struct ActiveItem {
    state: RumorState,
    counter: u8,
    ttl: u8,
    /// Median-rule accumulator, applied at the end of each update phase.
    median: i32,
    /// Peers borrowed from the central controller for this item.
    peers: Vec<Peer>,
}

/// Per-client subscription record.
#[derive(Default)]
struct ClientRecord {
    interests: HashSet<DataType>,
    /// message_id -> item awaiting a validation verdict.
    pending_validation: HashMap<u16, GossipItem>,
    next_id: u16,
}

pub struct Gossiper {
    cache_size: usize,
    degree: u8,
    max_ttl: u8,
    /// Counter threshold for both state B and state C.
    threshold: u8,

    active: HashMap<GossipItem, ActiveItem>,
    /// Retired or invalidated items, value = remaining suppression TTL.
    old: HashMap<GossipItem, u8>,
    /// Incoming batch, merged during the round's update phase.
    incoming: HashMap<GossipItem, (RumorState, u8)>,

    clients: HashMap<ApiClient, ClientRecord>,

    /// Peers to pull from at the next round tick.
    next_pull_peers: Vec<Peer>,
    /// Peers pulled from last round, still borrowed.
    in_flight_pulls: Vec<Peer>,

    /// Commands for the central controller, drained by the run loop.
    out: Vec<CentralMsg>,
}

impl Gossiper {
    pub fn new(params: &ProtocolParams, cache_size: u16, degree: u8, max_ttl: u8) -> Self {
        Self {
            cache_size: cache_size as usize,
            degree,
            max_ttl,
            threshold: params.counter_threshold(degree),
            active: HashMap::new(),
            old: HashMap::new(),
            incoming: HashMap::new(),
            clients: HashMap::new(),
            next_pull_peers: Vec::new(),
            in_flight_pulls: Vec::new(),
            out: Vec::new(),
        }
    }

    /// Drain the pending commands for the central controller.
    pub fn take_out(&mut self) -> Vec<CentralMsg> {
        std::mem::take(&mut self.out)
    }

    pub fn handle(&mut self, msg: GossiperMsg) {
        match msg {
            GossiperMsg::Announce { item, ttl } => self.on_announce(item, ttl),
            GossiperMsg::Notify { client, data_type } => {
                self.clients
                    .entry(client)
                    .or_default()
                    .interests
                    .insert(data_type);
            }
            GossiperMsg::Unnotify(client) => {
                self.clients.remove(&client);
            }
            GossiperMsg::Validation {
                client,
                message_id,
                valid,
            } => self.on_validation(client, message_id, valid),
            GossiperMsg::RandomPeerListReply { related, peers } => {
                self.on_peer_list_reply(related, peers)
            }
            GossiperMsg::IncomingPush(update) => self.merge_incoming(update),
            GossiperMsg::IncomingPullRequest { from } => {
                let items: Vec<RumorUpdate> = self
                    .active
                    .iter()
                    .take(self.cache_size)
                    .map(|(item, info)| RumorUpdate {
                        item: item.clone(),
                        state: info.state,
                        counter: info.counter,
                    })
                    .collect();
                self.out.push(CentralMsg::GossipPullReply { to: from, items });
            }
            GossiperMsg::IncomingPullReply { from: _, items } => {
                for update in items {
                    self.merge_incoming(update);
                }
            }
            GossiperMsg::Close => self.release_everything(),
        }
    }

    fn on_announce(&mut self, item: GossipItem, ttl: u8) {
        self.notify_interested(&item);

        if self.active.len() >= self.cache_size
            || self.active.contains_key(&item)
            || self.old.contains_key(&item)
        {
            tracing::debug!(data_type = item.data_type, "gsp: announce not admitted");
            return;
        }

        let ttl = if ttl == 0 {
            self.max_ttl
        } else {
            ttl.min(self.max_ttl)
        };
        self.out.push(CentralMsg::RandomPeerListRequest {
            related: Some(item.clone()),
            num: self.degree as usize * ttl as usize,
        });
        self.active.insert(
            item,
            ActiveItem {
                state: RumorState::B,
                counter: 1,
                ttl,
                median: 0,
                peers: Vec::new(),
            },
        );
    }

    fn on_validation(&mut self, client: ApiClient, message_id: u16, valid: bool) {
        let Some(record) = self.clients.get_mut(&client) else {
            return;
        };
        let Some(item) = record.pending_validation.remove(&message_id) else {
            return;
        };
        if valid {
            return;
        }
        tracing::info!(data_type = item.data_type, "gsp: item invalidated by client");
        if let Some(info) = self.active.remove(&item) {
            self.release(info.peers);
        }
        self.incoming.remove(&item);
        self.old.insert(item, self.max_ttl);
    }

    fn on_peer_list_reply(&mut self, related: Option<GossipItem>, peers: Vec<Peer>) {
        match related {
            Some(item) => match self.active.get_mut(&item) {
                Some(info) => info.peers = peers,
                // The item retired or was invalidated before the reply
                // arrived; the borrow must still be returned.
                None => self.release(peers),
            },
            None => self.next_pull_peers = peers,
        }
    }

    /// Admit an incoming (item, state, counter) into the batch.
    fn merge_incoming(&mut self, update: RumorUpdate) {
        if update.counter >= self.threshold {
            return;
        }
        let is_active = self.active.contains_key(&update.item);
        if !is_active && !self.incoming.contains_key(&update.item) {
            // A brand-new item needs a free cache slot.
            let pending_new = self
                .incoming
                .keys()
                .filter(|item| !self.active.contains_key(*item))
                .count();
            if self.active.len() + pending_new >= self.cache_size {
                return;
            }
            self.incoming
                .insert(update.item, (update.state, update.counter));
            return;
        }
        match self.incoming.get_mut(&update.item) {
            Some(existing) => {
                let existing_rank = ((existing.0 as u16) << 8) | existing.1 as u16;
                if update.rank() > existing_rank {
                    *existing = (update.state, update.counter);
                }
            }
            None => {
                self.incoming
                    .insert(update.item, (update.state, update.counter));
            }
        }
    }

    /// One gossip round: push, pull, update, age.
    pub fn round(&mut self) {
        self.push_phase();
        self.pull_phase();
        self.update_phase();
        self.age_phase();
    }

    fn push_phase(&mut self) {
        let mut retired = Vec::new();
        for (item, info) in self.active.iter_mut() {
            if !info.peers.is_empty() {
                let fanout = (self.degree as usize).min(info.peers.len());
                let window = info.ttl as usize * self.degree as usize;
                for i in 0..fanout {
                    let to = info.peers[(window + i) % info.peers.len()];
                    self.out.push(CentralMsg::GossipPush {
                        to,
                        update: RumorUpdate {
                            item: item.clone(),
                            state: info.state,
                            counter: info.counter,
                        },
                    });
                }
            }
            info.ttl = info.ttl.saturating_sub(1);
            if info.ttl == 0 || (info.state == RumorState::C && info.counter >= self.threshold) {
                retired.push(item.clone());
            }
        }
        for item in retired {
            if let Some(info) = self.active.remove(&item) {
                tracing::debug!(data_type = item.data_type, "gsp: item retired");
                self.release(info.peers);
                self.old.insert(item, self.max_ttl);
            }
        }
    }

    fn pull_phase(&mut self) {
        for peer in &self.next_pull_peers {
            self.out.push(CentralMsg::GossipPullRequest(*peer));
        }
        let finished = std::mem::replace(
            &mut self.in_flight_pulls,
            std::mem::take(&mut self.next_pull_peers),
        );
        self.release(finished);
        self.out.push(CentralMsg::RandomPeerListRequest {
            related: None,
            num: self.degree as usize,
        });
    }

    fn update_phase(&mut self) {
        let batch = std::mem::take(&mut self.incoming);
        for (item, (state, counter)) in batch {
            if self.old.contains_key(&item) {
                continue;
            }
            if let Some(info) = self.active.get_mut(&item) {
                match (info.state, state) {
                    (RumorState::B, RumorState::B) => {
                        if counter >= info.counter {
                            info.median += 1;
                        } else {
                            info.median -= 1;
                        }
                    }
                    (RumorState::B, RumorState::C) => {
                        info.state = RumorState::C;
                        info.counter = 0;
                        info.median = 0;
                    }
                    (RumorState::C, _) => {}
                }
            } else if self.active.len() < self.cache_size {
                self.notify_interested(&item);
                let horizon = match state {
                    RumorState::B => self.max_ttl,
                    RumorState::C => self.threshold,
                };
                self.out.push(CentralMsg::RandomPeerListRequest {
                    related: Some(item.clone()),
                    num: self.degree as usize * horizon as usize,
                });
                self.active.insert(
                    item,
                    ActiveItem {
                        state,
                        counter,
                        ttl: self.max_ttl,
                        median: 0,
                        peers: Vec::new(),
                    },
                );
            }
        }

        // Median rule, then advance the cooling counters.
        for info in self.active.values_mut() {
            match info.state {
                RumorState::B => {
                    if info.median > 0 {
                        info.counter = info.counter.saturating_add(1);
                    }
                    info.median = 0;
                    if info.counter >= self.threshold {
                        info.state = RumorState::C;
                        info.counter = 0;
                    }
                }
                RumorState::C => {
                    info.counter = info.counter.saturating_add(1);
                }
            }
        }
    }

    fn age_phase(&mut self) {
        self.old.retain(|_, ttl| {
            *ttl = ttl.saturating_sub(1);
            *ttl > 0
        });
    }

    fn notify_interested(&mut self, item: &GossipItem) {
        for (client, record) in self.clients.iter_mut() {
            if !record.interests.contains(&item.data_type) {
                continue;
            }
            let message_id = record.next_id;
            record.next_id = record.next_id.wrapping_add(1);
            record.pending_validation.insert(message_id, item.clone());
            self.out.push(CentralMsg::GossipNotification {
                client: *client,
                item: item.clone(),
                message_id,
            });
        }
    }

    fn release(&mut self, peers: Vec<Peer>) {
        if !peers.is_empty() {
            self.out.push(CentralMsg::RandomPeerListRelease(peers));
        }
    }

    /// Return every outstanding borrow before shutting down.
    fn release_everything(&mut self) {
        let mut all: Vec<Peer> = Vec::new();
        for info in self.active.values_mut() {
            all.append(&mut info.peers);
        }
        all.append(&mut self.in_flight_pulls);
        all.append(&mut self.next_pull_peers);
        self.release(all);
    }
}

/// Run the gossiper loop until `Close` arrives or the input channel
/// drops. Panics are caught and reported as a crash.
pub async fn run(
    mut gossiper: Gossiper,
    mut rx: mpsc::Receiver<GossiperMsg>,
    central_tx: mpsc::Sender<CentralMsg>,
    round_period: std::time::Duration,
) {
    use futures::FutureExt;

    let tx = central_tx.clone();
    let fut = async move {
        let mut ticker = tokio::time::interval(round_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    gossiper.round();
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let closing = matches!(msg, GossiperMsg::Close);
                    gossiper.handle(msg);
                    if closing {
                        for out in gossiper.take_out() {
                            let _ = central_tx.send(out).await;
                        }
                        break;
                    }
                }
            }
            for out in gossiper.take_out() {
                if central_tx.send(out).await.is_err() {
                    return;
                }
            }
        }
    };

    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(()) => {
            tracing::info!("gsp: closed");
            let _ = tx.send(CentralMsg::GossiperClosed).await;
        }
        Err(panic) => {
            let detail = crate::panic_detail(panic);
            tracing::error!(error = %detail, "gsp: crashed");
            let _ = tx.send(CentralMsg::GossiperCrashed(detail)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_protocol::PARAMS;

    fn peer(n: u8) -> Peer {
        Peer::parse(&format!("10.0.0.{n}:7000")).unwrap()
    }

    fn client(n: u8) -> ApiClient {
        ApiClient(format!("127.0.0.{n}:50000").parse().unwrap())
    }

    fn item(data: &[u8]) -> GossipItem {
        GossipItem {
            data_type: 7,
            data: data.to_vec(),
        }
    }

    fn gossiper() -> Gossiper {
        // cache 50, degree 4 -> threshold 2, max_ttl 3 for short tests
        Gossiper::new(&PARAMS, 50, 4, 3)
    }

    fn peer_requests(out: &[CentralMsg]) -> Vec<(Option<GossipItem>, usize)> {
        out.iter()
            .filter_map(|m| match m {
                CentralMsg::RandomPeerListRequest { related, num } => {
                    Some((related.clone(), *num))
                }
                _ => None,
            })
            .collect()
    }

    fn released(out: &[CentralMsg]) -> Vec<Peer> {
        out.iter()
            .flat_map(|m| match m {
                CentralMsg::RandomPeerListRelease(peers) => peers.clone(),
                _ => vec![],
            })
            .collect()
    }

    #[test]
    fn test_announce_admits_in_state_b() {
        let mut g = gossiper();
        g.handle(GossiperMsg::Announce {
            item: item(b"hi"),
            ttl: 3,
        });
        let info = g.active.get(&item(b"hi")).unwrap();
        assert_eq!(info.state, RumorState::B);
        assert_eq!(info.counter, 1);
        assert_eq!(info.ttl, 3);

        let reqs = peer_requests(&g.take_out());
        assert_eq!(reqs, vec![(Some(item(b"hi")), 4 * 3)]);
    }

    #[test]
    fn test_announce_ttl_zero_means_max() {
        let mut g = gossiper();
        g.handle(GossiperMsg::Announce {
            item: item(b"a"),
            ttl: 0,
        });
        assert_eq!(g.active.get(&item(b"a")).unwrap().ttl, 3);

        // And an oversized request is capped.
        g.handle(GossiperMsg::Announce {
            item: item(b"b"),
            ttl: 200,
        });
        assert_eq!(g.active.get(&item(b"b")).unwrap().ttl, 3);
    }

    #[test]
    fn test_duplicate_announce_not_readmitted() {
        let mut g = gossiper();
        g.handle(GossiperMsg::Announce {
            item: item(b"x"),
            ttl: 3,
        });
        g.take_out();
        g.handle(GossiperMsg::Announce {
            item: item(b"x"),
            ttl: 3,
        });
        assert!(peer_requests(&g.take_out()).is_empty());
        assert_eq!(g.active.len(), 1);
    }

    #[test]
    fn test_announce_notifies_subscribers_once() {
        let mut g = gossiper();
        g.handle(GossiperMsg::Notify {
            client: client(1),
            data_type: 7,
        });
        g.handle(GossiperMsg::Notify {
            client: client(2),
            data_type: 9,
        });
        g.handle(GossiperMsg::Announce {
            item: item(b"hi"),
            ttl: 3,
        });

        let out = g.take_out();
        let notes: Vec<_> = out
            .iter()
            .filter_map(|m| match m {
                CentralMsg::GossipNotification {
                    client,
                    message_id,
                    item,
                } => Some((*client, *message_id, item.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(notes.len(), 1, "only the matching subscriber is notified");
        assert_eq!(notes[0].0, client(1));
        assert_eq!(notes[0].1, 0, "first message id is 0");
        assert_eq!(notes[0].2, item(b"hi"));
    }

    #[test]
    fn test_cache_capacity_bounds_announces() {
        let mut g = Gossiper::new(&PARAMS, 2, 4, 3);
        for n in 0..4u8 {
            g.handle(GossiperMsg::Announce {
                item: item(&[n]),
                ttl: 3,
            });
        }
        assert_eq!(g.active.len(), 2);
    }

    #[test]
    fn test_push_phase_uses_ttl_window_and_retires() {
        let mut g = gossiper();
        g.handle(GossiperMsg::Announce {
            item: item(b"w"),
            ttl: 1,
        });
        g.take_out();
        let peers: Vec<Peer> = (1..=6).map(peer).collect();
        g.handle(GossiperMsg::RandomPeerListReply {
            related: Some(item(b"w")),
            peers: peers.clone(),
        });

        g.round();
        let out = g.take_out();
        let pushed: Vec<Peer> = out
            .iter()
            .filter_map(|m| match m {
                CentralMsg::GossipPush { to, .. } => Some(*to),
                _ => None,
            })
            .collect();
        // ttl=1, degree=4: window starts at 4 mod 6.
        assert_eq!(pushed, vec![peer(5), peer(6), peer(1), peer(2)]);

        // ttl hit zero: the item retired into the old set and its peers
        // were released.
        assert!(g.active.is_empty());
        assert!(g.old.contains_key(&item(b"w")));
        assert_eq!(released(&out), peers);
    }

    #[test]
    fn test_push_idempotence_within_round() {
        // Degree 2 gives a counter threshold of 5, so a single advance
        // is observable without tripping the B -> C transition.
        let mut g = Gossiper::new(&PARAMS, 50, 2, 3);
        g.handle(GossiperMsg::Announce {
            item: item(b"m"),
            ttl: 3,
        });
        g.take_out();

        let update = RumorUpdate {
            item: item(b"m"),
            state: RumorState::B,
            counter: 1,
        };
        g.handle(GossiperMsg::IncomingPush(update.clone()));
        g.handle(GossiperMsg::IncomingPush(update));
        g.round();

        // The duplicate collapses in the batch: the median rule fires
        // once and the counter advances exactly once.
        let info = g.active.get(&item(b"m")).unwrap();
        assert_eq!(info.state, RumorState::B);
        assert_eq!(info.counter, 2);
    }

    #[test]
    fn test_median_rule_demotes_on_lagging_counters() {
        let mut g = gossiper();
        g.handle(GossiperMsg::Announce {
            item: item(b"m"),
            ttl: 3,
        });
        g.take_out();
        // Own counter is 1; an incoming counter of 0 votes down.
        g.handle(GossiperMsg::IncomingPush(RumorUpdate {
            item: item(b"m"),
            state: RumorState::B,
            counter: 0,
        }));
        g.round();
        assert_eq!(g.active.get(&item(b"m")).unwrap().counter, 1);
        assert_eq!(g.active.get(&item(b"m")).unwrap().state, RumorState::B);
    }

    #[test]
    fn test_b_transitions_to_c_at_threshold() {
        let mut g = gossiper();
        g.handle(GossiperMsg::Announce {
            item: item(b"t"),
            ttl: 3,
        });
        g.take_out();
        // threshold is 2 (degree 4): one positive round moves counter to
        // 2 which reaches the threshold.
        g.handle(GossiperMsg::IncomingPush(RumorUpdate {
            item: item(b"t"),
            state: RumorState::B,
            counter: 1,
        }));
        g.round();
        let info = g.active.get(&item(b"t")).unwrap();
        assert_eq!(info.state, RumorState::C);
        assert_eq!(info.counter, 0);
    }

    #[test]
    fn test_incoming_c_converts_immediately() {
        let mut g = gossiper();
        g.handle(GossiperMsg::Announce {
            item: item(b"c"),
            ttl: 3,
        });
        g.take_out();
        g.handle(GossiperMsg::IncomingPush(RumorUpdate {
            item: item(b"c"),
            state: RumorState::C,
            counter: 0,
        }));
        g.round();
        let info = g.active.get(&item(b"c")).unwrap();
        assert_eq!(info.state, RumorState::C);
        // The cooling counter already advanced once this round.
        assert_eq!(info.counter, 1);
    }

    #[test]
    fn test_c_retires_after_threshold_rounds() {
        let mut g = gossiper();
        g.handle(GossiperMsg::Announce {
            item: item(b"r"),
            ttl: 30,
        });
        g.take_out();
        g.handle(GossiperMsg::IncomingPush(RumorUpdate {
            item: item(b"r"),
            state: RumorState::C,
            counter: 0,
        }));
        // ttl is capped to max_ttl = 3; the C counter reaches the
        // threshold (2) after two rounds and the item retires on the
        // following push phase.
        g.round();
        g.round();
        assert!(g.active.contains_key(&item(b"r")));
        g.round();
        assert!(!g.active.contains_key(&item(b"r")));
        assert!(g.old.contains_key(&item(b"r")));
    }

    #[test]
    fn test_counter_at_threshold_rejected_on_ingress() {
        let mut g = gossiper();
        g.handle(GossiperMsg::IncomingPush(RumorUpdate {
            item: item(b"x"),
            state: RumorState::B,
            counter: 2, // == threshold
        }));
        assert!(g.incoming.is_empty());
    }

    #[test]
    fn test_more_advanced_replaces_in_batch() {
        let mut g = gossiper();
        g.handle(GossiperMsg::IncomingPush(RumorUpdate {
            item: item(b"x"),
            state: RumorState::B,
            counter: 0,
        }));
        g.handle(GossiperMsg::IncomingPush(RumorUpdate {
            item: item(b"x"),
            state: RumorState::B,
            counter: 1,
        }));
        assert_eq!(g.incoming[&item(b"x")], (RumorState::B, 1));
        // A less advanced update does not regress the entry.
        g.handle(GossiperMsg::IncomingPush(RumorUpdate {
            item: item(b"x"),
            state: RumorState::B,
            counter: 0,
        }));
        assert_eq!(g.incoming[&item(b"x")], (RumorState::B, 1));
    }

    #[test]
    fn test_network_item_admitted_and_notifies() {
        let mut g = gossiper();
        g.handle(GossiperMsg::Notify {
            client: client(1),
            data_type: 7,
        });
        g.handle(GossiperMsg::IncomingPush(RumorUpdate {
            item: item(b"n"),
            state: RumorState::B,
            counter: 1,
        }));
        g.round();

        assert!(g.active.contains_key(&item(b"n")));
        let out = g.take_out();
        assert!(out
            .iter()
            .any(|m| matches!(m, CentralMsg::GossipNotification { .. })));
        // New B item borrows degree * max_ttl peers.
        assert!(peer_requests(&out)
            .iter()
            .any(|(rel, num)| rel.as_ref() == Some(&item(b"n")) && *num == 4 * 3));
    }

    #[test]
    fn test_validation_invalid_quarantines_item() {
        let mut g = gossiper();
        g.handle(GossiperMsg::Notify {
            client: client(1),
            data_type: 7,
        });
        g.handle(GossiperMsg::Announce {
            item: item(b"bad"),
            ttl: 3,
        });
        g.handle(GossiperMsg::RandomPeerListReply {
            related: Some(item(b"bad")),
            peers: vec![peer(1), peer(2)],
        });
        g.take_out();

        g.handle(GossiperMsg::Validation {
            client: client(1),
            message_id: 0,
            valid: false,
        });

        assert!(!g.active.contains_key(&item(b"bad")));
        assert_eq!(g.old.get(&item(b"bad")), Some(&3));
        // The borrowed peers went back.
        assert_eq!(released(&g.take_out()), vec![peer(1), peer(2)]);

        // A re-announce in the following round is ignored.
        g.handle(GossiperMsg::Announce {
            item: item(b"bad"),
            ttl: 3,
        });
        assert!(!g.active.contains_key(&item(b"bad")));

        // And so is a network push.
        g.handle(GossiperMsg::IncomingPush(RumorUpdate {
            item: item(b"bad"),
            state: RumorState::B,
            counter: 1,
        }));
        g.round();
        assert!(!g.active.contains_key(&item(b"bad")));
    }

    #[test]
    fn test_validation_valid_only_clears_pending() {
        let mut g = gossiper();
        g.handle(GossiperMsg::Notify {
            client: client(1),
            data_type: 7,
        });
        g.handle(GossiperMsg::Announce {
            item: item(b"ok"),
            ttl: 3,
        });
        g.take_out();
        g.handle(GossiperMsg::Validation {
            client: client(1),
            message_id: 0,
            valid: true,
        });
        assert!(g.active.contains_key(&item(b"ok")));
        assert!(g.old.is_empty());
    }

    #[test]
    fn test_old_set_ages_out() {
        let mut g = gossiper();
        g.handle(GossiperMsg::Notify {
            client: client(1),
            data_type: 7,
        });
        g.handle(GossiperMsg::Announce {
            item: item(b"a"),
            ttl: 3,
        });
        g.handle(GossiperMsg::Validation {
            client: client(1),
            message_id: 0,
            valid: false,
        });
        assert!(g.old.contains_key(&item(b"a")));
        for _ in 0..3 {
            g.round();
        }
        assert!(!g.old.contains_key(&item(b"a")));
    }

    #[test]
    fn test_pull_request_served_from_active_cache() {
        let mut g = gossiper();
        g.handle(GossiperMsg::Announce {
            item: item(b"p"),
            ttl: 3,
        });
        g.take_out();
        g.handle(GossiperMsg::IncomingPullRequest { from: peer(9) });
        let out = g.take_out();
        match &out[0] {
            CentralMsg::GossipPullReply { to, items } => {
                assert_eq!(*to, peer(9));
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].item, item(b"p"));
            }
            other => panic!("expected pull reply, got {other:?}"),
        }
    }

    #[test]
    fn test_pull_cycle_swaps_and_releases() {
        let mut g = gossiper();
        g.handle(GossiperMsg::RandomPeerListReply {
            related: None,
            peers: vec![peer(1), peer(2)],
        });
        g.round();
        let out = g.take_out();
        let pulls: Vec<Peer> = out
            .iter()
            .filter_map(|m| match m {
                CentralMsg::GossipPullRequest(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(pulls, vec![peer(1), peer(2)]);
        // A fresh batch of `degree` peers was requested for next round.
        assert!(peer_requests(&out).contains(&(None, 4)));

        // Next round with a new batch: the old in-flight set is released.
        g.handle(GossiperMsg::RandomPeerListReply {
            related: None,
            peers: vec![peer(3)],
        });
        g.round();
        assert_eq!(released(&g.take_out()), vec![peer(1), peer(2)]);
    }

    #[test]
    fn test_reply_for_retired_item_released_immediately() {
        let mut g = gossiper();
        g.handle(GossiperMsg::Announce {
            item: item(b"gone"),
            ttl: 1,
        });
        g.take_out();
        g.round(); // retires the item (ttl 1 -> 0), peer list still empty
        g.take_out();
        g.handle(GossiperMsg::RandomPeerListReply {
            related: Some(item(b"gone")),
            peers: vec![peer(4)],
        });
        assert_eq!(released(&g.take_out()), vec![peer(4)]);
    }

    #[test]
    fn test_close_releases_all_borrows() {
        let mut g = gossiper();
        g.handle(GossiperMsg::Announce {
            item: item(b"a"),
            ttl: 3,
        });
        g.handle(GossiperMsg::RandomPeerListReply {
            related: Some(item(b"a")),
            peers: vec![peer(1)],
        });
        g.handle(GossiperMsg::RandomPeerListReply {
            related: None,
            peers: vec![peer(2)],
        });
        g.round(); // peer(2) moves into in-flight
        g.handle(GossiperMsg::RandomPeerListReply {
            related: None,
            peers: vec![peer(3)],
        });
        g.take_out();

        g.handle(GossiperMsg::Close);
        let mut rel = released(&g.take_out());
        rel.sort();
        assert_eq!(rel, vec![peer(1), peer(2), peer(3)]);
    }
}
