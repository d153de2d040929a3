//! Membership controller -- maintains a view that resists adversarial
//! bias, using bounded push + pull rounds and min-wise-independent
//! history sampling.
//!
//! The state machine is synchronous like the gossiper's: handlers and
//! the round tick mutate state and append commands to an outbox. Puzzle
//! work (solving outgoing pushes, verifying incoming ones) never runs on
//! the loop; the run loop offloads it to blocking threads and the
//! results come back as messages.

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use murmur_crypto::{puzzle, PuzzleParams};
use murmur_protocol::{ProtocolParams, PushRequest};
use rand::seq::{IteratorRandom, SliceRandom};
use tokio::sync::mpsc;

use crate::bus::{CentralMsg, MembershipMsg, Peer};
use crate::sampler::PeerSampler;

fn now_utc() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub struct Membership {
    self_addr: Peer,
    bootstrapper: Option<Peer>,

    view: Vec<Peer>,
    view_cap: usize,
    alpha_size: usize,
    beta_size: usize,
    gamma_size: usize,

    /// Probability of actually sending each candidate push. Starts at 0
    /// and approaches 1, which keeps a fresh node quiet until it has
    /// bootstrapped.
    p_push: f64,

    samplers: Vec<PeerSampler>,

    /// Peers whose valid push requests arrived since the last round.
    push_requests: HashSet<Peer>,
    /// Peers contained in accepted pull replies since the last round.
    pull_replies: HashSet<Peer>,
    /// Peers with an outstanding pull; replies from anyone else are
    /// ignored.
    pending_pulls: HashSet<Peer>,
    /// Every peer seen this round via push or pull, fed to the samplers.
    round_seen: HashSet<Peer>,

    puzzle: PuzzleParams,
    validity: Duration,

    out: Vec<CentralMsg>,
    /// Outgoing push targets whose puzzles still need solving.
    push_jobs: Vec<Peer>,
    /// Incoming push requests whose puzzles still need verifying.
    verify_jobs: Vec<PushRequest>,
}

impl Membership {
    pub fn new(
        params: &ProtocolParams,
        self_addr: Peer,
        bootstrapper: Option<Peer>,
        puzzle: PuzzleParams,
    ) -> Self {
        let samplers = (0..params.sampler_budget())
            .map(|_| PeerSampler::new())
            .collect();
        Self {
            self_addr,
            bootstrapper,
            view: Vec::new(),
            view_cap: params.view_cap() as usize,
            alpha_size: params.alpha_size() as usize,
            beta_size: params.beta_size() as usize,
            gamma_size: params.gamma_size() as usize,
            p_push: 0.0,
            samplers,
            push_requests: HashSet::new(),
            pull_replies: HashSet::new(),
            pending_pulls: HashSet::new(),
            round_seen: HashSet::new(),
            puzzle,
            validity: Duration::from_secs(params.membership_round_secs),
            out: Vec::new(),
            push_jobs: Vec::new(),
            verify_jobs: Vec::new(),
        }
    }

    pub fn take_out(&mut self) -> Vec<CentralMsg> {
        std::mem::take(&mut self.out)
    }

    pub fn take_push_jobs(&mut self) -> Vec<Peer> {
        std::mem::take(&mut self.push_jobs)
    }

    pub fn take_verify_jobs(&mut self) -> Vec<PushRequest> {
        std::mem::take(&mut self.verify_jobs)
    }

    pub fn view(&self) -> &[Peer] {
        &self.view
    }

    /// Install the bootstrapper as the sole view member and run one
    /// immediate round.
    pub fn bootstrap(&mut self) {
        let Some(boot) = self.bootstrapper else {
            tracing::warn!("mem: no bootstrapper configured, waiting for inbound contact");
            return;
        };
        if !self.view.is_empty() {
            return;
        }
        tracing::info!(bootstrapper = %boot, "mem: bootstrapping");
        self.view.push(boot);
        self.out.push(CentralMsg::PeerAdd(boot));
        self.p_push = 0.0;
        self.round();
    }

    /// One membership round: push, pull, update, sample refresh, probes.
    pub fn round(&mut self) {
        self.push_phase();
        self.pull_phase();
        self.update_phase();
        self.sample_phase();
    }

    fn push_phase(&mut self) {
        let mut rng = rand::thread_rng();
        let candidates = self
            .view
            .iter()
            .copied()
            .choose_multiple(&mut rng, self.alpha_size.min(self.view.len()));
        for peer in candidates {
            if rand::random::<f64>() < self.p_push {
                self.push_jobs.push(peer);
            }
        }
        self.p_push = 1.0 - (1.0 - self.p_push) * 0.9;
    }

    fn pull_phase(&mut self) {
        let mut rng = rand::thread_rng();
        let targets = self
            .view
            .iter()
            .copied()
            .choose_multiple(&mut rng, self.beta_size.min(self.view.len()));
        self.pending_pulls = targets.iter().copied().collect();
        for peer in targets {
            self.out.push(CentralMsg::MembershipPullRequest(peer));
        }
    }

    fn update_phase(&mut self) {
        let mut rng = rand::thread_rng();

        // More distinct pushers than the push slice admits is the
        // signature of adversarial amplification: discard them all.
        let pushers: Vec<Peer> = if self.push_requests.len() > self.alpha_size {
            tracing::warn!(
                pushers = self.push_requests.len(),
                cap = self.alpha_size,
                "mem: push set over cap, discarding the interval"
            );
            Vec::new()
        } else {
            self.push_requests.iter().copied().collect()
        };

        let pullers = self
            .pull_replies
            .iter()
            .copied()
            .choose_multiple(&mut rng, self.beta_size);

        let mut sampled: Vec<Peer> = self
            .samplers
            .iter()
            .filter_map(|s| s.sample())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        sampled.shuffle(&mut rng);

        let mut new_view: Vec<Peer> = Vec::with_capacity(self.view_cap);
        let mut seen = HashSet::new();
        for peer in pushers
            .into_iter()
            .chain(pullers)
            .chain(sampled.into_iter().take(self.gamma_size))
        {
            if peer != self.self_addr && seen.insert(peer) {
                new_view.push(peer);
                if new_view.len() >= self.view_cap {
                    break;
                }
            }
        }

        // An empty union would drop the only links a sparse node has;
        // keep the current view until the network offers replacements.
        if !new_view.is_empty() {
            for peer in &self.view {
                if !seen.contains(peer) {
                    self.out.push(CentralMsg::PeerRemove(*peer));
                }
            }
            let old: HashSet<Peer> = self.view.iter().copied().collect();
            for peer in &new_view {
                if !old.contains(peer) {
                    self.out.push(CentralMsg::PeerAdd(*peer));
                }
            }
            self.view = new_view;
        }

        self.push_requests.clear();
        self.pull_replies.clear();
    }

    fn sample_phase(&mut self) {
        let seen: Vec<Peer> = self.round_seen.drain().collect();
        for peer in seen {
            for sampler in &mut self.samplers {
                sampler.next(peer);
            }
        }

        let sampled: HashSet<Peer> = self.samplers.iter().filter_map(|s| s.sample()).collect();
        for peer in sampled {
            self.out.push(CentralMsg::ProbePeerRequest(peer));
        }
    }

    pub fn handle(&mut self, msg: MembershipMsg) {
        match msg {
            MembershipMsg::ProbePeerReply { probed, reachable } => {
                if !reachable {
                    let mut evicted = 0u32;
                    for sampler in &mut self.samplers {
                        if sampler.sample() == Some(probed) {
                            sampler.reset();
                            evicted += 1;
                        }
                    }
                    if evicted > 0 {
                        tracing::debug!(peer = %probed, evicted, "mem: unreachable sample evicted");
                    }
                }
            }
            MembershipMsg::PeerDisconnected(peer) => {
                self.view.retain(|p| *p != peer);
            }
            MembershipMsg::IncomingPushRequest(request) => self.on_push_request(request),
            MembershipMsg::PushRequestVerified(peer) => {
                self.push_requests.insert(peer);
                self.round_seen.insert(peer);
            }
            MembershipMsg::IncomingPullRequest { from } => {
                self.out.push(CentralMsg::MembershipPullReply {
                    to: from,
                    view: self.view.clone(),
                });
            }
            MembershipMsg::IncomingPullReply { from, view } => {
                if !self.pending_pulls.remove(&from) {
                    tracing::debug!(from = %from, "mem: unsolicited pull reply dropped");
                    return;
                }
                for peer in view.into_iter().take(self.view_cap) {
                    if peer != self.self_addr {
                        self.pull_replies.insert(peer);
                        self.round_seen.insert(peer);
                    }
                }
            }
            MembershipMsg::Close => {}
        }
    }

    /// Admission checks that need no hashing; the puzzle itself is
    /// verified off-loop.
    fn on_push_request(&mut self, request: PushRequest) {
        let Some(to) = Peer::parse(&request.to) else {
            return;
        };
        if to != self.self_addr {
            tracing::debug!(to = %request.to, "mem: push request addressed elsewhere");
            return;
        }
        let Some(from) = Peer::parse(&request.from) else {
            return;
        };
        if from == self.self_addr {
            return;
        }
        let age = (now_utc() - request.time_utc).unsigned_abs();
        if age > self.validity.as_secs() {
            tracing::debug!(from = %request.from, age, "mem: stale push request");
            return;
        }
        self.verify_jobs.push(request);
    }
}

/// Build a signed-and-solved push request for the given target.
/// Blocking (scrypt); run on a blocking thread.
pub fn solve_push_request(
    puzzle_params: &PuzzleParams,
    from: Peer,
    to: Peer,
) -> Result<PushRequest, murmur_crypto::CryptoError> {
    let time_utc = now_utc();
    let (from_s, to_s) = (from.to_string(), to.to_string());
    let nonce = puzzle::solve_u64(puzzle_params, |nonce| {
        PushRequest {
            from: from_s.clone(),
            to: to_s.clone(),
            time_utc,
            nonce,
        }
        .puzzle_input()
    })?;
    Ok(PushRequest {
        from: from.to_string(),
        to: to.to_string(),
        time_utc,
        nonce,
    })
}

/// Run the membership loop until `Close` arrives or the input channel
/// drops. Panics are caught and reported as a crash.
pub async fn run(
    mut membership: Membership,
    mut rx: mpsc::Receiver<MembershipMsg>,
    self_tx: mpsc::Sender<MembershipMsg>,
    central_tx: mpsc::Sender<CentralMsg>,
    round_period: std::time::Duration,
) {
    use futures::FutureExt;

    let crash_tx = central_tx.clone();
    let fut = async move {
        membership.bootstrap();
        flush(&mut membership, &self_tx, &central_tx).await;

        let mut ticker = tokio::time::interval(round_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.reset(); // the bootstrap round already ran
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    membership.round();
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if matches!(msg, MembershipMsg::Close) {
                        break;
                    }
                    membership.handle(msg);
                }
            }
            flush(&mut membership, &self_tx, &central_tx).await;
        }
    };

    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(()) => {
            tracing::info!("mem: closed");
            let _ = crash_tx.send(CentralMsg::MembershipClosed).await;
        }
        Err(panic) => {
            let detail = crate::panic_detail(panic);
            tracing::error!(error = %detail, "mem: crashed");
            let _ = crash_tx.send(CentralMsg::MembershipCrashed(detail)).await;
        }
    }
}

/// Drain the outbox and offload puzzle work.
async fn flush(
    membership: &mut Membership,
    self_tx: &mpsc::Sender<MembershipMsg>,
    central_tx: &mpsc::Sender<CentralMsg>,
) {
    let puzzle_params = membership.puzzle;
    let self_addr = membership.self_addr;

    for target in membership.take_push_jobs() {
        let central_tx = central_tx.clone();
        tokio::spawn(async move {
            let solved = tokio::task::spawn_blocking(move || {
                solve_push_request(&puzzle_params, self_addr, target)
            })
            .await;
            match solved {
                Ok(Ok(request)) => {
                    let _ = central_tx
                        .send(CentralMsg::MembershipPushRequest(request))
                        .await;
                }
                Ok(Err(e)) => tracing::warn!(to = %target, "mem: push puzzle failed: {e}"),
                Err(e) => tracing::warn!(to = %target, "mem: push solver task failed: {e}"),
            }
        });
    }

    for request in membership.take_verify_jobs() {
        let self_tx = self_tx.clone();
        tokio::spawn(async move {
            let input = request.puzzle_input();
            let nonce = request.nonce;
            let ok = tokio::task::spawn_blocking(move || {
                puzzle::verify_u64(&puzzle_params, &input, nonce)
            })
            .await;
            match ok {
                Ok(Ok(true)) => {
                    if let Some(from) = Peer::parse(&request.from) {
                        let _ = self_tx.send(MembershipMsg::PushRequestVerified(from)).await;
                    }
                }
                Ok(Ok(false)) => {
                    tracing::debug!(from = %request.from, "mem: push puzzle under-worked, dropped")
                }
                Ok(Err(e)) => tracing::warn!("mem: push verification failed: {e}"),
                Err(e) => tracing::warn!("mem: push verifier task failed: {e}"),
            }
        });
    }

    for msg in membership.take_out() {
        if central_tx.send(msg).await.is_err() {
            return;
        }
    }
}
