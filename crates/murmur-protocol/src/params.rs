//! Protocol parameters -- the single versioned set of constants every
//! peer on the network must agree on.
//!
//! Pool and cache sizes that are node-local (cache_size, degree) come
//! from the config file; everything here is network-critical and is
//! therefore embedded in the source instead.

/// A protocol parameter set: timing, sizing and admission-puzzle
/// constants shared by the whole network.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtocolParams {
    /// Maximum number of peers expected in the network. Drives the view
    /// cap (n^0.25) and the sampler budget (n^0.5).
    pub max_peers: f64,
    /// View share refilled from accepted push requests.
    pub alpha: f64,
    /// View share refilled from pull replies.
    pub beta: f64,

    // -- Round timing --
    /// Seconds between membership rounds.
    pub membership_round_secs: u64,
    /// Milliseconds between gossip rounds.
    pub gossip_round_millis: u64,

    // -- Connection timing --
    /// Dial and probe timeout in seconds.
    pub connection_timeout_secs: u64,
    /// Graceful-closure watchdog in seconds.
    pub closure_timeout_secs: u64,
    /// Reader poll deadline in milliseconds (cancel-check granularity).
    pub closure_check_millis: u64,
    /// Handshake deadline in seconds (covers dial + puzzle + exchange).
    pub handshake_timeout_secs: u64,

    // -- Queues --
    /// Inbound queue bound (controller input channels).
    pub in_queue_size: usize,
    /// Outbound queue bound (endpoint writer channels).
    pub out_queue_size: usize,

    // -- Admission puzzle (shared by handshake and membership push) --
    /// scrypt cost exponent: N = 2^scrypt_log_n.
    pub scrypt_log_n: u8,
    /// scrypt block size parameter.
    pub scrypt_r: u32,
    /// scrypt parallelism parameter.
    pub scrypt_p: u32,
    /// scrypt output length in bytes.
    pub scrypt_dk_len: usize,
    /// Handshake nonce length in bytes.
    pub handshake_nonce_len: usize,
    /// Expected puzzle work: threshold = (2^(8*dk_len) - 1) / repetition.
    pub puzzle_repetition: u64,
    /// Seconds a handshake record stays fresh.
    pub handshake_validity_secs: u64,

    // -- Framing --
    /// Per-connection frame budget multiplier: max bytes = this * cache_size.
    pub frame_budget_per_cache_slot: usize,
}

impl ProtocolParams {
    /// View capacity V = max(1, floor(max_peers^0.25)).
    pub fn view_cap(&self) -> u16 {
        self.max_peers.powf(0.25).floor().max(1.0) as u16
    }

    /// Total sampler budget S = floor(max_peers / V^2).
    pub fn sampler_budget(&self) -> u32 {
        let v = self.view_cap() as f64;
        (self.max_peers / (v * v)).floor() as u32
    }

    /// Push slice of the view, floor(alpha * V).
    pub fn alpha_size(&self) -> u16 {
        (self.alpha * self.view_cap() as f64).floor() as u16
    }

    /// Pull slice of the view, floor(beta * V).
    pub fn beta_size(&self) -> u16 {
        (self.beta * self.view_cap() as f64).floor() as u16
    }

    /// History-sample slice of the view, the remainder.
    pub fn gamma_size(&self) -> u16 {
        self.view_cap() - self.alpha_size() - self.beta_size()
    }

    /// Counter threshold b_max = c_max for the median-counter states,
    /// ceil(log_d(log_d(max_peers))) for d = max(2, degree), at least 1.
    pub fn counter_threshold(&self, degree: u8) -> u8 {
        let d = (degree as f64).max(2.0);
        let hops = self.max_peers.ln() / d.ln();
        (hops.ln() / d.ln()).ceil().max(1.0) as u8
    }

    /// Automatic max TTL, ceil(log_d(max_peers)) for d = max(2, degree).
    pub fn auto_max_ttl(&self, degree: u8) -> u8 {
        let d = (degree as f64).max(2.0);
        (self.max_peers.log2() / d.log2()).ceil() as u8
    }

    /// Maximum frame budget for a connection with the given cache size.
    pub fn max_frame_bytes(&self, cache_size: u16) -> usize {
        self.frame_budget_per_cache_slot * cache_size as usize
    }
}

/// The active parameter set.
pub const PARAMS: ProtocolParams = ProtocolParams {
    max_peers: 1e8,
    alpha: 0.45,
    beta: 0.45,

    membership_round_secs: 6,
    gossip_round_millis: 2000,

    connection_timeout_secs: 2,
    closure_timeout_secs: 6,
    closure_check_millis: 500,
    handshake_timeout_secs: 30,

    in_queue_size: 1024,
    out_queue_size: 64,

    scrypt_log_n: 14, // 2^14 = 16384
    scrypt_r: 8,
    scrypt_p: 1,
    scrypt_dk_len: 128,
    handshake_nonce_len: 64,
    puzzle_repetition: 200,
    handshake_validity_secs: 30,

    frame_budget_per_cache_slot: 65580,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_cap_is_fourth_root() {
        // 1e8^0.25 = 100
        assert_eq!(PARAMS.view_cap(), 100);
    }

    #[test]
    fn test_sampler_budget() {
        // 1e8 / 100^2 = 10_000
        assert_eq!(PARAMS.sampler_budget(), 10_000);
    }

    #[test]
    fn test_view_slices_sum_to_cap() {
        let v = PARAMS.view_cap();
        assert_eq!(
            PARAMS.alpha_size() + PARAMS.beta_size() + PARAMS.gamma_size(),
            v
        );
        assert!(PARAMS.alpha_size() > 0);
        assert!(PARAMS.beta_size() > 0);
    }

    #[test]
    fn test_counter_threshold_degree_4() {
        // log_4(1e8) ~ 13.3, log_4(13.3) ~ 1.87 -> 2
        assert_eq!(PARAMS.counter_threshold(4), 2);
    }

    #[test]
    fn test_counter_threshold_never_zero() {
        for degree in 1..=10 {
            assert!(PARAMS.counter_threshold(degree) >= 1);
        }
    }

    #[test]
    fn test_auto_max_ttl_degree_4() {
        // log_4(1e8) ~ 13.3 -> 14
        assert_eq!(PARAMS.auto_max_ttl(4), 14);
    }

    #[test]
    fn test_degree_one_clamps_to_two() {
        assert_eq!(PARAMS.auto_max_ttl(1), PARAMS.auto_max_ttl(2));
        assert_eq!(PARAMS.counter_threshold(1), PARAMS.counter_threshold(2));
    }

    #[test]
    fn test_timing_invariants() {
        // The reader poll deadline must be well under the closure watchdog
        // so a closing endpoint gets several cancel checks in.
        assert!(PARAMS.closure_check_millis * 4 <= PARAMS.closure_timeout_secs * 1000);
        // A handshake must be able to finish within its validity window.
        assert!(PARAMS.handshake_timeout_secs <= PARAMS.handshake_validity_secs);
    }

    #[test]
    fn test_frame_budget() {
        assert_eq!(PARAMS.max_frame_bytes(50), 65580 * 50);
    }
}
