//! Matter's UDP message reliability timing (`spec.md` §4.6). Pure
//! calculations over session parameters; no I/O, no state.

use std::time::Duration;

pub const MAX_TRANSMISSIONS: u32 = 5;
pub const BACKOFF_BASE: f64 = 1.6;
pub const BACKOFF_JITTER: f64 = 0.25;
pub const BACKOFF_MARGIN: f64 = 1.1;
pub const BACKOFF_THRESHOLD: u32 = 1;
pub const STANDALONE_ACK_TIMEOUT: Duration = Duration::from_millis(200);
pub const DEFAULT_EXPECTED_PROCESSING_TIME: Duration = Duration::from_secs(2);
pub const ADDITIONAL_MRP_DELAY: Duration = Duration::from_millis(1_500);

/// Per-peer session timing parameters negotiated out-of-band (e.g. during
/// CASE pairing). Idle/active intervals bound the retransmission schedule;
/// the active threshold decides how long a peer is assumed to stay awake
/// after it was last seen active.
#[derive(Debug, Clone, Copy)]
pub struct SessionParameters {
    pub idle_interval: Duration,
    pub active_interval: Duration,
    pub active_threshold: Duration,
}

impl Default for SessionParameters {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(500),
            active_interval: Duration::from_millis(300),
            active_threshold: Duration::from_secs(4),
        }
    }
}

/// Whether the caller wants the worst-case (`max = true`, used to size
/// response-time budgets) or an actual jittered interval to sleep for
/// (`max = false`).
pub trait Rng: Send + Sync {
    fn uniform01(&self) -> f64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRng;

impl Rng for ThreadRng {
    fn uniform01(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// `retransmission-interval(n, params, peer-active, max)` (`spec.md` §4.6).
pub fn retransmission_interval(
    n: u32,
    params: &SessionParameters,
    peer_active: bool,
    max: bool,
    rng: &impl Rng,
) -> Duration {
    let peer_active = if n == 0 { false } else { peer_active };

    let mut base = if peer_active {
        params.active_interval
    } else {
        params.idle_interval
    };
    if !max {
        base += ADDITIONAL_MRP_DELAY;
    }

    let exponent = n.saturating_sub(BACKOFF_THRESHOLD) as i32;
    let r = if max { 1.0 } else { rng.uniform01() };

    let interval_ms = base.as_secs_f64()
        * 1000.0
        * BACKOFF_MARGIN
        * BACKOFF_BASE.powi(exponent)
        * (1.0 + r * BACKOFF_JITTER);

    Duration::from_millis(interval_ms.floor().max(0.0) as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Tcp,
    Ble,
    Udp,
}

#[derive(Debug, thiserror::Error)]
#[error("max-peer-response-time requires MRP for UDP channels")]
pub struct UdpRequiresMrp;

impl error_kind::Classify for UdpRequiresMrp {
    fn kind(&self) -> error_kind::ErrorKind {
        error_kind::ErrorKind::Implementation
    }
}

/// `max-peer-response-time(channel-type, params, peer-active, uses-mrp)`
/// (`spec.md` §4.6).
pub fn max_peer_response_time(
    channel_type: ChannelType,
    params: &SessionParameters,
    peer_active: bool,
    uses_mrp: bool,
    rng: &impl Rng,
) -> Result<Duration, UdpRequiresMrp> {
    match channel_type {
        ChannelType::Tcp | ChannelType::Ble => {
            Ok(Duration::from_secs(30) + Duration::from_secs(5))
        }
        ChannelType::Udp => {
            if !uses_mrp {
                return Err(UdpRequiresMrp);
            }

            let mut total = Duration::ZERO;
            let mut active = peer_active;
            for n in 0..MAX_TRANSMISSIONS {
                let outbound = retransmission_interval(n, params, active, true, rng);
                let inbound = retransmission_interval(n, params, active, true, rng);
                total += outbound + inbound;

                if peer_active && total > params.active_threshold {
                    active = false;
                }
            }

            total += DEFAULT_EXPECTED_PROCESSING_TIME;
            total += Duration::from_secs(5);
            Ok(total)
        }
    }
}
