//! Random candidate generation over the publicly routable IPv4 space.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::types::Candidate;

/// IANA special-purpose blocks that are never sampled.
pub const RESERVED_NETWORKS: [Ipv4Net; 15] = [
    Ipv4Net::new_assert(Ipv4Addr::new(0, 0, 0, 0), 8),
    Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 0), 8),
    Ipv4Net::new_assert(Ipv4Addr::new(100, 64, 0, 0), 10),
    Ipv4Net::new_assert(Ipv4Addr::new(127, 0, 0, 0), 8),
    Ipv4Net::new_assert(Ipv4Addr::new(169, 254, 0, 0), 16),
    Ipv4Net::new_assert(Ipv4Addr::new(172, 16, 0, 0), 12),
    Ipv4Net::new_assert(Ipv4Addr::new(192, 0, 0, 0), 24),
    Ipv4Net::new_assert(Ipv4Addr::new(192, 0, 2, 0), 24),
    Ipv4Net::new_assert(Ipv4Addr::new(192, 88, 99, 0), 24),
    Ipv4Net::new_assert(Ipv4Addr::new(192, 168, 0, 0), 16),
    Ipv4Net::new_assert(Ipv4Addr::new(198, 18, 0, 0), 15),
    Ipv4Net::new_assert(Ipv4Addr::new(198, 51, 100, 0), 24),
    Ipv4Net::new_assert(Ipv4Addr::new(203, 0, 113, 0), 24),
    Ipv4Net::new_assert(Ipv4Addr::new(224, 0, 0, 0), 4),
    // Class E, including the limited broadcast address.
    Ipv4Net::new_assert(Ipv4Addr::new(240, 0, 0, 0), 4),
];

/// Consecutive rejected draws after which the sampler assumes nothing is left to draw.
const MAX_REDRAWS: u32 = 10_000;

pub fn is_reserved(ip: Ipv4Addr) -> bool {
    RESERVED_NETWORKS.iter().any(|net| net.contains(&ip))
}

/// Decides whether an address may be probed: not reserved and not user-excluded.
#[derive(Debug, Clone, Default)]
pub struct AddressFilter {
    excluded: Vec<Ipv4Net>,
}

impl AddressFilter {
    pub fn new(excluded: impl IntoIterator<Item = Ipv4Net>) -> Self {
        Self {
            excluded: excluded.into_iter().map(|n| n.trunc()).collect(),
        }
    }

    pub fn allows(&self, ip: Ipv4Addr) -> bool {
        !is_reserved(ip) && !self.excluded.iter().any(|net| net.contains(&ip))
    }
}

/// Lazy stream of uniformly random candidates on a fixed port.
///
/// Rejected draws are retried; no history is kept, so an address may recur.
#[derive(Debug)]
pub struct AddressSampler<R = StdRng> {
    rng: R,
    port: u16,
    filter: AddressFilter,
    rejected: u64,
}

impl AddressSampler<StdRng> {
    pub fn new(port: u16, filter: AddressFilter) -> Self {
        Self::with_rng(StdRng::from_os_rng(), port, filter)
    }

    pub fn seeded(seed: u64, port: u16, filter: AddressFilter) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), port, filter)
    }
}

impl<R: Rng> AddressSampler<R> {
    pub fn with_rng(rng: R, port: u16, filter: AddressFilter) -> Self {
        Self {
            rng,
            port,
            filter,
            rejected: 0,
        }
    }

    /// Draws that were thrown away because they hit a filtered range.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Draw the next allowed address, or `None` when `MAX_REDRAWS` draws in a row were rejected.
    pub fn draw(&mut self) -> Option<Ipv4Addr> {
        for _ in 0..MAX_REDRAWS {
            let ip = Ipv4Addr::from(self.rng.random::<u32>());
            if self.filter.allows(ip) {
                return Some(ip);
            }
            self.rejected += 1;
        }
        warn!(
            redraws = MAX_REDRAWS,
            "address sampler rejected every draw; exclusions cover (nearly) all of IPv4"
        );
        None
    }
}

impl<R: Rng> Iterator for AddressSampler<R> {
    type Item = Candidate;

    fn next(&mut self) -> Option<Candidate> {
        self.draw().map(|ip| Candidate::new(ip, self.port))
    }
}
