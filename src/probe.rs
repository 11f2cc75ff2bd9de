//! Link-layer uniqueness probing, kept behind a trait: the engine only
//! needs a yes/no answer for "is this address already claimed on the
//! segment". Production embedders back this with ARP; the crate ships a
//! pass-through implementation.

use std::net::Ipv4Addr;

use rand::Rng;
use tracing::warn;

pub trait LinkProbe: Send + Sync {
    /// True iff another host on the local segment answers for `ip` within
    /// the probe's bounded window.
    fn is_address_in_use(&self, ip: Ipv4Addr) -> bool;
}

/// Probe that never reports a conflict. Suitable for tests and for
/// embedders that accept the (small) collision risk without ARP.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverInUse;

impl LinkProbe for NeverInUse {
    fn is_address_in_use(&self, _ip: Ipv4Addr) -> bool {
        false
    }
}

pub fn is_apipa(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 169 && octets[1] == 254
}

/// Random RFC 3927 candidate: 169.254.x.y with x in [1,254], y in [1,253].
pub fn generate_candidate_apipa() -> Ipv4Addr {
    let mut rng = rand::thread_rng();
    Ipv4Addr::new(169, 254, rng.gen_range(1..=254), rng.gen_range(1..=253))
}

/// Picks an APIPA address the probe does not see in use. Bounded so a
/// probe stuck answering "in use" cannot spin forever.
pub fn choose_apipa(probe: &dyn LinkProbe) -> Ipv4Addr {
    const MAX_ATTEMPTS: usize = 64;

    let mut candidate = generate_candidate_apipa();
    for _ in 0..MAX_ATTEMPTS {
        if !probe.is_address_in_use(candidate) {
            return candidate;
        }
        candidate = generate_candidate_apipa();
    }

    warn!(
        "no conflict-free link-local address after {} probes, keeping {}",
        MAX_ATTEMPTS, candidate
    );
    candidate
}
