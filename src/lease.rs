//! The client-side lease: the single persistent entity of the DHCP client.
//!
//! A lease is created at engine construction (restored from the lease file
//! when one is configured, fresh otherwise), mutated only by the engine
//! worker, and observed by embedders through snapshots.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use ini::Ini;
use tracing::warn;

use crate::packet::DhcpPacket;

/// Floor for next-attempt pacing once T1/T2 have already passed.
const RETRY_FLOOR: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    InitReboot,
    Rebooting,
    Init,
    Selecting,
    Requesting,
    Bound,
    Renewing,
    Rebinding,
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitReboot => "INIT_REBOOT",
            Self::Rebooting => "REBOOTING",
            Self::Init => "INIT",
            Self::Selecting => "SELECTING",
            Self::Requesting => "REQUESTING",
            Self::Bound => "BOUND",
            Self::Renewing => "RENEWING",
            Self::Rebinding => "REBINDING",
        }
    }

    /// Lease-file state names map back onto states; anything unrecognized
    /// falls back to INIT.
    pub fn parse(value: &str) -> Self {
        match value {
            "INIT_REBOOT" => Self::InitReboot,
            "REBOOTING" => Self::Rebooting,
            "SELECTING" => Self::Selecting,
            "REQUESTING" => Self::Requesting,
            "BOUND" => Self::Bound,
            "RENEWING" => Self::Renewing,
            "REBINDING" => Self::Rebinding,
            _ => Self::Init,
        }
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Lease {
    pub state: LeaseState,
    pub ip_addr: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub server_identifier: Option<Ipv4Addr>,

    /// Instant the REQUEST preceding the current ACK was sent; anchor for
    /// every timer computation below.
    pub lease_init_time: DateTime<Utc>,
    pub lease_duration: Duration,
    pub t1: Duration,
    pub t2: Duration,

    /// The last ACK, retained so embedders can inspect options the lease
    /// model does not surface (routers, MTU, vendor data).
    pub ack: Option<DhcpPacket>,
}

impl Default for Lease {
    fn default() -> Self {
        Self::new()
    }
}

impl Lease {
    pub fn new() -> Self {
        Self {
            state: LeaseState::Init,
            ip_addr: None,
            dns: None,
            subnet_mask: None,
            server_identifier: None,
            lease_init_time: DateTime::<Utc>::UNIX_EPOCH,
            lease_duration: Duration::ZERO,
            t1: Duration::ZERO,
            t2: Duration::ZERO,
            ack: None,
        }
    }

    /// Restores a lease from the INI lease file. An absent or unreadable
    /// file yields a fresh INIT lease.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let conf = match Ini::load_from_file(path.as_ref()) {
            Ok(conf) => conf,
            Err(error) => {
                warn!(
                    "Could not read lease file {}: {}; starting fresh",
                    path.as_ref().display(),
                    error
                );
                return Self::new();
            }
        };

        let general = conf.section(None::<String>);
        let timers = conf.section(Some("timers"));

        let mut lease = Self::new();
        if let Some(general) = general {
            lease.state = general
                .get("state")
                .map_or(LeaseState::Init, LeaseState::parse);
            lease.ip_addr = general.get("ip").and_then(|value| value.parse().ok());
            lease.dns = general.get("dns").and_then(|value| value.parse().ok());
            lease.subnet_mask = general.get("subnet.mask").and_then(parse_hex_mask);
            lease.server_identifier = general.get("server.ip").and_then(|value| value.parse().ok());
        }

        if let Some(timers) = timers {
            lease.lease_init_time = timers
                .get("lease.start")
                .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
                .map_or(DateTime::<Utc>::UNIX_EPOCH, |moment| {
                    moment.with_timezone(&Utc)
                });
            lease.lease_duration = parse_secs(timers.get("lease.duration"));
            lease.t1 = parse_secs(timers.get("T1"));
            lease.t2 = parse_secs(timers.get("T2"));
        }

        lease
    }

    /// Clears everything acquired from a server and installs the
    /// link-local fallback address.
    pub fn reset(&mut self, apipa: Ipv4Addr) {
        self.state = LeaseState::Init;
        self.ip_addr = Some(apipa);
        self.dns = None;
        self.subnet_mask = None;
        self.server_identifier = None;
        self.lease_init_time = DateTime::<Utc>::UNIX_EPOCH;
        self.lease_duration = Duration::ZERO;
        self.t1 = Duration::ZERO;
        self.t2 = Duration::ZERO;
        self.ack = None;
    }

    pub fn renew_moment(&self) -> DateTime<Utc> {
        self.lease_init_time + to_delta(self.t1)
    }

    pub fn rebind_moment(&self) -> DateTime<Utc> {
        self.lease_init_time + to_delta(self.t2)
    }

    pub fn expiration_moment(&self) -> DateTime<Utc> {
        self.lease_init_time + to_delta(self.lease_duration)
    }

    /// True once T2 has passed: unicast renewal is no longer worth trying.
    pub fn is_renew_period_expired(&self) -> bool {
        Utc::now() > self.rebind_moment()
    }

    /// True once the lease has fully run out.
    pub fn is_rebind_period_expired(&self) -> bool {
        Utc::now() > self.expiration_moment()
    }

    /// Time until the next renew attempt, floored at 60 seconds when T1 is
    /// already behind us.
    pub fn duration_until_renew(&self) -> Duration {
        duration_until(self.renew_moment())
    }

    /// Time until the next rebind attempt, floored at 60 seconds when T2
    /// is already behind us.
    pub fn duration_until_rebind(&self) -> Duration {
        duration_until(self.rebind_moment())
    }
}

impl std::fmt::Display for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn opt(addr: Option<Ipv4Addr>) -> String {
            addr.map_or_else(|| "-".to_string(), |addr| addr.to_string())
        }

        write!(
            f,
            "{} ip={} mask={} dns={} server={} duration={}s t1={}s t2={}s",
            self.state,
            opt(self.ip_addr),
            opt(self.subnet_mask),
            opt(self.dns),
            opt(self.server_identifier),
            self.lease_duration.as_secs(),
            self.t1.as_secs(),
            self.t2.as_secs(),
        )
    }
}

/// Default T1 when the ACK omits option 58.
pub fn default_t1(lease_duration: Duration) -> Duration {
    lease_duration / 2
}

/// Default T2 when the ACK omits option 59.
pub fn default_t2(lease_duration: Duration) -> Duration {
    lease_duration.mul_f64(0.875)
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

fn duration_until(moment: DateTime<Utc>) -> Duration {
    (moment - Utc::now()).to_std().unwrap_or(RETRY_FLOOR)
}

fn parse_secs(value: Option<&str>) -> Duration {
    value
        .and_then(|value| value.parse::<u64>().ok())
        .map_or(Duration::ZERO, Duration::from_secs)
}

/// The lease file stores the subnet mask as eight hex digits.
fn parse_hex_mask(value: &str) -> Option<Ipv4Addr> {
    if value.len() != 8 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let bits = u32::from_str_radix(value, 16).ok()?;
    Some(Ipv4Addr::from(bits))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestGuard(String);
    impl Drop for TestGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn bound_lease(t1: u64, t2: u64, duration: u64) -> Lease {
        let mut lease = Lease::new();
        lease.state = LeaseState::Bound;
        lease.ip_addr = Some(Ipv4Addr::new(192, 168, 1, 100));
        lease.server_identifier = Some(Ipv4Addr::new(192, 168, 1, 1));
        lease.lease_init_time = Utc::now();
        lease.lease_duration = Duration::from_secs(duration);
        lease.t1 = Duration::from_secs(t1);
        lease.t2 = Duration::from_secs(t2);
        lease
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            LeaseState::InitReboot,
            LeaseState::Rebooting,
            LeaseState::Init,
            LeaseState::Selecting,
            LeaseState::Requesting,
            LeaseState::Bound,
            LeaseState::Renewing,
            LeaseState::Rebinding,
        ] {
            assert_eq!(LeaseState::parse(state.as_str()), state);
        }
        assert_eq!(LeaseState::parse("garbage"), LeaseState::Init);
    }

    #[test]
    fn test_moments_ordering() {
        let lease = bound_lease(100, 175, 200);
        assert!(lease.renew_moment() < lease.rebind_moment());
        assert!(lease.rebind_moment() < lease.expiration_moment());
        assert!(!lease.is_renew_period_expired());
        assert!(!lease.is_rebind_period_expired());
    }

    #[test]
    fn test_duration_until_renew_before_t1() {
        let lease = bound_lease(100, 175, 200);
        let until = lease.duration_until_renew();
        assert!(until > Duration::from_secs(95) && until <= Duration::from_secs(100));
    }

    #[test]
    fn test_duration_floors_after_boundary() {
        let mut lease = bound_lease(100, 175, 200);
        lease.lease_init_time = Utc::now() - TimeDelta::seconds(500);
        assert_eq!(lease.duration_until_renew(), Duration::from_secs(60));
        assert_eq!(lease.duration_until_rebind(), Duration::from_secs(60));
        assert!(lease.is_renew_period_expired());
        assert!(lease.is_rebind_period_expired());
    }

    #[test]
    fn test_reset_installs_apipa_and_clears_timers() {
        let mut lease = bound_lease(100, 175, 200);
        lease.dns = Some(Ipv4Addr::new(8, 8, 8, 8));
        lease.reset(Ipv4Addr::new(169, 254, 10, 20));

        assert_eq!(lease.state, LeaseState::Init);
        assert_eq!(lease.ip_addr, Some(Ipv4Addr::new(169, 254, 10, 20)));
        assert_eq!(lease.dns, None);
        assert_eq!(lease.server_identifier, None);
        assert_eq!(lease.lease_duration, Duration::ZERO);
        assert_eq!(lease.t1, Duration::ZERO);
        assert_eq!(lease.t2, Duration::ZERO);
    }

    #[test]
    fn test_default_timer_values() {
        let duration = Duration::from_secs(200);
        assert_eq!(default_t1(duration), Duration::from_secs(100));
        assert_eq!(default_t2(duration), Duration::from_secs(175));
    }

    #[test]
    fn test_load_missing_file_yields_fresh_lease() {
        let lease = Lease::load("does_not_exist.lease");
        assert_eq!(lease.state, LeaseState::Init);
        assert_eq!(lease.ip_addr, None);
    }

    #[test]
    fn test_load_lease_file() {
        let path = "test_lease_load.ini".to_string();
        let _guard = TestGuard(path.clone());

        let start = Utc::now().to_rfc3339();
        std::fs::write(
            &path,
            format!(
                "state=BOUND\nip=192.168.1.50\ndns=8.8.8.8\nsubnet.mask=ffffff00\n\
                 server.ip=192.168.1.1\n\n[timers]\nlease.start={}\n\
                 lease.duration=200\nT1=100\nT2=175\n",
                start
            ),
        )
        .unwrap();

        let lease = Lease::load(&path);
        assert_eq!(lease.state, LeaseState::Bound);
        assert_eq!(lease.ip_addr, Some(Ipv4Addr::new(192, 168, 1, 50)));
        assert_eq!(lease.dns, Some(Ipv4Addr::new(8, 8, 8, 8)));
        assert_eq!(lease.subnet_mask, Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(lease.server_identifier, Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(lease.lease_duration, Duration::from_secs(200));
        assert_eq!(lease.t1, Duration::from_secs(100));
        assert_eq!(lease.t2, Duration::from_secs(175));
    }

    #[test]
    fn test_load_corrupt_file_yields_fresh_lease() {
        let path = "test_lease_corrupt.ini".to_string();
        let _guard = TestGuard(path.clone());
        std::fs::write(&path, "state=BOUND\nip=not-an-address\nsubnet.mask=zz\n").unwrap();

        let lease = Lease::load(&path);
        assert_eq!(lease.state, LeaseState::Bound);
        assert_eq!(lease.ip_addr, None);
        assert_eq!(lease.subnet_mask, None);
    }
}
