//! The RFC 2131 client automaton. A single worker task owns the socket
//! and the timers, drives every transition, and invokes listeners inline;
//! embedders observe the lease through snapshots.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::factory::{PacketFactory, TxId};
use crate::lease::{Lease, LeaseState, default_t1, default_t2};
use crate::options::MessageType;
use crate::packet::DhcpPacket;
use crate::probe::{self, LinkProbe, NeverInUse};
use crate::timer::{PhaseTimer, WaitOutcome, wait_for_shutdown, wait_for_timer};
use crate::transport::UdpTransport;

pub type LeaseListener = Box<dyn Fn(&Lease) + Send + Sync>;

/// How long each REQUEST waits for its ACK or NAK.
const ACK_WAIT: Duration = Duration::from_secs(1);

/// REQUEST retries beyond the initial attempt while an offer goes
/// unacknowledged.
const REQUEST_RETRIES: usize = 2;

/// An embeddable DHCPv4 client. Register listeners, then `start`; the
/// engine runs until `stop`.
pub struct DhcpClient {
    config: ClientConfig,
    lease: Arc<Mutex<Lease>>,
    probe: Arc<dyn LinkProbe>,
    lease_received: Vec<LeaseListener>,
    lease_renewed: Vec<LeaseListener>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    stopped: Arc<AtomicBool>,
    hardware_addr: Option<Vec<u8>>,
    worker: Option<JoinHandle<()>>,
}

impl DhcpClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let lease = match &config.lease_file {
            Some(path) => Lease::load(path),
            None => Lease::new(),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            lease: Arc::new(Mutex::new(lease)),
            probe: Arc::new(NeverInUse),
            lease_received: Vec::new(),
            lease_renewed: Vec::new(),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            stopped: Arc::new(AtomicBool::new(false)),
            hardware_addr: None,
            worker: None,
        })
    }

    /// Replaces the restored lease, e.g. with one the embedder persisted
    /// itself.
    pub fn with_initial_lease(self, lease: Lease) -> Self {
        *lock_ignoring_poison(&self.lease) = lease;
        self
    }

    /// Installs the link-layer uniqueness probe consulted before binding
    /// an offered address. Defaults to a probe that never reports
    /// conflicts.
    pub fn with_probe(mut self, probe: Arc<dyn LinkProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Listeners must be registered before `start`; the registry is
    /// frozen when the worker launches.
    pub fn add_lease_received_listener<F>(&mut self, listener: F)
    where
        F: Fn(&Lease) + Send + Sync + 'static,
    {
        self.lease_received.push(Box::new(listener));
    }

    pub fn add_lease_renewed_listener<F>(&mut self, listener: F)
    where
        F: Fn(&Lease) + Send + Sync + 'static,
    {
        self.lease_renewed.push(Box::new(listener));
    }

    /// Resolves the hardware address, binds the socket, and launches the
    /// worker task.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::InvalidConfig("client already started".to_string()));
        }

        let hardware_addr = self.resolve_hardware_addr()?;
        self.hardware_addr = Some(hardware_addr.clone());

        let transport = UdpTransport::bind(&self.config)?;
        let factory = PacketFactory::new(&self.config, &hardware_addr);

        let worker = Worker {
            config: self.config.clone(),
            transport,
            factory,
            lease: Arc::clone(&self.lease),
            probe: Arc::clone(&self.probe),
            stopped: Arc::clone(&self.stopped),
            shutdown_tx: Arc::clone(&self.shutdown_tx),
            shutdown_rx: self.shutdown_rx.clone(),
            lease_received: std::mem::take(&mut self.lease_received),
            lease_renewed: std::mem::take(&mut self.lease_renewed),
            renew_timer: PhaseTimer::unarmed(),
            rebind_timer: PhaseTimer::unarmed(),
            apipa: None,
        };

        info!("Starting DHCP client on port {}", self.config.client_port);
        self.worker = Some(tokio::spawn(worker.run()));

        Ok(())
    }

    /// Idempotent. Signals the worker, which exits at its next wait point.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Stopping DHCP client");
        let _ = self.shutdown_tx.send(true);
    }

    /// Snapshot of the current lease.
    pub fn lease(&self) -> Lease {
        lock_ignoring_poison(&self.lease).clone()
    }

    /// The hardware address resolved at `start`, for inspection in tests
    /// and diagnostics.
    pub fn hardware_addr(&self) -> Option<&[u8]> {
        self.hardware_addr.as_deref()
    }

    fn resolve_hardware_addr(&self) -> Result<Vec<u8>> {
        if let Some(addr) = self.config.hardware_addr {
            return Ok(addr.to_vec());
        }

        let resolved = mac_address::mac_address_by_name(&self.config.interface_name)
            .map_err(|error| {
                Error::InvalidConfig(format!(
                    "hardware address lookup on {} failed: {}",
                    self.config.interface_name, error
                ))
            })?
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "interface {} has no hardware address",
                    self.config.interface_name
                ))
            })?;

        Ok(resolved.bytes().to_vec())
    }
}

impl Drop for DhcpClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Converts a wall-clock moment into a timer deadline.
fn instant_at(moment: DateTime<Utc>) -> Instant {
    let remaining = (moment - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + remaining
}

/// T1/T2 from the ACK, with RFC defaults for absent options and a reset
/// to the defaults when the advertised pair is inconsistent.
fn renewal_timers(ack: &DhcpPacket, lease_duration: Duration) -> (Duration, Duration) {
    let mut t1 = ack
        .renewal_time_secs()
        .map_or_else(|| default_t1(lease_duration), |secs| Duration::from_secs(u64::from(secs)));
    let mut t2 = ack
        .rebinding_time_secs()
        .map_or_else(|| default_t2(lease_duration), |secs| Duration::from_secs(u64::from(secs)));

    if t1.is_zero() || t2.is_zero() || t1 >= t2 || t2 > lease_duration {
        warn!(
            "server sent inconsistent T1/T2 ({:?}/{:?} for {:?} lease), using defaults",
            t1, t2, lease_duration
        );
        t1 = default_t1(lease_duration);
        t2 = default_t2(lease_duration);
    }

    (t1, t2)
}

/// The single task driving the state machine. It re-enters the dispatch
/// loop only between transactions, never mid-transaction; the top-of-loop
/// normalization of transient states relies on that.
struct Worker {
    config: ClientConfig,
    transport: UdpTransport,
    factory: PacketFactory,
    lease: Arc<Mutex<Lease>>,
    probe: Arc<dyn LinkProbe>,
    stopped: Arc<AtomicBool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    lease_received: Vec<LeaseListener>,
    lease_renewed: Vec<LeaseListener>,
    renew_timer: PhaseTimer,
    rebind_timer: PhaseTimer,
    /// Probe-approved link-local fallback, chosen once per engine.
    apipa: Option<Ipv4Addr>,
}

impl Worker {
    async fn run(mut self) {
        self.startup_jitter().await;

        if !self.is_stopped() {
            self.install_initial_apipa();
            self.normalize_state_after_start();
        }

        while !self.is_stopped() {
            let state = lock_ignoring_poison(&self.lease).state;

            match state {
                LeaseState::Init => self.discover().await,
                LeaseState::Bound => self.bound_phase().await,
                LeaseState::InitReboot => self.reboot().await,
                LeaseState::Selecting
                | LeaseState::Requesting
                | LeaseState::Rebooting
                | LeaseState::Renewing
                | LeaseState::Rebinding => {
                    // A transient state at the dispatcher means the last
                    // transaction ended without resolution.
                    self.update_state(LeaseState::InitReboot);
                }
            }

            tokio::task::yield_now().await;
        }

        info!("Processing worker stopped");
    }

    /// RFC 2131 §4.1: desynchronize clients at startup.
    async fn startup_jitter(&mut self) {
        if self.config.startup_jitter_max_secs == 0 {
            return;
        }

        let delay =
            Duration::from_secs(rand::thread_rng().gen_range(1..=self.config.startup_jitter_max_secs));
        info!("Delaying startup by {:?}", delay);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_for_shutdown(&mut self.shutdown_rx) => {}
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) || *self.shutdown_rx.borrow()
    }

    fn apipa(&mut self) -> Ipv4Addr {
        match self.apipa {
            Some(addr) => addr,
            None => {
                let addr = probe::choose_apipa(&*self.probe);
                info!("Link-local fallback address: {}", addr);
                self.apipa = Some(addr);
                addr
            }
        }
    }

    /// A fresh INIT lease starts out addressless; give it the link-local
    /// fallback before the first DISCOVER.
    fn install_initial_apipa(&mut self) {
        let needs_addr = {
            let lease = lock_ignoring_poison(&self.lease);
            lease.state == LeaseState::Init && lease.ip_addr.is_none()
        };

        if needs_addr {
            let addr = self.apipa();
            lock_ignoring_poison(&self.lease).reset(addr);
        }
    }

    /// Any state restored from persistence other than INIT means a lease
    /// was in play; reclaim it with rebooting semantics.
    fn normalize_state_after_start(&mut self) {
        let state = lock_ignoring_poison(&self.lease).state;
        if state != LeaseState::Init && state != LeaseState::InitReboot {
            self.update_state(LeaseState::InitReboot);
        }
    }

    fn update_state(&mut self, new_state: LeaseState) {
        let apipa = if new_state == LeaseState::Init {
            Some(self.apipa())
        } else {
            None
        };

        let mut lease = lock_ignoring_poison(&self.lease);
        info!("State change: {} -> {}", lease.state, new_state);
        lease.state = new_state;

        if let Some(addr) = apipa {
            lease.reset(addr);
        }
    }

    fn notify_lease_received(&self) {
        if self.is_stopped() {
            return;
        }
        let snapshot = lock_ignoring_poison(&self.lease).clone();
        for listener in &self.lease_received {
            listener(&snapshot);
        }
    }

    fn notify_lease_renewed(&self) {
        if self.is_stopped() {
            return;
        }
        let snapshot = lock_ignoring_poison(&self.lease).clone();
        for listener in &self.lease_renewed {
            listener(&snapshot);
        }
    }

    fn on_lease_acquisition_failure(&mut self) {
        if self.config.stop_on_lease_acquisition_failure {
            info!("Lease acquisition failed and stop_on_lease_acquisition_failure is set");
            self.stopped.store(true, Ordering::SeqCst);
            let _ = self.shutdown_tx.send(true);
        }
    }

    async fn sleep_or_shutdown(&mut self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = wait_for_shutdown(&mut self.shutdown_rx) => {}
        }
    }

    /// Reads datagrams until one matches the awaited transaction or the
    /// deadline passes. Non-matching datagrams are consumed and dropped;
    /// they never influence state.
    async fn wait_for_event(&mut self, tx: TxId, deadline: Instant) -> Result<DhcpPacket> {
        loop {
            let packet = tokio::select! {
                result = self.transport.recv_until(deadline) => result?,
                _ = wait_for_shutdown(&mut self.shutdown_rx) => return Err(Error::Stopped),
            };

            if packet.xid != tx {
                debug!(
                    "Ignoring datagram with unrelated xid {:#010x} (awaiting {:#010x})",
                    packet.xid, tx
                );
                continue;
            }

            return Ok(packet);
        }
    }

    // --- Discover phase -------------------------------------------------

    async fn discover(&mut self) {
        let (packet, tx) = self.factory.discover();

        if let Err(error) = self.transport.send_broadcast(&packet).await {
            // Stay in INIT; the dispatcher retries on the next iteration.
            warn!("Sending DISCOVER failed: {}", error);
            return;
        }

        self.update_state(LeaseState::Selecting);

        let offers = self.read_offers(tx).await;

        if self.is_stopped() {
            return;
        }

        if offers.is_empty() {
            info!(
                "No offer received within {} seconds",
                self.config.max_offer_wait_secs
            );
            self.update_state(LeaseState::Init);
            self.on_lease_acquisition_failure();
            return;
        }

        // First offer wins; the rest were only collected to drain the
        // window and are dropped here.
        let Some(offer) = offers.into_iter().next() else {
            return;
        };
        let mut attempts = 0;

        while attempts < REQUEST_RETRIES + 1 {
            match self.process_offer(&offer).await {
                Ok(()) => return,
                Err(Error::Stopped) => return,
                Err(Error::DuplicateAddress(addr)) => {
                    warn!("Offered address {} is already on the segment", addr);
                    self.update_state(LeaseState::Init);
                    self.on_lease_acquisition_failure();
                    return;
                }
                Err(error) => {
                    attempts += 1;
                    warn!("Error processing offer (attempt {}): {}", attempts, error);
                    self.sleep_or_shutdown(Duration::from_secs(self.config.retry_request_secs))
                        .await;
                    if self.is_stopped() {
                        return;
                    }
                }
            }
        }

        warn!("Offer was not acknowledged after {} attempts", attempts);
        self.update_state(LeaseState::Init);
        self.on_lease_acquisition_failure();
    }

    /// Collects offers for the DISCOVER with transaction `tx`.
    ///
    /// Optimistically, competing offers all arrive inside the offer
    /// window. Once the first offer lands, the hard wait bound shrinks to
    /// the window end; with no offer at all, the wait runs to the
    /// configured maximum and returns empty.
    async fn read_offers(&mut self, tx: TxId) -> Vec<DhcpPacket> {
        let window_end = Instant::now() + Duration::from_secs(self.config.offer_window_secs);
        let mut hard_bound = Instant::now() + Duration::from_secs(self.config.max_offer_wait_secs);
        let mut offers = Vec::new();

        loop {
            if Instant::now() > hard_bound {
                return offers;
            }

            match self.wait_for_event(tx, hard_bound).await {
                Ok(packet) if packet.is_type(MessageType::Offer) => {
                    offers.push(packet);
                    if Instant::now() > window_end {
                        return offers;
                    }
                    hard_bound = window_end;
                }
                Ok(packet) => {
                    warn!(
                        "Waiting for an offer but got {}",
                        packet
                            .message_type()
                            .map_or_else(|| "UNKNOWN".to_string(), |t| t.to_string())
                    );
                }
                Err(error) if error.is_timeout() => return offers,
                Err(Error::Stopped) => return offers,
                Err(error) => {
                    warn!("Error while reading offers: {}", error);
                    return offers;
                }
            }
        }
    }

    /// REQUESTs the offered address and waits for the verdict.
    async fn process_offer(&mut self, offer: &DhcpPacket) -> Result<()> {
        let request_time = Utc::now();
        let (request, tx) = self.factory.request_for_offer(offer)?;

        self.transport.send_broadcast(&request).await?;
        self.update_state(LeaseState::Requesting);

        loop {
            let reply = self.wait_for_event(tx, Instant::now() + ACK_WAIT).await?;

            match reply.message_type() {
                Some(MessageType::Ack) => {
                    self.finalize_offer(&reply, request_time).await?;
                    self.update_state(LeaseState::Bound);
                    self.notify_lease_received();
                    return Ok(());
                }
                Some(MessageType::Nak) => {
                    return Err(Error::Protocol(format!(
                        "server {} revoked the offered lease",
                        reply
                            .server_identifier()
                            .unwrap_or(Ipv4Addr::UNSPECIFIED)
                    )));
                }
                other => {
                    warn!(
                        "Expected ACK or NAK but got {}; keep waiting",
                        other.map_or_else(|| "UNKNOWN".to_string(), |t| t.to_string())
                    );
                }
            }
        }
    }

    /// Commits an ACK into the lease. Probes the offered address first
    /// and DECLINEs it when the segment already answers for it.
    async fn finalize_offer(
        &mut self,
        ack: &DhcpPacket,
        request_time: DateTime<Utc>,
    ) -> Result<()> {
        if self.probe.is_address_in_use(ack.yiaddr) {
            let (decline, _) = self.factory.decline(ack);
            match ack.server_identifier() {
                Some(server) => {
                    if let Err(error) = self.transport.send(&decline, server).await {
                        warn!("Could not send DECLINE: {}", error);
                    }
                }
                None => warn!("ACK carries no server identifier; DECLINE not sent"),
            }
            return Err(Error::DuplicateAddress(ack.yiaddr));
        }

        let server_identifier = ack
            .server_identifier()
            .ok_or_else(|| Error::Protocol("ACK carries no server identifier".to_string()))?;
        let lease_secs = ack
            .lease_time_secs()
            .ok_or_else(|| Error::Protocol("ACK carries no lease time".to_string()))?;
        if lease_secs == 0 {
            return Err(Error::Protocol("ACK carries a zero lease time".to_string()));
        }

        let lease_duration = Duration::from_secs(u64::from(lease_secs));
        let (t1, t2) = renewal_timers(ack, lease_duration);

        let mut lease = lock_ignoring_poison(&self.lease);
        lease.server_identifier = Some(server_identifier);
        lease.ip_addr = Some(ack.yiaddr);
        lease.dns = ack.dns_servers().and_then(|servers| servers.first().copied());
        lease.subnet_mask = ack.subnet_mask();
        lease.lease_duration = lease_duration;
        lease.lease_init_time = request_time;
        lease.t1 = t1;
        lease.t2 = t2;
        lease.ack = Some(ack.clone());

        Ok(())
    }

    // --- Reboot phase ---------------------------------------------------

    /// INIT_REBOOT: try to reclaim the persisted address with a single
    /// broadcast REQUEST.
    async fn reboot(&mut self) {
        let snapshot = lock_ignoring_poison(&self.lease).clone();

        if snapshot.state != LeaseState::InitReboot {
            warn!("Cannot reclaim a lease from state {}", snapshot.state);
            return;
        }

        let request_time = Utc::now();
        let (request, tx) = self.factory.request_for_reboot(&snapshot);

        if let Err(error) = self.transport.send_broadcast(&request).await {
            warn!("Sending reboot REQUEST failed: {}", error);
            self.update_state(LeaseState::Init);
            return;
        }

        self.update_state(LeaseState::Rebooting);

        match self.wait_for_event(tx, Instant::now() + ACK_WAIT).await {
            Err(Error::Stopped) => {}
            Err(error) => {
                warn!("No usable reply to reboot REQUEST: {}", error);
                self.update_state(LeaseState::Init);
            }
            Ok(reply) => self.handle_renew_reply(reply, request_time).await,
        }
    }

    /// Shared verdict handling for reboot and renew replies.
    async fn handle_renew_reply(&mut self, reply: DhcpPacket, request_time: DateTime<Utc>) {
        match reply.message_type() {
            Some(MessageType::Nak) => {
                info!("Server declined to extend the lease");
                self.update_state(LeaseState::Init);
            }
            Some(MessageType::Ack) => match self.finalize_offer(&reply, request_time).await {
                Ok(()) => {
                    info!("Lease extended");
                    self.update_state(LeaseState::Bound);
                    self.notify_lease_renewed();
                }
                Err(error) => {
                    warn!("Could not finalize the extended lease: {}", error);
                    self.update_state(LeaseState::Init);
                }
            },
            other => {
                warn!(
                    "Expected ACK or NAK but got {}",
                    other.map_or_else(|| "UNKNOWN".to_string(), |t| t.to_string())
                );
            }
        }
    }

    // --- Renew / rebind phase -------------------------------------------

    async fn bound_phase(&mut self) {
        let (until_renew, until_rebind) = {
            let lease = lock_ignoring_poison(&self.lease);
            (lease.duration_until_renew(), lease.duration_until_rebind())
        };

        self.renew_timer.arm(until_renew);
        self.rebind_timer.arm(until_rebind);
        info!("Renew scheduled in {:?}, rebind in {:?}", until_renew, until_rebind);

        self.renew_or_rebind().await;
    }

    async fn renew_or_rebind(&mut self) {
        let renew_expired = lock_ignoring_poison(&self.lease).is_renew_period_expired();

        if !renew_expired {
            let (state, renewed) = self.renew_lease().await;
            if renewed || state == LeaseState::Init {
                return;
            }
        }

        if self.is_stopped() {
            return;
        }

        let rebind_expired = lock_ignoring_poison(&self.lease).is_rebind_period_expired();
        if rebind_expired {
            self.update_state(LeaseState::Init);
        } else {
            self.rebind_lease().await;
        }
    }

    /// Unicast renewal attempts, paced by the renew timer and bounded by
    /// T2. Returns the resulting state and whether the lease was renewed.
    async fn renew_lease(&mut self) -> (LeaseState, bool) {
        loop {
            let snapshot = lock_ignoring_poison(&self.lease).clone();
            let outcome = wait_for_timer(
                &mut self.renew_timer,
                instant_at(snapshot.rebind_moment()),
                &mut self.shutdown_rx,
            )
            .await;

            if self.is_stopped() || outcome == WaitOutcome::Shutdown {
                return (snapshot.state, false);
            }

            let snapshot = lock_ignoring_poison(&self.lease).clone();
            if snapshot.is_renew_period_expired() {
                return (snapshot.state, false);
            }

            let server = match snapshot.server_identifier {
                Some(server) => server,
                None => {
                    warn!("No server identifier to renew against");
                    self.update_state(LeaseState::Init);
                    return (LeaseState::Init, false);
                }
            };

            info!("Renewing lease with {}", server);
            let request_time = Utc::now();
            let (request, tx) = self.factory.request_for_renew(&snapshot);

            if let Err(error) = self.transport.send(&request, server).await {
                warn!("Sending renew REQUEST failed: {}", error);
            }

            self.update_state(LeaseState::Renewing);

            match self.wait_for_event(tx, Instant::now() + ACK_WAIT).await {
                Err(Error::Stopped) => return (LeaseState::Renewing, false),
                Err(error) => {
                    warn!("No reply to renew REQUEST: {}", error);
                    let next = lock_ignoring_poison(&self.lease).duration_until_renew();
                    self.renew_timer.arm(next);
                }
                Ok(reply) => match reply.message_type() {
                    Some(MessageType::Nak) => {
                        info!("Server declined to renew the lease");
                        self.update_state(LeaseState::Init);
                        return (LeaseState::Init, false);
                    }
                    Some(MessageType::Ack) => {
                        match self.finalize_offer(&reply, request_time).await {
                            Ok(()) => {
                                info!("Lease renewed");
                                self.update_state(LeaseState::Bound);
                                self.notify_lease_renewed();
                                return (LeaseState::Bound, true);
                            }
                            Err(error) => {
                                warn!("Could not finalize the renewed lease: {}", error);
                                self.update_state(LeaseState::Init);
                                return (LeaseState::Init, false);
                            }
                        }
                    }
                    other => {
                        warn!(
                            "Expected ACK or NAK but got {}",
                            other.map_or_else(|| "UNKNOWN".to_string(), |t| t.to_string())
                        );
                        let current = lock_ignoring_poison(&self.lease).state;
                        return (current, false);
                    }
                },
            }
        }
    }

    /// Broadcast rebinding, bounded by lease expiry. Failed cycles resend
    /// immediately; expiry without an ACK falls back to INIT.
    async fn rebind_lease(&mut self) -> (LeaseState, bool) {
        let snapshot = lock_ignoring_poison(&self.lease).clone();
        let outcome = wait_for_timer(
            &mut self.rebind_timer,
            instant_at(snapshot.expiration_moment()),
            &mut self.shutdown_rx,
        )
        .await;

        if self.is_stopped() || outcome == WaitOutcome::Shutdown {
            return (snapshot.state, false);
        }

        let expired = lock_ignoring_poison(&self.lease).is_rebind_period_expired();
        if expired {
            self.update_state(LeaseState::Init);
            return (LeaseState::Init, false);
        }

        info!("Rebinding lease");

        loop {
            let snapshot = lock_ignoring_poison(&self.lease).clone();
            if self.is_stopped() {
                return (snapshot.state, false);
            }
            if Utc::now() >= snapshot.expiration_moment() {
                break;
            }

            let request_time = Utc::now();
            let (request, tx) = self.factory.request_for_rebind(&snapshot);

            if let Err(error) = self.transport.send_broadcast(&request).await {
                warn!("Sending rebind REQUEST failed: {}", error);
            }

            self.update_state(LeaseState::Rebinding);

            match self.wait_for_event(tx, Instant::now() + ACK_WAIT).await {
                Err(Error::Stopped) => return (LeaseState::Rebinding, false),
                Err(error) => {
                    warn!("No reply to rebind REQUEST: {}", error);
                }
                Ok(reply) => match reply.message_type() {
                    Some(MessageType::Nak) => {
                        info!("Server declined to rebind the lease");
                        self.update_state(LeaseState::Init);
                        return (LeaseState::Init, false);
                    }
                    Some(MessageType::Ack) => {
                        match self.finalize_offer(&reply, request_time).await {
                            Ok(()) => {
                                info!("Lease rebound");
                                self.update_state(LeaseState::Bound);
                                self.notify_lease_renewed();
                                return (LeaseState::Bound, true);
                            }
                            Err(error) => {
                                warn!("Could not finalize the rebound lease: {}", error);
                                self.update_state(LeaseState::Init);
                                return (LeaseState::Init, false);
                            }
                        }
                    }
                    other => {
                        warn!(
                            "Expected ACK or NAK but got {}",
                            other.map_or_else(|| "UNKNOWN".to_string(), |t| t.to_string())
                        );
                    }
                },
            }
        }

        // The lease ran out with no server answering.
        self.update_state(LeaseState::Init);
        (LeaseState::Init, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::DhcpOption;
    use crate::packet::BOOTREPLY;

    fn ack_with(options: Vec<DhcpOption>) -> DhcpPacket {
        DhcpPacket {
            op: BOOTREPLY,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid: 1,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::new(192, 168, 1, 100),
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: [0u8; 16],
            sname: [0u8; 64],
            file: [0u8; 128],
            options,
        }
    }

    #[test]
    fn test_renewal_timers_defaults() {
        let ack = ack_with(vec![DhcpOption::MessageType(MessageType::Ack)]);
        let (t1, t2) = renewal_timers(&ack, Duration::from_secs(200));
        assert_eq!(t1, Duration::from_secs(100));
        assert_eq!(t2, Duration::from_secs(175));
    }

    #[test]
    fn test_renewal_timers_from_options() {
        let ack = ack_with(vec![
            DhcpOption::MessageType(MessageType::Ack),
            DhcpOption::RenewalTime(3),
            DhcpOption::RebindingTime(5),
        ]);
        let (t1, t2) = renewal_timers(&ack, Duration::from_secs(200));
        assert_eq!(t1, Duration::from_secs(3));
        assert_eq!(t2, Duration::from_secs(5));
    }

    #[test]
    fn test_renewal_timers_reject_inconsistent_pair() {
        let inconsistent = [
            (0u32, 175u32),
            (100, 0),
            (175, 100),
            (100, 100),
            (100, 500),
        ];
        for (t1_opt, t2_opt) in inconsistent {
            let ack = ack_with(vec![
                DhcpOption::MessageType(MessageType::Ack),
                DhcpOption::RenewalTime(t1_opt),
                DhcpOption::RebindingTime(t2_opt),
            ]);
            let (t1, t2) = renewal_timers(&ack, Duration::from_secs(200));
            assert_eq!(t1, Duration::from_secs(100), "t1 for {:?}", (t1_opt, t2_opt));
            assert_eq!(t2, Duration::from_secs(175), "t2 for {:?}", (t1_opt, t2_opt));
        }
    }

    #[test]
    fn test_instant_at_past_moment_is_now() {
        let past = Utc::now() - chrono::TimeDelta::seconds(100);
        let deadline = instant_at(past);
        assert!(deadline <= Instant::now() + Duration::from_millis(10));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let config = ClientConfig {
            hardware_addr: Some([1, 2, 3, 4, 5, 6]),
            ..Default::default()
        };
        let client = DhcpClient::new(config).unwrap();
        client.stop();
        client.stop();
        assert_eq!(client.lease().state, LeaseState::Init);
    }

    #[test]
    fn test_initial_lease_override() {
        let config = ClientConfig {
            hardware_addr: Some([1, 2, 3, 4, 5, 6]),
            ..Default::default()
        };
        let mut lease = Lease::new();
        lease.state = LeaseState::Bound;
        lease.ip_addr = Some(Ipv4Addr::new(10, 0, 0, 5));

        let client = DhcpClient::new(config).unwrap().with_initial_lease(lease);
        assert_eq!(client.lease().state, LeaseState::Bound);
        assert_eq!(client.lease().ip_addr, Some(Ipv4Addr::new(10, 0, 0, 5)));
    }
}
