//! A scriptable in-process DHCP server for driving integration tests.
//! Not part of the client proper.
//!
//! The server pops one scripted reaction per received datagram: answer
//! with a canned reply (optionally delayed), or stay silent. It listens
//! on a unicast address and on the all-hosts multicast group so it hears
//! clients running in multicast test mode on the loopback interface.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::options::DhcpOption;
use crate::packet::{BOOTREPLY, DhcpPacket};

const MULTICAST_ALL_HOSTS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
const RECV_BUFFER_SIZE: usize = 2000;

enum Reaction {
    Reply {
        yiaddr: Ipv4Addr,
        options: Vec<DhcpOption>,
        delay: Duration,
    },
    Ignore,
}

pub struct ScriptedServer {
    addr: Ipv4Addr,
    port: u16,
    reactions: Arc<Mutex<VecDeque<Reaction>>>,
    received: Arc<Mutex<Vec<DhcpPacket>>>,
    sent: Arc<Mutex<Vec<DhcpPacket>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ScriptedServer {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self {
            addr,
            port,
            reactions: Arc::new(Mutex::new(VecDeque::new())),
            received: Arc::new(Mutex::new(Vec::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
            tasks: Vec::new(),
        }
    }

    /// Queues a reply for the next received datagram.
    pub fn add_reply(&self, yiaddr: Ipv4Addr, options: Vec<DhcpOption>) {
        lock(&self.reactions).push_back(Reaction::Reply {
            yiaddr,
            options,
            delay: Duration::ZERO,
        });
    }

    /// Queues a reply sent only after `delay`, for offer-race scenarios.
    pub fn add_reply_with_delay(
        &self,
        yiaddr: Ipv4Addr,
        delay: Duration,
        options: Vec<DhcpOption>,
    ) {
        lock(&self.reactions).push_back(Reaction::Reply {
            yiaddr,
            options,
            delay,
        });
    }

    /// Queues silence: the next datagram is recorded but unanswered.
    pub fn add_ignore(&self) {
        lock(&self.reactions).push_back(Reaction::Ignore);
    }

    pub fn listen(&mut self) -> Result<()> {
        let unicast = Arc::new(create_socket(self.addr, self.port, false)?);
        let multicast = Arc::new(create_socket(MULTICAST_ALL_HOSTS, self.port, true)?);

        for socket in [Arc::clone(&unicast), multicast] {
            let reply_socket = Arc::clone(&unicast);
            let reactions = Arc::clone(&self.reactions);
            let received = Arc::clone(&self.received);
            let sent = Arc::clone(&self.sent);

            self.tasks.push(tokio::spawn(serve(
                socket,
                reply_socket,
                reactions,
                received,
                sent,
            )));
        }

        debug!("Scripted DHCP server listening on {}:{}", self.addr, self.port);
        Ok(())
    }

    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub fn received_packets(&self) -> Vec<DhcpPacket> {
        lock(&self.received).clone()
    }

    pub fn sent_packets(&self) -> Vec<DhcpPacket> {
        lock(&self.sent).clone()
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// SO_REUSEPORT on every socket: multiple servers (and their multicast
/// listeners) share a port within one test process.
fn create_socket(addr: Ipv4Addr, port: u16, join_group: bool) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

    socket
        .set_reuse_address(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEPORT: {}", error)))?;

    socket
        .set_nonblocking(true)
        .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

    if join_group {
        socket
            .join_multicast_v4(&MULTICAST_ALL_HOSTS, &Ipv4Addr::LOCALHOST)
            .map_err(|error| {
                Error::Socket(format!("Failed to join multicast group: {}", error))
            })?;
        socket
            .set_multicast_loop_v4(true)
            .map_err(|error| {
                Error::Socket(format!("Failed to enable multicast loopback: {}", error))
            })?;
    }

    let bind_addr = SocketAddrV4::new(addr, port);
    socket
        .bind(&bind_addr.into())
        .map_err(|error| Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|error| Error::Socket(format!("Failed to convert to tokio socket: {}", error)))
}

async fn serve(
    socket: Arc<UdpSocket>,
    reply_socket: Arc<UdpSocket>,
    reactions: Arc<Mutex<VecDeque<Reaction>>>,
    received: Arc<Mutex<Vec<DhcpPacket>>>,
    sent: Arc<Mutex<Vec<DhcpPacket>>>,
) {
    let mut buffer = [0u8; RECV_BUFFER_SIZE];

    loop {
        let (size, source) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(error) => {
                warn!("Scripted server receive failed: {}", error);
                return;
            }
        };

        let request = match DhcpPacket::parse(&buffer[..size]) {
            Ok(packet) => packet,
            Err(error) => {
                warn!("Scripted server dropping malformed datagram: {}", error);
                continue;
            }
        };

        debug!("Scripted server received {} from {}", request, source);
        lock(&received).push(request.clone());

        match lock(&reactions).pop_front() {
            Some(Reaction::Reply {
                yiaddr,
                options,
                delay,
            }) => {
                let reply = build_reply(&request, yiaddr, options);
                let reply_socket = Arc::clone(&reply_socket);
                let sent = Arc::clone(&sent);

                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    match reply_socket.send_to(&reply.encode(), source).await {
                        Ok(_) => lock(&sent).push(reply),
                        Err(error) => warn!("Scripted server reply failed: {}", error),
                    }
                });
            }
            Some(Reaction::Ignore) | None => {
                debug!("Scripted server staying silent for {}", request);
            }
        }
    }
}

fn build_reply(request: &DhcpPacket, yiaddr: Ipv4Addr, options: Vec<DhcpOption>) -> DhcpPacket {
    DhcpPacket {
        op: BOOTREPLY,
        htype: request.htype,
        hlen: request.hlen,
        hops: 0,
        xid: request.xid,
        secs: 0,
        flags: 0,
        ciaddr: Ipv4Addr::UNSPECIFIED,
        yiaddr,
        siaddr: Ipv4Addr::UNSPECIFIED,
        giaddr: request.giaddr,
        chaddr: request.chaddr,
        sname: [0u8; 64],
        file: [0u8; 128],
        options,
    }
}
