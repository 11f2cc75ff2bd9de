use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::packet::DhcpPacket;

/// All-hosts group; stands in for the broadcast address in multicast test
/// mode so servers on the loopback interface can hear the client.
const MULTICAST_ALL_HOSTS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);

const RECV_BUFFER_SIZE: usize = 2000;

/// The client's single UDP socket plus its addressing policy. Owned
/// exclusively by the engine: one sender, one receiver.
pub struct UdpTransport {
    socket: UdpSocket,
    server_port: u16,
    use_multicast: bool,
}

impl UdpTransport {
    pub fn bind(config: &ClientConfig) -> Result<Self> {
        let socket = Self::create_socket(config)?;

        Ok(Self {
            socket,
            server_port: config.server_port,
            use_multicast: config.use_multicast,
        })
    }

    fn create_socket(config: &ClientConfig) -> Result<UdpSocket> {
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
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        if config.use_multicast {
            socket.set_multicast_if_v4(&Ipv4Addr::LOCALHOST).map_err(|error| {
                Error::Socket(format!("Failed to set multicast interface: {}", error))
            })?;
            socket.set_multicast_loop_v4(true).map_err(|error| {
                Error::Socket(format!("Failed to enable multicast loopback: {}", error))
            })?;
        }

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.client_port);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })?;

        Ok(tokio_socket)
    }

    /// Sends to the given server address, rewriting the broadcast address
    /// to the all-hosts group in multicast test mode.
    pub async fn send(&self, packet: &DhcpPacket, destination: Ipv4Addr) -> Result<()> {
        let destination = if self.use_multicast && destination == Ipv4Addr::BROADCAST {
            MULTICAST_ALL_HOSTS
        } else {
            destination
        };

        let target = SocketAddr::from(SocketAddrV4::new(destination, self.server_port));

        debug!("--> {} to {}", packet, target);
        self.socket.send_to(&packet.encode(), target).await?;

        Ok(())
    }

    pub async fn send_broadcast(&self, packet: &DhcpPacket) -> Result<()> {
        self.send(packet, Ipv4Addr::BROADCAST).await
    }

    /// Receives until a decodable datagram arrives or the deadline passes.
    /// Malformed datagrams are logged and consumed; the wait continues.
    pub async fn recv_until(&self, deadline: Instant) -> Result<DhcpPacket> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        loop {
            let (size, source) = match timeout_at(deadline, self.socket.recv_from(&mut buffer))
                .await
            {
                Err(_elapsed) => return Err(Error::Timeout),
                Ok(Err(error)) => return Err(error.into()),
                Ok(Ok(received)) => received,
            };

            match DhcpPacket::parse(&buffer[..size]) {
                Ok(packet) => {
                    debug!("<-- {} from {}", packet, source);
                    return Ok(packet);
                }
                Err(error) => {
                    warn!("Dropping malformed datagram from {}: {}", source, error);
                }
            }
        }
    }
}
