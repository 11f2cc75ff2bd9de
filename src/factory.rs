//! Builds the client-originated packets from the current configuration
//! and lease, per the RFC 2131 client tables.

use std::net::Ipv4Addr;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::options::{DhcpOption, MessageType};
use crate::packet::{BOOTREQUEST, DhcpPacket};

pub type TxId = u32;

fn random_transaction_id() -> TxId {
    rand::random()
}

pub struct PacketFactory {
    htype: u8,
    hlen: u8,
    chaddr: [u8; 16],
}

impl PacketFactory {
    pub fn new(config: &ClientConfig, hardware_addr: &[u8]) -> Self {
        let mut chaddr = [0u8; 16];
        let len = hardware_addr.len().min(chaddr.len());
        chaddr[..len].copy_from_slice(&hardware_addr[..len]);

        Self {
            htype: config.hardware_type,
            hlen: config.hardware_addr_len,
            chaddr,
        }
    }

    fn base(&self, xid: TxId) -> DhcpPacket {
        DhcpPacket {
            op: BOOTREQUEST,
            htype: self.htype,
            hlen: self.hlen,
            hops: 0,
            xid,
            // RFC 2131 §4.4.1 ties the REQUEST's secs to the DISCOVER's so
            // relay agents forward both alike; this client keeps both zero.
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: self.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: Vec::new(),
        }
    }

    pub fn discover(&self) -> (DhcpPacket, TxId) {
        let xid = random_transaction_id();
        let mut packet = self.base(xid);
        packet.mark_broadcast();
        packet
            .options
            .push(DhcpOption::MessageType(MessageType::Discover));

        (packet, xid)
    }

    /// REQUEST answering an OFFER. Reuses the offer's xid (RFC 2131
    /// §4.4.1) and echoes its server identifier.
    pub fn request_for_offer(&self, offer: &DhcpPacket) -> Result<(DhcpPacket, TxId)> {
        let server_identifier = offer
            .server_identifier()
            .ok_or_else(|| Error::Protocol("offer carries no server identifier".to_string()))?;

        let xid = offer.xid;
        let mut packet = self.base(xid);
        packet.mark_broadcast();
        packet
            .options
            .push(DhcpOption::RequestedIpAddress(offer.yiaddr));
        packet
            .options
            .push(DhcpOption::MessageType(MessageType::Request));
        packet
            .options
            .push(DhcpOption::ServerIdentifier(server_identifier));

        Ok((packet, xid))
    }

    /// REQUEST reclaiming a previously held address after a restart.
    pub fn request_for_reboot(&self, lease: &Lease) -> (DhcpPacket, TxId) {
        let xid = random_transaction_id();
        let mut packet = self.base(xid);
        packet.mark_broadcast();
        packet.options.push(DhcpOption::RequestedIpAddress(
            lease.ip_addr.unwrap_or(Ipv4Addr::UNSPECIFIED),
        ));
        packet
            .options
            .push(DhcpOption::MessageType(MessageType::Request));

        (packet, xid)
    }

    /// REQUEST extending the current lease. The client has a working
    /// address, so ciaddr is set and the reply may come unicast.
    pub fn request_for_renew(&self, lease: &Lease) -> (DhcpPacket, TxId) {
        let xid = random_transaction_id();
        let mut packet = self.base(xid);
        packet.ciaddr = lease.ip_addr.unwrap_or(Ipv4Addr::UNSPECIFIED);
        packet
            .options
            .push(DhcpOption::MessageType(MessageType::Request));

        (packet, xid)
    }

    /// Same shape as a renew REQUEST; only the destination differs.
    pub fn request_for_rebind(&self, lease: &Lease) -> (DhcpPacket, TxId) {
        self.request_for_renew(lease)
    }

    /// DECLINE for an address the link probe found already in use.
    pub fn decline(&self, ack: &DhcpPacket) -> (DhcpPacket, TxId) {
        let xid = random_transaction_id();
        let mut packet = self.base(xid);
        packet
            .options
            .push(DhcpOption::RequestedIpAddress(ack.yiaddr));
        packet
            .options
            .push(DhcpOption::MessageType(MessageType::Decline));

        (packet, xid)
    }
}
