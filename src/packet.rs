use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::options::{DhcpOption, MessageType, OptionCode};

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const DHCP_FIXED_HEADER_SIZE: usize = 240;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

/// Broadcast bit: MSB of the network-order flags word.
const BROADCAST_FLAG: u16 = 1 << 15;

/// An RFC 2131 BOOTP/DHCP datagram. The magic cookie and END framing live
/// only on the wire: `encode` appends them, `parse` strips them.
#[derive(Debug, Clone, PartialEq)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Vec<DhcpOption>,
}

impl DhcpPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DHCP_FIXED_HEADER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "Packet too short: {} bytes (minimum {})",
                data.len(),
                DHCP_FIXED_HEADER_SIZE
            )));
        }

        let magic_cookie = &data[236..240];
        if magic_cookie != DHCP_MAGIC_COOKIE {
            return Err(Error::InvalidPacket("Invalid magic cookie".to_string()));
        }

        let op = data[0];
        let htype = data[1];
        let hlen = data[2];
        let hops = data[3];

        let xid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let secs = u16::from_be_bytes([data[8], data[9]]);
        let flags = u16::from_be_bytes([data[10], data[11]]);

        let ciaddr = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let yiaddr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
        let siaddr = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let giaddr = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);

        let mut sname = [0u8; 64];
        sname.copy_from_slice(&data[44..108]);

        let mut file = [0u8; 128];
        file.copy_from_slice(&data[108..236]);

        let options = Self::parse_options(&data[240..])?;

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options,
        })
    }

    /// Walks the raw TLV area. Payloads of repeated codes are concatenated
    /// in first-appearance order into one logical option (RFC 3396) before
    /// typed parsing. The walk stops at the END tag; servers may pad after
    /// it with anything.
    fn parse_options(data: &[u8]) -> Result<Vec<DhcpOption>> {
        let mut merged: Vec<(u8, Vec<u8>)> = Vec::new();
        let mut index = 0;

        while index < data.len() {
            let code = data[index];

            if code == OptionCode::Pad as u8 {
                index += 1;
                continue;
            }

            if code == OptionCode::End as u8 {
                break;
            }

            if index + 1 >= data.len() {
                return Err(Error::InvalidPacket("Option length missing".to_string()));
            }

            let length = data[index + 1] as usize;

            if index + 2 + length > data.len() {
                return Err(Error::InvalidPacket("Option data truncated".to_string()));
            }

            let payload = &data[index + 2..index + 2 + length];

            match merged.iter_mut().find(|(existing, _)| *existing == code) {
                Some((_, existing_payload)) => existing_payload.extend_from_slice(payload),
                None => merged.push((code, payload.to_vec())),
            }

            index += 2 + length;
        }

        merged
            .into_iter()
            .map(|(code, payload)| DhcpOption::parse(code, &payload))
            .collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(576);

        packet.push(self.op);
        packet.push(self.htype);
        packet.push(self.hlen);
        packet.push(self.hops);

        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());

        packet.extend_from_slice(&self.ciaddr.octets());
        packet.extend_from_slice(&self.yiaddr.octets());
        packet.extend_from_slice(&self.siaddr.octets());
        packet.extend_from_slice(&self.giaddr.octets());

        packet.extend_from_slice(&self.chaddr);
        packet.extend_from_slice(&self.sname);
        packet.extend_from_slice(&self.file);

        packet.extend_from_slice(&DHCP_MAGIC_COOKIE);

        for option in &self.options {
            packet.extend_from_slice(&option.encode());
        }

        packet.extend_from_slice(&[OptionCode::End as u8, 0, 0]);

        packet
    }

    pub fn message_type(&self) -> Option<MessageType> {
        for option in &self.options {
            if let DhcpOption::MessageType(msg_type) = option {
                return Some(*msg_type);
            }
        }
        None
    }

    pub fn is_type(&self, msg_type: MessageType) -> bool {
        self.message_type() == Some(msg_type)
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        for option in &self.options {
            if let DhcpOption::ServerIdentifier(ip) = option {
                return Some(*ip);
            }
        }
        None
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        for option in &self.options {
            if let DhcpOption::RequestedIpAddress(ip) = option {
                return Some(*ip);
            }
        }
        None
    }

    pub fn subnet_mask(&self) -> Option<Ipv4Addr> {
        for option in &self.options {
            if let DhcpOption::SubnetMask(mask) = option {
                return Some(*mask);
            }
        }
        None
    }

    pub fn dns_servers(&self) -> Option<&[Ipv4Addr]> {
        for option in &self.options {
            if let DhcpOption::DnsServer(servers) = option {
                return Some(servers);
            }
        }
        None
    }

    pub fn lease_time_secs(&self) -> Option<u32> {
        for option in &self.options {
            if let DhcpOption::LeaseTime(secs) = option {
                return Some(*secs);
            }
        }
        None
    }

    pub fn renewal_time_secs(&self) -> Option<u32> {
        for option in &self.options {
            if let DhcpOption::RenewalTime(secs) = option {
                return Some(*secs);
            }
        }
        None
    }

    pub fn rebinding_time_secs(&self) -> Option<u32> {
        for option in &self.options {
            if let DhcpOption::RebindingTime(secs) = option {
                return Some(*secs);
            }
        }
        None
    }

    pub fn is_broadcast(&self) -> bool {
        (self.flags & BROADCAST_FLAG) != 0
    }

    /// Asks the server to broadcast its reply; set while the client has no
    /// address a unicast reply could reach.
    pub fn mark_broadcast(&mut self) {
        self.flags = BROADCAST_FLAG;
    }

    pub fn hardware_addr(&self) -> &[u8] {
        &self.chaddr[..usize::from(self.hlen).min(self.chaddr.len())]
    }

    pub fn format_mac(&self) -> String {
        self.hardware_addr()
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl std::fmt::Display for DhcpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} xid={:#010x} ciaddr={} yiaddr={} siaddr={} flags={:#06x} chaddr={}",
            self.message_type()
                .map_or_else(|| "UNKNOWN".to_string(), |t| t.to_string()),
            self.xid,
            self.ciaddr,
            self.yiaddr,
            self.siaddr,
            self.flags,
            self.format_mac(),
        )
    }
}
