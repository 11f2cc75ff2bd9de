use std::net::Ipv4Addr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    DomainName = 15,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    OptionOverload = 52,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    Message = 56,
    MaxMessageSize = 57,
    RenewalTime = 58,
    RebindingTime = 59,
    ClassIdentifier = 60,
    ClientIdentifier = 61,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            6 => Ok(Self::DnsServer),
            15 => Ok(Self::DomainName),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            52 => Ok(Self::OptionOverload),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            55 => Ok(Self::ParameterRequestList),
            56 => Ok(Self::Message),
            57 => Ok(Self::MaxMessageSize),
            58 => Ok(Self::RenewalTime),
            59 => Ok(Self::RebindingTime),
            60 => Ok(Self::ClassIdentifier),
            61 => Ok(Self::ClientIdentifier),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// A single decoded DHCP option. Codes outside the set the client
/// interprets are carried verbatim in `Unknown` so they survive a
/// decode/encode round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    DomainName(String),
    RequestedIpAddress(Ipv4Addr),
    LeaseTime(u32),
    OptionOverload(u8),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    Message(String),
    MaxMessageSize(u16),
    RenewalTime(u32),
    RebindingTime(u32),
    ClassIdentifier(Vec<u8>),
    ClientIdentifier(Vec<u8>),
    Unknown(u8, Vec<u8>),
}

fn single_ipv4(code: &str, data: &[u8]) -> Result<Ipv4Addr> {
    if data.len() != 4 {
        return Err(Error::InvalidPacket(format!(
            "{} option must be 4 bytes, got {}",
            code,
            data.len()
        )));
    }
    Ok(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
}

fn ipv4_list(code: &str, data: &[u8]) -> Result<Vec<Ipv4Addr>> {
    if data.is_empty() || data.len() % 4 != 0 {
        return Err(Error::InvalidPacket(format!(
            "{} option must be a non-empty multiple of 4 bytes, got {}",
            code,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn u32_be(code: &str, data: &[u8]) -> Result<u32> {
    if data.len() != 4 {
        return Err(Error::InvalidPacket(format!(
            "{} option must be 4 bytes, got {}",
            code,
            data.len()
        )));
    }
    Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

impl DhcpOption {
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => Ok(Self::SubnetMask(single_ipv4("subnet mask", data)?)),
            Ok(OptionCode::Router) => Ok(Self::Router(ipv4_list("router", data)?)),
            Ok(OptionCode::DnsServer) => Ok(Self::DnsServer(ipv4_list("DNS server", data)?)),
            Ok(OptionCode::DomainName) => {
                Ok(Self::DomainName(String::from_utf8_lossy(data).to_string()))
            }
            Ok(OptionCode::RequestedIpAddress) => Ok(Self::RequestedIpAddress(single_ipv4(
                "requested IP address",
                data,
            )?)),
            Ok(OptionCode::LeaseTime) => Ok(Self::LeaseTime(u32_be("lease time", data)?)),
            Ok(OptionCode::OptionOverload) => {
                if data.len() != 1 {
                    return Err(Error::InvalidPacket(
                        "Invalid option overload length".to_string(),
                    ));
                }
                Ok(Self::OptionOverload(data[0]))
            }
            Ok(OptionCode::MessageType) => {
                if data.len() != 1 {
                    return Err(Error::InvalidPacket(
                        "Invalid message type length".to_string(),
                    ));
                }
                let msg_type = MessageType::try_from(data[0]).map_err(|value| {
                    Error::InvalidPacket(format!("Unknown message type: {}", value))
                })?;
                Ok(Self::MessageType(msg_type))
            }
            Ok(OptionCode::ServerIdentifier) => Ok(Self::ServerIdentifier(single_ipv4(
                "server identifier",
                data,
            )?)),
            Ok(OptionCode::ParameterRequestList) => Ok(Self::ParameterRequestList(data.to_vec())),
            Ok(OptionCode::Message) => Ok(Self::Message(String::from_utf8_lossy(data).to_string())),
            Ok(OptionCode::MaxMessageSize) => {
                if data.len() != 2 {
                    return Err(Error::InvalidPacket(
                        "Invalid max message size length".to_string(),
                    ));
                }
                Ok(Self::MaxMessageSize(u16::from_be_bytes([data[0], data[1]])))
            }
            Ok(OptionCode::RenewalTime) => Ok(Self::RenewalTime(u32_be("renewal time", data)?)),
            Ok(OptionCode::RebindingTime) => {
                Ok(Self::RebindingTime(u32_be("rebinding time", data)?))
            }
            Ok(OptionCode::ClassIdentifier) => Ok(Self::ClassIdentifier(data.to_vec())),
            Ok(OptionCode::ClientIdentifier) => Ok(Self::ClientIdentifier(data.to_vec())),
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => Err(Error::InvalidPacket(
                "Pad/End should not be parsed as options".to_string(),
            )),
            Err(unknown_code) => Ok(Self::Unknown(unknown_code, data.to_vec())),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask as u8,
            Self::Router(_) => OptionCode::Router as u8,
            Self::DnsServer(_) => OptionCode::DnsServer as u8,
            Self::DomainName(_) => OptionCode::DomainName as u8,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress as u8,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u8,
            Self::OptionOverload(_) => OptionCode::OptionOverload as u8,
            Self::MessageType(_) => OptionCode::MessageType as u8,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u8,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList as u8,
            Self::Message(_) => OptionCode::Message as u8,
            Self::MaxMessageSize(_) => OptionCode::MaxMessageSize as u8,
            Self::RenewalTime(_) => OptionCode::RenewalTime as u8,
            Self::RebindingTime(_) => OptionCode::RebindingTime as u8,
            Self::ClassIdentifier(_) => OptionCode::ClassIdentifier as u8,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier as u8,
            Self::Unknown(code, _) => *code,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        fn tlv(code: u8, payload: &[u8]) -> Vec<u8> {
            let mut result = vec![code, payload.len() as u8];
            result.extend_from_slice(payload);
            result
        }

        match self {
            Self::SubnetMask(addr) => tlv(self.code(), &addr.octets()),
            Self::Router(addrs) | Self::DnsServer(addrs) => {
                let mut payload = Vec::with_capacity(addrs.len() * 4);
                for addr in addrs {
                    payload.extend_from_slice(&addr.octets());
                }
                tlv(self.code(), &payload)
            }
            Self::DomainName(name) | Self::Message(name) => tlv(self.code(), name.as_bytes()),
            Self::RequestedIpAddress(addr) | Self::ServerIdentifier(addr) => {
                tlv(self.code(), &addr.octets())
            }
            Self::LeaseTime(secs) | Self::RenewalTime(secs) | Self::RebindingTime(secs) => {
                tlv(self.code(), &secs.to_be_bytes())
            }
            Self::OptionOverload(value) => tlv(self.code(), &[*value]),
            Self::MessageType(msg_type) => tlv(self.code(), &[*msg_type as u8]),
            Self::ParameterRequestList(params) => tlv(self.code(), params),
            Self::MaxMessageSize(size) => tlv(self.code(), &size.to_be_bytes()),
            Self::ClassIdentifier(data) | Self::ClientIdentifier(data) => tlv(self.code(), data),
            Self::Unknown(code, data) => tlv(*code, data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for value in 1..=8u8 {
            let msg_type = MessageType::try_from(value).unwrap();
            assert_eq!(msg_type as u8, value);
        }
    }

    #[test]
    fn test_option_encode_decode() {
        let original = DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0));
        let encoded = original.encode();
        assert_eq!(encoded, vec![1, 4, 255, 255, 255, 0]);

        let decoded = DhcpOption::parse(1, &[255, 255, 255, 0]).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_lease_time_encoding() {
        let option = DhcpOption::LeaseTime(86400);
        let encoded = option.encode();
        assert_eq!(encoded.len(), 6);
        assert_eq!(encoded[0], 51);
        assert_eq!(encoded[1], 4);

        let decoded = DhcpOption::parse(51, &encoded[2..]).unwrap();
        assert_eq!(decoded, DhcpOption::LeaseTime(86400));
    }

    #[test]
    fn test_dns_list_rejects_partial_address() {
        assert!(DhcpOption::parse(6, &[8, 8, 8]).is_err());
        assert!(DhcpOption::parse(6, &[]).is_err());

        let decoded = DhcpOption::parse(6, &[8, 8, 8, 8, 8, 8, 4, 4]).unwrap();
        assert_eq!(
            decoded,
            DhcpOption::DnsServer(vec![
                Ipv4Addr::new(8, 8, 8, 8),
                Ipv4Addr::new(8, 8, 4, 4)
            ])
        );
    }

    #[test]
    fn test_unknown_code_keeps_payload() {
        let decoded = DhcpOption::parse(66, &[1, 2, 3]).unwrap();
        assert_eq!(decoded, DhcpOption::Unknown(66, vec![1, 2, 3]));
        assert_eq!(decoded.encode(), vec![66, 3, 1, 2, 3]);
    }
}
