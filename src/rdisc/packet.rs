// ICMP router discovery messages (RFC 1256)

use std::net::Ipv4Addr;

use crate::error::PacketError;

pub const ICMP_ROUTERADVERT: u8 = 9;
pub const ICMP_ROUTERSOLICIT: u8 = 10;

/// Type, code, checksum and the four type-specific bytes
pub const ICMP_HEADER_LEN: usize = 8;
/// Words per (address, preference) pair
pub const ADDR_SIZE: u8 = 2;
const ADDR_ENTRY_LEN: usize = ADDR_SIZE as usize * 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterAdvert {
    /// Seconds the addresses stay valid; zero withdraws them
    pub lifetime: u16,
    /// Router addresses and their preferences as signed on the wire
    pub addrs: Vec<(Ipv4Addr, i32)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RdiscPacket {
    Advert(RouterAdvert),
    Solicit,
}

/// Internet checksum over `data`
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum += u32::from(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

impl RdiscPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(ICMP_HEADER_LEN);
        match self {
            RdiscPacket::Advert(advert) => {
                buffer.push(ICMP_ROUTERADVERT);
                buffer.push(0);
                buffer.extend_from_slice(&[0, 0]);
                buffer.push(advert.addrs.len() as u8);
                buffer.push(ADDR_SIZE);
                buffer.extend_from_slice(&advert.lifetime.to_be_bytes());
                for (addr, pref) in &advert.addrs {
                    buffer.extend_from_slice(&addr.octets());
                    buffer.extend_from_slice(&pref.to_be_bytes());
                }
            }
            RdiscPacket::Solicit => {
                buffer.push(ICMP_ROUTERSOLICIT);
                buffer.push(0);
                buffer.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
            }
        }
        let sum = checksum(&buffer);
        buffer[2..4].copy_from_slice(&sum.to_be_bytes());
        buffer
    }

    /// Parse an ICMP message, checksum included
    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < ICMP_HEADER_LEN {
            return Err(PacketError::Truncated(data.len()));
        }
        if checksum(data) != 0 {
            return Err(PacketError::BadChecksum);
        }
        let (kind, code) = (data[0], data[1]);
        if code != 0 {
            return Err(PacketError::BadIcmpType(kind, code));
        }
        match kind {
            ICMP_ROUTERSOLICIT => Ok(RdiscPacket::Solicit),
            ICMP_ROUTERADVERT => {
                let count = usize::from(data[4]);
                if data[5] != ADDR_SIZE {
                    return Err(PacketError::BadAdvertisement(format!(
                        "address size {}",
                        data[5]
                    )));
                }
                if count == 0 {
                    return Err(PacketError::BadAdvertisement("no addresses".to_string()));
                }
                if data.len() < ICMP_HEADER_LEN + count * ADDR_ENTRY_LEN {
                    return Err(PacketError::Truncated(data.len()));
                }
                let lifetime = u16::from_be_bytes([data[6], data[7]]);
                let addrs = data[ICMP_HEADER_LEN..]
                    .chunks_exact(ADDR_ENTRY_LEN)
                    .take(count)
                    .map(|c| {
                        (
                            Ipv4Addr::new(c[0], c[1], c[2], c[3]),
                            i32::from_be_bytes([c[4], c[5], c[6], c[7]]),
                        )
                    })
                    .collect();
                Ok(RdiscPacket::Advert(RouterAdvert { lifetime, addrs }))
            }
            other => Err(PacketError::BadIcmpType(other, code)),
        }
    }

    /// Parse what a raw ICMP socket returns: the IP header, then the message.
    /// Returns the IP source address with the message.
    pub fn from_datagram(data: &[u8]) -> Result<(Ipv4Addr, Self), PacketError> {
        if data.len() < 20 {
            return Err(PacketError::Truncated(data.len()));
        }
        let ihl = usize::from(data[0] & 0x0f) * 4;
        if ihl < 20 || data.len() < ihl {
            return Err(PacketError::Truncated(data.len()));
        }
        let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        Ok((src, RdiscPacket::from_bytes(&data[ihl..])?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advert_layout_and_checksum() {
        let packet = RdiscPacket::Advert(RouterAdvert {
            lifetime: 1800,
            addrs: vec![("192.168.1.1".parse().unwrap(), 0)],
        });
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..2], &[9, 0]);
        assert_eq!(&bytes[4..8], &[1, 2, 0x07, 0x08]);
        assert_eq!(&bytes[8..12], &[192, 168, 1, 1]);
        assert_eq!(checksum(&bytes), 0);
        assert_eq!(RdiscPacket::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_solicit() {
        let bytes = RdiscPacket::Solicit.to_bytes();
        assert_eq!(bytes.len(), ICMP_HEADER_LEN);
        assert_eq!(RdiscPacket::from_bytes(&bytes).unwrap(), RdiscPacket::Solicit);
    }

    #[test]
    fn test_corrupt_messages() {
        let mut bytes = RdiscPacket::Solicit.to_bytes();
        bytes[4] = 1;
        assert_eq!(RdiscPacket::from_bytes(&bytes), Err(PacketError::BadChecksum));

        let mut echo = vec![8, 0, 0, 0, 0, 0, 0, 0];
        let sum = checksum(&echo);
        echo[2..4].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(RdiscPacket::from_bytes(&echo), Err(PacketError::BadIcmpType(8, 0)));

        let mut bytes = RdiscPacket::Advert(RouterAdvert {
            lifetime: 30,
            addrs: vec![("10.0.0.1".parse().unwrap(), 5)],
        })
        .to_bytes();
        bytes.truncate(12);
        assert!(RdiscPacket::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_datagram_strips_ip_header() {
        let mut datagram = vec![0u8; 20];
        datagram[0] = 0x45;
        datagram[12..16].copy_from_slice(&[10, 0, 0, 9]);
        datagram.extend_from_slice(&RdiscPacket::Solicit.to_bytes());
        let (src, packet) = RdiscPacket::from_datagram(&datagram).unwrap();
        assert_eq!(src, Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(packet, RdiscPacket::Solicit);
    }
}
