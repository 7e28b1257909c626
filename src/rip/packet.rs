// RIP packet encoding and decoding

use std::net::Ipv4Addr;

use crate::error::PacketError;

/// Header: command, version, two zero bytes
pub const HEADER_LEN: usize = 4;
/// One route entry on the wire
pub const ENTRY_LEN: usize = 20;
/// Entries per packet, authentication included
pub const MAX_ENTRIES: usize = 25;
pub const MAX_PACKET_LEN: usize = HEADER_LEN + MAX_ENTRIES * ENTRY_LEN;

pub const RIP_AF_UNSPEC: u16 = 0;
pub const RIP_AF_INET: u16 = 2;
pub const RIP_AF_AUTH: u16 = 0xffff;
pub const RIP_AUTH_PW: u16 = 2;
pub const PASSWORD_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RipCommand {
    Request = 1,
    Response = 2,
    TraceOn = 3,
    TraceOff = 4,
}

impl TryFrom<u8> for RipCommand {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RipCommand::Request),
            2 => Ok(RipCommand::Response),
            3 => Ok(RipCommand::TraceOn),
            4 => Ok(RipCommand::TraceOff),
            other => Err(PacketError::BadCommand(other)),
        }
    }
}

/// RIP route entry, fields as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetEntry {
    pub family: u16,
    pub tag: u16,
    pub dst: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub nhop: Ipv4Addr,
    pub metric: u32,
}

impl NetEntry {
    pub fn route(dst: Ipv4Addr, mask: Ipv4Addr, nhop: Ipv4Addr, metric: u32, tag: u16) -> Self {
        NetEntry {
            family: RIP_AF_INET,
            tag,
            dst,
            mask,
            nhop,
            metric,
        }
    }

    /// The single entry of a request for the whole table
    pub fn whole_table() -> Self {
        NetEntry {
            family: RIP_AF_UNSPEC,
            tag: 0,
            dst: Ipv4Addr::UNSPECIFIED,
            mask: Ipv4Addr::UNSPECIFIED,
            nhop: Ipv4Addr::UNSPECIFIED,
            metric: crate::routes::HOPCNT_INFINITY as u32,
        }
    }

    fn write(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.family.to_be_bytes());
        buffer.extend_from_slice(&self.tag.to_be_bytes());
        buffer.extend_from_slice(&self.dst.octets());
        buffer.extend_from_slice(&self.mask.octets());
        buffer.extend_from_slice(&self.nhop.octets());
        buffer.extend_from_slice(&self.metric.to_be_bytes());
    }

    fn read(data: &[u8]) -> Self {
        let addr = |at: usize| Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3]);
        NetEntry {
            family: u16::from_be_bytes([data[0], data[1]]),
            tag: u16::from_be_bytes([data[2], data[3]]),
            dst: addr(4),
            mask: addr(8),
            nhop: addr(12),
            metric: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
        }
    }
}

/// Authentication entry; only the plaintext password type is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authentication {
    pub kind: u16,
    pub key: [u8; PASSWORD_LEN],
}

impl Authentication {
    /// Plaintext password, truncated or zero padded to 16 bytes
    pub fn password(password: &str) -> Self {
        let mut key = [0u8; PASSWORD_LEN];
        for (dst, src) in key.iter_mut().zip(password.bytes()) {
            *dst = src;
        }
        Authentication {
            kind: RIP_AUTH_PW,
            key,
        }
    }

    fn write(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&RIP_AF_AUTH.to_be_bytes());
        buffer.extend_from_slice(&self.kind.to_be_bytes());
        buffer.extend_from_slice(&self.key);
    }

    fn read(data: &[u8]) -> Self {
        let mut key = [0u8; PASSWORD_LEN];
        key.copy_from_slice(&data[4..ENTRY_LEN]);
        Authentication {
            kind: u16::from_be_bytes([data[2], data[3]]),
            key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RipPacket {
    pub command: RipCommand,
    pub version: u8,
    pub auth: Option<Authentication>,
    pub entries: Vec<NetEntry>,
}

impl RipPacket {
    pub fn new(command: RipCommand, version: u8) -> Self {
        RipPacket {
            command,
            version,
            auth: None,
            entries: Vec::new(),
        }
    }

    /// Request for everything the neighbour knows
    pub fn whole_table_request(version: u8) -> Self {
        RipPacket {
            entries: vec![NetEntry::whole_table()],
            ..RipPacket::new(RipCommand::Request, version)
        }
    }

    /// Whether this request asks for the whole table
    pub fn is_whole_table_request(&self) -> bool {
        self.command == RipCommand::Request
            && self.entries.len() == 1
            && self.entries[0].family == RIP_AF_UNSPEC
            && self.entries[0].metric == crate::routes::HOPCNT_INFINITY as u32
    }

    /// Entries that still fit after the authentication entry
    pub fn capacity(&self) -> usize {
        MAX_ENTRIES - usize::from(self.auth.is_some())
    }

    /// Serialize packet to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(HEADER_LEN + (self.entries.len() + 1) * ENTRY_LEN);
        buffer.push(self.command as u8);
        buffer.push(self.version);
        buffer.extend_from_slice(&[0, 0]);
        if let Some(auth) = &self.auth {
            auth.write(&mut buffer);
        }
        for entry in &self.entries {
            entry.write(&mut buffer);
        }
        buffer
    }

    /// Parse packet from bytes. A trailing partial entry spoils the packet.
    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_LEN {
            return Err(PacketError::Truncated(data.len()));
        }
        if data.len() > MAX_PACKET_LEN {
            return Err(PacketError::TooLarge(data.len()));
        }
        if (data.len() - HEADER_LEN) % ENTRY_LEN != 0 {
            return Err(PacketError::Truncated(data.len()));
        }

        let command = RipCommand::try_from(data[0])?;
        let version = data[1];
        if version != 1 && version != 2 {
            return Err(PacketError::BadVersion(version));
        }

        let mut packet = RipPacket::new(command, version);
        for chunk in data[HEADER_LEN..].chunks_exact(ENTRY_LEN) {
            let family = u16::from_be_bytes([chunk[0], chunk[1]]);
            if family == RIP_AF_AUTH {
                // only the first authentication entry counts
                if packet.auth.is_none() && packet.entries.is_empty() {
                    packet.auth = Some(Authentication::read(chunk));
                }
                continue;
            }
            packet.entries.push(NetEntry::read(chunk));
        }
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_response_layout() {
        let mut packet = RipPacket::new(RipCommand::Response, 2);
        packet.entries.push(NetEntry::route(
            ip("10.1.0.0"),
            ip("255.255.0.0"),
            ip("0.0.0.0"),
            3,
            7,
        ));
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN + ENTRY_LEN);
        assert_eq!(&bytes[..4], &[2, 2, 0, 0]);
        assert_eq!(&bytes[4..8], &[0, 2, 0, 7]);
        assert_eq!(&bytes[8..12], &[10, 1, 0, 0]);
        assert_eq!(&bytes[12..16], &[255, 255, 0, 0]);
        assert_eq!(&bytes[20..24], &[0, 0, 0, 3]);
        assert_eq!(RipPacket::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_whole_table_request() {
        let bytes = RipPacket::whole_table_request(2).to_bytes();
        let packet = RipPacket::from_bytes(&bytes).unwrap();
        assert!(packet.is_whole_table_request());
        assert_eq!(&bytes[20..24], &[0, 0, 0, 16]);
    }

    #[test]
    fn test_password_entry() {
        let mut packet = RipPacket::new(RipCommand::Response, 2);
        packet.auth = Some(Authentication::password("secret"));
        assert_eq!(packet.capacity(), MAX_ENTRIES - 1);
        let bytes = packet.to_bytes();
        assert_eq!(&bytes[4..8], &[0xff, 0xff, 0, 2]);
        assert_eq!(&bytes[8..14], b"secret");
        assert_eq!(bytes[14], 0);

        let parsed = RipPacket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.auth, Some(Authentication::password("secret")));
        assert!(parsed.entries.is_empty());
    }

    #[test]
    fn test_partial_entry_truncated() {
        let mut bytes = RipPacket::whole_table_request(2).to_bytes();
        bytes.extend_from_slice(&[0, 2, 0]);
        assert_eq!(
            RipPacket::from_bytes(&bytes),
            Err(PacketError::Truncated(bytes.len()))
        );
        assert_eq!(RipPacket::from_bytes(&[2, 2]), Err(PacketError::Truncated(2)));
    }

    #[test]
    fn test_bad_header() {
        let mut bytes = RipPacket::whole_table_request(2).to_bytes();
        bytes[0] = 9;
        assert_eq!(RipPacket::from_bytes(&bytes), Err(PacketError::BadCommand(9)));
        bytes[0] = 1;
        bytes[1] = 0;
        assert_eq!(RipPacket::from_bytes(&bytes), Err(PacketError::BadVersion(0)));
        let huge = vec![0u8; MAX_PACKET_LEN + ENTRY_LEN];
        assert_eq!(
            RipPacket::from_bytes(&huge),
            Err(PacketError::TooLarge(huge.len()))
        );
    }
}
