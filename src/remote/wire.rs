//! The fixed eight-byte message header and its framing rules.
//!
//! Every message on the wire starts with `magic, version, flags, command` followed by a 32-bit
//!  payload length. Bit 7 of the flags byte announces the byte order of the length field and of
//!  everything in the payload; the four leading bytes are endianness-agnostic.

use std::net::{IpAddr, SocketAddr};

use anyhow::bail;

use crate::remote::buffer::{ByteOrder, WireBuf};
use crate::util::safe_converter::PrecheckedCast;

pub const CA_MAGIC: u8 = 0xCA;
pub const CA_VERSION: u8 = 1;
pub const CA_BIG_ENDIAN_FLAG: u8 = 0x80;
pub const CA_MESSAGE_HEADER_SIZE: usize = 8;
pub const CA_DEFAULT_PRIORITY: u16 = 0;

/// the largest payload a single UDP datagram can carry over IPv4
pub const MAX_UDP_PACKET: usize = 65_507;

pub const CMD_BEACON: u8 = 0;
pub const CMD_CONNECTION_VALIDATION: u8 = 1;
pub const CMD_ECHO: u8 = 2;
/// commands `[3, HANDLER_TABLE_LENGTH)` are reserved; anything at or above the table length is
///  rejected outright
pub const HANDLER_TABLE_LENGTH: u8 = 28;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PvaHeader {
    pub version: u8,
    pub flags: u8,
    pub command: u8,
    pub payload_size: u32,
}

impl PvaHeader {
    /// Parses a header off the buffer's current position. As a side effect the buffer's byte
    ///  order is switched to the one announced in the flags byte, so that both the payload
    ///  length below and all payload reads by the handler see the sender's byte order.
    ///
    /// A wrong magic byte is a hard framing failure: the rest of the datagram cannot be trusted
    ///  and must be discarded by the caller.
    pub fn try_read(buf: &mut WireBuf) -> anyhow::Result<PvaHeader> {
        let magic = buf.try_get_u8()?;
        let version = buf.try_get_u8()?;
        if magic != CA_MAGIC {
            bail!("bad magic 0x{:02x}, expected 0x{:02x}", magic, CA_MAGIC);
        }

        let flags = buf.try_get_u8()?;
        if flags & CA_BIG_ENDIAN_FLAG != 0 {
            buf.set_byte_order(ByteOrder::BigEndian);
        }
        else {
            buf.set_byte_order(ByteOrder::LittleEndian);
        }

        let command = buf.try_get_u8()?;
        let payload_size = buf.try_get_u32()?;

        Ok(PvaHeader {
            version,
            flags,
            command,
            payload_size,
        })
    }
}

/// the flags byte a locally marshalled message carries: announce the host's own byte order so
///  that payload writes need no swapping
pub fn host_flags() -> u8 {
    match ByteOrder::host() {
        ByteOrder::BigEndian => CA_BIG_ENDIAN_FLAG,
        ByteOrder::LittleEndian => 0x00,
    }
}

/// Writes a message header with a zero placeholder length, returning the message's start
///  position for the matching [end_message] call.
pub fn start_message(buf: &mut WireBuf, command: u8) -> usize {
    let message_start = buf.position();
    buf.put_u8(CA_MAGIC);
    buf.put_u8(CA_VERSION);
    buf.put_u8(host_flags());
    buf.put_u8(command);
    buf.put_u32(0);
    message_start
}

/// Back-patches the length field of the message started at `message_start` with the number of
///  payload bytes written since. Datagram transports emit no alignment padding.
pub fn end_message(buf: &mut WireBuf, message_start: usize) {
    let payload_size = buf.position() - message_start - CA_MESSAGE_HEADER_SIZE;
    buf.put_u32_at(message_start + 4, payload_size.prechecked_cast());
}

/// The 16-byte IPv6 form of an address, with IPv4 mapped as `::ffff:a.b.c.d`. Address bytes go
///  out in network order regardless of the message's byte order.
pub fn encode_as_ipv6(buf: &mut WireBuf, addr: &SocketAddr) {
    let v6 = match addr.ip() {
        IpAddr::V4(ip) => ip.to_ipv6_mapped(),
        IpAddr::V6(ip) => ip,
    };
    buf.put_slice(&v6.octets());
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::le(b"\xCA\x01\x00\x02\x0A\x00\x00\x00" as &[u8],
               PvaHeader { version: 1, flags: 0x00, command: 2, payload_size: 10 },
               ByteOrder::LittleEndian)]
    #[case::be(b"\xCA\x01\x80\x01\x00\x00\x00\x0A" as &[u8],
               PvaHeader { version: 1, flags: 0x80, command: 1, payload_size: 10 },
               ByteOrder::BigEndian)]
    #[case::big_payload_le(b"\xCA\x05\x00\x00\xEF\xBE\xAD\xDE" as &[u8],
               PvaHeader { version: 5, flags: 0x00, command: 0, payload_size: 0xDEADBEEF },
               ByteOrder::LittleEndian)]
    fn test_header_try_read(#[case] raw: &[u8], #[case] expected: PvaHeader, #[case] expected_order: ByteOrder) {
        let mut buf = WireBuf::new(64);
        buf.put_slice(raw);
        buf.flip();

        let header = PvaHeader::try_read(&mut buf).unwrap();
        assert_eq!(header, expected);
        assert_eq!(buf.byte_order(), expected_order);
        assert_eq!(buf.position(), CA_MESSAGE_HEADER_SIZE);
    }

    #[rstest]
    #[case::bad_magic(b"\xAB\x01\x00\x02\x00\x00\x00\x00" as &[u8])]
    #[case::truncated(b"\xCA\x01\x00" as &[u8])]
    #[case::empty(b"" as &[u8])]
    fn test_header_try_read_error(#[case] raw: &[u8]) {
        let mut buf = WireBuf::new(64);
        buf.put_slice(raw);
        buf.flip();
        assert!(PvaHeader::try_read(&mut buf).is_err());
    }

    #[test]
    fn test_start_end_message_round_trip() {
        let mut buf = WireBuf::new(128);
        let start = start_message(&mut buf, CMD_BEACON);
        assert_eq!(start, 0);
        buf.put_slice(&[0xAB; 20]);
        end_message(&mut buf, start);

        buf.flip();
        let header = PvaHeader::try_read(&mut buf).unwrap();
        assert_eq!(header.command, CMD_BEACON);
        assert_eq!(header.version, CA_VERSION);
        assert_eq!(header.flags, host_flags());
        assert_eq!(header.payload_size, 20);
        assert_eq!(buf.remaining(), 20);
    }

    #[test]
    fn test_end_message_patches_length_slot_only() {
        let mut buf = WireBuf::new(128);
        buf.put_slice(b"prefix");
        let start = start_message(&mut buf, CMD_ECHO);
        assert_eq!(start, 6);
        buf.put_slice(b"xyz");
        let position_after_payload = buf.position();
        end_message(&mut buf, start);

        assert_eq!(buf.position(), position_after_payload);
        buf.flip();
        buf.set_position(start + 4);
        assert_eq!(buf.try_get_u32().unwrap(), 3);
    }

    #[test]
    fn test_empty_message_has_zero_length() {
        let mut buf = WireBuf::new(64);
        let start = start_message(&mut buf, CMD_ECHO);
        end_message(&mut buf, start);

        buf.flip();
        let header = PvaHeader::try_read(&mut buf).unwrap();
        assert_eq!(header.payload_size, 0);
        assert_eq!(buf.remaining(), 0);
    }

    #[rstest]
    #[case::v4("192.0.2.5:45678",
               [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 192, 0, 2, 5])]
    #[case::v6("[2001:db8::17]:5075",
               [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x17])]
    fn test_encode_as_ipv6(#[case] addr: &str, #[case] expected: [u8; 16]) {
        let addr = SocketAddr::from_str(addr).unwrap();
        let mut buf = WireBuf::new(64);
        encode_as_ipv6(&mut buf, &addr);
        buf.flip();
        assert_eq!(buf.remaining_slice(), &expected);
    }
}
