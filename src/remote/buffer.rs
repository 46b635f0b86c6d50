//! A fixed-capacity wire buffer with explicit position, limit and byte order.
//!
//! The protocol negotiates endianness per message (flags bit 7 of the header), so reads and
//!  writes of multi-byte integers go through this buffer's current [ByteOrder] rather than
//!  through a statically chosen one. Its salient points are:
//!
//! * backed by a fixed-length, pre-allocated buffer - no reallocation on the receive path
//! * position / limit semantics: writes fill `[position, limit)`, [WireBuf::flip] turns the
//!    written range into the readable range
//! * absolute writes for back-patching a message's length field after its payload is written
//! * implements `BufMut` to fit into the `bytes` ecosystem

use std::fmt::{Debug, Formatter};
use bytes::buf::UninitSlice;
use anyhow::bail;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}
impl ByteOrder {
    /// the byte order of the machine this code runs on
    pub fn host() -> ByteOrder {
        if cfg!(target_endian = "big") {
            ByteOrder::BigEndian
        }
        else {
            ByteOrder::LittleEndian
        }
    }
}

#[derive(Eq)]
pub struct WireBuf {
    buf: Vec<u8>,
    position: usize,
    limit: usize,
    byte_order: ByteOrder,
}

impl WireBuf {
    pub fn new(capacity: usize) -> WireBuf {
        WireBuf {
            // buffers are reused aggressively, so we trade the overhead of initial
            //  zero-initialization for simplicity
            buf: vec![0; capacity],
            position: 0,
            limit: capacity,
            byte_order: ByteOrder::host(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// NB: seeking backwards is allowed - the receive path rewinds to a message boundary after
    ///  a handler returns, regardless of how much the handler actually consumed
    pub fn set_position(&mut self, position: usize) {
        assert!(position <= self.limit);
        self.position = position;
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn set_byte_order(&mut self, byte_order: ByteOrder) {
        self.byte_order = byte_order;
    }

    /// reset to a writable, empty state; the byte order reverts to the host's so that a
    ///  previously parsed big-endian message cannot leak into the next marshalled one
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.buf.len();
        self.byte_order = ByteOrder::host();
    }

    /// switch from writing to reading: the written range becomes the readable range
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// the entire backing storage, for `recv_from` to fill
    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// the readable range `[position, limit)`
    pub fn remaining_slice(&self) -> &[u8] {
        &self.buf[self.position..self.limit]
    }

    pub fn ensure_remaining(&self, n: usize) -> anyhow::Result<()> {
        if self.remaining() < n {
            bail!("buffer underflow: need {} bytes but only {} remaining", n, self.remaining());
        }
        Ok(())
    }

    pub fn try_get_u8(&mut self) -> anyhow::Result<u8> {
        self.ensure_remaining(1)?;
        let value = self.buf[self.position];
        self.position += 1;
        Ok(value)
    }

    pub fn try_get_u16(&mut self) -> anyhow::Result<u16> {
        let bytes = self.get_array::<2>("u16")?;
        Ok(match self.byte_order {
            ByteOrder::LittleEndian => u16::from_le_bytes(bytes),
            ByteOrder::BigEndian => u16::from_be_bytes(bytes),
        })
    }

    pub fn try_get_i16(&mut self) -> anyhow::Result<i16> {
        Ok(self.try_get_u16()? as i16)
    }

    pub fn try_get_u32(&mut self) -> anyhow::Result<u32> {
        let bytes = self.get_array::<4>("u32")?;
        Ok(match self.byte_order {
            ByteOrder::LittleEndian => u32::from_le_bytes(bytes),
            ByteOrder::BigEndian => u32::from_be_bytes(bytes),
        })
    }

    pub fn try_get_i32(&mut self) -> anyhow::Result<i32> {
        Ok(self.try_get_u32()? as i32)
    }

    pub fn try_get_u64(&mut self) -> anyhow::Result<u64> {
        let bytes = self.get_array::<8>("u64")?;
        Ok(match self.byte_order {
            ByteOrder::LittleEndian => u64::from_le_bytes(bytes),
            ByteOrder::BigEndian => u64::from_be_bytes(bytes),
        })
    }

    pub fn try_get_i64(&mut self) -> anyhow::Result<i64> {
        Ok(self.try_get_u64()? as i64)
    }

    fn get_array<const N: usize>(&mut self, what: &str) -> anyhow::Result<[u8; N]> {
        if self.remaining() < N {
            bail!("buffer underflow reading {}: {} bytes remaining", what, self.remaining());
        }
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.buf[self.position..self.position + N]);
        self.position += N;
        Ok(bytes)
    }

    pub fn put_u8(&mut self, value: u8) {
        assert!(self.position < self.limit);
        self.buf[self.position] = value;
        self.position += 1;
    }

    pub fn put_u16(&mut self, value: u16) {
        self.put_bytes_ordered(&value.to_le_bytes(), &value.to_be_bytes());
    }

    pub fn put_i16(&mut self, value: i16) {
        self.put_u16(value as u16);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.put_bytes_ordered(&value.to_le_bytes(), &value.to_be_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.put_u32(value as u32);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.put_bytes_ordered(&value.to_le_bytes(), &value.to_be_bytes());
    }

    pub fn put_i64(&mut self, value: i64) {
        self.put_u64(value as u64);
    }

    pub fn put_slice(&mut self, data: &[u8]) {
        assert!(self.position + data.len() <= self.limit);
        self.buf[self.position..self.position + data.len()].copy_from_slice(data);
        self.position += data.len();
    }

    /// absolute write that does not move the position - this is how a message's length field
    ///  is patched once the payload size is known
    pub fn put_u32_at(&mut self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.buf.len());
        let bytes = match self.byte_order {
            ByteOrder::LittleEndian => value.to_le_bytes(),
            ByteOrder::BigEndian => value.to_be_bytes(),
        };
        self.buf[offset..offset + 4].copy_from_slice(&bytes);
    }

    fn put_bytes_ordered(&mut self, le: &[u8], be: &[u8]) {
        match self.byte_order {
            ByteOrder::LittleEndian => self.put_slice(le),
            ByteOrder::BigEndian => self.put_slice(be),
        }
    }
}

impl PartialEq for WireBuf {
    fn eq(&self, other: &Self) -> bool {
        self.remaining_slice().eq(other.remaining_slice())
    }
}

impl Debug for WireBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.remaining_slice().fmt(f)
    }
}

unsafe impl bytes::BufMut for WireBuf {
    fn remaining_mut(&self) -> usize {
        self.limit - self.position
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.position + cnt <= self.limit);
        self.position += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.position..self.limit])
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use rstest::rstest;
    use super::*;

    fn buf_with(capacity: usize, content: &[u8]) -> WireBuf {
        let mut buf = WireBuf::new(capacity);
        buf.put_slice(content);
        buf
    }

    #[test]
    fn test_new() {
        let buf = WireBuf::new(100);
        assert_eq!(buf.position(), 0);
        assert_eq!(WireBuf::limit(&buf), 100);
        assert_eq!(buf.capacity(), 100);
        assert_eq!(buf.remaining(), 100);
        assert_eq!(buf.byte_order(), ByteOrder::host());
    }

    #[test]
    fn test_flip_and_clear() {
        let mut buf = buf_with(100, b"abc");
        assert_eq!(buf.position(), 3);

        buf.flip();
        assert_eq!(buf.position(), 0);
        assert_eq!(WireBuf::limit(&buf), 3);
        assert_eq!(buf.remaining_slice(), b"abc");

        buf.set_byte_order(ByteOrder::BigEndian);
        buf.clear();
        assert_eq!(buf.position(), 0);
        assert_eq!(WireBuf::limit(&buf), 100);
        assert_eq!(buf.byte_order(), ByteOrder::host());
    }

    #[rstest]
    #[case::le(ByteOrder::LittleEndian, b"\x34\x12", 0x1234)]
    #[case::be(ByteOrder::BigEndian, b"\x12\x34", 0x1234)]
    fn test_get_u16(#[case] byte_order: ByteOrder, #[case] raw: &[u8], #[case] expected: u16) {
        let mut buf = buf_with(16, raw);
        buf.flip();
        buf.set_byte_order(byte_order);
        assert_eq!(buf.try_get_u16().unwrap(), expected);
        assert_eq!(buf.remaining(), 0);
    }

    #[rstest]
    #[case::le(ByteOrder::LittleEndian, b"\x78\x56\x34\x12", 0x12345678)]
    #[case::be(ByteOrder::BigEndian, b"\x12\x34\x56\x78", 0x12345678)]
    fn test_get_u32(#[case] byte_order: ByteOrder, #[case] raw: &[u8], #[case] expected: u32) {
        let mut buf = buf_with(16, raw);
        buf.flip();
        buf.set_byte_order(byte_order);
        assert_eq!(buf.try_get_u32().unwrap(), expected);
    }

    #[rstest]
    #[case::le(ByteOrder::LittleEndian)]
    #[case::be(ByteOrder::BigEndian)]
    fn test_put_get_round_trip(#[case] byte_order: ByteOrder) {
        let mut buf = WireBuf::new(64);
        buf.set_byte_order(byte_order);
        buf.put_u8(0xCA);
        buf.put_i16(-17);
        buf.put_u32(0xDEAD_BEEF);
        buf.put_i64(-1_234_567_890_123);

        buf.flip();
        buf.set_byte_order(byte_order);
        assert_eq!(buf.try_get_u8().unwrap(), 0xCA);
        assert_eq!(buf.try_get_i16().unwrap(), -17);
        assert_eq!(buf.try_get_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(buf.try_get_i64().unwrap(), -1_234_567_890_123);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_put_u32_at() {
        let mut buf = WireBuf::new(32);
        buf.set_byte_order(ByteOrder::LittleEndian);
        buf.put_slice(b"\0\0\0\0rest");
        buf.put_u32_at(0, 4);

        buf.flip();
        assert_eq!(buf.remaining_slice(), b"\x04\0\0\0rest");
        // the absolute write must not move the position
        assert_eq!(WireBuf::limit(&buf), 8);
    }

    #[rstest]
    #[case::exact(3, true)]
    #[case::less(2, true)]
    #[case::more(4, false)]
    fn test_ensure_remaining(#[case] n: usize, #[case] ok: bool) {
        let mut buf = buf_with(16, b"abc");
        buf.flip();
        assert_eq!(buf.ensure_remaining(n).is_ok(), ok);
    }

    #[test]
    fn test_get_underflow() {
        let mut buf = buf_with(16, b"ab");
        buf.flip();
        assert!(buf.try_get_u32().is_err());
        // a failed read must not consume anything
        assert_eq!(buf.remaining(), 2);
        assert_eq!(buf.try_get_u16().unwrap(), u16::from_le_bytes(*b"ab"));
    }

    #[test]
    fn test_set_position_rewind() {
        let mut buf = buf_with(16, b"abcdef");
        buf.flip();
        assert_eq!(buf.try_get_u8().unwrap(), b'a');
        buf.set_position(4);
        assert_eq!(buf.try_get_u8().unwrap(), b'e');
        buf.set_position(0);
        assert_eq!(buf.try_get_u8().unwrap(), b'a');
    }

    #[test]
    fn test_buf_mut_conformance() {
        let mut buf = WireBuf::new(100);
        BufMut::put_slice(&mut buf, b"hello");
        assert_eq!(buf.remaining_mut(), 95);

        let chunk = buf.chunk_mut();
        assert_eq!(chunk.len(), 95);
        chunk[..6].copy_from_slice(b" world");
        unsafe { buf.advance_mut(6); }

        buf.flip();
        assert_eq!(buf.remaining_slice(), b"hello world");
    }
}
