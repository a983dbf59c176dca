//! Byte-order aware readers and writers for the X11 wire format
//!
//! Every multi-byte field is read and written through these helpers so the
//! negotiated byte order of a client is applied in exactly one place.

use super::errors::ProtocolError;
use super::types::ByteOrder;
use super::{pad, padded_len};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Size of the fixed request header
pub const REQUEST_HEADER_LEN: usize = 4;

/// Size of the header when the BIG-REQUESTS extended length is in use
pub const BIG_REQUEST_HEADER_LEN: usize = 8;

/// A framed request, detached from the client's input buffer.
#[derive(Debug, Clone)]
pub struct Request {
    /// Major opcode (byte 0)
    pub major: u8,
    /// Opcode-specific byte (byte 1): minor opcode for extensions
    pub data: u8,
    /// Full sequence number of this request for its client
    pub sequence: u32,
    /// Everything after the (possibly extended) header
    pub body: Vec<u8>,
    /// Byte order of the issuing client
    pub byte_order: ByteOrder,
}

impl Request {
    /// Request length in bytes as a handler sees it: header plus body.
    ///
    /// For an extended-length request this excludes the extra length word,
    /// so size checks are identical for both framings.
    pub fn wire_len(&self) -> usize {
        self.body.len() + REQUEST_HEADER_LEN
    }

    /// Sequence number as carried in replies, events and errors
    pub fn wire_sequence(&self) -> u16 {
        self.sequence as u16
    }

    /// Cursor over the request body
    pub fn reader(&self) -> WireReader<'_> {
        WireReader::new(&self.body, self.byte_order)
    }

    /// The request must be exactly `len` bytes long, header included
    pub fn expect_len(&self, len: usize) -> Result<(), ProtocolError> {
        if self.wire_len() != len {
            return Err(ProtocolError::length());
        }
        Ok(())
    }

    /// The request must be at least `len` bytes long, header included
    pub fn expect_min_len(&self, len: usize) -> Result<(), ProtocolError> {
        if self.wire_len() < len {
            return Err(ProtocolError::length());
        }
        Ok(())
    }
}

/// Result of inspecting the front of an input buffer for a request frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader {
    /// Not enough bytes to know the request length yet
    Incomplete,
    /// A request of `total` bytes whose body starts at `header_len`
    Sized { total: usize, header_len: usize },
    /// Length field was zero but BIG-REQUESTS is not enabled
    ZeroLength,
}

/// Decode the framing header at the start of `buf`.
pub fn frame_header(buf: &[u8], order: ByteOrder, big_requests: bool) -> FrameHeader {
    if buf.len() < REQUEST_HEADER_LEN {
        return FrameHeader::Incomplete;
    }
    let mut reader = WireReader::new(&buf[2..], order);
    let units = reader.u16().unwrap_or(0) as usize;
    if units != 0 {
        return FrameHeader::Sized {
            total: units * 4,
            header_len: REQUEST_HEADER_LEN,
        };
    }
    if !big_requests {
        return FrameHeader::ZeroLength;
    }
    if buf.len() < BIG_REQUEST_HEADER_LEN {
        return FrameHeader::Incomplete;
    }
    let mut reader = WireReader::new(&buf[4..], order);
    let units = reader.u32().unwrap_or(0) as usize;
    FrameHeader::Sized {
        // the extended length counts the extra length word itself
        total: units.saturating_mul(4).max(BIG_REQUEST_HEADER_LEN),
        header_len: BIG_REQUEST_HEADER_LEN,
    }
}

/// Cursor over a request body.
///
/// Handlers validate the declared length with [`Request::expect_len`] before
/// reading; out-of-range reads still surface as `BadLength` rather than
/// panics.
pub struct WireReader<'a> {
    cursor: Cursor<&'a [u8]>,
    order: ByteOrder,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        WireReader {
            cursor: Cursor::new(buf),
            order,
        }
    }

    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    pub fn remaining(&self) -> usize {
        self.cursor.get_ref().len().saturating_sub(self.position())
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.cursor.read_u8().map_err(|_| ProtocolError::length())
    }

    pub fn bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        let value = match self.order {
            ByteOrder::LSBFirst => self.cursor.read_u16::<LittleEndian>(),
            ByteOrder::MSBFirst => self.cursor.read_u16::<BigEndian>(),
        };
        value.map_err(|_| ProtocolError::length())
    }

    pub fn i16(&mut self) -> Result<i16, ProtocolError> {
        let value = match self.order {
            ByteOrder::LSBFirst => self.cursor.read_i16::<LittleEndian>(),
            ByteOrder::MSBFirst => self.cursor.read_i16::<BigEndian>(),
        };
        value.map_err(|_| ProtocolError::length())
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        let value = match self.order {
            ByteOrder::LSBFirst => self.cursor.read_u32::<LittleEndian>(),
            ByteOrder::MSBFirst => self.cursor.read_u32::<BigEndian>(),
        };
        value.map_err(|_| ProtocolError::length())
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::length());
        }
        self.cursor.set_position((self.position() + n) as u64);
        Ok(())
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::length());
        }
        let start = self.position();
        let buf: &'a [u8] = *self.cursor.get_ref();
        self.cursor.set_position((start + n) as u64);
        Ok(&buf[start..start + n])
    }

    /// Read a STRING8 of `n` bytes and skip its padding
    pub fn string8(&mut self, n: usize) -> Result<String, ProtocolError> {
        let raw = self.bytes(n)?;
        let text = String::from_utf8_lossy(raw).into_owned();
        self.skip(pad(n).min(self.remaining()))?;
        Ok(text)
    }

    /// Decode a LISTofVALUE selected by `mask`.
    ///
    /// The remaining body must hold exactly one 32-bit word per set bit, and
    /// no bit above `last_bit` may be set.
    pub fn value_list(&mut self, mask: u32, last_bit: u32) -> Result<ValueList, ProtocolError> {
        if last_bit < 31 && mask >> (last_bit + 1) != 0 {
            return Err(ProtocolError::value(mask));
        }
        let count = mask.count_ones() as usize;
        if self.remaining() != count * 4 {
            return Err(ProtocolError::length());
        }
        let mut values = [None; 32];
        for (bit, slot) in values.iter_mut().enumerate() {
            if mask & (1 << bit) != 0 {
                *slot = Some(self.u32()?);
            }
        }
        Ok(ValueList { mask, values })
    }
}

/// Values from a masked value list, addressed by bit number
#[derive(Debug, Clone, Copy)]
pub struct ValueList {
    mask: u32,
    values: [Option<u32>; 32],
}

impl ValueList {
    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn get(&self, bit: u32) -> Option<u32> {
        self.values.get(bit as usize).copied().flatten()
    }
}

/// Growable output buffer writing in a fixed byte order
#[derive(Debug, Clone)]
pub struct WireWriter {
    buf: Vec<u8>,
    order: ByteOrder,
}

impl WireWriter {
    pub fn new(order: ByteOrder) -> Self {
        WireWriter {
            buf: Vec::with_capacity(32),
            order,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.u8(value as u8)
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        // writes into a Vec cannot fail
        let _ = match self.order {
            ByteOrder::LSBFirst => self.buf.write_u16::<LittleEndian>(value),
            ByteOrder::MSBFirst => self.buf.write_u16::<BigEndian>(value),
        };
        self
    }

    pub fn i16(&mut self, value: i16) -> &mut Self {
        self.u16(value as u16)
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        let _ = match self.order {
            ByteOrder::LSBFirst => self.buf.write_u32::<LittleEndian>(value),
            ByteOrder::MSBFirst => self.buf.write_u32::<BigEndian>(value),
        };
        self
    }

    pub fn zeros(&mut self, n: usize) -> &mut Self {
        self.buf.resize(self.buf.len() + n, 0);
        self
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    /// Write `data` followed by padding to a 4-byte boundary
    pub fn padded_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.bytes(data);
        self.zeros(pad(data.len()))
    }

    /// Pad the whole buffer to a 4-byte boundary
    pub fn align(&mut self) -> &mut Self {
        let target = padded_len(self.buf.len());
        self.buf.resize(target, 0);
        self
    }

    /// Overwrite a 16-bit field at `offset`
    pub fn put_u16_at(&mut self, offset: usize, value: u16) {
        let bytes = match self.order {
            ByteOrder::LSBFirst => value.to_le_bytes(),
            ByteOrder::MSBFirst => value.to_be_bytes(),
        };
        self.buf[offset..offset + 2].copy_from_slice(&bytes);
    }

    /// Overwrite a 32-bit field at `offset`
    pub fn put_u32_at(&mut self, offset: usize, value: u32) {
        let bytes = match self.order {
            ByteOrder::LSBFirst => value.to_le_bytes(),
            ByteOrder::MSBFirst => value.to_be_bytes(),
        };
        self.buf[offset..offset + 4].copy_from_slice(&bytes);
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Builder for a reply packet: 32-byte minimum with the length word patched
/// in on completion.
pub struct Reply {
    writer: WireWriter,
}

impl Reply {
    /// Start a reply; `data` is the byte following the reply type
    pub fn new(order: ByteOrder, sequence: u16, data: u8) -> Self {
        let mut writer = WireWriter::new(order);
        writer.u8(1).u8(data).u16(sequence).u32(0);
        Reply { writer }
    }

    pub fn body(&mut self) -> &mut WireWriter {
        &mut self.writer
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.writer.align();
        if self.writer.len() < 32 {
            let missing = 32 - self.writer.len();
            self.writer.zeros(missing);
        }
        let extra_units = ((self.writer.len() - 32) / 4) as u32;
        self.writer.put_u32_at(4, extra_units);
        self.writer.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_honours_byte_order() {
        let data = [0x12, 0x34, 0x56, 0x78];
        let mut le = WireReader::new(&data, ByteOrder::LSBFirst);
        assert_eq!(le.u32().unwrap(), 0x7856_3412);
        let mut be = WireReader::new(&data, ByteOrder::MSBFirst);
        assert_eq!(be.u16().unwrap(), 0x1234);
        assert_eq!(be.u16().unwrap(), 0x5678);
        assert!(be.u8().is_err());
    }

    #[test]
    fn test_value_list_requires_exact_length() {
        let mut writer = WireWriter::new(ByteOrder::LSBFirst);
        writer.u32(7).u32(9);
        let body = writer.into_inner();

        let mut reader = WireReader::new(&body, ByteOrder::LSBFirst);
        let values = reader.value_list(0b1010, 14).unwrap();
        assert_eq!(values.get(1), Some(7));
        assert_eq!(values.get(3), Some(9));
        assert_eq!(values.get(0), None);

        // one bit too many for the words present
        let mut reader = WireReader::new(&body, ByteOrder::LSBFirst);
        let err = reader.value_list(0b1011, 14).unwrap_err();
        assert_eq!(err, ProtocolError::length());

        // unknown bit
        let mut reader = WireReader::new(&body, ByteOrder::LSBFirst);
        assert!(reader.value_list(1 << 20 | 1, 14).is_err());
    }

    #[test]
    fn test_frame_header_big_requests() {
        let mut writer = WireWriter::new(ByteOrder::MSBFirst);
        writer.u8(1).u8(0).u16(0).u32(3).u32(0);
        let buf = writer.into_inner();

        assert_eq!(
            frame_header(&buf, ByteOrder::MSBFirst, false),
            FrameHeader::ZeroLength
        );
        assert_eq!(
            frame_header(&buf, ByteOrder::MSBFirst, true),
            FrameHeader::Sized {
                total: 12,
                header_len: BIG_REQUEST_HEADER_LEN
            }
        );
        assert_eq!(
            frame_header(&buf[..2], ByteOrder::MSBFirst, true),
            FrameHeader::Incomplete
        );
    }

    #[test]
    fn test_reply_is_padded_to_32_bytes() {
        let mut reply = Reply::new(ByteOrder::LSBFirst, 7, 0);
        reply.body().u32(0xdead_beef);
        let bytes = reply.finish();
        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[2..4], &7u16.to_le_bytes());
        assert_eq!(&bytes[4..8], &0u32.to_le_bytes());
    }
}
