//! Client session management
//!
//! This module provides the Client struct which represents an individual
//! client connection: its session state, negotiated byte order, request
//! sequence, and the input/output buffers the dispatcher works on.

use crate::connection::Connection;
use crate::protocol::wire::{frame_header, FrameHeader, REQUEST_HEADER_LEN};
use crate::protocol::{ByteOrder, ClientId, Request};
use std::fmt;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};

/// Queued output beyond which a client that is not reading gets disconnected
pub const MAX_OUTPUT_BUFFER: usize = 8 << 20;

/// Session state of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Accepted, waiting for the connection setup
    Initial,
    /// Setup received, authorization being checked
    Authenticating,
    /// Setup complete, requests are dispatched
    Running,
    /// Connection closed, resources kept by close-down mode
    Retained,
    /// Session over, slot free
    Gone,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Initial => "initial",
            ClientState::Authenticating => "authenticating",
            ClientState::Running => "running",
            ClientState::Retained => "retained",
            ClientState::Gone => "gone",
        };
        f.write_str(name)
    }
}

/// What survives a client's disconnection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseDownMode {
    #[default]
    DestroyAll = 0,
    RetainPermanent = 1,
    RetainTemporary = 2,
}

impl CloseDownMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CloseDownMode::DestroyAll),
            1 => Some(CloseDownMode::RetainPermanent),
            2 => Some(CloseDownMode::RetainTemporary),
            _ => None,
        }
    }
}

/// Next unit of work at the front of a client's input
#[derive(Debug)]
pub(crate) enum Frame {
    /// No complete request buffered
    NeedMore,
    /// A request that must be answered with BadLength without dispatch
    Rejected { major: u8, data: u8 },
    Request(Request),
}

/// Represents a connected X11 client
pub struct Client {
    id: ClientId,

    /// The network connection; dropped once the session is closed
    connection: Option<Connection>,

    state: ClientState,

    /// Byte order for this client (from setup request)
    byte_order: ByteOrder,

    trusted: bool,

    /// Sequence number of the last request read
    sequence: u32,

    /// Opcodes of the request being dispatched
    pub(crate) major_op: u8,
    pub(crate) minor_op: u16,

    pub(crate) close_down_mode: CloseDownMode,

    /// Connection already torn down; the client lingers only in retained state
    pub(crate) client_gone: bool,

    /// Extended request lengths enabled through BIG-REQUESTS
    pub(crate) big_requests: bool,

    input: Vec<u8>,
    output: Vec<u8>,

    /// Remaining bytes of a rejected request still to be discarded
    ignore_bytes: usize,

    /// Peer closed its end or the socket failed
    io_closed: bool,
}

impl Client {
    /// Create a new client session
    pub fn new(id: ClientId, connection: Connection) -> Self {
        Client {
            id,
            connection: Some(connection),
            state: ClientState::Initial,
            byte_order: ByteOrder::native(),
            trusted: true,
            sequence: 0,
            major_op: 0,
            minor_op: 0,
            close_down_mode: CloseDownMode::DestroyAll,
            client_gone: false,
            big_requests: false,
            input: Vec::new(),
            output: Vec::new(),
            ignore_bytes: 0,
            io_closed: false,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ClientState) {
        self.state = state;
    }

    /// Get the client's byte order
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    pub(crate) fn set_order(&mut self, byte_order: ByteOrder, trusted: bool) {
        self.byte_order = byte_order;
        self.trusted = trusted;
    }

    /// Get the current sequence number
    pub fn sequence_number(&self) -> u32 {
        self.sequence
    }

    pub fn close_down_mode(&self) -> CloseDownMode {
        self.close_down_mode
    }

    pub fn is_gone(&self) -> bool {
        self.client_gone
    }

    pub fn big_requests(&self) -> bool {
        self.big_requests
    }

    pub(crate) fn io_closed(&self) -> bool {
        self.io_closed
    }

    pub(crate) fn input(&self) -> &[u8] {
        &self.input
    }

    pub(crate) fn consume_input(&mut self, n: usize) {
        self.input.drain(..n.min(self.input.len()));
    }

    pub(crate) fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.connection.as_ref().map(|conn| conn.as_fd())
    }

    /// Pull everything readable from the socket into the input buffer
    pub(crate) fn fill_input(&mut self) -> io::Result<()> {
        if self.io_closed {
            return Ok(());
        }
        let Some(conn) = self.connection.as_mut() else {
            return Ok(());
        };
        match conn.read_available(&mut self.input) {
            Ok(eof) => {
                self.io_closed |= eof;
                Ok(())
            }
            Err(e) => {
                self.io_closed = true;
                Err(e)
            }
        }
    }

    /// Queue bytes for the client; dropped once the connection is gone.
    ///
    /// A client whose queue outgrows [`MAX_OUTPUT_BUFFER`] is treated as
    /// closed: pending input and output are discarded and the dispatcher
    /// closes it down on its next turn.
    pub fn send(&mut self, data: &[u8]) {
        if self.connection.is_none() || self.io_closed {
            return;
        }
        if self.output.len() + data.len() > MAX_OUTPUT_BUFFER {
            log::warn!(
                "{} is not reading its output ({} bytes queued), disconnecting",
                self.id,
                self.output.len()
            );
            self.io_closed = true;
            self.output.clear();
            self.input.clear();
            self.ignore_bytes = 0;
            return;
        }
        self.output.extend_from_slice(data);
    }

    pub(crate) fn has_pending_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Write as much queued output as the socket takes
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        let Some(conn) = self.connection.as_mut() else {
            self.output.clear();
            return Ok(());
        };
        if let Err(e) = conn.write_pending(&mut self.output) {
            self.io_closed = true;
            self.output.clear();
            return Err(e);
        }
        Ok(())
    }

    /// Flush what can be flushed and drop the connection
    pub(crate) fn close_connection(&mut self) {
        let _ = self.flush();
        self.connection = None;
        self.input.clear();
        self.output.clear();
        self.io_closed = true;
    }

    /// Whether a whole request (or a rejectable header) is buffered
    pub(crate) fn has_complete_request(&self, max_request_len: usize) -> bool {
        if self.ignore_bytes > 0 {
            return !self.input.is_empty();
        }
        match frame_header(&self.input, self.byte_order, self.big_requests) {
            FrameHeader::Incomplete => false,
            FrameHeader::ZeroLength => true,
            FrameHeader::Sized { total, .. } => {
                total > max_request_len || self.input.len() >= total
            }
        }
    }

    /// Take the next request off the input buffer, bumping the sequence
    /// number for everything that counts as a request on the wire.
    ///
    /// `max_request_len` is in bytes and bounds extended-length requests.
    pub(crate) fn take_frame(&mut self, max_request_len: usize) -> Frame {
        if self.ignore_bytes > 0 {
            let skip = self.ignore_bytes.min(self.input.len());
            self.input.drain(..skip);
            self.ignore_bytes -= skip;
            if self.ignore_bytes > 0 {
                return Frame::NeedMore;
            }
        }

        let (total, header_len) =
            match frame_header(&self.input, self.byte_order, self.big_requests) {
                FrameHeader::Incomplete => return Frame::NeedMore,
                FrameHeader::ZeroLength => return self.reject(REQUEST_HEADER_LEN),
                FrameHeader::Sized { total, header_len } => (total, header_len),
            };
        if total > max_request_len {
            return self.reject(total);
        }
        if self.input.len() < total {
            return Frame::NeedMore;
        }
        self.extract(total, header_len)
    }

    /// Drop a request of `total` bytes, including what has not arrived yet
    fn reject(&mut self, total: usize) -> Frame {
        let major = self.input[0];
        let data = self.input[1];
        self.sequence = self.sequence.wrapping_add(1);
        let skip = total.min(self.input.len());
        self.input.drain(..skip);
        self.ignore_bytes = total - skip;
        Frame::Rejected { major, data }
    }

    fn extract(&mut self, total: usize, header_len: usize) -> Frame {
        let major = self.input[0];
        let data = self.input[1];
        let body = self.input[header_len..total].to_vec();
        self.input.drain(..total);
        self.sequence = self.sequence.wrapping_add(1);
        Frame::Request(Request {
            major,
            data,
            sequence: self.sequence,
            body,
            byte_order: self.byte_order,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WireWriter;
    use std::os::unix::net::UnixStream;

    fn client() -> Client {
        let (server, _peer) = UnixStream::pair().unwrap();
        let mut client = Client::new(ClientId(1), Connection::unix(server).unwrap());
        client.set_order(ByteOrder::LSBFirst, true);
        client
    }

    fn request(major: u8, words: u16) -> Vec<u8> {
        let mut writer = WireWriter::new(ByteOrder::LSBFirst);
        writer.u8(major).u8(0).u16(words).zeros((words as usize).saturating_sub(1) * 4);
        writer.into_inner()
    }

    #[test]
    fn test_take_frame_waits_for_whole_request() {
        let mut client = client();
        let bytes = request(55, 4);
        client.input.extend_from_slice(&bytes[..10]);
        assert!(matches!(client.take_frame(1 << 18), Frame::NeedMore));
        assert_eq!(client.sequence_number(), 0);

        client.input.extend_from_slice(&bytes[10..]);
        match client.take_frame(1 << 18) {
            Frame::Request(req) => {
                assert_eq!(req.major, 55);
                assert_eq!(req.sequence, 1);
                assert_eq!(req.wire_len(), 16);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(client.input.is_empty());
    }

    #[test]
    fn test_zero_length_without_big_requests_is_rejected() {
        let mut client = client();
        client.input.extend_from_slice(&[127, 0, 0, 0]);
        client.input.extend_from_slice(&request(127, 1));
        assert!(matches!(
            client.take_frame(1 << 18),
            Frame::Rejected { major: 127, .. }
        ));
        assert!(matches!(client.take_frame(1 << 18), Frame::Request(_)));
        assert_eq!(client.sequence_number(), 2);
    }

    #[test]
    fn test_oversized_request_is_skipped() {
        let mut client = client();
        client.big_requests = true;
        let mut writer = WireWriter::new(ByteOrder::LSBFirst);
        // 64 words declared, larger than the 32-byte limit below
        writer.u8(200).u8(1).u16(0).u32(64).zeros(8);
        client.input = writer.into_inner();

        assert!(matches!(
            client.take_frame(32),
            Frame::Rejected { major: 200, data: 1 }
        ));
        assert_eq!(client.ignore_bytes, 256 - 16);

        // the rest of the oversized request is discarded as it arrives
        client.input.extend(std::iter::repeat(0xaa).take(256 - 16));
        client.input.extend_from_slice(&request(127, 1));
        assert!(matches!(client.take_frame(32), Frame::Request(req) if req.major == 127));
        assert_eq!(client.sequence_number(), 2);
    }

    #[test]
    fn test_output_overflow_closes_client() {
        let mut client = client();
        client.input.extend_from_slice(&request(127, 1));
        let chunk = vec![0u8; 64 * 1024];
        for _ in 0..MAX_OUTPUT_BUFFER / chunk.len() {
            client.send(&chunk);
        }
        assert!(!client.io_closed());
        assert_eq!(client.output.len(), MAX_OUTPUT_BUFFER);

        client.send(&[0u8; 32]);
        assert!(client.io_closed());
        assert!(!client.has_pending_output());
        assert!(matches!(client.take_frame(1 << 18), Frame::NeedMore));

        client.send(&[0u8; 32]);
        assert!(!client.has_pending_output());
    }
}
