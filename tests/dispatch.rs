//! Dispatch tests for x11dix
//!
//! Each test drives a real `Server` through connected socket pairs: the test
//! writes raw requests on one end, calls `dispatch_pass`, and reads back the
//! replies, errors and events the server queued.

use std::cell::{Cell, RefCell};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;
use x11dix::connection::Connection;
use x11dix::error::ServerError;
use x11dix::protocol::{ClientId as Cid, ProtocolError, Reply, Request};
use x11dix::server::{ClientStateListener, DispatchError, ExtensionHandler, ExtensionModule};
use x11dix::{ClientState, Server, ServerConfig, TerminatePolicy, XID};

const LSB_TRUSTED: u8 = b'l';
const LSB_UNTRUSTED: u8 = b'L';
const MSB_TRUSTED: u8 = b'B';

fn server_with(terminate: TerminatePolicy) -> Server {
    let config = ServerConfig {
        listen_unix: false,
        terminate,
        ..ServerConfig::default()
    };
    Server::new(config).unwrap()
}

fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// A little-endian core request
fn request(major: u8, data: u8, words: &[u32]) -> Vec<u8> {
    let mut bytes = vec![major, data];
    bytes.extend_from_slice(&(1 + words.len() as u16).to_le_bytes());
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

fn query_extension(name: &str) -> Vec<u8> {
    let padded = (name.len() + 3) & !3;
    let mut bytes = vec![98, 0];
    bytes.extend_from_slice(&(2 + padded as u16 / 4).to_le_bytes());
    bytes.extend_from_slice(&(name.len() as u16).to_le_bytes());
    bytes.extend_from_slice(&[0, 0]);
    bytes.extend_from_slice(name.as_bytes());
    bytes.resize(8 + padded, 0);
    bytes
}

fn create_window(wid: u32, parent: u32) -> Vec<u8> {
    request(1, 0, &[wid, parent, 0, 100 | 100 << 16, 1 << 16, 0, 0])
}

struct TestClient {
    id: Cid,
    stream: UnixStream,
    base: u32,
}

impl TestClient {
    fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Read one error, event or reply
    fn read_packet(&mut self) -> Vec<u8> {
        let mut packet = vec![0u8; 32];
        self.stream.read_exact(&mut packet).unwrap();
        if packet[0] == 1 {
            let extra = u32_at(&packet, 4) as usize * 4;
            let mut rest = vec![0u8; extra];
            self.stream.read_exact(&mut rest).unwrap();
            packet.extend_from_slice(&rest);
        }
        packet
    }

    fn assert_silent(&mut self) {
        self.stream.set_nonblocking(true).unwrap();
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            other => panic!("expected no output, got {:?}", other),
        }
        self.stream.set_nonblocking(false).unwrap();
    }
}

fn connect(server: &mut Server) -> Option<(Cid, UnixStream)> {
    let (ours, theirs) = UnixStream::pair().unwrap();
    theirs.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let id = server.accept_connection(Connection::unix(ours).unwrap())?;
    Some((id, theirs))
}

/// Run the setup for `order_byte` and return the whole setup block
fn setup(server: &mut Server, order_byte: u8) -> (Cid, UnixStream, Vec<u8>) {
    let (id, mut stream) = connect(server).unwrap();
    let prefix = if order_byte == MSB_TRUSTED {
        [order_byte, 0, 0, 11, 0, 0, 0, 0, 0, 0, 0, 0]
    } else {
        [order_byte, 0, 11, 0, 0, 0, 0, 0, 0, 0, 0, 0]
    };
    stream.write_all(&prefix).unwrap();
    server.dispatch_pass().unwrap();

    let mut block = vec![0u8; 8];
    stream.read_exact(&mut block).unwrap();
    let units = if order_byte == MSB_TRUSTED {
        u16::from_be_bytes([block[6], block[7]])
    } else {
        u16_at(&block, 6)
    };
    let mut rest = vec![0u8; units as usize * 4];
    stream.read_exact(&mut rest).unwrap();
    block.extend_from_slice(&rest);
    (id, stream, block)
}

fn open(server: &mut Server, order_byte: u8) -> TestClient {
    let (id, stream, block) = setup(server, order_byte);
    assert_eq!(block[0], 1);
    TestClient {
        id,
        stream,
        base: u32_at(&block, 12),
    }
}

#[test]
fn test_lsb_setup_success() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let (id, _stream, block) = setup(&mut server, LSB_TRUSTED);

    assert_eq!(id, Cid(1));
    assert_eq!(block[0], 1);
    assert_eq!(u16_at(&block, 2), 11);
    assert_eq!(u16_at(&block, 4), 0);
    assert_eq!(u32_at(&block, 12), 0x0020_0000);
    assert_eq!(u32_at(&block, 16), 0x001f_ffff);
    assert_eq!(server.client(id).unwrap().state(), ClientState::Running);
    assert!(server.client(id).unwrap().is_trusted());
    assert_eq!(server.n_clients(), 1);
}

#[test]
fn test_msb_client_gets_big_endian_replies() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let (_id, stream, block) = setup(&mut server, MSB_TRUSTED);
    assert_eq!(block[0], 1);
    assert_eq!(&block[2..4], &[0, 11]);
    assert_eq!(&block[12..16], &0x0020_0000u32.to_be_bytes());

    let mut client = TestClient {
        id: Cid(1),
        stream,
        base: 0x0020_0000,
    };
    // GetInputFocus with a big-endian length field
    client.send(&[43, 0, 0, 1]);
    server.dispatch_pass().unwrap();
    let reply = client.read_packet();
    assert_eq!(reply[0], 1);
    assert_eq!(&reply[2..4], &[0, 1]);
    assert_eq!(&reply[8..12], &server.root_window().id().get().to_be_bytes());
}

#[test]
fn test_bad_order_byte_closes_connection() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let (id, mut stream) = connect(&mut server).unwrap();
    stream.write_all(&[b'x', 0, 11, 0, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
    server.dispatch_pass().unwrap();

    assert!(server.client(id).is_none());
    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_grab_parks_other_clients() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let mut a = open(&mut server, LSB_TRUSTED);
    let mut b = open(&mut server, LSB_TRUSTED);

    a.send(&request(36, 0, &[]));
    server.dispatch_pass().unwrap();
    assert_eq!(server.scheduler().grabbed_by(), Some(a.id));

    for _ in 0..3 {
        b.send(&request(43, 0, &[]));
    }
    server.dispatch_pass().unwrap();
    assert!(server.scheduler().is_parked(b.id));
    b.assert_silent();

    // the holder keeps being served
    a.send(&request(43, 0, &[]));
    server.dispatch_pass().unwrap();
    assert_eq!(u16_at(&a.read_packet(), 2), 2);

    a.send(&request(37, 0, &[]));
    server.dispatch_pass().unwrap();
    assert_eq!(server.scheduler().grabbed_by(), None);
    let mut sequences = Vec::new();
    for _ in 0..3 {
        let reply = b.read_packet();
        assert_eq!(reply[0], 1);
        sequences.push(u16_at(&reply, 2));
    }
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[test]
fn test_grab_released_when_holder_disconnects() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let mut a = open(&mut server, LSB_TRUSTED);
    let mut b = open(&mut server, LSB_TRUSTED);
    a.send(&request(36, 0, &[]));
    server.dispatch_pass().unwrap();
    b.send(&request(43, 0, &[]));
    server.dispatch_pass().unwrap();
    b.assert_silent();

    drop(a);
    server.dispatch_pass().unwrap();
    assert_eq!(server.scheduler().grabbed_by(), None);
    assert_eq!(b.read_packet()[0], 1);
}

#[test]
fn test_close_down_frees_everything_owned() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let mut c = open(&mut server, LSB_TRUSTED);
    let root = server.root_window().id().get();
    let (wid, pid, gc) = (c.base + 1, c.base + 2, c.base + 3);

    c.send(&create_window(wid, root));
    c.send(&request(53, 24, &[pid, wid, 16 | 16 << 16]));
    c.send(&request(55, 0, &[gc, wid, 1 << 10, pid]));
    server.dispatch_pass().unwrap();
    c.assert_silent();
    for id in [wid, pid, gc] {
        assert!(server.resources().is_live(XID(id)), "{:x} not created", id);
    }

    let id = c.id;
    drop(c);
    server.dispatch_pass().unwrap();
    for xid in [wid, pid, gc] {
        assert!(!server.resources().is_live(XID(xid)));
    }
    assert!(server.client(id).is_none());
    assert_eq!(server.n_clients(), 0);
    assert!(server.resources().is_live(XID(root)));
}

#[test]
fn test_retained_client_killed_by_all_temporary() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let mut a = open(&mut server, LSB_TRUSTED);
    let mut b = open(&mut server, LSB_TRUSTED);
    let root = server.root_window().id().get();
    let wid = a.base + 1;

    // RetainTemporary
    a.send(&request(112, 2, &[]));
    a.send(&create_window(wid, root));
    server.dispatch_pass().unwrap();

    let a_id = a.id;
    drop(a);
    server.dispatch_pass().unwrap();
    let retained = server.client(a_id).unwrap();
    assert_eq!(retained.state(), ClientState::Retained);
    assert!(retained.is_gone());
    assert!(server.resources().is_live(XID(wid)));
    assert_eq!(server.n_clients(), 1);

    b.send(&request(113, 0, &[0]));
    server.dispatch_pass().unwrap();
    b.assert_silent();
    assert!(server.client(a_id).is_none());
    assert!(!server.resources().is_live(XID(wid)));
}

#[test]
fn test_kill_client_by_resource() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let mut a = open(&mut server, LSB_TRUSTED);
    let mut b = open(&mut server, LSB_TRUSTED);
    let root = server.root_window().id().get();
    let wid = a.base + 1;
    a.send(&create_window(wid, root));
    server.dispatch_pass().unwrap();

    b.send(&request(113, 0, &[wid]));
    server.dispatch_pass().unwrap();
    assert!(server.client(a.id).is_none());
    assert!(!server.resources().is_live(XID(wid)));
    let mut buf = [0u8; 1];
    assert_eq!(a.stream.read(&mut buf).unwrap(), 0);

    // the root window belongs to the server
    b.send(&request(113, 0, &[root]));
    server.dispatch_pass().unwrap();
    let error = b.read_packet();
    assert_eq!(error[0], 0);
    assert_eq!(error[1], 2);
    assert_eq!(u32_at(&error, 4), root);
}

#[test]
fn test_double_free_reports_bad_pixmap() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let mut c = open(&mut server, LSB_TRUSTED);
    let root = server.root_window().id().get();
    let pid = c.base + 7;

    c.send(&request(53, 24, &[pid, root, 8 | 8 << 16]));
    c.send(&request(54, 0, &[pid]));
    c.send(&request(54, 0, &[pid]));
    server.dispatch_pass().unwrap();

    let error = c.read_packet();
    assert_eq!(error[0], 0);
    assert_eq!(error[1], 4);
    assert_eq!(u16_at(&error, 2), 3);
    assert_eq!(u32_at(&error, 4), pid);
    assert_eq!(error[10], 54);
    c.assert_silent();
}

#[test]
fn test_id_choice_outside_client_range() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let mut a = open(&mut server, LSB_TRUSTED);
    let _b = open(&mut server, LSB_TRUSTED);
    let root = server.root_window().id().get();

    // an ID in client 2's range
    a.send(&create_window(0x0040_0001, root));
    server.dispatch_pass().unwrap();
    let error = a.read_packet();
    assert_eq!(error[1], 14);
    assert_eq!(u32_at(&error, 4), 0x0040_0001);
}

#[test]
fn test_zero_length_request_rejected_in_sync() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let mut c = open(&mut server, LSB_TRUSTED);

    c.send(&[127, 0, 0, 0]);
    c.send(&request(43, 0, &[]));
    server.dispatch_pass().unwrap();

    let error = c.read_packet();
    assert_eq!(error[0], 0);
    assert_eq!(error[1], 16);
    assert_eq!(u16_at(&error, 2), 1);
    assert_eq!(error[10], 127);

    let reply = c.read_packet();
    assert_eq!(reply[0], 1);
    assert_eq!(u16_at(&reply, 2), 2);
}

#[test]
fn test_big_requests() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let mut c = open(&mut server, LSB_TRUSTED);

    c.send(&query_extension("BIG-REQUESTS"));
    server.dispatch_pass().unwrap();
    let reply = c.read_packet();
    assert_eq!(reply[8], 1);
    let major = reply[9];
    assert_eq!(major, 128);

    c.send(&request(major, 0, &[]));
    server.dispatch_pass().unwrap();
    let reply = c.read_packet();
    assert_eq!(u16_at(&reply, 2), 2);
    assert_eq!(u32_at(&reply, 8), server.config().max_big_request_len);
    assert!(server.client(c.id).unwrap().big_requests());

    // NoOperation framed with the extended length word, then a normal request
    c.send(&[127, 0, 0, 0, 3, 0, 0, 0, 0, 0, 0, 0]);
    c.send(&request(43, 0, &[]));
    server.dispatch_pass().unwrap();
    let reply = c.read_packet();
    assert_eq!(reply[0], 1);
    assert_eq!(u16_at(&reply, 2), 4);
}

#[test]
fn test_xc_misc_id_queries() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let mut c = open(&mut server, LSB_TRUSTED);
    let root = server.root_window().id().get();
    c.send(&create_window(c.base + 1, root));

    c.send(&query_extension("XC-MISC"));
    server.dispatch_pass().unwrap();
    let major = c.read_packet()[9];
    assert_eq!(major, 129);

    // GetVersion
    c.send(&request(major, 0, &[1 | 1 << 16]));
    // GetXIDRange
    c.send(&request(major, 1, &[]));
    // GetXIDList
    c.send(&request(major, 2, &[3]));
    server.dispatch_pass().unwrap();

    let version = c.read_packet();
    assert_eq!((u16_at(&version, 8), u16_at(&version, 10)), (1, 1));

    let range = c.read_packet();
    assert_eq!(u32_at(&range, 8), c.base + 2);
    assert_eq!(u32_at(&range, 12), 0x001f_fffe);

    let list = c.read_packet();
    assert_eq!(u32_at(&list, 8), 3);
    let ids: Vec<u32> = (0..3).map(|i| u32_at(&list, 32 + i * 4)).collect();
    assert_eq!(ids, vec![c.base, c.base + 2, c.base + 3]);
}

#[test]
fn test_unknown_core_opcode() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let mut c = open(&mut server, LSB_TRUSTED);
    c.send(&request(90, 0, &[]));
    server.dispatch_pass().unwrap();
    let error = c.read_packet();
    assert_eq!(error[1], 1);
    assert_eq!(error[10], 90);
}

#[test]
fn test_selection_ownership_change_notifies_previous_owner() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let mut a = open(&mut server, LSB_TRUSTED);
    let mut b = open(&mut server, LSB_TRUSTED);
    let root = server.root_window().id().get();
    let (wa, wb) = (a.base + 1, b.base + 1);
    a.send(&create_window(wa, root));
    b.send(&create_window(wb, root));
    server.dispatch_pass().unwrap();

    // PRIMARY, CurrentTime
    a.send(&request(22, 0, &[wa, 1, 0]));
    server.dispatch_pass().unwrap();
    b.send(&request(22, 0, &[wb, 1, 0]));
    server.dispatch_pass().unwrap();

    let event = a.read_packet();
    assert_eq!(event[0], 29);
    assert_eq!(u16_at(&event, 2), 2);
    assert_eq!(u32_at(&event, 8), wa);
    assert_eq!(u32_at(&event, 12), 1);

    a.send(&request(23, 0, &[1]));
    server.dispatch_pass().unwrap();
    let reply = a.read_packet();
    assert_eq!(u32_at(&reply, 8), wb);

    // the owner leaving releases the selection
    let b_id = b.id;
    drop(b);
    server.dispatch_pass().unwrap();
    assert!(server.client(b_id).is_none());
    a.send(&request(23, 0, &[1]));
    server.dispatch_pass().unwrap();
    assert_eq!(u32_at(&a.read_packet(), 8), 0);
}

#[test]
fn test_destroying_owner_window_releases_selection() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let mut a = open(&mut server, LSB_TRUSTED);
    let mut b = open(&mut server, LSB_TRUSTED);
    let root = server.root_window().id().get();
    let (wa, wb) = (a.base + 1, b.base + 1);
    a.send(&create_window(wa, root));
    b.send(&create_window(wb, root));
    server.dispatch_pass().unwrap();

    a.send(&request(22, 0, &[wa, 1, 0]));
    a.send(&request(4, 0, &[wa]));
    server.dispatch_pass().unwrap();
    assert_eq!(server.selection_owner(x11dix::Atom::PRIMARY).map(|s| s.client), Some(None));

    // no SelectionClear for a window that no longer exists
    b.send(&request(22, 0, &[wb, 1, 0]));
    b.send(&request(23, 0, &[1]));
    server.dispatch_pass().unwrap();
    assert_eq!(u32_at(&b.read_packet(), 8), wb);
    a.assert_silent();
}

#[test]
fn test_destroying_parent_releases_child_selection() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let mut a = open(&mut server, LSB_TRUSTED);
    let mut b = open(&mut server, LSB_TRUSTED);
    let root = server.root_window().id().get();
    let (parent, child) = (a.base + 1, b.base + 1);
    a.send(&create_window(parent, root));
    server.dispatch_pass().unwrap();
    b.send(&create_window(child, parent));
    b.send(&request(22, 0, &[child, 1, 0]));
    server.dispatch_pass().unwrap();
    b.assert_silent();

    // the parent's owner leaves, taking the child window with it
    drop(a);
    server.dispatch_pass().unwrap();
    assert!(!server.resources().is_live(XID(child)));
    b.send(&request(23, 0, &[1]));
    server.dispatch_pass().unwrap();
    assert_eq!(u32_at(&b.read_packet(), 8), 0);
}

#[test]
fn test_client_slots_reused_lowest_first() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let first = connect(&mut server).unwrap();
    let second = connect(&mut server).unwrap();
    assert_eq!((first.0, second.0), (Cid(1), Cid(2)));

    drop(first);
    server.dispatch_pass().unwrap();
    assert!(server.client(Cid(1)).is_none());

    let third = connect(&mut server).unwrap();
    assert_eq!(third.0, Cid(1));
}

#[test]
fn test_refused_when_client_table_full() {
    let config = ServerConfig {
        listen_unix: false,
        limit_clients: 64,
        terminate: TerminatePolicy::NoReset,
        ..ServerConfig::default()
    };
    let mut server = Server::new(config).unwrap();
    let _held: Vec<_> = (0..63).map(|_| connect(&mut server).unwrap()).collect();

    let (ours, mut theirs) = UnixStream::pair().unwrap();
    theirs.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    theirs.write_all(&[LSB_TRUSTED, 0, 11, 0, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
    assert!(server.accept_connection(Connection::unix(ours).unwrap()).is_none());

    let mut block = vec![0u8; 8];
    theirs.read_exact(&mut block).unwrap();
    assert_eq!(block[0], 0);
    let reason_len = block[1] as usize;
    let mut rest = vec![0u8; u16_at(&block, 6) as usize * 4];
    theirs.read_exact(&mut rest).unwrap();
    assert_eq!(&rest[..reason_len], b"Maximum number of clients reached");
}

#[test]
fn test_terminate_when_last_client_leaves() {
    let mut server = server_with(TerminatePolicy::Terminate { delay_ms: 0 });
    let c = open(&mut server, LSB_TRUSTED);
    assert!(!server.is_terminating());
    drop(c);
    server.dispatch_pass().unwrap();
    assert!(server.is_terminating());
}

/// Counts generations and resets of the FOO/BAR test extensions
#[derive(Default)]
struct Counters {
    inits: Cell<u32>,
    resets: Cell<u32>,
}

struct FooModule(Rc<Counters>);

struct FooHandler(Rc<Counters>);

struct BarHandler;

impl ExtensionModule for FooModule {
    fn name(&self) -> &str {
        "FOO"
    }

    fn init(&self, server: &mut Server) -> Result<(), ServerError> {
        self.0.inits.set(self.0.inits.get() + 1);
        server.add_extension("FOO", 2, 1, Rc::new(FooHandler(self.0.clone())))?;
        server.add_extension("BAR", 1, 0, Rc::new(BarHandler))?;
        Ok(())
    }
}

impl ExtensionHandler for FooHandler {
    fn dispatch(&self, server: &mut Server, client: Cid, req: &Request) -> Result<(), DispatchError> {
        if req.data == 7 {
            return Err(DispatchError::ClientFatal("FOO stream corrupt".to_string()));
        }
        if req.data != 0 {
            return Err(ProtocolError::request().into());
        }
        let mut reply = Reply::new(server.client_order(client), req.wire_sequence(), 0);
        reply.body().u32(0xf00);
        let reply = reply.finish();
        server.send(client, &reply);
        Ok(())
    }

    fn reset(&self) {
        self.0.resets.set(self.0.resets.get() + 1);
    }
}

impl ExtensionHandler for BarHandler {
    fn dispatch(&self, _server: &mut Server, _client: Cid, _req: &Request) -> Result<(), DispatchError> {
        Ok(())
    }

    fn untrusted_safe(&self) -> bool {
        true
    }
}

#[test]
fn test_extension_registration_and_dispatch() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let counters = Rc::new(Counters::default());
    server.add_module(Rc::new(FooModule(counters.clone()))).unwrap();
    let mut c = open(&mut server, LSB_TRUSTED);

    c.send(&query_extension("FOO"));
    c.send(&query_extension("BAR"));
    c.send(&query_extension("BAZ"));
    server.dispatch_pass().unwrap();
    let foo = c.read_packet();
    assert_eq!((foo[8], foo[9], foo[10], foo[11]), (1, 130, 64, 128));
    let bar = c.read_packet();
    assert_eq!((bar[8], bar[9], bar[10], bar[11]), (1, 131, 66, 0));
    let baz = c.read_packet();
    assert_eq!((baz[8], baz[9]), (0, 0));

    c.send(&request(130, 0, &[]));
    c.send(&request(130, 5, &[]));
    server.dispatch_pass().unwrap();
    let reply = c.read_packet();
    assert_eq!(u32_at(&reply, 8), 0xf00);
    let error = c.read_packet();
    assert_eq!(error[1], 1);
    assert_eq!(u16_at(&error, 8), 5);
    assert_eq!(error[10], 130);

    // an opcode nobody registered
    c.send(&request(200, 0, &[]));
    server.dispatch_pass().unwrap();
    assert_eq!(c.read_packet()[1], 1);
}

#[test]
fn test_fatal_extension_error_drops_buffered_requests() {
    let mut server = server_with(TerminatePolicy::NoReset);
    server
        .add_module(Rc::new(FooModule(Rc::new(Counters::default()))))
        .unwrap();
    let mut c = open(&mut server, LSB_TRUSTED);
    let id = c.id;

    c.send(&request(130, 7, &[]));
    c.send(&request(43, 0, &[]));
    server.dispatch_pass().unwrap();

    assert!(server.client(id).is_none());
    let mut buf = [0u8; 32];
    assert_eq!(c.stream.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_self_kill_skips_buffered_requests() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let mut c = open(&mut server, LSB_TRUSTED);
    let root = server.root_window().id().get();
    let (id, wid) = (c.id, c.base + 1);

    c.send(&create_window(wid, root));
    c.send(&request(113, 0, &[wid]));
    c.send(&request(43, 0, &[]));
    server.dispatch_pass().unwrap();

    assert!(server.client(id).is_none());
    assert!(!server.resources().is_live(XID(wid)));
    let mut buf = [0u8; 32];
    assert_eq!(c.stream.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_unsafe_extensions_hidden_from_untrusted() {
    let mut server = server_with(TerminatePolicy::NoReset);
    server
        .add_module(Rc::new(FooModule(Rc::new(Counters::default()))))
        .unwrap();
    let mut trusted = open(&mut server, LSB_TRUSTED);
    let mut untrusted = open(&mut server, LSB_UNTRUSTED);
    assert!(!server.client(untrusted.id).unwrap().is_trusted());

    trusted.send(&query_extension("FOO"));
    untrusted.send(&query_extension("FOO"));
    untrusted.send(&query_extension("BAR"));
    server.dispatch_pass().unwrap();
    assert_eq!(trusted.read_packet()[8], 1);
    assert_eq!(untrusted.read_packet()[8], 0);
    assert_eq!(untrusted.read_packet()[8], 1);

    // ListExtensions is filtered the same way
    untrusted.send(&request(99, 0, &[]));
    server.dispatch_pass().unwrap();
    let list = untrusted.read_packet();
    assert_eq!(list[1], 3);
    let names = &list[32..];
    let mut found = Vec::new();
    let mut pos = 0;
    for _ in 0..list[1] {
        let len = names[pos] as usize;
        found.push(String::from_utf8_lossy(&names[pos + 1..pos + 1 + len]).into_owned());
        pos += 1 + len;
    }
    assert_eq!(found, vec!["BIG-REQUESTS", "XC-MISC", "BAR"]);
}

#[test]
fn test_reset_starts_new_generation() {
    let mut server = server_with(TerminatePolicy::Reset);
    let counters = Rc::new(Counters::default());
    server.add_module(Rc::new(FooModule(counters.clone()))).unwrap();
    let generation = server.generation();
    assert_eq!(counters.inits.get(), 1);

    let c = open(&mut server, LSB_TRUSTED);
    drop(c);
    server.dispatch_pass().unwrap();

    assert_eq!(server.generation(), generation + 1);
    assert_eq!(counters.resets.get(), 1);
    assert_eq!(counters.inits.get(), 2);
    assert_eq!(server.extensions().find_by_name("FOO").unwrap().major_opcode, 130);
    assert!(server.resources().is_live(server.root_window().id()));
    assert!(!server.is_terminating());
}

#[test]
fn test_terminate_delay_expires() {
    let mut server = server_with(TerminatePolicy::Terminate { delay_ms: 1 });
    let c = open(&mut server, LSB_TRUSTED);
    drop(c);
    server.dispatch_pass().unwrap();
    std::thread::sleep(Duration::from_millis(10));
    server.dispatch_pass().unwrap();
    assert!(server.is_terminating());
}

#[test]
fn test_new_connection_disarms_terminate_delay() {
    let mut server = server_with(TerminatePolicy::Terminate { delay_ms: 50 });
    let c = open(&mut server, LSB_TRUSTED);
    drop(c);
    server.dispatch_pass().unwrap();
    assert!(!server.is_terminating());
    let _next = connect(&mut server).unwrap();
    std::thread::sleep(Duration::from_millis(80));
    server.dispatch_pass().unwrap();
    assert!(!server.is_terminating());
}

struct Recorder(RefCell<Vec<(Cid, ClientState)>>);

impl ClientStateListener for Recorder {
    fn client_state_changed(&self, client: Cid, state: ClientState) {
        self.0.borrow_mut().push((client, state));
    }
}

#[test]
fn test_state_listeners_see_every_transition() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let recorder = Rc::new(Recorder(RefCell::new(Vec::new())));
    server.add_state_listener(recorder.clone());

    let mut a = open(&mut server, LSB_TRUSTED);
    let root = server.root_window().id().get();
    let wid = a.base + 1;
    // RetainPermanent, leave, then get killed through a kept window
    a.send(&request(112, 1, &[]));
    a.send(&create_window(wid, root));
    server.dispatch_pass().unwrap();
    let id = a.id;
    drop(a);
    server.dispatch_pass().unwrap();
    assert_eq!(server.client(id).unwrap().state(), ClientState::Retained);

    let mut b = open(&mut server, LSB_TRUSTED);
    b.send(&request(113, 0, &[wid]));
    server.dispatch_pass().unwrap();
    b.assert_silent();
    assert!(server.client(id).is_none());

    let seen: Vec<ClientState> = recorder
        .0
        .borrow()
        .iter()
        .filter(|(c, _)| *c == id)
        .map(|(_, s)| *s)
        .collect();
    assert_eq!(
        seen,
        vec![
            ClientState::Authenticating,
            ClientState::Running,
            ClientState::Retained,
            ClientState::Gone,
        ]
    );
}

#[test]
fn test_missing_cookie_fails_setup() {
    let config = ServerConfig {
        listen_unix: false,
        terminate: TerminatePolicy::NoReset,
        auth_cookie: Some(vec![0xde, 0xad, 0xbe, 0xef]),
        ..ServerConfig::default()
    };
    let mut server = Server::new(config).unwrap();
    let (id, _stream, block) = setup(&mut server, LSB_TRUSTED);

    assert_eq!(block[0], 0);
    let reason = String::from_utf8_lossy(&block[8..8 + block[1] as usize]).into_owned();
    assert!(reason.starts_with("Authorization required"), "{}", reason);
    assert!(server.client(id).is_none());
    assert_eq!(server.n_clients(), 0);
}

#[test]
fn test_untrusted_grab_is_denied() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let mut c = open(&mut server, LSB_UNTRUSTED);
    c.send(&request(36, 0, &[]));
    server.dispatch_pass().unwrap();

    let error = c.read_packet();
    assert_eq!(error[1], 10);
    assert_eq!(error[10], 36);
    assert_eq!(server.scheduler().grabbed_by(), None);
}

#[test]
fn test_untrusted_client_creates_top_level_window() {
    let mut server = server_with(TerminatePolicy::NoReset);
    let mut trusted = open(&mut server, LSB_TRUSTED);
    let mut untrusted = open(&mut server, LSB_UNTRUSTED);
    let root = server.root_window().id().get();
    let (wt, wu) = (trusted.base + 1, untrusted.base + 1);

    trusted.send(&create_window(wt, root));
    server.dispatch_pass().unwrap();
    untrusted.send(&create_window(wu, root));
    server.dispatch_pass().unwrap();
    untrusted.assert_silent();
    assert!(server.resources().is_live(XID(wu)));

    // DestroySubwindows on root only reaches what the caller may destroy
    untrusted.send(&request(5, 0, &[root]));
    server.dispatch_pass().unwrap();
    untrusted.assert_silent();
    assert!(!server.resources().is_live(XID(wu)));
    assert!(server.resources().is_live(XID(wt)));
    trusted.assert_silent();
}
