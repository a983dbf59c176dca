//! Connection layer
//!
//! This module handles network connections from X11 clients via TCP and Unix
//! sockets. All sockets are non-blocking: the dispatcher polls them and moves
//! whatever is available in or out of the per-client buffers.

use log::{error, info};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};

/// Bytes read from a socket per `read` call
const READ_CHUNK: usize = 4096;

/// Connection type
pub enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Connection {
    /// Wrap an accepted stream, switching it to non-blocking mode
    pub fn tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Connection::Tcp(stream))
    }

    pub fn unix(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Connection::Unix(stream))
    }

    /// Read data from connection
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(stream) => stream.read(buf),
            Connection::Unix(stream) => stream.read(buf),
        }
    }

    /// Write data to connection
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(stream) => stream.write(buf),
            Connection::Unix(stream) => stream.write(buf),
        }
    }

    /// Append everything currently readable to `input`.
    ///
    /// Returns `Ok(true)` once the peer has closed its end.
    pub fn read_available(&mut self, input: &mut Vec<u8>) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => input.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Write as much of `output` as the socket accepts and drop what was sent
    pub fn write_pending(&mut self, output: &mut Vec<u8>) -> io::Result<()> {
        let mut written = 0;
        while written < output.len() {
            match self.write(&output[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    ))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    output.drain(..written);
                    return Err(e);
                }
            }
        }
        output.drain(..written);
        Ok(())
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Connection::Tcp(stream) => stream.as_fd(),
            Connection::Unix(stream) => stream.as_fd(),
        }
    }
}

/// Connection listener
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Create a TCP listener
    pub fn tcp(port: u16) -> io::Result<Self> {
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr)?;
        listener.set_nonblocking(true)?;
        info!("Listening on {}", addr);
        Ok(Listener::Tcp(listener))
    }

    /// Create a Unix socket listener
    pub fn unix(path: &str) -> io::Result<Self> {
        if let Some(dir) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(dir)?;
        }
        // Remove a stale socket file left by a previous server
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        info!("Listening on {}", path);
        Ok(Listener::Unix(listener))
    }

    /// Accept every pending connection
    pub fn accept_pending(&self) -> Vec<Connection> {
        let mut accepted = Vec::new();
        loop {
            let result = match self {
                Listener::Tcp(listener) => listener.accept().and_then(|(s, _)| Connection::tcp(s)),
                Listener::Unix(listener) => {
                    listener.accept().and_then(|(s, _)| Connection::unix(s))
                }
            };
            match result {
                Ok(conn) => accepted.push(conn),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("Accept failed: {}", e);
                    break;
                }
            }
        }
        accepted
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Tcp(listener) => listener.as_fd(),
            Listener::Unix(listener) => listener.as_fd(),
        }
    }
}
