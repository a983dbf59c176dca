//! Server listener and connection handling
//!
//! The server's only blocking point: a `poll` over the listening sockets and
//! every client connection. Readable listeners are drained into new client
//! slots, readable clients have their input buffered and are marked ready
//! once a whole request (or the end of the stream) is there.

use super::handshake::{refuse_connection, MAX_CLIENTS_REASON};
use super::{Client, Server};
use crate::connection::{Connection, Listener};
use crate::error::ServerError;
use crate::protocol::ClientId;
use log::{debug, info};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use std::os::fd::AsFd;

/// Where a polled descriptor came from
#[derive(Debug, Clone, Copy)]
enum Source {
    Listener(usize),
    Client(ClientId),
}

fn poll_timeout(ms: Option<u64>) -> PollTimeout {
    match ms {
        None => PollTimeout::NONE,
        Some(ms) => {
            let ms = i32::try_from(ms).unwrap_or(i32::MAX);
            PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
        }
    }
}

impl Server {
    /// Open the transports enabled in the configuration
    pub fn listen(&mut self) -> Result<(), ServerError> {
        if self.config.listen_tcp {
            self.listeners.push(Listener::tcp(self.config.tcp_port())?);
        }
        if self.config.listen_unix {
            self.listeners.push(Listener::unix(&self.config.unix_path())?);
        }
        if self.listeners.is_empty() {
            return Err(ServerError::Config(
                "no transport enabled, nothing to listen on".to_string(),
            ));
        }
        Ok(())
    }

    /// Serve until a terminate exception
    pub fn run(&mut self) -> Result<(), ServerError> {
        info!("Serving display :{}", self.config.display);
        while !self.terminating {
            let timeout = if self.scheduler.has_ready() {
                Some(0)
            } else {
                self.terminate_at
                    .map(|deadline| deadline.saturating_sub(self.now_ms()))
            };
            self.wait_for_something(timeout)?;
            self.dispatch_ready();
            self.handle_exception()?;
        }
        Ok(())
    }

    /// One non-blocking iteration of the main loop
    pub fn dispatch_pass(&mut self) -> Result<(), ServerError> {
        self.wait_for_something(Some(0))?;
        self.dispatch_ready();
        self.handle_exception()
    }

    /// Take a new connection into the lowest free slot.
    ///
    /// When every slot is taken the peer is told so and dropped.
    pub fn accept_connection(&mut self, conn: Connection) -> Option<ClientId> {
        let Some(index) = (1..self.clients.len()).find(|&i| self.clients[i].is_none()) else {
            refuse_connection(conn, MAX_CLIENTS_REASON);
            return None;
        };
        let id = ClientId(index as u16);
        self.clients[index] = Some(Client::new(id, conn));
        let now = self.now_ms();
        self.scheduler.add_client(id, now);
        if self.terminate_at.take().is_some() {
            debug!("New connection, terminate delay disarmed");
        }
        info!("Accepted {}", id);
        Some(id)
    }

    /// Block until a listener or client needs attention, or `timeout_ms`
    /// passes (`None` waits indefinitely)
    pub(crate) fn wait_for_something(&mut self, timeout_ms: Option<u64>) -> Result<(), ServerError> {
        let mut sources = Vec::new();
        let events = {
            let mut fds = Vec::new();
            for (i, listener) in self.listeners.iter().enumerate() {
                sources.push(Source::Listener(i));
                fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
            }
            for client in self.clients.iter().flatten() {
                let Some(fd) = client.fd() else {
                    continue;
                };
                let mut flags = PollFlags::POLLIN;
                if client.has_pending_output() {
                    flags |= PollFlags::POLLOUT;
                }
                sources.push(Source::Client(client.id()));
                fds.push(PollFd::new(fd, flags));
            }

            match nix::poll::poll(&mut fds, poll_timeout(timeout_ms)) {
                Ok(_) => {}
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => return Ok(()),
                Err(e) => return Err(ServerError::Io(e.into())),
            }
            fds.iter()
                .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
                .collect::<Vec<PollFlags>>()
        };

        let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        for (source, revents) in sources.into_iter().zip(events) {
            match source {
                Source::Listener(i) if revents.intersects(readable) => {
                    let accepted = self.listeners[i].accept_pending();
                    for conn in accepted {
                        self.accept_connection(conn);
                    }
                }
                Source::Client(id) => {
                    if revents.contains(PollFlags::POLLOUT) {
                        if let Some(client) = self.client_mut(id) {
                            if let Err(e) = client.flush() {
                                debug!("Write to {} failed: {}", id, e);
                            }
                        }
                    }
                    if revents.intersects(readable) {
                        if let Some(client) = self.client_mut(id) {
                            if let Err(e) = client.fill_input() {
                                debug!("Read from {} failed: {}", id, e);
                            }
                        }
                    }
                }
                Source::Listener(_) => {}
            }
        }

        // buffered input counts as well as fresh input
        let ids: Vec<ClientId> = self.clients().map(|c| c.id()).collect();
        for id in ids {
            if self.has_work(id) {
                self.scheduler.mark_ready(id);
            }
        }
        Ok(())
    }
}
