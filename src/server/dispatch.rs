//! Request dispatch
//!
//! One pass picks ready clients by scheduler priority and runs each for one
//! slice. Inside a slice requests are taken one at a time, in arrival order,
//! and each runs to completion before the next is decoded.

use super::client::{ClientState, Frame};
use super::handlers::dispatch_core;
use super::{DispatchError, DispatchException, Server};
use crate::error::ServerError;
use crate::protocol::opcodes::{self, EXTENSION_BASE};
use crate::protocol::{ClientId, ProtocolError, Request};
use crate::security::AccessSubject;
use log::{debug, info, warn};

impl Server {
    /// Largest request `client` may send, in bytes
    pub(crate) fn max_request_len(&self, client: ClientId) -> usize {
        match self.client(client) {
            Some(c) if c.big_requests() => self.config().max_big_request_len as usize * 4,
            _ => u16::MAX as usize * 4,
        }
    }

    /// Whether a client has something the dispatcher can act on
    pub(crate) fn has_work(&self, client: ClientId) -> bool {
        let max_len = self.max_request_len(client);
        self.client(client).is_some_and(|c| match c.state() {
            ClientState::Initial => !c.input().is_empty() || c.io_closed(),
            ClientState::Running => c.io_closed() || c.has_complete_request(max_len),
            _ => false,
        })
    }

    /// Run ready clients until none is left, then flush their output
    pub(crate) fn dispatch_ready(&mut self) {
        while self.exception.is_none() {
            let now = self.now_ms();
            let Some(id) = self.scheduler.pick(now) else {
                break;
            };
            self.run_slice(id);
        }
        self.flush_clients();
    }

    /// Run one client until its slice ends, its input runs dry, or it is
    /// no longer running
    fn run_slice(&mut self, id: ClientId) {
        let start = self.now_ms();
        let mut requests = 0u32;
        loop {
            let Some(client) = self.client(id) else {
                return;
            };
            match client.state() {
                ClientState::Initial => {
                    self.handshake(id);
                    if self.client(id).map(|c| c.state()) != Some(ClientState::Running) {
                        self.scheduler.clear_ready(id);
                        return;
                    }
                    continue;
                }
                ClientState::Running => {}
                _ => {
                    self.scheduler.clear_ready(id);
                    return;
                }
            }

            let max_len = self.max_request_len(id);
            let Some(client) = self.client_mut(id) else {
                return;
            };
            match client.take_frame(max_len) {
                Frame::NeedMore => {
                    if client.io_closed() {
                        debug!("{} closed its connection", id);
                        self.close_down(id);
                    } else {
                        self.scheduler.clear_ready(id);
                        let now = self.now_ms();
                        self.scheduler.end_turn(id, now, false);
                    }
                    return;
                }
                Frame::Rejected { major, data } => {
                    let sequence = client.sequence_number() as u16;
                    let order = client.byte_order();
                    warn!(
                        "Rejected oversized or malformed {} request from {}",
                        opcodes::name(major),
                        id
                    );
                    let minor = if major >= EXTENSION_BASE { data as u16 } else { 0 };
                    let error = ProtocolError::length().encode(order, sequence, major, minor);
                    client.send(&error);
                }
                Frame::Request(req) => self.dispatch_request(id, req),
            }
            requests += 1;

            // the request may have killed or closed its own client
            if self.client(id).map(|c| c.state()) != Some(ClientState::Running) {
                return;
            }
            let now = self.now_ms();
            if self.scheduler.should_yield(start, now, requests) {
                if !self.has_work(id) {
                    self.scheduler.clear_ready(id);
                }
                self.scheduler.end_turn(id, now, true);
                return;
            }
        }
    }

    /// Run one request and report its outcome
    pub(crate) fn dispatch_request(&mut self, id: ClientId, req: Request) {
        let handler = if req.major >= EXTENSION_BASE {
            self.extensions.handler(req.major)
        } else {
            None
        };
        let minor = handler.as_ref().map(|h| h.minor_opcode(&req)).unwrap_or(0);
        let Some(client) = self.client_mut(id) else {
            return;
        };
        client.major_op = req.major;
        client.minor_op = minor;
        let subject = AccessSubject {
            client: id,
            trusted: client.is_trusted(),
        };
        debug!(
            "{} request #{}: {} ({}:{}, {} bytes)",
            id,
            req.sequence,
            opcodes::name(req.major),
            req.major,
            minor,
            req.wire_len()
        );

        let result = if !self.access.request_allowed(&subject, req.major, minor) {
            Err(ProtocolError::access().into())
        } else if req.major < EXTENSION_BASE {
            dispatch_core(self, id, &req)
        } else {
            match handler {
                Some(handler) if req.byte_order.is_swapped() => {
                    handler.dispatch_swapped(self, id, &req)
                }
                Some(handler) => handler.dispatch(self, id, &req),
                None => Err(ProtocolError::request().into()),
            }
        };

        match result {
            Ok(()) => {}
            Err(DispatchError::Protocol(err)) => {
                debug!("{} request #{} failed: {}", id, req.sequence, err);
                let order = self.client_order(id);
                let bytes = err.encode(order, req.wire_sequence(), req.major, minor);
                self.send(id, &bytes);
            }
            Err(DispatchError::ClientFatal(reason)) => {
                warn!("Closing {}: {}", id, reason);
                self.close_down(id);
            }
        }
    }

    fn flush_clients(&mut self) {
        let mut failed = Vec::new();
        for client in self.clients.iter_mut().flatten() {
            if client.has_pending_output() {
                if let Err(e) = client.flush() {
                    debug!("Write to {} failed: {}", client.id(), e);
                    failed.push(client.id());
                }
            }
        }
        for id in failed {
            self.close_down(id);
        }
    }

    /// Act on a pending reset or terminate, and on an expired terminate delay
    pub(crate) fn handle_exception(&mut self) -> Result<(), ServerError> {
        if let Some(deadline) = self.terminate_at {
            if self.n_clients == 0 && self.now_ms() >= deadline {
                self.terminate_at = None;
                self.exception = Some(DispatchException::Terminate);
            }
        }
        match self.exception.take() {
            Some(DispatchException::Reset) => self.reset(),
            Some(DispatchException::Terminate) => {
                info!("Terminating");
                self.terminating = true;
                Ok(())
            }
            None => Ok(()),
        }
    }
}
