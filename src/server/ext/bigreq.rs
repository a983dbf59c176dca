//! BIG-REQUESTS
//!
//! Once enabled for a client, a zero in the 16-bit length field means a
//! 32-bit length word follows the header.

use crate::protocol::{ClientId, ProtocolError, Reply, Request};
use crate::server::extensions::ExtensionHandler;
use crate::server::{DispatchError, ExtensionModule, Server};
use crate::error::ServerError;
use log::debug;
use std::rc::Rc;

pub const NAME: &str = "BIG-REQUESTS";

const BIG_REQ_ENABLE: u8 = 0;

/// Registers BIG-REQUESTS each generation
#[derive(Debug, Clone, Copy, Default)]
pub struct BigRequests;

impl ExtensionModule for BigRequests {
    fn name(&self) -> &str {
        NAME
    }

    fn init(&self, server: &mut Server) -> Result<(), ServerError> {
        server.add_extension(NAME, 0, 0, Rc::new(BigRequestsHandler))?;
        Ok(())
    }
}

struct BigRequestsHandler;

impl ExtensionHandler for BigRequestsHandler {
    fn dispatch(
        &self,
        server: &mut Server,
        client: ClientId,
        req: &Request,
    ) -> Result<(), DispatchError> {
        if req.data != BIG_REQ_ENABLE {
            return Err(ProtocolError::request().into());
        }
        req.expect_len(4)?;

        let max_len = server.config().max_big_request_len;
        let Some(c) = server.client_mut(client) else {
            return Ok(());
        };
        c.big_requests = true;
        let mut reply = Reply::new(c.byte_order(), req.wire_sequence(), 0);
        reply.body().u32(max_len);
        let reply = reply.finish();
        c.send(&reply);
        debug!("{} enabled big requests (max {} units)", client, max_len);
        Ok(())
    }

    fn untrusted_safe(&self) -> bool {
        true
    }
}
