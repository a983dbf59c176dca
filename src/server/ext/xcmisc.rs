//! XC-MISC: lets clients find unused resource IDs in their own range

use crate::protocol::{ClientId, ProtocolError, Reply, Request};
use crate::server::extensions::ExtensionHandler;
use crate::server::{DispatchError, ExtensionModule, Server};
use crate::error::ServerError;
use log::debug;
use std::rc::Rc;

pub const NAME: &str = "XC-MISC";

pub const MAJOR_VERSION: u16 = 1;
pub const MINOR_VERSION: u16 = 1;

const GET_VERSION: u8 = 0;
const GET_XID_RANGE: u8 = 1;
const GET_XID_LIST: u8 = 2;

/// Registers XC-MISC each generation
#[derive(Debug, Clone, Copy, Default)]
pub struct XcMisc;

impl ExtensionModule for XcMisc {
    fn name(&self) -> &str {
        NAME
    }

    fn init(&self, server: &mut Server) -> Result<(), ServerError> {
        server.add_extension(NAME, 0, 0, Rc::new(XcMiscHandler))?;
        Ok(())
    }
}

struct XcMiscHandler;

impl ExtensionHandler for XcMiscHandler {
    fn dispatch(
        &self,
        server: &mut Server,
        client: ClientId,
        req: &Request,
    ) -> Result<(), DispatchError> {
        let order = server.client_order(client);
        let mut reply = Reply::new(order, req.wire_sequence(), 0);
        match req.data {
            GET_VERSION => {
                req.expect_len(8)?;
                reply.body().u16(MAJOR_VERSION).u16(MINOR_VERSION);
            }
            GET_XID_RANGE => {
                req.expect_len(4)?;
                let (start, count) = server.resources.xid_range(client);
                debug!("{} XID range {} (+{})", client, start, count);
                reply.body().u32(start.get()).u32(count);
            }
            GET_XID_LIST => {
                req.expect_len(8)?;
                let count = req.reader().u32()?;
                let ids = server.resources.xid_list(client, count);
                let body = reply.body();
                body.u32(ids.len() as u32).zeros(20);
                for id in &ids {
                    body.u32(id.get());
                }
            }
            _ => return Err(ProtocolError::request().into()),
        }
        let reply = reply.finish();
        server.send(client, &reply);
        Ok(())
    }

    fn untrusted_safe(&self) -> bool {
        true
    }
}
