//! Core request handlers
//!
//! Each handler validates the request length first, decodes through
//! [`WireReader`](crate::protocol::WireReader) and reports failures as a
//! [`ProtocolError`]. Nothing is written into the resource database until
//! every check has passed.

use super::client::CloseDownMode;
use super::objects::{drawable_depth, GcRec, PixmapRec, WindowRec, SUPPORTED_DEPTHS};
use super::selection::{handle_get_selection_owner, handle_set_selection_owner};
use super::{DispatchError, Server};
use crate::protocol::{
    opcodes, padded_len, ClientId, ErrorCode, ProtocolEncoder, ProtocolError, Request, Window,
    WindowClass, XID,
};
use crate::resources::{Match, ResourceError};
use crate::security::{Access, AccessSubject};
use log::{debug, info};
use std::rc::Rc;

/// KillClient argument naming every retained-temporary client
pub const ALL_TEMPORARY: u32 = 0;

/// GetInputFocus revert-to value PointerRoot
const REVERT_TO_POINTER_ROOT: u8 = 1;

const WINDOW_LAST_BIT: u32 = 14;
const CW_BACK_PIXEL: u32 = 1;
const CW_EVENT_MASK: u32 = 11;

const GC_LAST_BIT: u32 = 22;
const GC_FOREGROUND: u32 = 2;
const GC_BACKGROUND: u32 = 3;
const GC_TILE: u32 = 10;

/// Route a core request (major opcode below 128) to its handler
pub(crate) fn dispatch_core(
    server: &mut Server,
    client: ClientId,
    req: &Request,
) -> Result<(), DispatchError> {
    match req.major {
        opcodes::CREATE_WINDOW => handle_create_window(server, client, req),
        opcodes::DESTROY_WINDOW => handle_destroy_window(server, client, req),
        opcodes::DESTROY_SUBWINDOWS => handle_destroy_subwindows(server, client, req),
        opcodes::SET_SELECTION_OWNER => handle_set_selection_owner(server, client, req),
        opcodes::GET_SELECTION_OWNER => handle_get_selection_owner(server, client, req),
        opcodes::GRAB_SERVER => handle_grab_server(server, client, req),
        opcodes::UNGRAB_SERVER => handle_ungrab_server(server, client, req),
        opcodes::GET_INPUT_FOCUS => handle_get_input_focus(server, client, req),
        opcodes::CREATE_PIXMAP => handle_create_pixmap(server, client, req),
        opcodes::FREE_PIXMAP => handle_free_pixmap(server, client, req),
        opcodes::CREATE_GC => handle_create_gc(server, client, req),
        opcodes::FREE_GC => handle_free_gc(server, client, req),
        opcodes::QUERY_EXTENSION => handle_query_extension(server, client, req),
        opcodes::LIST_EXTENSIONS => handle_list_extensions(server, client, req),
        opcodes::SET_CLOSE_DOWN_MODE => handle_set_close_down_mode(server, client, req),
        opcodes::KILL_CLIENT => handle_kill_client(server, client, req),
        opcodes::NO_OPERATION => Ok(()),
        _ => {
            log::warn!("Unimplemented core opcode {} from {}", req.major, client);
            Err(ProtocolError::request().into())
        }
    }
}

/// Checks shared by every request that names a new resource
fn check_new_id(server: &Server, id: XID, client: ClientId) -> Result<(), ProtocolError> {
    server
        .resources
        .legal_new_id(id, client)
        .map_err(|e| e.to_protocol(ErrorCode::IDChoice))?;
    server.check_quota(client)
}

fn handle_create_window(
    server: &mut Server,
    client: ClientId,
    req: &Request,
) -> Result<(), DispatchError> {
    req.expect_min_len(32)?;
    let mut reader = req.reader();
    let wid = XID(reader.u32()?);
    let parent = XID(reader.u32()?);
    let x = reader.i16()?;
    let y = reader.i16()?;
    let width = reader.u16()?;
    let height = reader.u16()?;
    let border_width = reader.u16()?;
    let class = reader.u16()?;
    let _visual = reader.u32()?;
    let value_mask = reader.u32()?;
    let values = reader.value_list(value_mask, WINDOW_LAST_BIT)?;

    debug!(
        "CreateWindow: wid={}, parent={}, {}x{} at ({},{})",
        wid, parent, width, height, x, y
    );

    check_new_id(server, wid, client)?;
    let parent_rec = server.lookup_window(parent, client, Access::ADD)?;
    let (parent_class, parent_depth) = (parent_rec.class, parent_rec.depth);

    let class = match WindowClass::from_u16(class) {
        Some(WindowClass::CopyFromParent) => parent_class,
        Some(class) => class,
        None => return Err(ProtocolError::value(class as u32).into()),
    };
    if width == 0 || height == 0 {
        return Err(ProtocolError::value(0).into());
    }
    let depth = match class {
        WindowClass::InputOnly => {
            if border_width != 0 || req.data != 0 {
                return Err(ProtocolError::bad_match().into());
            }
            0
        }
        _ => {
            if parent_class == WindowClass::InputOnly {
                return Err(ProtocolError::bad_match().into());
            }
            let depth = if req.data == 0 { parent_depth } else { req.data };
            if !SUPPORTED_DEPTHS.contains(&depth) {
                return Err(ProtocolError::bad_match().into());
            }
            depth
        }
    };

    let window_type = server.object_types().window;
    server
        .resources
        .add(
            wid,
            window_type,
            WindowRec {
                parent: Some(Window(parent)),
                children: Vec::new(),
                x,
                y,
                width,
                height,
                border_width,
                class,
                depth,
                background_pixel: values.get(CW_BACK_PIXEL),
                event_mask: values.get(CW_EVENT_MASK).unwrap_or(0),
            },
        )
        .map_err(|e| e.to_protocol(ErrorCode::Alloc))?;
    if let Some(parent) = server
        .resources
        .get_mut::<WindowRec>(parent, window_type.into())
    {
        parent.children.push(Window(wid));
    }
    Ok(())
}

fn handle_destroy_window(
    server: &mut Server,
    client: ClientId,
    req: &Request,
) -> Result<(), DispatchError> {
    req.expect_len(8)?;
    let wid = XID(req.reader().u32()?);
    server.lookup_window(wid, client, Access::DESTROY)?;
    if wid == server.root_window().id() {
        return Ok(());
    }
    debug!("DestroyWindow: {}", wid);
    let _ = server.resources.delete(wid);
    server.release_dead_selections();
    Ok(())
}

fn handle_destroy_subwindows(
    server: &mut Server,
    client: ClientId,
    req: &Request,
) -> Result<(), DispatchError> {
    req.expect_len(8)?;
    let wid = XID(req.reader().u32()?);
    let children = server.lookup_window(wid, client, Access::REMOVE)?.children.clone();
    for child in children.iter().rev() {
        // children the caller may not destroy stay put
        if server.lookup_window(child.id(), client, Access::DESTROY).is_ok() {
            let _ = server.resources.delete(child.id());
        }
    }
    server.release_dead_selections();
    Ok(())
}

fn handle_create_pixmap(
    server: &mut Server,
    client: ClientId,
    req: &Request,
) -> Result<(), DispatchError> {
    req.expect_len(16)?;
    let depth = req.data;
    let mut reader = req.reader();
    let pid = XID(reader.u32()?);
    let drawable = XID(reader.u32()?);
    let width = reader.u16()?;
    let height = reader.u16()?;

    check_new_id(server, pid, client)?;
    let drawable_class = server.resources.drawable_class();
    server
        .resources
        .lookup_any(drawable, drawable_class.into(), client, Access::GET_ATTR)
        .map_err(|e| e.to_protocol(ErrorCode::Drawable))?;
    if width == 0 || height == 0 {
        return Err(ProtocolError::value(0).into());
    }
    if !SUPPORTED_DEPTHS.contains(&depth) {
        return Err(ProtocolError::value(depth as u32).into());
    }

    debug!("CreatePixmap: {} {}x{} depth {}", pid, width, height, depth);
    let pixmap_type = server.object_types().pixmap;
    server
        .resources
        .add(
            pid,
            pixmap_type,
            Rc::new(PixmapRec {
                width,
                height,
                depth,
            }),
        )
        .map_err(|e| e.to_protocol(ErrorCode::Alloc))?;
    Ok(())
}

fn handle_free_pixmap(
    server: &mut Server,
    client: ClientId,
    req: &Request,
) -> Result<(), DispatchError> {
    req.expect_len(8)?;
    let pid = XID(req.reader().u32()?);
    let pixmap_type = server.object_types().pixmap;
    server
        .resources
        .lookup::<Rc<PixmapRec>>(pid, pixmap_type.into(), client, Access::DESTROY)
        .map_err(|e| e.to_protocol(ErrorCode::Pixmap))?;
    let _ = server.resources.delete(pid);
    Ok(())
}

fn handle_create_gc(
    server: &mut Server,
    client: ClientId,
    req: &Request,
) -> Result<(), DispatchError> {
    req.expect_min_len(16)?;
    let mut reader = req.reader();
    let cid = XID(reader.u32()?);
    let drawable = XID(reader.u32()?);
    let value_mask = reader.u32()?;
    let values = reader.value_list(value_mask, GC_LAST_BIT)?;

    check_new_id(server, cid, client)?;
    let drawable_class = server.resources.drawable_class();
    server
        .resources
        .lookup_any(drawable, drawable_class.into(), client, Access::GET_ATTR)
        .map_err(|e| e.to_protocol(ErrorCode::Drawable))?;
    let depth = drawable_depth(&server.resources, drawable)
        .ok_or_else(|| ProtocolError::new(ErrorCode::Drawable, drawable.get()))?;

    let pixmap_type = server.object_types().pixmap;
    let tile = match values.get(GC_TILE) {
        Some(tile) => {
            let pixmap = server
                .resources
                .lookup::<Rc<PixmapRec>>(XID(tile), pixmap_type.into(), client, Access::READ)
                .map_err(|e| e.to_protocol(ErrorCode::Pixmap))?;
            if pixmap.depth != depth {
                return Err(ProtocolError::bad_match().into());
            }
            Some(pixmap.clone())
        }
        None => None,
    };

    debug!("CreateGC: {} on {} (mask 0x{:x})", cid, drawable, value_mask);
    let gc_type = server.object_types().gc;
    server
        .resources
        .add(
            cid,
            gc_type,
            GcRec {
                depth,
                value_mask,
                foreground: values.get(GC_FOREGROUND).unwrap_or(0),
                background: values.get(GC_BACKGROUND).unwrap_or(1),
                tile,
            },
        )
        .map_err(|e| e.to_protocol(ErrorCode::Alloc))?;
    Ok(())
}

fn handle_free_gc(server: &mut Server, client: ClientId, req: &Request) -> Result<(), DispatchError> {
    req.expect_len(8)?;
    let gc = XID(req.reader().u32()?);
    let gc_type = server.object_types().gc;
    server
        .resources
        .lookup::<GcRec>(gc, gc_type.into(), client, Access::DESTROY)
        .map_err(|e| e.to_protocol(ErrorCode::GContext))?;
    let _ = server.resources.delete(gc);
    Ok(())
}

fn handle_grab_server(
    server: &mut Server,
    client: ClientId,
    req: &Request,
) -> Result<(), DispatchError> {
    req.expect_len(4)?;
    server.grab_server(client);
    Ok(())
}

fn handle_ungrab_server(
    server: &mut Server,
    client: ClientId,
    req: &Request,
) -> Result<(), DispatchError> {
    req.expect_len(4)?;
    if server.scheduler.grabbed_by() == Some(client) {
        server.ungrab_server();
    }
    Ok(())
}

fn handle_get_input_focus(
    server: &mut Server,
    client: ClientId,
    req: &Request,
) -> Result<(), DispatchError> {
    req.expect_len(4)?;
    let Some(order) = server.client(client).map(|c| c.byte_order()) else {
        return Ok(());
    };
    let reply = ProtocolEncoder::new(order).encode_get_input_focus_reply(
        req.wire_sequence(),
        server.root_window(),
        REVERT_TO_POINTER_ROOT,
    );
    server.send(client, &reply);
    Ok(())
}

fn handle_query_extension(
    server: &mut Server,
    client: ClientId,
    req: &Request,
) -> Result<(), DispatchError> {
    req.expect_min_len(8)?;
    let mut reader = req.reader();
    let name_len = reader.u16()? as usize;
    reader.skip(2)?;
    if req.wire_len() != 8 + padded_len(name_len) {
        return Err(ProtocolError::length().into());
    }
    let name = reader.string8(name_len)?;

    let Some(subject) = server.subject(client) else {
        return Ok(());
    };
    let order = server.client_order(client);
    let result = server.extensions.query(&name, &subject);
    debug!("QueryExtension: {:?} -> {:?}", name, result);

    let reply = ProtocolEncoder::new(order).encode_query_extension_reply(
        req.wire_sequence(),
        result.present,
        result.major_opcode,
        result.first_event,
        result.first_error,
    );
    server.send(client, &reply);
    Ok(())
}

fn handle_list_extensions(
    server: &mut Server,
    client: ClientId,
    req: &Request,
) -> Result<(), DispatchError> {
    req.expect_len(4)?;
    let Some(subject) = server.subject(client) else {
        return Ok(());
    };
    let order = server.client_order(client);
    let names = server.extensions.list(&subject);
    debug!("ListExtensions: returning {} extensions", names.len());

    let reply = ProtocolEncoder::new(order).encode_list_extensions_reply(req.wire_sequence(), &names);
    server.send(client, &reply);
    Ok(())
}

fn handle_set_close_down_mode(
    server: &mut Server,
    client: ClientId,
    req: &Request,
) -> Result<(), DispatchError> {
    req.expect_len(4)?;
    let mode = CloseDownMode::from_u8(req.data)
        .ok_or_else(|| ProtocolError::value(req.data as u32))?;
    if let Some(c) = server.client_mut(client) {
        c.close_down_mode = mode;
    }
    debug!("{} close-down mode {:?}", client, mode);
    Ok(())
}

fn handle_kill_client(
    server: &mut Server,
    client: ClientId,
    req: &Request,
) -> Result<(), DispatchError> {
    req.expect_len(8)?;
    let value = req.reader().u32()?;
    if value == ALL_TEMPORARY {
        server.close_down_retained_temporary();
        return Ok(());
    }

    let id = XID(value);
    let target = server.resources.owner_of(id);
    if target.is_server() || server.resources.layout().is_server_id(id) || server.client(target).is_none()
    {
        return Err(ProtocolError::value(value).into());
    }
    match server
        .resources
        .lookup_any(id, Match::Any, client, Access::DESTROY)
    {
        Ok(_) => {}
        Err(ResourceError::AccessDenied(_)) => return Err(ProtocolError::access().into()),
        Err(_) => return Err(ProtocolError::value(value).into()),
    }

    info!("{} killed {} through resource {}", client, target, id);
    server.close_down(target);
    Ok(())
}

impl Server {
    /// Access-checked window lookup reporting `BadWindow`
    pub(crate) fn lookup_window(
        &self,
        id: XID,
        client: ClientId,
        access: Access,
    ) -> Result<&WindowRec, ProtocolError> {
        self.resources
            .lookup::<WindowRec>(id, self.object_types().window.into(), client, access)
            .map_err(|e| e.to_protocol(ErrorCode::Window))
    }

    /// `BadAlloc` once a client owns as many resources as the policy allows
    pub(crate) fn check_quota(&self, client: ClientId) -> Result<(), ProtocolError> {
        let limit = self.config().security.max_resources_per_client;
        if limit > 0 && self.resources.count_client_resources(client) >= limit {
            log::warn!("{} reached its limit of {} resources", client, limit);
            return Err(ProtocolError::alloc());
        }
        Ok(())
    }

    pub(crate) fn subject(&self, client: ClientId) -> Option<AccessSubject> {
        self.client(client).map(|c| AccessSubject {
            client,
            trusted: c.is_trusted(),
        })
    }
}
