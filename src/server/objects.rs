//! Window, pixmap and graphics context records
//!
//! The kernel keeps only the state its own requests need: the window tree,
//! so destruction cascades through it, and the pixmap a GC tiles with, so a
//! GC may outlive the pixmap it references.

use crate::config::ScreenConfig;
use crate::protocol::{ClientId, Colormap, Window, WindowClass, XID};
use crate::resources::{
    ClassSet, Destructor, Match, ResourceDatabase, ResourceError, ResourceType, TypeFlags,
};
use log::{debug, trace};
use std::any::Any;
use std::rc::Rc;

/// Depths a drawable may have
pub const SUPPORTED_DEPTHS: [u8; 3] = [1, 24, 32];

/// Window metadata kept for the tree
#[derive(Debug, Clone)]
pub struct WindowRec {
    /// `None` only for the root window
    pub parent: Option<Window>,
    /// Stacking order, bottom first
    pub children: Vec<Window>,
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
    pub border_width: u16,
    pub class: WindowClass,
    pub depth: u8,
    pub background_pixel: Option<u32>,
    pub event_mask: u32,
}

/// Pixmap metadata. Stored as `Rc<PixmapRec>` so GCs can share it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixmapRec {
    pub width: u16,
    pub height: u16,
    pub depth: u8,
}

/// Graphics context
#[derive(Debug, Clone)]
pub struct GcRec {
    pub depth: u8,
    pub value_mask: u32,
    pub foreground: u32,
    pub background: u32,
    /// Keeps the tile's contents alive after a FreePixmap
    pub tile: Option<Rc<PixmapRec>>,
}

/// Type tags of the core objects for the current generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectTypes {
    pub window: ResourceType,
    pub pixmap: ResourceType,
    pub gc: ResourceType,
}

/// Server-owned objects created at the start of every generation
#[derive(Debug, Clone, Copy)]
pub struct ServerObjects {
    pub types: ObjectTypes,
    pub root: Window,
    pub default_colormap: Colormap,
}

fn destroy_window(db: &mut ResourceDatabase, id: XID, value: Box<dyn Any>) {
    let Ok(window) = value.downcast::<WindowRec>() else {
        return;
    };
    // top of the stack goes first
    for child in window.children.iter().rev() {
        if db.delete(child.id()).is_ok() {
            trace!("Destroyed subwindow {} of {}", child.id(), id);
        }
    }
    // a parent that is itself being destroyed is no longer reachable here
    if let Some(parent) = window.parent {
        if let Some(parent) = db.get_mut::<WindowRec>(parent.id(), Match::Any) {
            parent.children.retain(|c| c.id() != id);
        }
    }
}

fn destroy_plain(_db: &mut ResourceDatabase, _id: XID, _value: Box<dyn Any>) {}

/// Register the core object types, give the server its resource table and
/// create the root window
pub fn init_server_objects(
    db: &mut ResourceDatabase,
    screen: &ScreenConfig,
) -> Result<ServerObjects, ResourceError> {
    let window_destructor: Rc<dyn Destructor> = Rc::new(destroy_window);
    let plain: Rc<dyn Destructor> = Rc::new(destroy_plain);
    let types = ObjectTypes {
        window: db.register_type("WINDOW", window_destructor, ClassSet::DRAWABLE, TypeFlags::empty())?,
        pixmap: db.register_type("PIXMAP", plain.clone(), ClassSet::DRAWABLE, TypeFlags::empty())?,
        gc: db.register_type("GC", plain, ClassSet::empty(), TypeFlags::empty())?,
    };

    db.init_client(ClientId::SERVER, true)?;
    let root = db.fake_client_id(ClientId::SERVER)?;
    db.add(
        root,
        types.window,
        WindowRec {
            parent: None,
            children: Vec::new(),
            x: 0,
            y: 0,
            width: screen.width,
            height: screen.height,
            border_width: 0,
            class: WindowClass::InputOutput,
            depth: screen.depth,
            background_pixel: Some(0),
            event_mask: 0,
        },
    )?;
    let default_colormap = db.fake_client_id(ClientId::SERVER)?;
    debug!(
        "Root window {} ({}x{}), colormap {}",
        root, screen.width, screen.height, default_colormap
    );

    Ok(ServerObjects {
        types,
        root: Window(root),
        default_colormap: Colormap(default_colormap),
    })
}

/// Depth of a window or pixmap
pub fn drawable_depth(db: &ResourceDatabase, id: XID) -> Option<u8> {
    if let Some(window) = db.get::<WindowRec>(id, Match::Any) {
        return Some(window.depth);
    }
    db.get::<Rc<PixmapRec>>(id, Match::Any).map(|pixmap| pixmap.depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::XidLayout;

    fn setup() -> (ResourceDatabase, ServerObjects) {
        let mut db = ResourceDatabase::new(XidLayout::default());
        let objects = init_server_objects(&mut db, &ScreenConfig::default()).unwrap();
        db.init_client(ClientId(1), true).unwrap();
        (db, objects)
    }

    fn child(db: &mut ResourceDatabase, types: ObjectTypes, id: XID, parent: Window) {
        let rec = WindowRec {
            parent: Some(parent),
            children: Vec::new(),
            x: 0,
            y: 0,
            width: 10,
            height: 10,
            border_width: 0,
            class: WindowClass::InputOutput,
            depth: 24,
            background_pixel: None,
            event_mask: 0,
        };
        db.add(id, types.window, rec).unwrap();
        db.get_mut::<WindowRec>(parent.id(), Match::Any)
            .unwrap()
            .children
            .push(Window(id));
    }

    #[test]
    fn test_destroying_a_window_destroys_its_subtree() {
        let (mut db, objects) = setup();
        let base = db.layout().client_base(ClientId(1));
        let (a, b, c) = (XID(base | 1), XID(base | 2), XID(base | 3));
        child(&mut db, objects.types, a, objects.root);
        child(&mut db, objects.types, b, Window(a));
        child(&mut db, objects.types, c, Window(b));

        db.delete(a).unwrap();
        assert!(!db.is_live(a));
        assert!(!db.is_live(b));
        assert!(!db.is_live(c));
        let root = db.get::<WindowRec>(objects.root.id(), Match::Any).unwrap();
        assert!(root.children.is_empty());
    }

    #[test]
    fn test_gc_keeps_tile_after_free_pixmap() {
        let (mut db, objects) = setup();
        let base = db.layout().client_base(ClientId(1));
        let pixmap = Rc::new(PixmapRec {
            width: 8,
            height: 8,
            depth: 24,
        });
        db.add(XID(base | 1), objects.types.pixmap, pixmap.clone()).unwrap();
        db.add(
            XID(base | 2),
            objects.types.gc,
            GcRec {
                depth: 24,
                value_mask: 1 << 10,
                foreground: 0,
                background: 1,
                tile: Some(pixmap),
            },
        )
        .unwrap();

        db.delete(XID(base | 1)).unwrap();
        let gc = db.get::<GcRec>(XID(base | 2), objects.types.gc.into()).unwrap();
        assert_eq!(gc.tile.as_ref().map(|t| t.depth), Some(24));
        assert_eq!(drawable_depth(&db, objects.root.id()), Some(24));
    }
}
