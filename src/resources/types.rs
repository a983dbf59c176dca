//! Resource type and class registry
//!
//! Types are allocated per server generation. A tag remembers the generation
//! it was issued in, so a tag that outlived a reset is recognised as stale
//! instead of aliasing whatever type now sits at the same index.

use super::{ResourceDatabase, ResourceError};
use crate::protocol::XID;
use bitflags::bitflags;
use std::any::Any;
use std::fmt;
use std::rc::Rc;

/// Upper bound on types registered in one generation
pub const MAX_TYPES: usize = 1024;

bitflags! {
    /// Class memberships of a resource type
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClassSet: u32 {
        const DRAWABLE = 1 << 0;
    }
}

bitflags! {
    /// Behavioural flags of a resource type
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeFlags: u8 {
        /// Freed when the owning client enters the retained state
        const NEVER_RETAIN = 1 << 0;
    }
}

/// Called exactly once when a resource of the type is deleted.
///
/// The payload has already been detached from the database, and the ID
/// stays reserved until the destructor returns, so the destructor may delete
/// other resources (including ones that point back at this one).
pub trait Destructor {
    fn destroy(&self, db: &mut ResourceDatabase, id: XID, value: Box<dyn Any>);
}

impl<F> Destructor for F
where
    F: Fn(&mut ResourceDatabase, XID, Box<dyn Any>),
{
    fn destroy(&self, db: &mut ResourceDatabase, id: XID, value: Box<dyn Any>) {
        self(db, id, value)
    }
}

/// A registered resource type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceType {
    index: u16,
    generation: u32,
}

impl ResourceType {
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// A registered type class: matches every type that is a member of it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeClass {
    set: ClassSet,
    generation: u32,
}

impl TypeClass {
    pub fn set(&self) -> ClassSet {
        self.set
    }
}

/// What a lookup accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    Type(ResourceType),
    Class(TypeClass),
    Any,
}

impl From<ResourceType> for Match {
    fn from(rtype: ResourceType) -> Self {
        Match::Type(rtype)
    }
}

impl From<TypeClass> for Match {
    fn from(class: TypeClass) -> Self {
        Match::Class(class)
    }
}

/// Everything registered about a type
#[derive(Clone)]
pub struct TypeInfo {
    pub name: String,
    pub classes: ClassSet,
    pub flags: TypeFlags,
    destructor: Rc<dyn Destructor>,
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("name", &self.name)
            .field("classes", &self.classes)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// Per-generation table of types and class bits
#[derive(Debug)]
pub struct TypeRegistry {
    generation: u32,
    types: Vec<TypeInfo>,
    classes: ClassSet,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry {
            generation: 1,
            types: Vec::new(),
            classes: ClassSet::DRAWABLE,
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Register a type; `classes` must have been handed out this generation
    pub fn register(
        &mut self,
        name: &str,
        destructor: Rc<dyn Destructor>,
        classes: ClassSet,
        flags: TypeFlags,
    ) -> Result<ResourceType, ResourceError> {
        if self.types.len() >= MAX_TYPES {
            return Err(ResourceError::TypesExhausted);
        }
        if !self.classes.contains(classes) {
            return Err(ResourceError::StaleType);
        }
        let index = self.types.len() as u16;
        self.types.push(TypeInfo {
            name: name.to_string(),
            classes,
            flags,
            destructor,
        });
        Ok(ResourceType {
            index,
            generation: self.generation,
        })
    }

    /// Allocate a fresh class bit
    pub fn register_class(&mut self) -> Result<TypeClass, ResourceError> {
        let free = !self.classes.bits();
        if free == 0 {
            return Err(ResourceError::TypesExhausted);
        }
        let bit = ClassSet::from_bits_retain(1 << free.trailing_zeros());
        self.classes |= bit;
        Ok(TypeClass {
            set: bit,
            generation: self.generation,
        })
    }

    /// The predefined class of everything that can be drawn on
    pub fn drawable(&self) -> TypeClass {
        TypeClass {
            set: ClassSet::DRAWABLE,
            generation: self.generation,
        }
    }

    /// Metadata of a type issued in the current generation
    pub fn info(&self, rtype: ResourceType) -> Option<&TypeInfo> {
        if rtype.generation != self.generation {
            return None;
        }
        self.types.get(rtype.index as usize)
    }

    pub(crate) fn destructor(&self, rtype: ResourceType) -> Option<Rc<dyn Destructor>> {
        self.info(rtype).map(|info| info.destructor.clone())
    }

    /// Whether a resource bound with `rtype` satisfies `m`
    pub fn matches(&self, rtype: ResourceType, m: Match) -> bool {
        match m {
            Match::Any => true,
            Match::Type(wanted) => wanted == rtype && wanted.generation == self.generation,
            Match::Class(class) => {
                class.generation == self.generation
                    && self
                        .info(rtype)
                        .is_some_and(|info| info.classes.intersects(class.set))
            }
        }
    }

    /// Drop every type and class and start the next generation
    pub fn reset(&mut self) {
        self.types.clear();
        self.classes = ClassSet::DRAWABLE;
        self.generation = self.generation.wrapping_add(1);
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Rc<dyn Destructor> {
        Rc::new(|_: &mut ResourceDatabase, _: XID, _: Box<dyn Any>| {})
    }

    #[test]
    fn test_stale_tags_do_not_match() {
        let mut registry = TypeRegistry::new();
        let old = registry
            .register("WINDOW", noop(), ClassSet::DRAWABLE, TypeFlags::empty())
            .unwrap();
        assert!(registry.matches(old, Match::Type(old)));
        assert!(registry.matches(old, registry.drawable().into()));

        registry.reset();
        let new = registry
            .register("WINDOW", noop(), ClassSet::DRAWABLE, TypeFlags::empty())
            .unwrap();
        assert_ne!(old, new);
        assert!(registry.info(old).is_none());
        assert!(!registry.matches(new, Match::Type(old)));
    }

    #[test]
    fn test_class_bits_run_out() {
        let mut registry = TypeRegistry::new();
        let mut seen = ClassSet::DRAWABLE;
        for _ in 0..31 {
            let class = registry.register_class().unwrap();
            assert!(!seen.intersects(class.set()));
            seen |= class.set();
        }
        assert!(matches!(
            registry.register_class(),
            Err(ResourceError::TypesExhausted)
        ));
    }

    #[test]
    fn test_type_space_is_bounded() {
        let mut registry = TypeRegistry::new();
        for i in 0..MAX_TYPES {
            registry
                .register(&format!("T{}", i), noop(), ClassSet::empty(), TypeFlags::empty())
                .unwrap();
        }
        assert!(matches!(
            registry.register("ONE-MORE", noop(), ClassSet::empty(), TypeFlags::empty()),
            Err(ResourceError::TypesExhausted)
        ));
    }
}
