//! Extensions built into the kernel
//!
//! Both are ordinary [`ExtensionModule`]s: they register through the same
//! public registry as any external extension and are re-run at the start of
//! every server generation.

mod bigreq;
mod xcmisc;

pub use bigreq::BigRequests;
pub use xcmisc::XcMisc;

use super::ExtensionModule;
use std::rc::Rc;

/// Modules every server starts with, in registration order
pub fn builtin_modules() -> Vec<Rc<dyn ExtensionModule>> {
    vec![Rc::new(BigRequests), Rc::new(XcMisc)]
}
