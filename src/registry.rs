//! The module registry: a name → module cache with weak ownership.

use crate::Module;
use alloc::{
    boxed::Box,
    string::{String, ToString},
    sync::{Arc, Weak},
};
use core::cell::RefCell;
use hashbrown::HashMap;

/// Maps a dependency name to a loaded module, or `None` when it cannot.
///
/// Implementations must be thread-safe if they are shared across threads;
/// the loader itself calls them from the constructing thread only.
pub trait ModuleResolver {
    fn get_module(&self, name: &str) -> Option<Arc<dyn Module>>;
}

/// The default resolver: it knows nothing.
struct NullResolver;

impl ModuleResolver for NullResolver {
    fn get_module(&self, _name: &str) -> Option<Arc<dyn Module>> {
        None
    }
}

/// Caches loaded modules by name and delegates misses to an upstream
/// resolver.
///
/// The cache holds weak references only: registering a module does not
/// extend its lifetime, and a slot whose module has been dropped reads as
/// empty and is reclaimed on the next access.
///
/// The registry is not internally synchronized; callers serialize writes
/// ([`set_module`](Self::set_module), [`remove_module`](Self::remove_module),
/// [`set_module_resolver`](Self::set_module_resolver)) against concurrent
/// reads.
pub struct ModuleRegistry {
    modules: RefCell<HashMap<String, Weak<dyn Module>>>,
    resolver: RefCell<Box<dyn ModuleResolver>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        ModuleRegistry {
            modules: RefCell::new(HashMap::new()),
            resolver: RefCell::new(Box::new(NullResolver)),
        }
    }

    /// Register `module` under `name`, replacing any previous entry. Only a
    /// weak reference is kept.
    pub fn set_module(&self, name: &str, module: &Arc<dyn Module>) {
        self.modules
            .borrow_mut()
            .insert(name.to_string(), Arc::downgrade(module));
    }

    /// Drop the entry for `name`, if any.
    pub fn remove_module(&self, name: &str) {
        self.modules.borrow_mut().remove(name);
    }

    /// Install the upstream resolver consulted on cache misses. `None`
    /// restores the built-in resolver that always answers `None`.
    pub fn set_module_resolver(&self, resolver: Option<Box<dyn ModuleResolver>>) {
        *self.resolver.borrow_mut() = resolver.unwrap_or_else(|| Box::new(NullResolver));
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleResolver for ModuleRegistry {
    fn get_module(&self, name: &str) -> Option<Arc<dyn Module>> {
        {
            let mut modules = self.modules.borrow_mut();
            if let Some(slot) = modules.get(name) {
                if let Some(module) = slot.upgrade() {
                    return Some(module);
                }
                // The module went away; the slot is stale.
                modules.remove(name);
            }
        }
        self.resolver.borrow().get_module(name)
    }
}
