use memdl::{Module, ModuleRegistry, ModuleResolver};
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

struct NullModule;

impl Module for NullModule {
    fn get_raw_proc(&self, _name: &str) -> Option<NonNull<c_void>> {
        None
    }

    fn get_raw_data(&self, _name: &str) -> Option<NonNull<c_void>> {
        None
    }
}

fn module() -> Arc<dyn Module> {
    Arc::new(NullModule)
}

/// Counts lookups and answers with a configured module.
struct CountingResolver {
    calls: Arc<Cell<usize>>,
    answer: RefCell<Option<Arc<dyn Module>>>,
}

impl CountingResolver {
    fn new(answer: Option<Arc<dyn Module>>) -> (Box<Self>, Arc<Cell<usize>>) {
        let calls = Arc::new(Cell::new(0));
        let resolver = Box::new(CountingResolver {
            calls: calls.clone(),
            answer: RefCell::new(answer),
        });
        (resolver, calls)
    }
}

impl ModuleResolver for CountingResolver {
    fn get_module(&self, _name: &str) -> Option<Arc<dyn Module>> {
        self.calls.set(self.calls.get() + 1);
        self.answer.borrow().clone()
    }
}

#[test]
fn empty_registry_answers_none() {
    let registry = ModuleRegistry::new();
    assert!(registry.get_module("foo").is_none());
}

#[test]
fn misses_fall_through_to_the_resolver() {
    let registry = ModuleRegistry::new();
    let (resolver, calls) = CountingResolver::new(Some(module()));
    registry.set_module_resolver(Some(resolver));
    assert!(registry.get_module("foo").is_some());
    assert_eq!(calls.get(), 1);
}

#[test]
fn registered_modules_are_returned() {
    let registry = ModuleRegistry::new();
    let m = module();
    registry.set_module("foo", &m);
    let found = registry.get_module("foo").unwrap();
    assert!(Arc::ptr_eq(&found, &m));
}

#[test]
fn registration_keeps_only_a_weak_reference() {
    let registry = ModuleRegistry::new();
    let m = module();
    registry.set_module("foo", &m);
    assert_eq!(Arc::strong_count(&m), 1);
}

#[test]
fn dropped_modules_read_as_absent() {
    let registry = ModuleRegistry::new();
    let m = module();
    registry.set_module("foo", &m);
    drop(m);
    assert!(registry.get_module("foo").is_none());
}

#[test]
fn dropped_modules_fall_through_to_the_resolver() {
    let registry = ModuleRegistry::new();
    let (resolver, calls) = CountingResolver::new(None);
    registry.set_module_resolver(Some(resolver));
    let m = module();
    registry.set_module("foo", &m);
    drop(m);
    assert!(registry.get_module("foo").is_none());
    assert_eq!(calls.get(), 1);
}

#[test]
fn registration_replaces_previous_entries() {
    let registry = ModuleRegistry::new();
    let first = module();
    let second = module();
    registry.set_module("foo", &first);
    registry.set_module("foo", &second);
    let found = registry.get_module("foo").unwrap();
    assert!(Arc::ptr_eq(&found, &second));
}

#[test]
fn removal_empties_the_slot() {
    let registry = ModuleRegistry::new();
    let m = module();
    registry.set_module("foo", &m);
    registry.remove_module("foo");
    assert!(registry.get_module("foo").is_none());
}

#[test]
fn clearing_the_resolver_restores_the_null_default() {
    let registry = ModuleRegistry::new();
    let (resolver, calls) = CountingResolver::new(Some(module()));
    registry.set_module_resolver(Some(resolver));
    registry.set_module_resolver(None);
    assert!(registry.get_module("foo").is_none());
    assert_eq!(calls.get(), 0);
}
